// Annotation layout for the current window
//
// Intervals intersecting the window are clipped to its edges, bucketed by
// class and given one display row per class. Two encodings are offered for
// transfer: paired coordinate arrays per class, or flat 6-field records.

use crate::scale::DisplayLayout;
use crate::window::Window;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Set when the interval started before the window
pub const FLAG_CLIPPED_LEFT: u8 = 1;
/// Set when the interval ended after the window
pub const FLAG_CLIPPED_RIGHT: u8 = 2;

/// Number of fields in one format-6 record
pub const FORMAT6_WIDTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationInstance {
    pub start: f64,
    pub stop: f64,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl AnnotationInstance {
    pub fn new(start: f64, stop: f64) -> Self {
        Self {
            start,
            stop,
            channel: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Numeric `value` metadata, NaN when absent or not a number
    pub fn value(&self) -> f64 {
        self.meta
            .get("value")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(f64::NAN)
    }

    fn intersects(&self, left: f64, right: f64) -> bool {
        if self.stop <= self.start {
            // zero-length marker
            self.start >= left && self.start < right
        } else {
            self.start < right && self.stop > left
        }
    }
}

/// All instances of one annotation class, ordered by start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub class: String,
    pub instances: Vec<AnnotationInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledEvent {
    pub start: f64,
    pub end: f64,
    pub flags: u8,
    pub channel: Option<String>,
    pub value: f64,
    pub meta: BTreeMap<String, String>,
}

impl CompiledEvent {
    pub fn clipped_left(&self) -> bool {
        self.flags & FLAG_CLIPPED_LEFT != 0
    }

    pub fn clipped_right(&self) -> bool {
        self.flags & FLAG_CLIPPED_RIGHT != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledClass {
    pub class: String,
    pub row: usize,
    pub events: Vec<CompiledEvent>,
}

/// Flat event listing, as returned by the fetch operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub class: String,
    pub start: f64,
    pub stop: f64,
    pub channel: Option<String>,
    pub meta: BTreeMap<String, String>,
}

/// Coordinates of one class, one entry per event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedClass {
    pub class: String,
    pub x: Vec<f64>,
    pub x_ends: Vec<f64>,
    pub y: Vec<f64>,
    pub y_ends: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "snake_case")]
pub enum EncodedEvents {
    Paired(Vec<PairedClass>),
    /// `(class id, start, end, row, value, flag)` records laid end to end
    Format6(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledEvents {
    pub window: Window,
    /// Window version the events were compiled against
    pub window_version: u64,
    classes: Vec<CompiledClass>,
}

impl CompiledEvents {
    /// Rows follow the order of `classes`; classes absent from `annotations`
    /// still get a (empty) row so rows stay stable while the window moves.
    pub fn compile(
        annotations: &[Annotation],
        classes: &[String],
        window: Window,
        window_version: u64,
    ) -> Self {
        let compiled = classes
            .iter()
            .enumerate()
            .map(|(row, class)| {
                let mut events: Vec<CompiledEvent> = annotations
                    .iter()
                    .filter(|a| &a.class == class)
                    .flat_map(|a| a.instances.iter())
                    .filter(|inst| inst.intersects(window.left, window.right))
                    .map(|inst| clip(inst, &window))
                    .collect();
                events.sort_by(|a, b| a.start.total_cmp(&b.start));
                CompiledClass {
                    class: class.clone(),
                    row,
                    events,
                }
            })
            .collect();

        Self {
            window,
            window_version,
            classes: compiled,
        }
    }

    pub fn classes(&self) -> &[CompiledClass] {
        &self.classes
    }

    pub fn n_rows(&self) -> usize {
        self.classes.len()
    }

    pub fn class(&self, name: &str) -> Option<&CompiledClass> {
        self.classes.iter().find(|c| c.class == name)
    }

    pub fn event_count(&self) -> usize {
        self.classes.iter().map(|c| c.events.len()).sum()
    }

    pub fn xaxes(class: &CompiledClass) -> Vec<f64> {
        class.events.iter().map(|e| e.start).collect()
    }

    pub fn xaxes_ends(class: &CompiledClass) -> Vec<f64> {
        class.events.iter().map(|e| e.end).collect()
    }

    /// Bottom of the class row, repeated per event
    pub fn yaxes(class: &CompiledClass, layout: &DisplayLayout) -> Vec<f64> {
        let y = layout.annot_row(class.row).map(|l| l.bottom).unwrap_or(f64::NAN);
        vec![y; class.events.len()]
    }

    /// Top of the class row, repeated per event
    pub fn yaxes_ends(class: &CompiledClass, layout: &DisplayLayout) -> Vec<f64> {
        let y = layout.annot_row(class.row).map(|l| l.top).unwrap_or(f64::NAN);
        vec![y; class.events.len()]
    }

    pub fn paired(&self, layout: &DisplayLayout) -> Vec<PairedClass> {
        self.classes
            .iter()
            .map(|c| PairedClass {
                class: c.class.clone(),
                x: Self::xaxes(c),
                x_ends: Self::xaxes_ends(c),
                y: Self::yaxes(c, layout),
                y_ends: Self::yaxes_ends(c, layout),
            })
            .collect()
    }

    /// Class id is the index of the class in the compiled list
    pub fn format6(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.event_count() * FORMAT6_WIDTH);
        for (id, class) in self.classes.iter().enumerate() {
            for e in &class.events {
                out.extend_from_slice(&[
                    id as f64,
                    e.start,
                    e.end,
                    class.row as f64,
                    e.value,
                    e.flags as f64,
                ]);
            }
        }
        out
    }

    pub fn records(&self) -> Vec<EventRecord> {
        let mut records: Vec<EventRecord> = self
            .classes
            .iter()
            .flat_map(|c| {
                c.events.iter().map(move |e| EventRecord {
                    class: c.class.clone(),
                    start: e.start,
                    stop: e.end,
                    channel: e.channel.clone(),
                    meta: e.meta.clone(),
                })
            })
            .collect();
        records.sort_by(|a, b| a.start.total_cmp(&b.start));
        records
    }
}

fn clip(inst: &AnnotationInstance, window: &Window) -> CompiledEvent {
    let mut flags = 0;
    if inst.start < window.left {
        flags |= FLAG_CLIPPED_LEFT;
    }
    if inst.stop > window.right {
        flags |= FLAG_CLIPPED_RIGHT;
    }
    CompiledEvent {
        start: inst.start.max(window.left),
        end: inst.stop.min(window.right).max(inst.start.max(window.left)),
        flags,
        channel: inst.channel.clone(),
        value: inst.value(),
        meta: inst.meta.clone(),
    }
}

/// Unclipped listing of every instance of `annotations`, ordered by start
pub fn all_records(annotations: &[Annotation]) -> Vec<EventRecord> {
    let mut records: Vec<EventRecord> = annotations
        .iter()
        .flat_map(|a| {
            a.instances.iter().map(move |inst| EventRecord {
                class: a.class.clone(),
                start: inst.start,
                stop: inst.stop,
                channel: inst.channel.clone(),
                meta: inst.meta.clone(),
            })
        })
        .collect();
    records.sort_by(|a, b| a.start.total_cmp(&b.start));
    records
}
