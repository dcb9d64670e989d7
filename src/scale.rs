//! Physical (y-axis) range model and display lane layout.
//!
//! Each channel carries a [`ScaleState`]: FIXED ranges come from the caller,
//! EMPIRICAL ranges are fitted once to the whole channel and FREE ranges are
//! fitted to the samples of the current window. Fitted ranges use trimmed
//! percentiles so a single artifact cannot dominate the display.

use crate::config::LayoutConfig;
use crate::error::{Result, SegsrvError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScaleMode {
    Fixed { min: f64, max: f64 },
    Empirical,
    Free,
}

impl Default for ScaleMode {
    fn default() -> Self {
        ScaleMode::Empirical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysRange {
    pub min: f64,
    pub max: f64,
}

impl PhysRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Position of `value` inside the range, clamped to `[0, 1]`
    pub fn normalize(&self, value: f64) -> f64 {
        ((value - self.min) / self.span()).clamp(0.0, 1.0)
    }
}

/// Per-channel scale mode plus cached fitted ranges
#[derive(Debug, Default)]
pub struct ScaleState {
    mode: ScaleMode,
    empirical: RwLock<Option<PhysRange>>,
    /// Keyed by the window version it was fitted for
    free: RwLock<Option<(u64, PhysRange)>>,
}

impl ScaleState {
    pub fn mode(&self) -> ScaleMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ScaleMode) -> Result<()> {
        if let ScaleMode::Fixed { min, max } = mode {
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(SegsrvError::Configuration(format!(
                    "fixed scale needs min < max, got [{}, {}]",
                    min, max
                )));
            }
        }
        if self.mode == ScaleMode::Free || mode == ScaleMode::Free {
            *self.free.write() = None;
        }
        self.mode = mode;
        Ok(())
    }

    pub(crate) fn invalidate_data(&mut self) {
        *self.empirical.write() = None;
        *self.free.write() = None;
    }

    /// Range under the current mode.
    ///
    /// `all_samples` and `window_samples` are only evaluated when a cached
    /// range cannot be reused.
    pub fn resolve<'a>(
        &self,
        window_version: u64,
        percentile: f64,
        all_samples: impl FnOnce() -> &'a [f64],
        window_samples: impl FnOnce() -> Vec<f64>,
    ) -> Option<PhysRange> {
        match self.mode {
            ScaleMode::Fixed { min, max } => Some(PhysRange::new(min, max)),
            ScaleMode::Empirical => {
                if let Some(range) = *self.empirical.read() {
                    return Some(range);
                }
                let range = robust_range(all_samples(), percentile)?;
                log::debug!(
                    "[SEGSRV] empirical range fitted: [{:.3}, {:.3}]",
                    range.min,
                    range.max
                );
                *self.empirical.write() = Some(range);
                Some(range)
            }
            ScaleMode::Free => {
                if let Some((version, range)) = *self.free.read() {
                    if version == window_version {
                        return Some(range);
                    }
                }
                let range = robust_range(&window_samples(), percentile)?;
                *self.free.write() = Some((window_version, range));
                Some(range)
            }
        }
    }
}

/// Trimmed `[percentile, 1 - percentile]` range of the finite values.
///
/// A percentile of zero gives the exact min/max. Flat data is widened by one
/// unit either side.
pub fn robust_range(values: &[f64], percentile: f64) -> Option<PhysRange> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }

    let (min, max) = if percentile <= 0.0 {
        finite
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    } else {
        let last = (finite.len() - 1) as f64;
        let lo_idx = (percentile * last).floor() as usize;
        let hi_idx = ((1.0 - percentile) * last).ceil() as usize;
        let (_, &mut hi, _) = finite.select_nth_unstable_by(hi_idx, f64::total_cmp);
        let (_, &mut lo, _) = finite[..=hi_idx].select_nth_unstable_by(lo_idx, f64::total_cmp);
        (lo, hi)
    };

    if max - min < f64::EPSILON {
        Some(PhysRange::new(min - 1.0, max + 1.0))
    } else {
        Some(PhysRange::new(min, max))
    }
}

/// Vertical band of the display
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    pub bottom: f64,
    pub top: f64,
}

impl Lane {
    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn centre(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }
}

/// Channel lanes stacked below the header, annotation rows along the bottom
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayLayout {
    channel_lanes: Vec<Lane>,
    annot_rows: Vec<Lane>,
    yscale: f64,
}

impl DisplayLayout {
    pub fn new(n_channels: usize, n_annot_rows: usize, config: &LayoutConfig) -> Result<Self> {
        config.validate()?;

        let band_top = n_annot_rows as f64 * config.annot_row_height;
        let area_top = 1.0 - config.header;
        if n_channels > 0 && band_top >= area_top {
            return Err(SegsrvError::Configuration(format!(
                "{} annotation rows leave no room for {} channels",
                n_annot_rows, n_channels
            )));
        }

        let lane_height = if n_channels > 0 {
            (area_top - band_top) / n_channels as f64
        } else {
            0.0
        };
        let channel_lanes = (0..n_channels)
            .map(|i| {
                let top = area_top - i as f64 * lane_height;
                Lane {
                    bottom: top - lane_height,
                    top,
                }
            })
            .collect();

        // row 0 sits directly under the lowest channel lane
        let annot_rows = (0..n_annot_rows)
            .map(|k| {
                let top = band_top - k as f64 * config.annot_row_height;
                Lane {
                    bottom: top - config.annot_row_height,
                    top,
                }
            })
            .collect();

        Ok(Self {
            channel_lanes,
            annot_rows,
            yscale: config.yscale,
        })
    }

    pub fn channel_lane(&self, index: usize) -> Option<Lane> {
        self.channel_lanes.get(index).copied()
    }

    pub fn annot_row(&self, index: usize) -> Option<Lane> {
        self.annot_rows.get(index).copied()
    }

    pub fn n_annot_rows(&self) -> usize {
        self.annot_rows.len()
    }

    /// Map a physical value into `lane`
    pub fn project(&self, lane: Lane, range: PhysRange, value: f64) -> f64 {
        if !value.is_finite() {
            return f64::NAN;
        }
        lane.centre() + (range.normalize(value) - 0.5) * lane.height() * self.yscale
    }
}
