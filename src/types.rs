use crate::features::ChannelSummary;
use crate::throttle::Resolution;
use crate::window::Window;
use serde::{Deserialize, Serialize};

/// Which channels to serve, and whether to map them into display lanes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// `None` serves every loaded channel
    pub channels: Option<Vec<String>>,
    pub scaled: bool,
}

impl SignalRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn scaled(mut self, scaled: bool) -> Self {
        self.scaled = scaled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Bands,
    Hjorth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub kind: FeatureKind,
    pub channels: Option<Vec<String>>,
}

impl FeatureRequest {
    pub fn bands() -> Self {
        Self {
            kind: FeatureKind::Bands,
            channels: None,
        }
    }

    pub fn hjorths() -> Self {
        Self {
            kind: FeatureKind::Hjorth,
            channels: None,
        }
    }

    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelSignal {
    Raw {
        label: String,
        time: Vec<f64>,
        values: Vec<f64>,
    },
    Summarized(ChannelSummary),
}

impl ChannelSignal {
    pub fn label(&self) -> &str {
        match self {
            ChannelSignal::Raw { label, .. } => label,
            ChannelSignal::Summarized(summary) => &summary.channel,
        }
    }

    /// Raw sample count, or 0 for a summary
    pub fn raw_len(&self) -> usize {
        match self {
            ChannelSignal::Raw { values, .. } => values.len(),
            ChannelSignal::Summarized(_) => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResponse {
    pub resolution: Resolution,
    pub window: Window,
    pub scaled: bool,
    pub channels: Vec<ChannelSignal>,
}

impl SignalResponse {
    pub fn is_summarized(&self) -> bool {
        !self.resolution.is_raw()
    }

    pub fn channel(&self, label: &str) -> Option<&ChannelSignal> {
        self.channels.iter().find(|c| c.label() == label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedChannel {
    pub label: String,
    pub reason: String,
}

/// Outcome of `populate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulateReport {
    pub id: String,
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedChannel>,
    pub annotation_classes: Vec<String>,
    pub total_duration_elapsed: f64,
    pub total_duration_original: f64,
    pub created_at: String,
}
