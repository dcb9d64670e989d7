// Current query region, expressed in elapsed time
//
// A window is clamped to the recording and resolved once per change into
// per-channel sample spans; every signal/feature read works off those spans.

use crate::channel::ChannelBuffer;
use crate::timeline::{SampleSpan, Timeline, TIME_EPS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub left: f64,
    pub right: f64,
    /// The requested bounds fell outside the recording and were clamped
    pub clamped: bool,
}

impl Window {
    /// Clamp `[left, right)` to `[0, total]`; `None` if nothing is left
    pub fn clamp(left: f64, right: f64, total: f64) -> Option<Self> {
        if left.is_nan() || right.is_nan() {
            return None;
        }
        let l = left.max(0.0);
        let r = right.min(total);
        if r - l <= TIME_EPS {
            return None;
        }
        Some(Self {
            left: l,
            right: r,
            clamped: l != left || r != right,
        })
    }

    pub fn duration(&self) -> f64 {
        self.right - self.left
    }
}

/// Outcome of the last `set_window`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    /// No window has been requested since population
    Unset,
    Valid,
    /// Empty after clamping (left >= right)
    Empty,
    /// Lies entirely inside a gap: no channel has samples there
    NoData,
}

/// A validated window plus its per-channel sample spans
#[derive(Debug, Clone)]
pub struct ActiveWindow {
    pub window: Window,
    spans: Vec<Vec<SampleSpan>>,
}

impl ActiveWindow {
    pub fn resolve(window: Window, timeline: &Timeline, channels: &[ChannelBuffer]) -> Self {
        let spans = channels
            .iter()
            .map(|ch| timeline.sample_spans(window.left, window.right, ch.sample_rate()))
            .collect();
        Self { window, spans }
    }

    pub fn spans(&self, channel: usize) -> &[SampleSpan] {
        self.spans.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn sample_count(&self, channel: usize) -> usize {
        self.spans(channel).iter().map(|s| s.len).sum()
    }

    pub fn sample_counts(&self) -> Vec<usize> {
        (0..self.spans.len()).map(|i| self.sample_count(i)).collect()
    }

    pub fn has_data(&self) -> bool {
        self.spans.iter().any(|s| !s.is_empty())
    }
}
