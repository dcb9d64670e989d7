// Resident sample store for one channel
//
// Samples are kept in the record domain (gaps excluded), one per sampling
// tick, so an elapsed-time window resolves to a handful of index ranges.

use crate::error::{Result, SegsrvError};
use crate::scale::ScaleState;
use crate::timeline::SampleSpan;

#[derive(Debug)]
pub struct ChannelBuffer {
    label: String,
    sample_rate: f64,
    samples: Vec<f64>,
    physical_min: f64,
    physical_max: f64,
    unit: String,
    /// Bumped whenever the samples are replaced
    version: u64,
    pub(crate) scale: ScaleState,
}

impl ChannelBuffer {
    /// `expected_len` is the sample count implied by the recording's duration
    pub fn new(
        label: impl Into<String>,
        sample_rate: f64,
        samples: Vec<f64>,
        expected_len: usize,
    ) -> Result<Self> {
        let label = label.into();
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(SegsrvError::Recording(format!(
                "channel {} has invalid sampling rate {}",
                label, sample_rate
            )));
        }
        if samples.len() != expected_len {
            return Err(SegsrvError::Recording(format!(
                "channel {} has {} samples, expected {} ({} Hz)",
                label,
                samples.len(),
                expected_len,
                sample_rate
            )));
        }

        Ok(Self {
            label,
            sample_rate,
            samples,
            physical_min: f64::NEG_INFINITY,
            physical_max: f64::INFINITY,
            unit: String::new(),
            version: 0,
            scale: ScaleState::default(),
        })
    }

    /// Declared physical range (e.g. from an EDF signal header) and unit
    pub fn with_physical_range(mut self, min: f64, max: f64, unit: impl Into<String>) -> Self {
        self.physical_min = min;
        self.physical_max = max;
        self.unit = unit.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn declared_range(&self) -> (f64, f64) {
        (self.physical_min, self.physical_max)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the samples, keeping sampling rate and duration
    pub fn replace_samples(&mut self, samples: Vec<f64>) -> Result<()> {
        if samples.len() != self.samples.len() {
            return Err(SegsrvError::Recording(format!(
                "update of {} has {} samples, expected {}",
                self.label,
                samples.len(),
                self.samples.len()
            )));
        }
        self.samples = samples;
        self.version += 1;
        self.scale.invalidate_data();
        Ok(())
    }

    /// True if the sample sits at or beyond the declared physical range
    pub fn is_clipped(&self, value: f64) -> bool {
        self.physical_max > self.physical_min
            && (value <= self.physical_min || value >= self.physical_max)
    }

    /// Samples covered by `spans`, concatenated
    pub fn gather(&self, spans: &[SampleSpan]) -> Vec<f64> {
        let total: usize = spans.iter().map(|s| s.len).sum();
        let mut out = Vec::with_capacity(total);
        for span in spans {
            if let Some(slice) = self.samples.get(span.range()) {
                out.extend_from_slice(slice);
            }
        }
        out
    }

    /// Elapsed time of every sample covered by `spans`
    pub fn time_track(&self, spans: &[SampleSpan]) -> Vec<f64> {
        let dt = 1.0 / self.sample_rate;
        spans
            .iter()
            .flat_map(|span| (0..span.len).map(move |i| span.elapsed_start + i as f64 * dt))
            .collect()
    }
}
