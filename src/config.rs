// Configuration for a segment server instance
//
// Every knob has a default so callers can start from `ServerConfig::default()`
// and override only what they need, or load a JSON document.

use crate::error::{Result, SegsrvError};
use serde::{Deserialize, Serialize};

/// A named frequency band, half-open `[low_hz, high_hz)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandDefinition {
    pub name: String,
    pub low_hz: f64,
    pub high_hz: f64,
}

impl BandDefinition {
    pub fn new(name: impl Into<String>, low_hz: f64, high_hz: f64) -> Self {
        Self {
            name: name.into(),
            low_hz,
            high_hz,
        }
    }

    /// Standard sleep EEG bands
    pub fn standard_set() -> Vec<BandDefinition> {
        vec![
            Self::new("SLOW", 0.5, 1.0),
            Self::new("DELTA", 1.0, 4.0),
            Self::new("THETA", 4.0, 8.0),
            Self::new("ALPHA", 8.0, 11.0),
            Self::new("SIGMA", 11.0, 15.0),
            Self::new("BETA", 15.0, 30.0),
            Self::new("GAMMA", 30.0, 50.0),
        ]
    }
}

/// Vertical layout of the display area, in normalized units (0 = bottom, 1 = top)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Fraction reserved at the top of the plot
    pub header: f64,
    /// Height of one annotation row in the band at the bottom of the plot
    pub annot_row_height: f64,
    /// Amplitude zoom applied around each channel lane centre
    pub yscale: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            header: 0.05,
            annot_row_height: 0.025,
            yscale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Epoch length used for features and summaries (seconds)
    pub epoch_size_secs: f64,

    /// Windows longer than this are served as epoch summaries
    pub summary_threshold_mins: f64,

    /// Maximum raw samples returned per channel
    pub raw_sample_cap: Option<usize>,

    /// Maximum in-window samples (all channels) scanned for a raw response
    pub input_sample_cap: Option<usize>,

    /// Fraction trimmed from each tail when fitting empirical/free ranges
    pub robust_percentile: f64,

    /// Welch segment length (seconds) for band power
    pub welch_segment_secs: f64,

    /// Fewer samples than this in an epoch gives NaN band power
    pub min_spectral_samples: usize,

    pub bands: Vec<BandDefinition>,

    pub layout: LayoutConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            epoch_size_secs: 30.0,
            summary_threshold_mins: 30.0,
            raw_sample_cap: Some(2_000_000),
            input_sample_cap: None,
            robust_percentile: 0.01,
            welch_segment_secs: 4.0,
            min_spectral_samples: 32,
            bands: BandDefinition::standard_set(),
            layout: LayoutConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.epoch_size_secs.is_finite() && self.epoch_size_secs > 0.0) {
            return Err(SegsrvError::Configuration(format!(
                "epoch size must be positive, got {}",
                self.epoch_size_secs
            )));
        }
        if !(self.summary_threshold_mins.is_finite() && self.summary_threshold_mins > 0.0) {
            return Err(SegsrvError::Configuration(format!(
                "summary threshold must be positive, got {} mins",
                self.summary_threshold_mins
            )));
        }
        if self.raw_sample_cap == Some(0) || self.input_sample_cap == Some(0) {
            return Err(SegsrvError::Configuration(
                "sample caps must be greater than zero".to_string(),
            ));
        }
        if !(0.0..0.5).contains(&self.robust_percentile) {
            return Err(SegsrvError::Configuration(format!(
                "robust percentile must be in [0, 0.5), got {}",
                self.robust_percentile
            )));
        }
        if !(self.welch_segment_secs.is_finite() && self.welch_segment_secs > 0.0) {
            return Err(SegsrvError::Configuration(format!(
                "Welch segment length must be positive, got {}",
                self.welch_segment_secs
            )));
        }
        for band in &self.bands {
            if !(band.low_hz >= 0.0 && band.low_hz < band.high_hz) {
                return Err(SegsrvError::Configuration(format!(
                    "band {} has invalid range [{}, {})",
                    band.name, band.low_hz, band.high_hz
                )));
            }
        }
        self.layout.validate()
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.header) {
            return Err(SegsrvError::Configuration(format!(
                "layout header must be in [0, 1), got {}",
                self.header
            )));
        }
        if !(self.annot_row_height >= 0.0 && self.annot_row_height < 1.0) {
            return Err(SegsrvError::Configuration(format!(
                "annotation row height must be in [0, 1), got {}",
                self.annot_row_height
            )));
        }
        if !(self.yscale.is_finite() && self.yscale > 0.0) {
            return Err(SegsrvError::Configuration(format!(
                "yscale must be positive, got {}",
                self.yscale
            )));
        }
        Ok(())
    }
}
