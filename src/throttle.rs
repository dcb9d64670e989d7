// Resolution policy: raw samples or per-epoch summaries
//
// Raw volume grows with window width x channels x sampling rate, summaries
// only with window width / epoch size, so wide windows switch to summaries.

use crate::config::ServerConfig;
use crate::error::{Result, SegsrvError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SummaryReason {
    WindowTooLong { window_secs: f64, threshold_secs: f64 },
    SampleCapExceeded { projected: usize, cap: usize },
    InputCapExceeded { projected: usize, cap: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Resolution {
    Raw,
    Summarized(SummaryReason),
}

impl Resolution {
    pub fn is_raw(&self) -> bool {
        matches!(self, Resolution::Raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPolicy {
    summary_threshold_secs: f64,
    raw_sample_cap: Option<usize>,
    input_sample_cap: Option<usize>,
}

impl ResolutionPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            summary_threshold_secs: config.summary_threshold_mins * 60.0,
            raw_sample_cap: config.raw_sample_cap,
            input_sample_cap: config.input_sample_cap,
        }
    }

    /// Per-channel cap on returned raw samples
    pub fn set_raw_sample_cap(&mut self, cap: usize) -> Result<()> {
        if cap == 0 {
            return Err(SegsrvError::Configuration(
                "raw sample cap must be greater than zero".to_string(),
            ));
        }
        self.raw_sample_cap = Some(cap);
        Ok(())
    }

    /// Cap on in-window samples summed over all channels
    pub fn set_input_sample_cap(&mut self, cap: usize) -> Result<()> {
        if cap == 0 {
            return Err(SegsrvError::Configuration(
                "input sample cap must be greater than zero".to_string(),
            ));
        }
        self.input_sample_cap = Some(cap);
        Ok(())
    }

    pub fn set_summary_threshold_mins(&mut self, minutes: f64) -> Result<()> {
        if !(minutes.is_finite() && minutes > 0.0) {
            return Err(SegsrvError::Configuration(format!(
                "summary threshold must be positive, got {} mins",
                minutes
            )));
        }
        self.summary_threshold_secs = minutes * 60.0;
        Ok(())
    }

    pub fn summary_threshold_secs(&self) -> f64 {
        self.summary_threshold_secs
    }

    pub fn raw_sample_cap(&self) -> Option<usize> {
        self.raw_sample_cap
    }

    pub fn input_sample_cap(&self) -> Option<usize> {
        self.input_sample_cap
    }

    /// `projected` holds the in-window sample count of each channel served
    pub fn decide(&self, window_secs: f64, projected: &[usize]) -> Resolution {
        if window_secs > self.summary_threshold_secs {
            return Resolution::Summarized(SummaryReason::WindowTooLong {
                window_secs,
                threshold_secs: self.summary_threshold_secs,
            });
        }

        if let Some(cap) = self.raw_sample_cap {
            let largest = projected.iter().copied().max().unwrap_or(0);
            if largest > cap {
                return Resolution::Summarized(SummaryReason::SampleCapExceeded {
                    projected: largest,
                    cap,
                });
            }
        }

        if let Some(cap) = self.input_sample_cap {
            let total: usize = projected.iter().sum();
            if total > cap {
                return Resolution::Summarized(SummaryReason::InputCapExceeded {
                    projected: total,
                    cap,
                });
            }
        }

        Resolution::Raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ResolutionPolicy {
        ResolutionPolicy::from_config(&ServerConfig::default())
    }

    #[test]
    fn test_short_window_serves_raw() {
        assert_eq!(policy().decide(60.0, &[6000, 12000]), Resolution::Raw);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut p = policy();
        p.set_summary_threshold_mins(5.0).unwrap();
        assert!(p.decide(300.0, &[30_000]).is_raw());
        assert!(!p.decide(300.5, &[30_050]).is_raw());
    }

    #[test]
    fn test_sample_caps() {
        let mut p = policy();
        p.set_raw_sample_cap(1000).unwrap();
        assert_eq!(
            p.decide(10.0, &[500, 1500]),
            Resolution::Summarized(SummaryReason::SampleCapExceeded {
                projected: 1500,
                cap: 1000
            })
        );

        let mut p = policy();
        p.set_input_sample_cap(1000).unwrap();
        assert!(p.decide(10.0, &[600, 300]).is_raw());
        assert_eq!(
            p.decide(10.0, &[600, 600]),
            Resolution::Summarized(SummaryReason::InputCapExceeded {
                projected: 1200,
                cap: 1000
            })
        );
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut p = policy();
        assert!(p.set_raw_sample_cap(0).is_err());
        assert!(p.set_input_sample_cap(0).is_err());
        assert!(p.set_summary_threshold_mins(0.0).is_err());
        assert!(p.set_summary_threshold_mins(f64::NAN).is_err());
        assert_eq!(p, policy());
    }
}
