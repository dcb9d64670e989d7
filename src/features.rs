//! Per-epoch features over the current window.
//!
//! The window is cut into epochs of `epoch_size` seconds anchored at its left
//! edge. Every full epoch gets one row in a dense matrix; a trailing partial
//! epoch is computed the same way but kept apart so matrix row counts stay
//! exact. Samples are gathered through the timeline, so gaps never contribute.
//!
//! Degenerate epochs (not fully recorded, too short, flat) are encoded as NaN
//! rather than aborting the whole matrix.

use crate::channel::ChannelBuffer;
use crate::config::{BandDefinition, ServerConfig};
use crate::error::{Result, SegsrvError};
use crate::timeline::{Timeline, TIME_EPS};
use crate::window::Window;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};

// Thread-local FFT planner so rayon workers reuse their plans
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

pub const HJORTH_COLUMNS: [&str; 3] = ["activity", "mobility", "complexity"];

/// Interrupts a running feature pass between epochs
///
/// Every pass takes a [`CancelTicket`] from [`begin`](Self::begin). `cancel`
/// marks the most recent ticket only, so a cancel that lands after a pass
/// has finished never reaches the next one.
#[derive(Debug, Default)]
pub struct CancellationToken {
    generation: AtomicU64,
    cancelled: AtomicU64,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> CancelTicket<'_> {
        CancelTicket {
            token: self,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(self.generation.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

/// Handle for one feature pass, checked once per epoch
#[derive(Debug, Clone, Copy)]
pub struct CancelTicket<'a> {
    token: &'a CancellationToken,
    generation: u64,
}

impl CancelTicket<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.token.cancelled.load(Ordering::SeqCst) == self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub partial: bool,
}

impl Epoch {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochGrid {
    pub epoch_size: f64,
    pub epochs: Vec<Epoch>,
    pub partial: Option<Epoch>,
}

impl EpochGrid {
    pub fn new(window: &Window, epoch_size: f64) -> Self {
        let duration = window.duration();
        let n = (duration / epoch_size + TIME_EPS).floor() as usize;
        let epochs = (0..n)
            .map(|i| Epoch {
                index: i,
                start: window.left + i as f64 * epoch_size,
                end: window.left + (i + 1) as f64 * epoch_size,
                partial: false,
            })
            .collect();

        let covered = n as f64 * epoch_size;
        let partial = (duration - covered > TIME_EPS).then(|| Epoch {
            index: n,
            start: window.left + covered,
            end: window.right,
            partial: true,
        });

        Self {
            epoch_size,
            epochs,
            partial,
        }
    }

    pub fn nepochs(&self) -> usize {
        self.epochs.len()
    }

    /// Full epochs followed by the partial one, if any
    pub fn all(&self) -> impl Iterator<Item = &Epoch> {
        self.epochs.iter().chain(self.partial.iter())
    }
}

/// Samples of one channel inside one epoch
#[derive(Debug, Clone)]
pub struct EpochSamples {
    pub values: Vec<f64>,
    /// Every second of the epoch lies inside a recorded segment
    pub fully_covered: bool,
}

impl EpochSamples {
    pub fn gather(channel: &ChannelBuffer, timeline: &Timeline, epoch: &Epoch) -> Self {
        let spans = timeline.sample_spans(epoch.start, epoch.end, channel.sample_rate());
        let recorded = timeline.recorded_duration(epoch.start, epoch.end);
        Self {
            values: channel.gather(&spans),
            fully_covered: epoch.duration() - recorded <= TIME_EPS,
        }
    }
}

/// Epoch x column matrix for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub channel: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub partial: Option<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[idx]).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub start: f64,
    pub end: f64,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub clipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel: String,
    pub epochs: Vec<EpochSummary>,
    pub partial: Option<EpochSummary>,
}

/// Welch band power and spectral settings
#[derive(Debug, Clone)]
pub struct SpectralSettings {
    pub bands: Vec<BandDefinition>,
    pub segment_secs: f64,
    pub min_samples: usize,
}

impl SpectralSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            bands: config.bands.clone(),
            segment_secs: config.welch_segment_secs,
            min_samples: config.min_spectral_samples.max(2),
        }
    }
}

/// Absolute power per band from a one-sided Welch PSD.
///
/// Segments of `segment_secs` (clipped to the input) with 50% overlap, Hann
/// window, mean removed per segment. Bands starting at or above Nyquist are NaN.
pub fn band_powers(samples: &[f64], sample_rate: f64, settings: &SpectralSettings) -> Vec<f64> {
    let nan_row = || vec![f64::NAN; settings.bands.len()];
    let n = samples.len();
    if n < settings.min_samples || n < 2 {
        return nan_row();
    }

    let seg_len = ((settings.segment_secs * sample_rate).round() as usize).clamp(2, n);
    let step = (seg_len / 2).max(1);
    let window: Vec<f64> = (0..seg_len)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / seg_len as f64).cos()))
        .collect();
    let window_power: f64 = window.iter().map(|w| w * w).sum();

    let n_bins = seg_len / 2 + 1;
    let mut acc = vec![0.0; n_bins];
    let mut n_segments = 0usize;

    FFT_PLANNER.with(|planner| {
        let fft = planner.borrow_mut().plan_fft_forward(seg_len);
        let mut buffer = vec![Complex::new(0.0, 0.0); seg_len];
        let mut start = 0;
        while start + seg_len <= n {
            let segment = &samples[start..start + seg_len];
            let mean = segment.iter().sum::<f64>() / seg_len as f64;
            for ((b, &x), &w) in buffer.iter_mut().zip(segment).zip(&window) {
                *b = Complex::new((x - mean) * w, 0.0);
            }
            fft.process(&mut buffer);
            for (a, c) in acc.iter_mut().zip(&buffer) {
                *a += c.norm_sqr();
            }
            n_segments += 1;
            start += step;
        }
    });

    let scale = 1.0 / (n_segments as f64 * sample_rate * window_power);
    let nyquist_bin = (seg_len % 2 == 0).then_some(seg_len / 2);
    let psd: Vec<f64> = acc
        .iter()
        .enumerate()
        .map(|(k, &p)| {
            let one_sided = if k == 0 || Some(k) == nyquist_bin { 1.0 } else { 2.0 };
            p * scale * one_sided
        })
        .collect();

    let df = sample_rate / seg_len as f64;
    let nyquist = sample_rate / 2.0;
    settings
        .bands
        .iter()
        .map(|band| {
            if band.low_hz >= nyquist {
                return f64::NAN;
            }
            psd.iter()
                .enumerate()
                .filter(|(k, _)| {
                    let f = *k as f64 * df;
                    f >= band.low_hz && f < band.high_hz
                })
                .map(|(_, p)| p * df)
                .sum()
        })
        .collect()
}

/// `[activity, mobility, complexity]`
pub fn hjorth(samples: &[f64]) -> [f64; 3] {
    let nan = f64::NAN;
    if samples.len() < 2 {
        return [nan; 3];
    }

    let activity = variance(samples);
    let dx: Vec<f64> = samples.windows(2).map(|w| w[1] - w[0]).collect();
    let var_dx = variance(&dx);
    let mobility = if activity > 0.0 {
        (var_dx / activity).sqrt()
    } else {
        nan
    };

    let complexity = if samples.len() < 3 || !(mobility > 0.0) || var_dx <= 0.0 {
        nan
    } else {
        let ddx: Vec<f64> = dx.windows(2).map(|w| w[1] - w[0]).collect();
        (variance(&ddx) / var_dx).sqrt() / mobility
    };

    [activity, mobility, complexity]
}

fn variance(x: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    x.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

pub fn summarize(channel: &ChannelBuffer, timeline: &Timeline, epoch: &Epoch) -> EpochSummary {
    let samples = EpochSamples::gather(channel, timeline, epoch);
    let values = samples.values;
    let (mut sum, mut min, mut max, mut clipped) = (0.0, f64::INFINITY, f64::NEG_INFINITY, 0);
    for &v in &values {
        sum += v;
        min = min.min(v);
        max = max.max(v);
        if channel.is_clipped(v) {
            clipped += 1;
        }
    }

    let count = values.len();
    if count == 0 {
        return EpochSummary {
            start: epoch.start,
            end: epoch.end,
            count,
            mean: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            clipped,
        };
    }
    EpochSummary {
        start: epoch.start,
        end: epoch.end,
        count,
        mean: sum / count as f64,
        min,
        max,
        clipped,
    }
}

pub fn summarize_channel(channel: &ChannelBuffer, timeline: &Timeline, grid: &EpochGrid) -> ChannelSummary {
    ChannelSummary {
        channel: channel.label().to_string(),
        epochs: grid
            .epochs
            .iter()
            .map(|e| summarize(channel, timeline, e))
            .collect(),
        partial: grid.partial.as_ref().map(|e| summarize(channel, timeline, e)),
    }
}

fn epoch_matrix<F>(
    channel: &ChannelBuffer,
    timeline: &Timeline,
    grid: &EpochGrid,
    columns: Vec<String>,
    cancel: &CancelTicket<'_>,
    row: F,
) -> Result<FeatureMatrix>
where
    F: Fn(&EpochSamples) -> Vec<f64>,
{
    let width = columns.len();
    let compute = |epoch: &Epoch| -> Result<Vec<f64>> {
        if cancel.is_cancelled() {
            return Err(SegsrvError::Cancelled);
        }
        let samples = EpochSamples::gather(channel, timeline, epoch);
        if !samples.fully_covered {
            return Ok(vec![f64::NAN; width]);
        }
        Ok(row(&samples))
    };

    let rows = grid.epochs.iter().map(&compute).collect::<Result<Vec<_>>>()?;
    let partial = grid.partial.as_ref().map(&compute).transpose()?;

    Ok(FeatureMatrix {
        channel: channel.label().to_string(),
        columns,
        rows,
        partial,
    })
}

/// Band power matrices, one per channel, computed in parallel
pub fn compute_bands(
    channels: &[&ChannelBuffer],
    timeline: &Timeline,
    grid: &EpochGrid,
    settings: &SpectralSettings,
    cancel: &CancelTicket<'_>,
) -> Result<Vec<FeatureMatrix>> {
    let columns: Vec<String> = settings.bands.iter().map(|b| b.name.clone()).collect();
    channels
        .par_iter()
        .map(|ch| {
            let sr = ch.sample_rate();
            epoch_matrix(ch, timeline, grid, columns.clone(), cancel, |s| {
                band_powers(&s.values, sr, settings)
            })
        })
        .collect()
}

/// Hjorth parameter matrices, one per channel, computed in parallel
pub fn compute_hjorths(
    channels: &[&ChannelBuffer],
    timeline: &Timeline,
    grid: &EpochGrid,
    cancel: &CancelTicket<'_>,
) -> Result<Vec<FeatureMatrix>> {
    let columns: Vec<String> = HJORTH_COLUMNS.iter().map(|c| c.to_string()).collect();
    channels
        .par_iter()
        .map(|ch| {
            epoch_matrix(ch, timeline, grid, columns.clone(), cancel, |s| {
                hjorth(&s.values).to_vec()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::Segment;
    use chrono::NaiveTime;

    fn sine(freq: f64, amp: f64, sr: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| amp * (2.0 * PI * freq * i as f64 / sr).sin())
            .collect()
    }

    fn window(left: f64, right: f64) -> Window {
        Window {
            left,
            right,
            clamped: false,
        }
    }

    #[test]
    fn test_epoch_grid_with_partial() {
        let grid = EpochGrid::new(&window(250.0, 350.0), 30.0);
        assert_eq!(grid.nepochs(), 3);
        assert_eq!(grid.epochs[1].start, 280.0);
        let partial = grid.partial.unwrap();
        assert_eq!((partial.start, partial.end), (340.0, 350.0));
        assert!(partial.partial);
        assert_eq!(grid.all().count(), 4);
    }

    #[test]
    fn test_epoch_grid_exact_fit() {
        let grid = EpochGrid::new(&window(0.0, 90.0), 30.0);
        assert_eq!(grid.nepochs(), 3);
        assert!(grid.partial.is_none());

        let short = EpochGrid::new(&window(0.0, 10.0), 30.0);
        assert_eq!(short.nepochs(), 0);
        assert!(short.partial.is_some());
    }

    #[test]
    fn test_band_power_of_sine() {
        let sr = 128.0;
        let x = sine(10.0, 2.0, sr, 30 * 128);
        let settings = SpectralSettings::from_config(&ServerConfig::default());
        let powers = band_powers(&x, sr, &settings);
        let alpha = powers[3];
        // a sine of amplitude A has power A^2 / 2
        assert!((alpha - 2.0).abs() < 0.1, "alpha = {}", alpha);
        assert!(powers[1] < 0.01);
        // GAMMA starts at 30 Hz, below Nyquist of 64 Hz
        assert!(powers[6].is_finite());
    }

    #[test]
    fn test_band_above_nyquist_is_nan() {
        let sr = 50.0;
        let x = sine(5.0, 1.0, sr, 30 * 50);
        let settings = SpectralSettings::from_config(&ServerConfig::default());
        let powers = band_powers(&x, sr, &settings);
        assert!(powers[6].is_nan());
        assert!(powers[2].is_finite());
    }

    #[test]
    fn test_band_power_too_few_samples() {
        let settings = SpectralSettings::from_config(&ServerConfig::default());
        let powers = band_powers(&[1.0; 10], 100.0, &settings);
        assert!(powers.iter().all(|p| p.is_nan()));
    }

    #[test]
    fn test_hjorth_of_sine() {
        let sr = 256.0;
        let f = 8.0;
        let x = sine(f, 3.0, sr, 2560);
        let [activity, mobility, complexity] = hjorth(&x);
        assert!((activity - 4.5).abs() < 0.05);
        let expected = 2.0 * (PI * f / sr).sin();
        assert!((mobility - expected).abs() < 1e-3);
        assert!((complexity - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_hjorth_degenerate() {
        assert!(hjorth(&[1.0]).iter().all(|v| v.is_nan()));
        let two = hjorth(&[1.0, 2.0]);
        assert_eq!(two[0], 0.25);
        assert!(two[2].is_nan());
        let flat = hjorth(&[5.0; 10]);
        assert_eq!(flat[0], 0.0);
        assert!(flat[1].is_nan() && flat[2].is_nan());
    }

    #[test]
    fn test_epoch_overlapping_gap_is_nan() {
        let timeline = Timeline::new(
            vec![
                Segment::new(0.0, 300.0, 0.0),
                Segment::new(300.0, 290.0, 310.0),
            ],
            1.0,
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        )
        .unwrap();
        let sr = 100.0;
        let ch = ChannelBuffer::new("EEG", sr, sine(6.0, 1.0, sr, 59_000), 59_000).unwrap();
        let grid = EpochGrid::new(&window(250.0, 350.0), 30.0);
        let token = CancellationToken::new();
        let cancel = token.begin();

        let hj = compute_hjorths(&[&ch], &timeline, &grid, &cancel).unwrap();
        assert_eq!(hj[0].nrows(), 3);
        assert!(hj[0].rows[0].iter().all(|v| v.is_finite()));
        assert!(hj[0].rows[1].iter().all(|v| v.is_nan()));
        assert!(hj[0].rows[2].iter().all(|v| v.is_finite()));
        assert!(hj[0].partial.as_ref().unwrap()[0].is_finite());

        let settings = SpectralSettings::from_config(&ServerConfig::default());
        let bands = compute_bands(&[&ch], &timeline, &grid, &settings, &cancel).unwrap();
        assert_eq!(bands[0].columns.len(), 7);
        assert!(bands[0].rows[1].iter().all(|v| v.is_nan()));
        assert!(bands[0].column("THETA").unwrap()[0] > 0.4);
    }

    #[test]
    fn test_cancelled_computation() {
        let timeline =
            Timeline::contiguous(60.0, 1.0, NaiveTime::from_hms_opt(0, 0, 0).unwrap()).unwrap();
        let ch = ChannelBuffer::new("EEG", 10.0, vec![0.0; 600], 600).unwrap();
        let grid = EpochGrid::new(&window(0.0, 60.0), 30.0);
        let token = CancellationToken::new();
        let running = token.begin();
        token.cancel();
        let result = compute_hjorths(&[&ch], &timeline, &grid, &running);
        assert!(matches!(result, Err(SegsrvError::Cancelled)));

        // a cancel aimed at a finished pass leaves the next one alone
        let next = token.begin();
        assert!(!next.is_cancelled());
        assert!(compute_hjorths(&[&ch], &timeline, &grid, &next).is_ok());
        token.cancel();
        assert!(next.is_cancelled());
        assert!(!running.is_cancelled());
    }

    #[test]
    fn test_summary_counts_clipped_samples() {
        let timeline =
            Timeline::contiguous(20.0, 1.0, NaiveTime::from_hms_opt(0, 0, 0).unwrap()).unwrap();
        let mut samples = vec![0.0; 200];
        samples[5] = 100.0;
        samples[6] = -100.0;
        samples[150] = 50.0;
        let ch = ChannelBuffer::new("EEG", 10.0, samples, 200)
            .unwrap()
            .with_physical_range(-100.0, 100.0, "uV");
        let grid = EpochGrid::new(&window(0.0, 20.0), 10.0);
        let summary = summarize_channel(&ch, &timeline, &grid);
        assert_eq!(summary.epochs.len(), 2);
        assert_eq!(summary.epochs[0].clipped, 2);
        assert_eq!(summary.epochs[0].count, 100);
        assert_eq!(summary.epochs[1].clipped, 0);
        assert_eq!(summary.epochs[1].max, 50.0);
        assert!((summary.epochs[1].mean - 0.5).abs() < 1e-12);
    }
}
