//! Gapped time base of a single recording.
//!
//! Storage provides samples in a contiguous *record* domain; the recording
//! itself may be discontinuous (EDF+D style), so each segment maps a block of
//! record time onto the *elapsed* (clock) domain. Gaps are the elapsed
//! intervals between segments.

use crate::error::{Result, SegsrvError};
use chrono::{Duration, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Tolerance used for all elapsed/record time comparisons (seconds)
pub(crate) const TIME_EPS: f64 = 1e-9;

/// Tolerance used when converting times to sample indices (samples)
const SAMPLE_EPS: f64 = 1e-6;

/// One contiguous block of recorded data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start in the record domain (seconds of recorded data before this block)
    pub record_start: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Start in the elapsed domain (seconds since recording start)
    pub elapsed_start: f64,
}

impl Segment {
    pub fn new(record_start: f64, duration: f64, elapsed_start: f64) -> Self {
        Self {
            record_start,
            duration,
            elapsed_start,
        }
    }

    pub fn elapsed_end(&self) -> f64 {
        self.elapsed_start + self.duration
    }

    pub fn record_end(&self) -> f64 {
        self.record_start + self.duration
    }

    fn overlap(&self, left: f64, right: f64) -> Option<(f64, f64)> {
        let a = left.max(self.elapsed_start);
        let b = right.min(self.elapsed_end());
        (b - a > TIME_EPS).then_some((a, b))
    }
}

/// Result of looking up an elapsed time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimePosition {
    /// Inside recorded data: record index plus offset (seconds) into that record
    Record { index: usize, offset: f64 },
    /// Inside a gap between two segments
    Gap { gap_start: f64, gap_end: f64 },
}

/// A contiguous run of sample indices for one channel inside a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleSpan {
    pub segment: usize,
    pub first: usize,
    pub len: usize,
    /// Elapsed time of sample `first`
    pub elapsed_start: f64,
}

impl SampleSpan {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.len
    }
}

/// Labelled position on the time axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockTick {
    pub elapsed: f64,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Timeline {
    segments: Vec<Segment>,
    record_duration: f64,
    start_time: NaiveTime,
}

impl Timeline {
    /// Build a timeline from segments sorted by elapsed start.
    ///
    /// Elapsed times are re-based so the first segment starts at zero; the
    /// start clock time is moved forward by the same amount.
    pub fn new(
        mut segments: Vec<Segment>,
        record_duration: f64,
        start_time: NaiveTime,
    ) -> Result<Self> {
        if segments.is_empty() {
            return Err(SegsrvError::Recording(
                "recording has no segments".to_string(),
            ));
        }
        if !(record_duration.is_finite() && record_duration > 0.0) {
            return Err(SegsrvError::Recording(format!(
                "invalid record duration {}",
                record_duration
            )));
        }

        let mut expected_record_start = 0.0;
        for (i, seg) in segments.iter().enumerate() {
            if !(seg.duration.is_finite() && seg.duration > 0.0) {
                return Err(SegsrvError::Recording(format!(
                    "segment {} has invalid duration {}",
                    i, seg.duration
                )));
            }
            if (seg.record_start - expected_record_start).abs() > TIME_EPS {
                return Err(SegsrvError::Recording(format!(
                    "segment {} starts at record time {} but {} was expected",
                    i, seg.record_start, expected_record_start
                )));
            }
            if i > 0 && seg.elapsed_start < segments[i - 1].elapsed_end() - TIME_EPS {
                return Err(SegsrvError::Recording(format!(
                    "segment {} overlaps or precedes segment {}",
                    i,
                    i - 1
                )));
            }
            expected_record_start = seg.record_end();
        }

        let origin = segments[0].elapsed_start;
        let mut start_time = start_time;
        if origin.abs() > TIME_EPS {
            log::debug!("[SEGSRV] re-basing timeline origin by {:.3}s", origin);
            for seg in segments.iter_mut() {
                seg.elapsed_start -= origin;
            }
            start_time = start_time
                .overflowing_add_signed(Duration::milliseconds((origin * 1000.0).round() as i64))
                .0;
        }

        Ok(Self {
            segments,
            record_duration,
            start_time,
        })
    }

    /// Single-segment timeline
    pub fn contiguous(duration: f64, record_duration: f64, start_time: NaiveTime) -> Result<Self> {
        Self::new(
            vec![Segment::new(0.0, duration, 0.0)],
            record_duration,
            start_time,
        )
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn record_duration(&self) -> f64 {
        self.record_duration
    }

    pub fn start_time(&self) -> NaiveTime {
        self.start_time
    }

    pub fn is_contiguous(&self) -> bool {
        self.segments.len() == 1 || self.gaps().is_empty()
    }

    /// Recorded seconds, gaps excluded
    pub fn total_duration_original(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Seconds from first segment start to last segment end, gaps included
    pub fn total_duration_elapsed(&self) -> f64 {
        match (self.segments.first(), self.segments.last()) {
            (Some(first), Some(last)) => last.elapsed_end() - first.elapsed_start,
            _ => 0.0,
        }
    }

    pub fn num_records(&self) -> usize {
        (self.total_duration_original() / self.record_duration).round() as usize
    }

    pub fn record_to_elapsed(&self, record_index: usize) -> Result<f64> {
        let record_time = record_index as f64 * self.record_duration;
        let total = self.total_duration_original();
        if record_time > total + TIME_EPS {
            return Err(SegsrvError::OutOfRange(format!(
                "record {} is beyond the {} records of this recording",
                record_index,
                self.num_records()
            )));
        }

        let seg = self
            .segments
            .iter()
            .find(|s| record_time < s.record_end() - TIME_EPS)
            .or(self.segments.last())
            .ok_or_else(|| SegsrvError::Recording("recording has no segments".to_string()))?;

        Ok(seg.elapsed_start + (record_time - seg.record_start))
    }

    pub fn elapsed_to_record(&self, elapsed: f64) -> Result<TimePosition> {
        let total = self.total_duration_elapsed();
        if !(elapsed >= -TIME_EPS && elapsed <= total + TIME_EPS) {
            return Err(SegsrvError::OutOfRange(format!(
                "elapsed time {:.3}s is outside [0, {:.3}]",
                elapsed, total
            )));
        }

        // first segment whose end lies beyond `elapsed`
        let idx = self
            .segments
            .partition_point(|s| s.elapsed_end() <= elapsed + TIME_EPS);

        let record_time = match self.segments.get(idx) {
            Some(seg) if elapsed + TIME_EPS >= seg.elapsed_start => {
                seg.record_start + (elapsed - seg.elapsed_start).max(0.0)
            }
            Some(seg) => {
                let gap_start = idx
                    .checked_sub(1)
                    .map(|prev| self.segments[prev].elapsed_end())
                    .unwrap_or(0.0);
                return Ok(TimePosition::Gap {
                    gap_start,
                    gap_end: seg.elapsed_start,
                });
            }
            // exactly the end of the recording
            None => self.total_duration_original(),
        };

        let index = ((record_time / self.record_duration) + TIME_EPS).floor() as usize;
        let offset = (record_time - index as f64 * self.record_duration).max(0.0);
        Ok(TimePosition::Record { index, offset })
    }

    /// All gaps between adjacent segments
    pub fn gaps(&self) -> Vec<(f64, f64)> {
        self.segments
            .windows(2)
            .filter_map(|w| {
                let (start, end) = (w[0].elapsed_end(), w[1].elapsed_start);
                (end - start > TIME_EPS).then_some((start, end))
            })
            .collect()
    }

    /// Gaps intersecting `[left, right)`, clipped to it
    pub fn gaps_within(&self, left: f64, right: f64) -> Vec<(f64, f64)> {
        self.gaps()
            .into_iter()
            .filter_map(|(start, end)| {
                let a = start.max(left);
                let b = end.min(right);
                (b - a > TIME_EPS).then_some((a, b))
            })
            .collect()
    }

    /// Seconds of recorded (non-gap) time inside `[left, right)`
    pub fn recorded_duration(&self, left: f64, right: f64) -> f64 {
        self.segments
            .iter()
            .filter_map(|s| s.overlap(left, right))
            .map(|(a, b)| b - a)
            .sum()
    }

    /// Sample index runs of a channel sampled at `sample_rate` inside `[left, right)`
    ///
    /// Each run starts at the first sample at or after the overlap start. Run
    /// lengths come from the rounded cumulative recorded time, so the total is
    /// `round(recorded_duration * sample_rate)` whatever the window alignment.
    pub fn sample_spans(&self, left: f64, right: f64, sample_rate: f64) -> Vec<SampleSpan> {
        let mut spans = Vec::new();
        let mut recorded = 0.0;
        for (i, seg) in self.segments.iter().enumerate() {
            let Some((a, b)) = seg.overlap(left, right) else {
                continue;
            };
            let before = (recorded * sample_rate).round() as usize;
            recorded += b - a;
            let after = (recorded * sample_rate).round() as usize;

            let seg_first = to_sample_index(seg.record_start, sample_rate);
            let seg_end = to_sample_index(seg.record_end(), sample_rate);
            let first = to_sample_index(seg.record_start + (a - seg.elapsed_start), sample_rate)
                .max(seg_first);
            let len = after - before;
            let end = (first + len).min(seg_end);
            // a run cut by the segment end borrows the sample just before `a`
            let first = end.saturating_sub(len).max(seg_first);
            if end <= first {
                continue;
            }
            spans.push(SampleSpan {
                segment: i,
                first,
                len: end - first,
                elapsed_start: seg.elapsed_start + (first as f64 / sample_rate - seg.record_start),
            });
        }
        spans
    }

    /// Elapsed time of sample `index` of a channel sampled at `sample_rate`
    pub fn elapsed_of_sample(&self, index: usize, sample_rate: f64) -> Result<f64> {
        let seg = self
            .segments
            .iter()
            .find(|s| index < to_sample_index(s.record_end(), sample_rate))
            .ok_or_else(|| {
                SegsrvError::OutOfRange(format!(
                    "sample {} is beyond the end of a {} Hz channel",
                    index, sample_rate
                ))
            })?;
        Ok(seg.elapsed_start + (index as f64 / sample_rate - seg.record_start))
    }

    pub fn clock_time(&self, elapsed: f64) -> String {
        self.clock_at(elapsed).format("%H:%M:%S").to_string()
    }

    fn clock_at(&self, elapsed: f64) -> NaiveTime {
        self.start_time
            .overflowing_add_signed(Duration::milliseconds((elapsed * 1000.0).round() as i64))
            .0
    }

    /// `n` evenly spaced ticks across `[left, right]`, both ends included
    pub fn clock_ticks(&self, left: f64, right: f64, n: usize) -> Vec<ClockTick> {
        match n {
            0 => Vec::new(),
            1 => vec![ClockTick {
                elapsed: left,
                label: self.clock_time(left),
            }],
            _ => {
                let step = (right - left) / (n - 1) as f64;
                (0..n)
                    .map(|i| {
                        let elapsed = left + step * i as f64;
                        ClockTick {
                            elapsed,
                            label: self.clock_time(elapsed),
                        }
                    })
                    .collect()
            }
        }
    }

    /// Positions of whole clock hours across the whole recording
    pub fn hour_ticks(&self) -> Vec<ClockTick> {
        let since_midnight = seconds_from_midnight(self.start_time);
        let to_next_hour = (3600.0 - since_midnight % 3600.0) % 3600.0;
        let total = self.total_duration_elapsed();

        let mut ticks = Vec::new();
        let mut elapsed = to_next_hour;
        while elapsed <= total + TIME_EPS {
            ticks.push(ClockTick {
                elapsed,
                label: self.clock_at(elapsed).format("%H:00").to_string(),
            });
            elapsed += 3600.0;
        }
        ticks
    }
}

fn to_sample_index(record_time: f64, sample_rate: f64) -> usize {
    (record_time * sample_rate - SAMPLE_EPS).ceil().max(0.0) as usize
}

fn seconds_from_midnight(time: NaiveTime) -> f64 {
    time.num_seconds_from_midnight() as f64 + time.nanosecond() as f64 * 1e-9
}
