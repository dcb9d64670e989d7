// Recording collaborator
//
// File parsing and the sample store live behind `RecordingSource`; the server
// only ever sees attached channels, a segment list and annotation intervals.

use crate::error::{Result, SegsrvError};
use crate::events::{Annotation, AnnotationInstance};
use crate::timeline::Segment;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub start_time: NaiveTime,
    /// Seconds of data per record (EDF style)
    pub record_duration: f64,
}

/// One channel as handed over by the collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedChannel {
    pub sample_rate: f64,
    pub samples: Vec<f64>,
    pub segments: Vec<Segment>,
    pub physical_min: f64,
    pub physical_max: f64,
    pub unit: String,
}

pub trait RecordingSource {
    fn header(&self) -> Result<RecordingHeader>;

    fn channel_labels(&self) -> Vec<String>;

    fn annotation_classes(&self) -> Vec<String>;

    fn attach(&self, label: &str) -> Result<AttachedChannel>;

    fn annotations(&self, classes: &[String]) -> Result<Vec<Annotation>>;

    /// Add a new channel; `samples` must span the recorded duration at `sample_rate`
    fn insert_signal(&mut self, label: &str, samples: Vec<f64>, sample_rate: f64) -> Result<()>;

    /// Replace a channel's samples, keeping its sampling rate and duration
    fn update_signal(&mut self, label: &str, samples: Vec<f64>) -> Result<()>;

    fn reload(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredChannel {
    sample_rate: f64,
    samples: Vec<f64>,
    physical_min: f64,
    physical_max: f64,
    unit: String,
}

/// Fully resident recording, built up channel by channel
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    header: RecordingHeader,
    segments: Vec<Segment>,
    channels: BTreeMap<String, StoredChannel>,
    order: Vec<String>,
    annotations: BTreeMap<String, Vec<AnnotationInstance>>,
}

impl InMemoryRecording {
    /// Contiguous recording of `duration` seconds
    pub fn new(start_time: NaiveTime, duration: f64) -> Self {
        Self {
            header: RecordingHeader {
                start_time,
                record_duration: 1.0,
            },
            segments: vec![Segment::new(0.0, duration, 0.0)],
            channels: BTreeMap::new(),
            order: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn record_duration(mut self, seconds: f64) -> Self {
        self.header.record_duration = seconds;
        self
    }

    /// Replace the segment list, e.g. for a discontinuous recording
    pub fn segments(mut self, segments: Vec<Segment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn channel(self, label: impl Into<String>, sample_rate: f64, samples: Vec<f64>) -> Self {
        self.channel_with_range(
            label,
            sample_rate,
            samples,
            f64::NEG_INFINITY,
            f64::INFINITY,
            "",
        )
    }

    pub fn channel_with_range(
        mut self,
        label: impl Into<String>,
        sample_rate: f64,
        samples: Vec<f64>,
        physical_min: f64,
        physical_max: f64,
        unit: impl Into<String>,
    ) -> Self {
        let label = label.into();
        if !self.channels.contains_key(&label) {
            self.order.push(label.clone());
        }
        self.channels.insert(
            label,
            StoredChannel {
                sample_rate,
                samples,
                physical_min,
                physical_max,
                unit: unit.into(),
            },
        );
        self
    }

    pub fn annotation(self, class: impl Into<String>, start: f64, stop: f64) -> Self {
        self.annotation_instance(class, AnnotationInstance::new(start, stop))
    }

    pub fn annotation_instance(mut self, class: impl Into<String>, instance: AnnotationInstance) -> Self {
        let instances = self.annotations.entry(class.into()).or_default();
        instances.push(instance);
        instances.sort_by(|a, b| a.start.total_cmp(&b.start));
        self
    }

    fn recorded_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    fn expected_len(&self, sample_rate: f64) -> usize {
        (self.recorded_duration() * sample_rate).round() as usize
    }
}

impl RecordingSource for InMemoryRecording {
    fn header(&self) -> Result<RecordingHeader> {
        Ok(self.header)
    }

    fn channel_labels(&self) -> Vec<String> {
        self.order.clone()
    }

    fn annotation_classes(&self) -> Vec<String> {
        self.annotations.keys().cloned().collect()
    }

    fn attach(&self, label: &str) -> Result<AttachedChannel> {
        let stored = self
            .channels
            .get(label)
            .ok_or_else(|| SegsrvError::UnknownChannel(label.to_string()))?;
        Ok(AttachedChannel {
            sample_rate: stored.sample_rate,
            samples: stored.samples.clone(),
            segments: self.segments.clone(),
            physical_min: stored.physical_min,
            physical_max: stored.physical_max,
            unit: stored.unit.clone(),
        })
    }

    fn annotations(&self, classes: &[String]) -> Result<Vec<Annotation>> {
        Ok(classes
            .iter()
            .filter_map(|class| {
                self.annotations.get(class).map(|instances| Annotation {
                    class: class.clone(),
                    instances: instances.clone(),
                })
            })
            .collect())
    }

    fn insert_signal(&mut self, label: &str, samples: Vec<f64>, sample_rate: f64) -> Result<()> {
        if self.channels.contains_key(label) {
            return Err(SegsrvError::Recording(format!(
                "channel {} already exists",
                label
            )));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(SegsrvError::Recording(format!(
                "invalid sampling rate {} for {}",
                sample_rate, label
            )));
        }
        let expected = self.expected_len(sample_rate);
        if samples.len() != expected {
            return Err(SegsrvError::Recording(format!(
                "{} has {} samples, expected {} at {} Hz",
                label,
                samples.len(),
                expected,
                sample_rate
            )));
        }

        self.order.push(label.to_string());
        self.channels.insert(
            label.to_string(),
            StoredChannel {
                sample_rate,
                samples,
                physical_min: f64::NEG_INFINITY,
                physical_max: f64::INFINITY,
                unit: String::new(),
            },
        );
        Ok(())
    }

    fn update_signal(&mut self, label: &str, samples: Vec<f64>) -> Result<()> {
        let stored = self
            .channels
            .get_mut(label)
            .ok_or_else(|| SegsrvError::UnknownChannel(label.to_string()))?;
        if samples.len() != stored.samples.len() {
            return Err(SegsrvError::Recording(format!(
                "update of {} has {} samples, expected {}",
                label,
                samples.len(),
                stored.samples.len()
            )));
        }
        stored.samples = samples;
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        // resident data: nothing to re-read
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> InMemoryRecording {
        InMemoryRecording::new(NaiveTime::from_hms_opt(23, 0, 0).unwrap(), 10.0)
            .channel("EEG", 100.0, vec![0.0; 1000])
            .channel_with_range("EMG", 50.0, vec![0.0; 500], -250.0, 250.0, "uV")
            .annotation("arousal", 5.0, 6.0)
            .annotation("arousal", 1.0, 2.0)
    }

    #[test]
    fn test_builder_and_attach() {
        let rec = recording();
        assert_eq!(rec.channel_labels(), vec!["EEG", "EMG"]);
        let emg = rec.attach("EMG").unwrap();
        assert_eq!(emg.sample_rate, 50.0);
        assert_eq!(emg.unit, "uV");
        assert!(matches!(
            rec.attach("ECG"),
            Err(SegsrvError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_annotations_sorted_and_filtered() {
        let rec = recording();
        let anns = rec
            .annotations(&["arousal".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(anns.len(), 1);
        assert_eq!(anns[0].instances[0].start, 1.0);
    }

    #[test]
    fn test_signal_injection_checks_length() {
        let mut rec = recording();
        assert!(rec.insert_signal("ECG", vec![0.0; 999], 100.0).is_err());
        assert!(rec.insert_signal("EEG", vec![0.0; 1000], 100.0).is_err());
        rec.insert_signal("ECG", vec![0.0; 2560], 256.0).unwrap();
        assert_eq!(rec.channel_labels().len(), 3);

        assert!(rec.update_signal("EEG", vec![1.0; 10]).is_err());
        rec.update_signal("EEG", vec![1.0; 1000]).unwrap();
        assert_eq!(rec.attach("EEG").unwrap().samples[0], 1.0);
    }
}
