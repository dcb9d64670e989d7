//! Segment server: windowed access to one populated recording.
//!
//! Lifecycle is `Unpopulated -> Populated -> Windowed`. Signal, feature and
//! event reads need a valid window and fail with [`SegsrvError::Unready`]
//! otherwise. Derived results (fitted ranges, feature matrices, compiled
//! events) are keyed by [`CacheVersions`] and are never served stale.

use crate::channel::ChannelBuffer;
use crate::config::{LayoutConfig, ServerConfig};
use crate::error::{Result, SegsrvError};
use crate::events::{self, CompiledClass, CompiledEvents, EncodedEvents, EventRecord};
use crate::features::{
    self, CancellationToken, ChannelSummary, EpochGrid, FeatureMatrix, SpectralSettings,
};
use crate::profile_scope;
use crate::scale::{DisplayLayout, PhysRange, ScaleMode};
use crate::source::{RecordingHeader, RecordingSource};
use crate::throttle::{Resolution, ResolutionPolicy};
use crate::timeline::{ClockTick, Segment, Timeline, TIME_EPS};
use crate::types::*;
use crate::window::{ActiveWindow, Window, WindowStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Unpopulated,
    Populated,
    Windowed,
}

/// Monotonic counters, bumped by every change that can invalidate derived data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheVersions {
    pub window: u64,
    pub epoch: u64,
    pub data: u64,
    pub scale: u64,
}

type FeatureKey = (u64, u64, u64);

impl CacheVersions {
    fn feature_key(&self) -> FeatureKey {
        (self.window, self.epoch, self.data)
    }
}

#[derive(Debug, Default)]
struct FeatureCache {
    key: Option<FeatureKey>,
    matrices: HashMap<String, FeatureMatrix>,
}

impl FeatureCache {
    fn store(&mut self, key: FeatureKey, matrices: Vec<FeatureMatrix>) {
        if self.key != Some(key) {
            self.matrices.clear();
            self.key = Some(key);
        }
        for m in matrices {
            self.matrices.insert(m.channel.clone(), m);
        }
    }

    fn get(&self, key: FeatureKey, channel: &str) -> Option<&FeatureMatrix> {
        if self.key != Some(key) {
            return None;
        }
        self.matrices.get(channel)
    }
}

/// Everything derived from one `populate`
#[derive(Debug)]
struct Recording {
    timeline: Timeline,
    channels: Vec<ChannelBuffer>,
    annotation_classes: Vec<String>,
    window: Option<ActiveWindow>,
    window_status: WindowStatus,
    bands: FeatureCache,
    hjorths: FeatureCache,
    events: Option<CompiledEvents>,
}

impl Recording {
    fn channel_index(&self, label: &str) -> Result<usize> {
        self.channels
            .iter()
            .position(|c| c.label() == label)
            .ok_or_else(|| SegsrvError::UnknownChannel(label.to_string()))
    }

    /// `None` or an empty list selects every loaded channel
    fn resolve_channels(&self, labels: Option<&[String]>) -> Result<Vec<usize>> {
        match labels {
            Some(list) if !list.is_empty() => {
                list.iter().map(|l| self.channel_index(l)).collect()
            }
            _ => Ok((0..self.channels.len()).collect()),
        }
    }

    fn refresh_window_spans(&mut self) {
        if let Some(window) = self.window.as_ref().map(|a| a.window) {
            self.window = Some(ActiveWindow::resolve(
                window,
                &self.timeline,
                &self.channels,
            ));
        }
    }
}

fn not_populated() -> SegsrvError {
    SegsrvError::Unready("no recording populated".to_string())
}

fn same_segments(a: &[Segment], b: &[Segment]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            (x.record_start - y.record_start).abs() <= TIME_EPS
                && (x.duration - y.duration).abs() <= TIME_EPS
                && (x.elapsed_start - y.elapsed_start).abs() <= TIME_EPS
        })
}

pub struct SegmentServer<R: RecordingSource> {
    id: Uuid,
    source: R,
    config: ServerConfig,
    policy: ResolutionPolicy,
    spectral: SpectralSettings,
    epoch_size: f64,
    layout: LayoutConfig,
    annot_format6: bool,
    versions: CacheVersions,
    recording: Option<Recording>,
    layout_cache: RwLock<Option<(u64, DisplayLayout)>>,
    cancel: Arc<CancellationToken>,
}

impl<R: RecordingSource> SegmentServer<R> {
    /// Create an unpopulated server over `source`
    ///
    /// # Arguments
    /// * `source` - Recording collaborator providing channels and annotations
    /// * `config` - Server configuration, validated here
    pub fn new(source: R, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(source, config))
    }

    pub fn with_default_config(source: R) -> Self {
        Self::build(source, ServerConfig::default())
    }

    fn build(source: R, config: ServerConfig) -> Self {
        let id = Uuid::new_v4();
        log::info!("[SEGSRV] created segment server {}", id);

        Self {
            id,
            source,
            policy: ResolutionPolicy::from_config(&config),
            spectral: SpectralSettings::from_config(&config),
            epoch_size: config.epoch_size_secs,
            layout: config.layout.clone(),
            annot_format6: false,
            versions: CacheVersions::default(),
            recording: None,
            layout_cache: RwLock::new(None),
            cancel: Arc::new(CancellationToken::new()),
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    pub fn versions(&self) -> CacheVersions {
        self.versions
    }

    /// Shared token that aborts the feature pass running when it fires
    pub fn cancel_handle(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> ServerState {
        match &self.recording {
            None => ServerState::Unpopulated,
            Some(rec) if rec.window.is_some() => ServerState::Windowed,
            Some(_) => ServerState::Populated,
        }
    }

    fn recording(&self) -> Result<&Recording> {
        self.recording.as_ref().ok_or_else(not_populated)
    }

    fn windowed(&self) -> Result<(&Recording, &ActiveWindow)> {
        let rec = self.recording()?;
        let active = rec
            .window
            .as_ref()
            .ok_or_else(|| SegsrvError::Unready("no valid window set".to_string()))?;
        Ok((rec, active))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Attach channels and annotation classes from the source
    ///
    /// Channels that fail to attach (unknown label, bad sampling rate, wrong
    /// length, segment list differing from the first channel) are skipped and
    /// listed in the report. Fails only if no channel could be loaded, in
    /// which case the server stays unpopulated.
    pub fn populate(&mut self, channels: &[&str], annotation_classes: &[&str]) -> Result<PopulateReport> {
        profile_scope!("populate");
        if channels.is_empty() {
            return Err(SegsrvError::Configuration(
                "populate needs at least one channel".to_string(),
            ));
        }

        self.recording = None;
        let header = self.source.header()?;

        let mut timeline: Option<Timeline> = None;
        let mut buffers: Vec<ChannelBuffer> = Vec::new();
        let mut skipped = Vec::new();
        for &label in channels {
            match self.load_channel(label, &header, timeline.as_ref(), &buffers) {
                Ok((buffer, candidate)) => {
                    if timeline.is_none() {
                        timeline = Some(candidate);
                    }
                    buffers.push(buffer);
                }
                Err(e) => {
                    log::warn!("[SEGSRV] skipping channel {}: {}", label, e);
                    skipped.push(SkippedChannel {
                        label: label.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let timeline = match timeline {
            Some(t) if !buffers.is_empty() => t,
            _ => {
                return Err(SegsrvError::Recording(format!(
                    "none of the {} requested channels could be loaded",
                    channels.len()
                )))
            }
        };

        let available = self.source.annotation_classes();
        let mut classes = Vec::new();
        for &class in annotation_classes {
            if available.iter().any(|a| a == class) {
                classes.push(class.to_string());
            } else {
                log::warn!("[SEGSRV] annotation class {} not found", class);
            }
        }

        let report = PopulateReport {
            id: Uuid::new_v4().to_string(),
            loaded: buffers.iter().map(|b| b.label().to_string()).collect(),
            skipped,
            annotation_classes: classes.clone(),
            total_duration_elapsed: timeline.total_duration_elapsed(),
            total_duration_original: timeline.total_duration_original(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        log::info!(
            "[SEGSRV] populated {} channels ({} skipped), {:.1}s elapsed / {:.1}s recorded, {} gaps",
            report.loaded.len(),
            report.skipped.len(),
            report.total_duration_elapsed,
            report.total_duration_original,
            timeline.gaps().len()
        );

        self.versions.data += 1;
        self.versions.window += 1;
        self.versions.scale += 1;
        self.recording = Some(Recording {
            timeline,
            channels: buffers,
            annotation_classes: classes,
            window: None,
            window_status: WindowStatus::Unset,
            bands: FeatureCache::default(),
            hjorths: FeatureCache::default(),
            events: None,
        });

        Ok(report)
    }

    fn load_channel(
        &self,
        label: &str,
        header: &RecordingHeader,
        timeline: Option<&Timeline>,
        loaded: &[ChannelBuffer],
    ) -> Result<(ChannelBuffer, Timeline)> {
        if loaded.iter().any(|b| b.label() == label) {
            return Err(SegsrvError::Recording(format!(
                "channel {} requested twice",
                label
            )));
        }

        let attached = self.source.attach(label)?;
        let candidate = Timeline::new(
            attached.segments,
            header.record_duration,
            header.start_time,
        )?;
        if let Some(tl) = timeline {
            if !same_segments(tl.segments(), candidate.segments()) {
                return Err(SegsrvError::Recording(format!(
                    "segments of {} differ from the first loaded channel",
                    label
                )));
            }
        }

        let expected = (attached.sample_rate * candidate.total_duration_original()).round() as usize;
        let buffer = ChannelBuffer::new(label, attached.sample_rate, attached.samples, expected)?
            .with_physical_range(attached.physical_min, attached.physical_max, attached.unit);
        Ok((buffer, candidate))
    }

    /// Re-read the source and return to the unpopulated state
    pub fn refresh(&mut self) -> Result<()> {
        self.source.reload()?;
        log::info!("[SEGSRV] source reloaded");
        self.drop_recording();
        Ok(())
    }

    /// Forget the populated recording and every derived cache
    pub fn drop_recording(&mut self) {
        if self.recording.take().is_some() {
            log::info!("[SEGSRV] recording dropped");
        }
        self.versions.data += 1;
        self.versions.window += 1;
        self.versions.scale += 1;
    }

    pub fn channels(&self) -> Result<Vec<String>> {
        Ok(self
            .recording()?
            .channels
            .iter()
            .map(|c| c.label().to_string())
            .collect())
    }

    pub fn annotation_classes(&self) -> Result<Vec<String>> {
        Ok(self.recording()?.annotation_classes.clone())
    }

    pub fn get_total_sec(&self) -> Result<f64> {
        Ok(self.recording()?.timeline.total_duration_elapsed())
    }

    pub fn get_total_sec_original(&self) -> Result<f64> {
        Ok(self.recording()?.timeline.total_duration_original())
    }

    pub fn timeline(&self) -> Result<&Timeline> {
        Ok(&self.recording()?.timeline)
    }

    /// Add a derived channel to both the source and the populated recording
    pub fn insert_signal(&mut self, label: &str, samples: Vec<f64>, sample_rate: f64) -> Result<()> {
        let rec = self.recording.as_ref().ok_or_else(not_populated)?;
        if rec.channels.iter().any(|c| c.label() == label) {
            return Err(SegsrvError::Recording(format!(
                "channel {} already exists",
                label
            )));
        }
        let expected =
            (sample_rate * rec.timeline.total_duration_original()).round() as usize;
        let buffer = ChannelBuffer::new(label, sample_rate, samples.clone(), expected)?;

        self.source.insert_signal(label, samples, sample_rate)?;

        let rec = self.recording.as_mut().ok_or_else(not_populated)?;
        rec.channels.push(buffer);
        rec.refresh_window_spans();
        self.versions.data += 1;
        self.versions.scale += 1;
        log::debug!("[SEGSRV] inserted channel {} ({} Hz)", label, sample_rate);
        Ok(())
    }

    /// Replace the samples of a loaded channel
    pub fn update_signal(&mut self, label: &str, samples: Vec<f64>) -> Result<()> {
        let rec = self.recording.as_ref().ok_or_else(not_populated)?;
        let idx = rec.channel_index(label)?;
        if samples.len() != rec.channels[idx].len() {
            return Err(SegsrvError::Recording(format!(
                "update of {} has {} samples, expected {}",
                label,
                samples.len(),
                rec.channels[idx].len()
            )));
        }

        self.source.update_signal(label, samples.clone())?;

        let rec = self.recording.as_mut().ok_or_else(not_populated)?;
        rec.channels[idx].replace_samples(samples)?;
        self.versions.data += 1;
        log::debug!("[SEGSRV] updated channel {}", label);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Window
    // ------------------------------------------------------------------

    /// Set the query window in elapsed seconds
    ///
    /// # Returns
    /// `Ok(true)` for a valid window; `Ok(false)` if it is empty after
    /// clamping or holds no samples for any channel (the previous window is
    /// discarded either way).
    pub fn set_window(&mut self, left: f64, right: f64) -> Result<bool> {
        let rec = self.recording.as_mut().ok_or_else(not_populated)?;
        self.versions.window += 1;

        let total = rec.timeline.total_duration_elapsed();
        let Some(window) = Window::clamp(left, right, total) else {
            log::debug!(
                "[SEGSRV] window [{:.3}, {:.3}) is empty within [0, {:.3}]",
                left,
                right,
                total
            );
            rec.window = None;
            rec.window_status = WindowStatus::Empty;
            return Ok(false);
        };
        if window.clamped {
            log::warn!(
                "[SEGSRV] window [{:.3}, {:.3}) clamped to [{:.3}, {:.3})",
                left,
                right,
                window.left,
                window.right
            );
        }

        let active = ActiveWindow::resolve(window, &rec.timeline, &rec.channels);
        if !active.has_data() {
            log::debug!(
                "[SEGSRV] window [{:.3}, {:.3}) lies inside a gap",
                window.left,
                window.right
            );
            rec.window = None;
            rec.window_status = WindowStatus::NoData;
            return Ok(false);
        }

        log::debug!(
            "[SEGSRV] window set to [{:.3}, {:.3}) ({} samples)",
            window.left,
            window.right,
            active.sample_counts().iter().sum::<usize>()
        );
        rec.window = Some(active);
        rec.window_status = WindowStatus::Valid;
        Ok(true)
    }

    pub fn is_window_valid(&self) -> bool {
        self.state() == ServerState::Windowed
    }

    pub fn window_status(&self) -> WindowStatus {
        self.recording
            .as_ref()
            .map(|r| r.window_status)
            .unwrap_or(WindowStatus::Unset)
    }

    pub fn window(&self) -> Result<Window> {
        Ok(self.windowed()?.1.window)
    }

    pub fn get_window_left(&self) -> Result<f64> {
        Ok(self.window()?.left)
    }

    pub fn get_window_right(&self) -> Result<f64> {
        Ok(self.window()?.right)
    }

    pub fn get_window_left_hms(&self) -> Result<String> {
        let (rec, active) = self.windowed()?;
        Ok(rec.timeline.clock_time(active.window.left))
    }

    pub fn get_window_right_hms(&self) -> Result<String> {
        let (rec, active) = self.windowed()?;
        Ok(rec.timeline.clock_time(active.window.right))
    }

    /// Gaps inside the current window, clipped to it
    pub fn get_gaps(&self) -> Result<Vec<(f64, f64)>> {
        let (rec, active) = self.windowed()?;
        Ok(rec
            .timeline
            .gaps_within(active.window.left, active.window.right))
    }

    /// Every gap of the recording
    pub fn get_all_gaps(&self) -> Result<Vec<(f64, f64)>> {
        Ok(self.recording()?.timeline.gaps())
    }

    /// `n` labelled ticks spanning the current window
    pub fn get_clock_ticks(&self, n: usize) -> Result<Vec<ClockTick>> {
        let (rec, active) = self.windowed()?;
        Ok(rec
            .timeline
            .clock_ticks(active.window.left, active.window.right, n))
    }

    pub fn get_hour_ticks(&self) -> Result<Vec<ClockTick>> {
        Ok(self.recording()?.timeline.hour_ticks())
    }

    // ------------------------------------------------------------------
    // Resolution policy
    // ------------------------------------------------------------------

    pub fn throttle(&mut self, raw_sample_cap: usize) -> Result<()> {
        self.policy.set_raw_sample_cap(raw_sample_cap)?;
        log::debug!("[SEGSRV] raw sample cap set to {}", raw_sample_cap);
        Ok(())
    }

    pub fn input_throttle(&mut self, max_input_samples: usize) -> Result<()> {
        self.policy.set_input_sample_cap(max_input_samples)?;
        log::debug!("[SEGSRV] input sample cap set to {}", max_input_samples);
        Ok(())
    }

    pub fn summary_threshold_mins(&mut self, minutes: f64) -> Result<()> {
        self.policy.set_summary_threshold_mins(minutes)?;
        log::debug!("[SEGSRV] summary threshold set to {} mins", minutes);
        Ok(())
    }

    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    /// Resolution the current window would be served at (all channels)
    pub fn resolution(&self) -> Result<Resolution> {
        let (_, active) = self.windowed()?;
        Ok(self
            .policy
            .decide(active.window.duration(), &active.sample_counts()))
    }

    pub fn serve_raw_signals(&self) -> Result<bool> {
        Ok(self.resolution()?.is_raw())
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Samples of the requested channels over the current window, raw or
    /// summarized per the resolution policy
    pub fn get_signal(&self, request: &SignalRequest) -> Result<SignalResponse> {
        profile_scope!("get_signal");
        let (rec, active) = self.windowed()?;
        let indices = rec.resolve_channels(request.channels.as_deref())?;
        let counts: Vec<usize> = indices.iter().map(|&i| active.sample_count(i)).collect();
        let resolution = self.policy.decide(active.window.duration(), &counts);
        log::debug!(
            "[SEGSRV] serving {} channels over {:.1}s: {:?}",
            indices.len(),
            active.window.duration(),
            resolution
        );

        let layout = if request.scaled {
            Some(self.display_layout(rec)?)
        } else {
            None
        };
        let channels = match resolution {
            Resolution::Raw => indices
                .iter()
                .map(|&i| self.raw_signal(rec, active, i, layout.as_ref()))
                .collect(),
            Resolution::Summarized(_) => {
                let grid = EpochGrid::new(&active.window, self.epoch_size);
                indices
                    .iter()
                    .map(|&i| self.summarized_signal(rec, active, i, &grid, layout.as_ref()))
                    .collect()
            }
        };

        Ok(SignalResponse {
            resolution,
            window: active.window,
            scaled: request.scaled,
            channels,
        })
    }

    /// Same as [`get_signal`](Self::get_signal) with samples mapped into display lanes
    pub fn get_scaled_signal(&self, request: &SignalRequest) -> Result<SignalResponse> {
        self.get_signal(&request.clone().scaled(true))
    }

    fn raw_signal(
        &self,
        rec: &Recording,
        active: &ActiveWindow,
        idx: usize,
        layout: Option<&DisplayLayout>,
    ) -> ChannelSignal {
        let ch = &rec.channels[idx];
        let spans = active.spans(idx);
        let mut values = ch.gather(spans);

        if let Some(layout) = layout {
            let range = self.phys_range(rec, active, idx);
            match (layout.channel_lane(idx), range) {
                (Some(lane), Some(range)) => {
                    for v in values.iter_mut() {
                        *v = layout.project(lane, range, *v);
                    }
                }
                _ => values.iter_mut().for_each(|v| *v = f64::NAN),
            }
        }

        ChannelSignal::Raw {
            label: ch.label().to_string(),
            time: ch.time_track(spans),
            values,
        }
    }

    fn summarized_signal(
        &self,
        rec: &Recording,
        active: &ActiveWindow,
        idx: usize,
        grid: &EpochGrid,
        layout: Option<&DisplayLayout>,
    ) -> ChannelSignal {
        let mut summary = features::summarize_channel(&rec.channels[idx], &rec.timeline, grid);

        // mean, min and max move into the lane; count and clipped stay as-is
        if let Some(layout) = layout {
            let target = layout
                .channel_lane(idx)
                .zip(self.phys_range(rec, active, idx));
            for epoch in summary.epochs.iter_mut().chain(summary.partial.iter_mut()) {
                for v in [&mut epoch.mean, &mut epoch.min, &mut epoch.max] {
                    *v = match target {
                        Some((lane, range)) => layout.project(lane, range, *v),
                        None => f64::NAN,
                    };
                }
            }
        }

        ChannelSignal::Summarized(summary)
    }

    /// Elapsed time of every in-window sample of `channel`
    pub fn get_timetrack(&self, channel: &str) -> Result<Vec<f64>> {
        let (rec, active) = self.windowed()?;
        let idx = rec.channel_index(channel)?;
        Ok(rec.channels[idx].time_track(active.spans(idx)))
    }

    // ------------------------------------------------------------------
    // Scaling
    // ------------------------------------------------------------------

    pub fn set_scaling(&mut self, layout: LayoutConfig) -> Result<()> {
        layout.validate()?;
        self.layout = layout;
        self.versions.scale += 1;
        Ok(())
    }

    pub fn set_scale_mode(&mut self, channel: &str, mode: ScaleMode) -> Result<()> {
        let rec = self.recording.as_mut().ok_or_else(not_populated)?;
        let idx = rec.channel_index(channel)?;
        rec.channels[idx].scale.set_mode(mode)?;
        self.versions.scale += 1;
        log::debug!("[SEGSRV] scale mode of {} set to {:?}", channel, mode);
        Ok(())
    }

    pub fn fix_physical_scale(&mut self, channel: &str, min: f64, max: f64) -> Result<()> {
        self.set_scale_mode(channel, ScaleMode::Fixed { min, max })
    }

    pub fn empirical_physical_scale(&mut self, channel: &str) -> Result<()> {
        self.set_scale_mode(channel, ScaleMode::Empirical)
    }

    pub fn free_physical_scale(&mut self, channel: &str) -> Result<()> {
        self.set_scale_mode(channel, ScaleMode::Free)
    }

    pub fn scale_mode(&self, channel: &str) -> Result<ScaleMode> {
        let rec = self.recording()?;
        Ok(rec.channels[rec.channel_index(channel)?].scale.mode())
    }

    fn phys_range(&self, rec: &Recording, active: &ActiveWindow, idx: usize) -> Option<PhysRange> {
        let ch = &rec.channels[idx];
        ch.scale.resolve(
            self.versions.window,
            self.config.robust_percentile,
            || ch.samples(),
            || ch.gather(active.spans(idx)),
        )
    }

    /// Lane layout for the loaded channels and compiled rows, rebuilt when
    /// the scale version moves
    fn display_layout(&self, rec: &Recording) -> Result<DisplayLayout> {
        let version = self.versions.scale;
        if let Some((cached, layout)) = self.layout_cache.read().as_ref() {
            if *cached == version {
                return Ok(layout.clone());
            }
        }

        let rows = rec.events.as_ref().map(|e| e.n_rows()).unwrap_or(0);
        let layout = DisplayLayout::new(rec.channels.len(), rows, &self.layout)?;
        log::debug!(
            "[SEGSRV] layout rebuilt for {} channels and {} rows",
            rec.channels.len(),
            rows
        );
        *self.layout_cache.write() = Some((version, layout.clone()));
        Ok(layout)
    }

    /// Physical range used to scale `channel` in the current window
    pub fn get_window_phys_range(&self, channel: &str) -> Result<PhysRange> {
        let (rec, active) = self.windowed()?;
        let idx = rec.channel_index(channel)?;
        self.phys_range(rec, active, idx).ok_or_else(|| {
            SegsrvError::DataGap(format!("{} has no finite samples to scale", channel))
        })
    }

    /// Axis label: channel, active range and unit
    pub fn get_ylabel(&self, channel: &str) -> Result<String> {
        let range = self.get_window_phys_range(channel)?;
        let rec = self.recording()?;
        let unit = rec.channels[rec.channel_index(channel)?].unit();
        let label = format!("{} [{:.1}, {:.1}]", channel, range.min, range.max);
        if unit.is_empty() {
            Ok(label)
        } else {
            Ok(format!("{} {}", label, unit))
        }
    }

    // ------------------------------------------------------------------
    // Epochs and features
    // ------------------------------------------------------------------

    pub fn set_epoch_size(&mut self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(SegsrvError::Configuration(format!(
                "epoch size must be positive, got {}",
                seconds
            )));
        }
        if seconds != self.epoch_size {
            self.epoch_size = seconds;
            self.versions.epoch += 1;
            log::debug!("[SEGSRV] epoch size set to {}s", seconds);
        }
        Ok(())
    }

    pub fn get_epoch_size(&self) -> f64 {
        self.epoch_size
    }

    pub fn epoch_grid(&self) -> Result<EpochGrid> {
        let (_, active) = self.windowed()?;
        Ok(EpochGrid::new(&active.window, self.epoch_size))
    }

    /// Full epochs in the current window; the partial remainder is not counted
    pub fn nepochs(&self) -> Result<usize> {
        Ok(self.epoch_grid()?.nepochs())
    }

    /// Compute and cache feature matrices for the current window and epoch size
    pub fn calc_features(&mut self, request: &FeatureRequest) -> Result<()> {
        profile_scope!(format!("calc_{:?}", request.kind));
        let key = self.versions.feature_key();
        let (rec, active) = self.windowed()?;
        let indices = rec.resolve_channels(request.channels.as_deref())?;
        let grid = EpochGrid::new(&active.window, self.epoch_size);
        let selected: Vec<&ChannelBuffer> = indices.iter().map(|&i| &rec.channels[i]).collect();

        log::debug!(
            "[SEGSRV] computing {:?} for {} channels x {} epochs",
            request.kind,
            selected.len(),
            grid.all().count()
        );
        let ticket = self.cancel.begin();
        let result = match request.kind {
            FeatureKind::Bands => features::compute_bands(
                &selected,
                &rec.timeline,
                &grid,
                &self.spectral,
                &ticket,
            ),
            FeatureKind::Hjorth => {
                features::compute_hjorths(&selected, &rec.timeline, &grid, &ticket)
            }
        };

        let matrices = match result {
            Ok(m) => m,
            Err(SegsrvError::Cancelled) => {
                log::warn!("[SEGSRV] {:?} computation cancelled", request.kind);
                return Err(SegsrvError::Cancelled);
            }
            Err(e) => return Err(e),
        };

        let rec = self.recording.as_mut().ok_or_else(not_populated)?;
        let cache = match request.kind {
            FeatureKind::Bands => &mut rec.bands,
            FeatureKind::Hjorth => &mut rec.hjorths,
        };
        cache.store(key, matrices);
        Ok(())
    }

    pub fn calc_bands(&mut self, channels: &[&str]) -> Result<()> {
        self.calc_features(&FeatureRequest::bands().channels(channels.iter().copied()))
    }

    pub fn calc_hjorths(&mut self, channels: &[&str]) -> Result<()> {
        self.calc_features(&FeatureRequest::hjorths().channels(channels.iter().copied()))
    }

    fn cached_features(&self, kind: FeatureKind, channel: &str) -> Result<&FeatureMatrix> {
        let (rec, _) = self.windowed()?;
        rec.channel_index(channel)?;
        let cache = match kind {
            FeatureKind::Bands => &rec.bands,
            FeatureKind::Hjorth => &rec.hjorths,
        };
        cache.get(self.versions.feature_key(), channel).ok_or_else(|| {
            SegsrvError::Unready(format!(
                "{:?} for {} not calculated for the current window, epoch size and data",
                kind, channel
            ))
        })
    }

    /// Epoch x band matrix from the last `calc_bands`
    pub fn get_bands(&self, channel: &str) -> Result<&FeatureMatrix> {
        self.cached_features(FeatureKind::Bands, channel)
    }

    /// Epoch x (activity, mobility, complexity) matrix from the last `calc_hjorths`
    pub fn get_hjorths(&self, channel: &str) -> Result<&FeatureMatrix> {
        self.cached_features(FeatureKind::Hjorth, channel)
    }

    pub fn get_features(&self, request: &FeatureRequest) -> Result<Vec<FeatureMatrix>> {
        let (rec, _) = self.windowed()?;
        rec.resolve_channels(request.channels.as_deref())?
            .into_iter()
            .map(|i| {
                self.cached_features(request.kind, rec.channels[i].label())
                    .cloned()
            })
            .collect()
    }

    pub fn get_summary_stats(&self, channel: &str) -> Result<ChannelSummary> {
        let (rec, active) = self.windowed()?;
        let idx = rec.channel_index(channel)?;
        let grid = EpochGrid::new(&active.window, self.epoch_size);
        Ok(features::summarize_channel(
            &rec.channels[idx],
            &rec.timeline,
            &grid,
        ))
    }

    /// `(start, end)` of every full epoch of the summary grid
    pub fn get_summary_timetrack(&self) -> Result<Vec<(f64, f64)>> {
        Ok(self
            .epoch_grid()?
            .epochs
            .iter()
            .map(|e| (e.start, e.end))
            .collect())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Compile annotations against the current window
    ///
    /// An empty `classes` compiles every class given to `populate`. Returns
    /// the number of events kept.
    pub fn compile_evts(&mut self, classes: &[&str]) -> Result<usize> {
        let (rec, active) = self.windowed()?;
        let classes: Vec<String> = if classes.is_empty() {
            rec.annotation_classes.clone()
        } else {
            classes.iter().map(|c| c.to_string()).collect()
        };
        let window = active.window;

        let annotations = self.source.annotations(&classes)?;
        let compiled =
            CompiledEvents::compile(&annotations, &classes, window, self.versions.window);
        let count = compiled.event_count();
        log::debug!(
            "[SEGSRV] compiled {} events in {} classes",
            count,
            compiled.n_rows()
        );

        let rec = self.recording.as_mut().ok_or_else(not_populated)?;
        rec.events = Some(compiled);
        self.versions.scale += 1;
        Ok(count)
    }

    fn compiled_events(&self) -> Result<(&Recording, &CompiledEvents)> {
        let (rec, _) = self.windowed()?;
        match &rec.events {
            Some(events) if events.window_version == self.versions.window => Ok((rec, events)),
            _ => Err(SegsrvError::Unready(
                "events not compiled for the current window".to_string(),
            )),
        }
    }

    fn compiled_class(&self, class: &str) -> Result<(&Recording, &CompiledClass)> {
        let (rec, events) = self.compiled_events()?;
        let compiled = events.class(class).ok_or_else(|| {
            SegsrvError::Unready(format!("annotation class {} was not compiled", class))
        })?;
        Ok((rec, compiled))
    }

    pub fn get_evnts_xaxes(&self, class: &str) -> Result<Vec<f64>> {
        Ok(CompiledEvents::xaxes(self.compiled_class(class)?.1))
    }

    pub fn get_evnts_xaxes_ends(&self, class: &str) -> Result<Vec<f64>> {
        Ok(CompiledEvents::xaxes_ends(self.compiled_class(class)?.1))
    }

    pub fn get_evnts_yaxes(&self, class: &str) -> Result<Vec<f64>> {
        let (rec, compiled) = self.compiled_class(class)?;
        Ok(CompiledEvents::yaxes(compiled, &self.display_layout(rec)?))
    }

    pub fn get_evnts_yaxes_ends(&self, class: &str) -> Result<Vec<f64>> {
        let (rec, compiled) = self.compiled_class(class)?;
        Ok(CompiledEvents::yaxes_ends(compiled, &self.display_layout(rec)?))
    }

    pub fn set_annot_format6(&mut self, enabled: bool) {
        self.annot_format6 = enabled;
    }

    pub fn annot_format6(&self) -> bool {
        self.annot_format6
    }

    /// Compiled events in the active encoding
    pub fn encode_evts(&self) -> Result<EncodedEvents> {
        let (rec, events) = self.compiled_events()?;
        if self.annot_format6 {
            Ok(EncodedEvents::Format6(events.format6()))
        } else {
            Ok(EncodedEvents::Paired(events.paired(&self.display_layout(rec)?)))
        }
    }

    /// Compiled (clipped) events of the current window
    pub fn fetch_evts(&self) -> Result<Vec<EventRecord>> {
        Ok(self.compiled_events()?.1.records())
    }

    /// Unclipped events of `classes` over the whole recording; empty selects
    /// every class the source knows
    pub fn fetch_all_evts(&self, classes: &[&str]) -> Result<Vec<EventRecord>> {
        self.recording()?;
        let classes: Vec<String> = if classes.is_empty() {
            self.source.annotation_classes()
        } else {
            classes.iter().map(|c| c.to_string()).collect()
        };
        Ok(events::all_records(&self.source.annotations(&classes)?))
    }
}

impl<R: RecordingSource + std::fmt::Debug> std::fmt::Debug for SegmentServer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentServer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("versions", &self.versions)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryRecording;
    use chrono::NaiveTime;

    fn server() -> SegmentServer<InMemoryRecording> {
        let rec = InMemoryRecording::new(NaiveTime::from_hms_opt(22, 0, 0).unwrap(), 120.0)
            .channel("EEG", 100.0, (0..12_000).map(|i| (i % 50) as f64).collect())
            .channel_with_range("EMG", 50.0, vec![1.0; 6_000], -1.0, 1.0, "uV")
            .annotation("arousal", 10.0, 20.0);
        SegmentServer::with_default_config(rec)
    }

    #[test]
    fn test_reads_need_a_window() {
        let mut srv = server();
        assert_eq!(srv.state(), ServerState::Unpopulated);
        assert!(matches!(
            srv.set_window(0.0, 10.0),
            Err(SegsrvError::Unready(_))
        ));

        srv.populate(&["EEG", "EMG"], &["arousal"]).unwrap();
        assert_eq!(srv.state(), ServerState::Populated);
        assert!(matches!(
            srv.get_signal(&SignalRequest::new()),
            Err(SegsrvError::Unready(_))
        ));

        assert!(srv.set_window(0.0, 10.0).unwrap());
        assert_eq!(srv.state(), ServerState::Windowed);
        assert!(srv.get_signal(&SignalRequest::new()).is_ok());

        srv.drop_recording();
        assert_eq!(srv.state(), ServerState::Unpopulated);
    }

    #[test]
    fn test_populate_skips_bad_channels() {
        let mut srv = server();
        let report = srv.populate(&["EEG", "ECG", "EEG"], &["arousal", "spindle"]).unwrap();
        assert_eq!(report.loaded, vec!["EEG"]);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.annotation_classes, vec!["arousal"]);

        assert!(srv.populate(&["ECG"], &[]).is_err());
        assert_eq!(srv.state(), ServerState::Unpopulated);
    }

    #[test]
    fn test_invalid_windows_reported() {
        let mut srv = server();
        srv.populate(&["EEG"], &[]).unwrap();
        assert!(!srv.set_window(50.0, 50.0).unwrap());
        assert_eq!(srv.window_status(), WindowStatus::Empty);
        assert!(!srv.is_window_valid());

        assert!(srv.set_window(-5.0, 500.0).unwrap());
        assert_eq!(srv.window().unwrap().right, 120.0);
        assert!(srv.window().unwrap().clamped);
        assert_eq!(srv.get_window_left_hms().unwrap(), "22:00:00");
        assert_eq!(srv.get_window_right_hms().unwrap(), "22:02:00");
    }

    #[test]
    fn test_features_go_stale() {
        let mut srv = server();
        srv.populate(&["EEG", "EMG"], &[]).unwrap();
        srv.set_window(0.0, 120.0).unwrap();
        srv.calc_hjorths(&["EEG"]).unwrap();
        assert_eq!(srv.get_hjorths("EEG").unwrap().nrows(), 4);
        assert!(srv.get_hjorths("EMG").is_err());
        assert!(srv.get_bands("EEG").is_err());

        srv.set_epoch_size(20.0).unwrap();
        assert!(matches!(
            srv.get_hjorths("EEG"),
            Err(SegsrvError::Unready(_))
        ));
        srv.calc_hjorths(&[]).unwrap();
        assert_eq!(srv.get_hjorths("EMG").unwrap().nrows(), 6);

        srv.update_signal("EMG", vec![0.5; 6_000]).unwrap();
        assert!(srv.get_hjorths("EMG").is_err());
    }

    #[test]
    fn test_idle_cancel_does_not_abort_next_computation() {
        let mut srv = server();
        srv.populate(&["EEG"], &[]).unwrap();
        srv.set_window(0.0, 120.0).unwrap();
        srv.calc_hjorths(&["EEG"]).unwrap();
        srv.cancel_handle().cancel();
        srv.calc_bands(&["EEG"]).unwrap();
        assert_eq!(srv.get_bands("EEG").unwrap().nrows(), 4);
    }

    #[test]
    fn test_layout_follows_compiled_rows() {
        let mut srv = server();
        srv.populate(&["EEG", "EMG"], &["arousal"]).unwrap();
        srv.set_window(0.0, 120.0).unwrap();
        let emg_level = |srv: &SegmentServer<InMemoryRecording>| {
            let response = srv
                .get_scaled_signal(&SignalRequest::new().channels(["EMG"]))
                .unwrap();
            match &response.channels[0] {
                ChannelSignal::Raw { values, .. } => values[0],
                ChannelSignal::Summarized(_) => panic!("expected raw samples"),
            }
        };

        let before = emg_level(&srv);
        let scale_version = srv.versions().scale;
        srv.compile_evts(&[]).unwrap();
        assert!(srv.versions().scale > scale_version);
        // one annotation row now sits under the lanes and lifts them
        assert!(emg_level(&srv) > before + 0.01);
    }

    #[test]
    fn test_ylabel_and_range() {
        let mut srv = server();
        srv.populate(&["EEG", "EMG"], &[]).unwrap();
        srv.set_window(0.0, 10.0).unwrap();
        srv.fix_physical_scale("EMG", -2.0, 2.0).unwrap();
        assert_eq!(srv.get_ylabel("EMG").unwrap(), "EMG [-2.0, 2.0] uV");
        assert!(matches!(
            srv.scale_mode("EMG").unwrap(),
            ScaleMode::Fixed { .. }
        ));
        assert!(matches!(
            srv.get_ylabel("X"),
            Err(SegsrvError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_insert_signal_extends_window() {
        let mut srv = server();
        srv.populate(&["EEG"], &[]).unwrap();
        srv.set_window(0.0, 10.0).unwrap();
        assert!(srv.insert_signal("DERIVED", vec![0.0; 10], 100.0).is_err());
        srv.insert_signal("DERIVED", vec![0.0; 2_400], 20.0).unwrap();
        assert_eq!(srv.get_timetrack("DERIVED").unwrap().len(), 200);
        assert_eq!(srv.channels().unwrap(), vec!["EEG", "DERIVED"]);
    }
}
