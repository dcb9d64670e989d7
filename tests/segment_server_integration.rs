use chrono::NaiveTime;
use segsrv::{
    AnnotationInstance, ChannelSignal, EncodedEvents, InMemoryRecording, Resolution, ScaleMode,
    Segment, SegmentServer, SegsrvError, ServerConfig, ServerState, SignalRequest, SummaryReason,
    WindowStatus,
};
use std::f64::consts::PI;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sine(freq: f64, amp: f64, sr: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| amp * (2.0 * PI * freq * i as f64 / sr).sin())
        .collect()
}

/// Two segments, [0, 300) and [310, 600), with a 10 s gap between them
fn gapped_recording() -> InMemoryRecording {
    let mut eeg = sine(6.0, 40.0, 100.0, 59_000);
    eeg[12_345] = 5_000.0;
    InMemoryRecording::new(NaiveTime::from_hms_opt(23, 15, 0).unwrap(), 600.0)
        .segments(vec![
            Segment::new(0.0, 300.0, 0.0),
            Segment::new(300.0, 290.0, 310.0),
        ])
        .channel_with_range("EEG", 100.0, eeg, -200.0, 200.0, "uV")
        .channel("EMG", 50.0, sine(20.0, 5.0, 50.0, 29_500))
        .annotation("arousal", 200.0, 260.0)
        .annotation("arousal", 320.0, 330.0)
        .annotation_instance(
            "apnea",
            AnnotationInstance::new(340.0, 400.0).with_meta("value", "0.8"),
        )
        .annotation("apnea", 500.0, 520.0)
}

fn gapped_server() -> SegmentServer<InMemoryRecording> {
    init_logging();
    let mut server = SegmentServer::with_default_config(gapped_recording());
    server
        .populate(&["EEG", "EMG"], &["arousal", "apnea"])
        .expect("populate failed");
    server
}

/// Raw sample counts equal window duration x rate minus the samples in gaps
#[test]
fn test_sample_count_excludes_gaps() {
    let mut server = gapped_server();
    let cases = [
        (0.0, 600.0, 10.0),
        (250.0, 350.0, 10.0),
        (295.5, 312.25, 10.0),
        (10.0, 20.0, 0.0),
        (400.0, 600.0, 0.0),
        (10.009, 20.002, 0.0),
        (295.552, 312.3333, 10.0),
    ];

    for (left, right, gap) in cases {
        assert!(server.set_window(left, right).unwrap());
        let response = server.get_signal(&SignalRequest::new()).unwrap();
        assert!(response.resolution.is_raw());
        for (label, sr) in [("EEG", 100.0), ("EMG", 50.0)] {
            let expected = ((right - left - gap) * sr).round() as usize;
            let signal = response.channel(label).unwrap();
            assert_eq!(
                signal.raw_len(),
                expected,
                "{} over [{}, {})",
                label,
                left,
                right
            );
            if let ChannelSignal::Raw { time, .. } = signal {
                assert_eq!(time.len(), expected);
                assert!(time.iter().all(|&t| t < 300.0 - 1e-9 || t >= 310.0 - 1e-9));
            }
        }
    }
}

/// Changing throttles never moves durations, gaps or epoch boundaries
#[test]
fn test_policy_changes_leave_time_base_alone() {
    let mut server = gapped_server();
    server.set_window(250.0, 350.0).unwrap();
    let before = (
        server.get_total_sec().unwrap(),
        server.get_total_sec_original().unwrap(),
        server.get_gaps().unwrap(),
        server.epoch_grid().unwrap(),
    );

    server.throttle(10).unwrap();
    server.input_throttle(100).unwrap();
    server.summary_threshold_mins(0.5).unwrap();
    assert!(!server.serve_raw_signals().unwrap());

    let after = (
        server.get_total_sec().unwrap(),
        server.get_total_sec_original().unwrap(),
        server.get_gaps().unwrap(),
        server.epoch_grid().unwrap(),
    );
    assert_eq!(before, after);
    assert_eq!(after.0, 600.0);
    assert_eq!(after.1, 590.0);

    assert!(matches!(server.throttle(0), Err(SegsrvError::Configuration(_))));
    assert!(matches!(
        server.summary_threshold_mins(-1.0),
        Err(SegsrvError::Configuration(_))
    ));
}

#[test]
fn test_nepochs_bounds() {
    let mut server = gapped_server();
    for (left, right) in [(0.0, 600.0), (250.0, 350.0), (12.5, 47.3), (0.0, 29.9)] {
        server.set_window(left, right).unwrap();
        for epoch in [1.0, 7.5, 30.0, 45.0] {
            server.set_epoch_size(epoch).unwrap();
            let n = server.nepochs().unwrap() as f64;
            let duration = right - left;
            assert!(n * epoch <= duration + 1e-9);
            assert!(duration < (n + 1.0) * epoch);
        }
    }
    assert!(server.set_epoch_size(0.0).is_err());
    assert!(server.set_epoch_size(f64::NAN).is_err());
}

/// Events are clipped exactly to the window; outside events are absent
#[test]
fn test_event_clipping_round_trip() {
    let mut server = gapped_server();
    server.set_window(250.0, 350.0).unwrap();
    assert_eq!(server.compile_evts(&[]).unwrap(), 3);

    assert_eq!(server.get_evnts_xaxes("arousal").unwrap(), vec![250.0, 320.0]);
    assert_eq!(
        server.get_evnts_xaxes_ends("arousal").unwrap(),
        vec![260.0, 330.0]
    );
    assert_eq!(server.get_evnts_xaxes("apnea").unwrap(), vec![340.0]);
    assert_eq!(server.get_evnts_xaxes_ends("apnea").unwrap(), vec![350.0]);

    let y = server.get_evnts_yaxes("apnea").unwrap();
    let y_ends = server.get_evnts_yaxes_ends("apnea").unwrap();
    assert_eq!(y.len(), 1);
    assert!(y[0] < y_ends[0]);
    // arousal is row 0, directly above apnea
    assert!(server.get_evnts_yaxes("arousal").unwrap()[0] >= y_ends[0] - 1e-12);

    let fetched = server.fetch_evts().unwrap();
    assert_eq!(fetched.len(), 3);
    assert!(fetched.iter().all(|e| e.start >= 250.0 && e.stop <= 350.0));

    let all = server.fetch_all_evts(&[]).unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[2].stop, 400.0);

    // moving the window makes the compiled set stale
    server.set_window(0.0, 100.0).unwrap();
    assert!(matches!(
        server.get_evnts_xaxes("arousal"),
        Err(SegsrvError::Unready(_))
    ));
    assert_eq!(server.compile_evts(&["arousal"]).unwrap(), 0);
    assert!(server.get_evnts_xaxes("arousal").unwrap().is_empty());
}

#[test]
fn test_format6_encoding() {
    let mut server = gapped_server();
    server.set_window(250.0, 350.0).unwrap();
    server.compile_evts(&["arousal", "apnea"]).unwrap();

    assert!(matches!(
        server.encode_evts().unwrap(),
        EncodedEvents::Paired(_)
    ));

    server.set_annot_format6(true);
    let EncodedEvents::Format6(flat) = server.encode_evts().unwrap() else {
        panic!("expected format-6 records");
    };
    assert_eq!(flat.len(), 18);
    // arousal clipped on the left
    assert_eq!(&flat[0..4], &[0.0, 250.0, 260.0, 0.0]);
    assert!(flat[4].is_nan());
    assert_eq!(flat[5], 1.0);
    // apnea carries its value and is clipped on the right
    assert_eq!(&flat[12..], &[1.0, 340.0, 350.0, 1.0, 0.8, 2.0]);
}

/// FREE ranges bound every in-window sample when no trimming is configured
#[test]
fn test_free_range_bounds_window_samples() {
    init_logging();
    let config = ServerConfig {
        robust_percentile: 0.0,
        ..ServerConfig::default()
    };
    let mut server = SegmentServer::new(gapped_recording(), config).unwrap();
    server.populate(&["EEG"], &[]).unwrap();
    server.free_physical_scale("EEG").unwrap();

    for (left, right) in [(100.0, 130.0), (120.0, 125.0), (290.0, 320.0)] {
        server.set_window(left, right).unwrap();
        let range = server.get_window_phys_range("EEG").unwrap();
        let response = server.get_signal(&SignalRequest::new()).unwrap();
        let ChannelSignal::Raw { values, .. } = &response.channels[0] else {
            panic!("expected raw samples");
        };
        assert!(values.iter().all(|&v| range.contains(v)));
    }

    // the artifact at sample 12345 (t = 123.45) sets the max when in view
    server.set_window(120.0, 125.0).unwrap();
    assert_eq!(server.get_window_phys_range("EEG").unwrap().max, 5_000.0);
    server.set_window(100.0, 110.0).unwrap();
    assert!(server.get_window_phys_range("EEG").unwrap().max < 41.0);
}

#[test]
fn test_robust_range_ignores_single_artifact() {
    let mut server = gapped_server();
    server.set_window(120.0, 125.0).unwrap();
    assert_eq!(server.scale_mode("EEG").unwrap(), ScaleMode::Empirical);
    let empirical = server.get_window_phys_range("EEG").unwrap();
    assert!(empirical.max < 41.0);

    server.free_physical_scale("EEG").unwrap();
    let free = server.get_window_phys_range("EEG").unwrap();
    let response = server
        .get_signal(&SignalRequest::new().channels(["EEG"]))
        .unwrap();
    let ChannelSignal::Raw { values, .. } = &response.channels[0] else {
        panic!("expected raw samples");
    };
    let inside = values.iter().filter(|&&v| free.contains(v)).count();
    assert!(inside as f64 >= 0.98 * values.len() as f64);
}

#[test]
fn test_scaled_signal_stays_in_lanes() {
    let mut server = gapped_server();
    server.set_window(0.0, 60.0).unwrap();
    server.fix_physical_scale("EMG", -5.0, 5.0).unwrap();
    let response = server
        .get_scaled_signal(&SignalRequest::new())
        .unwrap();
    assert!(response.scaled);

    let lanes: Vec<(f64, f64)> = response
        .channels
        .iter()
        .map(|c| match c {
            ChannelSignal::Raw { values, .. } => values
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                }),
            ChannelSignal::Summarized(_) => panic!("expected raw samples"),
        })
        .collect();
    // EEG lane sits above EMG, both inside [0, 1]
    assert!(lanes[0].0 >= lanes[1].1 - 1e-12);
    assert!(lanes.iter().all(|&(lo, hi)| lo >= 0.0 && hi <= 1.0));
}

/// Window [250, 350) over the gapped recording with 30 s epochs
#[test]
fn test_gapped_window_scenario() {
    let mut server = gapped_server();
    assert!(server.set_window(250.0, 350.0).unwrap());
    assert_eq!(server.get_gaps().unwrap(), vec![(300.0, 310.0)]);

    server.set_epoch_size(30.0).unwrap();
    assert_eq!(server.nepochs().unwrap(), 3);
    let grid = server.epoch_grid().unwrap();
    let partial = grid.partial.expect("partial epoch");
    assert_eq!((partial.start, partial.end), (340.0, 350.0));

    server.calc_bands(&["EEG"]).unwrap();
    server.calc_hjorths(&["EEG", "EMG"]).unwrap();
    let bands = server.get_bands("EEG").unwrap();
    let hjorths = server.get_hjorths("EMG").unwrap();
    assert_eq!(bands.nrows(), 3);
    assert_eq!(hjorths.nrows(), 3);

    for (i, epoch) in grid.epochs.iter().enumerate() {
        let overlaps_gap = epoch.start < 310.0 && epoch.end > 300.0;
        assert_eq!(bands.rows[i].iter().all(|v| v.is_nan()), overlaps_gap);
        assert_eq!(hjorths.rows[i].iter().all(|v| v.is_nan()), overlaps_gap);
    }
    assert!(bands.column("THETA").unwrap()[0] > 100.0);

    let stats = server.get_summary_stats("EEG").unwrap();
    assert_eq!(stats.epochs.len(), 3);
    assert_eq!(stats.epochs[1].count, 2_000);
    assert!(stats.partial.is_some());
    assert_eq!(
        server.get_summary_timetrack().unwrap(),
        vec![(250.0, 280.0), (280.0, 310.0), (310.0, 340.0)]
    );
}

/// A 10 minute window over a 5 minute threshold is served as summaries
#[test]
fn test_long_window_is_summarized() {
    init_logging();
    let rec = InMemoryRecording::new(NaiveTime::from_hms_opt(0, 0, 0).unwrap(), 600.0)
        .channel("EEG", 100.0, sine(10.0, 20.0, 100.0, 60_000));
    let mut server = SegmentServer::with_default_config(rec);
    server.populate(&["EEG"], &[]).unwrap();
    server.summary_threshold_mins(5.0).unwrap();
    server.set_window(0.0, 600.0).unwrap();

    assert!(!server.serve_raw_signals().unwrap());
    let response = server.get_signal(&SignalRequest::new()).unwrap();
    assert!(response.is_summarized());
    assert!(matches!(
        response.resolution,
        Resolution::Summarized(SummaryReason::WindowTooLong { .. })
    ));
    match &response.channels[0] {
        ChannelSignal::Summarized(summary) => {
            assert_eq!(summary.epochs.len(), 20);
            assert!(summary.epochs.iter().all(|e| e.count == 3_000));
        }
        ChannelSignal::Raw { .. } => panic!("raw samples served above the threshold"),
    }

    // the same window under a cap is summarized for a different reason
    server.summary_threshold_mins(30.0).unwrap();
    server.throttle(10_000).unwrap();
    let response = server.get_scaled_signal(&SignalRequest::new()).unwrap();
    assert!(matches!(
        response.resolution,
        Resolution::Summarized(SummaryReason::SampleCapExceeded {
            projected: 60_000,
            cap: 10_000
        })
    ));

    server.set_window(0.0, 60.0).unwrap();
    assert!(server.serve_raw_signals().unwrap());
}

/// Summaries in a scaled response are in display units, not physical ones
#[test]
fn test_scaled_summary_is_projected_into_lane() {
    let rec = InMemoryRecording::new(NaiveTime::from_hms_opt(0, 0, 0).unwrap(), 600.0)
        .channel("EEG", 100.0, sine(10.0, 20.0, 100.0, 60_000));
    let mut server = SegmentServer::with_default_config(rec);
    server.populate(&["EEG"], &[]).unwrap();
    server.summary_threshold_mins(5.0).unwrap();
    server.fix_physical_scale("EEG", -40.0, 40.0).unwrap();
    server.set_window(0.0, 600.0).unwrap();

    let response = server.get_scaled_signal(&SignalRequest::new()).unwrap();
    assert!(response.scaled);
    assert!(response.is_summarized());
    let ChannelSignal::Summarized(summary) = &response.channels[0] else {
        panic!("expected a summarized channel");
    };
    assert_eq!(summary.epochs.len(), 20);
    // single lane spans [0, 0.95] below the header
    for epoch in &summary.epochs {
        assert_eq!(epoch.count, 3_000);
        assert!(0.0 <= epoch.min && epoch.min <= epoch.mean);
        assert!(epoch.mean <= epoch.max && epoch.max <= 0.95);
        assert!((epoch.mean - 0.475).abs() < 1e-3);
        assert!(epoch.max < 0.75 && epoch.min > 0.2);
    }

    let physical = server.get_signal(&SignalRequest::new()).unwrap();
    assert!(!physical.scaled);
    let ChannelSignal::Summarized(summary) = &physical.channels[0] else {
        panic!("expected a summarized channel");
    };
    assert!(summary.epochs.iter().all(|e| e.min < -15.0 && e.max > 15.0));
}

#[test]
fn test_window_inside_gap_is_reported() {
    let mut server = gapped_server();
    assert!(!server.set_window(301.0, 309.0).unwrap());
    assert_eq!(server.window_status(), WindowStatus::NoData);
    assert_eq!(server.state(), ServerState::Populated);
    assert!(matches!(
        server.get_signal(&SignalRequest::new()),
        Err(SegsrvError::Unready(_))
    ));
}

#[test]
fn test_refresh_returns_to_unpopulated() {
    let mut server = gapped_server();
    server.set_window(0.0, 100.0).unwrap();
    server.calc_hjorths(&[]).unwrap();
    server.refresh().unwrap();
    assert_eq!(server.state(), ServerState::Unpopulated);
    assert!(matches!(
        server.get_hjorths("EEG"),
        Err(SegsrvError::Unready(_))
    ));

    server.populate(&["EEG"], &[]).unwrap();
    server.set_window(0.0, 100.0).unwrap();
    assert!(server.get_hjorths("EEG").is_err());
}

#[test]
fn test_clock_accessors() {
    let mut server = gapped_server();
    assert!(!server.set_window(2_700.0, 3_000.0).unwrap());
    assert_eq!(server.window_status(), WindowStatus::Empty);
    assert!(server.set_window(-50.0, 3_000.0).unwrap());
    assert_eq!(server.get_window_left().unwrap(), 0.0);
    assert_eq!(server.get_window_right().unwrap(), 600.0);
    server.set_window(60.0, 120.0).unwrap();
    assert_eq!(server.get_window_left_hms().unwrap(), "23:16:00");
    assert_eq!(server.get_window_right_hms().unwrap(), "23:17:00");
    let ticks = server.get_clock_ticks(3).unwrap();
    assert_eq!(ticks[1].label, "23:16:30");
    // recording ends at 23:25, before the next whole hour
    assert!(server.get_hour_ticks().unwrap().is_empty());
}

#[test]
fn test_config_from_json() {
    let config = ServerConfig::from_json_str(
        r#"{ "epoch_size_secs": 10.0, "summary_threshold_mins": 2.0, "raw_sample_cap": null }"#,
    )
    .unwrap();
    let mut server = SegmentServer::new(gapped_recording(), config).unwrap();
    server.populate(&["EEG"], &[]).unwrap();
    server.set_window(0.0, 100.0).unwrap();
    assert_eq!(server.nepochs().unwrap(), 10);
    assert!(server.serve_raw_signals().unwrap());
    server.set_window(0.0, 200.0).unwrap();
    assert!(!server.serve_raw_signals().unwrap());
}
