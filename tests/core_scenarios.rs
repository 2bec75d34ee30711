//! End-to-end scenarios against the mock backend.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pi_cam_server::mock::{integer_control, menu_control, MockCamera, MockOpener};
use pi_cam_server::validation::is_complete_jpeg;
use pi_cam_server::config::TimelapseProfile;
use pi_cam_server::{
    Camera, CameraError, Config, FourCC, PipelineState, Resolution, SessionKind, SessionOutcome,
    StreamEvent,
};
use serial_test::serial;

fn camera_for(mock: &MockCamera, config: &Config) -> Camera {
    Camera::new(Arc::new(MockOpener::new().with_camera(mock.clone())), config)
}

fn config_in(dir: &std::path::Path) -> Config {
    Config {
        timelapse_dir: dir.join("timelapse"),
        recording_dir: dir.join("videos"),
        reconfigure_timeout_ms: 1000,
        ..Config::default()
    }
}

#[test]
fn test_defaults_follow_control_kinds() {
    let mock = MockCamera::new("mock://0").with_controls(vec![
        integer_control(1, "brightness", 0, 255, 1),
        menu_control(2, "auto_exposure", &[(0, "manual"), (1, "auto")]),
        integer_control(3, "gain", -7, 0, 1),
    ]);
    let camera = camera_for(&mock, &Config::default());
    camera.open(None).expect("open");

    let brightness = camera.control("brightness").expect("brightness");
    assert_eq!(brightness.default, 127);
    assert_eq!(mock.control_value("brightness"), Some(127));
    assert_eq!(camera.control("auto_exposure").expect("menu").default, 1);
    assert_eq!(camera.control("gain").expect("gain").default, -4);
    camera.shutdown();
}

#[test]
fn test_inverted_bounds_are_not_registered() {
    let mock = MockCamera::new("mock://0").with_controls(vec![
        integer_control(1, "brightness", 0, 255, 1),
        integer_control(2, "focus_absolute", 10, 0, 1),
    ]);
    let camera = camera_for(&mock, &Config::default());
    camera.open(None).expect("open");

    let status = camera.status();
    assert_eq!(status.controls.len(), 1);
    assert!(status
        .unsupported_controls
        .iter()
        .any(|skipped| skipped.name == "focus_absolute"));
    assert!(matches!(
        camera.set_control("focus_absolute", 5),
        Err(CameraError::UnknownControl(_))
    ));
    camera.shutdown();
}

#[test]
fn test_out_of_range_leaves_value_unchanged() {
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &Config::default());
    camera.open(None).expect("open");
    camera.set_control("brightness", 90).expect("in range");

    for value in [-1, 256, i64::MAX] {
        assert!(matches!(
            camera.set_control("brightness", value),
            Err(CameraError::OutOfRange { .. })
        ));
    }
    assert!(matches!(
        camera.set_control("power_line_frequency", 7),
        Err(CameraError::OutOfRange { .. })
    ));
    assert_eq!(camera.control("brightness").expect("brightness").current, 90);
    assert_eq!(mock.control_value("brightness"), Some(90));
    camera.shutdown();
}

#[test]
fn test_reset_skips_refused_controls() {
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &Config::default());
    camera.open(None).expect("open");
    camera.set_control("brightness", 3).expect("set");
    camera.set_control("exposure_time_absolute", 5).expect("set");
    mock.reject_control("power_line_frequency");

    let report = camera.reset_controls().expect("reset completes");
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(
        report.skipped.first().map(|skipped| skipped.name.as_str()),
        Some("power_line_frequency")
    );
    assert_eq!(mock.control_value("brightness"), Some(127));
    assert_eq!(mock.control_value("exposure_time_absolute"), Some(1025));
    assert_eq!(mock.control_value("auto_exposure"), Some(3));
    assert_eq!(camera.control("brightness").expect("brightness").current, 127);
    camera.shutdown();
}

#[test]
fn test_resolution_switch_is_reported_by_status() {
    let mock = MockCamera::new("mock://0").with_resolutions(vec![
        Resolution::new(FourCC::MJPG, 1920, 1080),
        Resolution::new(FourCC::MJPG, 1280, 720),
    ]);
    let camera = camera_for(&mock, &Config::default());
    camera.open(None).expect("open");
    assert_eq!(camera.status().resolutions.len(), 2);

    let target = Resolution::new(FourCC::MJPG, 1280, 720);
    camera.set_resolution(&target).expect("switch");
    let status = camera.status();
    assert_eq!(status.resolution, Some(target));

    let mut subscriber = camera.subscribe();
    let frame = loop {
        match subscriber.next(Duration::from_secs(2)) {
            Some(StreamEvent::Frame(frame)) if frame.resolution == target => break frame,
            Some(StreamEvent::Frame(_)) => continue,
            other => panic!("expected a frame, got {other:?}"),
        }
    };
    assert_eq!((frame.resolution.width, frame.resolution.height), (1280, 720));
    camera.shutdown();
}

#[test]
fn test_unsupported_switch_keeps_previous_resolution() {
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &Config::default());
    camera.open(None).expect("open");
    let before = camera.status().resolution;
    let opens = mock.open_count();

    let result = camera.set_resolution(&Resolution::new(FourCC::YUYV, 4096, 2160));
    assert!(matches!(result, Err(CameraError::UnsupportedResolution(_))));
    assert_eq!(camera.status().resolution, before);
    assert_eq!(mock.open_count(), opens);
    camera.shutdown();
}

#[test]
#[serial]
fn test_timelapse_writes_three_snapshots_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &config);
    camera.open(None).expect("open");

    camera.start_timelapse(Duration::from_millis(200)).expect("start");
    assert!(matches!(
        camera.start_timelapse(Duration::from_millis(200)),
        Err(CameraError::AlreadyRunning(SessionKind::Timelapse))
    ));
    thread::sleep(Duration::from_millis(700));
    camera.stop_timelapse();
    camera.stop_timelapse();

    let mut names: Vec<String> = fs::read_dir(&config.timelapse_dir)
        .expect("timelapse dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 3, "snapshots: {names:?}");

    names.sort();
    for (seq, name) in names.iter().enumerate() {
        assert!(name.ends_with(&format!("_{seq:06}.jpg")), "unexpected name {name}");
        let bytes = fs::read(config.timelapse_dir.join(name)).expect("snapshot");
        assert!(is_complete_jpeg(&bytes));
    }

    let status = camera.status().sessions.timelapse;
    assert_eq!(status.frames_written, 3);
    assert_eq!(status.last_outcome, Some(SessionOutcome::Completed));
    camera.shutdown();
}

#[test]
#[serial]
fn test_concurrent_viewers_survive_resolution_switches() {
    let mock = MockCamera::new("mock://0");
    let camera = Arc::new(camera_for(&mock, &Config::default()));
    camera.open(None).expect("open");

    let viewers: Vec<_> = (0..10)
        .map(|_| {
            let camera = Arc::clone(&camera);
            thread::spawn(move || {
                let mut subscriber = camera.subscribe();
                let deadline = Instant::now() + Duration::from_millis(800);
                let mut received = 0u32;
                while Instant::now() < deadline {
                    match subscriber.next(Duration::from_millis(500)) {
                        Some(StreamEvent::Frame(frame)) => {
                            assert!(is_complete_jpeg(&frame.jpeg), "torn frame");
                            received += 1;
                        }
                        Some(StreamEvent::Ended(reason)) => panic!("stream ended: {reason}"),
                        None => {}
                    }
                }
                received
            })
        })
        .collect();

    let targets = [
        Resolution::new(FourCC::YUYV, 640, 480),
        Resolution::new(FourCC::MJPG, 1280, 720),
        Resolution::new(FourCC::MJPG, 1920, 1080),
    ];
    for target in &targets {
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        camera.set_resolution(target).expect("switch");
        assert!(started.elapsed() < Duration::from_secs(2), "switch stalled");
    }

    for viewer in viewers {
        let received = viewer.join().expect("viewer thread");
        assert!(received > 0);
    }
    assert_eq!(
        camera.status().resolution,
        Some(Resolution::new(FourCC::MJPG, 1920, 1080))
    );
    camera.shutdown();
}

#[test]
fn test_persistent_capture_failure_ends_stream_until_reset() {
    let mock = MockCamera::new("mock://0");
    let config = Config {
        max_capture_retries: 3,
        retry_delay_ms: 1,
        ..Config::default()
    };
    let camera = camera_for(&mock, &config);
    camera.open(None).expect("open");
    let mut subscriber = camera.subscribe();

    mock.fail_all_reads(true);
    let ended = loop {
        match subscriber.next(Duration::from_secs(2)) {
            Some(StreamEvent::Frame(_)) => continue,
            Some(StreamEvent::Ended(reason)) => break reason,
            None => panic!("viewer blocked without end-of-stream"),
        }
    };
    assert!(ended.contains("capture error"));
    let status = camera.status();
    assert_eq!(status.pipeline.state, PipelineState::Failed);
    assert!(status.pipeline.last_error.is_some());

    mock.fail_all_reads(false);
    camera.reset_controls().expect("reset reopens the device");
    assert_eq!(camera.status().pipeline.state, PipelineState::Running);
    let mut subscriber = camera.subscribe();
    assert!(matches!(
        subscriber.next(Duration::from_secs(2)),
        Some(StreamEvent::Frame(_))
    ));
    camera.shutdown();
}

#[test]
#[serial]
fn test_losing_the_device_aborts_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &config_in(dir.path()));
    camera.open(None).expect("open");
    camera.start_recording().expect("recording");
    camera.start_timelapse(Duration::from_secs(30)).expect("timelapse");

    mock.set_present(false);
    let result = camera.set_resolution(&Resolution::new(FourCC::MJPG, 1280, 720));
    assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));

    let status = camera.status();
    assert!(status.device.is_none());
    assert!(matches!(
        status.sessions.recording.last_outcome,
        Some(SessionOutcome::Aborted(_))
    ));
    assert!(matches!(
        status.sessions.timelapse.last_outcome,
        Some(SessionOutcome::Aborted(_))
    ));
    assert!(!status.sessions.recording.is_running());
}

#[test]
#[serial]
fn test_sessions_keep_running_across_a_switch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &config_in(dir.path()));
    camera.open(None).expect("open");

    let path = camera.start_recording().expect("recording");
    thread::sleep(Duration::from_millis(100));
    camera
        .set_resolution(&Resolution::new(FourCC::MJPG, 1280, 720))
        .expect("switch");
    let before = camera.status().sessions.recording.frames_written;
    thread::sleep(Duration::from_millis(100));

    let status = camera.status().sessions.recording;
    assert!(status.is_running());
    assert!(status.frames_written > before);
    camera.stop_recording();

    let bytes = fs::read(path).expect("recording file");
    assert!(is_complete_jpeg(&bytes));
    camera.shutdown();
}

#[test]
fn test_shutdown_releases_the_device() {
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &Config::default());
    camera.open(None).expect("open");
    assert!(mock.is_open());

    camera.shutdown();
    assert!(!mock.is_open());
    assert_eq!(camera.status().pipeline.state, PipelineState::Stopped);
    camera.shutdown();
}

#[test]
#[serial]
fn test_timelapse_profile_applies_and_restores_preview() {
    let dir = tempfile::tempdir().expect("tempdir");
    let timelapse_resolution = Resolution::new(FourCC::MJPG, 1280, 720);
    let config = Config {
        timelapse: TimelapseProfile {
            resolution: Some(timelapse_resolution),
            controls: [("brightness".to_owned(), 200), ("zoom".to_owned(), 3)]
                .into_iter()
                .collect(),
        },
        ..config_in(dir.path())
    };
    let mock = MockCamera::new("mock://0");
    let camera = camera_for(&mock, &config);
    camera.open(None).expect("open");
    camera.set_control("brightness", 42).expect("set");
    let preview = camera.status().resolution;

    camera.start_timelapse(Duration::from_secs(30)).expect("start");
    assert_eq!(camera.status().resolution, Some(timelapse_resolution));
    assert_eq!(mock.control_value("brightness"), Some(200));
    assert!(camera.status().sessions.timelapse.is_running());

    camera.stop_timelapse();
    let status = camera.status();
    assert_eq!(status.resolution, preview);
    assert_eq!(mock.active_resolution(), Resolution::new(FourCC::MJPG, 1920, 1080));
    assert_eq!(mock.control_value("brightness"), Some(42));
    assert_eq!(camera.control("brightness").expect("brightness").current, 42);

    camera.stop_timelapse();
    assert_eq!(mock.control_value("brightness"), Some(42));
    camera.shutdown();
}
