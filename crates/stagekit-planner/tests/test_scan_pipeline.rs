//! End-to-end scans through the motion worker and the simulated devices

use image::{Rgb, RgbImage};
use stagekit_core::{Axis, Position, ScanEvent, ScanState};
use stagekit_motion::{HalFactory, MotionCommandThread, MotionHal, SimulatedStage};
use stagekit_planner::{
    shared_imager, ScanMetadata, ScanPipeline, ScanResult, SharedMover, SimulatedImager,
};
use stagekit_settings::{
    ExclusionZone, HdrSettings, ImagerSettings, MotionSettings, PropertyMap, ScanBounds,
    ScanSettings, StackSettings,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn spawn_motion(stage: &SimulatedStage) -> MotionCommandThread {
    let settings = MotionSettings {
        status_period_ms: 20,
        command_timeout_ms: 5000,
        ..MotionSettings::default()
    };
    let stage = stage.clone();
    let hal_settings = settings.clone();
    let factory: HalFactory =
        Box::new(move || MotionHal::new(Box::new(stage.clone()), &hal_settings));
    MotionCommandThread::spawn(factory, &settings).unwrap()
}

fn imager_settings() -> ImagerSettings {
    ImagerSettings {
        view_x_mm: 1.0,
        width_px: 150,
        height_px: 50,
        capture_timeout_ms: 50,
        retry_backoff_ms: 1,
        ..ImagerSettings::default()
    }
}

/// The 2.0 x 1.0 mm rectangle that plans 3 columns by 4 rows
fn reference_scan(dir: &Path) -> ScanSettings {
    let mut scan = ScanSettings {
        bounds: ScanBounds::Contour {
            start: Position::xy(0.0, 0.0),
            end: Position::xy(2.0, 1.0),
        },
        overlap: 0.3,
        ..ScanSettings::default()
    };
    scan.kinematics.motion_settle_ms = 0;
    scan.output.directory = dir.to_path_buf();
    scan
}

fn exposure(us: u64) -> PropertyMap {
    let mut p = PropertyMap::new();
    p.insert("exposure_us".to_string(), serde_json::json!(us));
    p
}

struct Rig {
    stage: SimulatedStage,
    motion: MotionCommandThread,
    imager: SimulatedImager,
}

impl Rig {
    fn new() -> Self {
        let stage = SimulatedStage::xyz();
        let motion = spawn_motion(&stage);
        Self {
            stage,
            motion,
            imager: SimulatedImager::new(150, 50),
        }
    }

    fn pipeline(&self, scan: &ScanSettings) -> ScanPipeline {
        let mover: SharedMover = Arc::new(self.motion.handle());
        ScanPipeline::from_settings(
            scan,
            &imager_settings(),
            mover,
            shared_imager(self.imager.clone()),
        )
        .unwrap()
    }
}

fn is_cell_name(name: &str) -> bool {
    name.len() == "c000_r000.png".len()
        && name.starts_with('c')
        && name[1..4].bytes().all(|b| b.is_ascii_digit())
        && &name[4..6] == "_r"
        && name[6..9].bytes().all(|b| b.is_ascii_digit())
        && name.ends_with(".png")
}

#[test]
fn test_reference_rectangle_writes_twelve_unique_images() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut pipeline = rig.pipeline(&reference_scan(dir.path()));
    assert_eq!(pipeline.images_expected(), 12);

    let outcome = pipeline.run();
    assert!(outcome.is_ok(), "{:?}", outcome.message);
    assert_eq!(outcome.state, ScanState::Completed);
    assert_eq!(outcome.images_captured, 12);
    assert_eq!(rig.stage.moves().len(), 12);

    let metadata = ScanMetadata::load(&outcome.metadata_path.unwrap()).unwrap();
    assert_eq!(metadata.result, Some(ScanResult::Ok));
    assert_eq!(metadata.files.len(), 12);

    let names: HashSet<&str> = metadata.files.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(names.len(), 12);
    assert!(names.iter().all(|n| is_cell_name(n)), "{:?}", names);

    let cells: HashSet<(usize, usize)> = metadata
        .files
        .iter()
        .map(|f| (f.row.unwrap(), f.col.unwrap()))
        .collect();
    assert_eq!(cells.len(), 12);
    for name in names {
        assert!(dir.path().join(name).exists());
    }
}

#[test]
fn test_serpentine_visiting_order() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let outcome = rig.pipeline(&reference_scan(dir.path())).run();
    assert!(outcome.is_ok());

    let xs: Vec<f64> = rig
        .stage
        .moves()
        .iter()
        .take(6)
        .map(|p| p.get(Axis::X).unwrap())
        .collect();
    assert!(xs[0] < xs[1] && xs[1] < xs[2]);
    assert!(xs[3] > xs[4] && xs[4] > xs[5]);
    assert!((xs[2] - xs[3]).abs() < 1e-9);
}

#[test]
fn test_stack_and_hdr_multiply() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut scan = reference_scan(dir.path());
    // 3 columns by 2 rows
    scan.bounds = ScanBounds::Contour {
        start: Position::xy(0.0, 0.0),
        end: Position::xy(2.0, 0.5),
    };
    scan.stacking = Some(StackSettings {
        images: 5,
        distance: 0.4,
        drift_correction: false,
    });
    scan.hdr = Some(HdrSettings {
        properties: vec![exposure(1000), exposure(4000), exposure(16000)],
    });
    scan.output.write_images = false;

    let mut pipeline = rig.pipeline(&scan);
    assert_eq!(
        pipeline.stage_names(),
        vec!["points", "stacker", "hdr", "kinematics", "capture", "save"]
    );
    assert_eq!(pipeline.images_expected(), 90);

    let outcome = pipeline.run();
    assert!(outcome.is_ok(), "{:?}", outcome.message);
    assert_eq!(outcome.images_captured, 90);
    assert_eq!(rig.imager.captures(), 90);

    let metadata = ScanMetadata::load(&outcome.metadata_path.unwrap()).unwrap();
    let names: HashSet<&str> = metadata.files.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(names.len(), 90);
    assert!(names.contains("c000_r000_z00_h00.png"));
    assert!(names.contains("c002_r001_z04_h02.png"));

    // Exposure restored and focus back where it started
    assert_eq!(
        rig.imager.properties().get("exposure_us"),
        Some(&serde_json::json!(10_000))
    );
    let z = rig.stage.device_position().get(Axis::Z).unwrap();
    assert!(z.abs() < 1e-6);
}

#[test]
fn test_stop_ends_scan_early() {
    let dir = tempfile::tempdir().unwrap();
    let stage = SimulatedStage::xyz();
    let motion = spawn_motion(&stage);
    let mut scan = reference_scan(dir.path());
    scan.output.write_images = false;

    let mover: SharedMover = Arc::new(motion.handle());
    let imager = SimulatedImager::new(150, 50);
    let mut pipeline = ScanPipeline::from_settings(
        &scan,
        &imager_settings(),
        mover,
        shared_imager(imager.clone()),
    )
    .unwrap();

    let control = pipeline.control();
    let imager = imager.with_source(Box::new(move |n| {
        if n == 4 {
            control.stop();
        }
        RgbImage::new(150, 50)
    }));

    let outcome = pipeline.run();
    assert_eq!(outcome.result, ScanResult::Stopped);
    assert_eq!(outcome.state, ScanState::Stopped);
    // The fifth frame was captured but the stop is seen before it is saved
    assert_eq!(imager.captures(), 5);
    assert_eq!(outcome.images_captured, 4);
    assert_eq!(stage.moves().len(), 5);

    let metadata = ScanMetadata::load(&outcome.metadata_path.unwrap()).unwrap();
    assert_eq!(metadata.result, Some(ScanResult::Stopped));
    assert_eq!(metadata.images_captured, 4);
    assert_eq!(metadata.files.len(), 4);
}

#[test]
fn test_pause_holds_and_resume_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut scan = reference_scan(dir.path());
    scan.kinematics.motion_settle_ms = 20;
    scan.output.write_images = false;

    let handle = rig.pipeline(&scan).spawn().unwrap();
    std::thread::sleep(Duration::from_millis(60));
    handle.pause();
    assert_eq!(handle.state(), ScanState::Paused);

    // Let the step in flight reach its checkpoint
    std::thread::sleep(Duration::from_millis(150));
    let held = rig.imager.captures();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(rig.imager.captures(), held);
    assert!(held < 12);

    handle.resume();
    assert_eq!(handle.state(), ScanState::Running);
    let outcome = handle.join().unwrap();
    assert!(outcome.is_ok(), "{:?}", outcome.message);
    assert_eq!(outcome.images_captured, 12);
}

#[test]
fn test_progress_events() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut pipeline = rig.pipeline(&reference_scan(dir.path()));
    let mut events = pipeline.subscribe();
    assert!(pipeline.run().is_ok());

    let mut progress = 0;
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ScanEvent::Progress {
                captured,
                expected,
                filename,
            } => {
                progress += 1;
                assert_eq!(captured, progress);
                assert_eq!(expected, 12);
                assert!(filename.is_some());
            }
            ScanEvent::StateChanged(state) => states.push(state),
            ScanEvent::Warning(_) => {}
        }
    }
    assert_eq!(progress, 12);
    assert_eq!(states, vec![ScanState::Running, ScanState::Completed]);
}

#[test]
fn test_declined_homing_aborts_before_motion() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut pipeline = rig
        .pipeline(&reference_scan(dir.path()))
        .with_homing(Some(Box::new(|| false)));

    let outcome = pipeline.run();
    assert_eq!(outcome.result, ScanResult::Exception);
    assert_eq!(outcome.state, ScanState::Failed);
    assert!(outcome.message.unwrap().contains("Homing aborted"));
    assert!(rig.stage.moves().is_empty());
    assert_eq!(rig.stage.home_count(), 0);
}

#[test]
fn test_confirmed_homing_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut pipeline = rig
        .pipeline(&reference_scan(dir.path()))
        .with_homing(Some(Box::new(|| true)));
    assert!(pipeline.run().is_ok());
    assert_eq!(rig.stage.home_count(), 1);
}

#[test]
fn test_exclusions_only_log_count_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut scan = reference_scan(dir.path());
    scan.exclusions = vec![ExclusionZone {
        row_min: 0,
        row_max: 0,
        col_min: 0,
        col_max: 0,
    }];
    scan.output.write_images = false;

    let mut pipeline = rig.pipeline(&scan);
    let mut events = pipeline.subscribe();
    let outcome = pipeline.run();
    assert!(outcome.is_ok(), "{:?}", outcome.message);
    assert_eq!(outcome.images_expected, 12);
    assert_eq!(outcome.images_captured, 11);

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        warned |= matches!(event, ScanEvent::Warning(_));
    }
    assert!(warned);
}

#[test]
fn test_count_mismatch_is_fatal_without_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut scan = reference_scan(dir.path());
    scan.exclusions = vec![ExclusionZone {
        row_min: 3,
        row_max: 3,
        col_min: 0,
        col_max: 2,
    }];
    scan.output.write_images = false;

    let outcome = rig.pipeline(&scan).tolerate_count_mismatch(false).run();
    assert_eq!(outcome.result, ScanResult::Exception);
    assert_eq!(
        outcome.message.as_deref(),
        Some("Captured 9 images but expected 12")
    );
}

#[test]
fn test_capture_timeouts_fail_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    rig.imager.fail_next_captures(100);
    let outcome = rig.pipeline(&reference_scan(dir.path())).run();

    assert_eq!(outcome.result, ScanResult::Exception);
    assert_eq!(outcome.images_captured, 0);
    assert!(outcome
        .message
        .unwrap()
        .contains("Image capture failed after 3 attempts"));

    let metadata = ScanMetadata::load(&outcome.metadata_path.unwrap()).unwrap();
    assert_eq!(metadata.result, Some(ScanResult::Exception));
}

#[test]
fn test_drift_follows_sharpest_plane() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let mut scan = reference_scan(dir.path());
    scan.stacking = Some(StackSettings {
        images: 3,
        distance: 0.2,
        drift_correction: true,
    });
    scan.output.write_images = false;

    // Contrast grows with Z, so the top plane is always the sharpest
    let stage = rig.stage.clone();
    let _imager = rig.imager.clone().with_source(Box::new(move |_| {
        let z = stage.device_position().get(Axis::Z).unwrap_or(0.0);
        let amplitude = ((z + 1.0) * 100.0).clamp(0.0, 255.0) as u8;
        RgbImage::from_fn(150, 50, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([amplitude, amplitude, amplitude])
            }
        })
    }));

    let mut pipeline = rig.pipeline(&scan);
    assert!(pipeline.stage_names().contains(&"stack_drift".to_string()));
    let outcome = pipeline.run();
    assert!(outcome.is_ok(), "{:?}", outcome.message);
    assert_eq!(outcome.images_captured, 36);

    let metadata = ScanMetadata::load(&outcome.metadata_path.unwrap()).unwrap();
    let offset = metadata.stage("stack_drift").unwrap().details["offset"]
        .as_f64()
        .unwrap();
    // One plane spacing per stack
    assert!((offset - 1.2).abs() < 1e-6, "offset {}", offset);

    // Later stacks are centered higher
    let last_plane = metadata
        .files
        .iter()
        .rev()
        .find(|f| f.stack_index == Some(2))
        .unwrap();
    assert_eq!(last_plane.row, Some(3));
    assert!(rig.stage.device_position().get(Axis::Z).unwrap().abs() < 1e-6);
}
