//! Modifier chain behavior through the HAL

use proptest::prelude::*;
use stagekit_core::{Axis, AxisRange, Error, MotionError, Position};
use stagekit_motion::{MotionHal, SimulatedStage};
use stagekit_settings::{CompensationDirection, MotionSettings};

fn limited(max: f64) -> MotionSettings {
    let mut s = MotionSettings::default();
    s.soft_limits.insert(Axis::X, AxisRange::new(0.0, max));
    s
}

#[test]
fn test_jog_toward_soft_max_is_clamped_not_rejected() {
    let stage = SimulatedStage::xyz().with_max_velocity(1000.0);
    let mut hal = MotionHal::new(Box::new(stage.clone()), &limited(10.0)).unwrap();
    hal.move_absolute(&Position::new().with(Axis::X, 9.5))
        .unwrap();

    hal.jog_relative(&Position::new().with(Axis::X, 2.0), 500.0)
        .unwrap();
    assert_eq!(hal.jog_estimated_end().unwrap().get(Axis::X), Some(10.0));

    let (delta, _) = stage.jogs().last().cloned().unwrap();
    assert!((delta.get(Axis::X).unwrap() - 0.5).abs() < 1e-9);
}

#[test]
fn test_repeated_jogs_converge_on_soft_limit() {
    let stage = SimulatedStage::xyz().with_max_velocity(1000.0);
    let mut hal = MotionHal::new(Box::new(stage.clone()), &limited(3.0)).unwrap();

    let mut accepted = 0;
    for _ in 0..20 {
        match hal.jog_relative(&Position::new().with(Axis::X, 0.7), 1000.0) {
            Ok(()) => accepted += 1,
            Err(Error::Motion(MotionError::AxisExceeded { axis, max, .. })) => {
                assert_eq!(axis, Axis::X);
                assert_eq!(max, 3.0);
                break;
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    // 0.7 * 4 = 2.8, then a trimmed 0.2, then nothing left
    assert_eq!(accepted, 5);
    assert!((stage.device_position().get(Axis::X).unwrap() - 3.0).abs() < 1e-9);
}

#[test]
fn test_multi_axis_jog_keeps_surviving_axes() {
    let stage = SimulatedStage::xyz();
    let mut hal = MotionHal::new(Box::new(stage.clone()), &limited(1.0)).unwrap();
    hal.move_absolute(&Position::new().with(Axis::X, 1.0))
        .unwrap();

    hal.jog_relative(&Position::xy(0.5, 0.5), 10.0).unwrap();
    let (delta, _) = stage.jogs().last().cloned().unwrap();
    assert!(!delta.contains(Axis::X));
    assert_eq!(delta.get(Axis::Y), Some(0.5));
}

#[test]
fn test_move_while_jogging_is_invalid() {
    let stage = SimulatedStage::xyz().with_max_velocity(1.0);
    let mut hal = MotionHal::new(Box::new(stage), &MotionSettings::default()).unwrap();

    hal.jog_relative(&Position::new().with(Axis::X, 5.0), 0.5)
        .unwrap();
    let err = hal
        .move_absolute(&Position::new().with(Axis::X, 1.0))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Motion(MotionError::InvalidState { .. })
    ));

    hal.jog_cancel().unwrap();
    hal.move_absolute(&Position::new().with(Axis::X, 1.0))
        .unwrap();
}

#[test]
fn test_jog_absolute_composes_with_estimated_end() {
    let stage = SimulatedStage::xyz().with_max_velocity(1.0);
    let mut hal = MotionHal::new(Box::new(stage.clone()), &MotionSettings::default()).unwrap();

    hal.jog_relative(&Position::new().with(Axis::X, 2.0), 0.5)
        .unwrap();
    hal.jog_absolute(&Position::new().with(Axis::X, 3.0), 0.5)
        .unwrap();

    let jogs = stage.jogs();
    assert_eq!(jogs.len(), 2);
    assert!((jogs[1].0.get(Axis::X).unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_backlash_overshoot_passes_through_scalar() {
    let stage = SimulatedStage::xyz();
    let mut s = MotionSettings::default();
    s.backlash.insert(Axis::Y, 0.2);
    s.backlash_compensation
        .insert(Axis::Y, CompensationDirection::Positive);
    s.scalars.insert(Axis::Y, 2.0);
    let mut hal = MotionHal::new(Box::new(stage.clone()), &s).unwrap();

    hal.move_absolute(&Position::new().with(Axis::Y, -1.0))
        .unwrap();
    let moves = stage.moves();
    assert_eq!(moves.len(), 2);
    // Overshoot to -1.2 user, i.e. -2.4 device, then -2.0 device
    assert!((moves[0].get(Axis::Y).unwrap() + 2.4).abs() < 1e-9);
    assert!((moves[1].get(Axis::Y).unwrap() + 2.0).abs() < 1e-9);
    assert!((hal.position().unwrap().get(Axis::Y).unwrap() + 1.0).abs() < 1e-9);
}

proptest! {
    #[test]
    fn prop_moves_inside_limits_land_exactly(x in 0.0f64..10.0, y in -5.0f64..5.0) {
        let stage = SimulatedStage::xyz();
        let mut s = limited(10.0);
        s.backlash.insert(Axis::X, 0.05);
        let mut hal = MotionHal::new(Box::new(stage), &s).unwrap();
        hal.move_absolute(&Position::xy(x, y)).unwrap();
        let pos = hal.position().unwrap();
        prop_assert!((pos.get(Axis::X).unwrap() - x).abs() < 1e-9);
        prop_assert!((pos.get(Axis::Y).unwrap() - y).abs() < 1e-9);
    }
}
