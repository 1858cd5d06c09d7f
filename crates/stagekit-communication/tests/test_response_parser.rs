//! GRBL line classification

use proptest::prelude::*;
use stagekit_communication::firmware::grbl::{
    format_error, GrblResponse, GrblResponseParser, MachineState,
};

#[test]
fn test_status_report_with_feed() {
    let parser = GrblResponseParser::new();
    let Some(GrblResponse::Status(report)) =
        parser.parse("<Home|MPos:-1.000,-2.000,0.000|F:250.0>")
    else {
        panic!("not a status report");
    };
    assert_eq!(report.state, MachineState::Home);
    assert_eq!(report.feed_rate, Some(250.0));
    assert_eq!(report.machine_pos, Some(vec![-1.0, -2.0, 0.0]));
}

#[test]
fn test_error_display_includes_description() {
    let response = GrblResponseParser::new().parse("error:9").unwrap();
    assert_eq!(response.to_string(), format_error(9));
}

#[test]
fn test_malformed_setting_is_a_message() {
    let parser = GrblResponseParser::new();
    assert_eq!(
        parser.parse("$abc=1"),
        Some(GrblResponse::Message("$abc=1".to_string()))
    );
}

proptest! {
    #[test]
    fn prop_parse_never_panics(line in "\\PC{0,64}") {
        let _ = GrblResponseParser::new().parse(&line);
    }

    #[test]
    fn prop_status_coordinates_round_trip(x in -500.0f64..500.0, y in -500.0f64..500.0) {
        let line = format!("<Idle|MPos:{:.3},{:.3},0.000>", x, y);
        match GrblResponseParser::new().parse(&line) {
            Some(GrblResponse::Status(report)) => {
                let mpos = report.machine_pos.unwrap();
                prop_assert!((mpos[0] - x).abs() < 1e-3);
                prop_assert!((mpos[1] - y).abs() < 1e-3);
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}
