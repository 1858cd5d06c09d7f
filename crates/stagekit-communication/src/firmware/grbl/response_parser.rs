//! GRBL Response Parser
//!
//! Classifies lines received from GRBL: acknowledgments, error and alarm
//! codes, status reports, `$n=value` settings, the startup banner and
//! everything else.

use super::error_decoder::{format_alarm, format_error};
use super::status_parser::StatusReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// GRBL response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GrblResponse {
    /// OK acknowledgment
    Ok,
    /// Error response with error code
    Error(u8),
    /// Alarm response with alarm code
    Alarm(u8),
    /// Status report
    Status(StatusReport),
    /// Setting response ($n=value)
    Setting { number: u16, value: String },
    /// Startup banner, e.g. `Grbl 1.1h ['$' for help]`
    Version(String),
    /// Bracketed feedback message, e.g. `[MSG:Caution: Unlocked]`
    Feedback(String),
    /// Anything else
    Message(String),
}

impl GrblResponse {
    /// Whether this line terminates a command (ok, error or alarm)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Error(_) | Self::Alarm(_))
    }
}

impl fmt::Display for GrblResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(code) => write!(f, "{}", format_error(*code)),
            Self::Alarm(code) => write!(f, "{}", format_alarm(*code)),
            Self::Status(report) => write!(f, "status:{}", report.state),
            Self::Setting { number, value } => write!(f, "setting:${}={}", number, value),
            Self::Version(version) => write!(f, "version:{}", version),
            Self::Feedback(msg) => write!(f, "feedback:{}", msg),
            Self::Message(msg) => write!(f, "message:{}", msg),
        }
    }
}

/// GRBL response parser
#[derive(Debug, Default, Clone, Copy)]
pub struct GrblResponseParser;

impl GrblResponseParser {
    /// Create a new GRBL response parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a GRBL response line
    pub fn parse(&self, line: &str) -> Option<GrblResponse> {
        let line = line.trim();

        if line.is_empty() {
            return None;
        }

        if line == "ok" {
            return Some(GrblResponse::Ok);
        }

        if let Some(code) = strip_code(line, "error:") {
            return Some(GrblResponse::Error(code));
        }

        // GRBL 1.1 uses upper case, 0.9 lower case
        if let Some(code) = strip_code(line, "ALARM:").or_else(|| strip_code(line, "alarm:")) {
            return Some(GrblResponse::Alarm(code));
        }

        if line.starts_with('<') && line.ends_with('>') && line.len() >= 2 {
            return StatusReport::parse(&line[1..line.len() - 1]).map(GrblResponse::Status);
        }

        if line.starts_with('$') && line.contains('=') {
            if let Some(setting) = self.parse_setting(line) {
                return Some(setting);
            }
        }

        if line.starts_with("Grbl ") {
            return Some(GrblResponse::Version(line.to_string()));
        }

        if line.starts_with('[') && line.ends_with(']') {
            return Some(GrblResponse::Feedback(line.to_string()));
        }

        Some(GrblResponse::Message(line.to_string()))
    }

    fn parse_setting(&self, line: &str) -> Option<GrblResponse> {
        let (number, value) = line[1..].split_once('=')?;
        let number = number.trim().parse::<u16>().ok()?;
        Some(GrblResponse::Setting {
            number,
            value: value.trim().to_string(),
        })
    }
}

fn strip_code(line: &str, prefix: &str) -> Option<u8> {
    line.strip_prefix(prefix)?.trim().parse::<u8>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::grbl::status_parser::MachineState;

    #[test]
    fn test_parse_terminals() {
        let parser = GrblResponseParser::new();
        assert_eq!(parser.parse("ok"), Some(GrblResponse::Ok));
        assert_eq!(parser.parse("error:20"), Some(GrblResponse::Error(20)));
        assert_eq!(parser.parse("ALARM:2"), Some(GrblResponse::Alarm(2)));
        assert_eq!(parser.parse("alarm:1"), Some(GrblResponse::Alarm(1)));
        assert!(GrblResponse::Error(1).is_terminal());
        assert!(!GrblResponse::Message(String::new()).is_terminal());
    }

    #[test]
    fn test_parse_status() {
        let parser = GrblResponseParser::new();
        match parser.parse("<Run|MPos:0.000,1.000,2.000|FS:100,0>") {
            Some(GrblResponse::Status(report)) => assert_eq!(report.state, MachineState::Run),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_setting_and_banner() {
        let parser = GrblResponseParser::new();
        assert_eq!(
            parser.parse("$110=500.000"),
            Some(GrblResponse::Setting {
                number: 110,
                value: "500.000".to_string()
            })
        );
        assert!(matches!(
            parser.parse("Grbl 1.1h ['$' for help]"),
            Some(GrblResponse::Version(_))
        ));
        assert!(matches!(
            parser.parse("[MSG:Caution: Unlocked]"),
            Some(GrblResponse::Feedback(_))
        ));
    }

    #[test]
    fn test_blank_line_is_nothing() {
        assert_eq!(GrblResponseParser::new().parse("  \r"), None);
    }
}
