//! GRBL firmware support
//!
//! Response and status parsing, error decoding, `$$` settings and the
//! motion driver built on them.

pub mod driver;
pub mod error_decoder;
pub mod response_parser;
pub mod settings;
pub mod status_parser;

pub use driver::GrblDriver;
pub use error_decoder::{decode_alarm, decode_error, format_alarm, format_error};
pub use response_parser::{GrblResponse, GrblResponseParser};
pub use settings::GrblSettings;
pub use status_parser::{MachineState, StatusReport};
