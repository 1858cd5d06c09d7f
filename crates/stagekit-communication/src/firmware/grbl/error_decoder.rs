//! GRBL error and alarm code decoder
//! Converts numeric error and alarm codes to human-readable messages

/// Decode a GRBL error code
pub fn decode_error(code: u8) -> &'static str {
    match code {
        1 => "G-code word letter not found",
        2 => "Bad number format",
        3 => "'$' system command not recognized",
        4 => "Negative value for an expected positive value",
        5 => "Homing cycle is not enabled",
        8 => "'$' command only valid when idle",
        9 => "G-code locked out during alarm or jog state",
        10 => "Soft limits require homing",
        11 => "Line too long",
        15 => "Jog target exceeds machine travel",
        16 => "Invalid jog command",
        20 => "Unsupported or invalid g-code command",
        21 => "More than one command from the same modal group",
        22 => "Feed rate has not been set",
        24 => "Two commands in the block need axis words",
        25 => "Repeated g-code word",
        26 => "Axis words required but missing",
        33 => "Invalid motion target",
        36 => "Unused g-code words in block",
        _ => "Unknown error",
    }
}

/// Decode a GRBL alarm code
pub fn decode_alarm(code: u8) -> &'static str {
    match code {
        1 => "Hard limit triggered; position lost, re-home",
        2 => "Soft limit; target exceeds machine travel",
        3 => "Reset while in motion; position lost, re-home",
        4 => "Probe fail: initial state",
        5 => "Probe fail: no contact",
        6 => "Homing fail: reset during cycle",
        7 => "Homing fail: door opened",
        8 => "Homing fail: could not clear limit switch",
        9 => "Homing fail: limit switch not found",
        _ => "Unknown alarm",
    }
}

/// Format an error with its code
pub fn format_error(code: u8) -> String {
    format!("error:{} - {}", code, decode_error(code))
}

/// Format an alarm with its code
pub fn format_alarm(code: u8) -> String {
    format!("ALARM:{} - {}", code, decode_alarm(code))
}
