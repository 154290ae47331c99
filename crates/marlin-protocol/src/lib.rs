//! Pure parsing and framing functions for the Marlin-family serial protocol:
//! comment stripping, line-number/checksum framing, and response-line
//! classification (`ok`, `resend`, `busy`, `Error:`, temperature telemetry).
//!
//! Nothing in this crate touches a serial port or a clock; it is all
//! `&str -> T` so the driver that drives the actual transport can be tested
//! against canned line fixtures.

mod framing;
mod response;
mod sanitize;

pub use framing::{checksum, frame_command};
pub use response::{parse_response_line, HeaterTemp, ResponseLine, TemperatureSnapshot};
pub use sanitize::{command_code, sanitize};
