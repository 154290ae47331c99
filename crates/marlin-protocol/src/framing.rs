//! Line numbering and XOR checksum framing for commands sent to the printer.
//!
//! Marlin requires each command be prefixed with a monotonically increasing
//! line number and suffixed with a checksum, once line-number tracking has
//! been established with `M110`: `N<n> <command>*<checksum>\n`. The checksum
//! is the XOR of every byte in `N<n> <command>` (the `*<checksum>` itself is
//! not included).

/// XOR of every byte in `s`.
pub fn checksum(s: &str) -> u8 {
    s.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame `command` (already [`sanitize`](crate::sanitize)d) as a numbered,
/// checksummed line ready to write to the serial port.
pub fn frame_command(line_number: u32, command: &str) -> String {
    let body = format!("N{line_number} {command}");
    let cs = checksum(&body);
    format!("{body}*{cs}\n")
}
