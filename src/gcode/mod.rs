//! G-code file reading: sanitized command streaming plus leading-comment
//! header metadata.

mod header;
mod reader;

pub use header::{GcodeHeader, MaterialAmount, MaterialKind, parse_header_field};
pub use reader::GcodeReader;
