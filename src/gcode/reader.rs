//! Streaming G-code file reader: line-by-line so file size is never bounded
//! by available memory.

use std::io::{self, BufRead};

use super::header::{parse_header_field, GcodeHeader};

/// A lazy, non-restartable sequence of sanitized command lines from a byte
/// stream, with header metadata recovered from the leading comment block.
pub struct GcodeReader<R> {
    lines: io::Lines<R>,
    /// The first non-comment line, read during `preprocess` to find where
    /// the header ends, held back so it's still the first line iteration
    /// yields.
    pending: Option<String>,
}

impl<R: BufRead> GcodeReader<R> {
    pub fn new(reader: R) -> Self {
        GcodeReader { lines: reader.lines(), pending: None }
    }

    /// Walk the leading comment block, recovering header fields. Stops at
    /// the first non-comment line, which remains available as the first
    /// item this reader's `Iterator` impl yields.
    pub fn preprocess(&mut self) -> io::Result<GcodeHeader> {
        let mut header = GcodeHeader::default();
        while let Some(line) = self.lines.next().transpose()? {
            match line.strip_prefix(';') {
                Some(rest) => parse_header_field(rest, &mut header),
                None => {
                    self.pending = Some(line);
                    break;
                }
            }
        }
        Ok(header)
    }
}

impl<R: BufRead> Iterator for GcodeReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.pending.take() {
                Some(line) => line,
                None => match self.lines.next() {
                    None => return None,
                    Some(Err(e)) => return Some(Err(e)),
                    Some(Ok(line)) => line,
                },
            };
            let sanitized = marlin_protocol::sanitize(&raw);
            if !sanitized.is_empty() {
                return Some(Ok(sanitized));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use super::super::header::MaterialKind;

    #[test]
    fn preprocess_recovers_header_then_iteration_yields_first_command() {
        let text = ";FLAVOR:Marlin\n;TIME:67\n;Filament used: 24.2886 m, 5.10839 m\nG28\nG1 X10\n";
        let mut reader = GcodeReader::new(Cursor::new(text));
        let header = reader.preprocess().unwrap();
        assert_eq!(header.flavor.as_deref(), Some("Marlin"));
        assert_eq!(header.total_time, Some(67));
        assert_eq!(header.material_amounts[0].kind, MaterialKind::Length);

        let lines: Vec<String> = reader.map(Result::unwrap).collect();
        assert_eq!(lines, vec!["G28".to_owned(), "G1 X10".to_owned()]);
    }

    #[test]
    fn blank_and_comment_only_lines_are_skipped_after_header() {
        let text = ";FLAVOR:Marlin\nG28\n\n; a mid-file comment\nG1 X10 ; move\n";
        let mut reader = GcodeReader::new(Cursor::new(text));
        reader.preprocess().unwrap();
        let lines: Vec<String> = reader.map(Result::unwrap).collect();
        assert_eq!(lines, vec!["G28".to_owned(), "G1 X10".to_owned()]);
    }

    #[test]
    fn file_with_no_header_still_yields_all_commands() {
        let text = "G28\nG1 X10\n";
        let mut reader = GcodeReader::new(Cursor::new(text));
        let header = reader.preprocess().unwrap();
        assert_eq!(header, GcodeHeader::default());
        let lines: Vec<String> = reader.map(Result::unwrap).collect();
        assert_eq!(lines, vec!["G28".to_owned(), "G1 X10".to_owned()]);
    }
}
