//! G-code line cleanup: stripping comments before a line is framed and sent.

/// Strip a line down to the command text a printer would actually execute:
/// everything from the first `;` onward is dropped, parenthesized inline
/// comments are removed (without collapsing the whitespace around them), and
/// the result is trimmed of leading/trailing whitespace.
pub fn sanitize(line: &str) -> String {
    let before_semicolon = match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    };

    let mut out = String::with_capacity(before_semicolon.len());
    let mut depth = 0u32;
    for c in before_semicolon.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_owned()
}

/// The command word of a line (e.g. `"G28"` out of `"G28 X0 Y0"`), or an
/// empty string for a blank or comment-only line.
pub fn command_code(line: &str) -> String {
    sanitize(line)
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_semicolon_comment() {
        assert_eq!(sanitize("G28 X0 ; home"), "G28 X0");
    }

    #[test]
    fn drops_inline_parenthesized_comment_without_collapsing_whitespace() {
        assert_eq!(sanitize("G28 X (inline) Y; end"), "G28 X  Y");
    }

    #[test]
    fn drops_multiple_inline_comments() {
        assert_eq!(sanitize("G1 (a) X0 (b) Y0"), "G1  X0  Y0");
    }

    #[test]
    fn comment_only_line_sanitizes_to_empty() {
        assert_eq!(sanitize("; comment"), "");
        assert_eq!(sanitize("(just a comment)"), "");
    }

    #[test]
    fn unmatched_close_paren_is_ignored_rather_than_underflowing() {
        assert_eq!(sanitize("G28 X0)"), "G28 X0");
    }

    #[test]
    fn trims_leading_and_trailing_whitespace() {
        assert_eq!(sanitize("   G28 X0   "), "G28 X0");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize("G28 X (inline) Y; end");
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn command_code_of_plain_command() {
        assert_eq!(command_code("M104 S210"), "M104");
    }

    #[test]
    fn command_code_of_comment_only_line_is_empty() {
        assert_eq!(command_code("; comment"), "");
    }

    #[test]
    fn command_code_ignores_leading_whitespace() {
        assert_eq!(command_code("   G1 X10 Y10"), "G1");
    }
}
