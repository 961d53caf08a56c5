use std::fmt::Write;

/// Escape `s` for embedding inside a JSON string literal.
///
/// `"` and `\` are backslash-escaped, the control characters that have short
/// forms use them (`\b \f \n \r \t`), and every other code point below 0x20
/// becomes `\u00XX`. Everything else, including non-ASCII text, passes
/// through unchanged.
pub fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escaped, length-bounded rendering of an untrusted frame for log lines.
pub fn preview(s: &str, max_chars: usize) -> String {
    let mut end = s.len();
    if let Some((idx, _)) = s.char_indices().nth(max_chars) {
        end = idx;
    }
    let mut out = escape_json(&s[..end]);
    if end < s.len() {
        out.push_str("...");
    }
    out
}
