//! Value sanitization.

/// Cleans one field value: strips NUL and non-whitespace control characters,
/// optionally escapes HTML entities, and trims surrounding whitespace.
pub fn sanitize(value: &str, allow_html: bool) -> String {
    let stripped: String = value
        .chars()
        .filter(|&c| c != '\0' && (!c.is_control() || c.is_whitespace()))
        .collect();

    let escaped = if allow_html {
        stripped
    } else {
        escape_html(&stripped)
    };

    escaped.trim().to_string()
}

/// Escapes the HTML-significant characters.
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
