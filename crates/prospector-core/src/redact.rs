//! Credential redaction — any error text that crosses the capability
//! boundary or lands in a sink must have token-shaped substrings masked
//! first.

/// Characters that may appear in a token body after its prefix.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Mask credential-shaped substrings in `text`.
///
/// Recognizes Prospector ephemeral tokens (`ptk_…`) and `Bearer …` values.
/// The first few characters are kept so log lines stay correlatable.
pub fn redact_credentials(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while !rest.is_empty() {
        if let Some(pos) = find_credential(rest) {
            let (prefix_len, keep) = pos.1;
            out.push_str(&rest[..pos.0]);
            let cred_start = pos.0;
            let body_start = cred_start + prefix_len;
            let body_end = rest[body_start..]
                .char_indices()
                .find(|(_, c)| !is_token_char(*c))
                .map(|(i, _)| body_start + i)
                .unwrap_or(rest.len());
            let visible = (body_start + keep).min(body_end);
            out.push_str(&rest[cred_start..visible]);
            if visible < body_end {
                out.push_str("[REDACTED]");
            }
            rest = &rest[body_end..];
        } else {
            out.push_str(rest);
            break;
        }
    }

    out
}

/// Find the earliest credential marker. Returns (offset, (prefix_len, visible_chars)).
fn find_credential(text: &str) -> Option<(usize, (usize, usize))> {
    let ptk = text.find("ptk_").map(|i| (i, ("ptk_".len(), 4)));
    let bearer = text.find("Bearer ").map(|i| (i, ("Bearer ".len(), 0)));

    match (ptk, bearer) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
