//! Public name derivation.
//!
//! Caller-supplied filenames are only hints: directory components are
//! dropped, every character outside `[A-Za-z0-9._-]` becomes `_`, leading
//! dots are stripped and the result is length-bounded. Collisions are
//! resolved by [`candidate`], which appends `-1`, `-2`, ... before the
//! extension.

/// Name used when the hint is missing or sanitizes to nothing
pub const FALLBACK_NAME: &str = "upload";

const MAX_EXTENSION_LEN: usize = 16;

/// Turn an untrusted filename hint into a safe single path component
pub fn sanitize(hint: Option<&str>, max_len: usize) -> String {
    let raw = hint
        .and_then(|h| h.rsplit(|c: char| c == '/' || c == '\\').find(|part| !part.is_empty()))
        .unwrap_or("");

    let mapped: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();

    let trimmed = mapped.trim_start_matches('.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '_' || c == '.') {
        return FALLBACK_NAME.to_string();
    }

    fit(trimmed, "", max_len)
}

/// The `attempt`-th candidate for `name`; attempt 0 is the name itself
pub fn candidate(name: &str, attempt: u32, max_len: usize) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    fit(name, &format!("-{attempt}"), max_len)
}

/// Split `name` into stem and extension, append `suffix` to the stem and
/// truncate the stem so the whole result fits in `max_len`.
fn fit(name: &str, suffix: &str, max_len: usize) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 && name.len() - pos - 1 <= MAX_EXTENSION_LEN => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };

    let budget = max_len.saturating_sub(ext.len() + suffix.len()).max(1);
    // Sanitized names are ASCII so byte slicing is on char boundaries.
    let stem = if stem.len() > budget { &stem[..budget] } else { stem };
    format!("{stem}{suffix}{ext}")
}
