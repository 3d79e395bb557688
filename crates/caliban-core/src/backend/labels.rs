//! Label sanitization for managed backends.
//!
//! Backends restrict label keys and values to lowercase letters, digits,
//! underscores, and dashes, at most 63 characters. Sanitization is a pure
//! function so every submission path produces identical labels.

/// Maximum length of a label key or value.
pub const MAX_LABEL_LENGTH: usize = 63;

fn clean_label(s: &str, is_key: bool) -> String {
    // Periods are not allowed but occur constantly in values like learning
    // rates, so they map to underscores instead of vanishing.
    let replaced = s.replace('.', "_").to_lowercase();

    let mut cleaned: String = replaced
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        .collect();
    while cleaned.starts_with('-') {
        cleaned.remove(0);
    }

    // Keys must start with a letter.
    if is_key {
        if let Some(first) = cleaned.chars().next() {
            if !first.is_ascii_alphabetic() {
                cleaned.insert(0, 'k');
            }
        }
    }

    cleaned.chars().take(MAX_LABEL_LENGTH).collect()
}

/// Sanitizes a label key.
pub fn key_label(k: &str) -> String {
    clean_label(k, true)
}

/// Sanitizes a label value.
pub fn value_label(v: &str) -> String {
    clean_label(v, false)
}

/// Turns unsanitized key/value pairs into a label set fit for submission.
///
/// Pairs whose key sanitizes to the empty string are dropped. Later pairs
/// override earlier ones when their sanitized keys collide, which is what
/// lets user-supplied labels win over auto-derived ones: append user labels
/// last.
pub fn sanitize_labels(pairs: &[(String, String)]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for (k, v) in pairs {
        let key = key_label(k);
        if key.is_empty() {
            continue;
        }
        let value = value_label(v);
        match out.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => out.push((key, value)),
        }
    }
    out
}

/// Derives labels from the argv tokens passed to a job's script, pairing
/// each `--flag` with its following value (or the empty string for bare
/// flags).
pub fn args_to_labels(args: &[String]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let token = &args[i];
        if token.starts_with('-') {
            let key = key_label(token.trim_start_matches('-'));
            if !key.is_empty() {
                let value = match args.get(i + 1) {
                    Some(next) if !next.starts_with('-') => {
                        i += 1;
                        value_label(next)
                    }
                    _ => String::new(),
                };
                if !out.iter().any(|(k, _)| *k == key) {
                    out.push((key, value));
                }
            }
        }
        i += 1;
    }
    out
}
