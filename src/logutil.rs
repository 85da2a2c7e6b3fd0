//! Logging helpers.
//!
//! Friend codes address accounts and must not appear verbatim in logs; they are
//! logged as short fingerprints. User-supplied text (chat lines, emote names) is
//! escaped so every log record stays on one line.

use sha2::{Digest, Sha256};

/// Short stable fingerprint of a friend code, e.g. `fc:3f9a1c0b`.
pub fn redact_code(friend_code: &str) -> String {
    let digest = Sha256::digest(friend_code.as_bytes());
    let mut out = String::with_capacity(11);
    out.push_str("fc:");
    for byte in &digest[..4] {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 120;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
