use std::sync::OnceLock;

use regex::Regex;

use crate::types::ACK_REPLY;

/// Replies shorter than this after cleanup carry no real content.
const MIN_REPLY_CHARS: usize = 20;

fn fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Flat fragments only: a fragment body never contains `}`. Nested or
    // unbalanced braces are out of contract and fall through untouched.
    RE.get_or_init(|| Regex::new(r"\{[^}]*\}").expect("fragment pattern compiles"))
}

fn whole_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{[^}]*\}$").expect("whole-object pattern compiles"))
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*)+").expect("blank-line pattern compiles"))
}

/// Strips stray structured-data fragments out of an assistant reply.
///
/// A reply that is nothing but a single brace-delimited object is dropped
/// entirely, as is anything left shorter than [`MIN_REPLY_CHARS`]; both cases
/// yield [`ACK_REPLY`] so the customer always gets readable text.
pub fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim();
    if whole_object_re().is_match(trimmed) {
        return ACK_REPLY.to_string();
    }

    let stripped = fragment_re().replace_all(trimmed, "");
    let collapsed = blank_lines_re().replace_all(&stripped, "\n");
    let cleaned = collapsed.trim().to_string();

    if cleaned.chars().count() < MIN_REPLY_CHARS {
        return ACK_REPLY.to_string();
    }
    cleaned
}
