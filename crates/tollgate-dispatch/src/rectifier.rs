//! Response rectifier (DESIGN §4.5).
//!
//! A narrowly scoped repair pass over upstream bytes for three well-known
//! corruptions: truncated JSON at the tail of a non-streaming body,
//! malformed SSE framing, and a non-UTF-8 declared charset. The rectifier
//! never reorders content and leaves already-valid input untouched;
//! failures here are logged by the caller and never change the bytes
//! actually delivered to the client.

const DEFAULT_DEPTH_CAP: usize = 200;
const DEFAULT_SIZE_CAP_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RectifierLimits {
    pub depth_cap: usize,
    pub size_cap_bytes: usize,
}

impl Default for RectifierLimits {
    fn default() -> Self {
        Self {
            depth_cap: DEFAULT_DEPTH_CAP,
            size_cap_bytes: DEFAULT_SIZE_CAP_BYTES,
        }
    }
}

/// Attempts to balance a truncated JSON document's braces, brackets and
/// quotes. Returns `None` when the input is already valid JSON (so the
/// caller can tell "no change needed" from "repaired"), or when the input
/// exceeds `limits.size_cap_bytes` or nests past `limits.depth_cap` (in
/// either case the original bytes are left alone).
pub fn rectify_truncated_json(body: &str, limits: RectifierLimits) -> Option<String> {
    if body.len() > limits.size_cap_bytes {
        return None;
    }
    if serde_json::from_str::<serde_json::Value>(body).is_ok() {
        return None;
    }

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = body.chars().peekable();
    let mut truncated_in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => {
                if stack.len() >= limits.depth_cap {
                    return None;
                }
                stack.push(c);
            }
            '}' => {
                if stack.last() == Some(&'{') {
                    stack.pop();
                }
            }
            ']' => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if in_string {
        truncated_in_string = true;
    }

    if stack.is_empty() && !truncated_in_string {
        // Structurally balanced already; whatever's wrong isn't something
        // this pass can fix (never alter already-well-formed structure).
        return None;
    }

    let mut repaired = body.to_string();
    if truncated_in_string {
        repaired.push('"');
    }
    while let Some(open) = stack.pop() {
        repaired.push(match open {
            '{' => '}',
            '[' => ']',
            _ => unreachable!(),
        });
    }

    if serde_json::from_str::<serde_json::Value>(&repaired).is_ok() {
        Some(repaired)
    } else {
        None
    }
}

/// Re-frames a byte of SSE data: drops empty frames, fixes stray `\r`, and
/// ensures every event ends with exactly one `\n\n` terminator. Never
/// reorders events.
pub fn rectify_sse_framing(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let frames: Vec<&str> = normalized.split("\n\n").collect();
    let mut out = String::with_capacity(normalized.len());
    for frame in frames {
        let frame = frame.trim_end_matches('\n');
        if frame.trim().is_empty() {
            continue;
        }
        out.push_str(frame);
        out.push_str("\n\n");
    }
    out
}

/// Normalizes `bytes` to UTF-8 given the upstream's declared charset. Falls
/// back to a lossy decode (never panics, never drops the response) when the
/// declared encoding doesn't round-trip cleanly.
pub fn normalize_utf8(bytes: &[u8], declared_charset: Option<&str>) -> String {
    match declared_charset.map(|c| c.to_ascii_lowercase()) {
        None | Some(_) if std::str::from_utf8(bytes).is_ok() => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        Some(charset) if charset.contains("utf-8") || charset.contains("utf8") => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        Some(charset) if charset.contains("latin1") || charset.contains("iso-8859-1") => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_valid_json_untouched() {
        let valid = r#"{"a":1,"b":[1,2,3]}"#;
        assert!(rectify_truncated_json(valid, RectifierLimits::default()).is_none());
    }

    #[test]
    fn balances_truncated_object_and_array() {
        let truncated = r#"{"a":1,"b":[1,2,3"#;
        let repaired = rectify_truncated_json(truncated, RectifierLimits::default()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn balances_truncated_string_and_nested_structure() {
        let truncated = r#"{"text":"hello wor"#;
        let repaired = rectify_truncated_json(truncated, RectifierLimits::default()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(parsed["text"], "hello wor");
    }

    #[test]
    fn refuses_past_size_cap() {
        let huge = "x".repeat(10);
        let limits = RectifierLimits {
            depth_cap: 200,
            size_cap_bytes: 5,
        };
        assert!(rectify_truncated_json(&huge, limits).is_none());
    }

    #[test]
    fn refuses_past_depth_cap() {
        let nested = "[".repeat(10);
        let limits = RectifierLimits {
            depth_cap: 3,
            size_cap_bytes: 1024,
        };
        assert!(rectify_truncated_json(&nested, limits).is_none());
    }

    #[test]
    fn sse_framing_drops_empty_frames_and_fixes_stray_cr() {
        let raw = "data: a\r\n\r\n\n\ndata: b\n\n";
        let fixed = rectify_sse_framing(raw);
        assert_eq!(fixed, "data: a\n\ndata: b\n\n");
    }

    #[test]
    fn sse_framing_is_idempotent_on_well_formed_input() {
        let raw = "event: foo\ndata: a\n\ndata: b\n\n";
        let once = rectify_sse_framing(raw);
        let twice = rectify_sse_framing(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_utf8_passes_through_valid_utf8() {
        let bytes = "héllo".as_bytes();
        assert_eq!(normalize_utf8(bytes, Some("utf-8")), "héllo");
    }

    #[test]
    fn normalize_utf8_decodes_latin1() {
        let bytes = [0xE9u8]; // 'é' in Latin-1
        assert_eq!(normalize_utf8(&bytes, Some("iso-8859-1")), "é");
    }
}
