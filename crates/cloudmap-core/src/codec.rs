//! Key codecs: reversible escaping of logical keys into backend-safe keys.
//!
//! All variants decode with plain percent-decoding, so `decode(encode(k)) == k`
//! holds for every variant as long as the encoder only ever emits valid
//! percent-encodings of `k`. The variants differ only in which characters
//! they leave unescaped:
//!
//! - [`encode_key`] keeps RFC 3986 unreserved characters and `/`.
//! - [`encode_segment`] keeps only unreserved characters, so `/` is escaped.
//!   Used where the key space forbids hierarchical separators.
//! - [`encode_object_path`] keeps `/` only where it forms a valid object
//!   store path separator: never leading, trailing or doubled, and never
//!   around a `.` or `..` segment.

use std::borrow::Cow;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::CloudMapError;
use crate::Result;

/// Characters escaped by [`encode_segment`]: everything but `A-Z a-z 0-9 - . _ ~`.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Characters escaped by [`encode_key`]: as [`SEGMENT`], but `/` passes through.
const PATH: &AsciiSet = &SEGMENT.remove(b'/');

const ESCAPED_SLASH: &str = "%2F";
const ESCAPED_DOT: &str = "%2E";

/// Percent-encode a key, preserving `/`.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, PATH).to_string()
}

/// Percent-encode a key, escaping `/` as well.
pub fn encode_segment(key: &str) -> String {
    utf8_percent_encode(key, SEGMENT).to_string()
}

/// Decode a key produced by any of the encoders in this module.
///
/// Fails with [`CloudMapError::Usage`] if the decoded bytes are not UTF-8.
pub fn decode_key(encoded: &str) -> Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|e| CloudMapError::usage(format!("Cannot decode key '{encoded}': {e}")))
}

/// Percent-encode a key into a valid object store path.
///
/// With `open_ended` set the key is treated as a prefix that will be
/// extended, so a trailing `/` is kept as a separator and the last segment
/// is left as-is.
pub fn encode_object_path(key: &str, open_ended: bool) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_was_separator = false;
    let mut chars = key.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c == '/' {
            let has_next = chars.peek().is_some();
            if !out.is_empty() && !last_was_separator && (has_next || open_ended) {
                out.push('/');
                last_was_separator = true;
            } else {
                out.push_str(ESCAPED_SLASH);
                last_was_separator = false;
            }
        } else {
            let end = idx + c.len_utf8();
            out.extend(utf8_percent_encode(&key[idx..end], SEGMENT));
            last_was_separator = false;
        }
    }

    escape_dot_segments(&out, open_ended)
}

/// Replace `.` and `..` segments with their escaped forms.
fn escape_dot_segments(path: &str, open_ended: bool) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len() - 1;
    segments
        .iter()
        .enumerate()
        .map(|(i, segment)| match *segment {
            "." | ".." if !(open_ended && i == last) => ESCAPED_DOT.repeat(segment.len()),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// The deepest directory containing every object whose logical key starts
/// with the logical form of the open-ended prefix `encoded`.
///
/// A prefix ending in `/` still lists from one level up: a key equal to
/// such a prefix is stored with its trailing slash escaped (`x/` becomes
/// `x%2F`), beside the directory rather than inside it.
pub fn object_path_parent(encoded: &str) -> &str {
    let encoded = encoded.trim_end_matches('/');
    match encoded.rfind('/') {
        Some(pos) => &encoded[..pos],
        None => "",
    }
}
