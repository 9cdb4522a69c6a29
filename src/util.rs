use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// 64-bit finalizer mix (splitmix64), used to decorrelate sequential inputs
/// before they are used as a selection index.
#[inline]
pub(crate) fn mix_u64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Stable hash of an API key (or other short identifier) used for the
/// `stable_hash(api_key) mod n` channel pick in the registry.
#[inline]
#[must_use]
pub fn stable_hash_bytes(bytes: &[u8]) -> u64 {
    const HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

    #[inline]
    fn read_u64_lossy(bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        let copy_len = bytes.len().min(8);
        buf[..copy_len].copy_from_slice(&bytes[..copy_len]);
        u64::from_le_bytes(buf)
    }

    let len = bytes.len();
    let mut hash = mix_u64((len as u64) ^ HASH_SEED);
    if len == 0 {
        return hash;
    }
    hash ^= mix_u64(read_u64_lossy(bytes));
    if len > 8 {
        hash ^= mix_u64(read_u64_lossy(&bytes[len - 8..]));
    }
    if len > 16 {
        let mid = len / 2;
        let mid_start = mid.saturating_sub(4);
        let mid_end = (mid_start + 8).min(len);
        hash ^= mix_u64(read_u64_lossy(&bytes[mid_start..mid_end]));
    }
    mix_u64(hash)
}

/// Current unix time in whole seconds.
#[inline]
#[must_use]
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Current unix time in whole milliseconds.
#[inline]
#[must_use]
pub fn unix_now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as i64)
}

/// Generate a random lowercase-hex id of `len` characters (used for queue
/// event ids and the billing job's idempotency `event_id`, spec S4.9).
#[must_use]
pub fn random_hex_id(len: usize) -> String {
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        out.push(char::from(HEX[fastrand::usize(0..16)]));
    }
    out
}

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Monotonic per-process sequence number, used to build locally-unique ids
/// without needing a shared counter.
#[must_use]
pub fn next_seq() -> u64 {
    SEQ_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Escape `value` as a JSON string and append it (including quotes) to `out`.
pub(crate) fn push_json_string_escaped(out: &mut String, value: &str) {
    let bytes = value.as_bytes();
    if bytes.iter().all(|&b| b >= 0x20 && b != b'"' && b != b'\\') {
        out.push('"');
        out.push_str(value);
        out.push('"');
        return;
    }

    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c <= '\u{1f}' => {
                let control = c as u8;
                out.push_str("\\u00");
                out.push(char::from(HEX[(control >> 4) as usize]));
                out.push(char::from(HEX[(control & 0x0f) as usize]));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}

/// Count "characters" the way the TTS meter does: a CJK codepoint counts as
/// 2, everything else counts as 1.
#[must_use]
pub fn count_characters(text: &str) -> u64 {
    text.chars()
        .map(|c| if is_cjk(c) { 2 } else { 1 })
        .sum()
}

#[inline]
fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF) // CJK Unified Ideographs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_id_has_requested_length() {
        let id = random_hex_id(16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn push_json_string_escaped_matches_serde_json() {
        let inputs = [
            "",
            "plain ascii",
            "quote \" and slash \\",
            "line\nbreak\r\n",
            "control \u{001f} tail",
        ];
        for input in inputs {
            let mut out = String::new();
            push_json_string_escaped(&mut out, input);
            let expected = serde_json::to_string(input).expect("serialize");
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn count_characters_counts_cjk_as_two() {
        assert_eq!(count_characters("ab"), 2);
        assert_eq!(count_characters("你好"), 4);
        assert_eq!(count_characters("a你b好"), 6);
    }

    #[test]
    fn count_characters_does_not_double_cjk_punctuation() {
        // U+FF0C fullwidth comma, U+3002 ideographic full stop: neither is
        // in the CJK Unified Ideographs block, so both count as 1.
        assert_eq!(count_characters("，"), 1);
        assert_eq!(count_characters("。"), 1);
        assert_eq!(count_characters("你好，"), 5);
    }

    #[test]
    fn stable_hash_bytes_is_deterministic() {
        assert_eq!(stable_hash_bytes(b"sk-abc"), stable_hash_bytes(b"sk-abc"));
        assert_ne!(stable_hash_bytes(b"sk-abc"), stable_hash_bytes(b"sk-abd"));
    }
}
