pub mod chat_parser;
pub mod sse;

pub use sse::{sse_frame_stream, SseFrame, SseParser};

use memchr::{memchr, memchr2};

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Parse a single SSE frame from raw text.
///
/// Feeds the raw text through an [`sse::SseParser`] and returns the first
/// complete event, if any.
#[must_use]
pub fn parse_sse_frame(raw: &str) -> Option<SseEvent> {
    parse_sse_frame_bytes(raw.as_bytes())
}

/// Parse a single SSE frame from raw bytes.
///
/// Supports `\n\n` and `\r\n\r\n` separators and standard SSE fields
/// (`event`, `data`, `id`, `retry`).
#[must_use]
pub fn parse_sse_frame_bytes(raw: &[u8]) -> Option<SseEvent> {
    if let Some(frame) = try_parse_data_only_sse_frame(raw) {
        return Some(frame);
    }
    if let Some(frame) = try_parse_event_and_data_sse_frame(raw) {
        return Some(frame);
    }

    let mut event: Option<String> = None;
    let mut data = String::new();
    let mut has_data = false;
    let mut id: Option<String> = None;
    let mut retry: Option<u64> = None;
    let mut line_start = 0usize;

    while let Some(rel_pos) = memchr(b'\n', &raw[line_start..]) {
        let line_end = line_start + rel_pos;
        let mut line = &raw[line_start..line_end];
        if line.last().copied() == Some(b'\r') {
            line = &line[..line.len() - 1];
        }

        if line.is_empty() {
            if has_data {
                return Some(SseEvent {
                    event,
                    data,
                    id,
                    retry,
                });
            }
            line_start = line_end + 1;
            continue;
        }

        if line.first().copied() == Some(b':') {
            line_start = line_end + 1;
            continue;
        }

        if let Some(value) = line.strip_prefix(b"data:") {
            let value = value.strip_prefix(b" ").unwrap_or(value);
            let value = std::str::from_utf8(value).ok()?;
            if has_data {
                data.push('\n');
            } else {
                has_data = true;
            }
            data.push_str(value);
        } else if let Some(value) = line.strip_prefix(b"event:") {
            let value = value.strip_prefix(b" ").unwrap_or(value);
            let value = std::str::from_utf8(value).ok()?;
            event = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix(b"id:") {
            let value = value.strip_prefix(b" ").unwrap_or(value);
            let value = std::str::from_utf8(value).ok()?;
            id = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix(b"retry:") {
            let value = value.strip_prefix(b" ").unwrap_or(value);
            let value = std::str::from_utf8(value).ok()?;
            retry = value.trim().parse::<u64>().ok();
        }
        line_start = line_end + 1;
    }

    None
}

#[inline]
fn frame_payload_end(raw: &[u8]) -> Option<usize> {
    if raw.ends_with(b"\r\n\r\n") {
        Some(raw.len().saturating_sub(4))
    } else if raw.ends_with(b"\n\n") {
        Some(raw.len().saturating_sub(2))
    } else {
        None
    }
}

#[inline]
fn try_parse_data_only_sse_frame(raw: &[u8]) -> Option<SseEvent> {
    if !raw.starts_with(b"data:") {
        return None;
    }
    let end = frame_payload_end(raw)?;
    if end < 5 {
        return None;
    }
    let start = 5 + usize::from(raw.get(5) == Some(&b' '));
    let data_bytes = raw.get(start..end)?;
    if memchr2(b'\n', b'\r', data_bytes).is_some() {
        return None;
    }
    let data = std::str::from_utf8(data_bytes).ok()?.to_string();
    Some(SseEvent {
        event: None,
        data,
        id: None,
        retry: None,
    })
}

#[inline]
fn try_parse_event_and_data_sse_frame(raw: &[u8]) -> Option<SseEvent> {
    if !raw.starts_with(b"event:") {
        return None;
    }
    let end = frame_payload_end(raw)?;
    let first_newline = memchr(b'\n', raw)?;
    if first_newline + 1 >= end {
        return None;
    }

    let mut event_line = &raw[..first_newline];
    if event_line.last().copied() == Some(b'\r') {
        event_line = &event_line[..event_line.len() - 1];
    }
    let event_value = event_line.strip_prefix(b"event:")?;
    let event_value = event_value.strip_prefix(b" ").unwrap_or(event_value);
    let event = std::str::from_utf8(event_value).ok()?.to_string();

    let mut data_line = raw.get(first_newline + 1..end)?;
    if memchr(b'\n', data_line).is_some() {
        return None;
    }
    if data_line.last().copied() == Some(b'\r') {
        data_line = &data_line[..data_line.len() - 1];
    }
    let data_value = data_line.strip_prefix(b"data:")?;
    let data_value = data_value.strip_prefix(b" ").unwrap_or(data_value);
    let data = std::str::from_utf8(data_value).ok()?.to_string();

    Some(SseEvent {
        event: Some(event),
        data,
        id: None,
        retry: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_frame_data_only() {
        let event = parse_sse_frame("data: hello\n\n").unwrap();
        assert_eq!(event.data, "hello");
        assert!(event.event.is_none());
    }

    #[test]
    fn parse_sse_frame_event_and_data() {
        let event = parse_sse_frame("event: ping\ndata: {}\n\n").unwrap();
        assert_eq!(event.event.as_deref(), Some("ping"));
        assert_eq!(event.data, "{}");
    }

    #[test]
    fn parse_sse_frame_returns_none_without_terminator() {
        assert!(parse_sse_frame("data: partial").is_none());
    }
}
