//! Integration coverage for the SSE byte-stream adaptor and the
//! chat-completion stream parser working together end-to-end, as they would
//! be wired when forwarding a real upstream response body.
use futures_util::StreamExt;
use model_gateway::stream::chat_parser::{get_parser, model_is_think, split_think_content, ChatStreamItem};
use model_gateway::stream::sse::{is_done_event, sse_frame_stream};

fn byte_chunks(chunks: &[&str]) -> futures_util::stream::Iter<std::vec::IntoIter<Result<bytes::Bytes, std::io::Error>>> {
    let items: Vec<Result<bytes::Bytes, std::io::Error>> = chunks
        .iter()
        .map(|c| Ok(bytes::Bytes::from(c.as_bytes().to_vec())))
        .collect();
    futures_util::stream::iter(items)
}

#[tokio::test]
async fn sse_frame_stream_reassembles_events_split_across_chunk_boundaries() {
    // The "data:" line and its terminating blank line arrive in separate
    // poll()s, mirroring how a real TCP stream fragments SSE frames.
    let chunks = [
        "data: {\"choi",
        "ces\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
        "\ndata: [DONE]\n\n",
    ];
    let events: Vec<_> = sse_frame_stream(byte_chunks(&chunks)).collect().await;

    assert_eq!(events.len(), 2);
    assert!(events[0].data.contains("\"content\":\"hi\""));
    assert!(is_done_event(&events[1]));
}

#[tokio::test]
async fn sse_frame_stream_yields_events_from_many_small_chunks() {
    let chunks = [
        "data: one\n\n",
        "data: two\n\n",
        "data: three\n\n",
    ];
    let events: Vec<_> = sse_frame_stream(byte_chunks(&chunks)).collect().await;

    let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(data, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn full_pipeline_splits_reasoning_from_content_for_a_think_model() {
    let patterns = vec!["o1.*".to_string()];
    assert!(model_is_think("o1-preview", &patterns));

    let chunks = [
        "data: {\"choices\":[{\"delta\":{\"content\":\"let me work through this\"},\"finish_reason\":null}]}\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"</think>the answer is 4\"},\"finish_reason\":\"stop\"}],\"usage\":{\"total_tokens\":9}}\n",
        "\n",
        "data: [DONE]\n\n",
    ];

    let mut parser = get_parser("o1-preview", &patterns);
    let mut saw_done = false;
    let mut saw_usage = false;
    for event in sse_frame_stream(byte_chunks(&chunks)).collect::<Vec<_>>().await {
        if is_done_event(&event) {
            saw_done = true;
            continue;
        }
        for item in parser.feed(&format!("data: {}\n\n", event.data)) {
            if matches!(item, ChatStreamItem::Usage(_)) {
                saw_usage = true;
            }
        }
    }

    assert!(saw_done);
    assert!(saw_usage);
    assert_eq!(parser.reasoning_content, "let me work through this");
    assert_eq!(parser.content, "the answer is 4");
}

#[tokio::test]
async fn non_think_model_passes_content_through_unsplit() {
    let mut parser = get_parser("gpt-4o", &["o1.*".to_string()]);
    let items = parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\"hello\"},\"finish_reason\":null}]}\n\n");
    let ChatStreamItem::Chunk(value) = &items[0] else {
        panic!("expected a chunk item");
    };
    assert_eq!(value["choices"][0]["delta"]["content"], "hello");
    assert!(value["choices"][0]["delta"]["reasoning_content"].is_null());
}

#[test]
fn non_streaming_think_split_matches_the_streaming_parser_semantics() {
    let (reasoning, content) = split_think_content("weighing options</think>go with plan B");
    assert_eq!(reasoning.as_deref(), Some("weighing options"));
    assert_eq!(content, "go with plan B");
}

#[test]
fn think_pattern_matching_is_anchored_to_the_full_model_name() {
    let patterns = vec!["deepseek-.*".to_string()];
    assert!(model_is_think("deepseek-r1", &patterns));
    assert!(!model_is_think("not-deepseek-r1-either", &patterns));
    assert!(!model_is_think("gpt-4o", &patterns));
}
