//! Tests for capstan-llm: wire types, message normalization, the provider
//! factory, retry policy, and the mock provider.

use capstan_core::{ModelConfig, ProviderError};
use capstan_llm::testing::{MockBehavior, MockProvider};
use capstan_llm::*;
use futures::StreamExt;
use serde_json::json;

// ===========================================================================
// Wire types
// ===========================================================================

#[test]
fn llm_content_text_serde() {
    let c = LlmContent::Text("hello".into());
    let json = serde_json::to_string(&c).unwrap();
    assert_eq!(json, r#""hello""#);
    let back: LlmContent = serde_json::from_str(&json).unwrap();
    assert!(matches!(back, LlmContent::Text(s) if s == "hello"));
}

#[test]
fn content_block_tool_use_serde() {
    let b = ContentBlock::ToolUse {
        id: "tc-1".into(),
        name: "read_file".into(),
        input: json!({"path": "/tmp/x"}),
    };
    let json = serde_json::to_string(&b).unwrap();
    assert!(json.contains(r#""type":"tool_use""#));
    let back: ContentBlock = serde_json::from_str(&json).unwrap();
    assert!(matches!(back, ContentBlock::ToolUse { ref name, .. } if name == "read_file"));
}

#[test]
fn content_block_tool_result_omits_absent_error_flag() {
    let b = ContentBlock::ToolResult {
        tool_use_id: "tc-1".into(),
        content: "ok".into(),
        is_error: None,
    };
    let json = serde_json::to_string(&b).unwrap();
    assert!(!json.contains("is_error"));
}

#[test]
fn accumulated_tool_call_parses_arguments() {
    let tc = AccumulatedToolCall {
        id: "tc-1".into(),
        name: "x".into(),
        arguments: r#"{"a": 1}"#.into(),
    };
    assert_eq!(tc.parse_arguments().unwrap(), json!({"a": 1}));

    // Empty argument stream means "no arguments", not a parse error.
    let empty = AccumulatedToolCall::default();
    assert_eq!(empty.parse_arguments().unwrap(), json!({}));
}

// ===========================================================================
// normalize_messages
// ===========================================================================

#[test]
fn normalize_drops_leading_non_user() {
    let messages = vec![
        LlmMessage::assistant("stale"),
        LlmMessage::user("hello"),
    ];
    let healed = normalize_messages(&messages);
    assert_eq!(healed.len(), 1);
    assert_eq!(healed[0].role, "user");
}

#[test]
fn normalize_merges_consecutive_same_role_text() {
    let messages = vec![
        LlmMessage::user("one"),
        LlmMessage::user("two"),
        LlmMessage::assistant("reply"),
    ];
    let healed = normalize_messages(&messages);
    assert_eq!(healed.len(), 2);
    match &healed[0].content {
        LlmContent::Text(s) => assert_eq!(s, "one\n\ntwo"),
        _ => panic!("expected merged text"),
    }
}

#[test]
fn normalize_heals_orphaned_tool_use() {
    let messages = vec![
        LlmMessage::user("run it"),
        LlmMessage {
            role: "assistant".into(),
            content: LlmContent::Blocks(vec![ContentBlock::ToolUse {
                id: "tc-9".into(),
                name: "run_command".into(),
                input: json!({"command": "ls"}),
            }]),
        },
        // No tool_result follows: the turn was interrupted.
    ];
    let healed = normalize_messages(&messages);
    assert_eq!(healed.len(), 3);
    match &healed[2].content {
        LlmContent::Blocks(blocks) => match &blocks[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                assert_eq!(tool_use_id, "tc-9");
                assert_eq!(*is_error, Some(true));
            }
            _ => panic!("expected synthesized tool_result"),
        },
        _ => panic!("expected blocks"),
    }
}

#[test]
fn normalize_fills_partially_answered_tool_use() {
    let messages = vec![
        LlmMessage::user("go"),
        LlmMessage {
            role: "assistant".into(),
            content: LlmContent::Blocks(vec![
                ContentBlock::ToolUse {
                    id: "tc-1".into(),
                    name: "a".into(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "tc-2".into(),
                    name: "b".into(),
                    input: json!({}),
                },
            ]),
        },
        LlmMessage {
            role: "user".into(),
            content: LlmContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "tc-1".into(),
                content: "done".into(),
                is_error: None,
            }]),
        },
    ];
    let healed = normalize_messages(&messages);
    assert_eq!(healed.len(), 3);
    match &healed[2].content {
        LlmContent::Blocks(blocks) => {
            assert_eq!(blocks.len(), 2);
            let ids: Vec<_> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
                .collect();
            assert_eq!(ids, vec!["tc-1", "tc-2"]);
        }
        _ => panic!("expected blocks"),
    }
}

#[test]
fn normalize_leaves_valid_sequences_alone() {
    let messages = vec![
        LlmMessage::user("hi"),
        LlmMessage::assistant("hello"),
        LlmMessage::user("more"),
    ];
    let healed = normalize_messages(&messages);
    assert_eq!(healed.len(), 3);
}

// ===========================================================================
// Provider factory
// ===========================================================================

fn model_config(provider: &str, base_url: Option<&str>) -> ModelConfig {
    ModelConfig {
        provider: provider.into(),
        model: "m".into(),
        api_key: "k".into(),
        base_url: base_url.map(String::from),
        ..ModelConfig::default()
    }
}

#[test]
fn factory_resolves_dialects() {
    assert_eq!(
        provider_for_config(&model_config("anthropic", None))
            .unwrap()
            .name(),
        "anthropic"
    );
    assert_eq!(
        provider_for_config(&model_config("openai", None))
            .unwrap()
            .name(),
        "openai"
    );
    assert_eq!(
        provider_for_config(&model_config("gemini", Some("https://example.test/v1")))
            .unwrap()
            .name(),
        "gemini"
    );
}

#[test]
fn factory_rejects_unknown_and_incomplete() {
    assert!(provider_for_config(&model_config("martian", None)).is_err());
    assert!(provider_for_config(&model_config("gemini", None)).is_err());
}

// ===========================================================================
// Mock provider
// ===========================================================================

async fn collect_text(stream: LlmStream) -> (String, Option<String>) {
    let mut text = String::new();
    let mut stop = None;
    tokio::pin!(stream);
    while let Some(delta) = stream.next().await {
        match delta.unwrap() {
            StreamDelta::Text(t) => text.push_str(&t),
            StreamDelta::Done { stop_reason, .. } => {
                stop = stop_reason;
                break;
            }
            _ => {}
        }
    }
    (text, stop)
}

#[tokio::test]
async fn mock_text_response() {
    let mock = MockProvider::constant(MockBehavior::Text("hello world".into()));
    let stream = mock
        .complete_stream(LlmRequest::default(), None)
        .await
        .unwrap();
    let (text, stop) = collect_text(stream).await;
    assert_eq!(text, "hello world");
    assert_eq!(stop.as_deref(), Some("end_turn"));
    assert_eq!(mock.call_count().await, 1);
}

#[tokio::test]
async fn mock_tool_call_stream_shape() {
    let mock = MockProvider::constant(MockBehavior::ToolCall {
        name: "run_command".into(),
        args: json!({"command": "ls"}),
    });
    let stream = mock
        .complete_stream(LlmRequest::default(), None)
        .await
        .unwrap();

    let mut name = String::new();
    let mut arguments = String::new();
    let mut stop = None;
    tokio::pin!(stream);
    while let Some(delta) = stream.next().await {
        match delta.unwrap() {
            StreamDelta::ToolCallStart { name: n, .. } => name = n,
            StreamDelta::ToolCallDelta { arguments: a, .. } => arguments.push_str(&a),
            StreamDelta::Done { stop_reason, .. } => {
                stop = stop_reason;
                break;
            }
            _ => {}
        }
    }
    assert_eq!(name, "run_command");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&arguments).unwrap(),
        json!({"command": "ls"})
    );
    assert_eq!(stop.as_deref(), Some("tool_use"));
}

#[tokio::test]
async fn mock_sequence_then_default() {
    let mock = MockProvider::sequence(vec![
        MockBehavior::Text("first".into()),
        MockBehavior::Text("second".into()),
    ]);
    for expected in ["first", "second"] {
        let stream = mock
            .complete_stream(LlmRequest::default(), None)
            .await
            .unwrap();
        let (text, _) = collect_text(stream).await;
        assert_eq!(text, expected);
    }
    let stream = mock
        .complete_stream(LlmRequest::default(), None)
        .await
        .unwrap();
    let (text, _) = collect_text(stream).await;
    assert!(text.contains("sequence exhausted"));
    assert_eq!(mock.call_count().await, 3);
}

// ===========================================================================
// Retry policy
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn retry_recovers_from_transport_error() {
    let mock = MockProvider::sequence(vec![
        MockBehavior::Error("connection reset".into()),
        MockBehavior::Text("recovered".into()),
    ]);
    let stream = complete_stream_with_retry(&mock, LlmRequest::default(), None)
        .await
        .unwrap();
    let (text, _) = collect_text(stream).await;
    assert_eq!(text, "recovered");
    assert_eq!(mock.call_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_after_max_attempts() {
    let mock = MockProvider::constant(MockBehavior::Error("still down".into()));
    let result = complete_stream_with_retry(&mock, LlmRequest::default(), None).await;
    match result {
        Err(err) => assert!(matches!(err, ProviderError::Transport(_))),
        Ok(_) => panic!("expected retry to give up with an error"),
    }
    assert_eq!(mock.call_count().await, 3);
}

#[test]
fn provider_error_recoverability() {
    assert!(ProviderError::Transport("x".into()).is_recoverable());
    assert!(ProviderError::RateLimited { retry_after_ms: 1 }.is_recoverable());
    assert!(!ProviderError::Auth("x".into()).is_recoverable());
    assert!(!ProviderError::InvalidResponse("x".into()).is_recoverable());
}
