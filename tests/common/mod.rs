//! Shared fixtures for integration tests: a scripted provider client and
//! event-sequence builders.

#![allow(dead_code)]

use async_trait::async_trait;
use relay_agent::provider::{
    Delta, EventStream, MessageDeltaBody, MessageStart, ProviderRequest, RawContentBlock,
    StreamEvent,
};
use relay_agent::{ProviderClient, Result, StopReason, ToolDescriptor, ToolOutput, Usage};
use serde_json::{Value, json};
use std::sync::Mutex;

/// Provider client that replays scripted event sequences, one per
/// `stream` call, and records every request it saw.
pub struct ScriptedClient {
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        let mut reversed = scripts;
        reversed.reverse();
        Self {
            scripts: Mutex::new(reversed),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn stream(&self, request: &ProviderRequest) -> Result<EventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop().unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(
            script.into_iter().map(Ok).collect::<Vec<_>>(),
        )))
    }

    async fn count_tokens(&self, _request: &ProviderRequest) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// A complete streamed turn with a single text block.
pub fn text_turn(text: &str, stop: StopReason) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            message: MessageStart {
                id: "msg".into(),
                model: "claude-sonnet-4-5".into(),
                usage: Usage {
                    input_tokens: 25,
                    ..Default::default()
                },
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: RawContentBlock {
                block_type: "text".into(),
                ..Default::default()
            },
        },
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::TextDelta { text: text.into() },
        },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop),
                stop_sequence: None,
            },
            usage: Usage {
                output_tokens: 9,
                ..Default::default()
            },
        },
        StreamEvent::MessageStop,
    ]
}

/// A complete streamed turn requesting one tool call.
pub fn tool_turn(id: &str, name: &str, input: Value) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            message: MessageStart {
                id: "msg".into(),
                model: "claude-sonnet-4-5".into(),
                usage: Usage {
                    input_tokens: 40,
                    ..Default::default()
                },
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: RawContentBlock {
                block_type: "tool_use".into(),
                id: Some(id.into()),
                name: Some(name.into()),
                ..Default::default()
            },
        },
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::InputJsonDelta {
                partial_json: input.to_string(),
            },
        },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::ToolUse),
                stop_sequence: None,
            },
            usage: Usage {
                output_tokens: 15,
                ..Default::default()
            },
        },
        StreamEvent::MessageStop,
    ]
}

/// The `add` tool used across tests.
pub fn add_tool() -> ToolDescriptor {
    ToolDescriptor::backend(
        "add",
        "Add two numbers together",
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        }),
        |input| async move {
            let a = input["a"].as_f64().unwrap_or(0.0);
            let b = input["b"].as_f64().unwrap_or(0.0);
            Ok(ToolOutput::text(format!("{}", a + b)))
        },
    )
}

/// The schema-only `user_confirm` frontend tool used across tests.
pub fn confirm_tool() -> ToolDescriptor {
    ToolDescriptor::frontend(
        "user_confirm",
        "Ask the user for yes/no confirmation before proceeding",
        json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        }),
    )
}

/// Drain whatever is currently buffered on an output receiver.
pub fn drain(rx: &mut relay_agent::OutputReceiver) -> Vec<String> {
    let mut chunks = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        chunks.push(chunk);
    }
    chunks
}
