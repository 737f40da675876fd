//! Frontend-tool relay tests: pause, checkpoint, rehydrate, resume.

mod common;

use common::{ScriptedClient, add_tool, confirm_tool, drain, text_turn, tool_turn};
use relay_agent::prelude::*;
use relay_agent::storage::filesystem::{
    FilesystemConfigStore, FilesystemConversationStore, FilesystemRunLogStore,
};
use relay_agent::storage::{ConfigStore, ConversationStore, RunLogStore};
use serde_json::json;
use std::sync::Arc;

fn config_with_uuid(uuid: &str) -> AgentConfig {
    AgentConfig::builder()
        .model("claude-sonnet-4-5")
        .system_prompt("Ask before acting")
        .agent_uuid(uuid)
        .build()
        .unwrap()
}

#[tokio::test]
async fn pause_resume_across_agent_instances_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config_store: Arc<dyn ConfigStore> =
        Arc::new(FilesystemConfigStore::new(dir.path()));
    let conversation_store: Arc<dyn ConversationStore> =
        Arc::new(FilesystemConversationStore::new(dir.path()));
    let run_log_store: Arc<dyn RunLogStore> =
        Arc::new(FilesystemRunLogStore::new(dir.path()));

    let client = Arc::new(ScriptedClient::new(vec![
        tool_turn("F1", "user_confirm", json!({"message": "Proceed?"})),
        text_turn("confirmed and done", StopReason::EndTurn),
    ]));

    // First instance runs until the frontend tool pauses it.
    let mut agent = Agent::builder()
        .config(config_with_uuid("relay-agent-1"))
        .client(client.clone())
        .tool(confirm_tool())
        .config_store(config_store.clone())
        .conversation_store(conversation_store.clone())
        .run_log_store(run_log_store.clone())
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let (tx, mut rx) = output_channel();
    let outcome = agent.run("Do the thing", tx).await.unwrap();

    assert_eq!(outcome.stop_reason, "awaiting_frontend_tools");
    assert_eq!(outcome.pending_frontend_tools.len(), 1);
    let pending = &outcome.pending_frontend_tools[0];
    assert_eq!(pending.tool_use_id, "F1");
    assert_eq!(pending.name, "user_confirm");
    assert_eq!(pending.input, json!({"message": "Proceed?"}));

    // The terminal marker reached the stream.
    let chunks = drain(&mut rx).concat();
    assert!(chunks.contains("<awaiting_frontend_tools data=\""));

    // The checkpoint is on disk with the relay state.
    let stored = config_store.load("relay-agent-1").await.unwrap().unwrap();
    assert!(stored.awaiting_frontend_tools);
    assert_eq!(stored.current_step, 1);
    assert_eq!(stored.pending_frontend_tools.len(), 1);
    assert!(stored.pending_assistant_message.is_some());

    drop(agent);

    // A fresh instance over the same storage observes the pause.
    let mut resumed = Agent::builder()
        .config(config_with_uuid("relay-agent-1"))
        .client(client.clone())
        .tool(confirm_tool())
        .config_store(config_store.clone())
        .conversation_store(conversation_store.clone())
        .run_log_store(run_log_store.clone())
        .build()
        .unwrap();
    resumed.initialize().await.unwrap();
    assert_eq!(resumed.state(), AgentState::AwaitingFrontend);
    assert_eq!(resumed.pending_frontend_tools().len(), 1);

    // Resume with the matching id completes the run.
    let (tx, _rx) = output_channel();
    let outcome = resumed
        .continue_with_tool_results(
            vec![FrontendToolResult {
                tool_use_id: "F1".into(),
                content: "yes".into(),
                is_error: false,
            }],
            tx,
        )
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, "end_turn");
    assert_eq!(outcome.final_text.as_deref(), Some("confirmed and done"));

    // Durable history holds the full exchange, atomically appended.
    let history = resumed.history();
    assert_eq!(history.len(), 4);
    match &history[2].content[0] {
        ContentBlock::ToolResult(r) => {
            assert_eq!(r.tool_use_id, "F1");
        }
        other => panic!("unexpected block: {other:?}"),
    }

    // Relay state is gone from the durable checkpoint too.
    let stored = config_store.load("relay-agent-1").await.unwrap().unwrap();
    assert!(!stored.awaiting_frontend_tools);
    assert!(stored.pending_frontend_tools.is_empty());
    assert!(stored.pending_assistant_message.is_none());
}

#[tokio::test]
async fn resume_validation_rejects_without_mutating_state() {
    let client = Arc::new(ScriptedClient::new(vec![tool_turn(
        "F1",
        "user_confirm",
        json!({"message": "?"}),
    )]));
    let mut agent = Agent::builder()
        .config(config_with_uuid("relay-agent-2"))
        .client(client)
        .tool(confirm_tool())
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let (tx, _rx) = output_channel();
    agent.run("go", tx).await.unwrap();
    assert_eq!(agent.state(), AgentState::AwaitingFrontend);

    // Wrong id
    let (tx, _rx) = output_channel();
    let err = agent
        .continue_with_tool_results(
            vec![FrontendToolResult {
                tool_use_id: "NOPE".into(),
                content: "yes".into(),
                is_error: false,
            }],
            tx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Relay(_)));

    // Wrong count
    let (tx, _rx) = output_channel();
    let err = agent
        .continue_with_tool_results(
            vec![
                FrontendToolResult {
                    tool_use_id: "F1".into(),
                    content: "yes".into(),
                    is_error: false,
                },
                FrontendToolResult {
                    tool_use_id: "F1".into(),
                    content: "yes again".into(),
                    is_error: false,
                },
            ],
            tx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Relay(_)));

    // Empty set
    let (tx, _rx) = output_channel();
    let err = agent
        .continue_with_tool_results(vec![], tx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Relay(_)));

    // Still paused with identical pending state after every rejection.
    assert_eq!(agent.state(), AgentState::AwaitingFrontend);
    assert_eq!(agent.pending_frontend_tools().len(), 1);
    assert_eq!(agent.pending_frontend_tools()[0].tool_use_id, "F1");
    assert_eq!(agent.history().len(), 1);
}

#[tokio::test]
async fn frontend_error_results_carry_the_error_flag() {
    let client = Arc::new(ScriptedClient::new(vec![
        tool_turn("F1", "user_confirm", json!({"message": "?"})),
        text_turn("understood", StopReason::EndTurn),
    ]));
    let mut agent = Agent::builder()
        .config(config_with_uuid("relay-agent-3"))
        .client(client)
        .tool(confirm_tool())
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let (tx, _rx) = output_channel();
    agent.run("go", tx).await.unwrap();

    let (tx, _rx) = output_channel();
    agent
        .continue_with_tool_results(
            vec![FrontendToolResult {
                tool_use_id: "F1".into(),
                content: "user dismissed the dialog".into(),
                is_error: true,
            }],
            tx,
        )
        .await
        .unwrap();

    match &agent.history()[2].content[0] {
        ContentBlock::ToolResult(r) => {
            assert_eq!(r.is_error, Some(true));
            assert_eq!(r.content.to_text(), "user dismissed the dialog");
        }
        other => panic!("unexpected block: {other:?}"),
    }
}

#[tokio::test]
async fn backend_tools_still_run_before_a_pause() {
    // Backend call first, frontend second, in one assistant message.
    let mixed = {
        use relay_agent::provider::{
            Delta, MessageDeltaBody, MessageStart, RawContentBlock, StreamEvent,
        };
        use relay_agent::Usage;
        vec![
            StreamEvent::MessageStart {
                message: MessageStart {
                    id: "msg".into(),
                    model: "claude-sonnet-4-5".into(),
                    usage: Usage::default(),
                },
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: RawContentBlock {
                    block_type: "tool_use".into(),
                    id: Some("B1".into()),
                    name: Some("add".into()),
                    ..Default::default()
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: json!({"a": 5, "b": 6}).to_string(),
                },
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: RawContentBlock {
                    block_type: "tool_use".into(),
                    id: Some("F1".into()),
                    name: Some("user_confirm".into()),
                    ..Default::default()
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: Delta::InputJsonDelta {
                    partial_json: json!({"message": "Report 11?"}).to_string(),
                },
            },
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(StopReason::ToolUse),
                    stop_sequence: None,
                },
                usage: Usage::default(),
            },
            StreamEvent::MessageStop,
        ]
    };

    let client = Arc::new(ScriptedClient::new(vec![
        mixed,
        text_turn("11", StopReason::EndTurn),
    ]));
    let mut agent = Agent::builder()
        .config(config_with_uuid("relay-agent-4"))
        .client(client)
        .tool(add_tool())
        .tool(confirm_tool())
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let (tx, _rx) = output_channel();
    let outcome = agent.run("add then confirm", tx).await.unwrap();
    assert_eq!(outcome.stop_reason, "awaiting_frontend_tools");
    // The backend result was produced before the pause and is stashed.
    assert_eq!(agent.config().pending_backend_results.len(), 1);
    assert_eq!(agent.config().pending_backend_results[0].tool_use_id, "B1");

    let (tx, _rx) = output_channel();
    let outcome = agent
        .continue_with_tool_results(
            vec![FrontendToolResult {
                tool_use_id: "F1".into(),
                content: "yes".into(),
                is_error: false,
            }],
            tx,
        )
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, "end_turn");

    // Merged in tool_use order: the backend result precedes the frontend.
    let results: Vec<_> = agent
        .history()
        .iter()
        .flat_map(|m| &m.content)
        .filter_map(|b| match b {
            ContentBlock::ToolResult(r) => Some(r.tool_use_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec!["B1", "F1"]);
}
