//! Tool system: descriptors, handlers, and the registry.
//!
//! A [`ToolDescriptor`] pairs a JSON-Schema contract with an execution
//! location:
//!
//! - **Backend** tools carry an async handler and run inside the agent
//!   process during tool dispatch.
//! - **Frontend** tools are schema-only. The model can call them, but the
//!   agent pauses and relays the call off-process; the result comes back
//!   through the resume API.
//!
//! Handlers use the `Arc<dyn Fn(Value) -> Pin<Box<dyn Future>>>` pattern so
//! tools with different concrete async functions live in one registry and
//! can be shared across threads.
//!
//! The [`ToolRegistry`] executes by name and never unwinds into the step
//! loop: unknown tools and handler failures come back as error strings the
//! model can react to. Multimodal outputs are persisted through the file
//! backend and surfaced to stream consumers as references while the API
//! payload keeps the base64 content.

use crate::error::Result;
use crate::files::FileBackend;
use crate::schema::{SchemaFormat, convert_schemas};
use crate::types::{ContentBlock, ImageBlock, ImageRef, TextBlock, ToolResultContent};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Where a tool executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecutor {
    /// Executed by the agent process during tool dispatch
    #[default]
    Backend,
    /// Executed off-process; the agent pauses and awaits results
    Frontend,
}

/// Async tool handler: JSON input in, [`ToolOutput`] out.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>> + Send + Sync>;

/// What a backend tool returns: plain text, or an ordered list of parts for
/// multimodal results.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Parts(Vec<ToolPart>),
}

/// One part of a multimodal tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPart {
    Text(String),
    Image {
        data: Vec<u8>,
        media_type: String,
    },
}

impl ToolOutput {
    /// Text-only result (the common case).
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput::Text(text.into())
    }

    /// Text plus one image.
    pub fn with_image(
        text: impl Into<String>,
        data: Vec<u8>,
        media_type: impl Into<String>,
    ) -> Self {
        ToolOutput::Parts(vec![
            ToolPart::Text(text.into()),
            ToolPart::Image {
                data,
                media_type: media_type.into(),
            },
        ])
    }
}

/// Capability interface for stateful tools that need to know which agent
/// they serve. The registry calls `bind` once when the agent initializes.
pub trait ScopedToAgent: Send + Sync {
    fn bind(&self, agent_uuid: &str);
}

/// A registered tool: contract plus (for backend tools) a callable.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    input_schema: Value,
    executor: ToolExecutor,
    handler: Option<ToolHandler>,
    scoped: Option<Arc<dyn ScopedToAgent>>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("executor", &self.executor)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl ToolDescriptor {
    /// Define a backend tool with an async handler.
    pub fn backend<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            executor: ToolExecutor::Backend,
            handler: Some(Arc::new(move |input| Box::pin(handler(input)))),
            scoped: None,
        }
    }

    /// Define a frontend tool: schema only, no callable.
    pub fn frontend(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            executor: ToolExecutor::Frontend,
            handler: None,
            scoped: None,
        }
    }

    /// Attach a [`ScopedToAgent`] hook, called once at agent initialization.
    pub fn with_scope(mut self, scoped: Arc<dyn ScopedToAgent>) -> Self {
        self.scoped = Some(scoped);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn executor(&self) -> ToolExecutor {
        self.executor
    }

    /// Native wire schema: `{name, description, input_schema}`.
    pub fn schema(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }
}

/// The outcome of one registry execution: content for the API payload,
/// artifact references for the stream consumer, and whether the tool
/// failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    pub content: ToolResultContent,
    pub image_refs: Vec<ImageRef>,
    pub is_error: bool,
}

impl ToolExecution {
    fn error(message: impl Into<String>) -> Self {
        Self {
            content: ToolResultContent::Text(message.into()),
            image_refs: Vec::new(),
            is_error: true,
        }
    }
}

/// Registry of tool descriptors with execute-by-name dispatch.
///
/// Names are unique within an agent; registration order is preserved for
/// schema listings but otherwise irrelevant.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails on duplicate names.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        if self.index.contains_key(descriptor.name()) {
            return Err(crate::error::Error::config(format!(
                "tool '{}' is already registered",
                descriptor.name()
            )));
        }
        self.index
            .insert(descriptor.name().to_string(), self.tools.len());
        self.tools.push(descriptor);
        Ok(())
    }

    /// Register several tools at once.
    pub fn register_all(&mut self, descriptors: Vec<ToolDescriptor>) -> Result<()> {
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All tool schemas in the requested wire format, registration order.
    pub fn schemas(&self, format: SchemaFormat) -> Result<Vec<Value>> {
        let native: Vec<Value> = self.tools.iter().map(ToolDescriptor::schema).collect();
        convert_schemas(&native, format)
    }

    /// Native schemas for one executor location.
    pub fn schemas_for(&self, executor: ToolExecutor) -> Vec<Value> {
        self.tools
            .iter()
            .filter(|t| t.executor() == executor)
            .map(ToolDescriptor::schema)
            .collect()
    }

    /// Call every registered [`ScopedToAgent`] hook with the agent's UUID.
    pub fn bind_agent(&self, agent_uuid: &str) {
        for tool in &self.tools {
            if let Some(scoped) = &tool.scoped {
                scoped.bind(agent_uuid);
            }
        }
    }

    /// Execute a backend tool by name.
    ///
    /// Never returns `Err`: unknown tools, frontend tools, and handler
    /// failures all fold into an error-string execution so the step loop
    /// keeps going and the model gets a chance to recover.
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        file_backend: Option<&dyn FileBackend>,
        agent_uuid: Option<&str>,
    ) -> ToolExecution {
        let Some(tool) = self.get(name) else {
            return ToolExecution::error(format!("Error: Unknown tool '{name}'"));
        };

        if tool.executor() == ToolExecutor::Frontend {
            return ToolExecution::error(format!(
                "Error: Tool '{name}' is a frontend tool and cannot run in the agent process"
            ));
        }

        let Some(handler) = &tool.handler else {
            return ToolExecution::error(format!("Error: Tool '{name}' has no callable"));
        };

        match handler(input).await {
            Ok(output) => self.convert_output(output, file_backend, agent_uuid).await,
            Err(e) => ToolExecution::error(format!("Error executing {name}: {e}")),
        }
    }

    /// Convert a [`ToolOutput`] into API content plus streaming references,
    /// persisting artifacts along the way.
    async fn convert_output(
        &self,
        output: ToolOutput,
        file_backend: Option<&dyn FileBackend>,
        agent_uuid: Option<&str>,
    ) -> ToolExecution {
        match output {
            ToolOutput::Text(text) => ToolExecution {
                content: ToolResultContent::Text(text),
                image_refs: Vec::new(),
                is_error: false,
            },
            ToolOutput::Parts(parts) => {
                let mut blocks = Vec::with_capacity(parts.len());
                let mut image_refs = Vec::new();

                for part in parts {
                    match part {
                        ToolPart::Text(text) => {
                            blocks.push(ContentBlock::Text(TextBlock::new(text)));
                        }
                        ToolPart::Image { data, media_type } => {
                            let image_id =
                                format!("img_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

                            // The API payload always carries base64 content.
                            blocks.push(ContentBlock::Image(ImageBlock::from_bytes(
                                &media_type,
                                &data,
                            )));

                            // The stream consumer gets a reference instead.
                            if let (Some(backend), Some(agent_uuid)) = (file_backend, agent_uuid) {
                                let ext =
                                    media_type.split('/').nth(1).unwrap_or("bin").to_string();
                                let filename = format!("{image_id}.{ext}");
                                match backend
                                    .store(&image_id, &filename, &data, agent_uuid)
                                    .await
                                {
                                    Ok(metadata) => {
                                        let src = match metadata.backend_id.as_str() {
                                            // Remote backends expose a usable location directly
                                            "s3" | "object_store" => metadata
                                                .storage_location
                                                .unwrap_or_default(),
                                            // Local and no-op backends serve through the API path
                                            _ => format!(
                                                "/agent/{agent_uuid}/images/{image_id}"
                                            ),
                                        };
                                        image_refs.push(ImageRef {
                                            image_id,
                                            src,
                                            media_type,
                                        });
                                    }
                                    Err(e) => {
                                        log::warn!("failed to persist tool image: {e}");
                                    }
                                }
                            }
                        }
                    }
                }

                ToolExecution {
                    content: ToolResultContent::Blocks(blocks),
                    image_refs,
                    is_error: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::NoopFileBackend;
    use std::sync::Mutex;

    fn add_tool() -> ToolDescriptor {
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

    fn confirm_tool() -> ToolDescriptor {
        ToolDescriptor::frontend(
            "user_confirm",
            "Ask the user for yes/no confirmation",
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }),
        )
    }

    #[test]
    fn test_register_enforces_unique_names() {
        let mut registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();
        assert!(registry.register(add_tool()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_schemas_by_executor() {
        let mut registry = ToolRegistry::new();
        registry
            .register_all(vec![add_tool(), confirm_tool()])
            .unwrap();

        let backend = registry.schemas_for(ToolExecutor::Backend);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend[0]["name"], "add");

        let frontend = registry.schemas_for(ToolExecutor::Frontend);
        assert_eq!(frontend.len(), 1);
        assert_eq!(frontend[0]["name"], "user_confirm");
    }

    #[test]
    fn test_schema_format_conversion() {
        let mut registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();

        let native = registry.schemas(SchemaFormat::Native).unwrap();
        assert_eq!(native[0]["name"], "add");
        assert!(native[0]["input_schema"].is_object());

        let fc = registry.schemas(SchemaFormat::FunctionCall).unwrap();
        assert_eq!(fc[0]["type"], "function");
        assert_eq!(fc[0]["function"]["name"], "add");
        assert_eq!(fc[0]["function"]["parameters"], native[0]["input_schema"]);
    }

    #[tokio::test]
    async fn test_execute_backend_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();

        let execution = registry
            .execute("add", json!({"a": 2, "b": 3}), None, None)
            .await;
        assert!(!execution.is_error);
        assert_eq!(execution.content, ToolResultContent::Text("5".into()));
        assert!(execution.image_refs.is_empty());
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_is_an_error_string() {
        let registry = ToolRegistry::new();
        let execution = registry.execute("missing", json!({}), None, None).await;
        assert!(execution.is_error);
        assert_eq!(
            execution.content.to_text(),
            "Error: Unknown tool 'missing'"
        );
    }

    #[tokio::test]
    async fn test_execute_frontend_tool_is_refused() {
        let mut registry = ToolRegistry::new();
        registry.register(confirm_tool()).unwrap();
        let execution = registry
            .execute("user_confirm", json!({"message": "?"}), None, None)
            .await;
        assert!(execution.is_error);
        assert!(execution.content.to_text().contains("frontend tool"));
    }

    #[tokio::test]
    async fn test_handler_failure_folds_into_error_string() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::backend(
                "explode",
                "Always fails",
                json!({"type": "object", "properties": {}}),
                |_input| async move {
                    Err::<ToolOutput, _>(crate::error::Error::tool("kaboom"))
                },
            ))
            .unwrap();

        let execution = registry.execute("explode", json!({}), None, None).await;
        assert!(execution.is_error);
        assert!(execution.content.to_text().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_multimodal_output_persists_refs() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::backend(
                "screenshot",
                "Take a screenshot",
                json!({"type": "object", "properties": {}}),
                |_input| async move {
                    Ok(ToolOutput::with_image(
                        "Here you go:",
                        vec![0x89, 0x50, 0x4e, 0x47],
                        "image/png",
                    ))
                },
            ))
            .unwrap();

        let backend = NoopFileBackend::new();
        let execution = registry
            .execute("screenshot", json!({}), Some(&backend), Some("agent-1"))
            .await;

        assert!(!execution.is_error);
        assert_eq!(execution.image_refs.len(), 1);
        let image_ref = &execution.image_refs[0];
        assert!(image_ref.image_id.starts_with("img_"));
        assert_eq!(
            image_ref.src,
            format!("/agent/agent-1/images/{}", image_ref.image_id)
        );
        assert_eq!(image_ref.media_type, "image/png");

        // API content keeps the base64 payload alongside the text part.
        match &execution.content {
            ToolResultContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(blocks[0], ContentBlock::Text(_)));
                assert!(matches!(blocks[1], ContentBlock::Image(_)));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multimodal_without_backend_still_builds_api_content() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::backend(
                "screenshot",
                "Take a screenshot",
                json!({"type": "object", "properties": {}}),
                |_input| async move {
                    Ok(ToolOutput::with_image("img:", vec![1, 2], "image/png"))
                },
            ))
            .unwrap();

        let execution = registry.execute("screenshot", json!({}), None, None).await;
        assert!(!execution.is_error);
        assert!(execution.image_refs.is_empty());
        assert!(matches!(execution.content, ToolResultContent::Blocks(_)));
    }

    #[test]
    fn test_scoped_binding() {
        struct Recorder(Mutex<Vec<String>>);
        impl ScopedToAgent for Recorder {
            fn bind(&self, agent_uuid: &str) {
                self.0.lock().unwrap().push(agent_uuid.to_string());
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut registry = ToolRegistry::new();
        registry
            .register(add_tool().with_scope(recorder.clone()))
            .unwrap();
        registry.register(confirm_tool()).unwrap();

        registry.bind_agent("agent-42");
        assert_eq!(*recorder.0.lock().unwrap(), vec!["agent-42".to_string()]);
    }
}
