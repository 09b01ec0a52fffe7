//! Seam through which workflows and agents reach generation and tools

use async_trait::async_trait;
use rago_core::{
    CancellationToken, GenerationRequest, GenerationResponse, RagoResult, ToolDefinition,
    ToolOutput,
};
use serde_json::Value;
use std::time::Duration;

/// Generation and tool execution as seen by the workflow engine.
///
/// The engine never talks to providers or tool servers directly; the
/// orchestrator supplies an implementation wired to both.
#[async_trait]
pub trait StepBackend: Send + Sync {
    /// Tool-augmented generation when `request.tools` is non-empty
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> RagoResult<ToolOutput>;

    /// Definitions for the named tools; unknown names are left out
    async fn tool_definitions(&self, names: &[String]) -> Vec<ToolDefinition>;
}
