//! Workflow engine access to generation and tools

use async_trait::async_trait;
use rago_agents::StepBackend;
use rago_core::{
    CancellationToken, Component, ErrorKind, GenerationRequest, GenerationResponse, RagoError,
    RagoResult, ToolDefinition, ToolOutput,
};
use rago_llm::ProviderRegistry;
use rago_mcp::ToolHost;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Routes workflow generate steps to the provider registry and tool steps
/// to the tool host. Either pillar may be switched off.
pub(crate) struct PillarBackend {
    llm: Option<Arc<ProviderRegistry>>,
    tools: Option<Arc<ToolHost>>,
}

impl PillarBackend {
    pub(crate) fn new(llm: Option<Arc<ProviderRegistry>>, tools: Option<Arc<ToolHost>>) -> Self {
        Self { llm, tools }
    }
}

#[async_trait]
impl StepBackend for PillarBackend {
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        let llm = self.llm.as_ref().ok_or_else(|| {
            RagoError::new(ErrorKind::NoExecutionBackend, "generation pillar is disabled")
                .at(Component::Agents, "generate")
        })?;
        if request.tools.is_empty() {
            llm.generate(&request, cancel).await
        } else {
            llm.generate_with_tools(&request, cancel).await
        }
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> RagoResult<ToolOutput> {
        let tools = self.tools.as_ref().ok_or_else(|| {
            RagoError::new(ErrorKind::ToolServerUnavailable, "tool pillar is disabled")
                .at(Component::Agents, "call_tool")
        })?;
        tools.call_tool(name, arguments, timeout, cancel).await
    }

    async fn tool_definitions(&self, names: &[String]) -> Vec<ToolDefinition> {
        let Some(tools) = self.tools.as_ref() else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|name| tools.get_tool(name))
            .filter(|tool| tool.enabled)
            .map(|tool| tool.definition())
            .collect()
    }
}
