//! MCP server implementation using rmcp.
//!
//! Exposes UI automation operations as MCP tools. Every tool goes through the
//! supervisor, so a hung or crashing automation call costs one worker, never
//! the server.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::requests::{
    ElementInfoRequest, FindElementsRequest, GetTextRequest, GetValueRequest, GridInfoRequest,
    GridItemRequest, InvokeRequest, ScrollRequest, SelectItemRequest, SetValueRequest,
    SetWindowStateRequest, ToggleRequest, WaitForElementRequest,
};
use crate::supervisor::Supervisor;
use crate::transport::{OperationRequest, OperationResponse};

/// MCP server for UI automation.
#[derive(Clone)]
pub struct BridgeServer {
    supervisor: Arc<Supervisor>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the generic execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOperationParams {
    /// Operation name (case-insensitive), e.g. "Invoke" or "FindElements".
    #[schemars(description = "Operation name (case-insensitive), e.g. 'Invoke' or 'FindElements'")]
    pub operation: String,

    /// Operation parameters, e.g. {"elementId": "OkButton"}.
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,

    /// Deadline in seconds; omitted or 0 uses the server default.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn tool_result(response: OperationResponse) -> CallToolResult {
    if response.is_success() {
        let text = match response.data {
            Value::String(s) => s,
            Value::Null => "OK".to_string(),
            other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
        };
        CallToolResult::success(vec![Content::text(text)])
    } else {
        let kind = response.error_type().map(str::to_string);
        let message = response
            .error
            .unwrap_or_else(|| "operation failed without an error message".into());
        let text = match kind {
            Some(kind) => format!("{message} [{kind}]"),
            None => message,
        };
        CallToolResult::error(vec![Content::text(text)])
    }
}

#[tool_router]
impl BridgeServer {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            tool_router: Self::tool_router(),
        }
    }

    /// Run any registered operation by name.
    #[tool(description = "Run a UI automation operation by name with a free-form parameter object")]
    async fn execute_operation(
        &self,
        Parameters(params): Parameters<ExecuteOperationParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.operation.trim().is_empty() {
            return Err(McpError::invalid_params("operation must not be empty", None));
        }
        info!(operation = %params.operation, "Executing operation");
        let parameters = params.parameters.unwrap_or_default();
        let request = OperationRequest::with_parameters(params.operation, parameters);
        let response = self
            .supervisor
            .execute(&request, params.timeout_seconds.unwrap_or(0))
            .await;
        if !response.is_success() {
            warn!(operation = %request.operation, error = ?response.error, "Operation failed");
        }
        Ok(tool_result(response))
    }

    #[tool(description = "List every operation the automation worker supports, with aliases")]
    async fn list_operations(&self) -> Result<CallToolResult, McpError> {
        let response = self
            .supervisor
            .execute(&OperationRequest::new("ListOperations"), 0)
            .await;
        Ok(tool_result(response))
    }

    #[tool(description = "Find UI elements by name, automation id, control type or class name")]
    async fn find_elements(
        &self,
        Parameters(request): Parameters<FindElementsRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Describe a UI element: name, type, bounds and supported patterns")]
    async fn get_element_info(
        &self,
        Parameters(request): Parameters<ElementInfoRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Wait until a UI element matching the criteria appears")]
    async fn wait_for_element(
        &self,
        Parameters(request): Parameters<WaitForElementRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Invoke (click) a UI element")]
    async fn invoke_element(
        &self,
        Parameters(request): Parameters<InvokeRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Set the value of an editable UI element")]
    async fn set_value(
        &self,
        Parameters(request): Parameters<SetValueRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Read the value of a UI element")]
    async fn get_value(
        &self,
        Parameters(request): Parameters<GetValueRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Toggle a checkbox or toggle button")]
    async fn toggle_element(
        &self,
        Parameters(request): Parameters<ToggleRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Minimize, maximize or restore a window")]
    async fn set_window_state(
        &self,
        Parameters(request): Parameters<SetWindowStateRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Select a list or tree item")]
    async fn select_item(
        &self,
        Parameters(request): Parameters<SelectItemRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Scroll a scrollable UI element up, down, left or right")]
    async fn scroll_element(
        &self,
        Parameters(request): Parameters<ScrollRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Read the text content of a UI element")]
    async fn get_text(
        &self,
        Parameters(request): Parameters<GetTextRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Row and column counts of a grid or table")]
    async fn get_grid_info(
        &self,
        Parameters(request): Parameters<GridInfoRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Describe the cell at a row and column of a grid")]
    async fn get_grid_item(
        &self,
        Parameters(request): Parameters<GridItemRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.supervisor.call(request).await))
    }

    #[tool(description = "Show worker processes: pid, liveness, request and restart counters")]
    async fn worker_status(&self) -> Result<CallToolResult, McpError> {
        let status = serde_json::to_string_pretty(&self.supervisor.status())
            .map_err(|e| McpError::internal_error(format!("Failed to encode status: {e}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(status)]))
    }
}

#[tool_handler]
impl ServerHandler for BridgeServer {
    fn get_info(&self) -> ServerInfo {
        let settings = self.supervisor.settings();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "uia-bridge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Drive desktop applications through UI Automation.\n\
                 Find elements with 'find_elements', then act on them by elementId \
                 ('invoke_element', 'set_value', 'toggle_element', ...).\n\
                 'execute_operation' runs any operation from 'list_operations'.\n\
                 Calls time out after {}s unless timeoutSeconds is given.",
                settings.default_timeout_seconds
            )),
        }
    }
}

/// Serve the bridge over stdio. Workers are shut down when the client
/// disconnects.
pub async fn serve_stdio(supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    let reaper = supervisor.start_reaper();
    let server = BridgeServer::new(Arc::clone(&supervisor));

    info!("Starting MCP server on stdio");

    let result: anyhow::Result<()> = async {
        let service = server
            .serve(stdio())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

        service
            .waiting()
            .await
            .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;
        Ok(())
    }
    .await;

    info!("Client disconnected, stopping workers");
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    supervisor.shutdown().await;
    result
}
