//! MCP server lifecycle for the Moku tools.
//!
//! 1. **Initialisation**: `initialize` request, then the
//!    `notifications/initialized` notification
//! 2. **Operation**: `tools/list`, `tools/call` and `ping`
//! 3. **Shutdown**: EOF on the input stream or a termination signal; any
//!    attached device is released before the server returns
//!
//! Requests are handled one at a time, in arrival order.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::mcp::protocol::{
    parse_message, Incoming, Reply, Request, RpcError, MCP_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::mcp::tools::ToolContext;
use crate::mcp::transport::{LineTransport, StdioTransport};

/// Server state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
}

/// Server capabilities advertised during initialisation.
#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    /// Tool-related capabilities.
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change during the session.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Server information for initialisation response.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: &'static str,
    /// Server version.
    pub version: &'static str,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: SERVER_NAME,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Client information received during initialisation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Parameters for the initialize request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by client.
    pub protocol_version: String,
    /// Client capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Client information.
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// Parameters for tools/call request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments for the tool.
    #[serde(default)]
    pub arguments: Value,
}

/// The MCP server, generic over its byte streams.
pub struct McpServer<R, W> {
    state: ServerState,
    transport: LineTransport<R, W>,
    tools: ToolContext,
}

impl McpServer<tokio::io::Stdin, tokio::io::Stdout> {
    /// Creates a server on the process's stdio.
    #[must_use]
    pub fn stdio(tools: ToolContext) -> Self {
        Self::new(StdioTransport::stdio(), tools)
    }
}

impl<R, W> McpServer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a server on `transport`.
    pub const fn new(transport: LineTransport<R, W>, tools: ToolContext) -> Self {
        Self {
            state: ServerState::AwaitingInit,
            transport,
            tools,
        }
    }

    /// Returns the current server state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// The tool context.
    #[must_use]
    pub const fn tools(&self) -> &ToolContext {
        &self.tools
    }

    /// Runs until EOF or a termination signal, then releases any device.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let result = self.run_with_shutdown().await;
        self.state = ServerState::ShuttingDown;
        self.tools.shutdown().await;
        tracing::info!("MCP server stopped");
        result
    }

    #[cfg(unix)]
    async fn run_with_shutdown(&mut self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(std::io::Error::other)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(std::io::Error::other)?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    return Ok(());
                }

                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    return Ok(());
                }

                line_result = self.transport.read_line() => {
                    let Some(line) = line_result? else {
                        tracing::info!("Input closed, shutting down");
                        return Ok(());
                    };
                    self.handle_line(&line).await?;
                }
            }
        }
    }

    #[cfg(windows)]
    async fn run_with_shutdown(&mut self) -> std::io::Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                    return Ok(());
                }

                line_result = self.transport.read_line() => {
                    let Some(line) = line_result? else {
                        tracing::info!("Input closed, shutting down");
                        return Ok(());
                    };
                    self.handle_line(&line).await?;
                }
            }
        }
    }

    /// Handles a single line of input.
    async fn handle_line(&mut self, line: &str) -> std::io::Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }

        match parse_message(line) {
            Ok(Incoming::Request(req)) => self.handle_request(req).await,
            Ok(Incoming::Notification { method }) => {
                self.handle_notification(&method);
                Ok(())
            }
            Err(rejection) => {
                tracing::debug!(code = ?rejection.error_code(), "Rejected malformed message");
                self.transport.write_message(&rejection).await
            }
        }
    }

    /// Handles an incoming request.
    async fn handle_request(&mut self, req: Request) -> std::io::Result<()> {
        tracing::debug!(id = %req.id, method = %req.method, "Request");

        let outcome = match req.method.as_str() {
            "initialize" => self.handle_initialize(&req),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(&req).await,
            "ping" => Ok(json!({})),
            _ => Err(RpcError::method_not_found(&req.method)),
        };

        self.transport
            .write_message(&Reply::answer(req.id, outcome))
            .await
    }

    /// Handles an incoming notification.
    fn handle_notification(&mut self, method: &str) {
        if method == "notifications/initialized" && self.state == ServerState::Initialising {
            tracing::info!("Client initialised");
            self.state = ServerState::Running;
        } else {
            tracing::debug!(method, "Ignoring notification");
        }
    }

    /// Handles the initialize request.
    fn handle_initialize(&mut self, req: &Request) -> Result<Value, RpcError> {
        if self.state != ServerState::AwaitingInit {
            return Err(RpcError::invalid_request("Server already initialised"));
        }

        let params: InitializeParams = parse_params(req, "initialize")?;
        if params.protocol_version != MCP_PROTOCOL_VERSION {
            tracing::info!(
                requested = %params.protocol_version,
                offered = MCP_PROTOCOL_VERSION,
                "Client requested a different protocol version"
            );
        }
        if let Some(client) = &params.client_info {
            tracing::info!(client = %client.name, version = ?client.version, "Initialising");
        }

        self.state = ServerState::Initialising;

        Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": ServerCapabilities {
                tools: ToolCapabilities::default(),
            },
            "serverInfo": ServerInfo::default(),
        }))
    }

    /// Handles the tools/list request.
    fn handle_tools_list(&self) -> Result<Value, RpcError> {
        self.require_running()?;
        Ok(json!({ "tools": ToolContext::definitions() }))
    }

    /// Handles the tools/call request.
    async fn handle_tools_call(&mut self, req: &Request) -> Result<Value, RpcError> {
        self.require_running()?;

        let params: ToolCallParams = parse_params(req, "tool call")?;
        let result = self.tools.call(&params.name, &params.arguments).await;

        serde_json::to_value(&result).map_err(|e| {
            tracing::error!(error = %e, "Failed to serialise tool call result");
            RpcError::internal("Failed to serialise tool result")
        })
    }

    /// Tools are only served once the client has confirmed initialisation.
    fn require_running(&self) -> Result<(), RpcError> {
        if self.state == ServerState::Running {
            Ok(())
        } else {
            Err(RpcError::invalid_request("Server not initialised"))
        }
    }
}

/// Deserialises the required params of `req`.
fn parse_params<T: serde::de::DeserializeOwned>(req: &Request, what: &str) -> Result<T, RpcError> {
    let params = req
        .params
        .clone()
        .ok_or_else(|| RpcError::invalid_params(format!("Missing {what} params")))?;

    serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(format!("Invalid {what} params: {e}")))
}
