//! Model Context Protocol (MCP) server implementation.
//!
//! Exposes the Moku device tools to AI assistants over the MCP stdio
//! transport, using JSON-RPC 2.0 messages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         MCP Server                          │
//! │                                                             │
//! │   ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    │
//! │   │  Transport  │───▶│   Server    │───▶│   Tools     │    │
//! │   │   (stdio)   │    │  (lifecycle)│    │ (ToolContext)│   │
//! │   └─────────────┘    └─────────────┘    └──────┬──────┘    │
//! │                                                │            │
//! │                        sessions · deployer · cache · discovery
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use protocol::{Incoming, Reply, Request, RequestId, RpcError, MCP_PROTOCOL_VERSION};
pub use server::McpServer;
pub use tools::{ToolCallResult, ToolContext};
pub use transport::{LineTransport, StdioTransport};
