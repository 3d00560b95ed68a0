//! moku-mcp: MCP server for Moku instrument discovery and configuration
//!
//! This library exposes Moku laboratory instruments to AI assistants through
//! the Model Context Protocol.
//!
//! # Architecture
//!
//! The server is a thin, stateful layer over the device REST API:
//!
//! - **Discovery**: zeroconf browse, results kept in a persisted device cache
//! - **Sessions**: at most one device owned at a time, released on every exit path
//! - **Deployment**: validated multi-instrument configurations pushed slot by slot
//!
//! # Modules
//!
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Settings and cache error types
//! - [`mcp`] — MCP protocol implementation and the tool surface
//! - [`moku`] — Device discovery, sessions and deployment

pub mod config;
pub mod error;
pub mod mcp;
pub mod moku;
