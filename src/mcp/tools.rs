//! The eight device tools and their JSON schemas.
//!
//! Each tool takes a small argument object and answers with a JSON object
//! (pretty-printed into a text content item) carrying a `status` field:
//!
//! ```json
//! { "status": "success", ... }
//! { "status": "error", "error_kind": "conflict", "message": "...", "suggestion": "..." }
//! ```
//!
//! Tool-level failures are never JSON-RPC errors; the client always gets a
//! result it can show to the model.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::MAX_DISCOVERY_TIMEOUT_SECS;
use crate::moku::cache::{DeviceCache, DeviceRecord};
use crate::moku::deployer::{ConfigurationDeployer, Source};
use crate::moku::discovery::DiscoveryClient;
use crate::moku::model::{Connection, MokuConfig};
use crate::moku::session::{ReleaseOutcome, SessionManager};
use crate::moku::{MokuError, MokuResult};

/// Names of every tool, in listing order.
pub const TOOL_NAMES: [&str; 8] = [
    "discover_mokus",
    "attach_moku",
    "release_moku",
    "push_config",
    "get_config",
    "set_routing",
    "get_device_info",
    "list_slots",
];

/// A tool definition for the tools/list response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

impl ToolDefinition {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema,
        }
    }
}

/// Content item in a tool call response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
}

/// Result of a tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content returned by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the tool call resulted in an error.
    #[serde(skip_serializing_if = "is_false")]
    pub is_error: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // skip_serializing_if needs fn(&T) -> bool
const fn is_false(b: &bool) -> bool {
    !*b
}

impl ToolCallResult {
    fn from_value(value: &Value, is_error: bool) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: format!("{value:#}"),
            }],
            is_error,
        }
    }

    /// Wraps a successful payload, adding `"status": "success"`.
    #[must_use]
    pub fn success(payload: Value) -> Self {
        let mut object = match payload {
            Value::Object(object) => object,
            other => {
                let mut object = Map::new();
                object.insert("result".to_string(), other);
                object
            }
        };
        object.insert("status".to_string(), json!("success"));
        Self::from_value(&Value::Object(object), false)
    }

    /// Builds the structured result for a failed tool call.
    #[must_use]
    pub fn failure(error: &MokuError) -> Self {
        let mut value = json!({
            "status": "error",
            "error_kind": error.kind().as_str(),
            "message": error.to_string(),
            "suggestion": error.suggestion(),
        });
        if let Some(details) = error.details() {
            value["details"] = json!(details);
        }
        Self::from_value(&value, true)
    }

    fn unknown_tool(name: &str) -> Self {
        let value = json!({
            "status": "error",
            "error_kind": "validation",
            "message": format!("Unknown tool: {name}"),
            "suggestion": "Call one of the available tools",
            "available_tools": TOOL_NAMES,
        });
        Self::from_value(&value, true)
    }

    /// The text of the first content item.
    #[must_use]
    pub fn text(&self) -> &str {
        match self.content.first() {
            Some(ToolContent::Text { text }) => text,
            None => "",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiscoverArgs {
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttachArgs {
    device_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PushArgs {
    config_dict: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoutingArgs {
    connections: Vec<Connection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

/// Parses tool arguments; `null` counts as an empty object.
fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, arguments: &Value) -> MokuResult<T> {
    let arguments = if arguments.is_null() {
        Value::Object(Map::new())
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments)
        .map_err(|e| MokuError::validation(format!("invalid arguments for {tool}: {e}")))
}

/// Everything the tools act on, owned by the server.
pub struct ToolContext {
    sessions: SessionManager,
    deployer: ConfigurationDeployer,
    cache: DeviceCache,
    discovery: DiscoveryClient,
    default_timeout: Duration,
}

impl ToolContext {
    /// Creates a context with no device attached.
    #[must_use]
    pub fn new(
        sessions: SessionManager,
        cache: DeviceCache,
        discovery: DiscoveryClient,
        default_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            deployer: ConfigurationDeployer::new(),
            cache,
            discovery,
            default_timeout,
        }
    }

    /// The session manager.
    #[must_use]
    pub const fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The device cache.
    #[must_use]
    pub const fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    /// Returns the list of available tools.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "discover_mokus",
                "Scan the local network for Moku devices via zeroconf. Devices found are \
                 added to the device cache so they can be attached by name or serial.",
                json!({
                    "type": "object",
                    "properties": {
                        "timeout": {
                            "type": "number",
                            "minimum": 0,
                            "maximum": MAX_DISCOVERY_TIMEOUT_SECS,
                            "description": "Browse window in seconds (default from configuration)"
                        }
                    }
                }),
            ),
            ToolDefinition::new(
                "attach_moku",
                "Claim exclusive ownership of a Moku. Accepts an IP address, ip:port, \
                 device name or serial number. Fails if a device is already attached \
                 or the device is owned by another client, unless force is true.",
                json!({
                    "type": "object",
                    "properties": {
                        "device_id": {
                            "type": "string",
                            "description": "IP address, ip:port, name or serial number"
                        },
                        "force": {
                            "type": "boolean",
                            "default": false,
                            "description": "Take ownership even if held by another client"
                        }
                    },
                    "required": ["device_id"]
                }),
            ),
            ToolDefinition::new(
                "release_moku",
                "Release ownership of the attached Moku. Safe to call when nothing is attached.",
                json!({ "type": "object", "properties": {} }),
            ),
            ToolDefinition::new(
                "push_config",
                "Validate and deploy a multi-instrument configuration to the attached Moku. \
                 Slots that fail are skipped and reported; routing to skipped slots is withheld.",
                json!({
                    "type": "object",
                    "properties": {
                        "config_dict": {
                            "type": "object",
                            "description": "Configuration with platform, slots and routing",
                            "properties": {
                                "platform": {
                                    "type": "object",
                                    "properties": {
                                        "model": {
                                            "type": "string",
                                            "enum": ["moku:go", "moku:lab", "moku:pro", "moku:delta"]
                                        },
                                        "slot_count": { "type": "integer", "minimum": 1 }
                                    },
                                    "required": ["model"]
                                },
                                "slots": {
                                    "type": "object",
                                    "description": "Slot number (\"1\", \"2\", ...) to slot configuration",
                                    "additionalProperties": {
                                        "type": "object",
                                        "properties": {
                                            "instrument": { "type": "string" },
                                            "bitstream": { "type": "string" },
                                            "control_registers": { "type": "object" },
                                            "settings": { "type": "object" }
                                        },
                                        "required": ["instrument"]
                                    }
                                },
                                "routing": {
                                    "type": "array",
                                    "items": connection_schema()
                                }
                            },
                            "required": ["platform"]
                        }
                    },
                    "required": ["config_dict"]
                }),
            ),
            ToolDefinition::new(
                "get_config",
                "Report the configuration last pushed in this session together with the \
                 instruments the device currently reports, and any slots that differ.",
                json!({ "type": "object", "properties": {} }),
            ),
            ToolDefinition::new(
                "set_routing",
                "Replace the signal routing of the attached Moku. Ports: Input<n>, Output<n>, \
                 Slot<n>In<A-D>, Slot<n>Out<A-D>.",
                json!({
                    "type": "object",
                    "properties": {
                        "connections": {
                            "type": "array",
                            "items": connection_schema()
                        }
                    },
                    "required": ["connections"]
                }),
            ),
            ToolDefinition::new(
                "get_device_info",
                "Read name, serial number, model and firmware of the attached Moku.",
                json!({ "type": "object", "properties": {} }),
            ),
            ToolDefinition::new(
                "list_slots",
                "List the instrument loaded in each slot of the attached Moku.",
                json!({ "type": "object", "properties": {} }),
            ),
        ]
    }

    /// Runs the tool `name`.
    pub async fn call(&mut self, name: &str, arguments: &Value) -> ToolCallResult {
        tracing::debug!(tool = name, "Tool call");

        let outcome = match name {
            "discover_mokus" => self.discover(arguments).await,
            "attach_moku" => self.attach(arguments).await,
            "release_moku" => self.release(arguments).await,
            "push_config" => self.push_config(arguments).await,
            "get_config" => self.get_config(arguments).await,
            "set_routing" => self.set_routing(arguments).await,
            "get_device_info" => self.device_info(arguments).await,
            "list_slots" => self.list_slots(arguments).await,
            _ => {
                tracing::warn!(tool = name, "Unknown tool");
                return ToolCallResult::unknown_tool(name);
            }
        };

        match outcome {
            Ok(payload) => ToolCallResult::success(payload),
            Err(e) => {
                tracing::warn!(tool = name, kind = %e.kind(), error = %e, "Tool failed");
                ToolCallResult::failure(&e)
            }
        }
    }

    /// Releases any attached device; called when the server stops.
    pub async fn shutdown(&mut self) {
        if let ReleaseOutcome::ReleasedWithError(info, e) = self.sessions.release().await {
            tracing::warn!(address = %info.address, error = %e, "Release on shutdown failed");
        }
        self.deployer.forget();
    }

    fn require_session(&self) -> MokuResult<()> {
        if self.sessions.is_attached() {
            Ok(())
        } else {
            Err(MokuError::not_attached())
        }
    }

    async fn discover(&mut self, arguments: &Value) -> MokuResult<Value> {
        let args: DiscoverArgs = parse_args("discover_mokus", arguments)?;
        #[allow(clippy::cast_precision_loss)]
        let max_secs = MAX_DISCOVERY_TIMEOUT_SECS as f64;
        let timeout = match args.timeout {
            None => self.default_timeout,
            Some(secs) if secs.is_finite() && (0.0..=max_secs).contains(&secs) => {
                Duration::from_secs_f64(secs)
            }
            Some(secs) => {
                return Err(MokuError::validation(format!(
                    "timeout must be between 0 and {MAX_DISCOVERY_TIMEOUT_SECS} seconds, got {secs}"
                )))
            }
        };

        let attached = self.sessions.info().map(|session| session.address);
        let found = self.discovery.discover(timeout, attached).await?;
        let devices: Vec<DeviceRecord> = found
            .into_iter()
            .map(|record| self.cache.record_seen(record).clone())
            .collect();
        if !devices.is_empty() {
            self.cache.save_or_warn();
        }

        tracing::info!(count = devices.len(), "Discovery finished");
        Ok(json!({
            "count": devices.len(),
            "timeout_secs": timeout.as_secs_f64(),
            "devices": devices,
        }))
    }

    async fn attach(&mut self, arguments: &Value) -> MokuResult<Value> {
        let args: AttachArgs = parse_args("attach_moku", arguments)?;
        let session = self
            .sessions
            .attach(&args.device_id, args.force, &self.cache)
            .await?;
        self.deployer.forget();

        // Metadata is a bonus; the session is already held.
        let info = match self.sessions.handle()?.device_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(address = %session.address, error = %e, "Could not read device metadata");
                None
            }
        };

        let mut record = DeviceRecord::new(session.address.ip(), session.address.port());
        if let Some(info) = &info {
            record.merge_info(info);
        }
        self.cache.record_seen(record);
        self.cache.save_or_warn();

        Ok(json!({
            "message": format!("Attached to {}", session.address),
            "session": session,
            "device": info,
        }))
    }

    async fn release(&mut self, arguments: &Value) -> MokuResult<Value> {
        let NoArgs {} = parse_args("release_moku", arguments)?;
        let outcome = self.sessions.release().await;
        self.deployer.forget();

        Ok(match outcome {
            ReleaseOutcome::NotAttached => json!({
                "message": "No device attached",
            }),
            ReleaseOutcome::Released(info) => json!({
                "message": format!("Released {}", info.address),
                "session": info,
            }),
            ReleaseOutcome::ReleasedWithError(info, e) => json!({
                "message": format!("Released {} locally", info.address),
                "session": info,
                "warning": format!("Device did not confirm release: {e}"),
            }),
        })
    }

    async fn push_config(&mut self, arguments: &Value) -> MokuResult<Value> {
        self.require_session()?;
        let args: PushArgs = parse_args("push_config", arguments)?;
        let config = MokuConfig::from_value(args.config_dict)?;

        let report = self.deployer.push(&mut self.sessions, config).await?;
        Ok(json!({
            "complete": report.is_complete(),
            "report": report,
        }))
    }

    async fn get_config(&mut self, arguments: &Value) -> MokuResult<Value> {
        self.require_session()?;
        let NoArgs {} = parse_args("get_config", arguments)?;

        let snapshot = self.deployer.snapshot(&mut self.sessions).await?;
        let source = if snapshot.config.is_some() {
            Source::LastPushed
        } else {
            Source::Device
        };

        Ok(json!({
            "source": source,
            "config": snapshot.config,
            "live": snapshot.live,
            "drift": snapshot.drift,
        }))
    }

    async fn set_routing(&mut self, arguments: &Value) -> MokuResult<Value> {
        self.require_session()?;
        let args: RoutingArgs = parse_args("set_routing", arguments)?;

        let report = self
            .deployer
            .set_routing(&mut self.sessions, args.connections)
            .await?;
        Ok(json!({
            "count": report.applied.len(),
            "connections": report.applied,
            "validated_against": report.validated_against,
        }))
    }

    async fn device_info(&mut self, arguments: &Value) -> MokuResult<Value> {
        self.require_session()?;
        let NoArgs {} = parse_args("get_device_info", arguments)?;

        let info = self.sessions.handle()?.device_info().await?;
        let session = self.sessions.info().cloned();

        if let Some(session) = &session {
            let mut record = DeviceRecord::new(session.address.ip(), session.address.port());
            record.merge_info(&info);
            self.cache.record_seen(record);
            self.cache.save_or_warn();
        }

        Ok(json!({
            "device": info,
            "session": session,
        }))
    }

    async fn list_slots(&mut self, arguments: &Value) -> MokuResult<Value> {
        self.require_session()?;
        let NoArgs {} = parse_args("list_slots", arguments)?;

        let listing = self.deployer.list_slots(&mut self.sessions).await?;
        Ok(json!(listing))
    }
}

fn connection_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "source": { "type": "string", "description": "e.g. Input1, Slot1OutA" },
            "destination": { "type": "string", "description": "e.g. Slot2InA, Output1" }
        },
        "required": ["source", "destination"]
    })
}
