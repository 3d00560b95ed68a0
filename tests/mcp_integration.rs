//! Integration tests for the MCP server.
//!
//! These tests drive a complete server over an in-memory pipe, exactly as a
//! client would over stdio, with the simulated device backend behind it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{
    duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};

use moku_mcp::mcp::protocol::{parse_message, Incoming, RequestId};
use moku_mcp::mcp::{LineTransport, McpServer, ToolContext};
use moku_mcp::moku::discovery::MOKU_SERVICE_TYPE;
use moku_mcp::moku::mock::{MockConnector, MockDevice, StaticBrowser};
use moku_mcp::moku::{DeviceCache, DiscoveryClient, InstrumentKind, SessionManager};

// =============================================================================
// Harness
// =============================================================================

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    next_id: i64,
}

impl Client {
    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let message = json!({
            "jsonrpc": "2.0",
            "id": self.next_id,
            "method": method,
            "params": params,
        });
        self.send_raw(&message.to_string()).await;
        let response = self.read().await;
        assert_eq!(response["id"], self.next_id, "response id mismatch");
        response
    }

    async fn notify(&mut self, method: &str) {
        let message = json!({ "jsonrpc": "2.0", "method": method });
        self.send_raw(&message.to_string()).await;
    }

    async fn initialise(&mut self) {
        let response = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "integration", "version": "1.0.0" }
                }),
            )
            .await;
        assert_eq!(response["result"]["serverInfo"]["name"], "moku-mcp");
        self.notify("notifications/initialized").await;
    }

    /// Calls a tool and returns its parsed JSON payload.
    async fn tool(&mut self, name: &str, arguments: Value) -> Value {
        let response = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await;
        let text = response["result"]["content"][0]["text"]
            .as_str()
            .unwrap_or_else(|| panic!("no text content in {response}"));
        serde_json::from_str(text).unwrap()
    }
}

fn bench() -> SocketAddr {
    "192.168.1.100:80".parse().unwrap()
}

fn rack() -> SocketAddr {
    "192.168.1.101:80".parse().unwrap()
}

fn lab() -> (MockConnector, StaticBrowser) {
    let devices = [
        MockDevice::new(bench(), "bench", "MG-100"),
        MockDevice::new(rack(), "rack", "MG-101"),
    ];
    let browser = StaticBrowser::for_devices(&devices);
    let connector = MockConnector::new();
    for device in devices {
        connector.add_device(device);
    }
    (connector, browser)
}

/// Runs `script` as the client of a fresh server; the server stops when the
/// script drops the client.
async fn session<F, Fut>(connector: &MockConnector, browser: StaticBrowser, script: F)
where
    F: FnOnce(Client) -> Fut,
    Fut: Future<Output = ()>,
{
    let shared = Arc::new(connector.clone());
    let discovery = DiscoveryClient::new(Box::new(browser), shared.clone(), MOKU_SERVICE_TYPE, true);
    let tools = ToolContext::new(
        SessionManager::new(shared, 80),
        DeviceCache::in_memory(),
        discovery,
        Duration::from_millis(20),
    );

    let (client_end, server_end) = duplex(1 << 16);
    let (server_read, server_write) = split(server_end);
    let mut server = McpServer::new(LineTransport::new(server_read, server_write), tools);

    let (client_read, client_write) = split(client_end);
    let client = Client {
        reader: BufReader::new(client_read),
        writer: client_write,
        next_id: 0,
    };

    let (result, ()) = tokio::join!(server.run(), script(client));
    result.unwrap();
}

// =============================================================================
// Protocol Parsing Tests
// =============================================================================

#[test]
fn test_parse_initialize_request() {
    let json = r#"{
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "1.0.0" }
        }
    }"#;

    let Incoming::Request(req) = parse_message(json).unwrap() else {
        panic!("Expected Request");
    };
    assert_eq!(req.method, "initialize");
    assert_eq!(req.id, RequestId::Number(1));
}

#[test]
fn test_parse_tool_call_request() {
    let json = r#"{
        "jsonrpc": "2.0",
        "id": "call-7",
        "method": "tools/call",
        "params": { "name": "attach_moku", "arguments": { "device_id": "192.168.1.100" } }
    }"#;

    let Incoming::Request(req) = parse_message(json).unwrap() else {
        panic!("Expected Request");
    };
    assert_eq!(req.id, RequestId::String("call-7".to_string()));
    assert_eq!(req.params.unwrap()["name"], "attach_moku");
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_initialise_and_list_tools() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        client.initialise().await;

        let response = client.request("tools/list", json!({})).await;
        let tools = response["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            [
                "discover_mokus",
                "attach_moku",
                "release_moku",
                "push_config",
                "get_config",
                "set_routing",
                "get_device_info",
                "list_slots"
            ]
        );
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));

        let pong = client.request("ping", json!({})).await;
        assert_eq!(pong["result"], json!({}));
    })
    .await;
}

#[tokio::test]
async fn test_tools_rejected_before_initialised() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        let response = client.request("tools/list", json!({})).await;
        assert_eq!(response["error"]["code"], -32600);
    })
    .await;
}

#[tokio::test]
async fn test_protocol_errors_do_not_stop_server() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        client.send_raw("this is not json").await;
        let response = client.read().await;
        assert_eq!(response["error"]["code"], -32700);

        client.initialise().await;

        let response = client.request("resources/list", json!({})).await;
        assert_eq!(response["error"]["code"], -32601);

        let response = client.request("tools/call", json!({ "arguments": {} })).await;
        assert_eq!(response["error"]["code"], -32602);

        let pong = client.request("ping", json!({})).await;
        assert!(pong["error"].is_null());
    })
    .await;
}

// =============================================================================
// Tool Workflow Tests
// =============================================================================

#[tokio::test]
async fn test_discover_attach_push_release() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        client.initialise().await;

        let found = client.tool("discover_mokus", json!({ "timeout": 0.05 })).await;
        assert_eq!(found["status"], "success");
        assert_eq!(found["count"], 2);

        let attached = client.tool("attach_moku", json!({ "device_id": "rack" })).await;
        assert_eq!(attached["status"], "success", "{attached}");
        assert_eq!(attached["session"]["address"], "192.168.1.101:80");

        let pushed = client
            .tool(
                "push_config",
                json!({
                    "config_dict": {
                        "platform": { "model": "moku:go" },
                        "slots": {
                            "1": { "instrument": "oscilloscope" },
                            "2": { "instrument": "pid_controller" }
                        },
                        "routing": [
                            { "source": "Input1", "destination": "Slot1InA" },
                            { "source": "Slot1OutA", "destination": "Slot2InA" },
                            { "source": "Slot2OutA", "destination": "Output1" }
                        ]
                    }
                }),
            )
            .await;
        assert_eq!(pushed["status"], "success", "{pushed}");
        assert_eq!(pushed["report"]["deployed"], json!([1, 2]));

        let slots = client.tool("list_slots", json!({})).await;
        assert_eq!(slots["slots"][1]["instrument"], "PIDController");

        let routed = client
            .tool(
                "set_routing",
                json!({ "connections": [{ "source": "Input2", "destination": "Slot2InB" }] }),
            )
            .await;
        assert_eq!(routed["status"], "success", "{routed}");
        assert_eq!(routed["count"], 1);

        let info = client.tool("get_device_info", json!({})).await;
        assert_eq!(info["device"]["serial"], "MG-101");

        let released = client.tool("release_moku", json!({})).await;
        assert_eq!(released["status"], "success");
    })
    .await;

    let device = connector.device(rack()).unwrap();
    assert!(!device.is_owned());
    assert_eq!(device.slots.get(&2), Some(&InstrumentKind::PidController));
    assert_eq!(device.connections.len(), 1);
}

#[tokio::test]
async fn test_second_attach_conflicts_until_forced() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        client.initialise().await;

        let first = client
            .tool("attach_moku", json!({ "device_id": "192.168.1.100" }))
            .await;
        assert_eq!(first["status"], "success");

        let second = client
            .tool("attach_moku", json!({ "device_id": "192.168.1.101" }))
            .await;
        assert_eq!(second["status"], "error");
        assert_eq!(second["error_kind"], "conflict");

        let forced = client
            .tool("attach_moku", json!({ "device_id": "192.168.1.101", "force": true }))
            .await;
        assert_eq!(forced["status"], "success");
        assert_eq!(forced["session"]["forced"], true);
    })
    .await;

    assert!(!connector.device(bench()).unwrap().is_owned());
}

#[tokio::test]
async fn test_unknown_identifier_is_not_found() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        client.initialise().await;

        let result = client
            .tool("attach_moku", json!({ "device_id": "nonexistent-moku" }))
            .await;
        assert_eq!(result["status"], "error");
        assert_eq!(result["error_kind"], "not_found");
        assert!(result["suggestion"].as_str().unwrap().contains("discover_mokus"));
    })
    .await;
}

#[tokio::test]
async fn test_invalid_routing_reported_with_details() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        client.initialise().await;
        client
            .tool("attach_moku", json!({ "device_id": "192.168.1.100" }))
            .await;

        let result = client
            .tool(
                "push_config",
                json!({
                    "config_dict": {
                        "platform": { "model": "moku:go" },
                        "slots": { "1": { "instrument": "oscilloscope" } },
                        "routing": [
                            { "source": "Slot3OutA", "destination": "Output1" },
                            { "source": "Output1", "destination": "Slot1InA" }
                        ]
                    }
                }),
            )
            .await;
        assert_eq!(result["error_kind"], "validation");
        assert_eq!(result["details"].as_array().unwrap().len(), 2);
    })
    .await;

    assert!(connector.device(bench()).unwrap().slots.is_empty());
}

#[tokio::test]
async fn test_eof_releases_attached_device() {
    let (connector, browser) = lab();
    session(&connector, browser, |mut client| async move {
        client.initialise().await;
        let attached = client
            .tool("attach_moku", json!({ "device_id": "192.168.1.100" }))
            .await;
        assert_eq!(attached["status"], "success");
    })
    .await;

    assert!(!connector.device(bench()).unwrap().is_owned());
}
