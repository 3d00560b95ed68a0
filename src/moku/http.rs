//! Device backend speaking the Moku REST API.
//!
//! Every call is a JSON request to `http://<address>/api/<group>/<operation>`.
//! Ownership is claimed with `moku/claim_ownership`; the device answers with a
//! client key that must accompany every later request in the
//! `Moku-Client-Key` header. Responses share one envelope:
//!
//! ```json
//! { "success": true, "data": ..., "messages": [], "code": null }
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::moku::device::{DeviceConnector, DeviceHandle, DeviceInfo};
use crate::moku::error::{MokuError, MokuResult};
use crate::moku::model::{Connection, InstrumentKind};

/// Header carrying the ownership key.
pub const CLIENT_KEY_HEADER: &str = "Moku-Client-Key";

/// Envelope codes that mean another client owns the device.
const OWNERSHIP_CODES: [&str; 2] = ["NO_OWNERSHIP", "OWNERSHIP_CONFLICT"];

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    messages: Vec<String>,
    #[serde(default)]
    code: Option<String>,
}

impl Envelope {
    /// Converts an unsuccessful envelope into an error.
    fn into_data(self, address: SocketAddr, operation: &str) -> MokuResult<Value> {
        if self.success {
            return Ok(self.data);
        }
        if self
            .code
            .as_deref()
            .is_some_and(|code| OWNERSHIP_CODES.contains(&code))
        {
            return Err(MokuError::conflict(address.to_string()));
        }

        let detail = if self.messages.is_empty() {
            self.code.unwrap_or_else(|| "request rejected".to_string())
        } else {
            self.messages.join("; ")
        };
        Err(MokuError::transient(operation, detail))
    }
}

fn api_url(address: SocketAddr, path: &str) -> String {
    format!("http://{address}/api/{path}")
}

/// [`DeviceConnector`] for real hardware.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    /// Creates a connector whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> MokuResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MokuError::transient("build HTTP client", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeviceConnector for HttpConnector {
    async fn connect(&self, address: SocketAddr, force: bool) -> MokuResult<Box<dyn DeviceHandle>> {
        const OPERATION: &str = "claim ownership";

        let response = self
            .client
            .post(api_url(address, "moku/claim_ownership"))
            .json(&json!({ "force_connect": force }))
            .send()
            .await
            .map_err(|e| MokuError::transient(OPERATION, e))?;

        if response.status() == StatusCode::CONFLICT {
            return Err(MokuError::conflict(address.to_string()));
        }

        let client_key = response
            .headers()
            .get(CLIENT_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| MokuError::transient(OPERATION, e))?;
        envelope.into_data(address, OPERATION)?;

        let client_key = client_key.ok_or_else(|| {
            MokuError::transient(OPERATION, format!("{address} did not return a client key"))
        })?;

        tracing::debug!(%address, forced = force, "Ownership claimed");
        Ok(Box::new(HttpHandle {
            client: self.client.clone(),
            address,
            client_key,
        }))
    }
}

/// An owned HTTP session with one device.
#[derive(Debug)]
struct HttpHandle {
    client: Client,
    address: SocketAddr,
    client_key: String,
}

impl HttpHandle {
    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(api_url(self.address, path))
            .header(CLIENT_KEY_HEADER, &self.client_key)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(api_url(self.address, path))
            .header(CLIENT_KEY_HEADER, &self.client_key)
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> MokuResult<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| MokuError::transient(operation, e))?;

        if response.status() == StatusCode::CONFLICT
            || response.status() == StatusCode::UNAUTHORIZED
        {
            return Err(MokuError::conflict(self.address.to_string()));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| MokuError::transient(operation, e))?;
        envelope.into_data(self.address, operation)
    }

    async fn get_string(&self, path: &str) -> MokuResult<Option<String>> {
        let data = self.send(self.get(path), path).await?;
        Ok(data.as_str().map(str::to_string).filter(|s| !s.is_empty()))
    }
}

#[async_trait]
impl DeviceHandle for HttpHandle {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn device_info(&mut self) -> MokuResult<DeviceInfo> {
        Ok(DeviceInfo {
            name: self.get_string("moku/name").await?,
            serial: self.get_string("moku/serial_number").await?,
            model: self.get_string("moku/hardware").await?,
            firmware: self.get_string("moku/firmware_version").await?,
        })
    }

    async fn upload_bitstream(&mut self, slot: u8, bitstream: Vec<u8>) -> MokuResult<()> {
        let request = self
            .post(&format!("slot{slot}/upload/bitstream"))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bitstream);
        self.send(request, "upload bitstream").await?;
        Ok(())
    }

    async fn set_instrument(&mut self, slot: u8, instrument: InstrumentKind) -> MokuResult<()> {
        let request = self
            .post("mim/set_instrument")
            .json(&json!({ "slot": slot, "instrument": instrument.api_name() }));
        self.send(request, "set instrument").await?;
        Ok(())
    }

    async fn set_control(&mut self, slot: u8, index: u8, value: u32) -> MokuResult<()> {
        let request = self
            .post(&format!("slot{slot}/cloudcompile/set_control"))
            .json(&json!({ "idx": index, "value": value }));
        self.send(request, "set control register").await?;
        Ok(())
    }

    async fn apply_setting(
        &mut self,
        slot: u8,
        instrument: InstrumentKind,
        name: &str,
        value: &Value,
    ) -> MokuResult<()> {
        let path = format!(
            "slot{slot}/{}/{name}",
            instrument.api_name().to_ascii_lowercase()
        );
        let body = match value {
            Value::Object(_) => value.clone(),
            other => json!({ "value": other }),
        };
        self.send(self.post(&path).json(&body), "apply setting").await?;
        Ok(())
    }

    async fn set_connections(&mut self, connections: &[Connection]) -> MokuResult<()> {
        let request = self
            .post("mim/set_connections")
            .json(&json!({ "connections": connections }));
        self.send(request, "set connections").await?;
        Ok(())
    }

    async fn list_instruments(&mut self) -> MokuResult<BTreeMap<u8, Option<String>>> {
        let data = self.send(self.get("mim/get_instruments"), "list instruments").await?;
        parse_instrument_list(&data)
    }

    async fn release(&mut self) -> MokuResult<()> {
        self.send(self.post("moku/relinquish_ownership"), "relinquish ownership")
            .await?;
        tracing::debug!(address = %self.address, "Ownership relinquished");
        Ok(())
    }
}

/// Parses `mim/get_instruments` data: one entry per slot, `null` or `""` if
/// the slot is empty.
fn parse_instrument_list(data: &Value) -> MokuResult<BTreeMap<u8, Option<String>>> {
    let entries = data.as_array().ok_or_else(|| {
        MokuError::transient("list instruments", "expected an array of slot entries")
    })?;

    if entries.len() > usize::from(u8::MAX) {
        tracing::warn!(
            count = entries.len(),
            "Device reported more slots than addressable, ignoring the rest"
        );
    }

    Ok((1..=u8::MAX)
        .zip(entries)
        .map(|(slot, entry)| {
            let name = entry
                .as_str()
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            (slot, name)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moku::ErrorKind;

    fn addr() -> SocketAddr {
        "192.168.1.100:80".parse().unwrap()
    }

    fn envelope(json: &str) -> Envelope {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn successful_envelope_yields_data() {
        let data = envelope(r#"{"success": true, "data": "Moku-Bench", "messages": []}"#)
            .into_data(addr(), "get name")
            .unwrap();
        assert_eq!(data, json!("Moku-Bench"));
    }

    #[test]
    fn ownership_code_is_conflict() {
        let err = envelope(r#"{"success": false, "code": "NO_OWNERSHIP", "messages": ["owned"]}"#)
            .into_data(addr(), "set instrument")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn other_failures_are_transient() {
        let err = envelope(r#"{"success": false, "messages": ["bad slot", "try again"]}"#)
            .into_data(addr(), "set instrument")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("bad slot; try again"));
    }

    #[test]
    fn instrument_list_marks_empty_slots() {
        let slots =
            parse_instrument_list(&json!(["Oscilloscope", null, "", "CloudCompile"])).unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[&1].as_deref(), Some("Oscilloscope"));
        assert_eq!(slots[&2], None);
        assert_eq!(slots[&3], None);
        assert_eq!(slots[&4].as_deref(), Some("CloudCompile"));
    }

    #[test]
    fn instrument_list_stops_at_last_slot_number() {
        let entries = vec![json!("Oscilloscope"); 300];
        let slots = parse_instrument_list(&Value::Array(entries)).unwrap();
        assert_eq!(slots.len(), 255);
        assert_eq!(slots.keys().next_back(), Some(&u8::MAX));
    }

    #[test]
    fn instrument_list_rejects_non_array() {
        assert!(parse_instrument_list(&json!({"slot1": "Oscilloscope"})).is_err());
    }

    #[test]
    fn url_includes_port() {
        assert_eq!(
            api_url("10.0.0.1:8090".parse().unwrap(), "moku/name"),
            "http://10.0.0.1:8090/api/moku/name"
        );
    }
}
