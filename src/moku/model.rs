//! Declarative multi-instrument configuration.
//!
//! A [`MokuConfig`] describes what should run in each instrument slot and how
//! signals flow between the front-panel ports and the slots. This layer only
//! checks that the description is self-consistent; what an instrument does
//! with its settings is the device's business.
//!
//! # Port Names
//!
//! | Port            | Direction | Meaning                                |
//! |-----------------|-----------|----------------------------------------|
//! | `Input<n>`      | source    | Front-panel analog input `n`           |
//! | `Output<n>`     | sink      | Front-panel analog output `n`          |
//! | `Slot<n>Out<X>` | source    | Output channel `X` (A-D) of slot `n`   |
//! | `Slot<n>In<X>`  | sink      | Input channel `X` (A-D) of slot `n`    |

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::moku::error::{MokuError, MokuResult};

/// Hardware family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MokuModel {
    /// Moku:Go
    #[serde(rename = "moku:go", alias = "go")]
    Go,
    /// Moku:Lab
    #[serde(rename = "moku:lab", alias = "lab")]
    Lab,
    /// Moku:Pro
    #[serde(rename = "moku:pro", alias = "pro")]
    Pro,
    /// Moku:Delta
    #[serde(rename = "moku:delta", alias = "delta")]
    Delta,
}

impl MokuModel {
    /// Number of multi-instrument slots in the default layout.
    #[must_use]
    pub const fn default_slots(self) -> u8 {
        match self {
            Self::Go | Self::Lab => 2,
            Self::Pro => 4,
            Self::Delta => 3,
        }
    }

    /// Number of front-panel analog inputs.
    #[must_use]
    pub const fn inputs(self) -> u8 {
        match self {
            Self::Go | Self::Lab => 2,
            Self::Pro => 4,
            Self::Delta => 8,
        }
    }

    /// Number of front-panel analog outputs.
    #[must_use]
    pub const fn outputs(self) -> u8 {
        self.inputs()
    }

    /// Parses a model name as reported by a device (`moku:pro`, `Pro`, ...).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.strip_prefix("moku:").unwrap_or(&name) {
            "go" => Some(Self::Go),
            "lab" => Some(Self::Lab),
            "pro" => Some(Self::Pro),
            "delta" => Some(Self::Delta),
            _ => None,
        }
    }
}

impl fmt::Display for MokuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Go => "moku:go",
            Self::Lab => "moku:lab",
            Self::Pro => "moku:pro",
            Self::Delta => "moku:delta",
        };
        f.write_str(name)
    }
}

/// Target platform for a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformDescriptor {
    /// Hardware family.
    pub model: MokuModel,

    /// Slot layout override (e.g. Moku:Delta in 8-slot mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_count: Option<u8>,
}

impl PlatformDescriptor {
    /// Creates a descriptor using the model's default slot layout.
    #[must_use]
    pub const fn new(model: MokuModel) -> Self {
        Self {
            model,
            slot_count: None,
        }
    }

    /// Number of slots available on this platform.
    #[must_use]
    pub fn slots(&self) -> u8 {
        self.slot_count.unwrap_or_else(|| self.model.default_slots())
    }
}

/// Instrument that can be placed in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Oscilloscope.
    Oscilloscope,
    /// Waveform generator.
    WaveformGenerator,
    /// Arbitrary waveform generator.
    ArbitraryWaveformGenerator,
    /// Spectrum analyzer.
    SpectrumAnalyzer,
    /// Lock-in amplifier.
    LockInAmplifier,
    /// Phasemeter.
    Phasemeter,
    /// PID controller.
    PidController,
    /// Frequency response analyzer.
    FrequencyResponseAnalyzer,
    /// Data logger.
    Datalogger,
    /// Logic analyzer / pattern generator.
    LogicAnalyzer,
    /// Laser lock box.
    LaserLockBox,
    /// Digital filter box.
    DigitalFilterBox,
    /// Custom FPGA logic built with Moku Cloud Compile.
    CloudCompile,
}

impl InstrumentKind {
    const ALL: [Self; 13] = [
        Self::Oscilloscope,
        Self::WaveformGenerator,
        Self::ArbitraryWaveformGenerator,
        Self::SpectrumAnalyzer,
        Self::LockInAmplifier,
        Self::Phasemeter,
        Self::PidController,
        Self::FrequencyResponseAnalyzer,
        Self::Datalogger,
        Self::LogicAnalyzer,
        Self::LaserLockBox,
        Self::DigitalFilterBox,
        Self::CloudCompile,
    ];

    /// Name the device API uses for this instrument.
    #[must_use]
    pub const fn api_name(self) -> &'static str {
        match self {
            Self::Oscilloscope => "Oscilloscope",
            Self::WaveformGenerator => "WaveformGenerator",
            Self::ArbitraryWaveformGenerator => "ArbitraryWaveformGenerator",
            Self::SpectrumAnalyzer => "SpectrumAnalyzer",
            Self::LockInAmplifier => "LockInAmp",
            Self::Phasemeter => "Phasemeter",
            Self::PidController => "PIDController",
            Self::FrequencyResponseAnalyzer => "FrequencyResponseAnalyzer",
            Self::Datalogger => "Datalogger",
            Self::LogicAnalyzer => "LogicAnalyzer",
            Self::LaserLockBox => "LaserLockBox",
            Self::DigitalFilterBox => "DigitalFilterBox",
            Self::CloudCompile => "CloudCompile",
        }
    }

    /// Looks up an instrument by its device API name.
    #[must_use]
    pub fn from_api_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.api_name().eq_ignore_ascii_case(name))
    }

    /// Whether this instrument runs a user-supplied bitstream.
    #[must_use]
    pub const fn needs_bitstream(self) -> bool {
        matches!(self, Self::CloudCompile)
    }
}

/// Configuration of a single instrument slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotConfig {
    /// Instrument to load.
    pub instrument: InstrumentKind,

    /// Path to a Cloud Compile bitstream archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitstream: Option<PathBuf>,

    /// Cloud Compile control register values, by register index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_registers: Option<BTreeMap<u8, u32>>,

    /// Instrument settings, forwarded verbatim as setter calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Map<String, Value>>,
}

impl SlotConfig {
    /// Creates a slot running `instrument` with no extras.
    #[must_use]
    pub const fn new(instrument: InstrumentKind) -> Self {
        Self {
            instrument,
            bitstream: None,
            control_registers: None,
            settings: None,
        }
    }

    /// Checks slot-local consistency.
    ///
    /// A failing slot is skipped during deployment rather than rejecting the
    /// whole configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn preflight(&self) -> Result<(), String> {
        if self.instrument.needs_bitstream() && self.bitstream.is_none() {
            return Err(format!(
                "{} requires a bitstream",
                self.instrument.api_name()
            ));
        }
        if !self.instrument.needs_bitstream() && self.bitstream.is_some() {
            return Err(format!(
                "{} does not accept a bitstream",
                self.instrument.api_name()
            ));
        }
        if self.control_registers.is_some() && !self.instrument.needs_bitstream() {
            return Err(format!(
                "control registers are only supported by CloudCompile, not {}",
                self.instrument.api_name()
            ));
        }
        Ok(())
    }
}

/// A routing connection between two ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    /// Signal source port.
    pub source: String,
    /// Signal destination port.
    pub destination: String,
}

impl Connection {
    /// Creates a connection.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Slots this connection touches.
    #[must_use]
    pub fn slots(&self) -> Vec<u8> {
        [&self.source, &self.destination]
            .into_iter()
            .filter_map(|name| Port::parse(name).ok())
            .filter_map(|port| port.slot())
            .collect()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// A parsed routing port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Front-panel input.
    Input(u8),
    /// Front-panel output.
    Output(u8),
    /// Slot input channel.
    SlotIn {
        /// Slot number (1-based).
        slot: u8,
        /// Channel letter.
        channel: char,
    },
    /// Slot output channel.
    SlotOut {
        /// Slot number (1-based).
        slot: u8,
        /// Channel letter.
        channel: char,
    },
}

fn port_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?:(Input|Output)([1-9])|Slot([1-9])(In|Out)([A-D]))$").ok())
        .as_ref()
}

impl Port {
    /// Parses a port name such as `Slot1OutA` or `Input2`.
    ///
    /// # Errors
    ///
    /// Returns a description if the name does not follow the port grammar.
    pub fn parse(name: &str) -> Result<Self, String> {
        let caps = port_pattern()
            .and_then(|pattern| pattern.captures(name))
            .ok_or_else(|| format!("unknown port '{name}'"))?;

        let digit = |idx: usize| -> u8 {
            caps.get(idx)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or_default()
        };

        if let Some(side) = caps.get(1) {
            let index = digit(2);
            return Ok(if side.as_str() == "Input" {
                Self::Input(index)
            } else {
                Self::Output(index)
            });
        }

        let slot = digit(3);
        let channel = caps
            .get(5)
            .and_then(|m| m.as_str().chars().next())
            .unwrap_or('A');
        Ok(match caps.get(4).map(|m| m.as_str()) {
            Some("In") => Self::SlotIn { slot, channel },
            _ => Self::SlotOut { slot, channel },
        })
    }

    /// Slot referenced by this port, if any.
    #[must_use]
    pub const fn slot(self) -> Option<u8> {
        match self {
            Self::SlotIn { slot, .. } | Self::SlotOut { slot, .. } => Some(slot),
            Self::Input(_) | Self::Output(_) => None,
        }
    }

    /// Whether signals can flow out of this port.
    #[must_use]
    pub const fn is_source(self) -> bool {
        matches!(self, Self::Input(_) | Self::SlotOut { .. })
    }
}

/// Complete multi-instrument configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MokuConfig {
    /// Target platform.
    pub platform: PlatformDescriptor,

    /// Instrument per slot number (1-based).
    #[serde(default)]
    pub slots: BTreeMap<u8, SlotConfig>,

    /// Signal routing, applied in order.
    #[serde(default)]
    pub routing: Vec<Connection>,
}

impl MokuConfig {
    /// Creates an empty configuration for `platform`.
    #[must_use]
    pub const fn new(platform: PlatformDescriptor) -> Self {
        Self {
            platform,
            slots: BTreeMap::new(),
            routing: Vec::new(),
        }
    }

    /// Parses a configuration from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the JSON does not describe a configuration.
    pub fn from_value(value: Value) -> MokuResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| MokuError::validation(format!("malformed configuration: {e}")))
    }

    /// Validates slot numbering and routing.
    ///
    /// Slot-local problems (missing bitstreams and the like) are not checked
    /// here; see [`SlotConfig::preflight`].
    ///
    /// # Errors
    ///
    /// Returns a validation error listing every problem found.
    pub fn validate(&self) -> MokuResult<()> {
        let slot_count = self.platform.slots();
        let mut problems: Vec<String> = self
            .slots
            .keys()
            .filter(|&&slot| slot == 0 || slot > slot_count)
            .map(|slot| {
                format!(
                    "slot {slot} is outside 1..={slot_count} for {}",
                    self.platform.model
                )
            })
            .collect();

        let defined: BTreeSet<u8> = self.slots.keys().copied().collect();
        problems.extend(routing_problems(&self.routing, &self.platform, &defined));

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MokuError::validation_many(problems))
        }
    }
}

/// Checks routing connections against a platform and a set of defined slots.
///
/// # Errors
///
/// Returns a validation error listing every problem found.
pub fn validate_routing(
    connections: &[Connection],
    platform: &PlatformDescriptor,
    defined_slots: &BTreeSet<u8>,
) -> MokuResult<()> {
    let problems = routing_problems(connections, platform, defined_slots);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(MokuError::validation_many(problems))
    }
}

fn routing_problems(
    connections: &[Connection],
    platform: &PlatformDescriptor,
    defined_slots: &BTreeSet<u8>,
) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = BTreeSet::new();

    for connection in connections {
        if !seen.insert((connection.source.as_str(), connection.destination.as_str())) {
            problems.push(format!("duplicate connection {connection}"));
            continue;
        }

        for (name, want_source) in [(&connection.source, true), (&connection.destination, false)]
        {
            match Port::parse(name) {
                Ok(port) => {
                    if let Some(problem) =
                        port_problem(port, name, want_source, platform, defined_slots)
                    {
                        problems.push(format!("{connection}: {problem}"));
                    }
                }
                Err(e) => problems.push(format!("{connection}: {e}")),
            }
        }
    }

    problems
}

fn port_problem(
    port: Port,
    name: &str,
    want_source: bool,
    platform: &PlatformDescriptor,
    defined_slots: &BTreeSet<u8>,
) -> Option<String> {
    if port.is_source() != want_source {
        let role = if want_source { "source" } else { "destination" };
        return Some(format!("'{name}' cannot be used as a {role}"));
    }

    match port {
        Port::Input(n) if n > platform.model.inputs() => Some(format!(
            "{} has no input {n}",
            platform.model
        )),
        Port::Output(n) if n > platform.model.outputs() => Some(format!(
            "{} has no output {n}",
            platform.model
        )),
        Port::SlotIn { slot, .. } | Port::SlotOut { slot, .. }
            if !defined_slots.contains(&slot) =>
        {
            Some(format!("'{name}' references undefined slot {slot}"))
        }
        _ => None,
    }
}
