use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle returned by `submit`. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The external tools this system knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    #[serde(rename = "nmap")]
    PortScan,
    #[serde(rename = "whatweb")]
    Fingerprint,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortScan => "nmap",
            Self::Fingerprint => "whatweb",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanPreset {
    /// service/version + OS detection
    #[default]
    Basic,
    /// basic plus vulnerability scripts
    Stealth,
    /// everything, including `-A`
    Aggressive,
    /// service/version detection only
    PortScan,
    /// no preset switches, explicit options only
    Custom,
}

/// Value side of an explicit tool option (`{"--script": "http-title", "-Pn": true}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Text(String),
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// A scan request as accepted by the dispatcher. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    pub tool: ToolKind,
    pub target: String,
    #[serde(default)]
    pub preset: ScanPreset,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
    #[serde(default)]
    pub project_ref: Option<i64>,
}

impl ScanJob {
    pub fn new(tool: ToolKind, target: impl Into<String>) -> Self {
        Self {
            tool,
            target: target.into(),
            preset: ScanPreset::default(),
            ports: None,
            options: BTreeMap::new(),
            project_ref: None,
        }
    }

    /// Basic port scan over the first thousand ports.
    pub fn quick(target: impl Into<String>) -> Self {
        Self::new(ToolKind::PortScan, target)
            .with_preset(ScanPreset::Basic)
            .with_ports("1-1000")
    }

    /// Aggressive port scan over every TCP port.
    pub fn full(target: impl Into<String>) -> Self {
        Self::new(ToolKind::PortScan, target)
            .with_preset(ScanPreset::Aggressive)
            .with_ports("1-65535")
    }

    pub fn with_preset(mut self, preset: ScanPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = Some(ports.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn for_project(mut self, project_ref: i64) -> Self {
        self.project_ref = Some(project_ref);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// ```text
    /// Pending ──► Running ──► Completed
    ///    │           │  └───► Failed
    ///    └──► Cancelled ◄┘
    /// ```
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanInfo {
    #[serde(rename = "type")]
    pub scan_type: Option<String>,
    pub protocol: Option<String>,
    pub service_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    #[serde(rename = "type")]
    pub addr_type: Option<String>,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsGuess {
    pub name: String,
    pub accuracy: u8,
    pub line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extrainfo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub protocol: String,
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub addresses: Vec<AddressRecord>,
    pub hostnames: Vec<HostnameRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_info: Option<OsGuess>,
    pub ports: Vec<PortRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NmapReport {
    pub scan_info: ScanInfo,
    pub hosts: Vec<HostRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FingerprintValue {
    Flag(bool),
    Text(String),
}

/// Structured side of a normalized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScanPayload {
    PortScan(NmapReport),
    Error { error: String },
    Fingerprint(BTreeMap<String, FingerprintValue>),
}

impl ScanPayload {
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Terminal result of one executed job, handed to persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedScanRecord {
    pub scan_kind: ToolKind,
    pub status: TaskStatus,
    pub raw_output: String,
    pub parsed: Option<ScanPayload>,
    pub command: String,
    pub options: BTreeMap<String, OptionValue>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// What a status poll sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub tool: ToolKind,
    pub target: String,
    pub status: TaskStatus,
    pub record: Option<NormalizedScanRecord>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
