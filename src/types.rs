//! Shared types for the work-queue orchestrator.
//!
//! Persisted queue/report records, the closed set of run modes and the
//! policies they resolve to, and the domain error taxonomy. Storage,
//! provisioning and engine modules all depend on these without depending
//! on each other.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Module entries
// ---------------------------------------------------------------------------

/// Name of the only module kind the provisioning step creates.
pub const TRADE_MODULE: &str = "trade";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    ToRun,
    Done,
}

/// One unit of pending work inside an account or group record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub module_name: String,
    pub status: ModuleStatus,
}

impl ModuleEntry {
    pub fn trade() -> Self {
        Self {
            module_name: TRADE_MODULE.to_string(),
            status: ModuleStatus::ToRun,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ModuleStatus::ToRun
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Single-account queue record. The queue key is the encrypted credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Encrypted wallet address.
    pub address: String,
    pub label: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

/// One member of a group record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Encrypted API credential.
    pub credential: String,
    /// Encrypted wallet address.
    pub address: String,
    pub label: String,
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Multi-account queue record. Distinguished from [`AccountRecord`] by the
/// presence of `group_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_number: u32,
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
    pub members: Vec<GroupMember>,
}

// ---------------------------------------------------------------------------
// Loaded work
// ---------------------------------------------------------------------------

/// A single-account work item as handed out by the work store.
///
/// In module-level modes there is one item per pending module; in
/// account-level modes there is one item per account.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Queue key, which is also the encrypted credential.
    pub key: String,
    pub encrypted_address: String,
    pub label: String,
    pub proxy: Option<String>,
    pub module: ModuleEntry,
}

impl WorkItem {
    pub fn encrypted_credential(&self) -> &str {
        &self.key
    }
}

/// A group work item. Its members share one lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupWorkItem {
    /// Group index used as queue and report key.
    pub key: String,
    pub group_number: u32,
    pub modules: Vec<ModuleEntry>,
    pub members: Vec<GroupMember>,
}

impl GroupWorkItem {
    pub fn label(&self) -> String {
        format!("Group {}", self.group_number)
    }
}

/// Result of a removal against the work store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// One module entry was removed; the account still has work queued.
    ModuleRemoved { remaining: usize },
    /// The whole account or group record is gone.
    ItemRemoved,
    /// Nothing matched. Removing twice is a no-op.
    NotFound,
}

impl Removal {
    /// Whether the owning key has no work left in the queue.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Removal::ModuleRemoved { .. })
    }
}

/// Read-only queue summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAmounts {
    pub accounts: usize,
    pub groups: usize,
    pub modules: usize,
}

impl fmt::Display for QueueAmounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.groups > 0 {
            write!(f, "{} groups", self.groups)
        } else {
            write!(f, "{} modules for {} accounts", self.modules, self.accounts)
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Three-state outcome of a report entry.
///
/// Persisted as `true`, `false` or `"WARNING"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportStatus {
    Success,
    Failure,
    Warning,
}

impl ReportStatus {
    pub fn glyph(&self) -> &'static str {
        match self {
            ReportStatus::Success => "✅ ",
            ReportStatus::Failure => "❌ ",
            ReportStatus::Warning => "⚠️ ",
        }
    }
}

impl From<bool> for ReportStatus {
    fn from(success: bool) -> Self {
        if success {
            ReportStatus::Success
        } else {
            ReportStatus::Failure
        }
    }
}

impl Serialize for ReportStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ReportStatus::Success => serializer.serialize_bool(true),
            ReportStatus::Failure => serializer.serialize_bool(false),
            ReportStatus::Warning => serializer.serialize_str("WARNING"),
        }
    }
}

impl<'de> Deserialize<'de> for ReportStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Tag(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(flag) => Ok(flag.into()),
            Raw::Tag(tag) if tag.eq_ignore_ascii_case("warning") => Ok(ReportStatus::Warning),
            Raw::Tag(other) => Err(D::Error::custom(format!("unknown report status: {other}"))),
        }
    }
}

/// One outcome line for a queue key. Entries keep append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub text: String,
    pub success: ReportStatus,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run modes
// ---------------------------------------------------------------------------

/// What a run does with each queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Futures market orders, one item per queued module.
    Market,
    /// Futures limit orders, one item per queued module.
    Limit,
    /// Delta-neutral group trading.
    Pair,
    /// Cancel all orders and close positions, one item per wallet.
    CancelAll,
    /// Collect account statistics, one item per wallet.
    ParseStats,
}

/// Which scheduling path a mode takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Single,
    Group,
}

/// How much of the queue an executed item consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalScope {
    Module,
    Account,
    Group,
}

/// Per-mode behaviour, resolved once at run start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePolicy {
    pub path: ExecutionPath,
    pub removal: RemovalScope,
    pub unique_wallets: bool,
}

impl RunMode {
    pub const ALL: [RunMode; 5] = [
        RunMode::Market,
        RunMode::Limit,
        RunMode::Pair,
        RunMode::CancelAll,
        RunMode::ParseStats,
    ];

    pub fn policy(&self) -> ModePolicy {
        match self {
            RunMode::Market | RunMode::Limit => ModePolicy {
                path: ExecutionPath::Single,
                removal: RemovalScope::Module,
                unique_wallets: false,
            },
            RunMode::CancelAll | RunMode::ParseStats => ModePolicy {
                path: ExecutionPath::Single,
                removal: RemovalScope::Account,
                unique_wallets: true,
            },
            RunMode::Pair => ModePolicy {
                path: ExecutionPath::Group,
                removal: RemovalScope::Group,
                unique_wallets: false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Market => "market",
            RunMode::Limit => "limit",
            RunMode::Pair => "pair",
            RunMode::CancelAll => "cancel",
            RunMode::ParseStats => "stats",
        }
    }

    /// Human-readable name used in digests.
    pub fn title(&self) -> &'static str {
        match self {
            RunMode::Market => "Futures Market",
            RunMode::Limit => "Futures Limits",
            RunMode::Pair => "Pair Futures Limits",
            RunMode::CancelAll => "Cancel Orders & Positions",
            RunMode::ParseStats => "Parse Statistics",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" | "1" => Ok(RunMode::Market),
            "limit" | "limits" | "2" => Ok(RunMode::Limit),
            "pair" | "pairs" | "3" => Ok(RunMode::Pair),
            "cancel" | "cancel-all" | "4" => Ok(RunMode::CancelAll),
            "stats" | "parse-stats" | "5" => Ok(RunMode::ParseStats),
            _ => Err(format!("Unknown run mode: {s}")),
        }
    }
}

/// Which queue shape the provisioning step writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionKind {
    Single,
    Pairs,
}

impl fmt::Display for ProvisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionKind::Single => write!(f, "single"),
            ProvisionKind::Pairs => write!(f, "pairs"),
        }
    }
}

impl std::str::FromStr for ProvisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "accounts" => Ok(ProvisionKind::Single),
            "pairs" | "pair" | "groups" => Ok(ProvisionKind::Pairs),
            _ => Err(format!("Unknown provisioning kind: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors for the orchestrator.
///
/// `Configuration` and `Credential` abort a run before scheduling;
/// `RemoteOperation` is contained at the item boundary.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Remote operation failed ({label}): {message}")]
    RemoteOperation { label: String, message: String },

    #[error("Timed out after {waited:?} waiting for resource {key}")]
    ResourceContentionTimeout { key: String, waited: Duration },

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
