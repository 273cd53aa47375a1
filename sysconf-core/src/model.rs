//! The `ietf-system` leaves managed by sysconf, and the values that flow
//! between the configuration store, the reconciliation engine and the OS.

use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// The data model module whose leaves are managed.
pub const MODULE: &str = "ietf-system";

/// One independently settable value in the system container.
///
/// The derived `Ord` is the apply order: hostname, contact, location, ntp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Leaf {
    Hostname,
    Contact,
    Location,
    NtpEnabled,
}

/// The type of value a leaf holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Bool,
}

impl Leaf {
    pub const ALL: [Leaf; 4] = [Leaf::Hostname, Leaf::Contact, Leaf::Location, Leaf::NtpEnabled];

    pub fn name(&self) -> &'static str {
        match self {
            Leaf::Hostname => "hostname",
            Leaf::Contact => "contact",
            Leaf::Location => "location",
            Leaf::NtpEnabled => "ntp-enabled",
        }
    }

    /// Path of the leaf in the data model.
    pub fn path(&self) -> &'static str {
        match self {
            Leaf::Hostname => "/ietf-system:system/hostname",
            Leaf::Contact => "/ietf-system:system/contact",
            Leaf::Location => "/ietf-system:system/location",
            Leaf::NtpEnabled => "/ietf-system:system/ntp/enabled",
        }
    }

    pub fn from_path(path: &str) -> Option<Leaf> {
        Leaf::ALL.into_iter().find(|leaf| leaf.path() == path)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Leaf::NtpEnabled => ValueKind::Bool,
            _ => ValueKind::Text,
        }
    }

    /// The value a leaf is reset to when it is deleted from the configuration,
    /// and the value reported when the OS has nothing to say about it.
    pub fn default_value(&self) -> LeafValue {
        match self.kind() {
            ValueKind::Text => LeafValue::Text(String::new()),
            ValueKind::Bool => LeafValue::Bool(false),
        }
    }

    /// Parse a value given on a command line, according to the leaf's kind.
    pub fn parse_value(&self, s: &str) -> Result<LeafValue> {
        match self.kind() {
            ValueKind::Text => Ok(LeafValue::Text(s.to_string())),
            ValueKind::Bool => match s {
                "true" => Ok(LeafValue::Bool(true)),
                "false" => Ok(LeafValue::Bool(false)),
                _ => bail!("{} expects true or false, got {:?}", self, s),
            },
        }
    }
}

impl Display for Leaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Leaf {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Leaf::ALL
            .into_iter()
            .find(|leaf| leaf.name() == s || leaf.path() == s)
        {
            Some(leaf) => Ok(leaf),
            None => bail!("unknown leaf: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeafValue {
    Bool(bool),
    Text(String),
}

impl LeafValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            LeafValue::Bool(_) => ValueKind::Bool,
            LeafValue::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            LeafValue::Text(s) => Some(s.as_str()),
            LeafValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            LeafValue::Bool(b) => Some(*b),
            LeafValue::Text(_) => None,
        }
    }
}

impl Display for LeafValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeafValue::Bool(b) => write!(f, "{}", b),
            LeafValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Created,
    Modified,
    Deleted,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Created => "created",
            Operation::Modified => "modified",
            Operation::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// A single leaf change within a configuration transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub leaf: Leaf,
    pub operation: Operation,
    /// The new value. Absent for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<LeafValue>,
}

impl Change {
    pub fn modified(leaf: Leaf, value: LeafValue) -> Self {
        Change {
            leaf,
            operation: Operation::Modified,
            value: Some(value),
        }
    }

    pub fn created(leaf: Leaf, value: LeafValue) -> Self {
        Change {
            leaf,
            operation: Operation::Created,
            value: Some(value),
        }
    }

    pub fn deleted(leaf: Leaf) -> Self {
        Change {
            leaf,
            operation: Operation::Deleted,
            value: None,
        }
    }
}

/// The changed leaves of one configuration transaction.
///
/// Each leaf appears at most once. The order is whatever the store produced;
/// consumers must not rely on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Change>", into = "Vec<Change>")]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(changes: Vec<Change>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for change in &changes {
            if !seen.insert(change.leaf) {
                bail!("leaf {} appears more than once in a change set", change.leaf);
            }
        }
        Ok(ChangeSet { changes })
    }

    /// The change set that brings the OS to a full configuration snapshot:
    /// every leaf present in `config`, marked as modified.
    pub fn from_config(config: &SystemConfig) -> Self {
        ChangeSet {
            changes: Leaf::ALL
                .into_iter()
                .filter_map(|leaf| config.get(leaf).map(|v| Change::modified(leaf, v)))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn get(&self, leaf: Leaf) -> Option<&Change> {
        self.changes.iter().find(|c| c.leaf == leaf)
    }

    /// The changes sorted by leaf, independent of arrival order.
    pub fn in_apply_order(&self) -> Vec<&Change> {
        let mut changes: Vec<&Change> = self.changes.iter().collect();
        changes.sort_by_key(|c| c.leaf);
        changes
    }
}

impl TryFrom<Vec<Change>> for ChangeSet {
    type Error = anyhow::Error;

    fn try_from(changes: Vec<Change>) -> Result<Self> {
        ChangeSet::new(changes)
    }
}

impl From<ChangeSet> for Vec<Change> {
    fn from(set: ChangeSet) -> Self {
        set.changes
    }
}

/// Desired state, as held by the configuration store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp_enabled: Option<bool>,
}

impl SystemConfig {
    pub fn is_empty(&self) -> bool {
        Leaf::ALL.into_iter().all(|leaf| self.get(leaf).is_none())
    }

    pub fn get(&self, leaf: Leaf) -> Option<LeafValue> {
        match leaf {
            Leaf::Hostname => self.hostname.clone().map(LeafValue::Text),
            Leaf::Contact => self.contact.clone().map(LeafValue::Text),
            Leaf::Location => self.location.clone().map(LeafValue::Text),
            Leaf::NtpEnabled => self.ntp_enabled.map(LeafValue::Bool),
        }
    }

    /// Set the desired value of `leaf`. A value of the wrong kind is ignored.
    pub fn set(&mut self, leaf: Leaf, value: LeafValue) {
        match (leaf, value) {
            (Leaf::Hostname, LeafValue::Text(s)) => self.hostname = Some(s),
            (Leaf::Contact, LeafValue::Text(s)) => self.contact = Some(s),
            (Leaf::Location, LeafValue::Text(s)) => self.location = Some(s),
            (Leaf::NtpEnabled, LeafValue::Bool(b)) => self.ntp_enabled = Some(b),
            _ => {}
        }
    }
}

/// Operational state: what the OS reports right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemState {
    pub hostname: String,
    pub contact: String,
    pub location: String,
    pub ntp_enabled: bool,
}

impl SystemState {
    pub fn get(&self, leaf: Leaf) -> LeafValue {
        match leaf {
            Leaf::Hostname => LeafValue::Text(self.hostname.clone()),
            Leaf::Contact => LeafValue::Text(self.contact.clone()),
            Leaf::Location => LeafValue::Text(self.location.clone()),
            Leaf::NtpEnabled => LeafValue::Bool(self.ntp_enabled),
        }
    }

    /// Store a value read for `leaf`. A value of the wrong kind leaves the
    /// field at its default.
    pub fn set(&mut self, leaf: Leaf, value: LeafValue) {
        match leaf {
            Leaf::Hostname => self.hostname = value.as_text().unwrap_or_default().to_string(),
            Leaf::Contact => self.contact = value.as_text().unwrap_or_default().to_string(),
            Leaf::Location => self.location = value.as_text().unwrap_or_default().to_string(),
            Leaf::NtpEnabled => self.ntp_enabled = value.as_bool().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The value is malformed; nothing was sent to the OS.
    Validation,
    OsRejected,
    PermissionDenied,
    ServiceManagerUnavailable,
    Io,
}

impl FailureKind {
    /// Failures that may succeed when attempted again unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Io)
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation error",
            FailureKind::OsRejected => "rejected by the OS",
            FailureKind::PermissionDenied => "permission denied",
            FailureKind::ServiceManagerUnavailable => "service manager unavailable",
            FailureKind::Io => "I/O error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Failure::new(FailureKind::Validation, message)
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of applying one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyResult {
    Applied,
    Rejected(Failure),
    /// The host lacks the facility the leaf needs, e.g. a service manager.
    Unsupported(Failure),
}

impl ApplyResult {
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ApplyResult::Applied => None,
            ApplyResult::Rejected(f) | ApplyResult::Unsupported(f) => Some(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafFailure {
    pub leaf: Leaf,
    pub failure: Failure,
}

impl Display for LeafFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.leaf, self.failure)
    }
}

/// The agent's answer to a configuration transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum Verdict {
    Accept,
    /// The store must roll back its transaction. The OS may already carry
    /// some of the new values if the failure happened while applying.
    Abort {
        /// The first failure, or why the transaction was refused.
        reason: String,
        failures: Vec<LeafFailure>,
    },
}

impl Verdict {
    pub fn from_failures(failures: Vec<LeafFailure>) -> Self {
        match failures.first() {
            None => Verdict::Accept,
            Some(first) => Verdict::Abort {
                reason: first.to_string(),
                failures,
            },
        }
    }

    pub fn shutting_down() -> Self {
        Verdict::Abort {
            reason: "agent is shutting down".to_string(),
            failures: Vec::new(),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    pub fn failures(&self) -> &[LeafFailure] {
        match self {
            Verdict::Accept => &[],
            Verdict::Abort { failures, .. } => failures.as_slice(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformState {
    pub os_name: String,
    pub os_release: String,
    pub os_version: String,
    pub machine: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClockState {
    /// RFC 3339
    pub current_datetime: String,
    /// RFC 3339
    pub boot_datetime: String,
}
