//! One handler per managed leaf.
//!
//! A handler validates a proposed change without touching the OS, applies a
//! validated change through the [`SystemOs`] adapter, and reads the leaf's
//! operational value back from the OS.

use std::sync::Arc;

use sysconf_core::model::{
    ApplyResult, Change, Failure, FailureKind, Leaf, LeafValue, Operation, SystemConfig,
    SystemState, ValueKind,
};
use sysconf_os::{OsError, SystemOs};

/// Longest hostname the kernel accepts, in bytes.
pub const HOSTNAME_MAX_LEN: usize = 64;
/// Longest contact that fits the identity field, in bytes.
pub const CONTACT_MAX_LEN: usize = 100;

/// What deleting the hostname from the configuration does to the OS.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostnameOnDelete {
    /// Leave the current hostname alone.
    #[default]
    Keep,
    Reset(String),
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub hostname_on_delete: HostnameOnDelete,
    /// NTP service units to try, in order.
    pub ntp_units: Vec<String>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            hostname_on_delete: HostnameOnDelete::Keep,
            ntp_units: vec!["ntpd".to_string(), "ntp".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostnameHandler {
    on_delete: HostnameOnDelete,
}

#[derive(Debug, Clone)]
pub struct ContactHandler;

#[derive(Debug, Clone)]
pub struct LocationHandler;

#[derive(Debug, Clone)]
pub struct NtpHandler {
    units: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum LeafHandler {
    Hostname(HostnameHandler),
    Contact(ContactHandler),
    Location(LocationHandler),
    Ntp(NtpHandler),
}

/// The value a created or modified leaf is set to, checked against the
/// leaf's kind. `None` for deletions.
fn proposed_value(change: &Change) -> Result<Option<&LeafValue>, Failure> {
    match (change.operation, &change.value) {
        (Operation::Deleted, _) => Ok(None),
        (_, None) => Err(Failure::validation(format!(
            "{} {} without a value",
            change.leaf, change.operation
        ))),
        (_, Some(value)) if value.kind() != change.leaf.kind() => {
            Err(Failure::validation(format!(
                "{} expects {}, got {:?}",
                change.leaf,
                kind_name(change.leaf.kind()),
                value
            )))
        }
        (_, Some(value)) => Ok(Some(value)),
    }
}

fn kind_name(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Text => "a string",
        ValueKind::Bool => "a boolean",
    }
}

fn text_of(change: &Change) -> Option<&str> {
    change.value.as_ref().and_then(|v| v.as_text())
}

fn from_os(r: Result<(), OsError>) -> ApplyResult {
    match r {
        Ok(()) => ApplyResult::Applied,
        Err(e @ OsError::ServiceManagerUnavailable(_)) => ApplyResult::Unsupported(e.failure()),
        Err(e) => ApplyResult::Rejected(e.failure()),
    }
}

impl HostnameHandler {
    fn validate(&self, change: &Change) -> Result<(), Failure> {
        let Some(value) = proposed_value(change)? else {
            return Ok(());
        };
        let name = value.as_text().unwrap_or_default();
        if name.is_empty() {
            return Err(Failure::validation("hostname must not be empty"));
        }
        if name.len() > HOSTNAME_MAX_LEN {
            return Err(Failure::validation(format!(
                "hostname is {} bytes long, at most {} are allowed",
                name.len(),
                HOSTNAME_MAX_LEN
            )));
        }
        if let Some(c) = name.chars().find(|c| !c.is_ascii_graphic()) {
            return Err(Failure::validation(format!(
                "hostname contains invalid character {:?}",
                c
            )));
        }
        Ok(())
    }

    fn apply(&self, os: &dyn SystemOs, change: &Change) -> ApplyResult {
        let name = match (change.operation, &self.on_delete) {
            (Operation::Deleted, HostnameOnDelete::Keep) => {
                tracing::debug!("hostname deleted from configuration, keeping the current one");
                return ApplyResult::Applied;
            }
            (Operation::Deleted, HostnameOnDelete::Reset(name)) => name.as_str(),
            _ => text_of(change).unwrap_or_default(),
        };
        from_os(os.set_hostname(name))
    }

    fn read(&self, os: &dyn SystemOs) -> Result<String, OsError> {
        os.hostname()
    }
}

impl ContactHandler {
    fn validate(&self, change: &Change) -> Result<(), Failure> {
        let Some(value) = proposed_value(change)? else {
            return Ok(());
        };
        let text = value.as_text().unwrap_or_default();
        if text.contains(':') || text.contains('\n') || text.contains('\r') {
            return Err(Failure::validation(
                "contact must not contain ':' or line breaks",
            ));
        }
        if text.len() > CONTACT_MAX_LEN {
            return Err(Failure::validation(format!(
                "contact is {} bytes long, at most {} are allowed",
                text.len(),
                CONTACT_MAX_LEN
            )));
        }
        Ok(())
    }

    fn apply(&self, os: &dyn SystemOs, change: &Change) -> ApplyResult {
        let text = match change.operation {
            Operation::Deleted => "",
            _ => text_of(change).unwrap_or_default(),
        };
        from_os(os.set_identity_field(text))
    }

    fn read(&self, os: &dyn SystemOs) -> Result<String, OsError> {
        os.identity_field()
    }
}

impl LocationHandler {
    fn validate(&self, change: &Change) -> Result<(), Failure> {
        proposed_value(change).map(|_| ())
    }

    fn apply(&self, os: &dyn SystemOs, change: &Change) -> ApplyResult {
        let text = match change.operation {
            Operation::Deleted => "",
            _ => text_of(change).unwrap_or_default(),
        };
        from_os(os.set_location_marker(text))
    }

    fn read(&self, os: &dyn SystemOs) -> Result<String, OsError> {
        match os.location_marker() {
            Err(OsError::NotFound(_)) => Ok(String::new()),
            r => r,
        }
    }
}

impl NtpHandler {
    fn validate(&self, change: &Change) -> Result<(), Failure> {
        proposed_value(change).map(|_| ())
    }

    fn apply(&self, os: &dyn SystemOs, change: &Change) -> ApplyResult {
        let enabled = match change.operation {
            Operation::Deleted => false,
            _ => change
                .value
                .as_ref()
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };
        if !enabled {
            return self.disable_all(os);
        }
        for unit in &self.units {
            match os.set_service_enabled(unit, true) {
                Err(OsError::UnitNotFound(_)) => {
                    tracing::debug!(unit = %unit, "NTP unit not installed, trying the next one");
                }
                r => {
                    if r.is_ok() {
                        tracing::debug!(unit = %unit, "NTP service enabled");
                    }
                    return from_os(r);
                }
            }
        }
        ApplyResult::Rejected(Failure::new(
            FailureKind::OsRejected,
            format!("none of the NTP units {} is installed", self.units.join(", ")),
        ))
    }

    /// Stop every installed candidate, since a read reports any active one.
    /// Having none installed counts as disabled.
    fn disable_all(&self, os: &dyn SystemOs) -> ApplyResult {
        let mut first_error = None;
        for unit in &self.units {
            match os.set_service_enabled(unit, false) {
                Ok(()) => tracing::debug!(unit = %unit, "NTP service disabled"),
                Err(OsError::UnitNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(unit = %unit, "disabling NTP unit failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        from_os(first_error.map_or(Ok(()), Err))
    }

    fn read(&self, os: &dyn SystemOs) -> Result<bool, OsError> {
        for unit in &self.units {
            if os.service_active(unit)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl LeafHandler {
    pub fn leaf(&self) -> Leaf {
        match self {
            LeafHandler::Hostname(_) => Leaf::Hostname,
            LeafHandler::Contact(_) => Leaf::Contact,
            LeafHandler::Location(_) => Leaf::Location,
            LeafHandler::Ntp(_) => Leaf::NtpEnabled,
        }
    }

    /// Check a change without touching the OS.
    pub fn validate(&self, change: &Change) -> Result<(), Failure> {
        match self {
            LeafHandler::Hostname(h) => h.validate(change),
            LeafHandler::Contact(h) => h.validate(change),
            LeafHandler::Location(h) => h.validate(change),
            LeafHandler::Ntp(h) => h.validate(change),
        }
    }

    /// Apply a validated change. Applying the same change twice leaves the OS
    /// in the same state as applying it once.
    pub fn apply(&self, os: &dyn SystemOs, change: &Change) -> ApplyResult {
        match self {
            LeafHandler::Hostname(h) => h.apply(os, change),
            LeafHandler::Contact(h) => h.apply(os, change),
            LeafHandler::Location(h) => h.apply(os, change),
            LeafHandler::Ntp(h) => h.apply(os, change),
        }
    }

    pub fn try_read(&self, os: &dyn SystemOs) -> Result<LeafValue, OsError> {
        match self {
            LeafHandler::Hostname(h) => h.read(os).map(LeafValue::Text),
            LeafHandler::Contact(h) => h.read(os).map(LeafValue::Text),
            LeafHandler::Location(h) => h.read(os).map(LeafValue::Text),
            LeafHandler::Ntp(h) => h.read(os).map(LeafValue::Bool),
        }
    }

    /// The leaf's value as the OS reports it right now. Never fails: a fault
    /// is logged and the leaf's default is reported.
    pub fn read(&self, os: &dyn SystemOs) -> LeafValue {
        self.try_read(os).unwrap_or_else(|e| {
            let leaf = self.leaf();
            tracing::warn!(%leaf, "reading from the OS failed: {}", e);
            leaf.default_value()
        })
    }
}

/// The handlers of all managed leaves, sharing one OS adapter.
pub struct Handlers {
    os: Arc<dyn SystemOs>,
    hostname: LeafHandler,
    contact: LeafHandler,
    location: LeafHandler,
    ntp: LeafHandler,
}

impl Handlers {
    pub fn new(os: Arc<dyn SystemOs>, config: HandlerConfig) -> Self {
        Handlers {
            os,
            hostname: LeafHandler::Hostname(HostnameHandler {
                on_delete: config.hostname_on_delete,
            }),
            contact: LeafHandler::Contact(ContactHandler),
            location: LeafHandler::Location(LocationHandler),
            ntp: LeafHandler::Ntp(NtpHandler {
                units: config.ntp_units,
            }),
        }
    }

    pub fn get(&self, leaf: Leaf) -> &LeafHandler {
        match leaf {
            Leaf::Hostname => &self.hostname,
            Leaf::Contact => &self.contact,
            Leaf::Location => &self.location,
            Leaf::NtpEnabled => &self.ntp,
        }
    }

    pub fn os(&self) -> &dyn SystemOs {
        self.os.as_ref()
    }

    pub fn validate(&self, change: &Change) -> Result<(), Failure> {
        self.get(change.leaf).validate(change)
    }

    pub fn apply(&self, change: &Change) -> ApplyResult {
        self.get(change.leaf).apply(self.os(), change)
    }

    pub fn read(&self, leaf: Leaf) -> LeafValue {
        self.get(leaf).read(self.os())
    }

    pub fn read_state(&self) -> SystemState {
        let mut state = SystemState::default();
        for leaf in Leaf::ALL {
            state.set(leaf, self.read(leaf));
        }
        state
    }

    /// The current OS state, as a configuration the store can adopt. Leaves
    /// that could not be read are left out rather than seeded with a default.
    pub fn snapshot_config(&self) -> SystemConfig {
        let mut config = SystemConfig::default();
        for leaf in Leaf::ALL {
            match self.get(leaf).try_read(self.os()) {
                Ok(value) => config.set(leaf, value),
                Err(e) => tracing::warn!(%leaf, "not seeding from the OS: {}", e),
            }
        }
        config
    }
}
