//! An in-memory [`SystemOs`] for tests and dry runs.
//!
//! It records every mutating call and can be told to fail specific
//! operations, so callers can check both the resulting state and whether the
//! OS was touched at all.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use sysconf_core::model::{ClockState, PlatformState};

use crate::{OsError, PowerAction, SystemOs};

/// Linux limit on hostname length in bytes.
const HOST_NAME_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OsOperation {
    Hostname,
    SetHostname,
    IdentityField,
    SetIdentityField,
    LocationMarker,
    SetLocationMarker,
    ServiceActive,
    SetServiceEnabled,
}

/// A mutating call, recorded whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsCall {
    SetHostname(String),
    SetIdentityField(String),
    SetLocationMarker(String),
    SetServiceEnabled(String, bool),
    SetCurrentDatetime(String),
    Power(PowerAction),
}

type MakeError = Box<dyn Fn() -> OsError + Send>;

struct State {
    hostname: String,
    identity: String,
    location: Option<String>,
    service_manager: bool,
    /// Installed units and whether they are active.
    units: BTreeMap<String, bool>,
    booted: DateTime<Utc>,
    clock_offset: chrono::Duration,
    calls: Vec<OsCall>,
    faults: BTreeMap<OsOperation, VecDeque<MakeError>>,
}

pub struct MemoryOs {
    state: Mutex<State>,
}

impl Default for MemoryOs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOs {
    /// A host named `localhost` with an inactive `ntp` unit and nothing else
    /// configured.
    pub fn new() -> Self {
        MemoryOs {
            state: Mutex::new(State {
                hostname: "localhost".to_string(),
                identity: String::new(),
                location: None,
                service_manager: true,
                units: BTreeMap::from([("ntp".to_string(), false)]),
                booted: Utc::now(),
                clock_offset: chrono::Duration::zero(),
                calls: Vec::new(),
                faults: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `times` invocations of `operation` fail with the error
    /// produced by `make`.
    pub fn fail(
        &self,
        operation: OsOperation,
        times: usize,
        make: impl Fn() -> OsError + Send + Clone + 'static,
    ) {
        let mut state = self.lock();
        let queue = state.faults.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(Box::new(make.clone()));
        }
    }

    pub fn set_service_manager(&self, available: bool) {
        self.lock().service_manager = available;
    }

    /// Replace the installed units; all start inactive.
    pub fn set_units(&self, units: &[&str]) {
        self.lock().units = units.iter().map(|u| (u.to_string(), false)).collect();
    }

    /// Change a unit behind the agent's back, as an administrator would.
    pub fn set_unit_active(&self, unit: &str, active: bool) {
        self.lock().units.insert(unit.to_string(), active);
    }

    pub fn set_initial_hostname(&self, name: &str) {
        self.lock().hostname = name.to_string();
    }

    pub fn calls(&self) -> Vec<OsCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn current_hostname(&self) -> String {
        self.lock().hostname.clone()
    }

    pub fn current_identity(&self) -> String {
        self.lock().identity.clone()
    }

    pub fn current_location(&self) -> Option<String> {
        self.lock().location.clone()
    }

    pub fn unit_active(&self, unit: &str) -> bool {
        self.lock().units.get(unit).copied().unwrap_or(false)
    }
}

impl State {
    fn check(&mut self, operation: OsOperation) -> Result<(), OsError> {
        match self
            .faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
        {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }

    fn check_service_manager(&self) -> Result<(), OsError> {
        if self.service_manager {
            Ok(())
        } else {
            Err(OsError::ServiceManagerUnavailable(
                "no service manager on this host".to_string(),
            ))
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }
}

impl SystemOs for MemoryOs {
    fn hostname(&self) -> Result<String, OsError> {
        let mut state = self.lock();
        state.check(OsOperation::Hostname)?;
        Ok(state.hostname.clone())
    }

    fn set_hostname(&self, name: &str) -> Result<(), OsError> {
        let mut state = self.lock();
        state.calls.push(OsCall::SetHostname(name.to_string()));
        state.check(OsOperation::SetHostname)?;
        if name.len() > HOST_NAME_MAX {
            return Err(OsError::InvalidName(name.to_string()));
        }
        state.hostname = name.to_string();
        Ok(())
    }

    fn identity_field(&self) -> Result<String, OsError> {
        let mut state = self.lock();
        state.check(OsOperation::IdentityField)?;
        Ok(state.identity.clone())
    }

    fn set_identity_field(&self, text: &str) -> Result<(), OsError> {
        let mut state = self.lock();
        state.calls.push(OsCall::SetIdentityField(text.to_string()));
        state.check(OsOperation::SetIdentityField)?;
        state.identity = text.to_string();
        Ok(())
    }

    fn location_marker(&self) -> Result<String, OsError> {
        let mut state = self.lock();
        state.check(OsOperation::LocationMarker)?;
        state
            .location
            .clone()
            .ok_or_else(|| OsError::NotFound("location marker".to_string()))
    }

    fn set_location_marker(&self, text: &str) -> Result<(), OsError> {
        let mut state = self.lock();
        state.calls.push(OsCall::SetLocationMarker(text.to_string()));
        state.check(OsOperation::SetLocationMarker)?;
        state.location = Some(text.to_string());
        Ok(())
    }

    fn service_active(&self, unit: &str) -> Result<bool, OsError> {
        let mut state = self.lock();
        state.check(OsOperation::ServiceActive)?;
        state.check_service_manager()?;
        Ok(state.units.get(unit).copied().unwrap_or(false))
    }

    fn set_service_enabled(&self, unit: &str, enabled: bool) -> Result<(), OsError> {
        let mut state = self.lock();
        state
            .calls
            .push(OsCall::SetServiceEnabled(unit.to_string(), enabled));
        state.check(OsOperation::SetServiceEnabled)?;
        state.check_service_manager()?;
        match state.units.get_mut(unit) {
            Some(active) => {
                *active = enabled;
                Ok(())
            }
            None => Err(OsError::UnitNotFound(unit.to_string())),
        }
    }

    fn platform(&self) -> Result<PlatformState, OsError> {
        Ok(PlatformState {
            os_name: "Linux".to_string(),
            os_release: "6.1.0".to_string(),
            os_version: "#1 SMP".to_string(),
            machine: "x86_64".to_string(),
        })
    }

    fn clock(&self) -> Result<ClockState, OsError> {
        let state = self.lock();
        Ok(ClockState {
            current_datetime: state.now().to_rfc3339_opts(SecondsFormat::Secs, true),
            boot_datetime: (state.booted + state.clock_offset)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    fn set_current_datetime(&self, datetime: DateTime<FixedOffset>) -> Result<(), OsError> {
        let mut state = self.lock();
        state
            .calls
            .push(OsCall::SetCurrentDatetime(datetime.to_rfc3339()));
        state.clock_offset = datetime.with_timezone(&Utc) - Utc::now();
        Ok(())
    }

    fn power(&self, action: PowerAction) -> Result<(), OsError> {
        self.lock().calls.push(OsCall::Power(action));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faults_are_consumed_in_order() {
        let os = MemoryOs::new();
        os.fail(OsOperation::SetHostname, 1, || {
            OsError::PermissionDenied("not root".to_string())
        });
        assert!(matches!(
            os.set_hostname("a"),
            Err(OsError::PermissionDenied(_))
        ));
        os.set_hostname("a").unwrap();
        assert_eq!(os.current_hostname(), "a");
        assert_eq!(
            os.calls(),
            vec![
                OsCall::SetHostname("a".to_string()),
                OsCall::SetHostname("a".to_string())
            ]
        );
    }

    #[test]
    fn test_units() {
        let os = MemoryOs::new();
        os.set_units(&["ntpd"]);
        assert!(matches!(
            os.set_service_enabled("ntp", true),
            Err(OsError::UnitNotFound(_))
        ));
        os.set_service_enabled("ntpd", true).unwrap();
        assert!(os.service_active("ntpd").unwrap());
        os.set_service_manager(false);
        assert!(matches!(
            os.service_active("ntpd"),
            Err(OsError::ServiceManagerUnavailable(_))
        ));
    }

    #[test]
    fn test_location_marker_absent_until_written() {
        let os = MemoryOs::new();
        assert!(matches!(os.location_marker(), Err(OsError::NotFound(_))));
        os.set_location_marker("lab").unwrap();
        assert_eq!(os.location_marker().unwrap(), "lab");
    }

    #[test]
    fn test_set_current_datetime_moves_clock() {
        let os = MemoryOs::new();
        let target = DateTime::parse_from_rfc3339("2021-02-09T06:02:39Z").unwrap();
        os.set_current_datetime(target).unwrap();
        let clock = os.clock().unwrap();
        assert!(clock.current_datetime.starts_with("2021-02-09T06:0"));
    }
}
