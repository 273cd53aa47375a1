use std::{
    collections::BTreeSet,
    hash::{Hash, Hasher},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::model::{
    Change, ChangeSet, ClockState, Failure, Leaf, LeafFailure, LeafValue, PlatformState,
    SystemConfig, SystemState, Verdict,
};

pub struct Ids {
    counter: u64,
}
impl Ids {
    pub fn new() -> Self {
        Ids { counter: 0 }
    }
    pub fn next<T>(&mut self) -> Id<T> {
        let id = self.counter;
        self.counter += 1;
        Id::new(id)
    }
}
impl Default for Ids {
    fn default() -> Self {
        Self::new()
    }
}

pub type IdNum = u64;

/// A unique identifier, allocated by whichever side starts the exchange.
/// The type parameter T is used to check that the id is only used for the type it was created for.
/// This is a compile-time check only, and only serves to help the programmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T> {
    id: IdNum,
    #[serde(skip)]
    phantom: std::marker::PhantomData<T>,
}
impl<T> Id<T> {
    pub fn new(id: u64) -> Self {
        Id {
            id,
            phantom: std::marker::PhantomData,
        }
    }
    pub fn num(&self) -> IdNum {
        self.id
    }
}
impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl<T: Clone> Copy for Id<T> {}
impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for Id<T> {}
impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
impl<T> std::fmt::Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Request/response pairs are matched by message ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageType;
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionType;
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionType;

/// Operations of the data model that are not configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rpc {
    /// RFC 3339 date and time to set the system clock to.
    SetCurrentDatetime(String),
    SystemRestart,
    SystemShutdown,
}

/// Messages from the configuration store to the agent.
///
/// One JSON document per line on the agent's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMessage {
    /// Answer to [`AgentMessage::Subscribe`].
    Subscribed { session: Id<SessionType> },
    /// Answer to [`AgentMessage::ReadConfig`].
    Config(Id<MessageType>, SystemConfig),
    /// A configuration transaction touching managed leaves. The store waits
    /// for the [`AgentMessage::Verdict`] before completing or rolling back.
    Transaction {
        id: Id<TransactionType>,
        changes: ChangeSet,
    },
    GetConfigState(Id<MessageType>),
    GetLeaf(Id<MessageType>, Leaf),
    GetSystemState(Id<MessageType>),
    Rpc(Id<MessageType>, Rpc),
    /// The store is going away; the agent should release its session.
    Shutdown,
}

/// Messages from the agent to the configuration store.
///
/// One JSON document per line on the agent's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentMessage {
    Subscribe {
        module: String,
        paths: Vec<String>,
    },
    ReadConfig(Id<MessageType>),
    /// Replace the store's empty configuration with the current OS state.
    SeedConfig(SystemConfig),
    /// The agent is subscribed, has applied the initial configuration and
    /// accepts transactions.
    Ready,
    Verdict {
        transaction: Id<TransactionType>,
        verdict: Verdict,
    },
    ConfigState(Id<MessageType>, SystemState),
    LeafState(Id<MessageType>, Leaf, LeafValue),
    SystemState(Id<MessageType>, PlatformState, ClockState),
    RpcDone(Id<MessageType>),
    Error(Id<MessageType>, String),
    Unsubscribe {
        session: Id<SessionType>,
    },
}

/// Facade for the agent
pub fn store_message_from_json(s: &str) -> Result<StoreMessage> {
    serde_json::from_str(s).map_err(|e| e.into())
}

/// Recover a transaction whose change set does not deserialize, so that the
/// store still gets a verdict for it. Returns `None` unless the line is a
/// transaction with a readable id.
pub fn rejected_transaction_from_json(s: &str) -> Option<(Id<TransactionType>, Verdict)> {
    #[derive(Deserialize)]
    enum Envelope {
        Transaction {
            id: Id<TransactionType>,
            changes: Vec<serde_json::Value>,
        },
    }
    let Envelope::Transaction { id, changes } = serde_json::from_str(s).ok()?;

    let mut failures = Vec::new();
    let mut unreadable = None;
    let mut seen = BTreeSet::new();
    for raw in changes {
        let leaf = raw.get("leaf").and_then(|l| Leaf::deserialize(l).ok());
        match (serde_json::from_value::<Change>(raw), leaf) {
            (Ok(change), _) => {
                if !seen.insert(change.leaf) {
                    failures.push(LeafFailure {
                        leaf: change.leaf,
                        failure: Failure::validation("leaf appears more than once"),
                    });
                }
            }
            (Err(e), Some(leaf)) => failures.push(LeafFailure {
                leaf,
                failure: Failure::validation(e.to_string()),
            }),
            (Err(e), None) => {
                unreadable.get_or_insert_with(|| format!("unreadable change: {}", e));
            }
        }
    }
    let verdict = match unreadable {
        Some(reason) if failures.is_empty() => Verdict::Abort { reason, failures },
        _ if failures.is_empty() => Verdict::Abort {
            reason: "unreadable change set".to_string(),
            failures,
        },
        _ => Verdict::from_failures(failures),
    };
    Some((id, verdict))
}

/// Facade for the agent
pub fn agent_message_to_json(m: &AgentMessage) -> Result<String> {
    serde_json::to_string(m).map_err(|e| e.into())
}

/// Facade for store implementations
pub fn store_message_to_json(m: &StoreMessage) -> Result<String> {
    serde_json::to_string(m).map_err(|e| e.into())
}

/// Facade for store implementations
pub fn agent_message_from_json(s: &str) -> Result<AgentMessage> {
    serde_json::from_str(s).map_err(|e| e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Change, Leaf, LeafValue};
    use serde_json::json;

    #[test]
    fn test_ids() {
        let mut ids = Ids::new();
        let id1: Id<MessageType> = ids.next();
        let id2: Id<MessageType> = ids.next();
        assert_ne!(id1, id2);
        assert_eq!(id1.num() + 1, id2.num());
    }

    #[test]
    fn test_transaction_wire_format() {
        let line = r#"{"Transaction":{"id":7,"changes":[{"leaf":"contact","operation":"modified","value":"test_contact"}]}}"#;
        let msg = store_message_from_json(line).unwrap();
        assert_eq!(
            msg,
            StoreMessage::Transaction {
                id: Id::new(7),
                changes: ChangeSet::new(vec![Change::modified(
                    Leaf::Contact,
                    LeafValue::Text("test_contact".to_string())
                )])
                .unwrap(),
            }
        );
    }

    #[test]
    fn test_transaction_with_duplicate_leaf_is_rejected() {
        let line = r#"{"Transaction":{"id":1,"changes":[{"leaf":"hostname","operation":"deleted"},{"leaf":"hostname","operation":"deleted"}]}}"#;
        assert!(store_message_from_json(line).is_err());
    }

    #[test]
    fn test_rejected_transaction_keeps_id_and_leaf() {
        let line = r#"{"Transaction":{"id":5,"changes":[{"leaf":"hostname","operation":"modified","value":5}]}}"#;
        assert!(store_message_from_json(line).is_err());
        let (id, verdict) = rejected_transaction_from_json(line).unwrap();
        assert_eq!(id, Id::new(5));
        assert_eq!(verdict.failures().len(), 1);
        assert_eq!(verdict.failures()[0].leaf, Leaf::Hostname);
        assert_eq!(
            verdict.failures()[0].failure.kind,
            crate::model::FailureKind::Validation
        );
    }

    #[test]
    fn test_rejected_transaction_duplicate_and_unknown_leaves() {
        let line = r#"{"Transaction":{"id":1,"changes":[{"leaf":"contact","operation":"deleted"},{"leaf":"contact","operation":"deleted"}]}}"#;
        let (_, verdict) = rejected_transaction_from_json(line).unwrap();
        assert_eq!(verdict.failures()[0].leaf, Leaf::Contact);

        let line = r#"{"Transaction":{"id":2,"changes":[{"leaf":"timezone-name","operation":"deleted"}]}}"#;
        let (id, verdict) = rejected_transaction_from_json(line).unwrap();
        assert_eq!(id, Id::new(2));
        assert!(!verdict.is_accept());
        assert!(verdict.failures().is_empty());

        assert_eq!(rejected_transaction_from_json(r#"{"GetLeaf":[1,"nope"]}"#), None);
        assert_eq!(rejected_transaction_from_json("not json"), None);
    }

    #[test]
    fn test_verdict_wire_format() {
        let msg = AgentMessage::Verdict {
            transaction: Id::new(3),
            verdict: Verdict::Accept,
        };
        let value: serde_json::Value =
            serde_json::from_str(&agent_message_to_json(&msg).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"Verdict": {"transaction": 3, "verdict": {"verdict": "accept"}}})
        );
    }

    #[test]
    fn test_rpc_wire_format() {
        let msg = store_message_from_json(
            r#"{"Rpc":[4,{"set-current-datetime":"2021-02-09T06:02:39Z"}]}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            StoreMessage::Rpc(
                Id::new(4),
                Rpc::SetCurrentDatetime("2021-02-09T06:02:39Z".to_string())
            )
        );
        assert_eq!(
            store_message_from_json(r#""Shutdown""#).unwrap(),
            StoreMessage::Shutdown
        );
    }
}
