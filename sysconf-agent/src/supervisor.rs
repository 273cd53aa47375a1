//! Agent lifecycle: subscribe, bring the OS in line with the stored
//! configuration, serve transactions and queries, and shut down cleanly.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use sysconf_core::{
    model::{ChangeSet, Leaf, SystemConfig, Verdict, MODULE},
    store_api::{
        AgentMessage, Id, Ids, MessageType, Rpc, SessionType, StoreMessage, TransactionType,
    },
};
use sysconf_os::{PowerAction, SystemOs};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinSet,
};
use tracing::Instrument as _;

use crate::{
    application::and_cleanup,
    engine::{Engine, Phase},
    handlers::Handlers,
    interrupt::InterruptState,
    session::{Inbound, Outbox, SessionReader},
};

/// Transactions the store may queue while one is being applied.
const QUEUE_DEPTH: usize = 16;

pub struct Supervisor {
    handlers: Arc<Handlers>,
    engine: Engine,
    interrupt: InterruptState,
}

enum Event {
    Message(Inbound),
    /// Interrupted, or the store asked us to go.
    Stop,
    Closed,
}

enum Ending {
    Shutdown,
    SessionLost(anyhow::Error),
}

enum Job {
    Apply(ChangeSet),
    /// Answer without touching the OS.
    Refuse(Verdict),
}

type Queued = (Id<TransactionType>, Job);

async fn next_event<R: AsyncRead + Unpin>(
    reader: &mut SessionReader<R>,
    interrupt: &InterruptState,
) -> Result<Event> {
    tokio::select! {
        biased;
        _ = interrupt.interrupted() => {
            tracing::info!("interrupted");
            Ok(Event::Stop)
        }
        msg = reader.next() => Ok(match msg? {
            Some(Inbound::Message(StoreMessage::Shutdown)) => {
                tracing::info!("store requested shutdown");
                Event::Stop
            }
            Some(msg) => Event::Message(msg),
            None => Event::Closed,
        }),
    }
}

impl Supervisor {
    pub fn new(handlers: Arc<Handlers>, engine: Engine, interrupt: InterruptState) -> Self {
        Supervisor {
            handlers,
            engine,
            interrupt,
        }
    }

    /// Run one session with the store until shutdown. Returns an error if
    /// the session was lost.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, writer) = Outbox::start(output);
        let mut reader = SessionReader::new(input);
        let result = self.run_session(&mut reader, outbox).await;
        let writer_result = writer.await.context("joining the session writer")?;
        and_cleanup(result, writer_result)
    }

    async fn run_session<R: AsyncRead + Unpin>(
        self,
        reader: &mut SessionReader<R>,
        outbox: Outbox,
    ) -> Result<()> {
        let Supervisor {
            handlers,
            mut engine,
            interrupt,
        } = self;
        // Messages that arrived while waiting for a specific answer
        let mut pending = VecDeque::new();
        let mut ids = Ids::new();

        outbox
            .send(AgentMessage::Subscribe {
                module: MODULE.to_string(),
                paths: Leaf::ALL.iter().map(|l| l.path().to_string()).collect(),
            })
            .await?;
        let session: Id<SessionType> = loop {
            match next_event(reader, &interrupt).await? {
                Event::Message(Inbound::Message(StoreMessage::Subscribed { session })) => {
                    break session
                }
                Event::Message(msg) => pending.push_back(msg),
                Event::Stop => return Ok(()),
                Event::Closed => bail!("store closed the session before subscribing"),
            }
        };
        tracing::info!(%session, "subscribed to {}", MODULE);

        let config_id: Id<MessageType> = ids.next();
        outbox.send(AgentMessage::ReadConfig(config_id)).await?;
        let config: SystemConfig = loop {
            match next_event(reader, &interrupt).await? {
                Event::Message(Inbound::Message(StoreMessage::Config(id, config)))
                    if id == config_id =>
                {
                    break config
                }
                Event::Message(msg) => pending.push_back(msg),
                Event::Stop => {
                    return outbox.send(AgentMessage::Unsubscribe { session }).await;
                }
                Event::Closed => {
                    bail!("store closed the session before sending the configuration")
                }
            }
        };

        if config.is_empty() {
            let h = handlers.clone();
            let snapshot = tokio::task::spawn_blocking(move || h.snapshot_config())
                .await
                .context("reading the OS state")?;
            tracing::info!("store has no configuration, seeding it from the OS");
            outbox.send(AgentMessage::SeedConfig(snapshot)).await?;
        } else {
            let changes = ChangeSet::from_config(&config);
            let span = tracing::info_span!("initial configuration");
            let (e, verdict) = tokio::task::spawn_blocking(move || {
                let verdict = span.in_scope(|| engine.process(&changes));
                (engine, verdict)
            })
            .await
            .context("applying the initial configuration")?;
            engine = e;
            if !verdict.is_accept() {
                tracing::warn!(
                    "initial configuration was not fully applied; waiting for the next change"
                );
            }
        }

        let draining = Arc::new(AtomicBool::new(false));
        let (queue, queue_rx) = mpsc::channel::<Queued>(QUEUE_DEPTH);
        let worker = tokio::spawn(run_worker(engine, queue_rx, outbox.clone(), draining.clone()));
        let mut queries: JoinSet<Result<()>> = JoinSet::new();
        // From here on every exit goes through the drain below
        let ending = match outbox.send(AgentMessage::Ready).await {
            Ok(()) => {
                tracing::info!("ready");
                let mut serving = Serving {
                    reader,
                    interrupt: &interrupt,
                    handlers: &handlers,
                    outbox: &outbox,
                    queue: &queue,
                    queries: &mut queries,
                };
                serving.serve(pending).await
            }
            Err(e) => Ending::SessionLost(e),
        };

        // Drain: the running transaction completes, queued ones are refused
        draining.store(true, Ordering::SeqCst);
        drop(queue);
        let mut cleanup = worker.await.context("joining the engine worker")?;
        while let Some(r) = queries.join_next().await {
            cleanup = and_cleanup(cleanup, r.context("joining a query").and_then(|r| r));
        }

        match ending {
            Ending::Shutdown => {
                cleanup?;
                outbox.send(AgentMessage::Unsubscribe { session }).await?;
                tracing::info!(%session, "unsubscribed");
                Ok(())
            }
            Ending::SessionLost(e) => {
                and_cleanup(Err(e.context("lost the store session")), cleanup)
            }
        }
    }
}

/// The main loop, between `Ready` and the drain.
struct Serving<'a, R> {
    reader: &'a mut SessionReader<R>,
    interrupt: &'a InterruptState,
    handlers: &'a Arc<Handlers>,
    outbox: &'a Outbox,
    queue: &'a mpsc::Sender<Queued>,
    queries: &'a mut JoinSet<Result<()>>,
}

impl<R: AsyncRead + Unpin> Serving<'_, R> {
    async fn serve(&mut self, mut pending: VecDeque<Inbound>) -> Ending {
        loop {
            let msg = match pending.pop_front() {
                Some(msg) => msg,
                None => match next_event(&mut *self.reader, self.interrupt).await {
                    Ok(Event::Message(msg)) => msg,
                    Ok(Event::Stop) => return Ending::Shutdown,
                    Ok(Event::Closed) => {
                        return Ending::SessionLost(anyhow::anyhow!("store closed the session"))
                    }
                    Err(e) => return Ending::SessionLost(e),
                },
            };
            let handled = match msg {
                Inbound::Message(StoreMessage::Shutdown) => return Ending::Shutdown,
                Inbound::Message(msg) => self.handle(msg).await,
                Inbound::Rejected(id, verdict) => self.enqueue(id, Job::Refuse(verdict)).await,
            };
            if let Err(e) = handled {
                return Ending::SessionLost(e);
            }
            while let Some(r) = self.queries.try_join_next() {
                if let Err(e) = r.context("joining a query").and_then(|r| r) {
                    return Ending::SessionLost(e);
                }
            }
        }
    }

    async fn enqueue(&self, id: Id<TransactionType>, job: Job) -> Result<()> {
        self.queue
            .send((id, job))
            .await
            .map_err(|_| anyhow::anyhow!("engine worker has stopped"))
    }

    async fn handle(&mut self, msg: StoreMessage) -> Result<()> {
        let h = self.handlers.clone();
        match msg {
            StoreMessage::Transaction { id, changes } => {
                tracing::debug!(transaction = %id, leaves = changes.len(), "queued");
                return self.enqueue(id, Job::Apply(changes)).await;
            }
            StoreMessage::GetConfigState(id) => {
                spawn_query(&mut *self.queries, self.outbox, move || {
                    AgentMessage::ConfigState(id, h.read_state())
                });
            }
            StoreMessage::GetLeaf(id, leaf) => {
                spawn_query(&mut *self.queries, self.outbox, move || {
                    AgentMessage::LeafState(id, leaf, h.read(leaf))
                });
            }
            StoreMessage::GetSystemState(id) => {
                spawn_query(&mut *self.queries, self.outbox, move || system_state(h.os(), id));
            }
            StoreMessage::Rpc(id, rpc) => {
                spawn_query(&mut *self.queries, self.outbox, move || {
                    match perform_rpc(h.os(), &rpc) {
                        Ok(()) => AgentMessage::RpcDone(id),
                        Err(e) => AgentMessage::Error(id, e),
                    }
                });
            }
            msg @ (StoreMessage::Subscribed { .. }
            | StoreMessage::Config(..)
            | StoreMessage::Shutdown) => {
                tracing::warn!(?msg, "ignoring unexpected store message");
            }
        }
        Ok(())
    }
}

/// Process queued transactions one at a time until the queue is closed.
async fn run_worker(
    mut engine: Engine,
    mut queue: mpsc::Receiver<Queued>,
    outbox: Outbox,
    draining: Arc<AtomicBool>,
) -> Result<()> {
    while let Some((id, job)) = queue.recv().await {
        let verdict = match job {
            _ if draining.load(Ordering::SeqCst) => {
                tracing::info!(transaction = %id, "refusing transaction during shutdown");
                Verdict::shutting_down()
            }
            Job::Refuse(verdict) => verdict,
            Job::Apply(changes) => {
                let span = tracing::info_span!("transaction", id = %id);
                let (e, verdict) = tokio::task::spawn_blocking(move || {
                    let verdict = span.in_scope(|| engine.process(&changes));
                    (engine, verdict)
                })
                .instrument(tracing::debug_span!("waiting for engine", id = %id))
                .await
                .context("running the engine")?;
                engine = e;
                debug_assert_eq!(engine.phase(), Phase::Idle);
                verdict
            }
        };
        outbox
            .send(AgentMessage::Verdict {
                transaction: id,
                verdict,
            })
            .await?;
    }
    Ok(())
}

/// Answer a query off the async executor, since it reads from the OS.
fn spawn_query(
    queries: &mut JoinSet<Result<()>>,
    outbox: &Outbox,
    query: impl FnOnce() -> AgentMessage + Send + 'static,
) {
    let outbox = outbox.clone();
    queries.spawn(async move {
        let msg = tokio::task::spawn_blocking(query)
            .await
            .context("running a query")?;
        outbox.send(msg).await
    });
}

fn system_state(os: &dyn SystemOs, id: Id<MessageType>) -> AgentMessage {
    match os.platform().and_then(|p| os.clock().map(|c| (p, c))) {
        Ok((platform, clock)) => AgentMessage::SystemState(id, platform, clock),
        Err(e) => AgentMessage::Error(id, e.to_string()),
    }
}

fn perform_rpc(os: &dyn SystemOs, rpc: &Rpc) -> Result<(), String> {
    tracing::info!(?rpc, "performing operation");
    let r = match rpc {
        Rpc::SetCurrentDatetime(s) => {
            let datetime = DateTime::parse_from_rfc3339(s)
                .map_err(|e| format!("invalid date and time {:?}: {}", s, e))?;
            os.set_current_datetime(datetime)
        }
        Rpc::SystemRestart => os.power(PowerAction::Restart),
        Rpc::SystemShutdown => os.power(PowerAction::Shutdown),
    };
    r.map_err(|e| {
        tracing::warn!(?rpc, "operation failed: {}", e);
        e.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::RetryPolicy, handlers::HandlerConfig};
    use std::time::Duration;
    use sysconf_core::{
        model::{Change, FailureKind, LeafValue},
        store_api::{agent_message_from_json, store_message_to_json},
    };
    use sysconf_os::{MemoryOs, OsCall, OsError, OsOperation};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines},
        task::JoinHandle,
    };

    const SESSION: u64 = 42;

    struct TestStore {
        to_agent: DuplexStream,
        from_agent: Lines<BufReader<DuplexStream>>,
        ids: Ids,
    }

    impl TestStore {
        async fn send(&mut self, msg: StoreMessage) {
            let s = store_message_to_json(&msg).unwrap();
            self.to_agent.write_all(s.as_bytes()).await.unwrap();
            self.to_agent.write_all(b"\n").await.unwrap();
        }

        async fn send_line(&mut self, line: &str) {
            self.to_agent.write_all(line.as_bytes()).await.unwrap();
            self.to_agent.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Option<AgentMessage> {
            let line = tokio::time::timeout(Duration::from_secs(10), self.from_agent.next_line())
                .await
                .expect("agent did not answer in time")
                .unwrap()?;
            Some(agent_message_from_json(&line).unwrap())
        }

        async fn expect(&mut self) -> AgentMessage {
            self.recv().await.expect("agent closed the session")
        }

        async fn transaction(&mut self, changes: Vec<Change>) -> Id<TransactionType> {
            let id = self.ids.next();
            self.send(StoreMessage::Transaction {
                id,
                changes: ChangeSet::new(changes).unwrap(),
            })
            .await;
            id
        }

        async fn verdict(&mut self, id: Id<TransactionType>) -> Verdict {
            match self.expect().await {
                AgentMessage::Verdict {
                    transaction,
                    verdict,
                } if transaction == id => verdict,
                other => panic!("expected verdict for {}, got {:?}", id, other),
            }
        }
    }

    struct Agent {
        os: Arc<MemoryOs>,
        store: TestStore,
        interrupt: InterruptState,
        task: JoinHandle<Result<()>>,
    }

    fn spawn_agent(os: Arc<MemoryOs>, retry: RetryPolicy) -> Agent {
        let handlers = Arc::new(Handlers::new(os.clone(), HandlerConfig::default()));
        let engine = Engine::new(handlers.clone(), retry);
        let interrupt = InterruptState::new();
        let supervisor = Supervisor::new(handlers, engine, interrupt.clone());
        let (agent_in, to_agent) = tokio::io::duplex(4096);
        let (agent_out, from_agent) = tokio::io::duplex(4096);
        let task = tokio::spawn(supervisor.run(agent_in, agent_out));
        Agent {
            os,
            store: TestStore {
                to_agent,
                from_agent: BufReader::new(from_agent).lines(),
                ids: Ids::new(),
            },
            interrupt,
            task,
        }
    }

    /// Perform the startup exchange, answering `ReadConfig` with `config`.
    /// Returns the seed the agent sent, if any.
    async fn start_with(agent: &mut Agent, config: SystemConfig) -> Option<SystemConfig> {
        let store = &mut agent.store;
        match store.expect().await {
            AgentMessage::Subscribe { module, paths } => {
                assert_eq!(module, "ietf-system");
                assert!(paths.contains(&"/ietf-system:system/ntp/enabled".to_string()));
            }
            other => panic!("expected Subscribe, got {:?}", other),
        }
        store
            .send(StoreMessage::Subscribed {
                session: Id::new(SESSION),
            })
            .await;
        let id = match store.expect().await {
            AgentMessage::ReadConfig(id) => id,
            other => panic!("expected ReadConfig, got {:?}", other),
        };
        store.send(StoreMessage::Config(id, config)).await;
        let mut seed = None;
        loop {
            match store.expect().await {
                AgentMessage::SeedConfig(config) => seed = Some(config),
                AgentMessage::Ready => return seed,
                other => panic!("expected Ready, got {:?}", other),
            }
        }
    }

    async fn started(os: Arc<MemoryOs>) -> Agent {
        let mut agent = spawn_agent(os, RetryPolicy::default());
        start_with(&mut agent, SystemConfig::default()).await;
        agent
    }

    async fn shut_down(mut agent: Agent) {
        agent.store.send(StoreMessage::Shutdown).await;
        match agent.store.expect().await {
            AgentMessage::Unsubscribe { session } => assert_eq!(session.num(), SESSION),
            other => panic!("expected Unsubscribe, got {:?}", other),
        }
        assert_eq!(agent.store.recv().await, None);
        agent.task.await.unwrap().unwrap();
    }

    fn text(s: &str) -> LeafValue {
        LeafValue::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_empty_store_is_seeded_from_os() {
        let os = Arc::new(MemoryOs::new());
        os.set_initial_hostname("seed-host");
        let mut agent = spawn_agent(os, RetryPolicy::default());
        let seed = start_with(&mut agent, SystemConfig::default())
            .await
            .expect("agent should seed an empty store");
        assert_eq!(seed.hostname.as_deref(), Some("seed-host"));
        assert_eq!(seed.ntp_enabled, Some(false));
        // Seeding does not write to the OS
        assert!(agent.os.calls().is_empty());
        shut_down(agent).await;
    }

    #[tokio::test]
    async fn test_stored_config_applied_at_startup() {
        let os = Arc::new(MemoryOs::new());
        let mut agent = spawn_agent(os, RetryPolicy::default());
        let config = SystemConfig {
            hostname: Some("from-store".to_string()),
            contact: Some("ops".to_string()),
            ..SystemConfig::default()
        };
        assert_eq!(start_with(&mut agent, config).await, None);
        assert_eq!(agent.os.current_hostname(), "from-store");
        assert_eq!(agent.os.current_identity(), "ops");
        shut_down(agent).await;
    }

    #[tokio::test]
    async fn test_failed_initial_apply_is_not_fatal() {
        let os = Arc::new(MemoryOs::new());
        os.set_service_manager(false);
        let mut agent = spawn_agent(os, RetryPolicy::default());
        let config = SystemConfig {
            ntp_enabled: Some(true),
            ..SystemConfig::default()
        };
        assert_eq!(start_with(&mut agent, config).await, None);
        shut_down(agent).await;
    }

    #[tokio::test]
    async fn test_transaction_then_read() {
        let mut agent = started(Arc::new(MemoryOs::new())).await;
        let store = &mut agent.store;

        let t = store
            .transaction(vec![Change::modified(Leaf::Contact, text("test_contact"))])
            .await;
        assert_eq!(store.verdict(t).await, Verdict::Accept);

        store.send(StoreMessage::GetLeaf(Id::new(10), Leaf::Contact)).await;
        assert_eq!(
            store.expect().await,
            AgentMessage::LeafState(Id::new(10), Leaf::Contact, text("test_contact"))
        );

        let t = store
            .transaction(vec![Change::modified(Leaf::NtpEnabled, LeafValue::Bool(true))])
            .await;
        assert_eq!(store.verdict(t).await, Verdict::Accept);

        store.send(StoreMessage::GetConfigState(Id::new(11))).await;
        match store.expect().await {
            AgentMessage::ConfigState(id, state) => {
                assert_eq!(id, Id::new(11));
                assert_eq!(state.contact, "test_contact");
                assert!(state.ntp_enabled);
            }
            other => panic!("expected ConfigState, got {:?}", other),
        }
        shut_down(agent).await;
    }

    #[tokio::test]
    async fn test_invalid_transaction_aborts_without_os_calls() {
        let mut agent = started(Arc::new(MemoryOs::new())).await;
        let t = agent
            .store
            .transaction(vec![
                Change::modified(Leaf::Hostname, text("ok")),
                Change::modified(Leaf::Location, text("fine")),
                Change::modified(Leaf::Contact, text("no:colons")),
            ])
            .await;
        let verdict = agent.store.verdict(t).await;
        assert_eq!(verdict.failures().len(), 1);
        assert_eq!(verdict.failures()[0].failure.kind, FailureKind::Validation);
        assert!(agent.os.calls().is_empty());
        shut_down(agent).await;
    }

    #[tokio::test]
    async fn test_unreadable_transaction_is_aborted() {
        let mut agent = started(Arc::new(MemoryOs::new())).await;
        let store = &mut agent.store;

        let line = r#"{"Transaction":{"id":5,"changes":[{"leaf":"hostname","operation":"modified","value":5}]}}"#;
        store.send_line(line).await;
        let verdict = store.verdict(Id::new(5)).await;
        assert!(!verdict.is_accept());
        assert_eq!(verdict.failures()[0].leaf, Leaf::Hostname);
        assert_eq!(verdict.failures()[0].failure.kind, FailureKind::Validation);

        let line = r#"{"Transaction":{"id":6,"changes":[{"leaf":"contact","operation":"deleted"},{"leaf":"contact","operation":"deleted"}]}}"#;
        store.send_line(line).await;
        assert!(!store.verdict(Id::new(6)).await.is_accept());

        // Lines that are not messages at all are skipped
        store.send_line(r#"{"NoSuchMessage":1}"#).await;
        store.send(StoreMessage::GetLeaf(Id::new(7), Leaf::Contact)).await;
        assert_eq!(
            store.expect().await,
            AgentMessage::LeafState(Id::new(7), Leaf::Contact, text(""))
        );
        assert!(agent.os.calls().is_empty());
        shut_down(agent).await;
    }

    #[tokio::test]
    async fn test_system_state_and_rpcs() {
        let mut agent = started(Arc::new(MemoryOs::new())).await;
        let store = &mut agent.store;

        store.send(StoreMessage::GetSystemState(Id::new(1))).await;
        match store.expect().await {
            AgentMessage::SystemState(id, platform, clock) => {
                assert_eq!(id, Id::new(1));
                assert_eq!(platform.os_name, "Linux");
                assert!(!clock.boot_datetime.is_empty());
            }
            other => panic!("expected SystemState, got {:?}", other),
        }

        store
            .send(StoreMessage::Rpc(
                Id::new(2),
                Rpc::SetCurrentDatetime("2021-02-09T06:02:39Z".to_string()),
            ))
            .await;
        assert_eq!(store.expect().await, AgentMessage::RpcDone(Id::new(2)));

        store
            .send(StoreMessage::Rpc(
                Id::new(3),
                Rpc::SetCurrentDatetime("yesterday".to_string()),
            ))
            .await;
        match store.expect().await {
            AgentMessage::Error(id, msg) => {
                assert_eq!(id, Id::new(3));
                assert!(msg.contains("yesterday"));
            }
            other => panic!("expected Error, got {:?}", other),
        }

        store.send(StoreMessage::Rpc(Id::new(4), Rpc::SystemRestart)).await;
        assert_eq!(store.expect().await, AgentMessage::RpcDone(Id::new(4)));
        assert!(agent.os.calls().contains(&OsCall::Power(PowerAction::Restart)));
        shut_down(agent).await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_queued_transactions() {
        let os = Arc::new(MemoryOs::new());
        // The first attempt fails transiently, which keeps the first
        // transaction busy in the retry delay
        os.fail(OsOperation::SetHostname, 1, || {
            OsError::io("setting hostname", std::io::Error::other("busy"))
        });
        let mut agent = spawn_agent(
            os,
            RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(300),
            },
        );
        start_with(&mut agent, SystemConfig::default()).await;

        let first = agent
            .store
            .transaction(vec![Change::modified(Leaf::Hostname, text("in-flight"))])
            .await;
        while agent.os.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = agent
            .store
            .transaction(vec![Change::modified(Leaf::Contact, text("queued"))])
            .await;
        agent.store.send(StoreMessage::Shutdown).await;

        assert_eq!(agent.store.verdict(first).await, Verdict::Accept);
        assert_eq!(agent.store.verdict(second).await, Verdict::shutting_down());
        assert!(matches!(
            agent.store.expect().await,
            AgentMessage::Unsubscribe { .. }
        ));
        agent.task.await.unwrap().unwrap();
        assert_eq!(agent.os.current_hostname(), "in-flight");
        assert_eq!(agent.os.current_identity(), "");
    }

    #[tokio::test]
    async fn test_interrupt_unsubscribes() {
        let mut agent = started(Arc::new(MemoryOs::new())).await;
        agent.interrupt.set_interrupted();
        assert!(matches!(
            agent.store.expect().await,
            AgentMessage::Unsubscribe { .. }
        ));
        agent.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_loss_is_fatal() {
        let agent = started(Arc::new(MemoryOs::new())).await;
        let Agent {
            store: TestStore {
                to_agent,
                mut from_agent,
                ..
            },
            task,
            ..
        } = agent;
        drop(to_agent);
        let e = task.await.unwrap().unwrap_err();
        assert!(format!("{:#}", e).contains("lost the store session"));
        // No unsubscribe on a dead session
        assert_eq!(from_agent.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lost_output_waits_for_running_transaction() {
        let os = Arc::new(MemoryOs::new());
        os.fail(OsOperation::SetHostname, 1, || {
            OsError::io("setting hostname", std::io::Error::other("busy"))
        });
        let mut agent = spawn_agent(
            os,
            RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(300),
            },
        );
        start_with(&mut agent, SystemConfig::default()).await;
        agent
            .store
            .transaction(vec![Change::modified(Leaf::Hostname, text("in-flight"))])
            .await;
        while agent.os.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let Agent {
            os,
            store: TestStore {
                mut to_agent,
                from_agent,
                ..
            },
            task,
            ..
        } = agent;
        // The store stops reading, so answers to these queries cannot be written
        drop(from_agent);
        for n in 0..3 {
            let line = store_message_to_json(&StoreMessage::GetLeaf(Id::new(n), Leaf::Contact))
                .unwrap();
            to_agent.write_all(line.as_bytes()).await.unwrap();
            to_agent.write_all(b"\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        drop(to_agent);
        let e = task.await.unwrap().unwrap_err();
        assert!(format!("{:#}", e).contains("lost the store session"));
        // The transaction finished before the agent returned
        assert_eq!(os.current_hostname(), "in-flight");
    }
}
