//! Drive a sysconf agent by playing the configuration store's side of the
//! session. Used for testing agents and for poking at a host by hand.

use anyhow::{bail, Context, Result};
use sysconf_core::{
    model::{
        ChangeSet, ClockState, Leaf, LeafValue, PlatformState, SystemConfig, SystemState, Verdict,
    },
    store_api::{
        self, AgentMessage, Id, Ids, MessageType, Rpc, SessionType, StoreMessage,
        TransactionType,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
};

pub struct AgentConfig {
    pub agent_executable: String,
    pub agent_args: Vec<String>,
}

/// The store's end of an established session.
pub struct AgentClient<W, R> {
    to_agent: W,
    from_agent: Lines<BufReader<R>>,
    ids: Ids,
    session: Id<SessionType>,
    seeded: Option<SystemConfig>,
}

/// Start an agent process and open a session with it.
///
/// The agent's stderr is inherited, so its logs show up alongside ours.
pub async fn spawn_agent(
    config: &AgentConfig,
    initial: SystemConfig,
) -> Result<(Child, AgentClient<ChildStdin, ChildStdout>)> {
    let mut child = Command::new(&config.agent_executable)
        .args(&config.agent_args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Could not spawn agent process {}", config.agent_executable))?;
    let stdin = child.stdin.take().context("agent stdin was not captured")?;
    let stdout = child
        .stdout
        .take()
        .context("agent stdout was not captured")?;
    let client = AgentClient::open(stdin, stdout, initial).await?;
    Ok((child, client))
}

impl<W, R> AgentClient<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    /// Perform the startup exchange: accept the agent's subscription and
    /// answer its configuration read with `initial`. Returns once the agent
    /// is ready for transactions.
    pub async fn open(to_agent: W, from_agent: R, initial: SystemConfig) -> Result<Self> {
        let mut ids = Ids::new();
        let mut client = AgentClient {
            to_agent,
            from_agent: BufReader::new(from_agent).lines(),
            session: ids.next(),
            ids,
            seeded: None,
        };
        match client.recv().await? {
            AgentMessage::Subscribe { module, paths } => {
                tracing::debug!(%module, ?paths, "agent subscribed");
            }
            other => bail!("expected the agent to subscribe, got {:?}", other),
        }
        client
            .send(&StoreMessage::Subscribed {
                session: client.session,
            })
            .await?;
        loop {
            match client.recv().await? {
                AgentMessage::ReadConfig(id) => {
                    client
                        .send(&StoreMessage::Config(id, initial.clone()))
                        .await?
                }
                AgentMessage::SeedConfig(config) => client.seeded = Some(config),
                AgentMessage::Ready => break,
                other => bail!("unexpected message during agent startup: {:?}", other),
            }
        }
        Ok(client)
    }

    /// The configuration the agent proposed because the initial one was empty.
    pub fn seeded(&self) -> Option<&SystemConfig> {
        self.seeded.as_ref()
    }

    async fn send(&mut self, msg: &StoreMessage) -> Result<()> {
        let s = store_api::store_message_to_json(msg)?;
        self.to_agent
            .write_all(s.as_bytes())
            .await
            .context("writing to the agent")?;
        self.to_agent
            .write_all(b"\n")
            .await
            .context("writing to the agent")?;
        self.to_agent
            .flush()
            .await
            .context("flushing the agent session")?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<AgentMessage> {
        loop {
            let line = self
                .from_agent
                .next_line()
                .await
                .context("reading from the agent")?;
            match line {
                None => bail!("agent closed its stdout"),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    return store_api::agent_message_from_json(&line)
                        .with_context(|| format!("parsing agent message {:?}", line))
                }
            }
        }
    }

    /// Receive until `select` picks a message, failing on an error for `id`.
    async fn reply<T>(
        &mut self,
        id: Id<MessageType>,
        select: impl Fn(AgentMessage) -> Option<T>,
    ) -> Result<T> {
        loop {
            match self.recv().await? {
                AgentMessage::Error(error_id, e) if error_id == id => bail!("agent: {}", e),
                msg => {
                    if let Some(r) = select(msg) {
                        return Ok(r);
                    }
                }
            }
        }
    }

    /// Submit a transaction and wait for its verdict.
    pub async fn apply(&mut self, changes: ChangeSet) -> Result<Verdict> {
        let id: Id<TransactionType> = self.ids.next();
        self.send(&StoreMessage::Transaction { id, changes }).await?;
        loop {
            match self.recv().await? {
                AgentMessage::Verdict {
                    transaction,
                    verdict,
                } if transaction == id => return Ok(verdict),
                other => tracing::debug!(?other, "ignoring agent message"),
            }
        }
    }

    pub async fn config_state(&mut self) -> Result<SystemState> {
        let id = self.ids.next();
        self.send(&StoreMessage::GetConfigState(id)).await?;
        self.reply(id, |msg| match msg {
            AgentMessage::ConfigState(reply, state) if reply == id => Some(state),
            _ => None,
        })
        .await
    }

    pub async fn leaf(&mut self, leaf: Leaf) -> Result<LeafValue> {
        let id = self.ids.next();
        self.send(&StoreMessage::GetLeaf(id, leaf)).await?;
        self.reply(id, |msg| match msg {
            AgentMessage::LeafState(reply, _, value) if reply == id => Some(value),
            _ => None,
        })
        .await
    }

    pub async fn system_state(&mut self) -> Result<(PlatformState, ClockState)> {
        let id = self.ids.next();
        self.send(&StoreMessage::GetSystemState(id)).await?;
        self.reply(id, |msg| match msg {
            AgentMessage::SystemState(reply, platform, clock) if reply == id => {
                Some((platform, clock))
            }
            _ => None,
        })
        .await
    }

    pub async fn rpc(&mut self, rpc: Rpc) -> Result<()> {
        let id = self.ids.next();
        self.send(&StoreMessage::Rpc(id, rpc)).await?;
        self.reply(id, |msg| match msg {
            AgentMessage::RpcDone(reply) if reply == id => Some(()),
            _ => None,
        })
        .await
    }

    /// Ask the agent to shut down and wait for it to release the session.
    pub async fn close(mut self) -> Result<()> {
        self.send(&StoreMessage::Shutdown).await?;
        loop {
            match self.recv().await? {
                AgentMessage::Unsubscribe { session } if session == self.session => {
                    return Ok(())
                }
                other => tracing::debug!(?other, "ignoring agent message during shutdown"),
            }
        }
    }
}
