//! The agent's end of the store session: one JSON message per line, store
//! messages on the input and agent messages on the output.

use anyhow::{Context, Result};
use sysconf_core::{
    model::Verdict,
    store_api::{self, AgentMessage, Id, StoreMessage, TransactionType},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    sync::mpsc,
    task::JoinHandle,
};

/// What the store sent, as far as it could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(StoreMessage),
    /// A transaction whose changes could not be read. It is answered with
    /// the verdict, in turn with the other transactions.
    Rejected(Id<TransactionType>, Verdict),
}

pub struct SessionReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> SessionReader<R> {
    pub fn new(input: R) -> Self {
        SessionReader {
            lines: BufReader::new(input).lines(),
        }
    }

    /// The next store message, or `None` once the store closed the session.
    /// Blank lines and lines that are not store messages are skipped; only a
    /// failed read is an error.
    pub async fn next(&mut self) -> Result<Option<Inbound>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .context("reading from the store session")?;
            let line = match line {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => line,
            };
            match store_api::store_message_from_json(&line) {
                Ok(msg) => {
                    tracing::trace!(?msg, "received");
                    return Ok(Some(Inbound::Message(msg)));
                }
                Err(e) => match store_api::rejected_transaction_from_json(&line) {
                    Some((id, verdict)) => {
                        tracing::warn!(transaction = %id, "unreadable change set: {}", e);
                        return Ok(Some(Inbound::Rejected(id, verdict)));
                    }
                    None => tracing::warn!(?line, "skipping unreadable store message: {}", e),
                },
            }
        }
    }
}

/// Handle for sending agent messages. Cloned freely; all clones feed the
/// single writer task started by [`Outbox::start`].
#[derive(Clone)]
pub struct Outbox {
    sender: mpsc::Sender<AgentMessage>,
}

impl Outbox {
    const CAPACITY: usize = 64;

    /// Spawn the writer task. It ends, flushing everything sent so far, when
    /// the last `Outbox` clone is dropped.
    pub fn start<W>(output: W) -> (Outbox, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<AgentMessage>(Self::CAPACITY);
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(msg) = receiver.recv().await {
                tracing::trace!(?msg, "sending");
                let s = store_api::agent_message_to_json(&msg)?;
                output
                    .write_all(s.as_bytes())
                    .await
                    .context("writing to the store session")?;
                output
                    .write_all(b"\n")
                    .await
                    .context("writing to the store session")?;
                output
                    .flush()
                    .await
                    .context("flushing the store session")?;
            }
            output
                .shutdown()
                .await
                .context("closing the store session")?;
            Ok(())
        });
        (Outbox { sender }, writer)
    }

    pub async fn send(&self, msg: AgentMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("store session writer has stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysconf_core::model::Leaf;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn test_reader_parses_lines_and_skips_blanks() {
        let input: &[u8] = b"{\"Subscribed\":{\"session\":3}}\n\n\"Shutdown\"\n";
        let mut reader = SessionReader::new(input);
        assert_eq!(
            reader.next().await.unwrap(),
            Some(Inbound::Message(StoreMessage::Subscribed {
                session: Id::new(3)
            }))
        );
        assert_eq!(
            reader.next().await.unwrap(),
            Some(Inbound::Message(StoreMessage::Shutdown))
        );
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_skips_garbage() {
        let input: &[u8] = b"{\"NoSuchMessage\":1}\nnot json\n\"Shutdown\"\n";
        let mut reader = SessionReader::new(input);
        assert_eq!(
            reader.next().await.unwrap(),
            Some(Inbound::Message(StoreMessage::Shutdown))
        );
    }

    #[tokio::test]
    async fn test_reader_rejects_unreadable_transaction() {
        let input: &[u8] = br#"{"Transaction":{"id":9,"changes":[{"leaf":"ntp-enabled","operation":"modified","value":[]}]}}
"#;
        let mut reader = SessionReader::new(input);
        match reader.next().await.unwrap() {
            Some(Inbound::Rejected(id, verdict)) => {
                assert_eq!(id, Id::new(9));
                assert_eq!(verdict.failures()[0].leaf, Leaf::NtpEnabled);
            }
            other => panic!("expected a rejected transaction, got {:?}", other),
        }
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_outbox_writes_one_line_per_message() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (outbox, writer) = Outbox::start(ours);
        outbox.send(AgentMessage::Ready).await.unwrap();
        outbox
            .send(AgentMessage::ReadConfig(Id::new(1)))
            .await
            .unwrap();
        drop(outbox);
        writer.await.unwrap().unwrap();

        let mut out = String::new();
        theirs.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "\"Ready\"\n{\"ReadConfig\":1}\n");
    }
}
