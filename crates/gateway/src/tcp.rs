//! JSON-lines link to an external flight-controller bridge.
//!
//! Each request is one JSON object per line carrying a sequence number; the
//! bridge answers with one line echoing it, in any order. Requests run
//! concurrently: a writer task owns the socket's write half and a reader task
//! owns the read half, handing each answer to the request waiting on its
//! sequence number. Answers to requests abandoned by a gateway timeout find
//! no waiter and are skipped.

use aerotask_core::TelemetrySnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::FlightCommand;
use crate::error::LinkError;
use crate::link::FlightLink;

/// Request line sent to the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequest {
    /// Sequence number echoed in the response
    pub seq: u64,
    /// Operation
    #[serde(flatten)]
    pub op: LinkOp,
}

/// Operation carried by a request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LinkOp {
    /// Execute a flight command
    Command {
        /// Command to execute
        command: FlightCommand,
    },
    /// Report vehicle state
    Query,
}

/// Response line returned by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkResponse {
    /// Sequence number of the request answered
    pub seq: u64,
    /// Request succeeded
    pub ok: bool,
    /// State, present on successful queries
    #[serde(default)]
    pub state: Option<TelemetrySnapshot>,
    /// Failure description
    #[serde(default)]
    pub error: Option<String>,
    /// Failure is worth retrying
    #[serde(default)]
    pub retry: bool,
}

#[derive(Default)]
struct Waiters {
    pending: HashMap<u64, oneshot::Sender<LinkResponse>>,
    closed: bool,
}

type SharedWaiters = Arc<Mutex<Waiters>>;

fn close(waiters: &SharedWaiters) {
    let mut waiters = waiters.lock().unwrap_or_else(PoisonError::into_inner);
    waiters.closed = true;
    // Dropping the senders fails every outstanding request with `Closed`
    waiters.pending.clear();
}

/// One open connection to the bridge
struct Session {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    waiters: SharedWaiters,
    tasks: [JoinHandle<()>; 2],
}

impl Session {
    async fn open(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let waiters = SharedWaiters::default();
        let (outbox, lines) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_responses(addr.to_string(), read, waiters.clone()));
        let writer = tokio::spawn(write_requests(addr.to_string(), write, lines, waiters.clone()));
        Ok(Self {
            outbox,
            waiters,
            tasks: [reader, writer],
        })
    }

    fn is_closed(&self) -> bool {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// Register interest in the answer to `seq`
    fn wait_for(&self, seq: u64) -> Result<(Waiting<'_>, oneshot::Receiver<LinkResponse>), LinkError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if waiters.closed {
            return Err(LinkError::Closed);
        }
        waiters.pending.insert(seq, tx);
        Ok((
            Waiting {
                waiters: &self.waiters,
                seq,
            },
            rx,
        ))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Removes an abandoned request's waiter
struct Waiting<'a> {
    waiters: &'a SharedWaiters,
    seq: u64,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(&self.seq);
    }
}

async fn write_requests(
    addr: String,
    mut write: OwnedWriteHalf,
    mut lines: mpsc::UnboundedReceiver<Vec<u8>>,
    waiters: SharedWaiters,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = write.write_all(&line).await {
            warn!(addr = %addr, error = %e, "tcp flight link write failed");
            close(&waiters);
            return;
        }
    }
}

async fn read_responses(addr: String, read: OwnedReadHalf, waiters: SharedWaiters) {
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!(addr = %addr, "tcp flight link closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(addr = %addr, error = %e, "tcp flight link read failed");
                break;
            }
        }

        let response = match serde_json::from_slice::<LinkResponse>(&buf) {
            Ok(response) => response,
            Err(e) => match malformed_seq(&buf) {
                // Fail the request it answers so the gateway can retry
                Some(seq) => LinkResponse {
                    seq,
                    ok: false,
                    state: None,
                    error: Some(format!("malformed response: {e}")),
                    retry: true,
                },
                None => {
                    warn!(addr = %addr, error = %e, "skipping unparseable response line");
                    continue;
                }
            },
        };

        let waiter = waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(&response.seq);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(addr = %addr, stale = response.seq, "skipping stale response"),
        }
    }
    close(&waiters);
}

fn malformed_seq(line: &[u8]) -> Option<u64> {
    serde_json::from_slice::<serde_json::Value>(line)
        .ok()?
        .get("seq")?
        .as_u64()
}

/// TCP JSON-lines flight link
pub struct TcpLink {
    addr: String,
    seq: AtomicU64,
    session: RwLock<Option<Arc<Session>>>,
}

impl TcpLink {
    /// Connect to a bridge at `addr`
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let session = Session::open(addr).await?;
        debug!(addr, "tcp flight link connected");
        Ok(Self {
            addr: addr.to_string(),
            seq: AtomicU64::new(1),
            session: RwLock::new(Some(Arc::new(session))),
        })
    }

    /// Link to `addr` that is not open yet; requests fail with
    /// [`LinkError::Closed`] until [`FlightLink::reconnect`] succeeds
    pub fn detached(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            seq: AtomicU64::new(1),
            session: RwLock::new(None),
        }
    }

    fn session(&self) -> Result<Arc<Session>, LinkError> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|session| !session.is_closed())
            .ok_or(LinkError::Closed)
    }

    async fn request(&self, op: LinkOp) -> Result<LinkResponse, LinkError> {
        let session = self.session()?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&LinkRequest { seq, op })
            .map_err(|e| LinkError::Rejected(e.to_string()))?;
        line.push(b'\n');

        let (_waiting, answer) = session.wait_for(seq)?;
        session.outbox.send(line).map_err(|_| LinkError::Closed)?;
        let response = answer.await.map_err(|_| LinkError::Closed)?;

        if response.ok {
            return Ok(response);
        }
        let reason = response.error.unwrap_or_else(|| "unspecified".into());
        Err(if response.retry {
            LinkError::Transient(reason)
        } else {
            LinkError::Rejected(reason)
        })
    }
}

#[async_trait]
impl FlightLink for TcpLink {
    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn send(&self, command: &FlightCommand) -> Result<(), LinkError> {
        self.request(LinkOp::Command {
            command: command.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn query_state(&self) -> Result<TelemetrySnapshot, LinkError> {
        let response = self.request(LinkOp::Query).await?;
        response
            .state
            .ok_or_else(|| LinkError::Transient("query response without state".into()))
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        let session = Session::open(&self.addr)
            .await
            .map_err(|e| LinkError::Transient(e.to_string()))?;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(session));
        debug!(addr = %self.addr, "tcp flight link reopened");
        Ok(())
    }
}
