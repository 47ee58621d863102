//! Event stream consumer.
//!
//! Two tasks cooperate here. The connection task owns the WebSocket to the
//! signal producer: it authenticates, subscribes to the configured channel,
//! reconnects on a linear backoff, and forwards raw payloads into a bounded
//! queue. The worker task drains that queue one message at a time and fully
//! awaits the pipeline for each, so at most one order submission is ever in
//! flight.
//!
//! The connection is reconfigurable while the process runs. A reconfigure
//! command compares the new target against the current one and does the
//! least disruptive thing: nothing for an identical target, an
//! unsubscribe/subscribe pair for a channel-only change, and a full
//! connect-then-swap otherwise. The swap is all-or-nothing: if the new
//! connection cannot be established the old one keeps running and the
//! caller gets the error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::pipeline::{Pipeline, Processed};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Queue depth between the connection task and the worker.
const QUEUE_DEPTH: usize = 256;

/// Keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Backoff cap for reconnect attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Where the event stream lives and how to join it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub token: String,
}

impl StreamTarget {
    fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle state, exposed through the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Subscribed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Disconnected => write!(f, "disconnected"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// What a reconfigure request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureOutcome {
    /// The new target is identical to the current one.
    NoOp,
    /// Only the channel changed; resubscribed on the live socket.
    Resubscribed,
    /// A new connection was established and swapped in.
    Reconnected,
    /// We were offline; the target was replaced for the next attempt.
    Deferred,
}

/// Errors from a reconfigure request.
#[derive(Debug, Error)]
pub enum ReconfigureError {
    /// The new target could not be connected; the old connection survives.
    #[error("reconfigure failed, keeping current connection: {0}")]
    ConnectFailed(String),

    /// The consumer has already shut down.
    #[error("consumer is not running")]
    NotRunning,
}

/// Plan for applying a new target to a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconfigurePlan {
    NoOp,
    Resubscribe,
    Reconnect,
}

fn reconfigure_plan(current: &StreamTarget, next: &StreamTarget) -> ReconfigurePlan {
    if current == next {
        ReconfigurePlan::NoOp
    } else if current.host == next.host
        && current.port == next.port
        && current.token == next.token
    {
        ReconfigurePlan::Resubscribe
    } else {
        ReconfigurePlan::Reconnect
    }
}

/// Linear backoff, capped.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(u64::from(attempt) * 1000).min(MAX_BACKOFF)
}

enum Command {
    Reconfigure {
        target: StreamTarget,
        reply: oneshot::Sender<Result<ReconfigureOutcome, ReconfigureError>>,
    },
}

/// Counters and state shared with the status reporter.
struct Shared {
    received: AtomicU64,
    processed_ok: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
    state: RwLock<ConnState>,
    target: RwLock<StreamTarget>,
    last_signal: RwLock<Option<String>>,
}

impl Shared {
    fn new(target: StreamTarget) -> Self {
        Self {
            received: AtomicU64::new(0),
            processed_ok: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            state: RwLock::new(ConnState::Disconnected),
            target: RwLock::new(target),
            last_signal: RwLock::new(None),
        }
    }

    fn set_state(&self, state: ConnState) {
        *self.state.write().unwrap() = state;
    }

    fn set_target(&self, target: &StreamTarget) {
        *self.target.write().unwrap() = target.clone();
    }
}

/// Snapshot of consumer counters for the status report.
#[derive(Debug, Clone)]
pub struct ConsumerStats {
    pub received: u64,
    pub processed_ok: u64,
    pub stale: u64,
    pub failed: u64,
    pub state: ConnState,
    pub target: StreamTarget,
    pub last_signal: Option<String>,
}

/// Handle to the running consumer tasks.
pub struct EventConsumer {
    injector: mpsc::Sender<String>,
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
    connection: JoinHandle<()>,
}

impl EventConsumer {
    /// Spawn the connection and worker tasks.
    pub fn spawn(
        target: StreamTarget,
        pipeline: Pipeline,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(QUEUE_DEPTH);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let shared = Arc::new(Shared::new(target.clone()));

        let worker = tokio::spawn(run_worker(
            pipeline,
            raw_rx,
            shared.clone(),
            shutdown_tx.subscribe(),
        ));
        let connection = tokio::spawn(run_connection(
            target,
            raw_tx.clone(),
            cmd_rx,
            shared.clone(),
            shutdown_tx.subscribe(),
        ));

        Self {
            injector: raw_tx,
            cmd_tx,
            shared,
            worker,
            connection,
        }
    }

    /// A sender that feeds raw payloads straight into the worker queue,
    /// bypassing the socket. Replay tooling and tests use this.
    pub fn injector(&self) -> mpsc::Sender<String> {
        self.injector.clone()
    }

    /// Swap the connection target at runtime.
    pub async fn reconfigure(
        &self,
        target: StreamTarget,
    ) -> Result<ReconfigureOutcome, ReconfigureError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reconfigure { target, reply })
            .await
            .map_err(|_| ReconfigureError::NotRunning)?;
        rx.await.map_err(|_| ReconfigureError::NotRunning)?
    }

    /// Snapshot of counters and connection state.
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.shared.received.load(Ordering::Relaxed),
            processed_ok: self.shared.processed_ok.load(Ordering::Relaxed),
            stale: self.shared.stale.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            state: *self.shared.state.read().unwrap(),
            target: self.shared.target.read().unwrap().clone(),
            last_signal: self.shared.last_signal.read().unwrap().clone(),
        }
    }

    /// Wait for both tasks to finish after shutdown was signalled.
    pub async fn join(self) {
        let _ = self.connection.await;
        let _ = self.worker.await;
    }
}

/// Drain the queue one message at a time. The pipeline call is awaited to
/// completion before the next dequeue, and shutdown is only observed
/// between messages, never mid-flight.
async fn run_worker(
    pipeline: Pipeline,
    mut raw_rx: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let raw = tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
            _ = shutdown.recv() => {
                info!("Worker: shutdown, stopping after current message");
                break;
            }
        };

        shared.received.fetch_add(1, Ordering::Relaxed);
        match pipeline.process(&raw).await {
            Ok(processed) => {
                if let Some(summary) = processed.signal_summary() {
                    *shared.last_signal.write().unwrap() = Some(summary.to_string());
                }
                match processed {
                    Processed::Stale { .. } => {
                        shared.stale.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        shared.processed_ok.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stage = e.stage(),
                    error = %e,
                    payload = %truncate(&raw, 256),
                    "Message rejected"
                );
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Own the socket for the lifetime of the process: connect, run a session,
/// back off on failure, apply reconfigurations, stop on shutdown.
async fn run_connection(
    mut target: StreamTarget,
    raw_tx: mpsc::Sender<String>,
    mut cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(ConnState::Connecting);
        let (mut write, mut read) = match establish(&target).await {
            Ok(ws) => ws.split(),
            Err(e) => {
                shared.set_state(ConnState::Disconnected);
                attempt += 1;
                let delay = backoff_delay(attempt);
                warn!(
                    url = %target.url(),
                    attempt,
                    "Connection failed: {}, retrying in {:?}",
                    e, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        info!("Connection: shutdown during backoff");
                        return;
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(Command::Reconfigure { target: next, reply }) => {
                                info!(url = %next.url(), channel = %next.channel, "Offline reconfigure, replacing target");
                                target = next;
                                shared.set_target(&target);
                                attempt = 0;
                                let _ = reply.send(Ok(ReconfigureOutcome::Deferred));
                            }
                            None => return,
                        }
                    }
                }
                continue;
            }
        };
        shared.set_state(ConnState::Subscribed);
        info!(url = %target.url(), channel = %target.channel, "Subscribed to event stream");
        attempt = 0;

        // One session per established socket; a reconnect-style reconfigure
        // swaps the socket without leaving this inner loop.
        let end = loop {
            match run_session(
                &mut write,
                &mut read,
                &mut target,
                &raw_tx,
                &mut cmd_rx,
                &mut shutdown,
                &shared,
            )
            .await
            {
                Ok(SessionEnd::Shutdown) => break SessionEnd::Shutdown,
                Ok(SessionEnd::Lost) => break SessionEnd::Lost,
                Ok(SessionEnd::Swapped(new_ws)) => {
                    let (new_write, new_read) = new_ws.split();
                    write = new_write;
                    read = new_read;
                    info!(url = %target.url(), channel = %target.channel, "Reconnected to new target");
                }
                Err(e) => {
                    shared.set_state(ConnState::Disconnected);
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!("Session ended: {}, reconnecting in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            info!("Connection: shutdown during backoff");
                            return;
                        }
                    }
                    break SessionEnd::Lost;
                }
            }
        };

        match end {
            SessionEnd::Shutdown => {
                shared.set_state(ConnState::Disconnected);
                info!("Connection: shutdown");
                return;
            }
            SessionEnd::Lost => continue,
            SessionEnd::Swapped(_) => unreachable!("swap is handled inside the session loop"),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Swapped(WsStream),
    Lost,
}

/// Connect, authenticate, and subscribe. Any failure leaves no socket.
async fn establish(target: &StreamTarget) -> anyhow::Result<WsStream> {
    let (mut ws, _) = connect_async(target.url()).await?;

    let auth = json!({ "type": "auth", "token": target.token });
    ws.send(Message::Text(auth.to_string())).await?;

    let subscribe = json!({ "type": "subscribe", "channel": target.channel });
    ws.send(Message::Text(subscribe.to_string())).await?;

    Ok(ws)
}

async fn run_session(
    write: &mut WsWrite,
    read: &mut WsRead,
    target: &mut StreamTarget,
    raw_tx: &mpsc::Sender<String>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    shutdown: &mut broadcast::Receiver<()>,
    shared: &Shared,
) -> anyhow::Result<SessionEnd> {
    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ping_timer.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(bytes = text.len(), "Stream payload");
                        if raw_tx.send(text).await.is_err() {
                            // Worker gone, we are shutting down.
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        anyhow::bail!("server closed the stream: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => anyhow::bail!("stream ended"),
                }
            }
            _ = ping_timer.tick() => {
                write.send(Message::Ping(vec![])).await?;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Reconfigure { target: next, reply }) => {
                        match apply_reconfigure(write, target, next).await {
                            Ok(ApplyResult::Done(outcome)) => {
                                shared.set_target(target);
                                let _ = reply.send(Ok(outcome));
                            }
                            Ok(ApplyResult::Swap(new_ws)) => {
                                shared.set_target(target);
                                let _ = reply.send(Ok(ReconfigureOutcome::Reconnected));
                                return Ok(SessionEnd::Swapped(new_ws));
                            }
                            Err(e) => {
                                warn!("Reconfigure failed, keeping current connection: {}", e);
                                let _ = reply.send(Err(ReconfigureError::ConnectFailed(e.to_string())));
                            }
                        }
                    }
                    None => return Ok(SessionEnd::Shutdown),
                }
            }
            _ = shutdown.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

enum ApplyResult {
    Done(ReconfigureOutcome),
    Swap(WsStream),
}

/// Apply a new target to a live connection. On any failure the current
/// socket and target are left untouched.
async fn apply_reconfigure(
    write: &mut WsWrite,
    target: &mut StreamTarget,
    next: StreamTarget,
) -> anyhow::Result<ApplyResult> {
    match reconfigure_plan(target, &next) {
        ReconfigurePlan::NoOp => {
            debug!("Reconfigure target identical to current, nothing to do");
            Ok(ApplyResult::Done(ReconfigureOutcome::NoOp))
        }
        ReconfigurePlan::Resubscribe => {
            let unsubscribe = json!({ "type": "unsubscribe", "channel": target.channel });
            write.send(Message::Text(unsubscribe.to_string())).await?;
            let subscribe = json!({ "type": "subscribe", "channel": next.channel });
            write.send(Message::Text(subscribe.to_string())).await?;
            info!(old = %target.channel, new = %next.channel, "Resubscribed channel");
            *target = next;
            Ok(ApplyResult::Done(ReconfigureOutcome::Resubscribed))
        }
        ReconfigurePlan::Reconnect => {
            // Bring up the replacement fully before dropping the old socket.
            let new_ws = establish(&next).await?;
            *target = next;
            Ok(ApplyResult::Swap(new_ws))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, port: u16, channel: &str, token: &str) -> StreamTarget {
        StreamTarget {
            host: host.to_string(),
            port,
            channel: channel.to_string(),
            token: token.to_string(),
        }
    }

    #[test]
    fn test_reconfigure_plan_noop() {
        let a = target("feed.example.com", 9443, "signals", "tok");
        assert_eq!(reconfigure_plan(&a, &a.clone()), ReconfigurePlan::NoOp);
    }

    #[test]
    fn test_reconfigure_plan_channel_only() {
        let a = target("feed.example.com", 9443, "signals", "tok");
        let b = target("feed.example.com", 9443, "signals-v2", "tok");
        assert_eq!(reconfigure_plan(&a, &b), ReconfigurePlan::Resubscribe);
    }

    #[test]
    fn test_reconfigure_plan_full() {
        let a = target("feed.example.com", 9443, "signals", "tok");
        for next in [
            target("other.example.com", 9443, "signals", "tok"),
            target("feed.example.com", 9444, "signals", "tok"),
            target("feed.example.com", 9443, "signals", "tok2"),
            target("other.example.com", 9444, "signals-v2", "tok2"),
        ] {
            assert_eq!(reconfigure_plan(&a, &next), ReconfigurePlan::Reconnect);
        }
    }

    #[test]
    fn test_backoff_delay_linear_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(3));
        assert_eq!(backoff_delay(10), Duration::from_secs(10));
        assert_eq!(backoff_delay(50), Duration::from_secs(10));
    }

    #[test]
    fn test_target_url() {
        let t = target("feed.example.com", 9443, "signals", "tok");
        assert_eq!(t.url(), "ws://feed.example.com:9443");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
