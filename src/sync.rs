//! Live state synchronizer: one realtime channel per logical stream,
//! reconciled into the canonical fleet snapshot.
//!
//! Envelopes arrive over either a WebSocket or an SSE channel (chosen by
//! [`TransportKind`]) and are merged strictly in arrival order. Transport
//! drops are recovered by an unconditional reconnect after a fixed delay;
//! only explicit teardown through [`SyncHandle`] stops the loop. Per-entity
//! log tails and terminal sessions are independently addressed streams using
//! the same query-parameter credential pattern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::api::response_error;
use crate::config::{ClientConfig, TransportKind};
use crate::error::{Error, Result};
use crate::models::{Container, ContainerStats, Host};
use crate::session::ACCESS_TOKEN_KEY;
use crate::storage::KeyValueStore;

/// Bidirectional socket for a container terminal session. The visual
/// terminal emulator is out of scope; callers drive this stream directly.
pub type TerminalStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Envelopes
// ============================================================================

/// A typed push message from the fleet event stream. Unknown kinds decode to
/// [`Envelope::Unknown`] so malformed input stays a typed, droppable case.
#[derive(Debug, Clone)]
pub enum Envelope {
    Containers(Vec<Container>),
    Hosts(Vec<Host>),
    Stats(Vec<ContainerStats>),
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    /// Two-stage tagged decode: outer `{type, data}` frame, then the payload
    /// for the recognized kinds.
    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Ok(match raw.kind.as_str() {
            "containers" => Envelope::Containers(serde_json::from_value(raw.data)?),
            "hosts" => Envelope::Hosts(serde_json::from_value(raw.data)?),
            "stats" => Envelope::Stats(serde_json::from_value(raw.data)?),
            _ => Envelope::Unknown { kind: raw.kind },
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            Envelope::Containers(_) => "containers",
            Envelope::Hosts(_) => "hosts",
            Envelope::Stats(_) => "stats",
            Envelope::Unknown { kind } => kind,
        }
    }
}

// ============================================================================
// Fleet snapshot
// ============================================================================

/// The canonical in-memory fleet state: three independent mappings keyed by
/// server-assigned ids. Mutated only by the synchronizer, read by everything
/// else.
#[derive(Debug, Default)]
pub struct FleetSnapshot {
    pub hosts: HashMap<String, Host>,
    pub containers: HashMap<String, Container>,
    pub stats: HashMap<String, ContainerStats>,
}

/// Single-writer, multi-reader sharing (the teacher pattern for shared app
/// state). Writes hold the lock for one whole envelope, so readers never see
/// a half-applied envelope.
pub type SharedSnapshot = Arc<RwLock<FleetSnapshot>>;

impl FleetSnapshot {
    /// Merge one envelope. `containers` and `hosts` envelopes replace their
    /// mapping wholesale; a `stats` envelope upserts per container id and
    /// never removes entries. Container disappearance is authoritative only
    /// via a `containers` envelope, at which point stats for ids no longer in
    /// the fleet are pruned as well.
    pub fn apply(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Containers(list) => {
                self.containers = list.into_iter().map(|c| (c.id.clone(), c)).collect();
                let containers = &self.containers;
                self.stats.retain(|id, _| containers.contains_key(id));
            }
            Envelope::Hosts(list) => {
                self.hosts = list.into_iter().map(|h| (h.id.clone(), h)).collect();
            }
            Envelope::Stats(list) => {
                for stats in list {
                    self.stats.insert(stats.id.clone(), stats);
                }
            }
            Envelope::Unknown { kind } => {
                debug!(kind, "ignored unknown envelope");
            }
        }
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

/// Handle for one live stream. [`SyncHandle::shutdown`] is the only way to
/// reach the clean-close terminal state; dropping the handle tears the
/// stream down too, so repeated connect/disconnect cycles cannot leak tasks.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Grace period between the shutdown signal and the abort fallback, for a
/// worker stuck mid-dial that cannot observe the signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

impl SyncHandle {
    /// Signal teardown and let the worker close its stream cleanly. The
    /// worker is aborted only if it has not wound down within the grace
    /// period.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let abort = self.task.abort_handle();
        tokio::spawn(async move {
            sleep(SHUTDOWN_GRACE).await;
            abort.abort();
        });
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct LiveSync {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    store: Arc<dyn KeyValueStore>,
    snapshot: SharedSnapshot,
    events: broadcast::Sender<Envelope>,
}

impl LiveSync {
    pub fn new(config: Arc<ClientConfig>, store: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            http: reqwest::Client::new(),
            config,
            store,
            snapshot: Arc::new(RwLock::new(FleetSnapshot::default())),
            events,
        }
    }

    /// Shared read handle onto the canonical snapshot.
    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    /// Subscribe to merged envelopes, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    /// Open the fleet event stream on the configured transport and keep it
    /// open: any error or unexpected close schedules a reconnect after the
    /// fixed delay, indefinitely, until the returned handle is shut down.
    pub fn connect(&self) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            http: self.http.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            snapshot: self.snapshot.clone(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(worker.run(shutdown_rx));
        SyncHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Resolve a stream endpoint with the access token as a query parameter.
    /// Neither transport can carry custom headers, so the short-lived access
    /// token rides the URL; refresh tokens never do.
    fn stream_url(&self, path: &str) -> Result<Url> {
        stream_url(&self.config, self.store.as_ref(), path)
    }

    pub fn log_stream_url(&self, host_id: &str, container_id: &str) -> Result<Url> {
        self.stream_url(&format!("logs/{host_id}/{container_id}/stream"))
    }

    pub fn terminal_url(&self, host_id: &str, container_id: &str) -> Result<Url> {
        Ok(to_ws(
            self.stream_url(&format!("ws/terminal/{host_id}/{container_id}"))?,
        ))
    }

    /// Tail one container's log stream. Lines arrive on the returned channel;
    /// the stream ends when the server closes it or the handle is shut down.
    pub fn tail_logs(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> Result<(mpsc::Receiver<String>, SyncHandle)> {
        let url = self.log_stream_url(host_id, container_id)?;
        let (tx, rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let http = self.http.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = run_log_tail(http, url, tx, &mut shutdown_rx).await {
                warn!(error = %e, "log stream ended");
            }
        });
        Ok((
            rx,
            SyncHandle {
                shutdown: shutdown_tx,
                task,
            },
        ))
    }

    /// Open the bidirectional terminal socket for one container.
    pub async fn connect_terminal(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> Result<TerminalStream> {
        let url = self.terminal_url(host_id, container_id)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(stream)
    }
}

fn stream_url(config: &ClientConfig, store: &dyn KeyValueStore, path: &str) -> Result<Url> {
    let mut url = config.endpoint(path)?;
    if let Some(token) = store.get(ACCESS_TOKEN_KEY) {
        url.query_pairs_mut().append_pair("token", &token);
    }
    Ok(url)
}

fn to_ws(mut url: Url) -> Url {
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    // http(s) and ws(s) are both "special" schemes, so this cannot fail
    let _ = url.set_scheme(scheme);
    url
}

struct Worker {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    store: Arc<dyn KeyValueStore>,
    snapshot: SharedSnapshot,
    events: broadcast::Sender<Envelope>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let result = match self.config.transport {
                TransportKind::WebSocket => self.run_websocket(&mut shutdown).await,
                TransportKind::Sse => self.run_sse(&mut shutdown).await,
            };
            match result {
                // Ok means teardown was requested: the clean-close state.
                Ok(()) => {
                    debug!("live sync torn down");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, delay = ?self.config.reconnect_delay, "fleet event stream dropped; reconnecting");
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("live sync torn down during backoff");
                        return;
                    }
                }
                _ = sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        stream_url(&self.config, self.store.as_ref(), path)
    }

    async fn run_websocket(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let url = to_ws(self.url("events")?);
        let (mut stream, _) = connect_async(url.as_str()).await?;
        info!("fleet event stream open (websocket)");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = stream.close(None).await;
                        return Ok(());
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_message(&text).await,
                    Some(Ok(Message::Close(_))) | None => return Err(Error::StreamClosed),
                    Some(Ok(_)) => {} // ping/pong/binary keep-alives
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    async fn run_sse(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let url = self.url("events")?;
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(response_error(resp).await);
        }
        info!("fleet event stream open (sse)");
        let mut body = resp.bytes_stream();
        let mut parser = SseParser::default();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for payload in parser.push(&bytes) {
                            self.handle_message(&payload).await;
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::StreamClosed),
                },
            }
        }
    }

    /// Merge one frame into the snapshot and fan it out to subscribers.
    /// Malformed or unrecognized frames are dropped with a diagnostic,
    /// never propagated as fatal.
    async fn handle_message(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(Envelope::Unknown { kind }) => {
                warn!(kind, "unrecognized envelope kind; dropped");
            }
            Ok(envelope) => {
                self.snapshot.write().await.apply(envelope.clone());
                let _ = self.events.send(envelope);
            }
            Err(e) => {
                warn!(error = %e, "malformed envelope; dropped");
            }
        }
    }
}

/// Incremental server-sent-events framing: `data:` lines accumulate until a
/// blank line terminates the event. Comments and other fields are ignored.
/// Buffering is byte-level so a multibyte character split across network
/// chunks survives intact; only complete lines are decoded.
#[derive(Default)]
struct SseParser {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }
        events
    }
}

/// Single-shot log tail over SSE; frames look like `{type:"log", data:"..."}`.
async fn run_log_tail(
    http: reqwest::Client,
    url: Url,
    tx: mpsc::Sender<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    #[derive(Deserialize)]
    struct LogFrame {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        data: String,
    }

    let resp = http.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(response_error(resp).await);
    }
    let mut body = resp.bytes_stream();
    let mut parser = SseParser::default();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    for payload in parser.push(&bytes) {
                        match serde_json::from_str::<LogFrame>(&payload) {
                            Ok(frame) if frame.kind == "log" => {
                                if tx.send(frame.data).await.is_err() {
                                    // receiver gone; nothing left to tail for
                                    return Ok(());
                                }
                            }
                            Ok(frame) => debug!(kind = frame.kind, "ignored log stream frame"),
                            Err(e) => warn!(error = %e, "malformed log frame; dropped"),
                        }
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}
