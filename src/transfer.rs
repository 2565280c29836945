//! Outbound transfer coordinator.
//!
//! Each download runs as its own task driving a small state machine:
//!
//! ```text
//! Pending ──session up / TRANSFER_START──► InProgress ──COMPLETE──► Completed
//!    │                                         │
//!    │ resolve/validation failure              │ connection lost, retries left
//!    ▼                                         ▼
//!  Failed ◄──non-retryable / retries spent── Pending (next attempt)
//!
//!  Pending | InProgress ──caller cancel──► Cancelled
//! ```
//!
//! Terminal states never transition again. Session-level failures retry
//! with exponential backoff (1 s, 2 s, 4 s by default), re-resolving the
//! peer and discarding any partial temp file before each new attempt.
//! Bytes land in a temp sibling of the destination and are renamed into
//! place only after a fully verified byte count, so no partial file is ever
//! left at the destination.
//!
//! Observers get consistent snapshots: a `watch` of the whole table and a
//! per-transfer event stream that terminates on the terminal state. The
//! last 100 terminal transfers stay visible in a FIFO.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Identity;
use crate::discovery::PeerCache;
use crate::error::{code_for_io, code_is_retryable, ErrorCode, ShareError, ShareResult};
use crate::protocol::{CancelTransfer, Message, TransferAck, TransferRequest, CHUNK_SIZE};
use crate::session::{client_handshake, now_millis, Session};

/// How many terminal transfers stay visible to observers.
const TERMINAL_CACHE: usize = 100;

/// Window for the moving-average throughput estimate.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Minimum spacing between progress snapshots for one transfer.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

// ────────────────────────────────────────────────────────────────────────────
// Public data model
// ────────────────────────────────────────────────────────────────────────────

/// Input to start a download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub peer_device_id: String,
    pub file_id: String,
    /// Absolute path the finished file ends up at.
    pub destination_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Pending,
    InProgress {
        bytes: u64,
        total: u64,
        rate_bps: u64,
    },
    Completed {
        path: PathBuf,
        checksum: Option<String>,
    },
    Failed {
        code: String,
        message: String,
    },
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed { .. } | TransferState::Failed { .. } | TransferState::Cancelled
        )
    }
}

/// One active or terminal transfer, as observed by consumers.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub transfer_id: String,
    pub peer_device_id: String,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    /// Milliseconds since the UNIX epoch.
    pub started_at: u64,
    pub state: TransferState,
}

/// Backoff schedule for session-level failures: `max_attempts` connects in
/// total, doubling the delay between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based; the first attempt has no
    /// delay): base, 2×base, 4×base, …
    fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        self.base_delay * 2u32.pow(exponent)
    }
}

/// Monotonic time source; swappable so rate math is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rate meter
// ────────────────────────────────────────────────────────────────────────────

/// Moving-average throughput over the last [`RATE_WINDOW`].
struct RateMeter {
    clock: Arc<dyn Clock>,
    samples: VecDeque<(Instant, u64)>,
}

impl RateMeter {
    fn new(clock: Arc<dyn Clock>) -> Self {
        RateMeter {
            clock,
            samples: VecDeque::new(),
        }
    }

    /// Record the cumulative byte count and return the current estimate in
    /// bytes per second.
    fn record(&mut self, total_bytes: u64) -> u64 {
        let now = self.clock.now();
        self.samples.push_back((now, total_bytes));
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some(&(t, _)) if now.duration_since(t) > RATE_WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        let Some(&(start, base)) = self.samples.front() else {
            return 0;
        };
        let elapsed = now.duration_since(start);
        if elapsed.is_zero() {
            return 0;
        }
        (total_bytes.saturating_sub(base) as f64 / elapsed.as_secs_f64()) as u64
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Coordinator
// ────────────────────────────────────────────────────────────────────────────

struct ActiveTransfer {
    transfer: Transfer,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TransferTable {
    active: HashMap<String, ActiveTransfer>,
    terminal: VecDeque<Transfer>,
}

impl TransferTable {
    fn push_terminal(&mut self, transfer: Transfer) {
        self.terminal.push_back(transfer);
        while self.terminal.len() > TERMINAL_CACHE {
            self.terminal.pop_front();
        }
    }

    fn snapshot(&self) -> Vec<Transfer> {
        let mut all: Vec<Transfer> = self.active.values().map(|a| a.transfer.clone()).collect();
        all.sort_by_key(|t| t.started_at);
        all.extend(self.terminal.iter().cloned());
        all
    }
}

struct CoordinatorInner {
    identity: Identity,
    peers: PeerCache,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    table: Mutex<TransferTable>,
    events: broadcast::Sender<Transfer>,
    snapshot: watch::Sender<Vec<Transfer>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TransferCoordinator {
    pub fn new(
        identity: Identity,
        peers: PeerCache,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> TransferCoordinator {
        let (events, _) = broadcast::channel(256);
        let (snapshot, _) = watch::channel(Vec::new());
        TransferCoordinator {
            inner: Arc::new(CoordinatorInner {
                identity,
                peers,
                policy,
                clock: Arc::new(SystemClock),
                table: Mutex::new(TransferTable::default()),
                events,
                snapshot,
                cancel,
            }),
        }
    }

    /// Validate the request, record a `Pending` transfer, and spawn its
    /// task. Malformed input is rejected here, before any I/O.
    pub fn start_download(&self, request: DownloadRequest) -> ShareResult<String> {
        validate_request(&request)?;

        let transfer_id = Uuid::new_v4().to_string();
        let token = self.inner.cancel.child_token();
        let transfer = Transfer {
            transfer_id: transfer_id.clone(),
            peer_device_id: request.peer_device_id.clone(),
            file_id: request.file_id.clone(),
            file_name: String::new(),
            file_size: 0,
            bytes_transferred: 0,
            started_at: now_millis(),
            state: TransferState::Pending,
        };

        self.inner.table.lock().active.insert(
            transfer_id.clone(),
            ActiveTransfer {
                transfer: transfer.clone(),
                cancel: token.clone(),
            },
        );
        self.publish(transfer);

        let coordinator = self.clone();
        let id = transfer_id.clone();
        tokio::spawn(async move {
            coordinator.run_transfer(request, id, token).await;
        });

        Ok(transfer_id)
    }

    /// Move the transfer to `Cancelled`, abort its session, and suppress
    /// any further retries. A no-op on unknown or already-terminal ids.
    pub fn cancel_transfer(&self, transfer_id: &str) {
        let cancelled = {
            let mut table = self.inner.table.lock();
            match table.active.remove(transfer_id) {
                Some(mut entry) => {
                    entry.transfer.state = TransferState::Cancelled;
                    let snapshot = entry.transfer.clone();
                    table.push_terminal(entry.transfer);
                    entry.cancel.cancel();
                    Some(snapshot)
                }
                None => None,
            }
        };
        if let Some(snapshot) = cancelled {
            info!("transfer {} cancelled", snapshot.transfer_id);
            self.publish(snapshot);
        }
    }

    /// Cancel everything still active. Used on node shutdown.
    pub fn shutdown(&self) {
        let active: Vec<String> = self.inner.table.lock().active.keys().cloned().collect();
        for id in active {
            self.cancel_transfer(&id);
        }
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Option<Transfer> {
        let table = self.inner.table.lock();
        table
            .active
            .get(transfer_id)
            .map(|a| a.transfer.clone())
            .or_else(|| {
                table
                    .terminal
                    .iter()
                    .find(|t| t.transfer_id == transfer_id)
                    .cloned()
            })
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.table.lock().snapshot()
    }

    /// Restartable stream of whole-table snapshots.
    pub fn observe_transfers(&self) -> WatchStream<Vec<Transfer>> {
        WatchStream::new(self.inner.snapshot.subscribe())
    }

    /// Snapshots for one transfer, ending with its terminal state. Empty
    /// for ids the coordinator has never seen.
    pub fn observe_transfer(&self, transfer_id: &str) -> impl Stream<Item = Transfer> + Send {
        struct ObserveState {
            rx: broadcast::Receiver<Transfer>,
            pending: Option<Transfer>,
            transfer_id: String,
            done: bool,
        }

        let rx = self.inner.events.subscribe();
        let pending = self.get_transfer(transfer_id);
        let state = ObserveState {
            done: pending.is_none(),
            rx,
            pending,
            transfer_id: transfer_id.to_string(),
        };

        futures_util::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if let Some(t) = st.pending.take() {
                st.done = t.state.is_terminal();
                return Some((t, st));
            }
            loop {
                match st.rx.recv().await {
                    Ok(t) if t.transfer_id == st.transfer_id => {
                        st.done = t.state.is_terminal();
                        return Some((t, st));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn publish(&self, snapshot: Transfer) {
        let _ = self.inner.events.send(snapshot);
        let all = self.inner.table.lock().snapshot();
        self.inner.snapshot.send_replace(all);
    }

    /// Mutate a still-active transfer and broadcast the new snapshot.
    /// Returns `None` when the transfer is gone or already terminal, which
    /// callers treat as a concurrent cancellation.
    fn update_transfer(
        &self,
        transfer_id: &str,
        mutate: impl FnOnce(&mut Transfer),
    ) -> Option<Transfer> {
        let updated = {
            let mut table = self.inner.table.lock();
            match table.active.get_mut(transfer_id) {
                Some(entry) if !entry.transfer.state.is_terminal() => {
                    mutate(&mut entry.transfer);
                    Some(entry.transfer.clone())
                }
                _ => None,
            }
        };
        if let Some(snapshot) = updated.clone() {
            self.publish(snapshot);
        }
        updated
    }

    /// Move an active transfer into a terminal state. A no-op when the
    /// transfer was already cancelled out from under the task.
    fn finish(&self, transfer_id: &str, state: TransferState) {
        let finished = {
            let mut table = self.inner.table.lock();
            match table.active.remove(transfer_id) {
                Some(mut entry) => {
                    entry.transfer.state = state;
                    let snapshot = entry.transfer.clone();
                    table.push_terminal(entry.transfer);
                    Some(snapshot)
                }
                None => None,
            }
        };
        if let Some(snapshot) = finished {
            self.publish(snapshot);
        }
    }

    /// Attempt loop with exponential backoff. Every attempt re-resolves the
    /// peer and starts from a fresh session.
    async fn run_transfer(
        &self,
        request: DownloadRequest,
        transfer_id: String,
        token: CancellationToken,
    ) {
        let mut attempt: u32 = 1;
        loop {
            match self.attempt_download(&request, &transfer_id, &token).await {
                Ok(path) => {
                    info!("transfer {} completed: {}", transfer_id, path.display());
                    self.finish(
                        &transfer_id,
                        TransferState::Completed {
                            path,
                            checksum: None,
                        },
                    );
                    return;
                }
                Err(AttemptError::Cancelled) => {
                    debug!("transfer {} task stopped after cancel", transfer_id);
                    return;
                }
                Err(AttemptError::Fatal { code, message }) => {
                    warn!("transfer {} failed ({}): {}", transfer_id, code, message);
                    self.finish(&transfer_id, TransferState::Failed { code, message });
                    return;
                }
                Err(AttemptError::Retryable { code, message }) => {
                    if attempt >= self.inner.policy.max_attempts {
                        warn!(
                            "transfer {} failed after {} attempts ({}): {}",
                            transfer_id, attempt, code, message
                        );
                        self.finish(&transfer_id, TransferState::Failed { code, message });
                        return;
                    }

                    attempt += 1;
                    let delay = self.inner.policy.delay_before(attempt);
                    info!(
                        "transfer {} attempt {} of {} in {:?} ({})",
                        transfer_id, attempt, self.inner.policy.max_attempts, delay, message
                    );
                    if self
                        .update_transfer(&transfer_id, |t| {
                            t.state = TransferState::Pending;
                            t.bytes_transferred = 0;
                        })
                        .is_none()
                    {
                        return;
                    }
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One full download attempt: resolve, connect, handshake, request,
    /// receive into a temp file, confirm, rename into place.
    async fn attempt_download(
        &self,
        request: &DownloadRequest,
        transfer_id: &str,
        token: &CancellationToken,
    ) -> Result<PathBuf, AttemptError> {
        // Resolve the peer fresh on every attempt.
        let peer = match self.inner.peers.get(&request.peer_device_id) {
            Some(peer) => peer,
            None => {
                return Err(AttemptError::Fatal {
                    code: ErrorCode::PeerUnknown.as_str().to_string(),
                    message: format!("peer {} is not in the discovery cache", request.peer_device_id),
                })
            }
        };
        if !peer.online {
            return Err(AttemptError::Fatal {
                code: ErrorCode::PeerOffline.as_str().to_string(),
                message: format!("peer {} is offline", request.peer_device_id),
            });
        }

        let addr = format!("{}:{}", peer.address, peer.port);
        let mut session = cancellable(token, Session::connect(&addr)).await?;

        let handshake = cancellable(
            token,
            client_handshake_owned(&mut session, &self.inner.identity),
        )
        .await;
        if let Err(e) = handshake {
            abort_or_close(&mut session, transfer_id, &e).await;
            return Err(e);
        }

        if let Err(e) = session
            .send(&Message::TransferRequest(TransferRequest {
                file_id: request.file_id.clone(),
                transfer_id: transfer_id.to_string(),
            }))
            .await
        {
            session.close().await;
            return Err(classify(e));
        }

        // Wait for the server to announce the stream.
        let start = loop {
            match cancellable(token, session.recv()).await {
                Ok(Message::TransferStart(start)) => break start,
                Ok(Message::TransferProgress(_)) => continue,
                Ok(Message::TransferError(e)) => {
                    session.close().await;
                    return Err(classify(ShareError::Remote {
                        code: e.error_code,
                        message: e.message,
                    }));
                }
                Ok(other) => {
                    session.close().await;
                    return Err(classify(ShareError::UnexpectedMessage {
                        expected: "TRANSFER_START",
                        got: other.type_tag().to_string(),
                    }));
                }
                Err(e) => {
                    abort_or_close(&mut session, transfer_id, &e).await;
                    return Err(e);
                }
            }
        };

        if self
            .update_transfer(transfer_id, |t| {
                t.file_name = start.file_name.clone();
                t.file_size = start.file_size;
                t.bytes_transferred = 0;
                t.state = TransferState::InProgress {
                    bytes: 0,
                    total: start.file_size,
                    rate_bps: 0,
                };
            })
            .is_none()
        {
            abort_session(&mut session, transfer_id).await;
            return Err(AttemptError::Cancelled);
        }

        // Receive the bulk bytes into a temp sibling of the destination.
        let destination = request.destination_path.clone();
        if let Some(parent) = destination.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                session.close().await;
                return Err(fatal_io(&e, "creating destination directory"));
            }
        }
        let label = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let temp_path = destination.with_file_name(format!(".{}.{}.part", label, transfer_id));

        let mut file = match tokio::fs::File::create(&temp_path).await {
            Ok(f) => f,
            Err(e) => {
                session.close().await;
                return Err(fatal_io(&e, "creating temp file"));
            }
        };

        let mut meter = RateMeter::new(self.inner.clock.clone());
        let mut received: u64 = 0;
        let mut last_emit: Option<Instant> = None;
        let mut buf = vec![0u8; CHUNK_SIZE as usize];

        while received < start.file_size {
            let want = (start.file_size - received).min(buf.len() as u64) as usize;

            let n = tokio::select! {
                _ = token.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    abort_session(&mut session, transfer_id).await;
                    return Err(AttemptError::Cancelled);
                }
                read = session.recv_bytes(&mut buf[..want]) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        drop(file);
                        let _ = tokio::fs::remove_file(&temp_path).await;
                        session.close().await;
                        return Err(classify(e));
                    }
                }
            };

            if let Err(e) = file.write_all(&buf[..n]).await {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                session.close().await;
                return Err(fatal_io(&e, "writing temp file"));
            }
            received += n as u64;

            let rate = meter.record(received);
            let due = last_emit
                .map_or(true, |t| self.inner.clock.now().duration_since(t) >= PROGRESS_INTERVAL)
                || received == start.file_size;
            if due {
                last_emit = Some(self.inner.clock.now());
                if self
                    .update_transfer(transfer_id, |t| {
                        t.bytes_transferred = received;
                        t.state = TransferState::InProgress {
                            bytes: received,
                            total: start.file_size,
                            rate_bps: rate,
                        };
                    })
                    .is_none()
                {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    abort_session(&mut session, transfer_id).await;
                    return Err(AttemptError::Cancelled);
                }
            }
        }

        // The server confirms; acknowledge and seal the file.
        loop {
            match cancellable(token, session.recv()).await {
                Ok(Message::TransferComplete(_)) => break,
                Ok(Message::TransferProgress(_)) => continue,
                Ok(Message::TransferError(e)) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    session.close().await;
                    return Err(classify(ShareError::Remote {
                        code: e.error_code,
                        message: e.message,
                    }));
                }
                Ok(other) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    session.close().await;
                    return Err(classify(ShareError::UnexpectedMessage {
                        expected: "TRANSFER_COMPLETE",
                        got: other.type_tag().to_string(),
                    }));
                }
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    abort_or_close(&mut session, transfer_id, &e).await;
                    return Err(e);
                }
            }
        }

        let _ = session
            .send(&Message::TransferAck(TransferAck {
                transfer_id: transfer_id.to_string(),
                status: "completed".to_string(),
            }))
            .await;

        if let Err(e) = file.sync_all().await {
            drop(file);
            let _ = tokio::fs::remove_file(&temp_path).await;
            session.close().await;
            return Err(fatal_io(&e, "syncing temp file"));
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp_path, &destination).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            session.close().await;
            return Err(fatal_io(&e, "moving file into place"));
        }

        session.close().await;
        Ok(destination)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Attempt plumbing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum AttemptError {
    Cancelled,
    Fatal { code: String, message: String },
    Retryable { code: String, message: String },
}

fn classify(err: ShareError) -> AttemptError {
    match err {
        ShareError::Cancelled => AttemptError::Cancelled,
        ShareError::ConnectionLost(message) => AttemptError::Retryable {
            code: ErrorCode::ConnectionLost.as_str().to_string(),
            message,
        },
        ShareError::PeerClosed => AttemptError::Retryable {
            code: ErrorCode::ConnectionLost.as_str().to_string(),
            message: "peer closed the stream".to_string(),
        },
        ShareError::Remote { code, message } => {
            if code_is_retryable(&code) {
                AttemptError::Retryable { code, message }
            } else {
                AttemptError::Fatal { code, message }
            }
        }
        ShareError::Io(e) => AttemptError::Fatal {
            code: code_for_io(&e).as_str().to_string(),
            message: e.to_string(),
        },
        // Protocol violations: the session is unusable and a rerun will not
        // help.
        other => AttemptError::Fatal {
            code: ErrorCode::InvalidRequest.as_str().to_string(),
            message: other.to_string(),
        },
    }
}

fn fatal_io(err: &std::io::Error, context: &str) -> AttemptError {
    AttemptError::Fatal {
        code: code_for_io(err).as_str().to_string(),
        message: format!("{} failed: {}", context, err),
    }
}

/// Race a fallible operation against the cancellation token.
async fn cancellable<T>(
    token: &CancellationToken,
    operation: impl Future<Output = ShareResult<T>>,
) -> Result<T, AttemptError> {
    tokio::select! {
        _ = token.cancelled() => Err(AttemptError::Cancelled),
        result = operation => result.map_err(classify),
    }
}

async fn client_handshake_owned(
    session: &mut Session,
    identity: &Identity,
) -> ShareResult<()> {
    client_handshake(session, identity).await.map(|_| ())
}

/// Best-effort in-band cancel notice, then close.
async fn abort_session(session: &mut Session, transfer_id: &str) {
    let _ = timeout(
        Duration::from_secs(2),
        session.send(&Message::CancelTransfer(CancelTransfer {
            transfer_id: transfer_id.to_string(),
        })),
    )
    .await;
    session.close().await;
}

async fn abort_or_close(session: &mut Session, transfer_id: &str, err: &AttemptError) {
    if matches!(err, AttemptError::Cancelled) {
        abort_session(session, transfer_id).await;
    } else {
        session.close().await;
    }
}

fn validate_request(request: &DownloadRequest) -> ShareResult<()> {
    if request.peer_device_id.trim().is_empty() {
        return Err(ShareError::InvalidRequest(
            "peerDeviceId must not be empty".into(),
        ));
    }
    if request.file_id.trim().is_empty() {
        return Err(ShareError::InvalidRequest("fileId must not be empty".into()));
    }
    if !request.destination_path.is_absolute() {
        return Err(ShareError::InvalidRequest(
            "destinationPath must be absolute".into(),
        ));
    }
    if request.destination_path.file_name().is_none() {
        return Err(ShareError::InvalidRequest(
            "destinationPath must name a file".into(),
        ));
    }
    Ok(())
}
