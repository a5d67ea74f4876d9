//! JSON-RPC over stdio transport.
//!
//! A [`Transport`] owns one server process and drives it through
//! `Disconnected → Connecting → Ready | Failed`, and from `Ready` to
//! `Closing → Disconnected` (or straight to `Disconnected` when the process
//! goes away). A single background task reads frames from the server and
//! resolves pending calls by request id; callers only ever wait on their own
//! result slot, so responses may arrive in any order.
//!
//! A call that times out is removed from the pending table. The request is
//! not cancelled on the server side; if its response shows up later it no
//! longer matches anything and is dropped.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::ChildStderr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::errors::McpError;
use super::framing::FramedChannel;
use super::process::ProcessHandle;
use super::types::{
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, ServerDefinition,
    ServerInfo, ToolDescriptor, ToolsListResult, TransportState, TransportStatus,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
type CallOutcome = Result<Value, McpError>;

// ─── Settings ────────────────────────────────────────────────────────────────

/// Timing knobs shared by every transport in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Budget for `initialize` (and the optional `tools/list`).
    pub handshake_timeout: Duration,
    /// Default per-call timeout when the caller does not pass one.
    pub call_timeout: Duration,
    /// How long a process gets to exit after SIGTERM.
    pub terminate_grace: Duration,
    /// Upper bound for closing every transport at pool shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

// ─── PendingCall ─────────────────────────────────────────────────────────────

/// An outstanding request awaiting its response, timeout, or connection loss.
#[derive(Debug)]
pub struct PendingCall {
    pub request_id: u64,
    /// Tool name for `tools/call`, otherwise the method name.
    pub tool_name: String,
    pub params: Option<Value>,
    pub deadline: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    /// Fulfil the slot. A caller that already gave up is not an error.
    fn resolve(self, outcome: CallOutcome) {
        let _ = self.slot.send(outcome);
    }
}

/// Removes a pending entry when the waiting caller goes away, whether by
/// timeout, external cancellation, or normal completion.
struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.request_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Shared state (read loop + callers) ──────────────────────────────────────

struct Shared {
    server_id: String,
    state: Mutex<TransportState>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    stderr_tail: Mutex<VecDeque<String>>,
}

impl Shared {
    fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    fn set_state(&self, next: TransportState) {
        let mut state = lock(&self.state);
        let current = *state;
        if current != next {
            tracing::debug!(server = %self.server_id, from = %current, to = %next, "transport state change");
            *state = next;
        }
    }

    /// Move to `next` only if currently in `from`.
    fn transition(&self, from: TransportState, next: TransportState) -> bool {
        let mut state = lock(&self.state);
        if *state == from {
            tracing::debug!(server = %self.server_id, from = %from, to = %next, "transport state change");
            *state = next;
            true
        } else {
            false
        }
    }

    fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Resolve every outstanding call with an error built per call.
    fn fail_all(&self, make_error: impl Fn(&PendingCall) -> McpError) -> usize {
        let drained: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let err = make_error(&call);
            call.resolve(Err(err));
        }
        count
    }

    /// The read loop observed EOF or an I/O error.
    fn connection_lost(&self, reason: &str) {
        // While connecting, the handshake sees the failure and marks `Failed`
        let was_ready = self.transition(TransportState::Ready, TransportState::Disconnected);
        let reason = format!("{reason}{}", self.stderr_suffix());
        let failed = self.fail_all(|_| McpError::ConnectionLost {
            server: self.server_id.clone(),
            reason: reason.clone(),
        });
        if was_ready || failed > 0 {
            tracing::warn!(
                server = %self.server_id,
                failed_calls = failed,
                reason = %reason,
                "connection to server lost"
            );
        }
    }

    fn route_frame(&self, frame: Value) {
        let request_id = frame.get("id").and_then(parse_request_id);
        let method = frame.get("method").and_then(Value::as_str);

        match (request_id, method) {
            (Some(id), None) => {
                let Some(call) = lock(&self.pending).remove(&id) else {
                    tracing::debug!(
                        server = %self.server_id,
                        request_id = id,
                        "dropping response for unknown or already resolved request"
                    );
                    return;
                };
                let outcome = extract_result(&self.server_id, frame);
                call.resolve(outcome);
            }
            (_, Some(method)) => {
                tracing::debug!(
                    server = %self.server_id,
                    method,
                    "unrouted out-of-band message from server"
                );
            }
            (None, None) => {
                tracing::debug!(server = %self.server_id, "unrouted frame without id");
            }
        }
    }

    fn push_stderr(&self, line: String) {
        let mut tail = lock(&self.stderr_tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    /// Recent stderr formatted for error messages (empty if none).
    fn stderr_suffix(&self) -> String {
        let tail = lock(&self.stderr_tail);
        if tail.is_empty() {
            String::new()
        } else {
            let joined: Vec<&str> = tail.iter().map(String::as_str).collect();
            format!(" | stderr: {}", joined.join(" / "))
        }
    }
}

fn parse_request_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a response frame, converting errors to `McpError`.
pub fn extract_result(server: &str, mut frame: Value) -> Result<Value, McpError> {
    if let Some(error) = frame.get_mut("error").map(Value::take) {
        return match serde_json::from_value::<JsonRpcError>(error) {
            Ok(err) => Err(McpError::ServerError {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            Err(e) => Err(McpError::Protocol {
                server: server.to_string(),
                reason: format!("malformed error object: {e}"),
            }),
        };
    }

    match frame.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(McpError::Protocol {
            server: server.to_string(),
            reason: "response missing both result and error".into(),
        }),
    }
}

/// Turn a `tools/call` result flagged with `isError` into a tool error.
fn check_tool_result(tool: &str, result: Value) -> Result<Value, McpError> {
    if result.get("isError").and_then(Value::as_bool) != Some(true) {
        return Ok(result);
    }

    let message = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find_map(|item| item.get("text").and_then(Value::as_str))
        })
        .unwrap_or("tool reported an error")
        .to_string();

    Err(McpError::ToolFailed {
        tool: tool.to_string(),
        message,
        payload: result,
    })
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Live connection to one server process.
pub struct Transport {
    definition: ServerDefinition,
    instance_id: Uuid,
    settings: TransportSettings,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    process: Mutex<Option<ProcessHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_request_id: AtomicU64,
    pid: OnceLock<u32>,
    connected_at: OnceLock<DateTime<Utc>>,
    server_info: OnceLock<ServerInfo>,
    tools: OnceLock<Vec<ToolDescriptor>>,
    malformed_frames: OnceLock<Arc<AtomicU64>>,
    started: AtomicBool,
    released: AtomicBool,
}

impl Transport {
    /// Create a disconnected transport for `definition`.
    pub fn new(definition: ServerDefinition, settings: TransportSettings) -> Self {
        let shared = Arc::new(Shared {
            server_id: definition.id.clone(),
            state: Mutex::new(TransportState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
        });
        Self {
            definition,
            instance_id: Uuid::new_v4(),
            settings,
            shared,
            writer: tokio::sync::Mutex::new(None),
            process: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            next_request_id: AtomicU64::new(1),
            pid: OnceLock::new(),
            connected_at: OnceLock::new(),
            server_info: OnceLock::new(),
            tools: OnceLock::new(),
            malformed_frames: OnceLock::new(),
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn server_id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    /// Unique per instance; a reconnect yields a new id.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Tools declared during the handshake (empty if none were declared).
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.get().cloned().unwrap_or_default()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.get()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending_count()
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus {
            server_id: self.definition.id.clone(),
            instance_id: self.instance_id,
            state: self.state(),
            pid: self.pid(),
            connected_at: self.connected_at.get().copied(),
            pending_calls: self.pending_count(),
            tool_count: self.tools.get().map_or(0, Vec::len),
            malformed_frames: self
                .malformed_frames
                .get()
                .map_or(0, |c| c.load(Ordering::Relaxed)),
        }
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Launch the server process and perform the handshake.
    ///
    /// On any failure the process is terminated and the transport ends up
    /// `Failed`; a transport instance can only be connected once.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.begin_connect()?;

        let mut process = match ProcessHandle::launch(&self.definition) {
            Ok(process) => process,
            Err(e) => {
                self.shared.set_state(TransportState::Failed);
                return Err(e);
            }
        };

        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            let err = McpError::LaunchFailed {
                server: self.definition.id.clone(),
                reason: "failed to capture stdio".into(),
            };
            *lock(&self.process) = Some(process);
            self.fail(&err).await;
            return Err(err);
        };

        if let Some(stderr) = process.take_stderr() {
            self.spawn_stderr_drain(stderr);
        }
        if let Some(pid) = process.pid() {
            let _ = self.pid.set(pid);
        }
        *lock(&self.process) = Some(process);

        self.attach_and_handshake(stdout, stdin).await
    }

    /// Connect over caller-supplied streams instead of a child process.
    ///
    /// Used for in-process servers; the transport behaves exactly as with a
    /// process, minus termination.
    pub async fn connect_with_io<R, W>(&self, reader: R, writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        self.begin_connect()?;
        self.attach_and_handshake(reader, writer).await
    }

    fn begin_connect(&self) -> Result<(), McpError> {
        if self.started.swap(true, Ordering::SeqCst)
            || !self
                .shared
                .transition(TransportState::Disconnected, TransportState::Connecting)
        {
            return Err(McpError::NotReady {
                server: self.definition.id.clone(),
                state: format!("{} (instance already used)", self.state()),
            });
        }
        Ok(())
    }

    async fn attach_and_handshake<R, W>(&self, reader: R, writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        *self.writer.lock().await = Some(Box::pin(writer));

        let channel = FramedChannel::new(&self.definition.id, reader);
        let _ = self.malformed_frames.set(channel.malformed_counter());
        self.spawn_read_loop(channel);

        let started = Instant::now();
        if let Err(e) = self.handshake().await {
            tracing::warn!(server = %self.definition.id, error = %e, "handshake failed");
            self.fail(&e).await;
            return Err(e);
        }

        if !self
            .shared
            .transition(TransportState::Connecting, TransportState::Ready)
        {
            // Closed while the handshake was in flight
            return Err(McpError::NotReady {
                server: self.definition.id.clone(),
                state: self.state().to_string(),
            });
        }

        let _ = self.connected_at.set(Utc::now());
        tracing::info!(
            server = %self.definition.id,
            pid = ?self.pid(),
            tools = self.tools.get().map_or(0, Vec::len),
            elapsed_ms = duration_ms(started.elapsed()),
            "server ready"
        );
        Ok(())
    }

    /// `initialize`, `notifications/initialized`, then `tools/list` if the
    /// server advertises tools without listing them.
    async fn handshake(&self) -> Result<(), McpError> {
        let deadline = Instant::now() + self.settings.handshake_timeout;
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });

        let result = self
            .request_until("initialize", "initialize", Some(params), deadline)
            .await
            .map_err(|e| self.handshake_error(e))?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::HandshakeFailed {
                server: self.definition.id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.notify("notifications/initialized", None).await?;

        let mut tools = init.tools.clone();
        if tools.is_empty() && init.advertises_tools() {
            let listed = self
                .request_until("tools/list", "tools/list", None, deadline)
                .await
                .and_then(|value| {
                    serde_json::from_value::<ToolsListResult>(value).map_err(|e| {
                        McpError::Protocol {
                            server: self.definition.id.clone(),
                            reason: format!("failed to parse tools/list response: {e}"),
                        }
                    })
                });
            match listed {
                Ok(list) => tools = list.tools,
                Err(e) => {
                    tracing::warn!(server = %self.definition.id, error = %e, "tools/list failed");
                }
            }
        }

        let _ = self.tools.set(tools);
        if let Some(info) = init.server_info {
            let _ = self.server_info.set(info);
        }
        Ok(())
    }

    fn handshake_error(&self, err: McpError) -> McpError {
        let stderr = self.shared.stderr_suffix();
        match err {
            McpError::CallTimeout { .. } => McpError::HandshakeTimeout {
                server: self.definition.id.clone(),
                timeout_ms: duration_ms(self.settings.handshake_timeout),
                stderr,
            },
            McpError::ServerError { code, message, .. } => McpError::HandshakeFailed {
                server: self.definition.id.clone(),
                reason: format!("[{code}] {message}{stderr}"),
            },
            other => other,
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Invoke a tool via `tools/call` and wait up to `timeout` for its result.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        self.ensure_ready()?;
        let params = json!({
            "name": tool,
            "arguments": arguments,
        });
        let result = self
            .request_until("tools/call", tool, Some(params), Instant::now() + timeout)
            .await?;
        check_tool_result(tool, result)
    }

    /// Send an arbitrary request and wait up to `timeout` for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        self.ensure_ready()?;
        self.request_until(method, method, params, Instant::now() + timeout)
            .await
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_frame(&JsonRpcNotification::new(method, params))
            .await
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        match self.state() {
            TransportState::Ready => Ok(()),
            state => Err(McpError::NotReady {
                server: self.definition.id.clone(),
                state: state.to_string(),
            }),
        }
    }

    async fn request_until(
        &self,
        method: &str,
        label: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, McpError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let budget = deadline.saturating_duration_since(Instant::now());
        let (slot, outcome) = oneshot::channel();

        lock(&self.shared.pending).insert(
            request_id,
            PendingCall {
                request_id,
                tool_name: label.to_string(),
                params: params.clone(),
                deadline,
                slot,
            },
        );
        let _guard = PendingGuard {
            shared: &self.shared,
            request_id,
        };

        self.write_frame(&JsonRpcRequest::new(request_id, method, params))
            .await?;

        match tokio::time::timeout_at(deadline, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionLost {
                server: self.definition.id.clone(),
                reason: "transport dropped the pending call".into(),
            }),
            Err(_) => {
                tracing::debug!(
                    server = %self.definition.id,
                    request_id,
                    method,
                    "call timed out; a late response will be discarded"
                );
                Err(McpError::CallTimeout {
                    server: self.definition.id.clone(),
                    tool: label.to_string(),
                    timeout_ms: duration_ms(budget),
                })
            }
        }
    }

    /// Write one line-delimited frame. Writes are serialized, so requests
    /// reach the server in the order callers issued them.
    async fn write_frame<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(message).map_err(|e| McpError::Protocol {
            server: self.definition.id.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(McpError::ConnectionLost {
                server: self.definition.id.clone(),
                reason: "server stdin is closed".into(),
            });
        };

        let written = match stream.write_all(&line).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        drop(writer);

        written.map_err(|e| {
            let reason = format!("failed to write to stdin: {e}");
            self.shared.connection_lost(&reason);
            McpError::ConnectionLost {
                server: self.definition.id.clone(),
                reason,
            }
        })
    }

    // ─── Background tasks ────────────────────────────────────────────────

    fn spawn_read_loop<R>(&self, mut channel: FramedChannel<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let reason = loop {
                match channel.next_frame().await {
                    Ok(Some(frame)) => shared.route_frame(frame),
                    Ok(None) => break "server closed its output (process may have exited)".to_string(),
                    Err(e) => break format!("failed to read from stdout: {e}"),
                }
            };
            shared.connection_lost(&reason);
        });
        lock(&self.tasks).push(handle);
    }

    fn spawn_stderr_drain(&self, stderr: ChildStderr) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %shared.server_id, "stderr: {line}");
                shared.push_stderr(line);
            }
        });
        lock(&self.tasks).push(handle);
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Cancel outstanding calls, terminate the process, release the pipes.
    ///
    /// Idempotent: only the first call does anything. A `Failed` transport
    /// stays `Failed`; every other state ends `Disconnected`.
    pub async fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let previous = {
            let mut state = lock(&self.shared.state);
            let previous = *state;
            if previous != TransportState::Failed {
                *state = TransportState::Closing;
            }
            previous
        };

        let cancelled = self.shared.fail_all(|call| McpError::Cancelled {
            server: self.definition.id.clone(),
            tool: call.tool_name.clone(),
        });

        self.release_resources().await;

        if previous != TransportState::Failed {
            self.shared.set_state(TransportState::Disconnected);
        }
        tracing::info!(
            server = %self.definition.id,
            previous = %previous,
            cancelled_calls = cancelled,
            "transport closed"
        );
    }

    /// Connect-time failure: deliver `err` to every pending call, release
    /// resources, and park in `Failed`.
    ///
    /// If `close` already started, it owns teardown and the final state.
    async fn fail(&self, err: &McpError) {
        self.shared.fail_all(|_| err.clone());
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.set_state(TransportState::Failed);
        self.release_resources().await;
    }

    async fn release_resources(&self) {
        // Take the process first so that dropping this future still kills it
        let process = lock(&self.process).take();

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        // Closing stdin lets well-behaved servers exit on their own
        let writer = self.writer.try_lock().ok().and_then(|mut w| w.take());
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        if let Some(mut process) = process {
            match process.terminate(self.settings.terminate_grace).await {
                Ok(status) => {
                    tracing::debug!(server = %self.definition.id, status = ?status, "server process reaped");
                }
                Err(e) => {
                    tracing::warn!(server = %self.definition.id, error = %e, "failed to terminate server process");
                }
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("server_id", &self.definition.id)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::super::errors::ErrorKind;
    use super::*;

    type ClientIo = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

    fn settings() -> TransportSettings {
        TransportSettings {
            handshake_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
            terminate_grace: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn transport() -> Transport {
        Transport::new(ServerDefinition::new("fake", "unused", &[]), settings())
    }

    fn reply(request: &Value, result: Value) -> String {
        json!({"jsonrpc": "2.0", "id": request["id"], "result": result}).to_string()
    }

    fn init_reply(request: &Value) -> String {
        reply(
            request,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": "fake", "version": "0.0.1"},
                "capabilities": {"tools": {}},
                "tools": [{"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}}],
            }),
        )
    }

    /// Echo server: `tools/call` replies with its arguments after
    /// `arguments.delay_ms`; `arguments.hang` never replies.
    fn echo_handler(request: &Value) -> Option<(Duration, String)> {
        match request["method"].as_str() {
            Some("initialize") => Some((Duration::ZERO, init_reply(request))),
            Some("tools/call") => {
                let args = request["params"]["arguments"].clone();
                if args.get("hang").is_some() {
                    return None;
                }
                let delay = args
                    .get("delay_ms")
                    .and_then(Value::as_u64)
                    .map_or(Duration::ZERO, Duration::from_millis);
                Some((delay, reply(request, args)))
            }
            _ => None,
        }
    }

    /// In-process server over a duplex pipe. Replies are written from their
    /// own tasks, so delayed replies can overtake each other.
    fn spawn_fake_server<F>(handler: F) -> ClientIo
    where
        F: Fn(&Value) -> Option<(Duration, String)> + Send + Sync + 'static,
    {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let server_write = Arc::new(tokio::sync::Mutex::new(server_write));

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(request) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some((delay, text)) = handler(&request) {
                    let writer = Arc::clone(&server_write);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let mut w = writer.lock().await;
                        let _ = w.write_all(format!("{text}\n").as_bytes()).await;
                        let _ = w.flush().await;
                    });
                }
            }
        });

        tokio::io::split(client)
    }

    async fn connected(handler: fn(&Value) -> Option<(Duration, String)>) -> Transport {
        let t = transport();
        let (reader, writer) = spawn_fake_server(handler);
        t.connect_with_io(reader, writer).await.unwrap();
        t
    }

    #[tokio::test]
    async fn test_handshake_records_tools_and_info() {
        let t = connected(echo_handler).await;
        assert_eq!(t.state(), TransportState::Ready);
        assert_eq!(t.tools().len(), 1);
        assert_eq!(t.tools()[0].name, "echo");
        assert_eq!(t.server_info().unwrap().name.as_deref(), Some("fake"));
        assert!(t.status().connected_at.is_some());
    }

    #[tokio::test]
    async fn test_tools_list_used_when_initialize_omits_tools() {
        fn handler(request: &Value) -> Option<(Duration, String)> {
            match request["method"].as_str() {
                Some("initialize") => Some((
                    Duration::ZERO,
                    reply(request, json!({"capabilities": {"tools": {}}})),
                )),
                Some("tools/list") => Some((
                    Duration::ZERO,
                    reply(request, json!({"tools": [{"name": "a"}, {"name": "b"}]})),
                )),
                _ => None,
            }
        }
        let t = connected(handler).await;
        let names: Vec<String> = t.tools().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let t = connected(echo_handler).await;
        let result = t
            .call_tool("echo", json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated_by_id() {
        let t = connected(echo_handler).await;
        let slow = t.call_tool("echo", json!({"n": "slow", "delay_ms": 300}), Duration::from_secs(2));
        let fast = t.call_tool("echo", json!({"n": "fast", "delay_ms": 10}), Duration::from_secs(2));

        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap()["n"], "slow");
        assert_eq!(fast.unwrap()["n"], "fast");
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let t = connected(echo_handler).await;

        let err = t
            .call_tool("echo", json!({"n": "late", "delay_ms": 300}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallTimeout);
        assert_eq!(t.pending_count(), 0);

        // Let the late reply arrive; it must not resolve anything
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(t.state(), TransportState::Ready);

        let next = t
            .call_tool("echo", json!({"n": "next"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(next["n"], "next");
    }

    #[tokio::test]
    async fn test_timeout_leaves_other_calls_running() {
        let t = connected(echo_handler).await;
        let hung = t.call_tool("echo", json!({"hang": true}), Duration::from_millis(150));
        let ok = t.call_tool("echo", json!({"n": 1, "delay_ms": 50}), Duration::from_secs(1));

        let started = std::time::Instant::now();
        let (hung, ok) = tokio::join!(hung, ok);
        assert_eq!(hung.unwrap_err().kind(), ErrorKind::CallTimeout);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ok.unwrap()["n"], 1);
        assert!(t.is_ready());
    }

    #[tokio::test]
    async fn test_connection_lost_fails_every_pending_call() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let mut calls = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                match request["method"].as_str() {
                    Some("initialize") => {
                        let text = format!("{}\n", init_reply(&request));
                        server_write.write_all(text.as_bytes()).await.unwrap();
                    }
                    Some("tools/call") => {
                        calls += 1;
                        if calls == 2 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            // Dropping both halves closes the client's read side
        });

        let t = transport();
        let (reader, writer) = tokio::io::split(client);
        t.connect_with_io(reader, writer).await.unwrap();

        let a = t.call_tool("echo", json!({"n": "a"}), Duration::from_secs(5));
        let b = t.call_tool("echo", json!({"n": "b"}), Duration::from_secs(5));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap_err().kind(), ErrorKind::ConnectionLost);
        assert_eq!(b.unwrap_err().kind(), ErrorKind::ConnectionLost);
        assert_eq!(t.state(), TransportState::Disconnected);

        let after = t
            .call_tool("echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(after.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_and_is_idempotent() {
        let t = Arc::new(connected(echo_handler).await);

        let caller = {
            let t = Arc::clone(&t);
            tokio::spawn(async move {
                t.call_tool("echo", json!({"hang": true}), Duration::from_secs(10))
                    .await
            })
        };
        // Wait until the call is registered
        while t.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        t.close().await;
        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(t.state(), TransportState::Disconnected);

        t.close().await;
        assert_eq!(t.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_timeout_marks_failed() {
        let t = Transport::new(
            ServerDefinition::new("mute", "unused", &[]),
            TransportSettings {
                handshake_timeout: Duration::from_millis(100),
                ..settings()
            },
        );
        let (reader, writer) = spawn_fake_server(|_| None);

        let err = t.connect_with_io(reader, writer).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
        assert_eq!(t.state(), TransportState::Failed);

        // Failed is terminal for the instance
        let (reader, writer) = spawn_fake_server(echo_handler);
        let again = t.connect_with_io(reader, writer).await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::Unavailable);

        t.close().await;
        assert_eq!(t.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_close_during_handshake_ends_disconnected() {
        let t = Arc::new(transport());
        let (reader, writer) = spawn_fake_server(|_| None);

        let connecting = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.connect_with_io(reader, writer).await })
        };
        while t.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        t.close().await;
        let err = connecting.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(t.state(), TransportState::Disconnected);

        // Nothing left running that could flip the state afterwards
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_error_response_marks_failed() {
        fn handler(request: &Value) -> Option<(Duration, String)> {
            let text = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32603, "message": "boot failure"},
            })
            .to_string();
            Some((Duration::ZERO, text))
        }
        let t = transport();
        let (reader, writer) = spawn_fake_server(handler);
        let err = t.connect_with_io(reader, writer).await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeFailed { .. }));
        assert!(err.to_string().contains("boot failure"));
        assert_eq!(t.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_call_before_connect_is_not_ready() {
        let t = transport();
        let err = t
            .call_tool("echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_tool_errors_do_not_affect_state() {
        fn handler(request: &Value) -> Option<(Duration, String)> {
            match request["method"].as_str() {
                Some("initialize") => Some((Duration::ZERO, init_reply(request))),
                Some("tools/call") if request["params"]["name"] == "flagged" => Some((
                    Duration::ZERO,
                    reply(
                        request,
                        json!({"isError": true, "content": [{"type": "text", "text": "disk full"}]}),
                    ),
                )),
                Some("tools/call") => Some((
                    Duration::ZERO,
                    json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "error": {"code": -32602, "message": "bad params"},
                    })
                    .to_string(),
                )),
                _ => None,
            }
        }
        let t = connected(handler).await;

        let flagged = t
            .call_tool("flagged", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(flagged, McpError::ToolFailed { ref message, .. } if message == "disk full"));

        let rejected = t
            .call_tool("other", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(rejected, McpError::ServerError { code: -32602, .. }));
        assert_eq!(rejected.kind(), ErrorKind::ToolError);
        assert!(t.is_ready());
    }

    #[tokio::test]
    async fn test_noise_and_out_of_band_frames_are_ignored() {
        fn handler(request: &Value) -> Option<(Duration, String)> {
            match request["method"].as_str() {
                Some("initialize") => Some((Duration::ZERO, init_reply(request))),
                Some("tools/call") => {
                    let noise = "loading model weights...";
                    let notification =
                        json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}});
                    let text = format!(
                        "{noise}\n{notification}\n{}",
                        reply(request, json!({"ok": true}))
                    );
                    Some((Duration::ZERO, text))
                }
                _ => None,
            }
        }
        let t = connected(handler).await;
        let result = t
            .call_tool("echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(t.status().malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_response_without_result_or_error_is_protocol_error() {
        fn handler(request: &Value) -> Option<(Duration, String)> {
            match request["method"].as_str() {
                Some("initialize") => Some((Duration::ZERO, init_reply(request))),
                Some("tools/call") => Some((
                    Duration::ZERO,
                    json!({"jsonrpc": "2.0", "id": request["id"]}).to_string(),
                )),
                _ => None,
            }
        }
        let t = connected(handler).await;
        let err = t
            .call_tool("echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(t.is_ready());
    }

    #[test]
    fn test_extract_result_variants() {
        let ok = extract_result("s", json!({"id": 1, "result": {"text": "hello"}})).unwrap();
        assert_eq!(ok["text"], "hello");

        let null = extract_result("s", json!({"id": 1, "result": null})).unwrap();
        assert!(null.is_null());

        let err = extract_result(
            "s",
            json!({"id": 1, "error": {"code": -32601, "message": "Method not found"}}),
        )
        .unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            _ => panic!("expected ServerError"),
        }
    }

    #[test]
    fn test_parse_request_id() {
        assert_eq!(parse_request_id(&json!(7)), Some(7));
        assert_eq!(parse_request_id(&json!("12")), Some(12));
        assert_eq!(parse_request_id(&json!("abc")), None);
        assert_eq!(parse_request_id(&json!(null)), None);
    }
}
