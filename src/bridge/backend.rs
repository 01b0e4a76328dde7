//! Backend processes and per-backend protocol state
//!
//! Each backend gets its own sequence space. Every request the bridge sends
//! is recorded under the backend-issued sequence number so the eventual
//! response can be routed without looking at arrival order.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command as ProcessCommand;
use tokio::sync::{mpsc, oneshot};

use crate::common::config::BackendCommand;
use crate::common::{Error, Result};
use crate::dap::codec::{self, FrameReader};
use crate::dap::{Command, ProtocolMessage, RequestMessage};

use super::session::{Peer, SessionInput};

/// The two debugger backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Managed,
    Native,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::Native => write!(f, "native"),
        }
    }
}

/// Outgoing side of a backend connection plus control over its process
pub struct BackendLink {
    outgoing: mpsc::UnboundedSender<ProtocolMessage>,
    kill: Option<oneshot::Sender<()>>,
}

impl BackendLink {
    pub fn new(
        outgoing: mpsc::UnboundedSender<ProtocolMessage>,
        kill: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self { outgoing, kill }
    }

    fn send(&self, message: ProtocolMessage) -> bool {
        self.outgoing.send(message).is_ok()
    }

    /// Force-kill the process; only the first call has any effect
    pub fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_none()
    }
}

/// A client request forwarded to a backend
#[derive(Debug, Clone)]
pub struct PendingClientRequest {
    pub client_seq: i64,
    pub command: Command,
}

/// One backend's share of a split `setBreakpoints` request
#[derive(Debug, Clone)]
pub struct PendingPart {
    pub client_seq: i64,
    /// Positions in the original request's breakpoint list
    pub indices: Vec<usize>,
}

/// Requests the bridge issues on its own account; responses are consumed
#[derive(Debug, Clone, PartialEq)]
pub enum InternalRequest {
    Initialize,
    Attach,
    ConfigurationDone,
    ReplayBreakpoints { path: String, lines: Vec<u32> },
    EntryFrame,
    AutoContinue,
    Detach,
    Terminate,
}

/// Per-backend protocol state
pub struct BackendState {
    pub kind: BackendKind,
    next_seq: i64,
    link: Option<BackendLink>,
    /// Cleared when the backend proves unusable (e.g. attach failed)
    pub usable: bool,
    /// Attach has been requested; breakpoints may now be forwarded
    pub session_started: bool,
    pub attach_complete: bool,
    pub exited: bool,
    pub pending_client_requests: HashMap<i64, PendingClientRequest>,
    pub pending_set_breakpoints: HashMap<i64, PendingPart>,
    pub internal: HashMap<i64, InternalRequest>,
}

impl BackendState {
    pub fn new(kind: BackendKind, link: Option<BackendLink>) -> Self {
        Self {
            kind,
            next_seq: 1,
            link,
            usable: true,
            session_started: false,
            attach_complete: false,
            exited: false,
            pending_client_requests: HashMap::new(),
            pending_set_breakpoints: HashMap::new(),
            internal: HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_available(&self) -> bool {
        self.link.is_some() && self.usable && !self.exited
    }

    fn next_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Re-sequence a message into this backend's number space and send it
    pub fn send(&mut self, mut message: ProtocolMessage) -> Option<i64> {
        if !self.is_available() {
            return None;
        }
        let seq = self.next_seq();
        message.set_seq(seq);
        tracing::trace!(backend = %self.kind, seq, name = message.name(), "bridge >>> backend");

        let link = self.link.as_ref()?;
        if link.send(message) {
            Some(seq)
        } else {
            tracing::warn!(backend = %self.kind, "Backend writer is gone");
            self.usable = false;
            None
        }
    }

    /// Send a request; returns the backend-issued sequence number
    pub fn send_request(&mut self, command: &str, arguments: Option<Value>) -> Option<i64> {
        self.send(ProtocolMessage::Request(RequestMessage {
            seq: 0,
            command: command.to_string(),
            arguments,
        }))
    }

    /// Forward a client request and remember how to answer it
    pub fn forward(
        &mut self,
        client_seq: i64,
        command: Command,
        arguments: Option<Value>,
    ) -> Option<i64> {
        let seq = self.send_request(command.as_str(), arguments)?;
        tracing::debug!(backend = %self.kind, client_seq, seq, %command, "Forwarded request");
        self.pending_client_requests
            .insert(seq, PendingClientRequest { client_seq, command });
        Some(seq)
    }

    /// Send a request whose response the bridge consumes itself
    pub fn send_internal(
        &mut self,
        purpose: InternalRequest,
        command: &str,
        arguments: Option<Value>,
    ) -> Option<i64> {
        let seq = self.send_request(command, arguments)?;
        tracing::debug!(backend = %self.kind, seq, command, ?purpose, "Sent internal request");
        self.internal.insert(seq, purpose);
        Some(seq)
    }

    /// Kill the backend process if it is still running
    pub fn kill(&mut self) {
        if self.exited {
            return;
        }
        if let Some(link) = self.link.as_mut() {
            if link.kill() {
                tracing::info!(backend = %self.kind, "Killed backend process");
            }
        }
    }
}

/// Spawn a backend process and wire its stdio into the session inbox
///
/// Decoded frames arrive as `SessionInput::Backend`; the end of the stdout
/// stream arrives as `SessionInput::BackendExited`.
pub async fn spawn(
    kind: BackendKind,
    config: &BackendCommand,
    inbox: mpsc::UnboundedSender<SessionInput>,
) -> Result<BackendLink> {
    let path = config.resolve()?;

    let mut cmd = ProcessCommand::new(&path);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        Error::BackendStartFailed(format!("Failed to start {}: {}", path.display(), e))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::BackendStartFailed("Failed to get backend stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::BackendStartFailed("Failed to get backend stdout".to_string()))?;

    tracing::info!(
        backend = %kind,
        path = %path.display(),
        args = ?config.args,
        pid = ?child.id(),
        "Spawned debug backend"
    );

    // Reader: frames -> inbox
    tokio::spawn(async move {
        let mut reader = FrameReader::new(stdout);
        loop {
            match reader.read_message().await {
                Ok(Some(message)) => {
                    if inbox.send(SessionInput::Backend(kind, message)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(Error::DapProtocol(msg)) => {
                    let _ = inbox.send(SessionInput::FrameError(Peer::Backend(kind), msg));
                }
                Err(e) => {
                    tracing::warn!(backend = %kind, "Backend read failed: {}", e);
                    break;
                }
            }
        }
        let _ = inbox.send(SessionInput::BackendExited(kind));
    });

    // Writer: outgoing channel -> stdin
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ProtocolMessage>();
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = codec::write_message(&mut stdin, &message).await {
                tracing::warn!(backend = %kind, "Backend write failed: {}", e);
                break;
            }
        }
    });

    // Supervisor: reap the process, or kill it on request
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut kill_armed = true;
        loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::info!(backend = %kind, %status, "Backend process exited"),
                        Err(e) => tracing::warn!(backend = %kind, "Failed to wait for backend: {}", e),
                    }
                    return;
                }
                result = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    if result.is_ok() {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(backend = %kind, "Failed to kill backend: {}", e);
                        }
                        return;
                    }
                }
            }
        }
    });

    Ok(BackendLink::new(out_tx, Some(kill_tx)))
}

/// Force-kill the debuggee by OS process id
#[cfg(unix)]
pub fn kill_process(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn kill_process(pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("cannot force-kill process {} on this platform", pid),
    ))
}
