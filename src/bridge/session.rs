//! Bridge session state machine
//!
//! One `Session` exists per client connection. All three message streams,
//! timer firings and the auto-continue tick arrive as [`SessionInput`]
//! values and are handled strictly one at a time, so handlers are plain
//! synchronous methods over `&mut self` and need no locking.
//!
//! The handlers are split by concern: request routing in `handler.rs`,
//! breakpoint splitting in `breakpoints.rs`, attach and the
//! configuration-done gate in `attach.rs`, termination in `shutdown.rs`.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::common::config::{Config, Timeouts};
use crate::common::logging::Diagnostics;
use crate::dap::{EventMessage, ProtocolMessage, RequestMessage, ResponseMessage};

use super::attach::{ConfigurationGate, EntryStop};
use super::backend::{BackendKind, BackendLink, BackendState, InternalRequest};
use super::breakpoints::BreakpointBook;
use super::shutdown::ShutdownState;
use super::source::SourceClassifier;
use super::timers::{TimerKind, Timers};

/// Which stream a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Backend(BackendKind),
}

/// Everything that can wake the session
#[derive(Debug)]
pub enum SessionInput {
    Client(ProtocolMessage),
    Backend(BackendKind, ProtocolMessage),
    FrameError(Peer, String),
    ClientClosed,
    BackendExited(BackendKind),
    Timer(TimerKind, u64),
    AutoContinue,
}

pub struct Session {
    pub(super) auto_attach: bool,
    pub(super) timeouts: Timeouts,
    pub(super) classifier: SourceClassifier,
    pub(super) diagnostics: Diagnostics,
    client: Option<mpsc::UnboundedSender<ProtocolMessage>>,
    client_seq: i64,
    pub(super) inbox: mpsc::UnboundedSender<SessionInput>,
    pub(super) managed: BackendState,
    pub(super) native: BackendState,
    /// Owner of stepping and inspection commands
    pub(super) active_backend: BackendKind,
    pub(super) debuggee_pid: Option<u32>,
    pub(super) debuggee_killed: bool,
    pub(super) attach_requested: bool,
    pub(super) gate: ConfigurationGate,
    pub(super) entry: EntryStop,
    pub(super) breakpoints: BreakpointBook,
    pub(super) shutdown: ShutdownState,
    pub(super) timers: Timers,
    /// Client-facing seq of a backend's reverse request -> (backend, backend seq)
    reverse_requests: HashMap<i64, (BackendKind, i64)>,
    closed: bool,
}

impl Session {
    pub fn new(
        config: &Config,
        client: mpsc::UnboundedSender<ProtocolMessage>,
        managed: BackendLink,
        native: Option<BackendLink>,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        let session = Self {
            auto_attach: config.auto_attach,
            timeouts: config.timeouts.clone(),
            classifier: SourceClassifier::new(&config.sources),
            diagnostics: Diagnostics::new(config.diagnostics),
            client: Some(client),
            client_seq: 1,
            timers: Timers::new(inbox.clone()),
            inbox,
            managed: BackendState::new(BackendKind::Managed, Some(managed)),
            native: BackendState::new(BackendKind::Native, native),
            active_backend: BackendKind::Managed,
            debuggee_pid: None,
            debuggee_killed: false,
            attach_requested: false,
            gate: ConfigurationGate::default(),
            entry: EntryStop::default(),
            breakpoints: BreakpointBook::default(),
            shutdown: ShutdownState::default(),
            reverse_requests: HashMap::new(),
            closed: false,
        };
        tracing::info!(
            native = session.native.is_connected(),
            auto_attach = session.auto_attach,
            "Bridge session started"
        );
        session.diagnostics.mark("session started");
        session
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn active_backend(&self) -> BackendKind {
        self.active_backend
    }

    /// Handle one input to completion
    pub fn handle(&mut self, input: SessionInput) {
        if self.closed {
            return;
        }
        match input {
            SessionInput::Client(ProtocolMessage::Request(request)) => {
                self.handle_client_request(request)
            }
            SessionInput::Client(ProtocolMessage::Response(response)) => {
                self.handle_client_response(response)
            }
            SessionInput::Client(ProtocolMessage::Event(event)) => {
                tracing::debug!(event = %event.event, "Ignoring event sent by client");
            }
            SessionInput::Backend(kind, ProtocolMessage::Response(response)) => {
                self.handle_backend_response(kind, response)
            }
            SessionInput::Backend(kind, ProtocolMessage::Event(event)) => {
                self.handle_backend_event(kind, event)
            }
            SessionInput::Backend(kind, ProtocolMessage::Request(request)) => {
                self.forward_reverse_request(kind, request)
            }
            SessionInput::FrameError(peer, message) => {
                tracing::warn!(?peer, "Discarded malformed frame: {}", message);
            }
            SessionInput::ClientClosed => self.handle_client_closed(),
            SessionInput::BackendExited(kind) => self.handle_backend_exited(kind),
            SessionInput::Timer(kind, generation) => {
                if self.timers.take_fired(kind, generation) {
                    self.handle_timer(kind);
                }
            }
            SessionInput::AutoContinue => self.run_auto_continue(),
        }
    }

    pub(super) fn backend_mut(&mut self, kind: BackendKind) -> &mut BackendState {
        match kind {
            BackendKind::Managed => &mut self.managed,
            BackendKind::Native => &mut self.native,
        }
    }

    // === Client output ===

    /// Re-sequence into the client's number space and send
    pub(super) fn send_to_client(&mut self, mut message: ProtocolMessage) {
        let Some(client) = self.client.as_ref() else {
            tracing::trace!(name = message.name(), "Client gone; dropping message");
            return;
        };
        message.set_seq(self.client_seq);
        self.client_seq += 1;
        tracing::trace!(seq = message.seq(), name = message.name(), "bridge >>> client");
        if client.send(message).is_err() {
            tracing::debug!("Client writer is gone");
            self.client = None;
        }
    }

    pub(super) fn respond(&mut self, response: ResponseMessage) {
        self.send_to_client(ProtocolMessage::Response(response));
    }

    pub(super) fn respond_ok(&mut self, request_seq: i64, command: &str, body: Option<Value>) {
        self.respond(ResponseMessage::ok(request_seq, command, body));
    }

    pub(super) fn respond_error(&mut self, request_seq: i64, command: &str, message: &str) {
        self.respond(ResponseMessage::error(request_seq, command, message));
    }

    pub(super) fn emit_event(&mut self, event: &str, body: Option<Value>) {
        self.send_to_client(ProtocolMessage::Event(EventMessage::new(event, body)));
    }

    /// Drop the client connection; the writer flushes and closes the socket
    pub(super) fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        tracing::info!(reason, "Closing client connection");
        self.closed = true;
        self.shutdown.enter_closed();
        self.timers.cancel_all();
        self.client = None;
        self.managed.kill();
        self.native.kill();
        self.diagnostics.mark("socket closed");
    }

    // === Reverse requests (backend -> client) ===

    fn forward_reverse_request(&mut self, kind: BackendKind, request: RequestMessage) {
        if self.client.is_none() {
            let backend = self.backend_mut(kind);
            let reply = ResponseMessage::error(request.seq, &request.command, "client is gone");
            backend.send(ProtocolMessage::Response(reply));
            return;
        }
        let backend_seq = request.seq;
        let client_seq = self.client_seq;
        self.reverse_requests.insert(client_seq, (kind, backend_seq));
        tracing::debug!(backend = %kind, backend_seq, client_seq, command = %request.command, "Forwarding reverse request");
        self.send_to_client(ProtocolMessage::Request(request));
    }

    fn handle_client_response(&mut self, mut response: ResponseMessage) {
        let Some((kind, backend_seq)) = self.reverse_requests.remove(&response.request_seq) else {
            tracing::debug!(request_seq = response.request_seq, "Unmatched client response");
            return;
        };
        response.request_seq = backend_seq;
        self.backend_mut(kind)
            .send(ProtocolMessage::Response(response));
    }

    // === Backend responses ===

    fn handle_backend_response(&mut self, kind: BackendKind, response: ResponseMessage) {
        let backend = self.backend_mut(kind);

        if let Some(purpose) = backend.internal.remove(&response.request_seq) {
            return self.handle_internal_response(kind, purpose, response);
        }
        if let Some(part) = backend.pending_set_breakpoints.remove(&response.request_seq) {
            return self.handle_breakpoints_part(kind, part, &response);
        }
        if let Some(pending) = backend.pending_client_requests.remove(&response.request_seq) {
            if !response.success {
                tracing::warn!(
                    backend = %kind,
                    command = %pending.command,
                    message = response.message.as_deref().unwrap_or(""),
                    "Backend request failed"
                );
            }
            let mut response = response;
            response.request_seq = pending.client_seq;
            response.command = pending.command.as_str().to_string();
            return self.respond(response);
        }

        tracing::debug!(
            backend = %kind,
            request_seq = response.request_seq,
            command = %response.command,
            "Dropping response with no pending request"
        );
    }

    fn handle_internal_response(
        &mut self,
        kind: BackendKind,
        purpose: InternalRequest,
        response: ResponseMessage,
    ) {
        match purpose {
            InternalRequest::Initialize => {
                if response.success {
                    let capabilities = response
                        .body
                        .as_ref()
                        .and_then(Value::as_object)
                        .map(|caps| caps.len())
                        .unwrap_or(0);
                    tracing::debug!(backend = %kind, capabilities, "Backend initialized");
                } else {
                    self.log_internal_failure(kind, "initialize", &response);
                }
            }
            InternalRequest::Attach => self.on_attach_response(&response),
            InternalRequest::ConfigurationDone | InternalRequest::AutoContinue => {
                if !response.success {
                    self.log_internal_failure(kind, &response.command, &response);
                }
            }
            InternalRequest::ReplayBreakpoints { path, lines } => {
                self.on_replay_response(&path, &lines, Some(&response))
            }
            InternalRequest::EntryFrame => self.on_entry_frame_response(Some(&response)),
            InternalRequest::Detach => {
                if !response.success {
                    self.log_internal_failure(kind, "disconnect", &response);
                }
                self.ack_native_detach();
            }
            InternalRequest::Terminate => {
                if !response.success {
                    self.log_internal_failure(kind, "disconnect", &response);
                }
                self.ack_managed_terminate();
            }
        }
    }

    pub(super) fn log_internal_failure(
        &self,
        kind: BackendKind,
        command: &str,
        response: &ResponseMessage,
    ) {
        tracing::warn!(
            backend = %kind,
            command,
            message = response.message.as_deref().unwrap_or(""),
            "Internal request failed"
        );
    }

    // === Backend events ===

    fn handle_backend_event(&mut self, kind: BackendKind, event: EventMessage) {
        match kind {
            BackendKind::Managed => self.handle_managed_event(event),
            BackendKind::Native => self.handle_native_event(event),
        }
    }

    fn handle_managed_event(&mut self, event: EventMessage) {
        match event.event.as_str() {
            "process" => self.on_managed_process_event(&event),
            "stopped" => {
                self.active_backend = BackendKind::Managed;
                if self.intercept_entry_stop(&event) {
                    return;
                }
            }
            "terminated" => {
                if self.shutdown.terminated_event_seen {
                    return;
                }
                self.shutdown.terminated_event_seen = true;
            }
            "exited" => {
                if self.shutdown.exited_event_seen {
                    return;
                }
                self.shutdown.exited_event_seen = true;
            }
            _ => {}
        }
        self.send_to_client(ProtocolMessage::Event(event));
    }

    fn handle_native_event(&mut self, event: EventMessage) {
        match event.event.as_str() {
            // These describe the native backend's own attach lifecycle
            "initialized" | "terminated" | "exited" | "process" => {
                tracing::debug!(event = %event.event, "Consumed native lifecycle event");
                return;
            }
            "stopped" => {
                tracing::debug!("Native backend stopped; routing interactive commands to it");
                self.active_backend = BackendKind::Native;
            }
            _ => {}
        }
        self.send_to_client(ProtocolMessage::Event(event));
    }

    // === Stream endings ===

    fn handle_backend_exited(&mut self, kind: BackendKind) {
        let backend = self.backend_mut(kind);
        if backend.exited {
            return;
        }
        backend.exited = true;
        tracing::info!(backend = %kind, "Backend connection ended");
        self.diagnostics.mark(&format!("{} backend exited", kind));

        // Nothing pending on this backend may be left unanswered
        let backend = self.backend_mut(kind);
        let mut orphaned: Vec<_> = backend.pending_client_requests.drain().collect();
        orphaned.sort_by_key(|(seq, _)| *seq);
        let parts: Vec<_> = backend.pending_set_breakpoints.drain().map(|(_, p)| p).collect();
        let mut internal: Vec<_> = backend.internal.drain().collect();
        internal.sort_by_key(|(seq, _)| *seq);

        for (_, pending) in orphaned {
            let message = format!("{} debug backend exited", kind);
            self.respond_error(pending.client_seq, pending.command.as_str(), &message);
        }
        for part in parts {
            self.abandon_breakpoints_part(part);
        }
        for (_, purpose) in internal {
            self.abandon_internal_request(kind, purpose);
        }

        match kind {
            BackendKind::Native => {
                if self.active_backend == BackendKind::Native {
                    self.active_backend = BackendKind::Managed;
                }
                self.ack_native_detach();
                self.try_auto_continue();
            }
            BackendKind::Managed => {
                if !self.shutdown.requested {
                    tracing::warn!("Managed backend exited before shutdown was requested");
                    if !self.shutdown.terminated_event_seen {
                        self.shutdown.terminated_event_seen = true;
                        self.emit_event("terminated", None);
                    }
                    self.close("managed backend exited");
                    return;
                }
                self.ack_managed_terminate();
            }
        }
    }

    /// An internal request will never be answered; settle what waited on it
    fn abandon_internal_request(&mut self, kind: BackendKind, purpose: InternalRequest) {
        match purpose {
            InternalRequest::Attach => {
                let failed = ResponseMessage::error(0, "attach", format!("{} backend exited", kind));
                self.on_attach_response(&failed);
            }
            InternalRequest::ReplayBreakpoints { path, lines } => {
                self.on_replay_response(&path, &lines, None)
            }
            InternalRequest::EntryFrame => self.on_entry_frame_response(None),
            InternalRequest::Detach => self.ack_native_detach(),
            InternalRequest::Terminate => self.ack_managed_terminate(),
            InternalRequest::Initialize
            | InternalRequest::ConfigurationDone
            | InternalRequest::AutoContinue => {}
        }
    }

    fn handle_client_closed(&mut self) {
        tracing::info!("Client stream closed");
        self.shutdown.client_closed = true;
        self.client = None;
        self.on_client_closed();
    }

    fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::NativeDetach => self.on_native_detach_timeout(),
            TimerKind::ManagedTerminate => self.on_managed_terminate_timeout(),
            TimerKind::DisconnectWait => {
                tracing::info!("Client did not disconnect in time");
                self.close("disconnect wait elapsed");
            }
        }
    }
}

/// Serialize typed arguments for a request the bridge builds itself
pub(super) fn to_arguments<T: serde::Serialize>(args: &T) -> Option<Value> {
    match serde_json::to_value(args) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("Failed to serialize request arguments: {}", e);
            Some(json!({}))
        }
    }
}

#[cfg(test)]
pub(crate) mod harness {
    //! In-memory stand-ins for the client and both backends

    use super::*;
    use crate::dap::ProtocolMessage;
    use serde_json::Value;
    use tokio::sync::oneshot;

    pub struct Harness {
        pub session: Session,
        pub client: mpsc::UnboundedReceiver<ProtocolMessage>,
        pub managed: mpsc::UnboundedReceiver<ProtocolMessage>,
        pub native: Option<mpsc::UnboundedReceiver<ProtocolMessage>>,
        pub inbox: mpsc::UnboundedReceiver<SessionInput>,
        pub managed_kill: oneshot::Receiver<()>,
        pub native_kill: Option<oneshot::Receiver<()>>,
        next_client_seq: i64,
        next_backend_seq: i64,
    }

    impl Harness {
        pub fn new(config: Config, with_native: bool) -> Self {
            let (client_tx, client) = mpsc::unbounded_channel();
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let (managed_tx, managed) = mpsc::unbounded_channel();
            let (managed_kill_tx, managed_kill) = oneshot::channel();
            let managed_link = BackendLink::new(managed_tx, Some(managed_kill_tx));

            let (native_link, native, native_kill) = if with_native {
                let (tx, rx) = mpsc::unbounded_channel();
                let (kill_tx, kill_rx) = oneshot::channel();
                (
                    Some(BackendLink::new(tx, Some(kill_tx))),
                    Some(rx),
                    Some(kill_rx),
                )
            } else {
                (None, None, None)
            };

            let session = Session::new(&config, client_tx, managed_link, native_link, inbox_tx);
            Self {
                session,
                client,
                managed,
                native,
                inbox,
                managed_kill,
                native_kill,
                next_client_seq: 1,
                next_backend_seq: 1000,
            }
        }

        pub fn with_native() -> Self {
            Self::new(Config::default(), true)
        }

        pub fn managed_only() -> Self {
            Self::new(Config::default(), false)
        }

        /// Send a client request; returns its client seq
        pub fn request(&mut self, command: &str, arguments: Option<Value>) -> i64 {
            let seq = self.next_client_seq;
            self.next_client_seq += 1;
            self.session
                .handle(SessionInput::Client(ProtocolMessage::Request(RequestMessage {
                    seq,
                    command: command.to_string(),
                    arguments,
                })));
            self.pump();
            seq
        }

        pub fn reply(
            &mut self,
            kind: BackendKind,
            request: &RequestMessage,
            success: bool,
            body: Option<Value>,
        ) {
            let seq = self.next_backend_seq;
            self.next_backend_seq += 1;
            let response = ResponseMessage {
                seq,
                request_seq: request.seq,
                success,
                command: request.command.clone(),
                message: if success { None } else { Some("backend said no".to_string()) },
                body,
            };
            self.session
                .handle(SessionInput::Backend(kind, ProtocolMessage::Response(response)));
            self.pump();
        }

        pub fn event(&mut self, kind: BackendKind, event: &str, body: Option<Value>) {
            let seq = self.next_backend_seq;
            self.next_backend_seq += 1;
            self.session.handle(SessionInput::Backend(
                kind,
                ProtocolMessage::Event(EventMessage {
                    seq,
                    event: event.to_string(),
                    body,
                }),
            ));
            self.pump();
        }

        pub fn input(&mut self, input: SessionInput) {
            self.session.handle(input);
            self.pump();
        }

        /// Handle everything already queued in the inbox (ticks, fired timers)
        pub fn pump(&mut self) {
            while let Ok(input) = self.inbox.try_recv() {
                self.session.handle(input);
            }
        }

        /// Wait for the next inbox input (auto-advances paused time) and handle it
        pub async fn step(&mut self) {
            if let Some(input) = self.inbox.recv().await {
                self.session.handle(input);
            }
        }

        pub fn client_messages(&mut self) -> Vec<ProtocolMessage> {
            std::iter::from_fn(|| self.client.try_recv().ok()).collect()
        }

        pub fn managed_requests(&mut self) -> Vec<RequestMessage> {
            drain_requests(&mut self.managed)
        }

        pub fn native_requests(&mut self) -> Vec<RequestMessage> {
            match self.native.as_mut() {
                Some(rx) => drain_requests(rx),
                None => Vec::new(),
            }
        }
    }

    fn drain_requests(rx: &mut mpsc::UnboundedReceiver<ProtocolMessage>) -> Vec<RequestMessage> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|m| match m {
                ProtocolMessage::Request(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn responses(messages: &[ProtocolMessage]) -> Vec<&ResponseMessage> {
        messages
            .iter()
            .filter_map(|m| match m {
                ProtocolMessage::Response(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn events(messages: &[ProtocolMessage]) -> Vec<&EventMessage> {
        messages
            .iter()
            .filter_map(|m| match m {
                ProtocolMessage::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn find<'a>(requests: &'a [RequestMessage], command: &str) -> &'a RequestMessage {
        requests
            .iter()
            .find(|r| r.command == command)
            .unwrap_or_else(|| panic!("no '{}' request in {:?}", command, requests))
    }
}
