//! Terminate/disconnect sequencing
//!
//! `idle -> detaching-native -> terminating-managed ->
//! awaiting-client-disconnect -> closed`. Every step that waits on a backend
//! is bounded by a timer, and a backend exiting counts as its ack.

use serde_json::{json, Map, Value};

use crate::dap::{Command, DisconnectArguments, RequestMessage, ResponseMessage};

use super::backend::{kill_process, InternalRequest};
use super::session::Session;
use super::timers::TimerKind;

pub const SHUTDOWN_IN_PROGRESS: &str = "Shutdown already in progress";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPhase {
    #[default]
    Idle,
    DetachingNative,
    TerminatingManaged,
    AwaitingClientDisconnect,
    Closed,
}

/// The client request that started the shutdown
#[derive(Debug, Clone)]
pub struct OriginalRequest {
    pub seq: i64,
    pub command: Command,
    pub arguments: Option<Value>,
}

#[derive(Debug, Default)]
pub struct ShutdownState {
    pub phase: ShutdownPhase,
    pub requested: bool,
    pub native_acked: bool,
    pub managed_acked: bool,
    pub client_closed: bool,
    pub terminated_event_seen: bool,
    pub exited_event_seen: bool,
    pub awaiting_disconnect: bool,
    pub original: Option<OriginalRequest>,
    pub terminate_debuggee: bool,
}

impl ShutdownState {
    pub fn enter_closed(&mut self) {
        self.phase = ShutdownPhase::Closed;
        self.awaiting_disconnect = false;
    }
}

impl Session {
    pub(super) fn handle_shutdown_request(&mut self, request: RequestMessage, command: Command) {
        if self.shutdown.awaiting_disconnect && command == Command::Disconnect {
            tracing::debug!("Client disconnected after shutdown");
            self.timers.cancel(TimerKind::DisconnectWait);
            self.respond_ok(request.seq, command.as_str(), None);
            self.close("client disconnected");
            return;
        }

        if self.shutdown.requested {
            tracing::debug!(client_seq = request.seq, %command, "Duplicate shutdown request");
            let mut response = ResponseMessage::ok(request.seq, command.as_str(), None);
            response.message = Some(SHUTDOWN_IN_PROGRESS.to_string());
            self.respond(response);
            return;
        }

        self.begin_shutdown(Some(OriginalRequest {
            seq: request.seq,
            command,
            arguments: request.arguments,
        }));
    }

    pub(super) fn begin_shutdown(&mut self, original: Option<OriginalRequest>) {
        let terminate_debuggee = original
            .as_ref()
            .and_then(|o| o.arguments.as_ref())
            .and_then(|a| serde_json::from_value::<DisconnectArguments>(a.clone()).ok())
            .and_then(|a| a.terminate_debuggee)
            .unwrap_or(true);

        tracing::info!(
            command = original.as_ref().map(|o| o.command.as_str()).unwrap_or("<client closed>"),
            terminate_debuggee,
            "Shutdown requested"
        );
        self.shutdown.requested = true;
        self.shutdown.terminate_debuggee = terminate_debuggee;
        self.shutdown.original = original;
        self.diagnostics.mark("shutdown requested");

        if self.native.session_started && self.native.is_available() {
            self.shutdown.phase = ShutdownPhase::DetachingNative;
            // Detaching must never take the traced process down with it
            let args = json!({ "restart": false, "terminateDebuggee": false });
            if self
                .native
                .send_internal(InternalRequest::Detach, "disconnect", Some(args))
                .is_some()
            {
                self.timers
                    .arm(TimerKind::NativeDetach, self.timeouts.native_detach());
                return;
            }
            self.ack_native_detach();
        } else {
            self.shutdown.native_acked = true;
            self.start_managed_terminate();
        }
    }

    fn start_managed_terminate(&mut self) {
        self.shutdown.phase = ShutdownPhase::TerminatingManaged;
        self.diagnostics.mark("terminating managed backend");

        let mut args = self
            .shutdown
            .original
            .as_ref()
            .and_then(|o| o.arguments.as_ref())
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new);
        args.insert(
            "terminateDebuggee".to_string(),
            Value::Bool(self.shutdown.terminate_debuggee),
        );

        let sent = self
            .managed
            .send_internal(InternalRequest::Terminate, "disconnect", Some(Value::Object(args)))
            .is_some();
        if sent {
            self.timers
                .arm(TimerKind::ManagedTerminate, self.timeouts.managed_terminate());
        } else {
            self.ack_managed_terminate();
        }
    }

    pub(super) fn ack_native_detach(&mut self) {
        if self.shutdown.phase != ShutdownPhase::DetachingNative || self.shutdown.native_acked {
            return;
        }
        self.shutdown.native_acked = true;
        self.timers.cancel(TimerKind::NativeDetach);
        tracing::debug!("Native backend detached");
        self.diagnostics.mark("native detached");
        self.start_managed_terminate();
    }

    pub(super) fn ack_managed_terminate(&mut self) {
        if self.shutdown.phase != ShutdownPhase::TerminatingManaged || self.shutdown.managed_acked {
            return;
        }
        self.shutdown.managed_acked = true;
        self.timers.cancel(TimerKind::ManagedTerminate);
        tracing::debug!("Managed backend terminated");
        self.diagnostics.mark("managed terminated");
        self.finish_backends();
    }

    pub(super) fn on_native_detach_timeout(&mut self) {
        tracing::warn!(
            timeout_ms = self.timeouts.native_detach_ms,
            "Native backend did not acknowledge detach"
        );
        self.ack_native_detach();
    }

    pub(super) fn on_managed_terminate_timeout(&mut self) {
        tracing::warn!(
            timeout_ms = self.timeouts.managed_terminate_ms,
            "Managed backend did not acknowledge disconnect"
        );
        if self.shutdown.terminate_debuggee && !self.debuggee_killed {
            if let Some(pid) = self.debuggee_pid {
                self.debuggee_killed = true;
                match kill_process(pid) {
                    Ok(()) => tracing::info!(pid, "Force-killed debuggee"),
                    Err(e) => tracing::warn!(pid, "Failed to kill debuggee: {}", e),
                }
            }
        }
        self.ack_managed_terminate();
    }

    /// Both backends are done: answer the client and wind down
    fn finish_backends(&mut self) {
        self.shutdown.phase = ShutdownPhase::AwaitingClientDisconnect;
        let original = self.shutdown.original.clone();

        if let Some(original) = &original {
            self.respond_ok(original.seq, original.command.as_str(), None);
        }
        if !self.shutdown.exited_event_seen {
            self.shutdown.exited_event_seen = true;
            self.emit_event("exited", Some(json!({ "exitCode": 0 })));
        }
        if !self.shutdown.terminated_event_seen {
            self.shutdown.terminated_event_seen = true;
            self.emit_event("terminated", None);
        }

        if self.shutdown.client_closed {
            self.close("client closed");
        } else if original.is_some_and(|o| o.command == Command::Disconnect) {
            self.close("disconnect complete");
        } else {
            self.shutdown.awaiting_disconnect = true;
            self.timers
                .arm(TimerKind::DisconnectWait, self.timeouts.disconnect_wait());
        }
    }

    /// The client stream ended without a disconnect request
    pub(super) fn on_client_closed(&mut self) {
        if self.shutdown.awaiting_disconnect {
            self.timers.cancel(TimerKind::DisconnectWait);
            self.close("client closed");
        } else if !self.shutdown.requested {
            self.begin_shutdown(None);
        }
    }
}
