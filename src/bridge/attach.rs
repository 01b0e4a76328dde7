//! Native auto-attach, the configuration-done gate and auto-continue

use serde_json::json;

use crate::dap::{
    AttachArguments, EventMessage, ProcessEventBody, ProtocolMessage, ResponseMessage,
    StackTraceArguments, StackTraceResponseBody, StoppedEventBody,
};

use super::backend::{BackendKind, InternalRequest};
use super::session::{to_arguments, Session, SessionInput};
use super::source::normalize_source_path;

/// Holds back the managed `configurationDone` until the client is done
/// configuring and no breakpoint request is still in flight
#[derive(Debug, Default)]
pub struct ConfigurationGate {
    pub client_configuration_done: bool,
    pub pending_set_breakpoints: usize,
    pub managed_configuration_done_sent: bool,
}

impl ConfigurationGate {
    fn is_open(&self) -> bool {
        self.client_configuration_done
            && self.pending_set_breakpoints == 0
            && !self.managed_configuration_done_sent
    }
}

/// Bookkeeping for a stop on entry the bridge forced at launch
#[derive(Debug, Default)]
pub struct EntryStop {
    pub forced_stop_on_entry: bool,
    pub entry_stop_seen: bool,
    pub pending_auto_continue: bool,
    pub auto_continue_thread_id: Option<i64>,
    /// The forced `stopped` event, shown to the client only if we stay stopped
    pub held_stop: Option<EventMessage>,
    pub entry_frame_checked: bool,
    pub auto_continue_scheduled: bool,
}

impl Session {
    pub(super) fn on_managed_process_event(&mut self, event: &EventMessage) {
        let Some(pid) = event
            .body_as::<ProcessEventBody>()
            .and_then(|b| b.system_process_id)
        else {
            return;
        };
        self.debuggee_pid = Some(pid);

        if !self.auto_attach || self.attach_requested || !self.native.is_available() {
            return;
        }

        self.attach_requested = true;
        self.native.session_started = true;
        tracing::info!(pid, "Attaching native debugger to debuggee");
        self.diagnostics.mark("native attach requested");

        self.native.send_internal(
            InternalRequest::Attach,
            "attach",
            to_arguments(&AttachArguments { pid }),
        );
        self.native
            .send_internal(InternalRequest::ConfigurationDone, "configurationDone", None);
    }

    pub(super) fn on_attach_response(&mut self, response: &ResponseMessage) {
        if response.success {
            self.native.attach_complete = true;
            tracing::info!("Native debugger attached");
            self.diagnostics.mark("native attach completed");
            self.replay_native_breakpoints();
        } else {
            self.log_internal_failure(BackendKind::Native, "attach", response);
            self.native.usable = false;
        }
        self.try_auto_continue();
    }

    /// Send the managed `configurationDone` once the gate opens
    pub(super) fn try_configuration_done(&mut self) {
        if !self.gate.is_open() {
            return;
        }
        self.gate.managed_configuration_done_sent = true;
        tracing::debug!("Configuration complete; releasing managed backend");
        self.managed
            .send_internal(InternalRequest::ConfigurationDone, "configurationDone", None);
        self.diagnostics.mark("configurationDone sent");
        self.try_auto_continue();
    }

    /// Returns true if the event is the forced entry stop and is held back
    pub(super) fn intercept_entry_stop(&mut self, event: &EventMessage) -> bool {
        if !self.entry.forced_stop_on_entry || self.entry.entry_stop_seen {
            return false;
        }
        let Some(body) = event.body_as::<StoppedEventBody>() else {
            return false;
        };
        if body.reason != "entry" {
            return false;
        }
        let Some(thread_id) = body.thread_id else {
            tracing::debug!("Entry stop without a thread id; leaving it to the client");
            return false;
        };

        self.entry.entry_stop_seen = true;
        self.entry.pending_auto_continue = true;
        self.entry.auto_continue_thread_id = Some(thread_id);
        self.entry.held_stop = Some(event.clone());

        let top_frame = StackTraceArguments {
            thread_id,
            start_frame: Some(0),
            levels: Some(1),
        };
        if self
            .managed
            .send_internal(InternalRequest::EntryFrame, "stackTrace", to_arguments(&top_frame))
            .is_none()
        {
            self.entry.entry_frame_checked = true;
        }
        true
    }

    /// A client breakpoint on the entry line keeps the program stopped
    pub(super) fn on_entry_frame_response(&mut self, response: Option<&ResponseMessage>) {
        self.entry.entry_frame_checked = true;

        let top = response
            .filter(|r| r.success)
            .and_then(|r| r.body_as::<StackTraceResponseBody>())
            .and_then(|b| b.stack_frames.into_iter().next());

        let on_breakpoint = top.is_some_and(|frame| {
            frame
                .source
                .and_then(|s| s.path)
                .map(|p| normalize_source_path(&p))
                .and_then(|p| self.breakpoints.client_lines.get(&p))
                .is_some_and(|lines| lines.contains(&frame.line))
        });

        if on_breakpoint {
            tracing::info!("Client breakpoint on entry line; staying stopped");
            self.entry.pending_auto_continue = false;
            if let Some(stop) = self.entry.held_stop.take() {
                self.send_to_client(ProtocolMessage::Event(stop));
            }
            return;
        }
        self.try_auto_continue();
    }

    pub(super) fn auto_continue_ready(&self) -> bool {
        // No attach was ever requested: nothing further will install the cache
        let native_settled = !self.breakpoints.native_breakpoints_present()
            || !self.native.is_available()
            || !self.attach_requested
            || (self.native.attach_complete && self.breakpoints.replay_outstanding == 0);

        self.entry.pending_auto_continue
            && self.entry.entry_frame_checked
            && self.gate.managed_configuration_done_sent
            && !self.shutdown.requested
            && native_settled
    }

    /// Schedule the continue one tick later, behind anything already queued
    pub(super) fn try_auto_continue(&mut self) {
        if self.entry.auto_continue_scheduled || !self.auto_continue_ready() {
            return;
        }
        self.entry.auto_continue_scheduled = true;
        if self.inbox.send(SessionInput::AutoContinue).is_err() {
            self.entry.auto_continue_scheduled = false;
        }
    }

    pub(super) fn run_auto_continue(&mut self) {
        self.entry.auto_continue_scheduled = false;
        if !self.auto_continue_ready() {
            return;
        }
        let Some(thread_id) = self.entry.auto_continue_thread_id else {
            return;
        };

        self.entry.pending_auto_continue = false;
        self.entry.held_stop = None;
        tracing::info!(thread_id, "Resuming past forced entry stop");
        self.managed.send_internal(
            InternalRequest::AutoContinue,
            "continue",
            Some(json!({ "threadId": thread_id })),
        );
        self.diagnostics.mark("auto-continue issued");
    }
}

#[cfg(test)]
mod tests {
    use super::super::session::harness::*;
    use super::*;
    use crate::common::config::Config;
    use crate::dap::RequestMessage;
    use serde_json::Value;

    const PID: u32 = 4242;

    fn process_event(h: &mut Harness) {
        h.event(
            BackendKind::Managed,
            "process",
            Some(json!({ "name": "app.py", "systemProcessId": PID, "startMethod": "launch" })),
        );
    }

    fn entry_stop(h: &mut Harness) {
        h.event(
            BackendKind::Managed,
            "stopped",
            Some(json!({ "reason": "entry", "threadId": 1 })),
        );
    }

    fn frame_at(path: &str, line: u32) -> Option<Value> {
        Some(json!({
            "stackFrames": [{ "id": 1, "name": "<module>", "line": line, "column": 1, "source": { "path": path } }]
        }))
    }

    fn continues(requests: &[RequestMessage]) -> usize {
        requests.iter().filter(|r| r.command == "continue").count()
    }

    /// Launch with a forced entry stop and let the client finish configuring
    fn launched(h: &mut Harness) {
        h.request("launch", Some(json!({ "program": "app.py" })));
        process_event(h);
        h.request("configurationDone", None);
        h.managed_requests();
    }

    #[tokio::test]
    async fn test_attach_requested_exactly_once() {
        let mut h = Harness::with_native();
        process_event(&mut h);
        process_event(&mut h);

        let requests = h.native_requests();
        let commands: Vec<&str> = requests.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["attach", "configurationDone"]);
        assert_eq!(requests[0].arguments, Some(json!({ "pid": PID })));
        assert_eq!(h.session.debuggee_pid, Some(PID));
        assert!(h.session.native.session_started);
        assert!(!h.session.native.attach_complete);

        // The process event itself still reaches the client
        let messages = h.client_messages();
        assert_eq!(events(&messages).len(), 2);
    }

    #[tokio::test]
    async fn test_no_attach_when_disabled() {
        let config = Config {
            auto_attach: false,
            ..Config::default()
        };
        let mut h = Harness::new(config, true);
        process_event(&mut h);
        assert!(h.native_requests().is_empty());
        assert_eq!(h.session.debuggee_pid, Some(PID));
    }

    #[tokio::test]
    async fn test_synthetic_native_responses_are_swallowed() {
        let mut h = Harness::with_native();
        process_event(&mut h);
        h.client_messages();

        let requests = h.native_requests();
        h.reply(BackendKind::Native, find(&requests, "attach"), true, None);
        h.reply(BackendKind::Native, find(&requests, "configurationDone"), true, None);

        assert!(h.client_messages().is_empty());
        assert!(h.session.native.attach_complete);
    }

    #[tokio::test]
    async fn test_failed_attach_marks_native_unusable() {
        let mut h = Harness::with_native();
        process_event(&mut h);
        let requests = h.native_requests();
        h.reply(BackendKind::Native, find(&requests, "attach"), false, None);

        assert!(!h.session.native.is_available());
        assert!(h.client_messages().iter().all(|m| !matches!(m, ProtocolMessage::Response(_))));
    }

    #[tokio::test]
    async fn test_configuration_done_waits_for_breakpoints() {
        let mut h = Harness::managed_only();
        h.request(
            "setBreakpoints",
            Some(json!({ "source": { "path": "/proj/app.py" }, "breakpoints": [{ "line": 3 }] })),
        );
        let set = h.managed_requests();

        h.request("configurationDone", None);
        assert!(h.managed_requests().is_empty());

        h.reply(BackendKind::Managed, &set[0], true, Some(json!({ "breakpoints": [{ "verified": true, "line": 3 }] })));
        let requests = h.managed_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command, "configurationDone");

        // Sent once only
        h.request("configurationDone", None);
        assert!(h.managed_requests().is_empty());
    }

    #[tokio::test]
    async fn test_forced_entry_stop_auto_continues_after_a_tick() {
        let mut h = Harness::with_native();
        launched(&mut h);
        h.client_messages();

        entry_stop(&mut h);
        assert!(events(&h.client_messages()).is_empty());
        let requests = h.managed_requests();
        let top_frame = find(&requests, "stackTrace");

        // Handle the stackTrace response without draining the inbox
        h.session.handle(SessionInput::Backend(
            BackendKind::Managed,
            ProtocolMessage::Response(ResponseMessage {
                seq: 500,
                request_seq: top_frame.seq,
                success: true,
                command: "stackTrace".to_string(),
                message: None,
                body: frame_at("/proj/app.py", 1),
            }),
        ));
        assert_eq!(continues(&h.managed_requests()), 0);

        h.pump();
        let requests = h.managed_requests();
        assert_eq!(continues(&requests), 1);
        assert_eq!(find(&requests, "continue").arguments, Some(json!({ "threadId": 1 })));
        assert!(!h.session.entry.pending_auto_continue);
        assert!(h.client_messages().is_empty());
    }

    #[tokio::test]
    async fn test_client_breakpoint_on_entry_line_suppresses_auto_continue() {
        let mut h = Harness::with_native();
        h.request(
            "setBreakpoints",
            Some(json!({ "source": { "path": "/proj/app.py" }, "breakpoints": [{ "line": 1 }] })),
        );
        let set = h.managed_requests();
        h.reply(BackendKind::Managed, &set[0], true, Some(json!({ "breakpoints": [{ "verified": true, "line": 1 }] })));
        launched(&mut h);
        h.client_messages();

        entry_stop(&mut h);
        let requests = h.managed_requests();
        h.reply(BackendKind::Managed, find(&requests, "stackTrace"), true, frame_at("/proj/app.py", 1));

        assert_eq!(continues(&h.managed_requests()), 0);
        let messages = h.client_messages();
        let stopped = events(&messages);
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].event, "stopped");
    }

    #[tokio::test]
    async fn test_auto_continue_waits_for_native_attach_and_replay() {
        let mut h = Harness::with_native();
        h.request(
            "setBreakpoints",
            Some(json!({ "source": { "path": "/proj/ext.c" }, "breakpoints": [{ "line": 30 }] })),
        );
        launched(&mut h);
        let native = h.native_requests();

        entry_stop(&mut h);
        let requests = h.managed_requests();
        h.reply(BackendKind::Managed, find(&requests, "stackTrace"), true, frame_at("/proj/app.py", 1));
        assert_eq!(continues(&h.managed_requests()), 0);
        h.client_messages();

        h.reply(BackendKind::Native, find(&native, "attach"), true, None);
        assert_eq!(continues(&h.managed_requests()), 0);

        let replays = h.native_requests();
        let replay = find(&replays, "setBreakpoints");
        assert_eq!(replay.arguments.as_ref().unwrap()["source"]["path"], json!("/proj/ext.c"));
        h.reply(
            BackendKind::Native,
            replay,
            true,
            Some(json!({ "breakpoints": [{ "id": 4, "verified": true, "line": 30 }] })),
        );
        assert_eq!(continues(&h.managed_requests()), 1);

        let messages = h.client_messages();
        let changed = events(&messages);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].event, "breakpoint");
    }

    #[tokio::test]
    async fn test_auto_continue_without_debuggee_pid() {
        let mut h = Harness::with_native();
        h.request(
            "setBreakpoints",
            Some(json!({ "source": { "path": "/proj/ext.c" }, "breakpoints": [{ "line": 30 }] })),
        );
        h.request("launch", Some(json!({ "program": "app.py" })));
        h.event(
            BackendKind::Managed,
            "process",
            Some(json!({ "name": "app.py", "startMethod": "launch" })),
        );
        h.request("configurationDone", None);
        h.managed_requests();
        assert!(h.native_requests().iter().all(|r| r.command != "attach"));

        entry_stop(&mut h);
        let requests = h.managed_requests();
        h.reply(BackendKind::Managed, find(&requests, "stackTrace"), true, frame_at("/proj/app.py", 1));
        assert_eq!(continues(&h.managed_requests()), 1);
    }

    #[tokio::test]
    async fn test_unforced_entry_stop_is_forwarded() {
        let mut h = Harness::with_native();
        h.request("launch", Some(json!({ "program": "app.py", "stopOnEntry": true })));
        entry_stop(&mut h);
        let messages = h.client_messages();
        assert_eq!(events(&messages)[0].event, "stopped");
        assert!(h.managed_requests().iter().all(|r| r.command != "stackTrace"));
    }
}
