//! Client request routing
//!
//! Translates each client request into backend traffic: forwarded to one
//! backend, fanned out to both, split by source, or answered locally.

use serde_json::Value;

use crate::dap::{Command, LaunchArguments, RequestMessage};

use super::backend::{BackendKind, InternalRequest};
use super::session::Session;

impl Session {
    pub(super) fn handle_client_request(&mut self, request: RequestMessage) {
        let command = Command::parse(&request.command);
        tracing::debug!(client_seq = request.seq, %command, "Client request");

        match command {
            Command::Initialize => self.fan_out_initialize(request),
            Command::Launch => self.forward_launch(request),
            Command::Attach => self.forward_to(BackendKind::Managed, request, command),
            Command::BreakpointLocations => self.route_breakpoint_locations(request),
            Command::SetBreakpoints => {
                self.gate.pending_set_breakpoints += 1;
                self.split_set_breakpoints(request);
            }
            Command::ConfigurationDone => {
                self.gate.client_configuration_done = true;
                self.try_configuration_done();
                // The bridge owns signalling the managed backend, so the
                // client is answered without waiting on the gate
                self.respond_ok(request.seq, command.as_str(), None);
            }
            Command::Disconnect | Command::Terminate => {
                self.handle_shutdown_request(request, command)
            }
            _ => {
                let target = self.route_target(&command);
                self.forward_to(target, request, command);
            }
        }
    }

    /// Interactive commands follow the backend that last stopped
    pub(super) fn route_target(&self, command: &Command) -> BackendKind {
        if command.is_interactive()
            && self.active_backend == BackendKind::Native
            && self.native.is_available()
        {
            BackendKind::Native
        } else {
            BackendKind::Managed
        }
    }

    /// Forward verbatim, re-sequenced into the target backend's number space
    pub(super) fn forward_to(
        &mut self,
        kind: BackendKind,
        request: RequestMessage,
        command: Command,
    ) {
        let client_seq = request.seq;
        if self
            .backend_mut(kind)
            .forward(client_seq, command.clone(), request.arguments)
            .is_none()
        {
            let message = format!("{} debug backend is not available", kind);
            tracing::warn!(client_seq, %command, "{}", message);
            self.respond_error(client_seq, command.as_str(), &message);
        }
    }

    fn fan_out_initialize(&mut self, request: RequestMessage) {
        if self.native.is_available() {
            self.native.send_internal(
                InternalRequest::Initialize,
                "initialize",
                request.arguments.clone(),
            );
        }
        self.forward_to(BackendKind::Managed, request, Command::Initialize);
    }

    /// Force a stop on entry so native breakpoints land before user code runs
    fn forward_launch(&mut self, mut request: RequestMessage) {
        let requested = request
            .arguments_as::<LaunchArguments>()
            .and_then(|a| a.stop_on_entry)
            .unwrap_or(false);

        if self.auto_attach && self.native.is_available() && !requested {
            if let Some(Value::Object(args)) = request.arguments.as_mut() {
                args.insert("stopOnEntry".to_string(), Value::Bool(true));
                self.entry.forced_stop_on_entry = true;
                tracing::info!("Forcing stop on entry for native auto-attach");
            }
        }

        self.forward_to(BackendKind::Managed, request, Command::Launch);
    }
}
