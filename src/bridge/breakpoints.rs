//! Breakpoint request splitting and merging
//!
//! A client `setBreakpoints` request becomes a pending aggregate keyed by
//! the client's sequence number. Each backend sub-request fills its slots in
//! the aggregate; when nothing is outstanding the aggregate is merged into
//! exactly one response in the original breakpoint order.
//!
//! Native breakpoints requested before the native backend attaches are kept
//! in the JIT cache and replayed once the attach completes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{json, Value};

use crate::dap::{
    Breakpoint, BreakpointLocationsArguments, Command, RequestMessage, ResponseMessage,
    SetBreakpointsArguments, Source, SourceBreakpoint,
};

use super::backend::{BackendKind, InternalRequest, PendingPart};
use super::session::{to_arguments, Session};
use super::source::{normalize_source_path, SourceKind};

pub const NATIVE_UNAVAILABLE: &str =
    "Native debugger is not available; breakpoint cannot be set in native code";
pub const NATIVE_NOT_READY: &str =
    "Native debugger has not attached yet; breakpoint will be set once it attaches";
pub const NO_BACKEND_RESPONSE: &str = "Unverified: no response from debug backend";

/// One client `setBreakpoints` request awaiting its backend parts
#[derive(Debug)]
pub struct PendingAggregate {
    pub source: Source,
    pub requested: Vec<SourceBreakpoint>,
    pub results: Vec<Option<Value>>,
    pub outstanding: usize,
    pub success: bool,
    pub message: Option<String>,
}

impl PendingAggregate {
    fn new(source: Source, requested: Vec<SourceBreakpoint>) -> Self {
        let results = vec![None; requested.len()];
        Self {
            source,
            requested,
            results,
            outstanding: 0,
            success: true,
            message: None,
        }
    }

    fn fill_unverified(&mut self, message: &str) {
        for (slot, bp) in self.results.iter_mut().zip(&self.requested) {
            *slot = to_arguments(&Breakpoint::unverified(bp.line, Some(message)));
        }
    }

    /// Copy a backend's answers into the slots it owns
    fn apply(&mut self, indices: &[usize], items: &[Value]) {
        for (i, &idx) in indices.iter().enumerate() {
            let Some(bp) = self.requested.get(idx) else {
                continue;
            };
            self.results[idx] = match items.get(i) {
                Some(item) => Some(item.clone()),
                None => to_arguments(&Breakpoint::unverified(bp.line, None)),
            };
        }
    }

    fn into_breakpoints(self) -> Vec<Value> {
        self.results
            .into_iter()
            .zip(self.requested)
            .map(|(slot, bp)| {
                slot.or_else(|| to_arguments(&Breakpoint::unverified(bp.line, Some(NO_BACKEND_RESPONSE))))
                    .unwrap_or(Value::Null)
            })
            .collect()
    }
}

/// Breakpoint bookkeeping for one session
#[derive(Debug, Default)]
pub struct BreakpointBook {
    pub aggregates: HashMap<i64, PendingAggregate>,
    /// Native path -> lines most recently requested, replayed on attach
    pub jit_cache: BTreeMap<String, BTreeSet<u32>>,
    /// Every path -> lines the client most recently asked for
    pub client_lines: HashMap<String, BTreeSet<u32>>,
    pub replay_outstanding: usize,
}

impl BreakpointBook {
    pub fn native_breakpoints_present(&self) -> bool {
        self.jit_cache.values().any(|lines| !lines.is_empty())
    }

    fn cache_native(&mut self, path: &str, requested: &[SourceBreakpoint]) {
        self.jit_cache.insert(
            path.to_string(),
            requested.iter().map(|bp| bp.line).collect(),
        );
    }
}

fn breakpoint_items(response: &ResponseMessage) -> Vec<Value> {
    response
        .body
        .as_ref()
        .and_then(|b| b.get("breakpoints"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

impl Session {
    pub(super) fn split_set_breakpoints(&mut self, request: RequestMessage) {
        let client_seq = request.seq;
        let Some(args) = request.arguments_as::<SetBreakpointsArguments>() else {
            tracing::warn!(client_seq, "Malformed setBreakpoints arguments");
            self.respond_error(client_seq, "setBreakpoints", "Invalid setBreakpoints arguments");
            self.finish_breakpoint_request();
            return;
        };

        let requested = args.requested();
        let path = args.source.path.as_deref().map(normalize_source_path);
        let kind = match &path {
            Some(p) => {
                self.breakpoints
                    .client_lines
                    .insert(p.clone(), requested.iter().map(|bp| bp.line).collect());
                self.classifier.classify(p)
            }
            None => SourceKind::Unknown,
        };
        tracing::debug!(client_seq, path = ?path, ?kind, count = requested.len(), "Splitting setBreakpoints");

        let indices: Vec<usize> = (0..requested.len()).collect();
        let mut aggregate = PendingAggregate::new(args.source.clone(), requested);

        match (kind, path) {
            (SourceKind::Native, Some(path)) => {
                if !self.native.is_available() {
                    aggregate.fill_unverified(NATIVE_UNAVAILABLE);
                } else if !self.native.session_started {
                    self.breakpoints.cache_native(&path, &aggregate.requested);
                    aggregate.fill_unverified(NATIVE_NOT_READY);
                } else {
                    self.breakpoints.cache_native(&path, &aggregate.requested);
                    let mut arguments = request.arguments.clone().unwrap_or(Value::Null);
                    if let Some(source) = arguments.get_mut("source") {
                        source["path"] = Value::String(path);
                    }
                    match self.native.send_request("setBreakpoints", Some(arguments)) {
                        Some(seq) => {
                            self.native
                                .pending_set_breakpoints
                                .insert(seq, PendingPart { client_seq, indices });
                            aggregate.outstanding += 1;
                        }
                        None => aggregate.fill_unverified(NATIVE_UNAVAILABLE),
                    }
                }
            }
            _ => match self.managed.send_request("setBreakpoints", request.arguments) {
                Some(seq) => {
                    self.managed
                        .pending_set_breakpoints
                        .insert(seq, PendingPart { client_seq, indices });
                    aggregate.outstanding += 1;
                }
                None => {
                    aggregate.success = false;
                    aggregate.message = Some("managed debug backend is not available".to_string());
                }
            },
        }

        let outstanding = aggregate.outstanding;
        self.breakpoints.aggregates.insert(client_seq, aggregate);
        if outstanding == 0 {
            self.merge_breakpoints(client_seq);
        }
    }

    pub(super) fn handle_breakpoints_part(
        &mut self,
        kind: BackendKind,
        part: PendingPart,
        response: &ResponseMessage,
    ) {
        let Some(aggregate) = self.breakpoints.aggregates.get_mut(&part.client_seq) else {
            tracing::debug!(client_seq = part.client_seq, "Breakpoint part for a merged request");
            return;
        };

        if !response.success {
            tracing::warn!(
                backend = %kind,
                message = response.message.as_deref().unwrap_or(""),
                "Backend rejected setBreakpoints"
            );
            aggregate.success = false;
            aggregate.message = response.message.clone();
        }
        aggregate.apply(&part.indices, &breakpoint_items(response));
        aggregate.outstanding = aggregate.outstanding.saturating_sub(1);

        if aggregate.outstanding == 0 {
            self.merge_breakpoints(part.client_seq);
        }
    }

    /// The backend owning this part is gone; its slots keep the placeholder
    pub(super) fn abandon_breakpoints_part(&mut self, part: PendingPart) {
        let Some(aggregate) = self.breakpoints.aggregates.get_mut(&part.client_seq) else {
            return;
        };
        aggregate.outstanding = aggregate.outstanding.saturating_sub(1);
        if aggregate.outstanding == 0 {
            self.merge_breakpoints(part.client_seq);
        }
    }

    /// Emit the single aggregate response; removal guarantees at-most-once
    fn merge_breakpoints(&mut self, client_seq: i64) {
        let Some(aggregate) = self.breakpoints.aggregates.remove(&client_seq) else {
            return;
        };
        let success = aggregate.success;
        let message = aggregate.message.clone();
        let source = aggregate.source.path.clone().unwrap_or_default();
        let breakpoints = aggregate.into_breakpoints();
        tracing::debug!(client_seq, source = %source, count = breakpoints.len(), "Merged setBreakpoints");

        self.respond(ResponseMessage {
            seq: 0,
            request_seq: client_seq,
            success,
            command: Command::SetBreakpoints.as_str().to_string(),
            message,
            body: Some(json!({ "breakpoints": breakpoints })),
        });
        self.finish_breakpoint_request();
    }

    fn finish_breakpoint_request(&mut self) {
        self.gate.pending_set_breakpoints = self.gate.pending_set_breakpoints.saturating_sub(1);
        self.try_configuration_done();
    }

    pub(super) fn route_breakpoint_locations(&mut self, request: RequestMessage) {
        let Some(args) = request.arguments_as::<BreakpointLocationsArguments>() else {
            return self.forward_to(BackendKind::Managed, request, Command::BreakpointLocations);
        };
        let kind = args
            .source
            .path
            .as_deref()
            .map(|p| self.classifier.classify(&normalize_source_path(p)))
            .unwrap_or(SourceKind::Unknown);

        if kind != SourceKind::Native {
            return self.forward_to(BackendKind::Managed, request, Command::BreakpointLocations);
        }
        if self.native.is_available() && self.native.session_started {
            return self.forward_to(BackendKind::Native, request, Command::BreakpointLocations);
        }
        self.respond_ok(
            request.seq,
            Command::BreakpointLocations.as_str(),
            Some(json!({ "breakpoints": [{ "line": args.line }] })),
        );
    }

    /// Reissue every cached native breakpoint set after attach completes
    pub(super) fn replay_native_breakpoints(&mut self) {
        let cached: Vec<(String, Vec<u32>)> = self
            .breakpoints
            .jit_cache
            .iter()
            .filter(|(_, lines)| !lines.is_empty())
            .map(|(path, lines)| (path.clone(), lines.iter().copied().collect()))
            .collect();

        for (path, lines) in cached {
            let args = SetBreakpointsArguments {
                source: Source {
                    name: std::path::Path::new(&path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned()),
                    path: Some(path.clone()),
                    source_reference: None,
                },
                breakpoints: Some(lines.iter().map(|&l| SourceBreakpoint::at(l)).collect()),
                lines: Some(lines.clone()),
            };
            tracing::info!(path = %path, ?lines, "Replaying native breakpoints");
            let purpose = InternalRequest::ReplayBreakpoints { path, lines };
            if self
                .native
                .send_internal(purpose, "setBreakpoints", to_arguments(&args))
                .is_some()
            {
                self.breakpoints.replay_outstanding += 1;
            }
        }
    }

    /// Nobody waits on a replay, so its result becomes `breakpoint` events
    pub(super) fn on_replay_response(
        &mut self,
        path: &str,
        lines: &[u32],
        response: Option<&ResponseMessage>,
    ) {
        self.breakpoints.replay_outstanding = self.breakpoints.replay_outstanding.saturating_sub(1);

        let items = match response {
            Some(r) if r.success => breakpoint_items(r),
            Some(r) => {
                self.log_internal_failure(BackendKind::Native, "setBreakpoints", r);
                Vec::new()
            }
            None => Vec::new(),
        };

        if items.is_empty() {
            for &line in lines {
                let mut bp = Breakpoint::unverified(line, Some(NO_BACKEND_RESPONSE));
                bp.source = Some(Source {
                    path: Some(path.to_string()),
                    ..Source::default()
                });
                self.emit_event(
                    "breakpoint",
                    Some(json!({ "reason": "changed", "breakpoint": to_arguments(&bp) })),
                );
            }
        } else {
            for item in items {
                self.emit_event(
                    "breakpoint",
                    Some(json!({ "reason": "changed", "breakpoint": item })),
                );
            }
        }

        self.try_auto_continue();
    }
}
