//! Mock debug backend for integration testing
//!
//! Speaks just enough DAP over stdio to stand in for either backend:
//! `--role managed` behaves like a managed-language adapter that launches a
//! program, `--role native` like a native adapter that attaches to one.

use std::io::{BufRead, BufReader, Read, Write};

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Managed,
    Native,
}

#[derive(Parser)]
#[command(name = "mock_backend", about = "Scriptable DAP backend for tests")]
struct Args {
    #[arg(long, value_enum, default_value = "managed")]
    role: Role,

    /// Never answer disconnect, to exercise shutdown timeouts
    #[arg(long)]
    ignore_disconnect: bool,
}

fn main() {
    let args = Args::parse();
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    let mut state = MockState::new(args.role, args.ignore_disconnect);

    loop {
        let Some(message) = read_message(&mut reader) else {
            break;
        };
        let Some(outgoing) = state.process_message(&message) else {
            continue;
        };
        for reply in &outgoing {
            send_message(&mut writer, reply);
        }
        if state.exit_requested {
            break;
        }
    }
}

fn read_message<R: BufRead>(reader: &mut R) -> Option<Value> {
    let mut content_length = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let line = line.trim();
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }

    let mut body = vec![0u8; content_length?];
    reader.read_exact(&mut body).ok()?;
    serde_json::from_slice(&body).ok()
}

fn send_message<W: Write>(writer: &mut W, message: &Value) {
    let Ok(body) = serde_json::to_string(message) else {
        return;
    };
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).ok();
    writer.write_all(body.as_bytes()).ok();
    writer.flush().ok();
}

struct MockState {
    role: Role,
    ignore_disconnect: bool,
    seq: i64,
    stop_on_entry: bool,
    current_line: u32,
    exit_requested: bool,
}

impl MockState {
    fn new(role: Role, ignore_disconnect: bool) -> Self {
        Self {
            role,
            ignore_disconnect,
            seq: 1,
            stop_on_entry: false,
            current_line: 1,
            exit_requested: false,
        }
    }

    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn event(&mut self, event: &str, body: Value) -> Value {
        json!({
            "seq": self.next_seq(),
            "type": "event",
            "event": event,
            "body": body
        })
    }

    fn process_message(&mut self, message: &Value) -> Option<Vec<Value>> {
        if message.get("type")?.as_str()? != "request" {
            return None;
        }
        let command = message.get("command")?.as_str()?.to_string();
        let request_seq = message.get("seq")?.as_i64()?;
        let arguments = message.get("arguments").cloned().unwrap_or(json!({}));

        let response_seq = self.next_seq();
        let mut after = Vec::new();
        let (success, body) = match command.as_str() {
            "initialize" => (
                true,
                json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsConditionalBreakpoints": true,
                    "supportsTerminateRequest": true,
                    "supportsBreakpointLocationsRequest": true
                }),
            ),
            "launch" => {
                self.stop_on_entry = arguments
                    .get("stopOnEntry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let program = arguments
                    .get("program")
                    .and_then(Value::as_str)
                    .unwrap_or("main.py")
                    .to_string();
                after.push(self.event(
                    "process",
                    json!({
                        "name": program,
                        "systemProcessId": std::process::id(),
                        "startMethod": "launch"
                    }),
                ));
                (true, json!(null))
            }
            "attach" => {
                after.push(self.event("initialized", json!(null)));
                after.push(self.event(
                    "process",
                    json!({ "name": "attached", "startMethod": "attach" }),
                ));
                (true, json!(null))
            }
            "configurationDone" => {
                if self.role == Role::Managed && self.stop_on_entry {
                    after.push(self.event(
                        "stopped",
                        json!({ "reason": "entry", "threadId": 1, "allThreadsStopped": true }),
                    ));
                }
                (true, json!(null))
            }
            "setBreakpoints" => {
                let path = arguments
                    .get("source")
                    .and_then(|s| s.get("path"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let breakpoints: Vec<Value> = arguments
                    .get("breakpoints")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .enumerate()
                    .map(|(i, bp)| {
                        json!({
                            "id": i + 1,
                            "verified": true,
                            "line": bp.get("line").and_then(Value::as_u64).unwrap_or(1),
                            "source": { "path": path }
                        })
                    })
                    .collect();
                (true, json!({ "breakpoints": breakpoints }))
            }
            "threads" => (true, json!({ "threads": [{ "id": 1, "name": "main" }] })),
            "stackTrace" => (
                true,
                json!({
                    "stackFrames": [{
                        "id": 1,
                        "name": "<module>",
                        "source": { "name": "main.py", "path": "/proj/main.py" },
                        "line": self.current_line,
                        "column": 1
                    }],
                    "totalFrames": 1
                }),
            ),
            "continue" => {
                self.current_line += 1;
                after.push(self.event(
                    "output",
                    json!({ "category": "stdout", "output": "continued\n" }),
                ));
                (true, json!({ "allThreadsContinued": true }))
            }
            "disconnect" | "terminate" => {
                if self.ignore_disconnect {
                    return None;
                }
                after.push(self.event("terminated", json!(null)));
                self.exit_requested = true;
                (true, json!(null))
            }
            _ => (true, json!(null)),
        };

        let mut outgoing = vec![json!({
            "seq": response_seq,
            "type": "response",
            "request_seq": request_seq,
            "success": success,
            "command": command,
            "body": body
        })];
        outgoing.append(&mut after);
        Some(outgoing)
    }
}
