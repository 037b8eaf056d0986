#![forbid(unsafe_code)]

//! `discodex-mock-agent`: scripted stand-in for the Codex CLI.
//!
//! Without arguments it speaks the `codex mcp` stdio protocol; with the
//! `tail` argument it behaves like the interactive CLI and writes replies
//! to a JSONL session log. Behaviour is tuned through environment
//! variables:
//!
//! | Variable                       | Effect                                              |
//! |--------------------------------|-----------------------------------------------------|
//! | `MOCK_AGENT_CONVERSATION_ID`   | token returned by `codex` (default `abc123`)        |
//! | `MOCK_AGENT_REPLY`             | fixed reply text (default `ack: <prompt>`)          |
//! | `MOCK_AGENT_STREAM`            | emit events; value is the delta chunk size          |
//! | `MOCK_AGENT_STRING_IDS`        | echo request ids back as strings                    |
//! | `MOCK_AGENT_SKIP_INITIALIZE`   | never answer `initialize`                           |
//! | `MOCK_AGENT_FAIL_TOOL`         | answer calls to this tool with an error object      |
//! | `MOCK_AGENT_DELAY_MS`          | wait before answering `tools/call`                  |
//! | `MOCK_AGENT_EXIT_AFTER_CALLS`  | exit after answering this many `tools/call`s        |
//! | `MOCK_AGENT_IGNORE_SHUTDOWN`   | ignore `shutdown`, `exit` and EOF                   |
//! | `MOCK_AGENT_GARBAGE`           | print a line of invalid UTF-8 before every reply    |
//! | `MOCK_AGENT_CALL_LOG`          | append one JSON line per received message           |
//! | `MOCK_AGENT_SESSION_ROOT`      | session log directory for `tail` mode               |

use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

const DEFAULT_CONVERSATION_ID: &str = "abc123";

fn main() {
    let _ = writeln!(io::stderr(), "mock-agent: pid {} starting", process::id());
    let code = match env::args().nth(1).as_deref() {
        Some("tail") => run_tail(),
        _ => run_mcp(),
    };
    process::exit(code);
}

fn flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| {
        let v = v.trim().to_ascii_lowercase();
        !v.is_empty() && v != "0" && v != "false"
    })
}

fn number(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn log_call(entry: &Value) {
    let Ok(path) = env::var("MOCK_AGENT_CALL_LOG") else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{entry}");
    }
}

fn emit(value: &Value) {
    let mut out = io::stdout().lock();
    if flag("MOCK_AGENT_GARBAGE") {
        let _ = out.write_all(b"garbage \xff\xfe bytes\n");
    }
    let _ = writeln!(out, "{value}").and_then(|()| out.flush());
}

// ── MCP mode ─────────────────────────────────────────────────────────────────

fn run_mcp() -> i32 {
    // Non-protocol noise on stdout, as real agents sometimes print.
    println!("mock-agent ready");

    let exit_after = number("MOCK_AGENT_EXIT_AFTER_CALLS");
    let ignore_shutdown = flag("MOCK_AGENT_IGNORE_SHUTDOWN");
    let mut calls: u64 = 0;

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let id = message.get("id").cloned();
        log_call(&json!({
            "pid": process::id(),
            "method": method,
            "params": message.get("params").cloned().unwrap_or(Value::Null),
        }));

        match (method, id) {
            ("initialize", Some(id)) => {
                if !flag("MOCK_AGENT_SKIP_INITIALIZE") {
                    respond(&id, json!({
                        "protocolVersion": "2024-05-31",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "discodex-mock-agent", "version": "0" },
                    }));
                }
            }
            ("shutdown", Some(id)) => {
                if !ignore_shutdown {
                    respond(&id, json!({}));
                }
            }
            ("exit", None) => {
                if !ignore_shutdown {
                    return 0;
                }
            }
            ("tools/call", Some(id)) => {
                handle_tool_call(&id, message.get("params").unwrap_or(&Value::Null));
                calls += 1;
                if exit_after.is_some_and(|n| calls >= n) {
                    return 0;
                }
            }
            (_, Some(id)) => error_response(&id, -32601, "method not found"),
            (_, None) => {}
        }
    }

    if ignore_shutdown {
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
    0
}

fn wire_id(id: &Value) -> Value {
    if flag("MOCK_AGENT_STRING_IDS") {
        Value::String(id.to_string().trim_matches('"').to_owned())
    } else {
        id.clone()
    }
}

fn respond(id: &Value, result: Value) {
    emit(&json!({ "jsonrpc": "2.0", "id": wire_id(id), "result": result }));
}

fn error_response(id: &Value, code: i64, message: &str) {
    emit(&json!({
        "jsonrpc": "2.0",
        "id": wire_id(id),
        "error": { "code": code, "message": message },
    }));
}

fn event(id: &Value, msg: Value) {
    emit(&json!({
        "jsonrpc": "2.0",
        "method": "codex/event",
        "params": { "_meta": { "requestId": wire_id(id) }, "msg": msg },
    }));
}

fn handle_tool_call(id: &Value, params: &Value) {
    let tool = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);
    let prompt = args.get("prompt").and_then(Value::as_str).unwrap_or("");
    let expected = env::var("MOCK_AGENT_CONVERSATION_ID")
        .unwrap_or_else(|_| DEFAULT_CONVERSATION_ID.to_owned());

    if let Some(delay) = number("MOCK_AGENT_DELAY_MS") {
        thread::sleep(Duration::from_millis(delay));
    }
    if env::var("MOCK_AGENT_FAIL_TOOL").is_ok_and(|t| t == tool) {
        error_response(id, -32000, "tool failed");
        return;
    }

    let starts_conversation = match tool {
        "codex" => true,
        "codex-reply" => {
            let given = args.get("conversationId").and_then(Value::as_str);
            if given != Some(expected.as_str()) {
                error_response(id, -32602, "unknown conversation");
                return;
            }
            false
        }
        _ => {
            error_response(id, -32602, "unknown tool");
            return;
        }
    };

    let reply = env::var("MOCK_AGENT_REPLY").unwrap_or_else(|_| format!("ack: {prompt}"));
    if let Some(chunk) = env::var("MOCK_AGENT_STREAM").ok().map(|v| v.trim().parse().unwrap_or(3)) {
        stream_events(id, &reply, chunk);
    }

    let mut body = json!({ "content": [{ "type": "text", "text": reply }] });
    if starts_conversation {
        body["conversationId"] = Value::String(expected);
    }
    respond(id, body);
}

fn stream_events(id: &Value, reply: &str, chunk: usize) {
    event(id, json!({ "type": "task_started" }));
    event(id, json!({ "type": "agent_reasoning_delta", "delta": "Looking" }));
    event(id, json!({ "type": "agent_reasoning_delta", "delta": " around" }));
    event(id, json!({ "type": "agent_reasoning", "text": "Looking around" }));

    // Stray event for a request nobody sent.
    event(&json!(999_999), json!({ "type": "agent_message_delta", "delta": "stray" }));

    let chars: Vec<char> = reply.chars().collect();
    for piece in chars.chunks(chunk.max(1)) {
        let delta: String = piece.iter().collect();
        event(id, json!({ "type": "agent_message_delta", "delta": delta }));
    }
    event(id, json!({ "type": "agent_message", "message": reply }));
    event(id, json!({ "type": "token_count", "input_tokens": 1, "output_tokens": 1 }));
    event(id, json!({ "type": "task_complete" }));
}

// ── Tail mode ────────────────────────────────────────────────────────────────

fn run_tail() -> i32 {
    let root = env::var("MOCK_AGENT_SESSION_ROOT").map_or_else(|_| PathBuf::from("."), PathBuf::from);
    let dir = root.join("2024").join("05");
    if let Err(err) = fs::create_dir_all(&dir) {
        let _ = writeln!(io::stderr(), "mock-agent: cannot create {}: {err}", dir.display());
        return 1;
    }
    let path = dir.join(format!("rollout-{}.jsonl", process::id()));
    let Ok(mut log) = OpenOptions::new().create(true).append(true).open(&path) else {
        let _ = writeln!(io::stderr(), "mock-agent: cannot open {}", path.display());
        return 1;
    };
    let _ = writeln!(log, "{}", json!({ "type": "session_meta", "id": process::id() }));
    log_call(&json!({ "mode": "tail", "pid": process::id(), "log": path }));
    println!("mock-agent interactive session at {}", path.display());

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        let reply = env::var("MOCK_AGENT_REPLY").unwrap_or_else(|_| format!("ack: {prompt}"));
        let _ = writeln!(log, "{}", json!({ "type": "user_message", "message": prompt }));
        let _ = writeln!(
            log,
            "{}",
            json!({ "msg": { "type": "agent_message", "message": reply } })
        );
        let _ = log.flush();
    }
    0
}
