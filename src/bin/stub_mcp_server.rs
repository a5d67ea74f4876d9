//! Scriptable stdio MCP server for integration tests.
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout. Tools:
//! - `echo`: returns its arguments
//! - `sleep`: waits `ms` milliseconds on its own thread, then returns its
//!   arguments (so responses can arrive out of order)
//! - `pid`: returns `{"pid": <process id>}`
//! - `fail`: answers with a JSON-RPC error
//! - `tool_error`: returns a result flagged `isError`
//! - `crash`: exits immediately without answering
//!
//! Flags:
//! - `--no-handshake`: never answer `initialize`
//! - `--silent`: complete the handshake but never answer tool calls
//! - `--noise`: print a non-JSON line before every response
//! - `--lazy-tools`: omit tools from `initialize`, serve them via `tools/list`
//! - `--spawn-log PATH`: append this process id to PATH at startup

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

#[derive(Debug, Default)]
struct Options {
    no_handshake: bool,
    silent: bool,
    noise: bool,
    lazy_tools: bool,
    spawn_log: Option<PathBuf>,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut opts = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--no-handshake" => opts.no_handshake = true,
                "--silent" => opts.silent = true,
                "--noise" => opts.noise = true,
                "--lazy-tools" => opts.lazy_tools = true,
                "--spawn-log" => {
                    let path = args.next().context("--spawn-log needs a path")?;
                    opts.spawn_log = Some(PathBuf::from(path));
                }
                other => bail!("unknown flag: {other}"),
            }
        }
        Ok(opts)
    }
}

type SharedStdout = Arc<Mutex<io::Stdout>>;

struct Server {
    opts: Options,
    out: SharedStdout,
}

impl Server {
    fn send(&self, message: &Value) -> Result<()> {
        write_line(&self.out, self.opts.noise, message)
    }

    fn handle(&self, request: Value) -> Result<()> {
        // Notifications carry no id and get no response
        let Some(id) = request.get("id").cloned() else {
            return Ok(());
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

        match method {
            "initialize" => {
                if self.opts.no_handshake {
                    return Ok(());
                }
                let mut result = json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": "stub-mcp-server", "version": env!("CARGO_PKG_VERSION")},
                    "capabilities": {"tools": {}},
                });
                if !self.opts.lazy_tools {
                    result["tools"] = tool_list();
                }
                self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
            }
            "tools/list" => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": tool_list()},
            })),
            "tools/call" => {
                if self.opts.silent {
                    return Ok(());
                }
                let name = request["params"]["name"].as_str().unwrap_or_default().to_string();
                let args = request["params"]["arguments"].clone();
                self.call(id, &name, args)
            }
            _ => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("method not found: {method}")},
            })),
        }
    }

    fn call(&self, id: Value, name: &str, args: Value) -> Result<()> {
        match name {
            "echo" => self.send(&json!({"jsonrpc": "2.0", "id": id, "result": args})),
            "pid" => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"pid": std::process::id()},
            })),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                let out = Arc::clone(&self.out);
                let noise = self.opts.noise;
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(ms));
                    let reply = json!({"jsonrpc": "2.0", "id": id, "result": args});
                    if let Err(e) = write_line(&out, noise, &reply) {
                        eprintln!("stub-mcp-server: write failed: {e}");
                    }
                });
                Ok(())
            }
            "fail" => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32000, "message": "requested failure", "data": args},
            })),
            "tool_error" => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "isError": true,
                    "content": [{"type": "text", "text": "tool failed on purpose"}],
                },
            })),
            "crash" => {
                eprintln!("stub-mcp-server: crashing on request");
                std::process::exit(3);
            }
            other => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32602, "message": format!("unknown tool: {other}")},
            })),
        }
    }
}

fn tool_list() -> Value {
    json!([
        {"name": "echo", "description": "Return the arguments", "inputSchema": {"type": "object"}},
        {
            "name": "sleep",
            "description": "Wait, then return the arguments",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}},
                "required": ["ms"]
            }
        },
        {"name": "pid", "description": "Report the process id", "inputSchema": {"type": "object"}},
        {"name": "fail", "description": "Answer with a JSON-RPC error", "inputSchema": {"type": "object"}},
        {"name": "tool_error", "description": "Return an isError result", "inputSchema": {"type": "object"}},
        {"name": "crash", "description": "Exit without answering", "inputSchema": {"type": "object"}},
    ])
}

fn write_line(out: &SharedStdout, noise: bool, message: &Value) -> Result<()> {
    let mut out = out
        .lock()
        .map_err(|e| anyhow::anyhow!("stdout lock poisoned: {e}"))?;
    if noise {
        writeln!(out, "[stub] about to respond")?;
    }
    writeln!(out, "{message}")?;
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Options::parse(std::env::args().skip(1))?;

    if let Some(path) = &opts.spawn_log {
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening spawn log {}", path.display()))?;
        writeln!(log, "{}", std::process::id())?;
    }

    eprintln!("stub-mcp-server started (pid {})", std::process::id());

    let server = Server {
        opts,
        out: Arc::new(Mutex::new(io::stdout())),
    };

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(request) => server.handle(request)?,
            Err(e) => eprintln!("stub-mcp-server: ignoring bad request: {e}"),
        }
    }
    Ok(())
}
