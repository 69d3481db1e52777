//! Child-process sandbox for bundle-backed job handlers.
//!
//! A generated shim loads the bundle entry inside a capability-gated
//! module loader and speaks a JSONL protocol with the host over stdio:
//! the host sends one start line (parameters, run view, export name,
//! capabilities), the child emits `log` / `update` / `secret` /
//! `result` / `error` operations, and the host answers secret requests
//! on stdin. Wall-clock timeouts kill the child; abnormal exits are
//! surfaced with their code or signal.

use crate::bundle::manifest::BundleManifest;
use crate::error::{Error, Result};
use crate::types::{JobRuntimeKind, SecretRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Host-side callbacks a sandboxed handler can reach.
#[async_trait::async_trait]
pub trait SandboxHost: Send + Sync {
    /// Persist a partial run update (heartbeat + fields).
    async fn update(&self, patch: Value) -> Result<()>;

    fn resolve_secret(&self, secret: &SecretRef) -> Option<String>;
}

/// Captured log line from the sandboxed handler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxLogEntry {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub at: DateTime<Utc>,
}

/// Handler failure reported from inside the sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandlerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// OS-level counters for the sandbox child, where available
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cpu_us: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_cpu_us: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rss_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voluntary_context_switches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub involuntary_context_switches: Option<u64>,
}

/// Outcome of one sandbox execution
#[derive(Debug, Clone)]
pub struct SandboxExecutionResult {
    pub task_id: String,
    pub result: Option<Value>,
    pub error: Option<SandboxHandlerError>,
    pub logs: Vec<SandboxLogEntry>,
    pub truncated_log_count: usize,
    pub duration_ms: u64,
    pub resource_usage: Option<ResourceUsage>,
}

/// What to execute and with which inputs
pub struct SandboxLaunch<'a> {
    pub runtime: JobRuntimeKind,
    pub bundle_dir: &'a Path,
    pub entry_file: &'a Path,
    pub manifest: &'a BundleManifest,
    pub export_name: Option<String>,
    pub parameters: Value,
    /// Serialized view of the job run handed to the handler
    pub run: Value,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub node_binary: String,
    pub python_binary: String,
    pub docker_binary: String,
    /// Image used for `docker` runtime bundles
    pub docker_image: String,
    pub max_log_lines: usize,
    /// Test hook: replaces the spawned command entirely
    pub command_override: Option<Vec<String>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            python_binary: "python3".to_string(),
            docker_binary: "docker".to_string(),
            docker_image: "node:20-slim".to_string(),
            max_log_lines: 1_000,
            command_override: None,
        }
    }
}

/// Executes bundle handlers in capability-gated child processes.
pub struct SandboxRunner {
    config: SandboxConfig,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum ChildOp {
    Log {
        message: String,
        #[serde(default)]
        meta: Option<Value>,
    },
    Update {
        patch: Value,
    },
    Secret {
        id: u64,
        secret: SecretRef,
    },
    Result {
        #[serde(default)]
        value: Value,
    },
    Error {
        message: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        stack: Option<String>,
    },
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub async fn execute(
        &self,
        launch: SandboxLaunch<'_>,
        host: &dyn SandboxHost,
    ) -> Result<SandboxExecutionResult> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let shim = self.write_shim(launch.runtime, &task_id)?;

        let mut command = self.build_command(&launch, shim.as_deref())?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .current_dir(launch.bundle_dir);

        let started = Instant::now();
        let usage_before = rusage_children();

        let mut child = command.spawn().map_err(|e| {
            Error::BundleResolution {
                binding: launch.manifest.name.clone(),
                reason: format!("spawning sandbox runtime: {e}"),
            }
        })?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let start_message = json!({
            "entry": launch.entry_file,
            "export": launch.export_name,
            "parameters": launch.parameters,
            "run": launch.run,
            "capabilities": launch.manifest.capabilities,
            "timeoutMs": launch.timeout_ms,
            "taskId": task_id,
        });
        let mut start_line = serde_json::to_string(&start_message)
            .map_err(|e| Error::store(e.to_string()))?;
        start_line.push('\n');
        stdin
            .write_all(start_line.as_bytes())
            .await
            .map_err(Error::Io)?;
        stdin.flush().await.map_err(Error::Io)?;

        let mut logs: Vec<SandboxLogEntry> = Vec::new();
        let mut truncated = 0usize;
        let mut result: Option<Value> = None;
        let mut handler_error: Option<SandboxHandlerError> = None;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stderr_open = true;
        let deadline = tokio::time::sleep(Duration::from_millis(launch.timeout_ms));
        tokio::pin!(deadline);

        let max_logs = self.config.max_log_lines;
        let mut push_log = |logs: &mut Vec<SandboxLogEntry>,
                            truncated: &mut usize,
                            message: String,
                            meta: Option<Value>| {
            if logs.len() < max_logs {
                logs.push(SandboxLogEntry {
                    message,
                    meta,
                    at: Utc::now(),
                });
            } else {
                *truncated += 1;
            }
        };

        let status = loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line.map_err(Error::Io)? {
                        Some(line) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<ChildOp>(&line) {
                                Ok(ChildOp::Log { message, meta }) => {
                                    push_log(&mut logs, &mut truncated, message, meta);
                                }
                                Ok(ChildOp::Update { patch }) => {
                                    host.update(patch).await?;
                                }
                                Ok(ChildOp::Secret { id, secret }) => {
                                    let value = host.resolve_secret(&secret);
                                    let mut reply = serde_json::to_string(&json!({
                                        "id": id,
                                        "value": value,
                                    }))
                                    .map_err(|e| Error::store(e.to_string()))?;
                                    reply.push('\n');
                                    stdin.write_all(reply.as_bytes()).await.map_err(Error::Io)?;
                                    stdin.flush().await.map_err(Error::Io)?;
                                }
                                Ok(ChildOp::Result { value }) => {
                                    result = Some(value);
                                }
                                Ok(ChildOp::Error { message, name, stack }) => {
                                    handler_error = Some(SandboxHandlerError { message, name, stack });
                                }
                                Err(_) => {
                                    // Plain prints from the handler count as logs.
                                    push_log(&mut logs, &mut truncated, line, None);
                                }
                            }
                        }
                        None => {
                            let status = child.wait().await.map_err(Error::Io)?;
                            break status;
                        }
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                push_log(&mut logs, &mut truncated, line, Some(json!({"stream": "stderr"})));
                            }
                        }
                        _ => stderr_open = false,
                    }
                }
                _ = &mut deadline => {
                    child.start_kill().ok();
                    let _ = child.wait().await;
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::warn!(task_id = %task_id, elapsed_ms, "sandbox execution timed out");
                    return Err(Error::SandboxTimeout { elapsed_ms });
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let resource_usage = rusage_delta(usage_before, rusage_children());

        if !status.success() && result.is_none() && handler_error.is_none() {
            let code = status.code();
            let signal = exit_signal(&status);
            tracing::warn!(task_id = %task_id, ?code, ?signal, "sandbox exited abnormally");
            return Err(Error::SandboxCrash { code, signal });
        }

        Ok(SandboxExecutionResult {
            task_id,
            result,
            error: handler_error,
            logs,
            truncated_log_count: truncated,
            duration_ms,
            resource_usage,
        })
    }

    fn build_command(&self, launch: &SandboxLaunch<'_>, shim: Option<&Path>) -> Result<Command> {
        if let Some(parts) = &self.config.command_override {
            let (program, args) = parts.split_first().ok_or_else(|| {
                Error::validation("sandbox command override must not be empty")
            })?;
            let mut command = Command::new(program);
            command.args(args);
            return Ok(command);
        }

        let shim = shim.ok_or_else(|| Error::validation("sandbox shim missing"))?;
        let command = match launch.runtime {
            JobRuntimeKind::Node => {
                let mut c = Command::new(&self.config.node_binary);
                c.arg(shim);
                c
            }
            JobRuntimeKind::Python => {
                let mut c = Command::new(&self.config.python_binary);
                c.arg(shim);
                c
            }
            JobRuntimeKind::Docker => {
                let mut c = Command::new(&self.config.docker_binary);
                c.args(["run", "--rm", "-i", "--network", "none"])
                    .arg("-v")
                    .arg(format!("{}:/bundle:ro", launch.bundle_dir.display()))
                    .arg("-v")
                    .arg(format!("{}:/weft-shim.cjs:ro", shim.display()))
                    .arg(&self.config.docker_image)
                    .args(["node", "/weft-shim.cjs"]);
                c
            }
        };
        Ok(command)
    }

    fn write_shim(&self, runtime: JobRuntimeKind, task_id: &str) -> Result<Option<PathBuf>> {
        if self.config.command_override.is_some() {
            return Ok(None);
        }
        let (source, suffix) = match runtime {
            JobRuntimeKind::Node | JobRuntimeKind::Docker => (NODE_SHIM, "cjs"),
            JobRuntimeKind::Python => (PYTHON_SHIM, "py"),
        };
        let path = std::env::temp_dir().join(format!("weft-shim-{task_id}.{suffix}"));
        std::fs::write(&path, source)?;
        Ok(Some(path))
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn rusage_children() -> Option<libc::rusage> {
    // getrusage with zeroed output is well-defined; unsafe is confined
    // to the libc call.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) == 0 {
            Some(usage)
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
fn rusage_children() -> Option<()> {
    None
}

#[cfg(unix)]
fn rusage_delta(
    before: Option<libc::rusage>,
    after: Option<libc::rusage>,
) -> Option<ResourceUsage> {
    let (before, after) = (before?, after?);
    let timeval_us =
        |tv: libc::timeval| -> u64 { (tv.tv_sec as u64) * 1_000_000 + tv.tv_usec as u64 };
    Some(ResourceUsage {
        user_cpu_us: Some(timeval_us(after.ru_utime).saturating_sub(timeval_us(before.ru_utime))),
        system_cpu_us: Some(
            timeval_us(after.ru_stime).saturating_sub(timeval_us(before.ru_stime)),
        ),
        // RUSAGE_CHILDREN maxrss is the peak across children, not a delta.
        max_rss_kb: Some(after.ru_maxrss as u64),
        voluntary_context_switches: Some(
            (after.ru_nvcsw as u64).saturating_sub(before.ru_nvcsw as u64),
        ),
        involuntary_context_switches: Some(
            (after.ru_nivcsw as u64).saturating_sub(before.ru_nivcsw as u64),
        ),
    })
}

#[cfg(not(unix))]
fn rusage_delta(_before: Option<()>, _after: Option<()>) -> Option<ResourceUsage> {
    None
}

const NODE_SHIM: &str = r#"'use strict';
const readline = require('readline');
const Module = require('module');

const CAPABILITY_MODULES = {
  fs: ['fs', 'fs/promises'],
  network: ['net', 'http', 'https', 'http2', 'dns', 'tls', 'dgram'],
  process: ['child_process', 'cluster', 'worker_threads'],
};

function send(op) {
  process.stdout.write(JSON.stringify(op) + '\n');
}

const rl = readline.createInterface({ input: process.stdin, terminal: false });
const pendingSecrets = new Map();
let nextSecretId = 1;
let started = false;

rl.on('line', (line) => {
  if (!line.trim()) return;
  const message = JSON.parse(line);
  if (!started) {
    started = true;
    main(message).catch((err) => {
      send({ op: 'error', message: String(err && err.message || err), name: err && err.name, stack: err && err.stack });
      process.exit(1);
    });
    return;
  }
  const pending = pendingSecrets.get(message.id);
  if (pending) {
    pendingSecrets.delete(message.id);
    pending(message.value === undefined ? null : message.value);
  }
});

function gateModules(capabilities) {
  const denied = new Map();
  for (const [capability, modules] of Object.entries(CAPABILITY_MODULES)) {
    if (capabilities.includes(capability)) continue;
    for (const name of modules) denied.set(name, capability);
  }
  const originalLoad = Module._load;
  Module._load = function (request, parent, isMain) {
    const bare = request.startsWith('node:') ? request.slice(5) : request;
    if (denied.has(bare)) {
      throw new Error(`module '${request}' requires undeclared capability '${denied.get(bare)}'`);
    }
    return originalLoad.call(this, request, parent, isMain);
  };
}

async function main(start) {
  gateModules(start.capabilities || []);

  const context = {
    parameters: start.parameters,
    run: start.run,
    update: async (patch) => { send({ op: 'update', patch }); },
    logger: (message, meta) => { send({ op: 'log', message: String(message), meta: meta === undefined ? null : meta }); },
    resolveSecret: (secret) => new Promise((resolve) => {
      const id = nextSecretId++;
      pendingSecrets.set(id, resolve);
      send({ op: 'secret', id, secret });
    }),
  };

  const loaded = require(start.entry);
  const exportName = start.export || 'handler';
  const handler = typeof loaded === 'function' ? loaded : loaded[exportName];
  if (typeof handler !== 'function') {
    throw new Error(`bundle entry does not export a callable '${exportName}'`);
  }

  const value = await handler(context);
  send({ op: 'result', value: value === undefined ? null : value });
  process.exit(0);
}
"#;

const PYTHON_SHIM: &str = r#"import builtins
import importlib
import importlib.util
import json
import sys
import threading

CAPABILITY_MODULES = {
    "network": {"socket", "http", "urllib", "ssl", "ftplib", "smtplib"},
    "process": {"subprocess", "multiprocessing"},
    "fs": {"shutil", "pathlib", "glob", "tempfile"},
}

_lock = threading.Lock()

def send(op):
    with _lock:
        sys.stdout.write(json.dumps(op) + "\n")
        sys.stdout.flush()

start = json.loads(sys.stdin.readline())
capabilities = set(start.get("capabilities") or [])

denied = {}
for capability, modules in CAPABILITY_MODULES.items():
    if capability in capabilities:
        continue
    for name in modules:
        denied[name] = capability

_original_import = builtins.__import__

def _gated_import(name, *args, **kwargs):
    root = name.split(".")[0]
    if root in denied:
        raise ImportError(
            f"module '{name}' requires undeclared capability '{denied[root]}'"
        )
    return _original_import(name, *args, **kwargs)

builtins.__import__ = _gated_import

_secret_id = 0

def resolve_secret(secret):
    global _secret_id
    _secret_id += 1
    request_id = _secret_id
    send({"op": "secret", "id": request_id, "secret": secret})
    reply = json.loads(sys.stdin.readline())
    return reply.get("value")

class Context:
    def __init__(self):
        self.parameters = start.get("parameters")
        self.run = start.get("run")

    def update(self, patch):
        send({"op": "update", "patch": patch})

    def logger(self, message, meta=None):
        send({"op": "log", "message": str(message), "meta": meta})

    def resolve_secret(self, secret):
        return resolve_secret(secret)

try:
    spec = importlib.util.spec_from_file_location("weft_bundle_entry", start["entry"])
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    handler = getattr(module, start.get("export") or "handler")
    value = handler(Context())
    send({"op": "result", "value": value})
    sys.exit(0)
except Exception as exc:  # noqa: BLE001
    import traceback
    send({
        "op": "error",
        "message": str(exc),
        "name": type(exc).__name__,
        "stack": traceback.format_exc(),
    })
    sys.exit(1)
"#;
