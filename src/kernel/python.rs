//! Python kernel speaking newline-delimited JSON over the child's stdio.
//!
//! Requests (engine → kernel):
//!
//! ```text
//! {"type": "execute", "unit": 3, "code": "..."}
//! {"type": "shutdown"}
//! ```
//!
//! Messages (kernel → engine): `ready`, `stream`, `capture`, `oversized`,
//! `result`. Every line is capped, so a runaway notebook cannot grow the
//! engine's buffers past the configured output limit.
//! The bootstrap moves the protocol off fd 1 before any notebook code runs,
//! so prints (including from C extensions) cannot corrupt it.

use std::{ffi::OsString, pin::Pin, time::Duration};

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
};

use super::{push_bounded, KernelLauncher, KernelSession, UnitReply, UnitStatus};
use crate::{
    config::KernelConfig,
    error::KernelError,
    execution::capture::{CaptureSender, CapturedOutput},
    process::{python::start_python, StderrTail},
};

// `_LIMIT` is prepended at launch: the largest stream chunk or capture the
// kernel will put on the wire, in bytes.
const BOOTSTRAP: &str = r##"
import io, json, os, sys, traceback, types, warnings
from contextlib import redirect_stderr, redirect_stdout

_proto_in = os.fdopen(os.dup(0), "r", encoding="utf-8")
_proto_out = os.fdopen(os.dup(1), "wb")
_null = os.open(os.devnull, os.O_RDONLY)
os.dup2(_null, 0)
os.dup2(2, 1)
sys.stdin = open(os.devnull, "r")

def _write(data):
    _proto_out.write(data + b"\n")
    _proto_out.flush()

def _text(s):
    # lone surrogates survive as visible escapes instead of breaking the line
    data = s.encode("utf-8", "backslashreplace")
    if len(data) > _LIMIT:
        data = data[:_LIMIT]
    return data.decode("utf-8", "ignore")

def _send(msg):
    _write(json.dumps(msg, ensure_ascii=False).encode("utf-8"))

_current = {"unit": None}

def mark_output(value):
    unit = _current["unit"]
    try:
        body = json.dumps(value, allow_nan=False, ensure_ascii=False, separators=(",", ":")).encode("utf-8")
    except UnicodeEncodeError:
        raise ValueError("output contains text that is not valid unicode") from None
    if len(body) > _LIMIT:
        _send({"type": "oversized", "unit": unit, "bytes": len(body)})
        return
    _write(b'{"type":"capture","unit":' + json.dumps(unit).encode() + b',"value":' + body + b"}")

_mod = types.ModuleType("nbcall")
_mod.mark_output = mark_output
_mod.save_output = mark_output
sys.modules["nbcall"] = _mod
_ns = {"__name__": "__main__", "mark_output": mark_output, "save_output": mark_output}

def _run(unit, code):
    out, err = io.StringIO(), io.StringIO()
    status, detail = "ok", None
    _current["unit"] = unit
    # the active filters decide what counts, so library deprecations stay hidden
    with warnings.catch_warnings(record=True) as caught:
        try:
            with redirect_stdout(out), redirect_stderr(err):
                exec(compile(code, "<unit %d>" % unit, "exec"), _ns)
        except BaseException as exc:
            status = "error"
            detail = "".join(traceback.format_exception(type(exc), exc, exc.__traceback__.tb_next)).rstrip()
    _current["unit"] = None
    if status == "ok" and caught:
        status = "warning"
        detail = "\n".join("%s: %s" % (w.category.__name__, w.message) for w in caught)
    for name, buf in (("stdout", out), ("stderr", err)):
        text = buf.getvalue()
        if text:
            _send({"type": "stream", "unit": unit, "name": name, "text": _text(text)})
    _send({"type": "result", "unit": unit, "status": status, "detail": None if detail is None else _text(detail)})

_send({"type": "ready", "pid": os.getpid()})
while True:
    _line = _proto_in.readline()
    if not _line:
        break
    _req = json.loads(_line)
    if _req.get("type") == "shutdown":
        break
    if _req.get("type") == "execute":
        _run(_req["unit"], _req["code"])
"##;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum KernelMessage {
    Ready {
        #[serde(default)]
        pid: Option<u32>,
    },
    Stream {
        unit: usize,
        name: String,
        text: String,
    },
    Capture {
        unit: Option<usize>,
        value: Value,
    },
    /// A capture the kernel refused to put on the wire.
    Oversized {
        unit: Option<usize>,
        bytes: usize,
    },
    Result {
        unit: usize,
        status: UnitStatus,
        #[serde(default)]
        detail: Option<String>,
    },
}

/// How long to wait for a dead kernel's stderr before reporting it.
const EXIT_SETTLE: Duration = Duration::from_millis(500);

type MessageStream = Pin<Box<dyn Stream<Item = Result<KernelMessage, KernelError>> + Send>>;

/// Longest protocol line accepted for a given output limit. JSON escaping can
/// grow clipped text up to six times.
fn max_line_bytes(max_output_bytes: usize) -> usize {
    max_output_bytes.saturating_mul(6).saturating_add(64 * 1024)
}

fn message_stream(stdout: ChildStdout, max_line: usize) -> MessageStream {
    Box::pin(try_stream! {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let limit = u64::try_from(max_line).unwrap_or(u64::MAX).saturating_add(1);
            let n = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
            if n == 0 {
                break;
            }
            if buf.len() > max_line {
                Err::<(), _>(KernelError::Protocol(format!(
                    "kernel message exceeds {} bytes",
                    max_line
                )))?;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let msg: KernelMessage = serde_json::from_str(line).map_err(|e| {
                KernelError::Protocol(format!("{}: {}", e, preview(line)))
            })?;
            yield msg;
        }
    })
}

fn preview(line: &str) -> String {
    let mut s = String::new();
    push_bounded(&mut s, line, 120);
    s
}

/// Launches python kernels.
///
/// `python`, `python3` and the configured kernel name run the configured
/// interpreter. A versioned name such as `python3.11` runs the program of that
/// name from `PATH`; any other name is unsupported.
#[derive(Debug, Clone)]
pub struct PythonKernel {
    program: OsString,
    kernel_name: String,
    max_output_bytes: usize,
}

impl PythonKernel {
    pub fn new(config: &KernelConfig) -> Self {
        let program = config
            .python
            .as_ref()
            .map(|p| p.clone().into_os_string())
            .unwrap_or_else(|| crate::process::python::default_program().into());
        Self {
            program,
            kernel_name: config.kernel_name.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// The interpreter to start for `kernel_name`.
    pub fn program_for(&self, kernel_name: &str) -> Result<OsString, KernelError> {
        if matches!(kernel_name, "python" | "python3") || kernel_name == self.kernel_name {
            return Ok(self.program.clone());
        }
        match versioned(kernel_name) {
            Some(_) => Ok(kernel_name.into()),
            None => Err(KernelError::UnsupportedKernel(kernel_name.to_string())),
        }
    }

    fn bootstrap(&self) -> String {
        format!("_LIMIT = {}\n{}", self.max_output_bytes, BOOTSTRAP)
    }
}

/// `"3.11"` for `python3.11`, `None` for anything that is not a versioned
/// python name.
fn versioned(kernel_name: &str) -> Option<&str> {
    let version = kernel_name.strip_prefix("python")?;
    let digits = version.split('.').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
    (digits && !version.is_empty()).then_some(version)
}

#[async_trait]
impl KernelLauncher for PythonKernel {
    async fn launch(
        &self,
        kernel_name: &str,
        capture: CaptureSender,
    ) -> Result<Box<dyn KernelSession>, KernelError> {
        let program = self.program_for(kernel_name)?;
        let handle = start_python(&program, &self.bootstrap())?;
        tracing::debug!(
            kernel = kernel_name,
            program = %program.to_string_lossy(),
            pid = handle.child.id(),
            "kernel process spawned"
        );
        Ok(Box::new(PythonSession {
            child: handle.child,
            stdin: Some(handle.stdin),
            messages: message_stream(handle.stdout, max_line_bytes(self.max_output_bytes)),
            stderr: handle.stderr,
            capture,
            max_output_bytes: self.max_output_bytes,
        }))
    }
}

pub struct PythonSession {
    child: Child,
    stdin: Option<ChildStdin>,
    messages: MessageStream,
    stderr: StderrTail,
    capture: CaptureSender,
    max_output_bytes: usize,
}

impl PythonSession {
    async fn send(&mut self, request: &Value) -> Result<(), KernelError> {
        let mut line =
            serde_json::to_vec(request).map_err(|e| KernelError::Protocol(e.to_string()))?;
        line.push(b'\n');
        let written = match self.stdin.as_mut() {
            Some(stdin) => write_line(stdin, &line).await,
            None => return Err(KernelError::Protocol("kernel stdin already closed".into())),
        };
        match written {
            Ok(()) => Ok(()),
            // a broken pipe usually means the kernel is gone; report that instead
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(self.exited().await),
            Err(e) => Err(e.into()),
        }
    }

    async fn next_message(&mut self) -> Result<KernelMessage, KernelError> {
        match self.messages.next().await {
            Some(msg) => msg,
            None => Err(self.exited().await),
        }
    }

    async fn exited(&mut self) -> KernelError {
        let _ = tokio::time::timeout(EXIT_SETTLE, self.child.wait()).await;
        self.stderr.settled(EXIT_SETTLE).await;
        KernelError::Exited {
            stderr: self.stderr.snapshot(),
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

#[async_trait]
impl KernelSession for PythonSession {
    async fn wait_ready(&mut self) -> Result<(), KernelError> {
        match self.next_message().await? {
            KernelMessage::Ready { pid } => {
                tracing::debug!(pid, "kernel ready");
                Ok(())
            }
            other => Err(KernelError::Protocol(format!(
                "expected ready, got {:?}",
                other
            ))),
        }
    }

    async fn execute(&mut self, index: usize, code: &str) -> Result<UnitReply, KernelError> {
        self.send(&json!({ "type": "execute", "unit": index, "code": code }))
            .await?;

        let mut reply = UnitReply::ok();
        loop {
            match self.next_message().await? {
                KernelMessage::Stream { unit, name, text } => {
                    if unit != index {
                        return Err(KernelError::Protocol(format!(
                            "output for unit {} while running unit {}",
                            unit, index
                        )));
                    }
                    let buf = if name == "stderr" {
                        &mut reply.stderr
                    } else {
                        &mut reply.stdout
                    };
                    push_bounded(buf, &text, self.max_output_bytes);
                }
                KernelMessage::Capture { unit, value } => {
                    let capture = CapturedOutput::new(unit.unwrap_or(index), value);
                    // receiver only goes away once the engine is done with us
                    let _ = self.capture.send(capture);
                }
                KernelMessage::Oversized { unit, bytes } => {
                    let _ = self
                        .capture
                        .send(CapturedOutput::oversized(unit.unwrap_or(index), bytes));
                }
                KernelMessage::Result {
                    unit,
                    status,
                    detail,
                } => {
                    if unit != index {
                        return Err(KernelError::Protocol(format!(
                            "result for unit {} while running unit {}",
                            unit, index
                        )));
                    }
                    reply.status = status;
                    reply.detail = detail;
                    return Ok(reply);
                }
                KernelMessage::Ready { .. } => {
                    return Err(KernelError::Protocol("unexpected ready".into()));
                }
            }
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        if self.stdin.is_some() {
            let _ = self.send(&json!({ "type": "shutdown" })).await;
        }
        // closing stdin is a second exit signal for the read loop
        self.stdin = None;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "kernel exited"),
            Ok(Err(e)) => {
                tracing::warn!("waiting for kernel failed: {}", e);
                let _ = self.child.kill().await;
            }
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "kernel ignored shutdown; killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!("failed to kill kernel: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kernel_messages() {
        let msg: KernelMessage =
            serde_json::from_str(r#"{"type": "result", "unit": 2, "status": "warning", "detail": "UserWarning: x"}"#)
                .unwrap();
        match msg {
            KernelMessage::Result { unit, status, detail } => {
                assert_eq!(unit, 2);
                assert_eq!(status, UnitStatus::Warning);
                assert_eq!(detail.as_deref(), Some("UserWarning: x"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let msg: KernelMessage =
            serde_json::from_str(r#"{"type": "capture", "unit": 5, "value": [1, {"a": "b"}]}"#).unwrap();
        assert!(matches!(msg, KernelMessage::Capture { unit: Some(5), .. }));
    }

    #[test]
    fn only_python_kernels_are_supported() {
        let kernel = PythonKernel::new(&KernelConfig::default());
        assert!(kernel.program_for("python3").is_ok());
        assert!(kernel.program_for("python3.11").is_ok());
        for name in ["ir", "pythonista", "python3-venv", "python"] {
            let supported = kernel.program_for(name).is_ok();
            assert_eq!(supported, name == "python", "{}", name);
        }
    }

    #[test]
    fn versioned_kernels_do_not_fall_back_to_the_default_interpreter() {
        let config = KernelConfig {
            python: Some("/opt/venv/bin/python".into()),
            ..KernelConfig::default()
        };
        let kernel = PythonKernel::new(&config);
        assert_eq!(kernel.program_for("python3").unwrap(), OsString::from("/opt/venv/bin/python"));
        assert_eq!(kernel.program_for("python").unwrap(), OsString::from("/opt/venv/bin/python"));
        assert_eq!(kernel.program_for("python2").unwrap(), OsString::from("python2"));
        assert_eq!(kernel.program_for("python3.11").unwrap(), OsString::from("python3.11"));
        assert!(matches!(
            kernel.program_for("python-legacy"),
            Err(KernelError::UnsupportedKernel(name)) if name == "python-legacy"
        ));
    }

    #[test]
    fn configured_kernel_name_runs_the_configured_interpreter() {
        let config = KernelConfig {
            kernel_name: "conda-env".into(),
            python: Some("/opt/conda/bin/python".into()),
            ..KernelConfig::default()
        };
        let kernel = PythonKernel::new(&config);
        assert_eq!(kernel.program_for("conda-env").unwrap(), OsString::from("/opt/conda/bin/python"));
    }

    #[test]
    fn oversized_captures_parse() {
        let msg: KernelMessage =
            serde_json::from_str(r#"{"type": "oversized", "unit": 4, "bytes": 123456}"#).unwrap();
        assert!(matches!(msg, KernelMessage::Oversized { unit: Some(4), bytes: 123456 }));
    }

    #[tokio::test]
    async fn output_for_another_unit_is_a_protocol_error() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(r#"read req; echo '{"type":"stream","unit":7,"name":"stdout","text":"hi"}'; sleep 5"#)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let (tx, _rx) = crate::execution::capture::channel();
        let mut session = PythonSession {
            stdin: child.stdin.take(),
            messages: message_stream(child.stdout.take().unwrap(), 4096),
            stderr: StderrTail::follow(child.stderr.take().unwrap()),
            capture: tx,
            max_output_bytes: 1024,
            child,
        };

        let err = session.execute(2, "pass").await.unwrap_err();
        assert!(matches!(&err, KernelError::Protocol(m) if m.contains("unit 7")), "{err:?}");
        session.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn overlong_lines_are_rejected_without_buffering_them() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("head -c 5000 /dev/zero | tr '\\0' a; echo")
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut messages = message_stream(stdout, 1024);
        let first = messages.next().await.unwrap();
        assert!(matches!(first, Err(KernelError::Protocol(m)) if m.contains("exceeds 1024 bytes")));
        let _ = child.wait().await;
    }
}
