//! Interpreter process management (startup/IO/health).

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
    sync::watch,
};

pub mod python;

const STDERR_TAIL_LINES: usize = 40;
/// Longer stderr lines are split into chunks of this size.
const STDERR_LINE_BYTES: usize = 4096;

pub struct ProcessHandle {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: StderrTail,
}

/// Last lines written to a child's stderr, collected in the background.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    closed: watch::Receiver<bool>,
}

impl StderrTail {
    pub(crate) fn follow<R>(stderr: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (done, closed) = watch::channel(false);
        let tail = StderrTail {
            lines: Arc::default(),
            closed,
        };
        let sink = tail.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = (&mut reader)
                    .take(STDERR_LINE_BYTES as u64)
                    .read_until(b'\n', &mut buf)
                    .await;
                if !matches!(read, Ok(n) if n > 0) {
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                tracing::trace!(target: "nbcall::kernel", "{}", line);
                sink.push(line.to_string());
            }
            let _ = done.send(true);
        });
        tail
    }

    /// Wait (at most `wait`) for the stream to reach end of file.
    pub async fn settled(&self, wait: Duration) {
        let mut closed = self.closed.clone();
        let _ = tokio::time::timeout(wait, closed.wait_for(|c| *c)).await;
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == STDERR_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    pub fn snapshot(&self) -> String {
        match self.lines.lock() {
            Ok(lines) => lines.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }
}
