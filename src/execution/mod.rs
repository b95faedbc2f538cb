//! Kernel execution engine.
//!
//! One [`Engine::execute`] call owns one freshly launched kernel. Code units
//! run strictly in document order; the first unrecovered error, timeout or
//! cancellation ends the session, and the kernel is shut down on every path.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::time::{sleep_until, Instant as Deadline};
use tracing::Instrument;

use crate::{
    config::KernelConfig,
    inject::ExecutableNotebook,
    kernel::{KernelLauncher, KernelSession, PythonKernel, UnitStatus},
};

pub mod capture;
pub mod session;

pub use capture::{CaptureLatch, CapturedOutput};
pub use session::{Failure, Session, SessionOutcome, SessionState, UnitRecord};

/// Per-run knobs, seeded from the engine's [`KernelConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub timeout: Duration,
    pub unit_timeout: Option<Duration>,
    pub continue_on_warning: bool,
}

#[derive(Clone)]
pub struct Engine {
    launcher: Arc<dyn KernelLauncher>,
    config: KernelConfig,
}

enum Interrupt {
    TimedOut,
    Cancelled,
}

impl Interrupt {
    fn into_state(self, unit: Option<usize>) -> SessionState {
        match self {
            Interrupt::TimedOut => SessionState::TimedOut { unit },
            Interrupt::Cancelled => SessionState::Cancelled,
        }
    }
}

/// Await `fut` unless the deadline passes or `cancel` resolves first.
async fn guard<F, C>(fut: F, deadline: Deadline, cancel: Pin<&mut C>) -> Result<F::Output, Interrupt>
where
    F: Future,
    C: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = cancel => Err(Interrupt::Cancelled),
        _ = sleep_until(deadline) => Err(Interrupt::TimedOut),
        out = fut => Ok(out),
    }
}

impl Engine {
    pub fn new(launcher: Arc<dyn KernelLauncher>, config: KernelConfig) -> Self {
        Self { launcher, config }
    }

    /// Engine backed by the bundled python kernel.
    pub fn python(config: KernelConfig) -> Self {
        let launcher = Arc::new(PythonKernel::new(&config));
        Self::new(launcher, config)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Options for one run. `None` falls back to the configured timeout.
    pub fn options(&self, timeout: Option<Duration>) -> RunOptions {
        RunOptions {
            timeout: timeout.unwrap_or(self.config.timeout),
            unit_timeout: self.config.unit_timeout,
            continue_on_warning: self.config.continue_on_warning,
        }
    }

    pub async fn execute(
        &self,
        notebook: &ExecutableNotebook,
        timeout: impl Into<Option<Duration>>,
    ) -> SessionOutcome {
        self.execute_with_cancel(notebook, timeout, futures::future::pending())
            .await
    }

    /// Like [`execute`](Self::execute), but `cancel` resolving ends the run
    /// as [`SessionState::Cancelled`].
    pub async fn execute_with_cancel<C>(
        &self,
        notebook: &ExecutableNotebook,
        timeout: impl Into<Option<Duration>>,
        cancel: C,
    ) -> SessionOutcome
    where
        C: Future<Output = ()>,
    {
        self.run(notebook, self.options(timeout.into()), cancel).await
    }

    pub async fn run<C>(&self, notebook: &ExecutableNotebook, opts: RunOptions, cancel: C) -> SessionOutcome
    where
        C: Future<Output = ()>,
    {
        let fingerprint = notebook.fingerprint();
        let kernel_name = notebook
            .kernel_name()
            .unwrap_or(&self.config.kernel_name)
            .to_string();
        let span = tracing::info_span!("session", id = %&fingerprint[..8], kernel = %kernel_name);
        self.run_session(notebook, opts, cancel, kernel_name, fingerprint)
            .instrument(span)
            .await
    }

    async fn run_session<C>(
        &self,
        notebook: &ExecutableNotebook,
        opts: RunOptions,
        cancel: C,
        kernel_name: String,
        fingerprint: String,
    ) -> SessionOutcome
    where
        C: Future<Output = ()>,
    {
        let started = Instant::now();
        let deadline = Deadline::now() + opts.timeout;
        tokio::pin!(cancel);

        let mut session = Session::new();
        let mut latch = CaptureLatch::new(self.config.max_output_bytes);
        let mut units = Vec::new();
        let (tx, mut rx) = capture::channel();

        session.advance(SessionState::Starting);
        tracing::info!(units = notebook.len(), "launching kernel");
        let launched = guard(self.launcher.launch(&kernel_name, tx), deadline, cancel.as_mut()).await;
        let end = match launched {
            Err(interrupt) => interrupt.into_state(None),
            Ok(Err(e)) => SessionState::Failed(Failure::Kernel {
                unit: None,
                detail: e.to_string(),
            }),
            Ok(Ok(mut kernel)) => {
                let end = self
                    .drive(
                        &mut *kernel,
                        notebook,
                        &opts,
                        deadline,
                        cancel.as_mut(),
                        &mut session,
                        &mut latch,
                        &mut rx,
                        &mut units,
                    )
                    .await;
                self.teardown(kernel).await;
                end
            }
        };

        if end != SessionState::Completed {
            // whatever arrived before the failure is kept for diagnostics
            let _ = latch.drain(&mut rx);
        }
        session.advance(end);

        let (state, history) = session.into_parts();
        let elapsed = started.elapsed();
        tracing::info!(
            state = %state,
            captured = latch.is_captured(),
            elapsed_ms = elapsed.as_millis() as u64,
            "session finished"
        );
        SessionOutcome {
            state,
            history,
            captured: latch.into_inner(),
            units,
            elapsed,
            fingerprint,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<C>(
        &self,
        kernel: &mut dyn KernelSession,
        notebook: &ExecutableNotebook,
        opts: &RunOptions,
        deadline: Deadline,
        mut cancel: Pin<&mut C>,
        session: &mut Session,
        latch: &mut CaptureLatch,
        rx: &mut capture::CaptureReceiver,
        units: &mut Vec<UnitRecord>,
    ) -> SessionState
    where
        C: Future<Output = ()>,
    {
        match guard(kernel.wait_ready(), deadline, cancel.as_mut()).await {
            Err(interrupt) => return interrupt.into_state(None),
            Ok(Err(e)) => {
                return SessionState::Failed(Failure::Kernel {
                    unit: None,
                    detail: e.to_string(),
                })
            }
            Ok(Ok(())) => tracing::info!("kernel ready"),
        }

        for (index, unit) in notebook.code_units() {
            session.advance(SessionState::Running(index));
            let unit_deadline = match opts.unit_timeout {
                Some(limit) => deadline.min(Deadline::now() + limit),
                None => deadline,
            };

            tracing::debug!(unit = index, "executing unit");
            let reply = match guard(kernel.execute(index, &unit.source), unit_deadline, cancel.as_mut()).await {
                Err(interrupt) => return interrupt.into_state(Some(index)),
                Ok(Err(e)) => {
                    return SessionState::Failed(Failure::Kernel {
                        unit: Some(index),
                        detail: e.to_string(),
                    })
                }
                Ok(Ok(reply)) => reply,
            };
            tracing::debug!(unit = index, status = ?reply.status, "unit finished");

            let captured = latch.drain(rx);
            units.push(UnitRecord {
                index,
                status: reply.status,
                stdout: reply.stdout,
                stderr: reply.stderr,
            });

            match reply.status {
                UnitStatus::Error => {
                    let detail = reply
                        .detail
                        .unwrap_or_else(|| "unit raised an error".to_string());
                    return SessionState::Failed(Failure::Unit { index, detail });
                }
                UnitStatus::Warning if !opts.continue_on_warning => {
                    let detail = format!("halted on warning: {}", reply.detail.unwrap_or_default());
                    return SessionState::Failed(Failure::Unit { index, detail });
                }
                UnitStatus::Warning => {
                    tracing::warn!(unit = index, "continuing past warning: {}", reply.detail.unwrap_or_default());
                }
                UnitStatus::Ok => {}
            }
            if let Err(e) = captured {
                return SessionState::Failed(Failure::from_capture(e, index));
            }
        }
        SessionState::Completed
    }

    async fn teardown(&self, mut kernel: Box<dyn KernelSession>) {
        let grace = self.config.grace_period;
        // dropping the session kills the process if shutdown itself stalls
        if tokio::time::timeout(grace * 2, kernel.shutdown(grace)).await.is_err() {
            tracing::warn!("kernel shutdown stalled; dropping session");
        }
        tracing::debug!("kernel torn down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
