//! Lifecycle supervision of a single service process.
//!
//! One supervisor owns at most one child at a time. It launches the child,
//! probes its health, restarts it with exponential backoff after a crash, and
//! drives a graceful (then forced) shutdown when the container is asked to stop.

use std::{sync::Arc, time::Duration};

use futures_util::{FutureExt, future::BoxFuture};
use keel_process::{
    ChildExit, EXIT_FORCED_SHUTDOWN, EXIT_RESTARTS_EXHAUSTED, HealthStatus, LifecycleState,
    ProcessStatus, RunId,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tracing::Instrument;

use crate::config::ServiceSpec;
use crate::error::SupervisorError;
use crate::health::{HealthError, HealthProbe};
use crate::launcher::{ChildHandle, Launched, Launcher};
use crate::signals::Signal;

// How long to wait for the kernel to reap a child after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before restart number `attempt` (1-based).
pub fn compute_backoff(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
    initial.saturating_mul(mult).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The child exited within the shutdown grace period.
    Clean,
    /// The child outlived the grace period and was killed.
    Forced,
    RestartsExhausted,
    /// Termination arrived while a crashed child was being replaced.
    StoppedDuringRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: LifecycleState,
    /// Time since the supervisor started.
    pub at: Duration,
}

#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub exit_code: i32,
    pub reason: StopReason,
    pub restart_count: u32,
    pub transitions: Vec<Transition>,
    /// Why each crashed child was given up on, oldest first.
    pub crashes: Vec<SupervisorError>,
}

/// Mutable record of the supervised process. Owned by the supervisor task only.
#[derive(Debug)]
struct SupervisedProcess {
    status: ProcessStatus,
    consecutive_failures: u32,
}

enum LifeEnd {
    Stopped {
        reason: StopReason,
        exit_code: i32,
    },
    Crashed {
        error: SupervisorError,
        stop_requested: bool,
        /// False when the child outlived SIGKILL; nothing may be launched after it.
        reaped: bool,
    },
}

enum Reaped {
    Exited(ChildExit),
    Killed(ChildExit),
    /// SIGKILL sent but the child was never reaped.
    Lost,
}

type ProbeFuture = BoxFuture<'static, Result<(), HealthError>>;

async fn poll_probe(inflight: &mut Option<ProbeFuture>) -> Result<(), HealthError> {
    match inflight {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

pub struct Supervisor<L: Launcher, P: HealthProbe> {
    spec: Arc<ServiceSpec>,
    launcher: L,
    probe: Arc<P>,
    control: mpsc::Receiver<Signal>,
    control_open: bool,
    record: SupervisedProcess,
    status_tx: watch::Sender<ProcessStatus>,
    started: Instant,
    transitions: Vec<Transition>,
    crashes: Vec<SupervisorError>,
}

impl<L: Launcher, P: HealthProbe> Supervisor<L, P> {
    /// `control` carries the signals delivered to the supervisor itself.
    pub fn new(spec: ServiceSpec, launcher: L, probe: P, control: mpsc::Receiver<Signal>) -> Self {
        let status = ProcessStatus::new(RunId::new());
        let (status_tx, _) = watch::channel(status.clone());
        Self {
            spec: Arc::new(spec),
            launcher,
            probe: Arc::new(probe),
            control,
            control_open: true,
            record: SupervisedProcess {
                status,
                consecutive_failures: 0,
            },
            status_tx,
            started: Instant::now(),
            transitions: Vec::new(),
            crashes: Vec::new(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.record.status.run_id.clone()
    }

    pub fn status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_tx.subscribe()
    }

    /// Supervises until the service is stopped for good.
    pub async fn run(mut self) -> SupervisorOutcome {
        let span = tracing::info_span!("supervisor", run_id = %self.record.status.run_id);
        self.supervise_all().instrument(span).await
    }

    async fn supervise_all(&mut self) -> SupervisorOutcome {
        self.started = Instant::now();
        self.transitions.push(Transition {
            state: LifecycleState::Starting,
            at: Duration::ZERO,
        });
        self.publish();

        loop {
            let end = match self.launcher.launch(&self.spec) {
                Ok(launched) => self.supervise_child(launched).await,
                Err(e) => {
                    let reason = format!("{e:#}");
                    tracing::error!(command = %self.spec.command, error = %reason, "launch failed");
                    self.transition(LifecycleState::Crashed);
                    LifeEnd::Crashed {
                        error: SupervisorError::StartupFailure(reason),
                        stop_requested: false,
                        reaped: true,
                    }
                }
            };

            let stop_requested = match end {
                LifeEnd::Stopped { reason, exit_code } => return self.finish(reason, exit_code),
                LifeEnd::Crashed {
                    error,
                    stop_requested,
                    reaped,
                } => {
                    tracing::warn!(error = %error, "service crashed");
                    self.record.status.message = Some(error.to_string());
                    self.crashes.push(error);
                    if !reaped {
                        tracing::error!("crashed service survived SIGKILL; not relaunching");
                        return self.finish(StopReason::Forced, EXIT_FORCED_SHUTDOWN);
                    }
                    stop_requested
                }
            };

            if stop_requested {
                return self.finish(StopReason::StoppedDuringRestart, self.last_exit_code());
            }

            let restarts = self.record.status.restart_count;
            if restarts >= self.spec.max_restarts {
                let err = SupervisorError::RestartsExhausted(self.spec.max_restarts);
                tracing::error!(error = %err, "giving up on service");
                self.record.status.message = Some(err.to_string());
                return self.finish(StopReason::RestartsExhausted, EXIT_RESTARTS_EXHAUSTED);
            }

            let attempt = restarts + 1;
            let delay = compute_backoff(self.spec.backoff_initial, self.spec.backoff_max, attempt);
            self.record.status.restart_count = attempt;
            self.record.status.message = Some(format!(
                "restarting in {}ms (attempt {}/{})",
                delay.as_millis(),
                attempt,
                self.spec.max_restarts
            ));
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling restart");
            self.publish();

            if self.wait_backoff(delay).await {
                return self.finish(StopReason::StoppedDuringRestart, self.last_exit_code());
            }

            self.record.consecutive_failures = 0;
            self.record.status.health = HealthStatus::Unknown;
            self.transition(LifecycleState::Starting);
        }
    }

    /// Returns true if termination was requested before the delay elapsed.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                sig = self.control.recv(), if self.control_open => match sig {
                    None => self.control_open = false,
                    Some(s) if s.is_termination_request() => {
                        tracing::info!(signal = %s, "termination requested during restart backoff");
                        return true;
                    }
                    Some(s) => self.ignore_signal(s),
                },
            }
        }
    }

    async fn supervise_child(&mut self, launched: Launched<L::Handle>) -> LifeEnd {
        let Launched {
            handle,
            mut exited,
        } = launched;
        self.record.status.pid = handle.pid();
        self.record.status.message = None;
        self.publish();
        tracing::info!(pid = ?handle.pid(), command = %self.spec.command, "service launched");

        let launched_at = Instant::now();
        let startup_deadline = launched_at + self.spec.startup_grace;
        let mut next_probe =
            launched_at + self.spec.health_interval.min(self.spec.startup_grace);
        let mut inflight: Option<ProbeFuture> = None;
        // Once the startup window closes, the probe in flight decides the outcome.
        let mut deadline_passed = false;

        loop {
            let starting = self.record.status.state == LifecycleState::Starting;
            tokio::select! {
                biased;

                exit = &mut exited => {
                    let exit = exit.unwrap_or_default();
                    let code = exit.container_code();
                    self.record_exit(exit);
                    let error = if starting {
                        SupervisorError::StartupFailure(format!(
                            "exited with code {code} before becoming healthy"
                        ))
                    } else {
                        SupervisorError::UnexpectedExit(code)
                    };
                    self.transition(LifecycleState::Crashed);
                    return LifeEnd::Crashed {
                        error,
                        stop_requested: false,
                        reaped: true,
                    };
                }

                sig = self.control.recv(), if self.control_open => match sig {
                    None => self.control_open = false,
                    Some(s) if s.is_termination_request() => {
                        tracing::info!(signal = %s, "termination requested");
                        return self.drain(&handle, exited).await;
                    }
                    Some(s) => self.ignore_signal(s),
                },

                res = poll_probe(&mut inflight), if inflight.is_some() => {
                    inflight = None;
                    next_probe = Instant::now() + self.spec.health_interval;
                    if let Some(error) = self.on_probe(res, deadline_passed) {
                        self.transition(LifecycleState::Crashed);
                        let (stop_requested, reaped) = self.stop_crashed(&handle, exited).await;
                        return LifeEnd::Crashed {
                            error,
                            stop_requested,
                            reaped,
                        };
                    }
                }

                _ = tokio::time::sleep_until(startup_deadline), if starting && !deadline_passed => {
                    deadline_passed = true;
                    if inflight.is_none() {
                        inflight = Some(self.start_probe());
                    }
                }

                _ = tokio::time::sleep_until(next_probe), if inflight.is_none() => {
                    inflight = Some(self.start_probe());
                }
            }
        }
    }

    fn start_probe(&self) -> ProbeFuture {
        let probe = Arc::clone(&self.probe);
        let timeout = self.spec.health_timeout;
        async move {
            match tokio::time::timeout(timeout, probe.check()).await {
                Ok(res) => res,
                Err(_) => Err(HealthError::Timeout(timeout)),
            }
        }
        .boxed()
    }

    /// Applies one probe result. Returns the crash cause once the failure
    /// threshold is reached, or when the last probe of the startup window fails.
    fn on_probe(
        &mut self,
        res: Result<(), HealthError>,
        deadline_passed: bool,
    ) -> Option<SupervisorError> {
        match (self.record.status.state, res) {
            (LifecycleState::Starting, Ok(())) => {
                self.record.consecutive_failures = 0;
                self.record.status.health = HealthStatus::Healthy;
                tracing::info!("service is healthy");
                self.transition(LifecycleState::Running);
                None
            }
            (LifecycleState::Starting, Err(e)) if deadline_passed => {
                tracing::warn!(error = %e, "service not healthy by the end of the startup window");
                self.set_health(HealthStatus::Failed);
                Some(SupervisorError::StartupFailure(format!(
                    "not healthy within {}ms",
                    self.spec.startup_grace.as_millis()
                )))
            }
            (LifecycleState::Starting, Err(e)) => {
                tracing::debug!(error = %e, "service not ready yet");
                self.set_health(HealthStatus::Starting);
                None
            }
            (_, Ok(())) => {
                if self.record.consecutive_failures > 0 {
                    tracing::info!(
                        after = self.record.consecutive_failures,
                        "health recovered"
                    );
                }
                self.record.consecutive_failures = 0;
                self.set_health(HealthStatus::Healthy);
                None
            }
            (_, Err(e)) => {
                self.record.consecutive_failures += 1;
                let failures = self.record.consecutive_failures;
                let err = SupervisorError::from(e);
                tracing::warn!(
                    error = %err,
                    failures,
                    threshold = self.spec.failure_threshold,
                    "health check failed"
                );
                if failures >= self.spec.failure_threshold {
                    self.set_health(HealthStatus::Failed);
                    Some(SupervisorError::HealthThresholdExceeded { failures })
                } else {
                    self.set_health(HealthStatus::Unhealthy);
                    None
                }
            }
        }
    }

    async fn drain(
        &mut self,
        handle: &L::Handle,
        exited: oneshot::Receiver<ChildExit>,
    ) -> LifeEnd {
        self.transition(LifecycleState::Draining);
        let (reaped, _) = self.stop_child(handle, exited).await;
        match reaped {
            Reaped::Exited(exit) => {
                self.record_exit(exit);
                LifeEnd::Stopped {
                    reason: StopReason::Clean,
                    exit_code: exit.container_code(),
                }
            }
            Reaped::Killed(exit) => {
                self.record_exit(exit);
                LifeEnd::Stopped {
                    reason: StopReason::Forced,
                    exit_code: EXIT_FORCED_SHUTDOWN,
                }
            }
            Reaped::Lost => LifeEnd::Stopped {
                reason: StopReason::Forced,
                exit_code: EXIT_FORCED_SHUTDOWN,
            },
        }
    }

    /// Stops a child that was declared crashed while still running. Returns
    /// whether termination was requested meanwhile and whether the child is gone.
    async fn stop_crashed(
        &mut self,
        handle: &L::Handle,
        exited: oneshot::Receiver<ChildExit>,
    ) -> (bool, bool) {
        let (reaped, stop_requested) = self.stop_child(handle, exited).await;
        match reaped {
            Reaped::Exited(exit) | Reaped::Killed(exit) => {
                self.record_exit(exit);
                (stop_requested, true)
            }
            Reaped::Lost => (stop_requested, false),
        }
    }

    /// Sends the stop signal once, waits out the grace period, then kills.
    /// The flag reports whether a termination request arrived meanwhile.
    async fn stop_child(
        &mut self,
        handle: &L::Handle,
        mut exited: oneshot::Receiver<ChildExit>,
    ) -> (Reaped, bool) {
        let sig = self.spec.stop_signal;
        let grace = self.spec.shutdown_grace;
        match handle.signal(sig) {
            Ok(()) => tracing::info!(signal = %sig, grace_ms = grace.as_millis() as u64, "stop signal sent"),
            Err(e) => tracing::debug!(signal = %sig, error = %e, "stop signal not delivered"),
        }

        let deadline = Instant::now() + grace;
        let mut stop_requested = false;
        loop {
            tokio::select! {
                biased;

                exit = &mut exited => return (Reaped::Exited(exit.unwrap_or_default()), stop_requested),

                s = self.control.recv(), if self.control_open => match s {
                    None => self.control_open = false,
                    Some(s) if s.is_termination_request() => {
                        if self.record.status.state == LifecycleState::Draining {
                            tracing::info!(signal = %s, "already draining; ignoring");
                        } else {
                            tracing::info!(signal = %s, "termination requested while stopping crashed service");
                            stop_requested = true;
                        }
                    }
                    Some(s) => self.ignore_signal(s),
                },

                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let err = SupervisorError::ShutdownTimeout { signal: sig, grace };
        tracing::warn!(error = %err, "forcing shutdown");
        if let Err(e) = handle.signal(Signal::Kill) {
            tracing::warn!(error = %e, "SIGKILL not delivered");
        }
        let reaped = match tokio::time::timeout(KILL_REAP_TIMEOUT, exited).await {
            Ok(Ok(exit)) => Reaped::Killed(exit),
            Ok(Err(_)) => Reaped::Killed(ChildExit::default()),
            Err(_) => {
                tracing::error!(
                    pid = ?handle.pid(),
                    wait_ms = KILL_REAP_TIMEOUT.as_millis() as u64,
                    "service was not reaped after SIGKILL"
                );
                Reaped::Lost
            }
        };
        (reaped, stop_requested)
    }

    fn ignore_signal(&self, sig: Signal) {
        tracing::warn!(
            signal = %sig,
            state = ?self.record.status.state,
            "ignoring signal; not forwarded to service"
        );
    }

    fn record_exit(&mut self, exit: ChildExit) {
        self.record.status.last_exit = Some(exit);
        self.record.status.pid = None;
        tracing::info!(code = ?exit.code, signal = ?exit.signal, "service exited");
    }

    fn last_exit_code(&self) -> i32 {
        self.record
            .status
            .last_exit
            .map(|e| e.container_code())
            .unwrap_or(1)
    }

    fn set_health(&mut self, health: HealthStatus) {
        if self.record.status.health != health {
            self.record.status.health = health;
            self.publish();
        }
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.record.status.state;
        if from == to || from.is_terminal() {
            return;
        }
        self.record.status.state = to;
        self.transitions.push(Transition {
            state: to,
            at: self.started.elapsed(),
        });
        tracing::info!(
            from = ?from,
            to = ?to,
            restart_count = self.record.status.restart_count,
            "lifecycle transition"
        );
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.record.status.clone());
    }

    fn finish(&mut self, reason: StopReason, exit_code: i32) -> SupervisorOutcome {
        self.transition(LifecycleState::Stopped);
        tracing::info!(?reason, exit_code, "supervision finished");
        SupervisorOutcome {
            exit_code,
            reason,
            restart_count: self.record.status.restart_count,
            transitions: std::mem::take(&mut self.transitions),
            crashes: std::mem::take(&mut self.crashes),
        }
    }
}
