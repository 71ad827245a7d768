//! In-process stand-ins for a child process and its health endpoint.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use keel_process::ChildExit;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServiceSpec;
use crate::health::{HealthError, HealthProbe};
use crate::launcher::{ChildHandle, Launched, Launcher};
use crate::signals::Signal;

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

#[derive(Debug, Clone, Copy)]
pub enum ChildScript {
    /// Exits on its own with `code` after `after`; a stop signal ends it early.
    ExitAfter { after: Duration, code: i32 },
    /// Runs until asked to stop, then exits 0 after `delay`.
    Cooperative { delay: Duration },
    /// Only SIGKILL ends it.
    Stubborn,
    /// Survives even SIGKILL and is never reaped.
    Unkillable,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    signals: Arc<Mutex<Vec<Signal>>>,
    launches: Arc<AtomicU32>,
}

impl Recorder {
    /// Every signal sent to any fake child, in order.
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

pub struct FakeLauncher {
    scripts: VecDeque<ChildScript>,
    fallback: Option<ChildScript>,
    recorder: Recorder,
}

impl FakeLauncher {
    /// Every launch follows `script`.
    pub fn new(script: ChildScript) -> Self {
        Self::with_sequence(Vec::new(), script)
    }

    /// Launches follow `scripts` in order, then `then` forever.
    pub fn with_sequence(scripts: Vec<ChildScript>, then: ChildScript) -> Self {
        Self {
            scripts: scripts.into(),
            fallback: Some(then),
            recorder: Recorder::default(),
        }
    }

    /// Every launch fails as if the executable were missing.
    pub fn failing() -> Self {
        Self {
            scripts: VecDeque::new(),
            fallback: None,
            recorder: Recorder::default(),
        }
    }

    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }
}

pub struct FakeHandle {
    pid: u32,
    tx: mpsc::UnboundedSender<Signal>,
    recorder: Recorder,
}

impl ChildHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal(&self, sig: Signal) -> std::io::Result<()> {
        self.recorder.signals.lock().unwrap().push(sig);
        self.tx
            .send(sig)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "no such process"))
    }
}

impl Launcher for FakeLauncher {
    type Handle = FakeHandle;

    fn launch(&mut self, spec: &ServiceSpec) -> anyhow::Result<Launched<FakeHandle>> {
        let n = self.recorder.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(script) = self.scripts.pop_front().or(self.fallback) else {
            anyhow::bail!("spawn {}: No such file or directory", spec.command);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = oneshot::channel();
        tokio::spawn(async move {
            let exit = play(script, rx).await;
            let _ = exit_tx.send(exit);
        });

        Ok(Launched {
            handle: FakeHandle {
                pid: 1000 + n,
                tx,
                recorder: self.recorder.clone(),
            },
            exited,
        })
    }
}

async fn play(script: ChildScript, mut rx: mpsc::UnboundedReceiver<Signal>) -> ChildExit {
    let natural = async {
        match script {
            ChildScript::ExitAfter { after, code } => {
                tokio::time::sleep(after).await;
                code
            }
            _ => std::future::pending().await,
        }
    };
    tokio::pin!(natural);

    loop {
        tokio::select! {
            code = &mut natural => return ChildExit::code(code),
            sig = rx.recv() => match (sig, script) {
                (None, ChildScript::Unkillable) => std::future::pending::<()>().await,
                (_, ChildScript::Unkillable) => {}
                (None, _) | (Some(Signal::Kill), _) => return ChildExit::signaled(SIGKILL),
                (Some(s), ChildScript::Cooperative { delay }) if s.is_termination_request() => {
                    tokio::time::sleep(delay).await;
                    return ChildExit::code(0);
                }
                (Some(s), ChildScript::ExitAfter { .. }) if s.is_termination_request() => {
                    return ChildExit::signaled(SIGTERM);
                }
                _ => {}
            },
        }
    }
}

/// Health probe whose answer is flipped from the test.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    healthy: Arc<AtomicBool>,
    hang: Arc<AtomicBool>,
    calls: Arc<AtomicU32>,
}

impl ScriptedProbe {
    fn with(healthy: bool, hang: bool) -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(healthy)),
            hang: Arc::new(AtomicBool::new(hang)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn healthy() -> Self {
        Self::with(true, false)
    }

    pub fn unhealthy() -> Self {
        Self::with(false, false)
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self::with(true, true)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HealthProbe for ScriptedProbe {
    async fn check(&self) -> Result<(), HealthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HealthError::Status(503))
        }
    }
}
