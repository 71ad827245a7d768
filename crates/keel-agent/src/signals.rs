use std::str::FromStr;

use tokio::sync::mpsc;

/// Signals the supervisor receives or sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
    User1,
    User2,
    Kill,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
            Signal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    pub fn raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Quit => libc::SIGQUIT,
            Signal::Hangup => libc::SIGHUP,
            Signal::User1 => libc::SIGUSR1,
            Signal::User2 => libc::SIGUSR2,
            Signal::Kill => libc::SIGKILL,
        }
    }

    /// Container stop requests: interactive interrupt, orchestrator stop, quit.
    pub fn is_termination_request(self) -> bool {
        matches!(self, Signal::Interrupt | Signal::Terminate | Signal::Quit)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(upper.as_str());
        Ok(match bare {
            "INT" => Signal::Interrupt,
            "TERM" => Signal::Terminate,
            "QUIT" => Signal::Quit,
            "HUP" => Signal::Hangup,
            "USR1" => Signal::User1,
            "USR2" => Signal::User2,
            "KILL" => Signal::Kill,
            _ => anyhow::bail!("unsupported signal: {s}"),
        })
    }
}

/// Registers handlers for every signal the supervisor cares about and forwards
/// arrivals into the returned channel. Registration happens before this returns
/// so nothing delivered afterwards falls through to the default disposition.
#[cfg(unix)]
pub fn listen() -> anyhow::Result<mpsc::Receiver<Signal>> {
    use anyhow::Context;
    use tokio::signal::unix::{SignalKind, signal};

    let (tx, rx) = mpsc::channel(16);
    let watched = [
        (Signal::Interrupt, SignalKind::interrupt()),
        (Signal::Terminate, SignalKind::terminate()),
        (Signal::Quit, SignalKind::quit()),
        (Signal::Hangup, SignalKind::hangup()),
        (Signal::User1, SignalKind::user_defined1()),
        (Signal::User2, SignalKind::user_defined2()),
    ];

    for (sig, kind) in watched {
        let mut stream = signal(kind).with_context(|| format!("install {sig} handler"))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

#[cfg(not(unix))]
pub fn listen() -> anyhow::Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(Signal::Interrupt).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}
