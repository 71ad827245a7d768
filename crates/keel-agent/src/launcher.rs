use anyhow::Context;
use keel_process::ChildExit;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::oneshot,
};

use crate::config::ServiceSpec;
use crate::signals::Signal;

/// A freshly started child: a handle for signalling it and a channel that
/// resolves once it has been reaped.
pub struct Launched<H> {
    pub handle: H,
    pub exited: oneshot::Receiver<ChildExit>,
}

pub trait ChildHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn signal(&self, sig: Signal) -> std::io::Result<()>;
}

pub trait Launcher: Send {
    type Handle: ChildHandle;

    fn launch(&mut self, spec: &ServiceSpec) -> anyhow::Result<Launched<Self::Handle>>;
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, make sure the service does not linger.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Spawns the service directly (no shell) in its own session so that signals
/// reach the whole process group and terminal signals only reach us.
#[derive(Debug, Default, Clone)]
pub struct OsLauncher;

#[derive(Debug, Clone)]
pub struct OsHandle {
    pid: Option<u32>,
    pgid: Option<i32>,
}

impl ChildHandle for OsHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn signal(&self, sig: Signal) -> std::io::Result<()> {
        let Some(pgid) = self.pgid else {
            return Err(std::io::Error::from_raw_os_error(libc::ESRCH));
        };
        let rc = unsafe { libc::kill(-pgid, sig.raw()) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal(&self, _sig: Signal) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are only supported on unix",
        ))
    }
}

#[cfg(unix)]
fn exit_from_status(status: std::process::ExitStatus) -> ChildExit {
    use std::os::unix::process::ExitStatusExt;
    ChildExit {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_from_status(status: std::process::ExitStatus) -> ChildExit {
    ChildExit {
        code: status.code(),
        signal: None,
    }
}

fn forward_lines<R>(reader: R, stream: &'static str, pid: Option<u32>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    // Drain until EOF whatever the bytes are; the child must never hit a closed pipe.
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    tracing::info!(target: "keel::service", stream, pid, "{line}");
                }
                Err(e) => {
                    tracing::warn!(stream, pid, error = %e, "service output reader failed");
                    break;
                }
            }
        }
    });
}

impl Launcher for OsLauncher {
    type Handle = OsHandle;

    fn launch(&mut self, spec: &ServiceSpec) -> anyhow::Result<Launched<OsHandle>> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", spec.command))?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        if let Some(out) = child.stdout.take() {
            forward_lines(out, "stdout", pid);
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, "stderr", pid);
        }

        let (tx, exited) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => exit_from_status(status),
                Err(e) => {
                    tracing::error!(error = %e, "waiting on service process failed");
                    ChildExit::default()
                }
            };
            let _ = tx.send(exit);
        });

        Ok(Launched {
            handle: OsHandle { pid, pgid },
            exited,
        })
    }
}
