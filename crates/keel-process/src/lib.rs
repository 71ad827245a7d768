/// Exit code used when the child had to be killed after the shutdown grace period.
pub const EXIT_FORCED_SHUTDOWN: i32 = 124;

/// Exit code used when the child kept crashing and the restart budget ran out.
pub const EXIT_RESTARTS_EXHAUSTED: i32 = 125;

/// Identifies one supervisor run (one container lifetime).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
    Crashed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
    Failed,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Shell convention: plain exit code, or 128 + signal number.
    pub fn container_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(c), _) => c,
            (None, Some(s)) => 128 + s,
            (None, None) => 1,
        }
    }
}

/// Point-in-time view of the supervised process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub run_id: RunId,
    pub state: LifecycleState,
    pub health: HealthStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_exit: Option<ChildExit>,
    pub message: Option<String>,
}

impl ProcessStatus {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            state: LifecycleState::Starting,
            health: HealthStatus::Unknown,
            pid: None,
            restart_count: 0,
            last_exit: None,
            message: None,
        }
    }
}
