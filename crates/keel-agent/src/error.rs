use std::time::Duration;

use crate::health::HealthError;
use crate::signals::Signal;

/// Run-time failures the supervisor reacts to. Only threshold-exceeding and
/// restart-exhausting ones are visible outside, through the exit code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisorError {
    #[error("service failed to start: {0}")]
    StartupFailure(String),

    #[error("service exited unexpectedly with code {0}")]
    UnexpectedExit(i32),

    #[error("health check timed out after {}ms", .0.as_millis())]
    HealthCheckTimeout(Duration),

    #[error("health check failed: {0}")]
    HealthCheckUnreachable(String),

    #[error("{failures} consecutive health check failures")]
    HealthThresholdExceeded { failures: u32 },

    #[error("service ignored {signal} for {}ms; killed", grace.as_millis())]
    ShutdownTimeout { signal: Signal, grace: Duration },

    #[error("restart limit of {0} reached")]
    RestartsExhausted(u32),
}

impl From<HealthError> for SupervisorError {
    fn from(e: HealthError) -> Self {
        match e {
            HealthError::Timeout(d) => SupervisorError::HealthCheckTimeout(d),
            other => SupervisorError::HealthCheckUnreachable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_errors_map_onto_taxonomy() {
        let d = Duration::from_millis(1500);
        assert_eq!(
            SupervisorError::from(HealthError::Timeout(d)),
            SupervisorError::HealthCheckTimeout(d)
        );
        let e = SupervisorError::from(HealthError::Status(503));
        assert_eq!(e.to_string(), "health check failed: health endpoint returned HTTP 503");
    }
}
