//! Build-time dependency installation for the service image.
//!
//! A requirements file is parsed into pinned [`Requirement`]s, [`resolve`]d
//! against explicit [`Constraints`] into a declarative [`BuildPlan`], and the
//! plan is [`execute`]d step by step through a [`StepRunner`].

pub mod error;
pub mod execute;
pub mod plan;
pub mod report;
pub mod requirements;
pub mod runner;

pub use error::BuildError;
pub use execute::{BuildReport, StepOutcome, StepOutput, StepRecord, StepRunner, execute};
pub use plan::{BuildPlan, Constraints, Step, StepKind, StepKindName, resolve};
pub use requirements::{Requirement, parse_requirements};
pub use runner::CommandRunner;

impl Constraints {
    /// Reads `KEEL_BINARY_ONLY`, `KEEL_MEMORY_LIMITED` and `KEEL_OFFLINE_CACHE`.
    pub fn from_env() -> Self {
        Self {
            binary_only: runner::env_flag("KEEL_BINARY_ONLY"),
            memory_limited: runner::env_flag("KEEL_MEMORY_LIMITED"),
            offline_cache_allowed: runner::env_flag("KEEL_OFFLINE_CACHE"),
        }
    }
}
