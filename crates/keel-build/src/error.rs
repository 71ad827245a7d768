use crate::plan::StepKindName;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid requirement on line {line}: {reason}")]
    InvalidRequirement { line: usize, reason: String },

    /// Constraints cannot be met together; raised before any step runs.
    #[error("unsatisfiable constraint: {reason} ({})", packages.join(", "))]
    UnsatisfiableConstraint {
        reason: String,
        packages: Vec<String>,
    },

    #[error("invalid build plan: {0}")]
    InvalidPlan(String),

    #[error("step {index} ({kind}) failed")]
    StepExecutionFailure {
        index: usize,
        kind: StepKindName,
        diagnostic: String,
    },
}

impl BuildError {
    /// Stable machine-readable code for the failure report.
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::InvalidRequirement { .. } => "invalid_requirement",
            BuildError::UnsatisfiableConstraint { .. } => "unsatisfiable_constraint",
            BuildError::InvalidPlan(_) => "invalid_plan",
            BuildError::StepExecutionFailure { .. } => "step_execution_failure",
        }
    }
}
