use std::path::PathBuf;

use crate::error::BuildError;
use crate::requirements::Requirement;

/// Compiler toolchain needed by any requirement that builds native code.
pub const TOOLCHAIN_PACKAGES: &[&str] = &["build-essential", "python3-dev"];

/// Installer tooling refreshed before dependencies go in.
pub const INSTALLER_PACKAGES: &[&str] = &["pip", "setuptools", "wheel"];

pub const PIP_CACHE_DIR: &str = "/root/.cache/pip";
pub const APT_LISTS_DIR: &str = "/var/lib/apt/lists";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Constraints {
    /// Reject anything without a prebuilt artifact instead of compiling it.
    pub binary_only: bool,
    /// Compile one package at a time with a single build job.
    pub memory_limited: bool,
    /// The installer cache may be reused and is kept after the build.
    pub offline_cache_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    SystemPackage {
        packages: Vec<String>,
    },
    PythonUpgrade {
        packages: Vec<String>,
    },
    BinaryOnlyInstall {
        requirements: Vec<Requirement>,
        use_cache: bool,
    },
    SourceInstall {
        requirements: Vec<Requirement>,
        /// Build parallelism cap; `None` leaves the toolchain default.
        jobs: Option<u32>,
        use_cache: bool,
    },
    CacheClean {
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKindName {
    SystemPackage,
    PythonUpgrade,
    BinaryOnlyInstall,
    SourceInstall,
    CacheClean,
}

impl std::fmt::Display for StepKindName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StepKindName::SystemPackage => "system-package",
            StepKindName::PythonUpgrade => "python-upgrade",
            StepKindName::BinaryOnlyInstall => "binary-only-install",
            StepKindName::SourceInstall => "source-install",
            StepKindName::CacheClean => "cache-clean",
        })
    }
}

impl StepKind {
    pub fn name(&self) -> StepKindName {
        match self {
            StepKind::SystemPackage { .. } => StepKindName::SystemPackage,
            StepKind::PythonUpgrade { .. } => StepKindName::PythonUpgrade,
            StepKind::BinaryOnlyInstall { .. } => StepKindName::BinaryOnlyInstall,
            StepKind::SourceInstall { .. } => StepKindName::SourceInstall,
            StepKind::CacheClean { .. } => StepKindName::CacheClean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    pub must_succeed: bool,
    /// Index of the step to run if this one fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<usize>,
}

impl Step {
    pub fn required(kind: StepKind) -> Self {
        Self {
            kind,
            must_succeed: true,
            fallback: None,
        }
    }

    pub fn best_effort(kind: StepKind) -> Self {
        Self {
            kind,
            must_succeed: false,
            fallback: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BuildPlan {
    pub steps: Vec<Step>,
}

impl BuildPlan {
    /// Adds a step and returns its index.
    pub fn push(&mut self, step: Step) -> usize {
        self.steps.push(step);
        self.steps.len() - 1
    }

    /// Adds `step` together with a fallback that only runs if it fails.
    pub fn push_with_fallback(&mut self, mut step: Step, fallback: Step) -> usize {
        let parent = self.steps.len();
        step.fallback = Some(parent + 1);
        self.steps.push(step);
        self.steps.push(fallback);
        parent
    }

    pub fn is_fallback(&self, index: usize) -> bool {
        self.steps.iter().any(|s| s.fallback == Some(index))
    }

    /// Indices executed in the normal sequence (everything that is not a fallback target).
    pub fn primary_indices(&self) -> Vec<usize> {
        (0..self.steps.len())
            .filter(|i| !self.is_fallback(*i))
            .collect()
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        let mut targeted = vec![false; self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            let Some(fb) = step.fallback else {
                continue;
            };
            if fb >= self.steps.len() {
                return Err(BuildError::InvalidPlan(format!(
                    "step {i} falls back to missing step {fb}"
                )));
            }
            if fb == i {
                return Err(BuildError::InvalidPlan(format!(
                    "step {i} falls back to itself"
                )));
            }
            if targeted[fb] {
                return Err(BuildError::InvalidPlan(format!(
                    "step {fb} is the fallback of more than one step"
                )));
            }
            if self.steps[fb].fallback.is_some() {
                return Err(BuildError::InvalidPlan(format!(
                    "fallback step {fb} has its own fallback"
                )));
            }
            targeted[fb] = true;
        }
        Ok(())
    }
}

fn push_unique(out: &mut Vec<String>, p: &str) {
    if !out.iter().any(|x| x == p) {
        out.push(p.to_string());
    }
}

fn source_install(
    requirements: Vec<Requirement>,
    constraints: Constraints,
) -> StepKind {
    StepKind::SourceInstall {
        requirements,
        jobs: constraints.memory_limited.then_some(1),
        use_cache: constraints.offline_cache_allowed,
    }
}

fn cache_clean(constraints: Constraints) -> StepKind {
    let mut paths = Vec::new();
    if !constraints.offline_cache_allowed {
        paths.push(PathBuf::from(PIP_CACHE_DIR));
    }
    paths.push(PathBuf::from(APT_LISTS_DIR));
    StepKind::CacheClean { paths }
}

fn installer_upgrade() -> Step {
    Step::required(StepKind::PythonUpgrade {
        packages: INSTALLER_PACKAGES.iter().map(|s| s.to_string()).collect(),
    })
}

/// Chooses an installation plan for `requirements` under `constraints`.
pub fn resolve(
    requirements: &[Requirement],
    constraints: Constraints,
) -> Result<BuildPlan, BuildError> {
    let mut plan = BuildPlan::default();

    if requirements.is_empty() {
        plan.push(Step::best_effort(cache_clean(constraints)));
        return Ok(plan);
    }

    let (native, prebuilt): (Vec<Requirement>, Vec<Requirement>) = requirements
        .iter()
        .cloned()
        .partition(Requirement::is_native);

    if constraints.binary_only {
        if !native.is_empty() {
            return Err(BuildError::UnsatisfiableConstraint {
                reason: "binary-only build requested but no prebuilt artifact is known for"
                    .to_string(),
                packages: native.iter().map(Requirement::pin).collect(),
            });
        }

        plan.push(installer_upgrade());
        plan.push(Step::required(StepKind::BinaryOnlyInstall {
            requirements: prebuilt,
            use_cache: constraints.offline_cache_allowed,
        }));
        plan.push(Step::best_effort(cache_clean(constraints)));
        return Ok(plan);
    }

    if !native.is_empty() {
        plan.push(Step::required(StepKind::SystemPackage {
            packages: TOOLCHAIN_PACKAGES.iter().map(|s| s.to_string()).collect(),
        }));

        let mut extra = Vec::new();
        for r in &native {
            for p in r.native.iter().flatten() {
                if !TOOLCHAIN_PACKAGES.contains(&p.as_str()) {
                    push_unique(&mut extra, p);
                }
            }
        }
        if !extra.is_empty() {
            plan.push(Step::required(StepKind::SystemPackage { packages: extra }));
        }
    }

    plan.push(installer_upgrade());

    if !prebuilt.is_empty() {
        plan.push_with_fallback(
            Step::required(StepKind::BinaryOnlyInstall {
                requirements: prebuilt.clone(),
                use_cache: constraints.offline_cache_allowed,
            }),
            Step::required(source_install(prebuilt, constraints)),
        );
    }

    if !native.is_empty() {
        if constraints.memory_limited {
            for r in native {
                plan.push(Step::required(source_install(vec![r], constraints)));
            }
        } else {
            plan.push(Step::required(source_install(native, constraints)));
        }
    }

    plan.push(Step::best_effort(cache_clean(constraints)));
    Ok(plan)
}
