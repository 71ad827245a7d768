use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::process::Command;

use crate::execute::{StepOutput, StepRunner};
use crate::plan::{Step, StepKind};
use crate::requirements::Requirement;

/// One program invocation, run without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            env: Vec::new(),
        }
    }

    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

fn truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| truthy(&v))
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    pub python: String,
    pub apt_get: String,
    /// Local wheel directory passed as `--find-links` when the cache may be used.
    pub wheelhouse: Option<PathBuf>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            apt_get: "apt-get".to_string(),
            wheelhouse: None,
        }
    }
}

impl CommandRunner {
    pub fn from_env() -> Self {
        let mut runner = Self::default();
        if let Ok(v) = std::env::var("KEEL_PYTHON")
            && !v.trim().is_empty()
        {
            runner.python = v.trim().to_string();
        }
        runner.wheelhouse = std::env::var("KEEL_WHEELHOUSE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        runner
    }

    fn pip(&self, mut args: Vec<String>, use_cache: bool) -> CommandLine {
        let mut full = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        full.append(&mut args);
        if !use_cache {
            full.push("--no-cache-dir".to_string());
        }
        if use_cache && let Some(dir) = &self.wheelhouse {
            full.push("--find-links".to_string());
            full.push(dir.display().to_string());
        }
        CommandLine::new(&self.python, full)
    }

    fn pins(requirements: &[Requirement]) -> Vec<String> {
        requirements.iter().map(Requirement::pin).collect()
    }

    /// Renders a step to the commands it runs. `CacheClean` is handled in-process.
    pub fn commands(&self, step: &Step) -> Vec<CommandLine> {
        match &step.kind {
            StepKind::SystemPackage { packages } => {
                let mut install = vec![
                    "install".to_string(),
                    "-y".to_string(),
                    "--no-install-recommends".to_string(),
                ];
                install.extend(packages.iter().cloned());
                let mut update = CommandLine::new(&self.apt_get, vec!["update".to_string()]);
                let mut install = CommandLine::new(&self.apt_get, install);
                for c in [&mut update, &mut install] {
                    c.env
                        .push(("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()));
                }
                vec![update, install]
            }
            StepKind::PythonUpgrade { packages } => {
                let mut args = vec!["--upgrade".to_string()];
                args.extend(packages.iter().cloned());
                vec![self.pip(args, false)]
            }
            StepKind::BinaryOnlyInstall {
                requirements,
                use_cache,
            } => {
                let mut args = vec!["--only-binary=:all:".to_string()];
                args.extend(Self::pins(requirements));
                vec![self.pip(args, *use_cache)]
            }
            StepKind::SourceInstall {
                requirements,
                jobs,
                use_cache,
            } => {
                let mut cmd = self.pip(Self::pins(requirements), *use_cache);
                if let Some(n) = jobs {
                    cmd.env.push(("MAKEFLAGS".to_string(), format!("-j{n}")));
                    cmd.env
                        .push(("CMAKE_BUILD_PARALLEL_LEVEL".to_string(), n.to_string()));
                    cmd.env.push(("MAX_JOBS".to_string(), n.to_string()));
                }
                vec![cmd]
            }
            StepKind::CacheClean { .. } => Vec::new(),
        }
    }

    async fn run_command(&self, cmd: &CommandLine) -> anyhow::Result<(bool, String)> {
        tracing::info!(command = %cmd.display(), "exec");
        let out = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn {}", cmd.program))?;

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&out.stdout));
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        if !out.status.success() {
            text.push_str(&format!("\n{} exited with {}", cmd.display(), out.status));
        }
        Ok((out.status.success(), text))
    }
}

/// Removes the contents of `dir`, keeping the directory itself. Missing is fine.
pub async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

impl StepRunner for CommandRunner {
    async fn run(&mut self, _index: usize, step: &Step) -> StepOutput {
        if let StepKind::CacheClean { paths } = &step.kind {
            let mut problems = Vec::new();
            for p in paths {
                if let Err(e) = clear_dir(p).await {
                    problems.push(format!("{}: {e}", p.display()));
                }
            }
            return if problems.is_empty() {
                StepOutput::ok()
            } else {
                StepOutput::failed(problems.join("\n"))
            };
        }

        let mut transcript = String::new();
        for cmd in self.commands(step) {
            match self.run_command(&cmd).await {
                Ok((true, text)) => transcript.push_str(&text),
                Ok((false, text)) => {
                    transcript.push_str(&text);
                    return StepOutput::failed(transcript);
                }
                Err(e) => {
                    transcript.push_str(&format!("{e:#}"));
                    return StepOutput::failed(transcript);
                }
            }
        }
        StepOutput {
            success: true,
            diagnostic: transcript,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Constraints, StepKindName, resolve};

    fn args(c: &CommandLine) -> Vec<&str> {
        c.args.iter().map(String::as_str).collect()
    }

    #[test]
    fn system_packages_update_then_install() {
        let step = Step::required(StepKind::SystemPackage {
            packages: vec!["build-essential".to_string(), "libpq-dev".to_string()],
        });
        let cmds = CommandRunner::default().commands(&step);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].display(), "apt-get update");
        assert_eq!(
            args(&cmds[1]),
            vec!["install", "-y", "--no-install-recommends", "build-essential", "libpq-dev"]
        );
    }

    #[test]
    fn binary_only_install_disables_cache_unless_allowed() {
        let reqs = vec![Requirement::pinned("pandas", "2.2.2")];
        let runner = CommandRunner {
            wheelhouse: Some(PathBuf::from("/wheels")),
            ..CommandRunner::default()
        };

        let plan = resolve(
            &reqs,
            Constraints {
                binary_only: true,
                ..Constraints::default()
            },
        )
        .unwrap();
        let cmd = &runner.commands(&plan.steps[1])[0];
        assert_eq!(
            args(cmd),
            vec!["-m", "pip", "install", "--only-binary=:all:", "pandas==2.2.2", "--no-cache-dir"]
        );

        let plan = resolve(
            &reqs,
            Constraints {
                binary_only: true,
                offline_cache_allowed: true,
                ..Constraints::default()
            },
        )
        .unwrap();
        let cmd = &runner.commands(&plan.steps[1])[0];
        assert!(args(cmd).ends_with(&["--find-links", "/wheels"]));
        assert!(!args(cmd).contains(&"--no-cache-dir"));
    }

    #[test]
    fn memory_limited_source_install_caps_build_jobs() {
        let reqs = vec![Requirement::native("ta-lib", "0.4.28", &[])];
        let plan = resolve(
            &reqs,
            Constraints {
                memory_limited: true,
                ..Constraints::default()
            },
        )
        .unwrap();
        let step = plan
            .steps
            .iter()
            .find(|s| s.kind.name() == StepKindName::SourceInstall)
            .unwrap();
        let cmd = &CommandRunner::default().commands(step)[0];
        assert!(cmd.env.contains(&("MAKEFLAGS".to_string(), "-j1".to_string())));
        assert!(args(cmd).contains(&"ta-lib==0.4.28"));
    }

    #[tokio::test]
    async fn cache_clean_empties_directories_and_ignores_missing_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("pip");
        std::fs::create_dir_all(cache.join("http/abc")).unwrap();
        std::fs::write(cache.join("selfcheck.json"), b"{}").unwrap();

        let step = Step::best_effort(StepKind::CacheClean {
            paths: vec![cache.clone(), tmp.path().join("missing")],
        });
        let out = CommandRunner::default().run(0, &step).await;
        assert!(out.success, "{}", out.diagnostic);
        assert!(cache.exists());
        assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_diagnostic() {
        let mut runner = CommandRunner {
            python: "false".to_string(),
            ..CommandRunner::default()
        };
        let step = Step::required(StepKind::PythonUpgrade {
            packages: vec!["pip".to_string()],
        });
        let out = runner.run(0, &step).await;
        assert!(!out.success);
        assert!(out.diagnostic.contains("exited with"), "{}", out.diagnostic);
    }

    #[tokio::test]
    async fn missing_program_is_a_step_failure() {
        let mut runner = CommandRunner {
            python: "/nonexistent/keel-python".to_string(),
            ..CommandRunner::default()
        };
        let step = Step::required(StepKind::PythonUpgrade {
            packages: vec!["pip".to_string()],
        });
        let out = runner.run(0, &step).await;
        assert!(!out.success);
        assert!(out.diagnostic.contains("spawn /nonexistent/keel-python"));
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "YES", " on "] {
            assert!(truthy(v), "{v}");
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!truthy(v), "{v}");
        }
    }
}
