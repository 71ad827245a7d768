use std::{
    collections::BTreeMap,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

use crate::signals::Signal;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_HEALTH_PATH: &str = "/health";
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_STARTUP_GRACE_MS: u64 = 60_000;
// Below the usual 10s container stop timeout so the forced kill is ours.
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 8_000;
const DEFAULT_MAX_RESTARTS: u32 = 3;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Everything the supervisor needs to run one service. Fixed once supervision starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Added on top of the supervisor's own environment.
    pub env: BTreeMap<String, String>,
    pub port: u16,
    pub health_url: String,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// When set, a 2xx reply must also carry this JSON `status` value.
    pub health_expect_status: Option<String>,
    pub startup_grace: Duration,
    pub shutdown_grace: Duration,
    /// 0 disables automatic restarts.
    pub max_restarts: u32,
    pub failure_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub stop_signal: Signal,
    pub status_file: Option<PathBuf>,
}

impl ServiceSpec {
    /// A spec with default timings for `command`; mostly useful in tests.
    pub fn for_command(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            env: BTreeMap::new(),
            port: DEFAULT_PORT,
            health_url: default_health_url(DEFAULT_PORT, DEFAULT_HEALTH_PATH),
            health_interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
            health_timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
            health_expect_status: None,
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            max_restarts: DEFAULT_MAX_RESTARTS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            stop_signal: Signal::Terminate,
            status_file: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command.trim().is_empty() {
            anyhow::bail!("no service command given (pass it as arguments or set `command`)");
        }
        if self.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            anyhow::bail!("environment keys must be non-empty and must not contain '='");
        }
        self.validate_health()
    }

    /// Checks only what a health probe needs.
    pub fn validate_health(&self) -> anyhow::Result<()> {
        if self.health_interval.is_zero() || self.health_timeout.is_zero() {
            anyhow::bail!("health interval and timeout must be non-zero");
        }
        if self.failure_threshold == 0 {
            anyhow::bail!("failure_threshold must be at least 1");
        }
        if self.backoff_max < self.backoff_initial {
            anyhow::bail!("restart backoff max must not be below the initial backoff");
        }
        let url = reqwest::Url::parse(&self.health_url)
            .with_context(|| format!("invalid health url: {}", self.health_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("health url must be http or https: {}", self.health_url);
        }
        Ok(())
    }

    /// Loads from `KEEL_CONFIG` (if set), `KEEL_*` variables and the process arguments.
    pub fn load() -> anyhow::Result<Self> {
        let env: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("KEEL_"))
            .collect();
        let file = match env.get("KEEL_CONFIG") {
            Some(path) => ServiceFile::read(Path::new(path))?,
            None => ServiceFile::default(),
        };
        let argv: Vec<String> = std::env::args().skip(1).collect();
        Self::from_sources(file, &env, &argv)
    }

    /// Like [`ServiceSpec::load`] but ignores the command; used by the one-shot probe.
    pub fn load_health() -> anyhow::Result<Self> {
        let env: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("KEEL_"))
            .collect();
        let file = match env.get("KEEL_CONFIG") {
            Some(path) => ServiceFile::read(Path::new(path))?,
            None => ServiceFile::default(),
        };
        let spec = Self::assemble(file, &env, &[])?;
        spec.validate_health()?;
        Ok(spec)
    }

    /// File values, overridden by environment, overridden by the command line.
    pub fn from_sources(
        file: ServiceFile,
        env: &BTreeMap<String, String>,
        argv: &[String],
    ) -> anyhow::Result<Self> {
        let spec = Self::assemble(file, env, argv)?;
        spec.validate()?;
        Ok(spec)
    }

    fn assemble(
        file: ServiceFile,
        env: &BTreeMap<String, String>,
        argv: &[String],
    ) -> anyhow::Result<Self> {
        let mut spec = Self::for_command("", &[]);

        if let Some(c) = file.command {
            spec.command = c;
        }
        spec.args = file.args;
        spec.working_dir = file.working_dir;
        spec.env = file.env;
        spec.health_expect_status = file.health_expect_status;
        spec.status_file = file.status_file;

        spec.port = env_parse::<u16>(env, "KEEL_PORT")
            .or(file.port)
            .unwrap_or(DEFAULT_PORT);

        let path = env
            .get("KEEL_HEALTH_PATH")
            .cloned()
            .or(file.health_path)
            .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
        spec.health_url = env
            .get("KEEL_HEALTH_URL")
            .cloned()
            .or(file.health_url)
            .unwrap_or_else(|| default_health_url(spec.port, &path));

        spec.health_interval = millis(
            env,
            "KEEL_HEALTH_INTERVAL_MS",
            file.health_interval_ms,
            DEFAULT_HEALTH_INTERVAL_MS,
            100..=10 * 60 * 1000,
        );
        spec.health_timeout = millis(
            env,
            "KEEL_HEALTH_TIMEOUT_MS",
            file.health_timeout_ms,
            DEFAULT_HEALTH_TIMEOUT_MS,
            100..=5 * 60 * 1000,
        );
        spec.startup_grace = millis(
            env,
            "KEEL_STARTUP_GRACE_MS",
            file.startup_grace_ms,
            DEFAULT_STARTUP_GRACE_MS,
            0..=60 * 60 * 1000,
        );
        spec.shutdown_grace = millis(
            env,
            "KEEL_SHUTDOWN_GRACE_MS",
            file.shutdown_grace_ms,
            DEFAULT_SHUTDOWN_GRACE_MS,
            0..=60 * 60 * 1000,
        );
        spec.backoff_initial = millis(
            env,
            "KEEL_RESTART_BACKOFF_MS",
            file.restart_backoff_ms,
            DEFAULT_BACKOFF_MS,
            100..=10 * 60 * 1000,
        );
        spec.backoff_max = millis(
            env,
            "KEEL_RESTART_BACKOFF_MAX_MS",
            file.restart_backoff_max_ms,
            DEFAULT_BACKOFF_MAX_MS,
            spec.backoff_initial.as_millis() as u64..=60 * 60 * 1000,
        );

        spec.max_restarts = env_parse::<u32>(env, "KEEL_MAX_RESTARTS")
            .or(file.max_restarts)
            .unwrap_or(DEFAULT_MAX_RESTARTS)
            .min(1000);
        spec.failure_threshold = env_parse::<u32>(env, "KEEL_FAILURE_THRESHOLD")
            .or(file.failure_threshold)
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD)
            .clamp(1, 100);

        if let Some(s) = env.get("KEEL_STOP_SIGNAL").cloned().or(file.stop_signal) {
            spec.stop_signal = s.parse()?;
        }
        if let Some(dir) = env.get("KEEL_WORKDIR") {
            spec.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = env.get("KEEL_HEALTH_EXPECT_STATUS") {
            spec.health_expect_status = Some(v.clone());
        }
        if let Some(v) = env.get("KEEL_STATUS_FILE") {
            spec.status_file = Some(PathBuf::from(v));
        }

        let argv = match argv.first() {
            Some(first) if first == "--" => &argv[1..],
            _ => argv,
        };
        if let Some((cmd, rest)) = argv.split_first() {
            spec.command = cmd.clone();
            spec.args = rest.to_vec();
        }

        Ok(spec)
    }
}

fn default_health_url(port: u16, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("http://127.0.0.1:{port}{path}")
}

fn env_parse<T: std::str::FromStr>(env: &BTreeMap<String, String>, name: &str) -> Option<T> {
    let raw = env.get(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable value");
            None
        }
    }
}

fn millis(
    env: &BTreeMap<String, String>,
    name: &str,
    file: Option<u64>,
    default: u64,
    range: RangeInclusive<u64>,
) -> Duration {
    let v = env_parse::<u64>(env, name).or(file).unwrap_or(default);
    Duration::from_millis(v.clamp(*range.start(), *range.end()))
}

/// On-disk TOML form. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceFile {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub port: Option<u16>,
    pub health_url: Option<String>,
    pub health_path: Option<String>,
    pub health_interval_ms: Option<u64>,
    pub health_timeout_ms: Option<u64>,
    pub health_expect_status: Option<String>,
    pub startup_grace_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub max_restarts: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub restart_backoff_ms: Option<u64>,
    pub restart_backoff_max_ms: Option<u64>,
    pub stop_signal: Option<String>,
    pub status_file: Option<PathBuf>,
}

impl ServiceFile {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("parse service config")
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read service config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn command_line_supplies_command_and_defaults_fill_the_rest() {
        let spec = ServiceSpec::from_sources(
            ServiceFile::default(),
            &env(&[]),
            &argv(&["--", "uvicorn", "src.main:app", "--port", "8000"]),
        )
        .unwrap();
        assert_eq!(spec.command, "uvicorn");
        assert_eq!(spec.args, vec!["src.main:app", "--port", "8000"]);
        assert_eq!(spec.health_url, "http://127.0.0.1:8000/health");
        assert_eq!(spec.stop_signal, Signal::Terminate);
        assert_eq!(spec.max_restarts, DEFAULT_MAX_RESTARTS);
    }

    #[test]
    fn env_overrides_file_and_argv_overrides_both() {
        let file = ServiceFile::parse(
            r#"
command = "python"
args = ["-m", "src.main"]
port = 9000
health_path = "ready"
health_interval_ms = 5000
max_restarts = 1
stop_signal = "SIGINT"
health_expect_status = "ok"

[env]
RUN_MODE = "live"
"#,
        )
        .unwrap();

        let spec = ServiceSpec::from_sources(
            file.clone(),
            &env(&[("KEEL_HEALTH_INTERVAL_MS", "2000"), ("KEEL_MAX_RESTARTS", "4")]),
            &[],
        )
        .unwrap();
        assert_eq!(spec.command, "python");
        assert_eq!(spec.args, vec!["-m", "src.main"]);
        assert_eq!(spec.health_url, "http://127.0.0.1:9000/ready");
        assert_eq!(spec.health_interval, Duration::from_secs(2));
        assert_eq!(spec.max_restarts, 4);
        assert_eq!(spec.stop_signal, Signal::Interrupt);
        assert_eq!(spec.health_expect_status.as_deref(), Some("ok"));
        assert_eq!(spec.env.get("RUN_MODE").map(String::as_str), Some("live"));

        let spec = ServiceSpec::from_sources(file, &env(&[]), &argv(&["gunicorn"])).unwrap();
        assert_eq!(spec.command, "gunicorn");
        assert!(spec.args.is_empty());
    }

    #[test]
    fn values_are_clamped_and_garbage_is_ignored() {
        let spec = ServiceSpec::from_sources(
            ServiceFile::default(),
            &env(&[
                ("KEEL_HEALTH_INTERVAL_MS", "1"),
                ("KEEL_FAILURE_THRESHOLD", "0"),
                ("KEEL_SHUTDOWN_GRACE_MS", "soon"),
            ]),
            &argv(&["sleep", "60"]),
        )
        .unwrap();
        assert_eq!(spec.health_interval, Duration::from_millis(100));
        assert_eq!(spec.failure_threshold, 1);
        assert_eq!(
            spec.shutdown_grace,
            Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS)
        );
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = ServiceSpec::from_sources(ServiceFile::default(), &env(&[]), &[]).unwrap_err();
        assert!(err.to_string().contains("no service command"));
    }

    #[test]
    fn health_only_config_needs_no_command() {
        let spec = ServiceSpec::assemble(
            ServiceFile::default(),
            &env(&[("KEEL_PORT", "8080")]),
            &[],
        )
        .unwrap();
        assert!(spec.validate().is_err());
        spec.validate_health().unwrap();
        assert_eq!(spec.health_url, "http://127.0.0.1:8080/health");
    }

    #[test]
    fn bad_health_url_and_unknown_keys_are_rejected() {
        let err = ServiceSpec::from_sources(
            ServiceFile::default(),
            &env(&[("KEEL_HEALTH_URL", "ftp://localhost/health")]),
            &argv(&["app"]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("http or https"));

        assert!(ServiceFile::parse("comand = \"typo\"").is_err());
    }

    #[test]
    fn reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "command = \"app\"\nshutdown_grace_ms = 2500\n").unwrap();
        let file = ServiceFile::read(&path).unwrap();
        let spec = ServiceSpec::from_sources(file, &env(&[]), &[]).unwrap();
        assert_eq!(spec.shutdown_grace, Duration::from_millis(2500));

        let err = ServiceFile::read(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("read service config"));
    }
}
