use crate::error::{Result, VigilError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod units;

/// Signals accepted as a graceful stop signal
pub const VALID_STOP_SIGNALS: [&str; 6] =
    ["SIGTERM", "SIGINT", "SIGQUIT", "SIGHUP", "SIGUSR1", "SIGUSR2"];

/// Static description of one supervisable unit
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    /// Unique identifier, taken from the `[processes.<name>]` key
    #[serde(skip)]
    pub name: String,

    /// Path to the executable to run
    #[serde(alias = "script")]
    pub executable: PathBuf,

    /// Command-line arguments
    #[serde(default, deserialize_with = "units::args")]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment overrides, applied over the supervisor's own environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether to automatically restart after an unrequested exit
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Maximum number of restarts within `restart_window`
    #[serde(default = "default_max_restarts", alias = "max_restarts_per_window")]
    pub max_restarts: usize,

    #[serde(default = "default_restart_window", deserialize_with = "units::duration")]
    pub restart_window: Duration,

    /// Runs shorter than this count as failed starts
    #[serde(default = "default_min_uptime", deserialize_with = "units::duration")]
    pub min_uptime: Duration,

    #[serde(default = "default_restart_delay", deserialize_with = "units::duration")]
    pub restart_delay: Duration,

    /// Multiplier applied to the restart delay per consecutive failure
    #[serde(default = "default_exp_backoff_base")]
    pub exp_backoff_base: f64,

    /// Upper bound for the backoff delay
    #[serde(default = "default_max_restart_delay", deserialize_with = "units::duration")]
    pub max_restart_delay: Duration,

    /// Memory limit in bytes; exceeding it triggers a graceful restart
    #[serde(
        default,
        alias = "max_memory_restart",
        deserialize_with = "units::optional_memory"
    )]
    pub max_memory_bytes: Option<u64>,

    /// Grace period between the stop signal and SIGKILL
    #[serde(default = "default_kill_timeout", deserialize_with = "units::duration")]
    pub kill_timeout: Duration,

    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// How long a fresh process must stay alive before it counts as Running
    #[serde(
        default,
        alias = "listen_timeout",
        deserialize_with = "units::optional_duration"
    )]
    pub start_confirm: Option<Duration>,

    /// Number of independent instances to run
    #[serde(default = "default_instances")]
    pub instances: usize,

    #[serde(default)]
    pub out_file: Option<PathBuf>,

    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// Let all instances share `out_file` / `error_file`
    #[serde(default)]
    pub merge_logs: bool,

    /// Overrides the supervisor's `log_date_format` for this spec
    #[serde(default)]
    pub log_date_format: Option<String>,

    // PM2 keys. `exp_backoff_restart_delay` replaces `restart_delay` at load;
    // the others are accepted only with the values vigil implements.
    #[serde(default, deserialize_with = "units::optional_duration")]
    exp_backoff_restart_delay: Option<Duration>,

    #[serde(default)]
    watch: bool,

    #[serde(default)]
    exec_mode: Option<String>,

    #[serde(default)]
    interpreter: Option<String>,
}

// Default value functions for serde
fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> usize {
    10
}

fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

fn default_min_uptime() -> Duration {
    Duration::from_secs(10)
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_exp_backoff_base() -> f64 {
    2.0
}

fn default_max_restart_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_instances() -> usize {
    1
}

impl ProcessSpec {
    /// Create a spec with default policy values
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            autorestart: default_autorestart(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            min_uptime: default_min_uptime(),
            restart_delay: default_restart_delay(),
            exp_backoff_base: default_exp_backoff_base(),
            max_restart_delay: default_max_restart_delay(),
            max_memory_bytes: None,
            kill_timeout: default_kill_timeout(),
            stop_signal: default_stop_signal(),
            start_confirm: None,
            instances: default_instances(),
            out_file: None,
            error_file: None,
            merge_logs: false,
            log_date_format: None,
            exp_backoff_restart_delay: None,
            watch: false,
            exec_mode: None,
            interpreter: None,
        }
    }

    /// Instance identifiers: the bare name for a single instance, `name-N` otherwise
    pub fn instance_ids(&self) -> Vec<String> {
        if self.instances == 1 {
            vec![self.name.clone()]
        } else {
            (0..self.instances)
                .map(|n| format!("{}-{}", self.name, n))
                .collect()
        }
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VigilError::Config("process name must not be empty".to_string()));
        }

        if self.executable.as_os_str().is_empty() {
            return Err(self.invalid("executable must not be empty"));
        }

        if self.instances == 0 {
            return Err(self.invalid("instances must be at least 1"));
        }

        if self.instances > 100 {
            return Err(self.invalid("instances cannot exceed 100"));
        }

        if self.max_restarts == 0 {
            return Err(self.invalid("max_restarts must be at least 1"));
        }

        for (field, value) in [
            ("restart_window", self.restart_window),
            ("min_uptime", self.min_uptime),
            ("restart_delay", self.restart_delay),
            ("max_restart_delay", self.max_restart_delay),
            ("kill_timeout", self.kill_timeout),
        ] {
            if value.is_zero() {
                return Err(self.invalid(&format!("{} must be greater than zero", field)));
            }
        }

        if self.start_confirm.is_some_and(|d| d.is_zero()) {
            return Err(self.invalid("start_confirm must be greater than zero"));
        }

        if self.max_restart_delay < self.restart_delay {
            return Err(self.invalid("max_restart_delay must not be shorter than restart_delay"));
        }

        if !self.exp_backoff_base.is_finite() || self.exp_backoff_base < 1.0 {
            return Err(self.invalid("exp_backoff_base must be a finite number >= 1.0"));
        }

        if self.max_memory_bytes == Some(0) {
            return Err(self.invalid("max_memory_bytes must be greater than zero"));
        }

        if !VALID_STOP_SIGNALS.contains(&self.stop_signal.as_str()) {
            return Err(self.invalid(&format!(
                "invalid stop_signal {}, must be one of: {}",
                self.stop_signal,
                VALID_STOP_SIGNALS.join(", ")
            )));
        }

        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(self.invalid(&format!("invalid environment variable name '{}'", key)));
        }

        if self.watch {
            return Err(self.invalid("watch is not supported, set it to false"));
        }

        if let Some(mode) = self.exec_mode.as_deref().filter(|m| *m != "fork") {
            return Err(self.invalid(&format!(
                "exec_mode {} is not supported, only fork",
                mode
            )));
        }

        if let Some(interpreter) = self.interpreter.as_deref().filter(|i| *i != "none") {
            return Err(self.invalid(&format!(
                "interpreter {} is not supported, set executable to the interpreter instead",
                interpreter
            )));
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(self.invalid(&format!(
                    "working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }

        Ok(())
    }

    fn invalid(&self, msg: &str) -> VigilError {
        VigilError::Config(format!("{}: {}", self.name, msg))
    }

    /// Expand `$VAR` and `${VAR}` references from the supervisor environment
    fn expand_env_vars(&mut self) {
        self.executable = expand_env_in_path(&self.executable);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }

        for arg in self.args.iter_mut() {
            *arg = expand_env_in_string(arg);
        }

        for value in self.env.values_mut() {
            *value = expand_env_in_string(value);
        }
    }
}

/// Settings for the supervisor itself (the `[supervisor]` table)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    /// Resource sampling period
    #[serde(default = "default_sample_interval", deserialize_with = "units::duration")]
    pub sample_interval: Duration,

    /// Directory for default per-process log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// chrono format string used to prefix forwarded log lines
    #[serde(default = "default_log_date_format")]
    pub log_date_format: String,

    /// Variables injected into every child; a spec's own `env` wins on conflict
    #[serde(default = "default_inject_env")]
    pub inject_env: HashMap<String, String>,
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_date_format() -> String {
    "%Y-%m-%d %H:%M:%S %z".to_string()
}

fn default_inject_env() -> HashMap<String, String> {
    HashMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())])
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            sample_interval: default_sample_interval(),
            log_dir: default_log_dir(),
            log_date_format: default_log_date_format(),
            inject_env: default_inject_env(),
        }
    }
}

impl SupervisorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval.is_zero() {
            return Err(VigilError::Config(
                "supervisor: sample_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A complete configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VigilConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Specs keyed by identifier; start order follows key order
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessSpec>,
}

impl VigilConfig {
    /// Load and validate a configuration file (TOML or JSON, chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VigilError::Config(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        match extension {
            "toml" => Self::from_toml_str(&contents),
            "json" => Self::from_json_str(&contents),
            _ => Err(VigilError::Config(format!(
                "Unsupported file format: {}. Use .toml or .json",
                extension
            ))),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: VigilConfig = toml::from_str(contents)
            .map_err(|e| VigilError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.finish()
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: VigilConfig = serde_json::from_str(contents)
            .map_err(|e| VigilError::Config(format!("Failed to parse JSON: {}", e)))?;
        config.finish()
    }

    /// Fill in names from the map keys, expand the environment and validate
    fn finish(mut self) -> Result<Self> {
        self.supervisor.validate()?;

        if self.processes.is_empty() {
            return Err(VigilError::Config(
                "No process configuration found in file".to_string(),
            ));
        }

        for (name, spec) in self.processes.iter_mut() {
            spec.name = name.clone();
            if let Some(delay) = spec.exp_backoff_restart_delay.take() {
                spec.restart_delay = delay;
            }
            spec.expand_env_vars();
            spec.validate()?;
        }

        Ok(self)
    }

    /// Specs in start order
    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.processes.values().cloned().collect()
    }
}

/// Expand environment variables in a string; unknown variables are left untouched
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => {
                result.push_str(&value);
                rest = &after[consumed..];
            }
            _ => {
                result.push('$');
                rest = after;
            }
        }
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const ECOSYSTEM: &str = r#"
        [supervisor]
        sample_interval = "2s"
        log_dir = "/tmp/vigil-logs"

        [processes.bot]
        script = "python"
        args = "run_bot.py"
        autorestart = true
        max_restarts = 10
        min_uptime = "10s"
        restart_delay = 5000
        max_memory_restart = "500M"
        kill_timeout = 5000
        start_confirm = 10000
        env = { NODE_ENV = "production", PYTHONUNBUFFERED = "1" }

        [processes.api]
        executable = "python"
        args = ["main.py", "--api"]
        restart_delay = "5s"
        env = { PORT = "8000" }
    "#;

    #[test]
    fn test_spec_defaults() {
        let spec = ProcessSpec::new("test", "/bin/echo");
        assert!(spec.autorestart);
        assert_eq!(spec.max_restarts, 10);
        assert_eq!(spec.restart_window, Duration::from_secs(60));
        assert_eq!(spec.min_uptime, Duration::from_secs(10));
        assert_eq!(spec.restart_delay, Duration::from_secs(5));
        assert_eq!(spec.kill_timeout, Duration::from_secs(5));
        assert_eq!(spec.stop_signal, "SIGTERM");
        assert_eq!(spec.instances, 1);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_parse_pm2_style_toml() {
        let config = VigilConfig::from_toml_str(ECOSYSTEM).unwrap();
        assert_eq!(config.processes.len(), 2);
        assert_eq!(config.supervisor.sample_interval, Duration::from_secs(2));

        let bot = &config.processes["bot"];
        assert_eq!(bot.name, "bot");
        assert_eq!(bot.executable, PathBuf::from("python"));
        assert_eq!(bot.args, vec!["run_bot.py"]);
        assert_eq!(bot.restart_delay, Duration::from_secs(5));
        assert_eq!(bot.max_memory_bytes, Some(500 * 1024 * 1024));
        assert_eq!(bot.start_confirm, Some(Duration::from_secs(10)));

        let api = &config.processes["api"];
        assert_eq!(api.args, vec!["main.py", "--api"]);
        assert_eq!(api.env.get("PORT"), Some(&"8000".to_string()));
        assert_eq!(api.max_memory_bytes, None);
    }

    #[test]
    fn test_start_order_follows_keys() {
        let config = VigilConfig::from_toml_str(ECOSYSTEM).unwrap();
        let names: Vec<String> = config.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["api", "bot"]);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "processes": {
                "worker": {
                    "executable": "/bin/sleep",
                    "args": ["30"],
                    "instances": 2,
                    "max_memory_bytes": 1048576
                }
            }
        }"#;

        let config = VigilConfig::from_json_str(json).unwrap();
        let worker = &config.processes["worker"];
        assert_eq!(worker.instances, 2);
        assert_eq!(worker.max_memory_bytes, Some(1024 * 1024));
        assert_eq!(worker.instance_ids(), vec!["worker-0", "worker-1"]);
        assert_eq!(
            config.supervisor.inject_env.get("PYTHONUNBUFFERED"),
            Some(&"1".to_string())
        );
    }

    #[test]
    fn test_validate_zero_duration() {
        let mut spec = ProcessSpec::new("test", "/bin/echo");
        spec.kill_timeout = Duration::ZERO;
        assert!(matches!(spec.validate(), Err(VigilError::Config(_))));
    }

    #[test]
    fn test_validate_negative_duration_is_rejected_at_parse() {
        let toml = r#"
            [processes.bad]
            executable = "/bin/echo"
            min_uptime = -5
        "#;
        assert!(matches!(
            VigilConfig::from_toml_str(toml),
            Err(VigilError::Config(_))
        ));
    }

    #[test]
    fn test_validate_empty_executable() {
        let spec = ProcessSpec::new("test", "");
        match spec.validate() {
            Err(VigilError::Config(msg)) => assert!(msg.contains("executable")),
            other => panic!("Expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_zero_instances() {
        let mut spec = ProcessSpec::new("test", "/bin/echo");
        spec.instances = 0;
        assert!(matches!(spec.validate(), Err(VigilError::Config(_))));
    }

    #[test]
    fn test_validate_backoff_base() {
        let mut spec = ProcessSpec::new("test", "/bin/echo");
        spec.exp_backoff_base = 0.5;
        assert!(spec.validate().is_err());

        spec.exp_backoff_base = f64::NAN;
        assert!(spec.validate().is_err());

        spec.exp_backoff_base = 1.0;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_signal() {
        let mut spec = ProcessSpec::new("test", "/bin/echo");
        spec.stop_signal = "SIGKILL".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_missing_cwd() {
        let mut spec = ProcessSpec::new("test", "/bin/echo");
        spec.cwd = Some(PathBuf::from("/nonexistent/directory"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_pm2_keys() {
        let toml = r#"
            [processes.bot]
            script = "python"
            interpreter = "none"
            exec_mode = "fork"
            watch = false
            listen_timeout = 10000
            restart_delay = 5000
            exp_backoff_restart_delay = 100
            log_date_format = "%H:%M:%S"
        "#;
        let config = VigilConfig::from_toml_str(toml).unwrap();
        let bot = &config.processes["bot"];
        assert_eq!(bot.start_confirm, Some(Duration::from_secs(10)));
        assert_eq!(bot.restart_delay, Duration::from_millis(100));
        assert_eq!(bot.log_date_format.as_deref(), Some("%H:%M:%S"));
    }

    #[test]
    fn test_unsupported_pm2_values() {
        for line in ["watch = true", "exec_mode = \"cluster\"", "interpreter = \"node\""] {
            let toml = format!("[processes.bot]\nscript = \"python\"\n{}\n", line);
            assert!(
                matches!(VigilConfig::from_toml_str(&toml), Err(VigilError::Config(_))),
                "{} should be rejected",
                line
            );
        }
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let toml = "[processes.bot]\nscript = \"python\"\nautorestat = false\n";
        let err = VigilConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("autorestat"));

        let toml = "[supervisor]\nsample_intervall = \"1s\"\n[processes.bot]\nscript = \"python\"\n";
        assert!(VigilConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(matches!(
            VigilConfig::from_toml_str("[supervisor]\nsample_interval = \"1s\""),
            Err(VigilError::Config(_))
        ));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("VIGIL_TEST_VAR", "test_value");
        std::env::set_var("VIGIL_TEST_PATH", "/tmp");

        let mut spec = ProcessSpec::new("test", "$VIGIL_TEST_PATH/script.sh");
        spec.args = vec!["--arg=${VIGIL_TEST_VAR}".to_string(), "$NOT_SET_ANYWHERE".to_string()];
        spec.cwd = Some(PathBuf::from("${VIGIL_TEST_PATH}"));
        spec.env
            .insert("KEY".to_string(), "$VIGIL_TEST_VAR".to_string());

        spec.expand_env_vars();

        assert_eq!(spec.executable, PathBuf::from("/tmp/script.sh"));
        assert_eq!(spec.args[0], "--arg=test_value");
        assert_eq!(spec.args[1], "$NOT_SET_ANYWHERE");
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env.get("KEY"), Some(&"test_value".to_string()));
    }

    #[test]
    fn test_from_file_formats() {
        let temp_dir = TempDir::new().unwrap();

        let toml_path = temp_dir.path().join("vigil.toml");
        fs::write(&toml_path, ECOSYSTEM).unwrap();
        assert_eq!(VigilConfig::from_file(&toml_path).unwrap().processes.len(), 2);

        let yaml_path = temp_dir.path().join("vigil.yaml");
        fs::write(&yaml_path, "processes: {}").unwrap();
        assert!(matches!(
            VigilConfig::from_file(&yaml_path),
            Err(VigilError::Config(_))
        ));
    }
}
