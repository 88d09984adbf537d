use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from supervisor.toml.
///
/// Every key is optional; the defaults match the layout the bot repository
/// ships with (`bot.py` next to a `.env` file, `logs/` and `run/` created on
/// demand). The config is built once in `main` and handed to the supervisor —
/// no component reads paths from its own location.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    pub bot: BotConfig,
    pub paths: PathsConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Display name used in status output and log lines.
    pub name: String,
    /// Interpreter the bot script runs under.
    pub command: String,
    /// Bot entry point script.
    pub script: PathBuf,
    /// Extra arguments appended after the script path.
    pub args: Vec<String>,
    /// Env file that must define `required_key` before a launch.
    pub env_file: PathBuf,
    /// Secret key that must be present and non-empty in `env_file`.
    pub required_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub log_dir: PathBuf,
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay before confirming a freshly launched process is still alive.
    pub settle_delay_secs: u64,
    /// How long to wait for a graceful exit before escalating to SIGKILL.
    pub stop_timeout_secs: u64,
    /// How long to wait for exit after SIGKILL.
    pub kill_timeout_secs: u64,
    /// Poll interval while waiting for an exit.
    pub poll_interval_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "gojo-bot".to_string(),
            command: "python3".to_string(),
            script: PathBuf::from("bot.py"),
            args: Vec::new(),
            env_file: PathBuf::from(".env"),
            required_key: "DISCORD_TOKEN".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            pid_file: PathBuf::from("run/gojo-bot.pid"),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 3,
            stop_timeout_secs: 10,
            kill_timeout_secs: 5,
            poll_interval_ms: 200,
        }
    }
}

impl SupervisorConfig {
    /// Load config from the given path. A missing file means defaults;
    /// an unreadable or malformed file is an error, since the supervisor
    /// mutates state based on what it reads here.
    pub fn load(path: &Path) -> Result<SupervisorConfig, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config file at {}, using defaults", path.display());
                return Ok(SupervisorConfig::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Path of the append-only log file the bot writes into.
    pub fn log_file(&self) -> PathBuf {
        self.paths.log_dir.join(format!("{}.log", self.bot.name))
    }

    /// Path of the lock file serializing mutating invocations.
    pub fn lock_file(&self) -> PathBuf {
        self.paths.pid_file.with_extension("lock")
    }

    /// Verify the env file defines the required secret with a non-empty value.
    ///
    /// The bot loads the env file itself; the supervisor only refuses to
    /// launch something that is guaranteed to die on a missing token.
    pub fn check_secret(&self) -> Result<(), ConfigError> {
        let path = &self.bot.env_file;
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::MissingEnvFile { path: path.clone() });
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: e,
                });
            }
        };
        match parse_env(&contents).get(&self.bot.required_key) {
            None => Err(ConfigError::MissingKey {
                key: self.bot.required_key.clone(),
                path: path.clone(),
            }),
            Some(value) if value.is_empty() => Err(ConfigError::EmptyKey {
                key: self.bot.required_key.clone(),
                path: path.clone(),
            }),
            Some(_) => Ok(()),
        }
    }
}

/// Parse KEY=VALUE lines the way the bot's dotenv loader does:
/// comments, blank lines, an optional `export` prefix, and single or
/// double quotes around the value.
fn parse_env(contents: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.trim().to_string(), value.to_string());
    }
    vars
}

/// Errors from loading the config file or validating the env file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    MissingEnvFile {
        path: PathBuf,
    },
    MissingKey {
        key: String,
        path: PathBuf,
    },
    EmptyKey {
        key: String,
        path: PathBuf,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            ConfigError::MissingEnvFile { path } => {
                write!(f, "env file {} does not exist", path.display())
            }
            ConfigError::MissingKey { key, path } => {
                write!(f, "{key} is not set in {}", path.display())
            }
            ConfigError::EmptyKey { key, path } => {
                write!(f, "{key} is empty in {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_with_env(env_file: PathBuf) -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.bot.env_file = env_file;
        config
    }

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.bot.name, "gojo-bot");
        assert_eq!(config.bot.command, "python3");
        assert_eq!(config.bot.script, PathBuf::from("bot.py"));
        assert_eq!(config.bot.required_key, "DISCORD_TOKEN");
        assert_eq!(config.timing.settle_delay_secs, 3);
        assert_eq!(config.timing.stop_timeout_secs, 10);
        assert_eq!(config.log_file(), PathBuf::from("logs/gojo-bot.log"));
        assert_eq!(config.lock_file(), PathBuf::from("run/gojo-bot.lock"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = SupervisorConfig::load(Path::new("/nonexistent/supervisor.toml")).unwrap();
        assert_eq!(config.bot.name, "gojo-bot");
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("supervisor.toml");
        std::fs::write(
            &path,
            "[bot]\nname = \"other-bot\"\n\n[timing]\nsettle_delay_secs = 1\n",
        )
        .unwrap();

        let config = SupervisorConfig::load(&path).unwrap();
        assert_eq!(config.bot.name, "other-bot");
        assert_eq!(config.timing.settle_delay_secs, 1);
        // untouched sections fall back
        assert_eq!(config.bot.command, "python3");
        assert_eq!(config.timing.stop_timeout_secs, 10);
    }

    #[test]
    fn test_load_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("supervisor.toml");
        std::fs::write(&path, "[bot\nname =").unwrap();

        let err = SupervisorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_parse_env_basics() {
        let vars = parse_env("DISCORD_TOKEN=abc123\nOTHER=x\n");
        assert_eq!(vars.get("DISCORD_TOKEN").unwrap(), "abc123");
        assert_eq!(vars.get("OTHER").unwrap(), "x");
    }

    #[test]
    fn test_parse_env_skips_comments_and_blanks() {
        let vars = parse_env("# a comment\n\nKEY=value\n");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("KEY").unwrap(), "value");
    }

    #[test]
    fn test_parse_env_export_and_quotes() {
        let vars = parse_env("export TOKEN=\"se cret\"\nSINGLE='v'\n");
        assert_eq!(vars.get("TOKEN").unwrap(), "se cret");
        assert_eq!(vars.get("SINGLE").unwrap(), "v");
    }

    #[test]
    fn test_parse_env_value_may_contain_equals() {
        let vars = parse_env("URL=https://example.com/?a=b\n");
        assert_eq!(vars.get("URL").unwrap(), "https://example.com/?a=b");
    }

    #[test]
    fn test_check_secret_ok() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "DISCORD_TOKEN=abc123\n").unwrap();

        config_with_env(env_path).check_secret().unwrap();
    }

    #[test]
    fn test_check_secret_missing_file() {
        let dir = tempdir().unwrap();
        let err = config_with_env(dir.path().join(".env"))
            .check_secret()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvFile { .. }));
    }

    #[test]
    fn test_check_secret_missing_key() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "OTHER=x\n").unwrap();

        let err = config_with_env(env_path).check_secret().unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
        assert!(err.to_string().contains("DISCORD_TOKEN"));
    }

    #[test]
    fn test_check_secret_empty_value() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "DISCORD_TOKEN=\"\"\n").unwrap();

        let err = config_with_env(env_path).check_secret().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyKey { .. }));
    }
}
