/// Spawns the bot process detached from the supervisor's session, with
/// stdout and stderr appended to the log file.
use crate::config::BotConfig;
use crate::logs::{LogError, LogSink};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Errors that can occur while launching the bot.
#[derive(Debug)]
pub enum LaunchError {
    /// The configured script does not exist.
    ScriptMissing { path: PathBuf },
    /// The log file could not be opened for redirection.
    Redirect { source: LogError },
    /// The OS refused the spawn (missing interpreter, permissions).
    Spawn { source: std::io::Error },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::ScriptMissing { path } => {
                write!(f, "bot script {} does not exist", path.display())
            }
            LaunchError::Redirect { source } => {
                write!(f, "failed to redirect bot output: {source}")
            }
            LaunchError::Spawn { source } => {
                write!(f, "failed to spawn bot process: {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::ScriptMissing { .. } => None,
            LaunchError::Redirect { source } => Some(source),
            LaunchError::Spawn { source } => Some(source),
        }
    }
}

/// Spawn the bot and return its pid immediately, without waiting for it
/// to initialize.
///
/// The child runs in its own process group so it survives this invocation
/// and the terminal session it came from, and its working directory is the
/// script's own directory — the bot resolves `commands/` and `.env`
/// relative to itself.
pub fn launch(bot: &BotConfig, log: &LogSink) -> Result<u32, LaunchError> {
    let script = bot
        .script
        .canonicalize()
        .map_err(|_| LaunchError::ScriptMissing {
            path: bot.script.clone(),
        })?;

    log.ensure()
        .map_err(|source| LaunchError::Redirect { source })?;
    let stdout = log
        .append_handle()
        .map_err(|source| LaunchError::Redirect { source })?;
    // File doesn't impl Clone; the child needs one handle per stream
    let stderr = stdout
        .try_clone()
        .map_err(|e| LaunchError::Spawn { source: e })?;

    let mut cmd = Command::new(&bot.command);
    cmd.arg(&script)
        .args(&bot.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0);
    if let Some(dir) = script.parent() {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| LaunchError::Spawn { source: e })?;
    let pid = child.id().ok_or_else(|| LaunchError::Spawn {
        source: std::io::Error::other("child exited before its pid could be read"),
    })?;

    tracing::info!(
        pid,
        command = %bot.command,
        script = %script.display(),
        "bot process launched"
    );
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn shell_bot(dir: &std::path::Path, body: &str) -> (BotConfig, LogSink) {
        let script = dir.join("bot.sh");
        std::fs::write(&script, body).unwrap();
        let bot = BotConfig {
            name: "test-bot".to_string(),
            command: "sh".to_string(),
            script,
            args: Vec::new(),
            env_file: dir.join(".env"),
            required_key: "DISCORD_TOKEN".to_string(),
        };
        let log = LogSink::new(dir.join("logs/test-bot.log"));
        (bot, log)
    }

    #[tokio::test]
    async fn test_launch_missing_script() {
        let dir = tempdir().unwrap();
        let (mut bot, log) = shell_bot(dir.path(), "");
        bot.script = dir.path().join("nope.sh");

        let err = launch(&bot, &log).unwrap_err();
        assert!(matches!(err, LaunchError::ScriptMissing { .. }));
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_launch_missing_interpreter() {
        let dir = tempdir().unwrap();
        let (mut bot, log) = shell_bot(dir.path(), "echo hi\n");
        bot.command = "no-such-interpreter-xyz".to_string();

        let err = launch(&bot, &log).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_launch_redirects_output_and_returns_pid() {
        let dir = tempdir().unwrap();
        let (bot, log) = shell_bot(dir.path(), "echo hello-from-child\n");

        let pid = launch(&bot, &log).unwrap();
        assert!(pid > 0);

        // the child runs on its own; give it a moment to write
        let mut contents = String::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            contents = std::fs::read_to_string(log.path()).unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
        }
        assert!(contents.contains("hello-from-child"));
    }

    #[tokio::test]
    async fn test_launch_appends_rather_than_truncates() {
        let dir = tempdir().unwrap();
        let (bot, log) = shell_bot(dir.path(), "echo second-run\n");
        log.note("first-run").unwrap();

        launch(&bot, &log).unwrap();

        let mut contents = String::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            contents = std::fs::read_to_string(log.path()).unwrap_or_default();
            if contents.contains("second-run") {
                break;
            }
        }
        assert!(contents.contains("first-run"));
        assert!(contents.contains("second-run"));
    }
}
