mod config;
mod launcher;
mod logs;
mod pidfile;
mod probe;
mod supervisor;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use config::SupervisorConfig;
use logs::LogSink;
use supervisor::{State, Supervisor, SupervisorError};

/// Single-instance supervisor for the Gojo Discord bot: launch it detached,
/// track it through a pid record, stop it gracefully (then forcefully), and
/// tail its log.
#[derive(Parser, Debug)]
#[command(name = "supervisor", version, about, arg_required_else_help = true)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "supervisor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the bot and confirm it survives the settle delay
    Start,
    /// Ask the bot to exit, escalating to SIGKILL on timeout
    Stop,
    /// Stop the bot if running, pause, then start it again
    Restart,
    /// Report whether the bot is running, with memory and uptime
    Status,
    /// Print the last N log lines, or follow the log live when N is omitted
    Logs {
        /// Number of lines to print
        #[arg(value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
        lines: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap renders --help/--version through this path too; those
            // are not failures
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".parse().unwrap()),
        )
        .init();

    let config = match SupervisorConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: SupervisorConfig) -> Result<(), SupervisorError> {
    match command {
        Command::Start => {
            let mut sup = Supervisor::new(config);
            let pid = sup.start().await?;
            println!("{} started (pid {pid})", sup.config().bot.name);
        }
        Command::Stop => {
            let mut sup = Supervisor::new(config);
            let report = sup.stop().await?;
            if report.forced {
                println!(
                    "{} killed after graceful-stop timeout (pid {})",
                    sup.config().bot.name,
                    report.pid
                );
            } else {
                println!("{} stopped (pid {})", sup.config().bot.name, report.pid);
            }
        }
        Command::Restart => {
            let mut sup = Supervisor::new(config);
            let pid = sup.restart().await?;
            println!("{} restarted (pid {pid})", sup.config().bot.name);
        }
        Command::Status => {
            let mut sup = Supervisor::new(config);
            let report = sup.status();
            if report.cleared_stale {
                println!("cleared stale pid record");
            }
            match (report.state, report.pid) {
                (State::Running, Some(pid)) => {
                    println!("{}: running (pid {pid})", sup.config().bot.name);
                    if let Some(metrics) = report.metrics {
                        println!("  memory: {}", format_memory(metrics.memory_bytes));
                        println!("  uptime: {}", format_uptime(metrics.uptime_secs));
                    }
                }
                _ => println!("{}: stopped", sup.config().bot.name),
            }
        }
        Command::Logs { lines } => {
            let log = LogSink::new(config.log_file());
            match lines {
                Some(n) => {
                    for line in log.tail(n as usize)? {
                        println!("{line}");
                    }
                }
                None => {
                    eprintln!("following {} (Ctrl-C to stop)", log.path().display());
                    log.follow().await?;
                }
            }
        }
    }
    Ok(())
}

fn report_error(err: &SupervisorError) {
    eprintln!("error: {err}");
    if let SupervisorError::StartupFailed { tail } = err {
        if !tail.is_empty() {
            eprintln!("--- last log lines ---");
            for line in tail {
                eprintln!("{line}");
            }
        }
    }
}

fn format_memory(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use clap::error::ErrorKind;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_logs_rejects_zero_lines() {
        let err = Cli::try_parse_from(["supervisor", "logs", "0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_logs_accepts_a_positive_count() {
        let cli = Cli::try_parse_from(["supervisor", "logs", "25"]).unwrap();
        assert!(matches!(cli.command, Command::Logs { lines: Some(25) }));
    }

    #[test]
    fn test_unknown_command_is_an_error_naming_the_token() {
        let err = Cli::try_parse_from(["supervisor", "frobnicate"]).unwrap_err();
        assert!(err.use_stderr());
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_empty_invocation_shows_help_on_stderr() {
        let err = Cli::try_parse_from(["supervisor"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_help_is_not_a_failure() {
        let err = Cli::try_parse_from(["supervisor", "--help"]).unwrap_err();
        assert!(!err.use_stderr());
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(48 * 1024 * 1024), "48.0 MiB");
        assert_eq!(format_memory(1_572_864), "1.5 MiB");
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(65), "1m 05s");
        assert_eq!(format_uptime(2 * 3600 + 13 * 60 + 5), "2h 13m 05s");
    }
}
