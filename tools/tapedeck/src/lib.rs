pub mod canonical;
pub mod config;
pub mod duration;
pub mod errors;
pub mod golden;
pub mod log_retention;
pub mod logging;
pub mod replay;
pub mod runtime;
pub mod verify;

use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, AppConfig, CliOverrides};
use errors::TapeError;
use logging::{append_run_log, init_run_logger, JsonlLogger};
use replay::recorder::{record_passthrough, record_proxy, RecordingSink};
use replay::recording::read_recording_file;
use replay::replayer::{replay, ReplayOptions};
use runtime::{ProcessRequest, ProductionRuntime};
use serde_json::json;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "tapedeck")]
#[command(about = "Record, replay, verify and golden-test line-delimited JSON sessions")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Capture a session into a recording file.
    Record {
        #[arg(long)]
        output: PathBuf,
        /// Read client traffic from a file instead of stdin.
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Write forwarded traffic to a file instead of stdout.
        #[arg(long)]
        output_file: Option<PathBuf>,
        /// Server command to proxy; without one, stdin is passed through to stdout.
        #[arg(last = true)]
        server: Vec<String>,
    },
    /// Re-send the inbound side of a recording.
    Replay {
        recording: PathBuf,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, value_parser = duration::parse_duration)]
        delay: Option<Duration>,
        #[arg(long)]
        output_file: Option<PathBuf>,
    },
    /// Check a live server against a recording.
    Verify {
        recording: PathBuf,
        #[arg(long)]
        server: String,
        /// Read exactly the recorded byte count for each response.
        #[arg(long, default_value_t = false)]
        strict_framing: bool,
    },
    /// Compare fixture recordings against their golden files.
    Golden {
        patterns: Vec<String>,
        #[arg(long, default_value_t = false)]
        update: bool,
    },
}

pub fn run() -> Result<i32, TapeError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &runtime)
}

pub fn run_with_runtime(args: &[OsString], runtime: &ProductionRuntime) -> Result<i32, TapeError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(TapeError::Usage(error.to_string())),
        },
    };

    let overrides = cli_overrides(&cli);
    let cfg = load_config(&overrides, runtime.file_system.as_ref())?;
    if let Some(path) = &cfg.logging.path {
        init_run_logger(JsonlLogger {
            path: path.clone(),
            max_payload_bytes: cfg.logging.max_payload_bytes,
            budget_bytes: cfg.logging.budget_bytes,
        });
    }

    let name = command_name(&cli.command);
    append_run_log("info", "command.started", json!({ "command": name }));
    let result = dispatch(cli.command, &cfg, runtime);
    match &result {
        Ok(code) => append_run_log(
            "info",
            "command.finished",
            json!({ "command": name, "exit_code": code }),
        ),
        Err(err) => append_run_log(
            "error",
            "command.failed",
            json!({
                "command": name,
                "kind": err.kind(),
                "error": err.to_string(),
            }),
        ),
    }
    result
}

fn cli_overrides(cli: &Cli) -> CliOverrides {
    let mut overrides = CliOverrides {
        config_path: cli.config.clone(),
        log_file: cli.log_file.clone(),
        ..CliOverrides::default()
    };
    match &cli.command {
        Command::Replay { dry_run, delay, .. } => {
            overrides.dry_run = *dry_run;
            overrides.delay = *delay;
        }
        Command::Verify { strict_framing, .. } => overrides.strict_framing = *strict_framing,
        Command::Golden { patterns, .. } => overrides.patterns = patterns.clone(),
        Command::Record { .. } => {}
    }
    overrides
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Record { .. } => "record",
        Command::Replay { .. } => "replay",
        Command::Verify { .. } => "verify",
        Command::Golden { .. } => "golden",
    }
}

fn dispatch(
    command: Command,
    cfg: &AppConfig,
    runtime: &ProductionRuntime,
) -> Result<i32, TapeError> {
    match command {
        Command::Record {
            output,
            input_file,
            output_file,
            server,
        } => {
            let sink = Arc::new(RecordingSink::create(&output)?);
            let input = open_input(input_file.as_ref())?;
            let forward = open_output(output_file.as_ref())?;
            let stats = if server.is_empty() {
                record_passthrough(input, forward, sink)?
            } else {
                let request = ProcessRequest::shell(&cfg.verify.shell, &server.join(" "));
                let process = runtime.process_runner.spawn_piped(request)?;
                record_proxy(input, forward, process, sink)?
            };
            runtime.terminal.write_error_line(&format!(
                "recorded {} entries ({} in, {} out) to {}",
                stats.total(),
                stats.inbound,
                stats.outbound,
                output.display()
            ))?;
            Ok(0)
        }
        Command::Replay {
            recording,
            output_file,
            ..
        } => {
            let recording = read_recording_file(&recording, runtime.file_system.as_ref())?;
            let options = ReplayOptions {
                dry_run: cfg.replay.dry_run,
                delay: cfg.replay.delay(),
            };
            let mut target: Box<dyn Write + Send> = if options.dry_run {
                Box::new(std::io::sink())
            } else {
                open_output(output_file.as_ref())?
            };
            let summary = replay(
                &recording,
                options,
                &mut target,
                runtime.terminal.as_ref(),
                runtime.clock.as_ref(),
            )?;
            if !options.dry_run {
                runtime
                    .terminal
                    .write_error_line(&format!("replayed {} entries", summary.sent))?;
            }
            Ok(0)
        }
        Command::Verify {
            recording, server, ..
        } => {
            let recording = read_recording_file(&recording, runtime.file_system.as_ref())?;
            verify::verify_recording(
                &recording,
                &server,
                &cfg.verify,
                runtime.process_runner.as_ref(),
            )?;
            runtime.terminal.write_line("verification successful")?;
            Ok(0)
        }
        Command::Golden { update, .. } => {
            let summary = golden::run_golden(
                &cfg.golden,
                update,
                runtime.file_system.as_ref(),
                runtime.terminal.as_ref(),
            )?;
            Ok(if summary.success() { 0 } else { 1 })
        }
    }
}

fn open_input(path: Option<&PathBuf>) -> Result<Box<dyn Read + Send>, TapeError> {
    match path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| TapeError::Io(format!("{}: {e}", path.display())))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(std::io::stdin())),
    }
}

fn open_output(path: Option<&PathBuf>) -> Result<Box<dyn Write + Send>, TapeError> {
    match path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| TapeError::Io(format!("{}: {e}", path.display())))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(std::io::stdout())),
    }
}
