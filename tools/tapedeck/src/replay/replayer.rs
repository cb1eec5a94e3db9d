//! Re-send the inbound side of a recording to a target sink.

use crate::errors::TapeError;
use crate::logging::append_run_log;
use crate::replay::recording::{Direction, Recording};
use crate::runtime::{Clock, Terminal};
use serde_json::json;
use std::io::Write;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    pub dry_run: bool,
    /// Pause after each live send.
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub sent: usize,
    pub previewed: usize,
    pub skipped_outbound: usize,
}

pub fn replay(
    recording: &Recording,
    options: ReplayOptions,
    sink: &mut dyn Write,
    terminal: &dyn Terminal,
    clock: &dyn Clock,
) -> Result<ReplaySummary, TapeError> {
    append_run_log(
        "info",
        "replay.started",
        json!({
            "entries": recording.len(),
            "dry_run": options.dry_run,
            "delay_ms": options.delay.map(|d| d.as_millis() as u64),
        }),
    );

    let mut summary = ReplaySummary::default();
    for entry in recording {
        if entry.direction == Direction::Outbound {
            summary.skipped_outbound += 1;
            continue;
        }
        if options.dry_run {
            terminal.write_line(&format!("would send: {}", entry.payload_text()))?;
            summary.previewed += 1;
            continue;
        }
        sink.write_all(&entry.payload)
            .and_then(|_| sink.write_all(b"\n"))
            .and_then(|_| sink.flush())
            .map_err(|e| TapeError::Io(format!("replay send: {e}")))?;
        summary.sent += 1;
        if let Some(delay) = options.delay {
            clock.sleep(delay);
        }
    }

    append_run_log(
        "info",
        "replay.finished",
        json!({
            "sent": summary.sent,
            "previewed": summary.previewed,
            "skipped_outbound": summary.skipped_outbound,
        }),
    );
    Ok(summary)
}
