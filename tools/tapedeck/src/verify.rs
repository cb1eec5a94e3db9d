//! Conformance verification: drive a live server with the inbound side of a
//! recording and compare every response against the recorded outbound side.

use crate::canonical::{first_difference, CanonicalValue};
use crate::config::VerifyConfig;
use crate::errors::{PayloadSide, TapeError};
use crate::logging::append_run_log;
use crate::replay::recording::{Direction, Recording};
use crate::runtime::{ProcessGuard, ProcessRequest, ProcessRunner};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};

/// How a candidate response is cut out of the server's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Read up to and including the next newline.
    Line,
    /// Read exactly the recorded payload length plus one terminator byte.
    ByteCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub entries: usize,
    pub sent: usize,
    pub matched: usize,
}

pub fn verify_recording(
    recording: &Recording,
    command: &str,
    config: &VerifyConfig,
    runner: &dyn ProcessRunner,
) -> Result<VerifyReport, TapeError> {
    let request = ProcessRequest::shell(&config.shell, command);
    append_run_log(
        "info",
        "verify.started",
        json!({
            "command": request.display(),
            "entries": recording.len(),
            "framing": config.framing,
        }),
    );

    let result = run_session(recording, request, config.framing, runner);
    match &result {
        Ok(report) => append_run_log(
            "info",
            "verify.finished",
            json!({
                "entries": report.entries,
                "sent": report.sent,
                "matched": report.matched,
            }),
        ),
        Err(err) => append_run_log(
            "error",
            "verify.failed",
            json!({
                "kind": err.kind(),
                "error": err.to_string(),
            }),
        ),
    }
    result
}

fn run_session(
    recording: &Recording,
    request: ProcessRequest,
    framing: Framing,
    runner: &dyn ProcessRunner,
) -> Result<VerifyReport, TapeError> {
    let mut process = ProcessGuard::new(runner.spawn_piped(request)?);
    let mut stdin = process
        .take_stdin()
        .ok_or_else(|| TapeError::Process("server stdin is not piped".to_string()))?;
    let mut stdout = BufReader::new(
        process
            .take_stdout()
            .ok_or_else(|| TapeError::Process("server stdout is not piped".to_string()))?,
    );

    let mut report = VerifyReport {
        entries: recording.len(),
        sent: 0,
        matched: 0,
    };

    for (index, entry) in recording.iter().enumerate() {
        match entry.direction {
            Direction::Inbound => {
                send_line(&mut stdin, &entry.payload)
                    .map_err(|e| TapeError::Process(format!("entry {index}: write to server: {e}")))?;
                report.sent += 1;
                append_run_log(
                    "debug",
                    "verify.entry.sent",
                    json!({ "index": index, "payload": entry.payload_text() }),
                );
            }
            Direction::Outbound => {
                let actual = read_response(&mut stdout, framing, entry.payload.len(), index)?;
                compare_payloads(index, &entry.payload, &actual)?;
                report.matched += 1;
                append_run_log(
                    "debug",
                    "verify.entry.matched",
                    json!({ "index": index }),
                );
            }
        }
    }

    drop(stdin);
    let code = process.wait()?;
    if code != 0 {
        return Err(TapeError::Process(format!(
            "server exited with status {code}"
        )));
    }
    Ok(report)
}

fn send_line(stdin: &mut dyn Write, payload: &[u8]) -> std::io::Result<()> {
    stdin.write_all(payload)?;
    stdin.write_all(b"\n")?;
    stdin.flush()
}

fn read_response(
    stdout: &mut BufReader<Box<dyn Read + Send>>,
    framing: Framing,
    recorded_len: usize,
    index: usize,
) -> Result<Vec<u8>, TapeError> {
    let mut raw = Vec::new();
    match framing {
        Framing::Line => {
            let read = stdout
                .read_until(b'\n', &mut raw)
                .map_err(|e| TapeError::Process(format!("entry {index}: read from server: {e}")))?;
            if read == 0 {
                return Err(TapeError::Process(format!(
                    "entry {index}: server closed its output before responding"
                )));
            }
        }
        Framing::ByteCount => {
            raw.resize(recorded_len + 1, 0);
            stdout.read_exact(&mut raw).map_err(|e| {
                TapeError::Process(format!(
                    "entry {index}: short read, wanted {} bytes: {e}",
                    recorded_len + 1
                ))
            })?;
        }
    }
    trim_trailing_whitespace(&mut raw);
    Ok(raw)
}

fn trim_trailing_whitespace(raw: &mut Vec<u8>) {
    while raw.last().is_some_and(|b| b.is_ascii_whitespace()) {
        raw.pop();
    }
}

fn compare_payloads(index: usize, recorded: &[u8], actual: &[u8]) -> Result<(), TapeError> {
    let expected = CanonicalValue::parse(recorded).map_err(|e| TapeError::Verification {
        index,
        side: PayloadSide::Recorded,
        message: e.to_string(),
    })?;
    let candidate = CanonicalValue::parse(actual).map_err(|e| TapeError::Verification {
        index,
        side: PayloadSide::Actual,
        message: e.to_string(),
    })?;
    if expected == candidate {
        return Ok(());
    }
    let path = first_difference(&expected, &candidate).unwrap_or_else(|| "$".to_string());
    Err(TapeError::Mismatch {
        index,
        detail: format!("response differs at {path}"),
        expected: String::from_utf8_lossy(recorded).into_owned(),
        actual: String::from_utf8_lossy(actual).into_owned(),
    })
}
