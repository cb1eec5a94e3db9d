//! Golden-file regression runner.
//!
//! Each fixture recording has a sibling golden file holding its canonical
//! encoding. Check mode compares the two entry by entry; update mode
//! rewrites the golden from the fixture.

use crate::config::GoldenConfig;
use crate::errors::TapeError;
use crate::logging::append_run_log;
use crate::replay::recording::{read_recording_file, Recording};
use crate::runtime::{FileSystem, Terminal};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum GoldenStatus {
    Passed,
    Updated {
        old_digest: Option<String>,
        new_digest: String,
    },
    Failed(TapeError),
}

#[derive(Debug)]
pub struct FixtureOutcome {
    pub fixture: PathBuf,
    pub golden: PathBuf,
    pub status: GoldenStatus,
}

impl FixtureOutcome {
    pub fn failed(&self) -> bool {
        matches!(self.status, GoldenStatus::Failed(_))
    }
}

#[derive(Debug, Default)]
pub struct GoldenSummary {
    pub outcomes: Vec<FixtureOutcome>,
    pub passed: usize,
    pub failed: usize,
    pub updated: usize,
}

impl GoldenSummary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// `testdata/foo.txt` → `testdata/foo.golden`. Any other fixture keeps its
/// full name: `testdata/foo.jsonl` → `testdata/foo.jsonl.golden`.
pub fn golden_path_for(fixture: &Path, extension: &str) -> PathBuf {
    if fixture.extension() == Some(OsStr::new("txt")) {
        return fixture.with_extension(extension);
    }
    let mut name = fixture.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn is_golden_file(path: &Path, extension: &str) -> bool {
    path.extension() == Some(OsStr::new(extension))
}

/// Expand patterns in order; matches within a pattern are sorted and a
/// fixture matched twice is only run once. Golden files themselves are never
/// fixtures.
pub fn discover_fixtures(
    patterns: &[String],
    golden_extension: &str,
    fs: &dyn FileSystem,
) -> Result<Vec<PathBuf>, TapeError> {
    let mut seen = BTreeSet::new();
    let mut fixtures = Vec::new();
    for pattern in patterns {
        for path in fs.glob(pattern)? {
            if is_golden_file(&path, golden_extension) {
                continue;
            }
            if seen.insert(path.clone()) {
                fixtures.push(path);
            }
        }
    }
    Ok(fixtures)
}

pub fn run_golden(
    config: &GoldenConfig,
    update: bool,
    fs: &dyn FileSystem,
    terminal: &dyn Terminal,
) -> Result<GoldenSummary, TapeError> {
    let fixtures = discover_fixtures(&config.patterns, &config.golden_extension, fs)?;
    append_run_log(
        "info",
        "golden.started",
        json!({
            "fixtures": fixtures.len(),
            "update": update,
        }),
    );

    let mut summary = GoldenSummary::default();
    let mut owners: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    for fixture in fixtures {
        let golden = golden_path_for(&fixture, &config.golden_extension);
        let result = if let Some(owner) = owners.get(&golden) {
            Err(TapeError::GoldenConflict {
                golden: golden.display().to_string(),
                fixture: owner.display().to_string(),
            })
        } else if update {
            update_fixture(&fixture, &golden, fs)
        } else {
            check_fixture(&fixture, &golden, fs).map(|_| GoldenStatus::Passed)
        };
        owners
            .entry(golden.clone())
            .or_insert_with(|| fixture.clone());
        let status = result.unwrap_or_else(GoldenStatus::Failed);
        report_outcome(&fixture, &status, terminal)?;
        match &status {
            GoldenStatus::Passed => summary.passed += 1,
            GoldenStatus::Updated { .. } => summary.updated += 1,
            GoldenStatus::Failed(_) => summary.failed += 1,
        }
        summary.outcomes.push(FixtureOutcome {
            fixture,
            golden,
            status,
        });
    }

    terminal.write_line(&format!(
        "golden: {} passed, {} failed, {} updated",
        summary.passed, summary.failed, summary.updated
    ))?;
    append_run_log(
        "info",
        "golden.finished",
        json!({
            "passed": summary.passed,
            "failed": summary.failed,
            "updated": summary.updated,
        }),
    );
    Ok(summary)
}

fn update_fixture(
    fixture: &Path,
    golden: &Path,
    fs: &dyn FileSystem,
) -> Result<GoldenStatus, TapeError> {
    let recording = read_recording_file(fixture, fs)?;
    let bytes = recording.to_bytes()?;
    let old_digest = if fs.exists(golden) {
        Some(short_digest(&fs.read(golden)?))
    } else {
        None
    };
    fs.write(golden, &bytes).map_err(|e| match e {
        TapeError::Io(message) => TapeError::Format(message),
        other => other,
    })?;
    Ok(GoldenStatus::Updated {
        old_digest,
        new_digest: short_digest(&bytes),
    })
}

fn check_fixture(fixture: &Path, golden: &Path, fs: &dyn FileSystem) -> Result<(), TapeError> {
    let got = read_recording_file(fixture, fs)?;
    if !fs.exists(golden) {
        return Err(TapeError::MissingGolden(golden.display().to_string()));
    }
    let want = read_recording_file(golden, fs)?;
    compare_recordings(&got, &want)
}

/// Byte-exact comparison of a fixture (`got`) against its golden (`want`).
pub fn compare_recordings(got: &Recording, want: &Recording) -> Result<(), TapeError> {
    if got.len() != want.len() {
        return Err(TapeError::EntryCount {
            expected: want.len(),
            actual: got.len(),
        });
    }
    for (index, (got, want)) in got.iter().zip(want.iter()).enumerate() {
        if got.direction != want.direction {
            return Err(TapeError::Mismatch {
                index,
                detail: "direction differs".to_string(),
                expected: want.direction.token().to_string(),
                actual: got.direction.token().to_string(),
            });
        }
        if got.payload != want.payload {
            return Err(TapeError::Mismatch {
                index,
                detail: "payload differs".to_string(),
                expected: want.payload_text(),
                actual: got.payload_text(),
            });
        }
    }
    Ok(())
}

fn short_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn report_outcome(
    fixture: &Path,
    status: &GoldenStatus,
    terminal: &dyn Terminal,
) -> Result<(), TapeError> {
    let name = fixture.display();
    match status {
        GoldenStatus::Passed => terminal.write_line(&format!("ok      {name}")),
        GoldenStatus::Updated {
            old_digest,
            new_digest,
        } => {
            let note = match old_digest {
                Some(old) if old == new_digest => "unchanged".to_string(),
                Some(old) => format!("{old} -> {new_digest}"),
                None => format!("created {new_digest}"),
            };
            append_run_log(
                "info",
                "golden.fixture.updated",
                json!({ "fixture": name.to_string(), "note": note }),
            );
            terminal.write_line(&format!("updated {name} ({note})"))
        }
        GoldenStatus::Failed(err) => {
            append_run_log(
                "warn",
                "golden.fixture.failed",
                json!({
                    "fixture": name.to_string(),
                    "kind": err.kind(),
                    "error": err.to_string(),
                }),
            );
            terminal.write_error_line(&format!("FAIL    {name}: {err}"))
        }
    }
}
