use std::sync::Arc;
use tapedeck::config::{AppConfig, VerifyConfig};
use tapedeck::errors::TapeError;
use tapedeck::replay::recorder::{record_proxy, RecordingSink};
use tapedeck::replay::recording::{Direction, Entry, Recording};
use tapedeck::replay::replayer::{replay, ReplayOptions};
use tapedeck::runtime::{
    FakeClock, FakeTerminal, ProcessRequest, ProcessRunner, ProductionProcessRunner,
};
use tapedeck::verify::{verify_recording, Framing};

// ── helpers ───────────────────────────────────────────────────────────────────

fn fixture(path: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(path)
}

fn line_config() -> VerifyConfig {
    AppConfig::default().verify
}

// ── record → verify ───────────────────────────────────────────────────────────

#[test]
fn proxied_session_verifies_against_the_same_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cat.txt");
    let process = ProductionProcessRunner
        .spawn_piped(ProcessRequest::shell("sh", "cat"))
        .expect("spawn cat");
    let sink = Arc::new(RecordingSink::create(&path).expect("sink"));
    let input = b"{\"method\":\"ping\",\"id\":1}\n{\"method\":\"ping\",\"id\":2}\n";
    let mut forwarded = Vec::new();

    let stats = record_proxy(&input[..], &mut forwarded, process, sink).expect("record");
    assert_eq!(stats.inbound, 2);
    assert_eq!(stats.outbound, 2);
    assert_eq!(forwarded, input.to_vec());

    let recording = Recording::load(&path).expect("load");
    assert_eq!(recording.count(Direction::Inbound), 2);
    assert_eq!(recording.count(Direction::Outbound), 2);

    // Inbound entries are captured before the server sees them, so both
    // requests precede both echoes.
    let interleaved = Recording::new(vec![
        recording.entries()[0].clone(),
        recording.entries()[2].clone(),
        recording.entries()[1].clone(),
        recording.entries()[3].clone(),
    ]);
    let report = verify_recording(&interleaved, "cat", &line_config(), &ProductionProcessRunner)
        .expect("verify");
    assert_eq!(report.sent, 2);
    assert_eq!(report.matched, 2);
}

// ── verify against real subprocesses ──────────────────────────────────────────

#[test]
fn verify_success_against_shell_mock() {
    let recording = Recording::new(vec![
        Entry::inbound(r#"{"x":1}"#),
        Entry::outbound(r#"{"ok":true}"#),
    ]);
    let report = verify_recording(
        &recording,
        r#"while read l; do echo '{"ok": true}'; done"#,
        &line_config(),
        &ProductionProcessRunner,
    )
    .expect("verify");
    assert_eq!(report.entries, 2);
}

#[test]
fn verify_failure_names_index_one() {
    let recording = Recording::new(vec![
        Entry::inbound(r#"{"x":1}"#),
        Entry::outbound(r#"{"ok":true}"#),
    ]);
    let err = verify_recording(
        &recording,
        r#"while read l; do echo '{"ok":false}'; done"#,
        &line_config(),
        &ProductionProcessRunner,
    )
    .expect_err("mismatch");
    match err {
        TapeError::Mismatch {
            index,
            expected,
            actual,
            ..
        } => {
            assert_eq!(index, 1);
            assert_eq!(expected, r#"{"ok":true}"#);
            assert_eq!(actual, r#"{"ok":false}"#);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn verify_reports_server_that_exits_early() {
    let recording = Recording::new(vec![
        Entry::inbound(r#"{"x":1}"#),
        Entry::outbound(r#"{"ok":true}"#),
    ]);
    let err = verify_recording(&recording, "exit 0", &line_config(), &ProductionProcessRunner)
        .expect_err("early exit");
    assert!(matches!(err, TapeError::Process(_)));
}

#[test]
fn byte_count_framing_matches_exact_length_responses() {
    let recording = Recording::load(&fixture("sessions/ping.txt")).expect("load");
    let config = VerifyConfig {
        framing: Framing::ByteCount,
        shell: "sh".to_string(),
    };
    verify_recording(
        &recording,
        r#"read l; echo '{"jsonrpc":"2.0","id":1,"result":{}}'"#,
        &config,
        &ProductionProcessRunner,
    )
    .expect("verify");
}

// ── replay ────────────────────────────────────────────────────────────────────

#[test]
fn replaying_a_fixture_sends_only_requests() {
    let recording = Recording::load(&fixture("sessions/list_tools.txt")).expect("load");
    let terminal = FakeTerminal::default();
    let clock = FakeClock::default();
    let mut sent = Vec::new();

    let summary = replay(
        &recording,
        ReplayOptions::default(),
        &mut sent,
        &terminal,
        &clock,
    )
    .expect("replay");
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.skipped_outbound, 1);
    assert_eq!(sent, b"{\"method\":\"ListTools\"}\n".to_vec());
}

#[test]
fn checked_in_golden_matches_its_fixture() {
    let fixture_recording = Recording::load(&fixture("sessions/list_tools.txt")).expect("fixture");
    let golden = Recording::load(&fixture("sessions/list_tools.golden")).expect("golden");
    tapedeck::golden::compare_recordings(&fixture_recording, &golden).expect("match");
}
