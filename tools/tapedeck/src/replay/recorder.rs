//! Live session capture: tee a byte stream into a recording while passing it
//! through unchanged.
//!
//! The sink is an owned handle shared through `Arc`; every append takes its
//! single mutex, so entries from the reader and writer threads land in one
//! total order.

use crate::errors::TapeError;
use crate::logging::append_run_log;
use crate::replay::recording::{encode, Direction, Entry};
use crate::runtime::{PipedProcess, ProcessGuard};
use serde_json::json;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

// ── RecordingSink ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub inbound: usize,
    pub outbound: usize,
}

impl RecordStats {
    pub fn total(&self) -> usize {
        self.inbound + self.outbound
    }
}

struct SinkState {
    writer: Box<dyn Write + Send>,
    stats: RecordStats,
}

pub struct RecordingSink {
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            state: Mutex::new(SinkState {
                writer: Box::new(writer),
                stats: RecordStats::default(),
            }),
        }
    }

    /// Create (or truncate) the recording file at `path`.
    pub fn create(path: &Path) -> Result<Self, TapeError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| TapeError::Format(format!("create {}: {e}", parent.display())))?;
        }
        let file = File::create(path)
            .map_err(|e| TapeError::Format(format!("create {}: {e}", path.display())))?;
        Ok(Self::new(file))
    }

    /// Append the lines of one observed chunk. All of them are written under a
    /// single lock acquisition, so a chunk is never interleaved with another.
    pub fn append_chunk(&self, direction: Direction, chunk: &[u8]) -> Result<usize, TapeError> {
        let lines: Vec<Vec<u8>> = chunk_lines(chunk)
            .map(|segment| {
                encode(&Entry {
                    direction,
                    payload: segment.to_vec(),
                })
            })
            .collect::<Result<_, _>>()?;
        if lines.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock()?;
        for line in &lines {
            write_line(&mut state, direction, line)?;
        }
        Ok(lines.len())
    }

    pub fn stats(&self) -> Result<RecordStats, TapeError> {
        Ok(self.lock()?.stats)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SinkState>, TapeError> {
        self.state
            .lock()
            .map_err(|_| TapeError::Io("recording sink lock poisoned".to_string()))
    }
}

fn write_line(state: &mut SinkState, direction: Direction, line: &[u8]) -> Result<(), TapeError> {
    state
        .writer
        .write_all(line)
        .and_then(|_| state.writer.flush())
        .map_err(|e| TapeError::Format(format!("write recording: {e}")))?;
    match direction {
        Direction::Inbound => state.stats.inbound += 1,
        Direction::Outbound => state.stats.outbound += 1,
    }
    Ok(())
}

/// Split a chunk at `\n`, dropping terminators, trailing `\r`s and empty segments.
fn chunk_lines(chunk: &[u8]) -> impl Iterator<Item = &[u8]> {
    chunk
        .split(|b| *b == b'\n')
        .map(|segment| {
            let kept = segment.iter().rposition(|b| *b != b'\r').map_or(0, |i| i + 1);
            &segment[..kept]
        })
        .filter(|segment| !segment.is_empty())
}

// ── Tee adapters ──────────────────────────────────────────────────────────────

/// Records every chunk read from `inner` as inbound entries.
pub struct TeeReader<R> {
    inner: R,
    sink: Arc<RecordingSink>,
}

impl<R: Read> TeeReader<R> {
    pub fn new(inner: R, sink: Arc<RecordingSink>) -> Self {
        Self { inner, sink }
    }
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sink
                .append_chunk(Direction::Inbound, &buf[..n])
                .map_err(|e| io::Error::other(e.to_string()))?;
        }
        Ok(n)
    }
}

/// Records the bytes actually accepted by `inner` as outbound entries.
pub struct TeeWriter<W> {
    inner: W,
    sink: Arc<RecordingSink>,
}

impl<W: Write> TeeWriter<W> {
    pub fn new(inner: W, sink: Arc<RecordingSink>) -> Self {
        Self { inner, sink }
    }
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.sink
                .append_chunk(Direction::Outbound, &buf[..n])
                .map_err(|e| io::Error::other(e.to_string()))?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `writer` until EOF, flushing after every chunk.
pub fn pump(reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        writer.flush()?;
        copied += n as u64;
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Pass `input` through to `output`, recording it as inbound traffic.
pub fn record_passthrough(
    input: impl Read,
    mut output: impl Write,
    sink: Arc<RecordingSink>,
) -> Result<RecordStats, TapeError> {
    append_run_log("info", "record.started", json!({ "mode": "passthrough" }));
    let mut reader = TeeReader::new(input, Arc::clone(&sink));
    pump(&mut reader, &mut output).map_err(|e| TapeError::Io(format!("passthrough: {e}")))?;
    let stats = sink.stats()?;
    log_finished(stats);
    Ok(stats)
}

/// Sit between a client (`input`/`output`) and a server subprocess, recording
/// both directions. Returns once `input` is exhausted and the server has
/// closed its output.
pub fn record_proxy(
    input: impl Read + Send,
    output: impl Write + Send,
    process: Box<dyn PipedProcess>,
    sink: Arc<RecordingSink>,
) -> Result<RecordStats, TapeError> {
    append_run_log("info", "record.started", json!({ "mode": "proxy" }));
    let mut process = ProcessGuard::new(process);
    let mut child_stdin = process
        .take_stdin()
        .ok_or_else(|| TapeError::Process("server stdin is not piped".to_string()))?;
    let mut child_stdout = process
        .take_stdout()
        .ok_or_else(|| TapeError::Process("server stdout is not piped".to_string()))?;

    let upstream_sink = Arc::clone(&sink);
    let downstream_sink = Arc::clone(&sink);
    let (upstream, downstream) = std::thread::scope(|scope| {
        let upstream = scope.spawn(move || {
            let mut reader = TeeReader::new(input, upstream_sink);
            let result = pump(&mut reader, &mut child_stdin);
            drop(child_stdin);
            result
        });
        let downstream = scope.spawn(move || {
            let mut writer = TeeWriter::new(output, downstream_sink);
            pump(&mut child_stdout, &mut writer)
        });
        (upstream.join(), downstream.join())
    });

    match downstream {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(TapeError::Io(format!("server to client: {e}"))),
        Err(_) => return Err(TapeError::Io("server to client thread panicked".to_string())),
    }
    match upstream {
        Ok(Ok(_)) => {}
        // The server went away first; its exit status decides the outcome.
        Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Ok(Err(e)) => return Err(TapeError::Io(format!("client to server: {e}"))),
        Err(_) => return Err(TapeError::Io("client to server thread panicked".to_string())),
    }

    let code = process.wait()?;
    let stats = sink.stats()?;
    log_finished(stats);
    if code != 0 {
        return Err(TapeError::Process(format!(
            "server exited with status {code}"
        )));
    }
    Ok(stats)
}

fn log_finished(stats: RecordStats) {
    append_run_log(
        "info",
        "record.finished",
        json!({
            "inbound": stats.inbound,
            "outbound": stats.outbound,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::{record_passthrough, record_proxy, RecordingSink, TeeReader, TeeWriter};
    use crate::errors::TapeError;
    use crate::replay::recording::{load_recording, Direction, Entry};
    use crate::runtime::{FakeProcessRunner, ProcessRequest, ProcessRunner};
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().expect("buffer lock").clone()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn entries(buffer: &SharedBuffer) -> Vec<Entry> {
        load_recording(buffer.bytes().as_slice())
            .expect("load")
            .entries()
            .to_vec()
    }

    #[test]
    fn read_write_read_is_recorded_in_order() {
        let buffer = SharedBuffer::default();
        let sink = Arc::new(RecordingSink::new(buffer.clone()));
        let mut reader = TeeReader::new(&b"A\nC\n"[..], Arc::clone(&sink));
        let mut writer = TeeWriter::new(Vec::new(), Arc::clone(&sink));

        let mut first = [0u8; 2];
        reader.read_exact(&mut first).expect("read A");
        writer.write_all(b"B\n").expect("write B");
        let mut second = [0u8; 2];
        reader.read_exact(&mut second).expect("read C");

        assert_eq!(
            entries(&buffer),
            vec![Entry::inbound("A"), Entry::outbound("B"), Entry::inbound("C")]
        );
    }

    #[test]
    fn chunks_split_at_terminators_and_skip_empty_segments() {
        let buffer = SharedBuffer::default();
        let sink = RecordingSink::new(buffer.clone());
        let appended = sink
            .append_chunk(Direction::Outbound, b"{\"a\":1}\r\n\n{\"b\":2}\npartial")
            .expect("append");
        assert_eq!(appended, 3);
        assert_eq!(
            entries(&buffer),
            vec![
                Entry::outbound(r#"{"a":1}"#),
                Entry::outbound(r#"{"b":2}"#),
                Entry::outbound("partial"),
            ]
        );
        assert_eq!(sink.stats().expect("stats").outbound, 3);
    }

    #[test]
    fn repeated_carriage_returns_are_dropped_with_the_terminator() {
        let buffer = SharedBuffer::default();
        let sink = RecordingSink::new(buffer.clone());
        sink.append_chunk(Direction::Inbound, b"{}\r\r\n\r\n{\"a\":1}\r")
            .expect("append");
        assert_eq!(
            entries(&buffer),
            vec![Entry::inbound("{}"), Entry::inbound(r#"{"a":1}"#)]
        );
    }

    struct PanickingWriter;

    impl Write for PanickingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            panic!("writer failed mid-line");
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stats_after_a_poisoned_lock_is_an_error() {
        let sink = Arc::new(RecordingSink::new(PanickingWriter));
        let writer_sink = Arc::clone(&sink);
        let joined = std::thread::spawn(move || {
            let _ = writer_sink.append_chunk(Direction::Outbound, b"{}");
        })
        .join();
        assert!(joined.is_err());

        let err = sink.stats().expect_err("poisoned");
        assert!(matches!(err, TapeError::Io(_)));
        assert!(err.to_string().contains("poisoned"));
    }

    #[test]
    fn unterminated_chunk_is_one_entry_with_exact_bytes() {
        let buffer = SharedBuffer::default();
        let sink = RecordingSink::new(buffer.clone());
        sink.append_chunk(Direction::Inbound, br#"{"half":"#)
            .expect("append");
        assert_eq!(entries(&buffer), vec![Entry::inbound(r#"{"half":"#)]);
    }

    #[test]
    fn concurrent_appends_never_interleave_within_a_line() {
        let buffer = SharedBuffer::default();
        let sink = Arc::new(RecordingSink::new(buffer.clone()));
        std::thread::scope(|scope| {
            for direction in [Direction::Inbound, Direction::Outbound] {
                let sink = Arc::clone(&sink);
                scope.spawn(move || {
                    for i in 0..200 {
                        let payload = format!(r#"{{"seq":{i}}}"#);
                        sink.append_chunk(direction, payload.as_bytes())
                            .expect("append");
                    }
                });
            }
        });

        let recorded = entries(&buffer);
        assert_eq!(recorded.len(), 400);
        let inbound: Vec<Vec<u8>> = recorded
            .iter()
            .filter(|e| e.direction == Direction::Inbound)
            .map(|e| e.payload.clone())
            .collect();
        let expected: Vec<Vec<u8>> = (0..200)
            .map(|i| format!(r#"{{"seq":{i}}}"#).into_bytes())
            .collect();
        assert_eq!(inbound, expected);
    }

    #[test]
    fn passthrough_copies_input_and_records_it() {
        let buffer = SharedBuffer::default();
        let sink = Arc::new(RecordingSink::new(buffer.clone()));
        let mut output = Vec::new();
        let stats = record_passthrough(&b"{\"id\":1}\n{\"id\":2}\n"[..], &mut output, sink)
            .expect("passthrough");

        assert_eq!(output, b"{\"id\":1}\n{\"id\":2}\n");
        assert_eq!(stats.inbound, 2);
        assert_eq!(
            entries(&buffer),
            vec![Entry::inbound(r#"{"id":1}"#), Entry::inbound(r#"{"id":2}"#)]
        );
    }

    #[test]
    fn proxy_records_both_directions() {
        let runner = FakeProcessRunner::replying(r#"{"ok":true}"#);
        let process = runner
            .spawn_piped(ProcessRequest::shell("sh", "./server"))
            .expect("spawn");
        let buffer = SharedBuffer::default();
        let sink = Arc::new(RecordingSink::new(buffer.clone()));
        let mut client_out = Vec::new();

        let stats = record_proxy(&b"{\"x\":1}\n"[..], &mut client_out, process, sink)
            .expect("proxy");

        assert_eq!(client_out, b"{\"ok\":true}\n");
        assert_eq!(stats.inbound, 1);
        assert_eq!(stats.outbound, 1);
        assert_eq!(
            entries(&buffer),
            vec![Entry::inbound(r#"{"x":1}"#), Entry::outbound(r#"{"ok":true}"#)]
        );
        assert_eq!(runner.kills(), 1);
    }

    #[test]
    fn proxy_reports_non_zero_server_exit() {
        let runner = FakeProcessRunner::replying("{}");
        runner.set_exit_code(2);
        let process = runner
            .spawn_piped(ProcessRequest::shell("sh", "./server"))
            .expect("spawn");
        let sink = Arc::new(RecordingSink::new(Vec::new()));
        let err = record_proxy(&b""[..], Vec::new(), process, sink).expect_err("exit");
        assert!(matches!(err, TapeError::Process(_)));
    }

    #[test]
    fn create_writes_into_new_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/session.txt");
        let sink = RecordingSink::create(&path).expect("create");
        sink.append_chunk(Direction::Inbound, b"{}").expect("append");
        assert_eq!(std::fs::read(&path).expect("read"), b"mcp-in {}\n");
    }
}
