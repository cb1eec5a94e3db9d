//! Entry and Recording types plus the line codec.
//!
//! A recording is a text file with one entry per line:
//! `mcp-in <payload>` for messages sent to the system under test and
//! `mcp-out <payload>` for messages it produced. Any other line is an
//! annotation and is skipped on load.

use crate::errors::TapeError;
use crate::runtime::FileSystem;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

pub const INBOUND_TOKEN: &str = "mcp-in";
pub const OUTBOUND_TOKEN: &str = "mcp-out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent to the system under test.
    Inbound,
    /// Produced by the system under test.
    Outbound,
}

impl Direction {
    pub fn token(self) -> &'static str {
        match self {
            Self::Inbound => INBOUND_TOKEN,
            Self::Outbound => OUTBOUND_TOKEN,
        }
    }

    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"mcp-in" => Some(Self::Inbound),
            b"mcp-out" => Some(Self::Outbound),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded directional message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub direction: Direction,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn inbound(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            direction: Direction::Inbound,
            payload: payload.into(),
        }
    }

    pub fn outbound(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            direction: Direction::Outbound,
            payload: payload.into(),
        }
    }

    /// Lossy UTF-8 view of the payload for messages and previews.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Encode an entry as a single line, terminator included. Payloads holding
/// `\n` or ending in `\r` cannot survive a decode and are refused.
pub fn encode(entry: &Entry) -> Result<Vec<u8>, TapeError> {
    if entry.payload.contains(&b'\n') || entry.payload.ends_with(b"\r") {
        return Err(TapeError::Format(format!(
            "{} payload contains a raw line terminator",
            entry.direction
        )));
    }
    let token = entry.direction.token().as_bytes();
    let mut line = Vec::with_capacity(token.len() + entry.payload.len() + 2);
    line.extend_from_slice(token);
    line.push(b' ');
    line.extend_from_slice(&entry.payload);
    line.push(b'\n');
    Ok(line)
}

/// Decode one line. Lines without a recognised direction token are skipped.
pub fn decode(line: &[u8]) -> Option<Entry> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let split = line.iter().position(|b| *b == b' ')?;
    let direction = Direction::from_token(&line[..split])?;
    Some(Entry {
        direction,
        payload: line[split + 1..].to_vec(),
    })
}

/// Ordered, immutable sequence of entries in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recording {
    entries: Vec<Entry>,
}

impl Recording {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, TapeError> {
        let file = fs::File::open(path)
            .map_err(|e| TapeError::Format(format!("open {}: {e}", path.display())))?;
        load_recording(file)
    }

    /// Canonical encoding of every entry, in order.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TapeError> {
        let mut out = Vec::new();
        write_recording(&mut out, self)?;
        Ok(out)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, direction: Direction) -> usize {
        self.entries
            .iter()
            .filter(|e| e.direction == direction)
            .count()
    }
}

impl<'a> IntoIterator for &'a Recording {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Read a recording until end of stream. Only I/O failures are errors.
pub fn load_recording(reader: impl Read) -> Result<Recording, TapeError> {
    let mut reader = BufReader::new(reader);
    let mut entries = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| TapeError::Format(format!("read recording: {e}")))?;
        if read == 0 {
            break;
        }
        if let Some(entry) = decode(&line) {
            entries.push(entry);
        }
    }
    Ok(Recording { entries })
}

pub fn write_recording(writer: &mut dyn Write, recording: &Recording) -> Result<(), TapeError> {
    for entry in recording {
        let line = encode(entry)?;
        writer
            .write_all(&line)
            .map_err(|e| TapeError::Format(format!("write recording: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| TapeError::Format(format!("flush recording: {e}")))
}

/// Load a recording through the `FileSystem` seam.
pub fn read_recording_file(path: &Path, fs: &dyn FileSystem) -> Result<Recording, TapeError> {
    let bytes = fs.read(path).map_err(|e| match e {
        TapeError::Io(message) => TapeError::Format(message),
        other => other,
    })?;
    load_recording(bytes.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    #[test]
    fn encode_uses_direction_token_and_single_space() {
        let line = encode(&Entry::inbound(r#"{"method":"ping"}"#)).expect("encode");
        assert_eq!(line, b"mcp-in {\"method\":\"ping\"}\n".to_vec());
        let line = encode(&Entry::outbound("{}")).expect("encode");
        assert_eq!(line, b"mcp-out {}\n".to_vec());
    }

    #[test]
    fn decode_reverses_encode() {
        for entry in [
            Entry::inbound(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#),
            Entry::outbound(r#"{ "spaced" : [1, 2] }"#),
            Entry::outbound(""),
            Entry::inbound("not json at all \t"),
        ] {
            let line = encode(&entry).expect("encode");
            assert_eq!(decode(&line), Some(entry));
        }
    }

    #[test]
    fn encode_refuses_raw_line_terminator() {
        let err = encode(&Entry::inbound("a\nb")).expect_err("must refuse");
        assert!(matches!(err, TapeError::Format(_)));
    }

    #[test]
    fn encode_refuses_trailing_carriage_return() {
        let err = encode(&Entry::outbound("{}\r")).expect_err("must refuse");
        assert!(matches!(err, TapeError::Format(_)));

        // A `\r` inside the payload still survives a round trip.
        let entry = Entry::outbound("a\rb");
        let line = encode(&entry).expect("encode");
        assert_eq!(decode(&line), Some(entry));
    }

    #[test]
    fn unrecognised_lines_are_skipped() {
        let lines: [&[u8]; 7] = [
            b"# a comment",
            b"",
            b"\n",
            b"mcp-inx {}",
            b"mcp-in",
            b"MCP-IN {}",
            b"2024-01-01T00:00:00Z > {}",
        ];
        for line in lines {
            assert_eq!(decode(line), None, "line {:?}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn decode_tolerates_crlf() {
        assert_eq!(decode(b"mcp-out {\"a\":1}\r\n"), Some(Entry::outbound("{\"a\":1}")));
    }

    #[test]
    fn load_recording_keeps_file_order_and_skips_annotations() {
        let text = "# session captured against demo server\n\
                    mcp-in {\"id\":1}\n\
                    \n\
                    mcp-out {\"id\":1,\"result\":{}}\n\
                    note: second call\n\
                    mcp-in {\"id\":2}";
        let recording = load_recording(Cursor::new(text)).expect("load");
        assert_eq!(
            recording.entries(),
            &[
                Entry::inbound("{\"id\":1}"),
                Entry::outbound("{\"id\":1,\"result\":{}}"),
                Entry::inbound("{\"id\":2}"),
            ]
        );
        assert_eq!(recording.count(Direction::Inbound), 2);
        assert_eq!(recording.count(Direction::Outbound), 1);
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn load_recording_reports_io_failure_as_format_error() {
        let err = load_recording(FailingReader).expect_err("io failure");
        assert!(matches!(err, TapeError::Format(_)));
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn canonical_bytes_load_back_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.txt");
        let recording = Recording::new(vec![
            Entry::inbound(r#"{"x":1}"#),
            Entry::outbound(r#"{"ok":true}"#),
        ]);
        fs::write(&path, recording.to_bytes().expect("encode")).expect("write");
        assert_eq!(Recording::load(&path).expect("load"), recording);
    }

    #[test]
    fn load_missing_file_is_format_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Recording::load(&dir.path().join("absent.txt")).expect_err("missing");
        assert!(matches!(err, TapeError::Format(_)));
    }

    #[test]
    fn read_through_file_system_seam() {
        let fs = crate::runtime::FakeFileSystem::default()
            .with_file("s.txt", "mcp-in {}\nnote\nmcp-out {}\n");
        let recording = read_recording_file(Path::new("s.txt"), &fs).expect("read");
        assert_eq!(recording.count(Direction::Inbound), 1);
        assert_eq!(recording.count(Direction::Outbound), 1);

        let err = read_recording_file(Path::new("absent.txt"), &fs).expect_err("missing");
        assert!(matches!(err, TapeError::Format(_)));
    }
}
