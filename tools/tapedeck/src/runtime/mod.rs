use crate::errors::TapeError;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessRequest {
    /// Run `command` through `shell -c`, the way server commands are given on the CLI.
    pub fn shell(shell: &str, command: &str) -> Self {
        Self {
            program: shell.to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd: None,
        }
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>, TapeError>;
    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), TapeError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), TapeError>;
    fn exists(&self, path: &Path) -> bool;
    /// Expand a glob pattern into matching file paths, sorted.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, TapeError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), TapeError>;
    fn write_error_line(&self, line: &str) -> Result<(), TapeError>;
}

/// A running subprocess with piped stdin and stdout.
pub trait PipedProcess: Send {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;
    /// Block until the process exits and return its exit code.
    fn wait(&mut self) -> Result<i32, TapeError>;
    /// Terminate the process. A no-op once it has been waited for.
    fn kill(&mut self) -> Result<(), TapeError>;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn_piped(&self, request: ProcessRequest) -> Result<Box<dyn PipedProcess>, TapeError>;
}

/// Owns a subprocess and kills it when dropped, whatever path the owner exits by.
pub struct ProcessGuard {
    inner: Box<dyn PipedProcess>,
}

impl ProcessGuard {
    pub fn new(inner: Box<dyn PipedProcess>) -> Self {
        Self { inner }
    }
}

impl std::ops::Deref for ProcessGuard {
    type Target = dyn PipedProcess;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl std::ops::DerefMut for ProcessGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let _ = self.inner.kill();
    }
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>, TapeError> {
        std::fs::read(path).map_err(|e| TapeError::Io(format!("{}: {e}", path.display())))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), TapeError> {
        std::fs::write(path, contents)
            .map_err(|e| TapeError::Io(format!("{}: {e}", path.display())))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), TapeError> {
        std::fs::create_dir_all(path)
            .map_err(|e| TapeError::Io(format!("{}: {e}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, TapeError> {
        let paths = glob::glob(pattern)
            .map_err(|e| TapeError::Usage(format!("invalid glob pattern {pattern:?}: {e}")))?;
        let mut matches = Vec::new();
        for path in paths {
            let path = path.map_err(|e| TapeError::Io(e.to_string()))?;
            if path.is_file() {
                matches.push(path);
            }
        }
        matches.sort();
        Ok(matches)
    }
}

struct ProductionProcess {
    child: std::process::Child,
    exited: bool,
}

impl PipedProcess for ProductionProcess {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)
    }

    fn wait(&mut self) -> Result<i32, TapeError> {
        let status = self
            .child
            .wait()
            .map_err(|e| TapeError::Process(e.to_string()))?;
        self.exited = true;
        Ok(status.code().unwrap_or(-1))
    }

    fn kill(&mut self) -> Result<(), TapeError> {
        if self.exited {
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| TapeError::Process(e.to_string()))?;
        let _ = self.child.wait();
        self.exited = true;
        Ok(())
    }
}

pub struct ProductionProcessRunner;

impl ProcessRunner for ProductionProcessRunner {
    fn spawn_piped(&self, request: ProcessRequest) -> Result<Box<dyn PipedProcess>, TapeError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit());

        let child = cmd
            .spawn()
            .map_err(|e| TapeError::Process(format!("launch {}: {e}", request.display())))?;
        Ok(Box::new(ProductionProcess {
            child,
            exited: false,
        }))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), TapeError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}").map_err(|e| TapeError::Io(e.to_string()))?;
        out.flush().map_err(|e| TapeError::Io(e.to_string()))
    }

    fn write_error_line(&self, line: &str) -> Result<(), TapeError> {
        let mut err = std::io::stderr().lock();
        writeln!(err, "{line}").map_err(|e| TapeError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleep lock").push(duration);
        let mut now = self.now.lock().expect("clock lock");
        *now += duration;
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    writes: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<TapeError>>>,
}

impl FakeFileSystem {
    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        self
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    pub fn writes(&self) -> Vec<PathBuf> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn set_fail_next(&self, error: TapeError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn maybe_fail(&self) -> Result<(), TapeError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>, TapeError> {
        self.maybe_fail()?;
        self.contents(path)
            .ok_or_else(|| TapeError::Io(format!("missing file {}", path.display())))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), TapeError> {
        self.maybe_fail()?;
        self.writes
            .lock()
            .expect("writes lock")
            .push(path.to_path_buf());
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn create_dir_all(&self, _path: &Path) -> Result<(), TapeError> {
        self.maybe_fail()
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, TapeError> {
        let compiled = glob::Pattern::new(pattern)
            .map_err(|e| TapeError::Usage(format!("invalid glob pattern {pattern:?}: {e}")))?;
        Ok(self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|path| compiled.matches_path(path))
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    lines: Arc<Mutex<Vec<String>>>,
    error_lines: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.lines.lock().expect("lines lock").clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.error_lines.lock().expect("error lines lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), TapeError> {
        self.lines
            .lock()
            .expect("lines lock")
            .push(line.to_string());
        Ok(())
    }

    fn write_error_line(&self, line: &str) -> Result<(), TapeError> {
        self.error_lines
            .lock()
            .expect("error lines lock")
            .push(line.to_string());
        Ok(())
    }
}

/// Maps one stdin line (terminator removed) to the chunks written to stdout.
/// `None` closes stdout, like a server that exits.
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<Vec<u8>>> + Send + Sync>;

/// Scripted subprocess: every line written to stdin is handed to the responder
/// and its chunks become readable on stdout.
#[derive(Clone)]
pub struct FakeProcessRunner {
    responder: Responder,
    exit_code: Arc<Mutex<i32>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    kills: Arc<AtomicUsize>,
    fail_next: Arc<Mutex<Option<TapeError>>>,
}

impl FakeProcessRunner {
    pub fn new(responder: impl Fn(&[u8]) -> Option<Vec<Vec<u8>>> + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            exit_code: Arc::new(Mutex::new(0)),
            spawned: Arc::new(Mutex::new(Vec::new())),
            received: Arc::new(Mutex::new(Vec::new())),
            kills: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(Mutex::new(None)),
        }
    }

    /// Respond to every line with one fixed line.
    pub fn replying(line: &str) -> Self {
        let reply = format!("{line}\n").into_bytes();
        Self::new(move |_| Some(vec![reply.clone()]))
    }

    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock().expect("exit code lock") = code;
    }

    pub fn set_fail_next(&self, error: TapeError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn_piped(&self, request: ProcessRequest) -> Result<Box<dyn PipedProcess>, TapeError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        self.spawned.lock().expect("spawned lock").push(request);
        let (sender, receiver) = mpsc::channel();
        Ok(Box::new(FakeProcess {
            stdin: Some(FakeStdin {
                buffer: Vec::new(),
                sender: Some(sender),
                responder: Arc::clone(&self.responder),
                received: Arc::clone(&self.received),
            }),
            stdout: Some(FakeStdout {
                receiver,
                pending: Vec::new(),
                cursor: 0,
            }),
            exit_code: *self.exit_code.lock().expect("exit code lock"),
            kills: Arc::clone(&self.kills),
        }))
    }
}

struct FakeProcess {
    stdin: Option<FakeStdin>,
    stdout: Option<FakeStdout>,
    exit_code: i32,
    kills: Arc<AtomicUsize>,
}

impl PipedProcess for FakeProcess {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)
    }

    fn wait(&mut self) -> Result<i32, TapeError> {
        Ok(self.exit_code)
    }

    fn kill(&mut self) -> Result<(), TapeError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeStdin {
    buffer: Vec<u8>,
    sender: Option<mpsc::Sender<Vec<u8>>>,
    responder: Responder,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Write for FakeStdin {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).take(pos).collect();
            self.received
                .lock()
                .expect("received lock")
                .push(line.clone());
            match (self.responder)(&line) {
                Some(chunks) => {
                    if let Some(sender) = &self.sender {
                        for chunk in chunks {
                            let _ = sender.send(chunk);
                        }
                    }
                }
                None => self.sender = None,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct FakeStdout {
    receiver: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    cursor: usize,
}

impl Read for FakeStdout {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.cursor >= self.pending.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.cursor = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.cursor);
        buf[..n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}
