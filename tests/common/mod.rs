//! Shared test utilities and fixtures for the Hostrelay test suite.
//!
//! This module provides:
//! - An in-memory connection factory ([`MockConnector`]) whose connections
//!   open echo shells, SFTP channels over a shared [`MockFs`] and scripted
//!   exec channels
//! - A [`MockLocalStore`] whose files can be held open to stall a transfer
//! - Fixture builders for connect parameters and resolvers
//! - Async polling helpers
//!
//! # Usage
//!
//! Include this module in your integration tests:
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use hostrelay::connection::{
    ConnectParams, ConnectionError, ConnectionResult, ExecChannel, ExecEvent, FileStat, PtySize,
    RemoteConnection, RemoteConnector, RemoteReader, RemoteWriter, SftpChannel, ShellChannel,
    StaticHostResolver,
};
use hostrelay::transfer::local::{LocalReader, LocalStore, LocalWriter};

type SharedFiles = Arc<Mutex<HashMap<String, Vec<u8>>>>;

// ============================================================================
// Fixtures
// ============================================================================

/// Connect parameters for host `host_id` at `10.0.0.<host_id>`
pub fn params(host_id: u64) -> ConnectParams {
    ConnectParams::new(host_id, format!("10.0.0.{}", host_id), "deploy")
        .with_name(format!("host-{}", host_id))
        .with_connect_timeout(Duration::from_secs(2))
}

/// Resolver knowing exactly the given hosts
pub fn resolver(host_ids: &[u64]) -> Arc<StaticHostResolver> {
    let resolver = host_ids
        .iter()
        .fold(StaticHostResolver::new(), |r, id| r.with_host(params(*id)));
    Arc::new(resolver)
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// In-memory files
// ============================================================================

/// Writer appending into a shared file map
pub struct MemWriter {
    files: SharedFiles,
    path: String,
}

impl MemWriter {
    fn create(files: &SharedFiles, path: &str) -> Self {
        files.lock().insert(path.to_string(), Vec::new());
        Self {
            files: Arc::clone(files),
            path: path.to_string(),
        }
    }
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.files
            .lock()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Remote file system shared by every connection of a [`MockConnector`]
#[derive(Clone)]
pub struct MockFs {
    files: SharedFiles,
    dirs: Arc<Mutex<BTreeSet<String>>>,
    modes: Arc<Mutex<HashMap<String, u32>>>,
}

impl Default for MockFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            dirs: Arc::new(Mutex::new(dirs)),
            modes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.put(path, content);
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.dirs.lock().insert(path.to_string());
        self
    }

    pub fn put(&self, path: &str, content: &[u8]) {
        self.files.lock().insert(path.to_string(), content.to_vec());
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn read_string(&self, path: &str) -> Option<String> {
        self.read(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().contains(path)
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.modes.lock().get(path).copied()
    }

    /// Every file path, sorted
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn is_file(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<FileStat> {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let is_child = |p: &str| {
            p.strip_prefix(&prefix)
                .map(|rest| !rest.is_empty() && !rest.contains('/'))
                .unwrap_or(false)
        };

        let mut entries: Vec<FileStat> = self
            .dirs
            .lock()
            .iter()
            .filter(|d| is_child(d))
            .map(|d| entry(d, 0, true))
            .collect();
        entries.extend(
            self.files
                .lock()
                .iter()
                .filter(|(p, _)| is_child(p))
                .map(|(p, content)| entry(p, content.len() as u64, false)),
        );
        entries
    }
}

fn entry(path: &str, size: u64, is_dir: bool) -> FileStat {
    FileStat {
        path: path.to_string(),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        size,
        permissions: if is_dir { 0o755 } else { 0o644 },
        uid: 1000,
        gid: 1000,
        mtime: 0,
        is_dir,
        is_file: !is_dir,
        is_symlink: false,
    }
}

fn missing(path: &str) -> ConnectionError {
    ConnectionError::TransferFailed(format!("No such file: {}", path))
}

// ============================================================================
// Mock Connection Implementation
// ============================================================================

/// Counters shared by a connector and everything it opened
#[derive(Default)]
pub struct MockStats {
    pub sessions_opened: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub shells_opened: AtomicUsize,
    pub sftp_opened: AtomicUsize,
    pub sftp_closed: AtomicUsize,
    pub streams_opened: AtomicUsize,
    pub execs_opened: AtomicUsize,
    pub terminated: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
    pub exec_timeouts: Mutex<Vec<Option<Duration>>>,
    pub pty_sizes: Mutex<Vec<PtySize>>,
}

/// In-memory connection factory
pub struct MockConnector {
    pub fs: MockFs,
    pub stats: Arc<MockStats>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_fs(MockFs::new())
    }

    pub fn with_fs(fs: MockFs) -> Self {
        Self {
            fs,
            stats: Arc::new(MockStats::default()),
            fail: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    /// Every connection attempt is refused
    pub fn failing() -> Self {
        let connector = Self::new();
        connector.set_failing(true);
        connector
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Each connection attempt takes this long before it resolves
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn open_session(
        &self,
        params: &ConnectParams,
    ) -> ConnectionResult<Arc<dyn RemoteConnection>> {
        self.stats.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{} refused the connection",
                params.identifier()
            )));
        }
        Ok(Arc::new(MockConnection {
            id: params.identifier(),
            alive: AtomicBool::new(true),
            fs: self.fs.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// One in-memory connection
pub struct MockConnection {
    id: String,
    alive: AtomicBool,
    fs: MockFs,
    stats: Arc<MockStats>,
}

#[async_trait]
impl RemoteConnection for MockConnection {
    fn identifier(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn open_shell(&self, _term: &str, size: PtySize) -> ConnectionResult<Box<dyn ShellChannel>> {
        self.stats.shells_opened.fetch_add(1, Ordering::SeqCst);
        self.stats.pty_sizes.lock().push(size);
        Ok(Box::new(MockShell::new(Arc::clone(&self.stats))))
    }

    async fn open_sftp(&self, _charset: &str) -> ConnectionResult<Box<dyn SftpChannel>> {
        self.stats.sftp_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSftp {
            fs: self.fs.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn open_exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> ConnectionResult<Box<dyn ExecChannel>> {
        self.stats.execs_opened.fetch_add(1, Ordering::SeqCst);
        self.stats.commands.lock().push(command.to_string());
        self.stats.exec_timeouts.lock().push(timeout);
        Ok(Box::new(MockExec::new(command, &self.fs, Arc::clone(&self.stats))))
    }

    async fn close(&self) -> ConnectionResult<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.stats.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ============================================================================
// Shell
// ============================================================================

/// Echoes every write back as output; writing `exit\n` hangs up
pub struct MockShell {
    tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Option<Vec<u8>>>,
    stats: Arc<MockStats>,
}

impl MockShell {
    fn new(stats: Arc<MockStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, stats }
    }
}

#[async_trait]
impl ShellChannel for MockShell {
    async fn write(&mut self, data: &[u8]) -> ConnectionResult<()> {
        let chunk = if data == b"exit\n" {
            None
        } else {
            Some(data.to_vec())
        };
        self.tx
            .send(chunk)
            .map_err(|_| ConnectionError::ConnectionClosed)
    }

    async fn read(&mut self) -> ConnectionResult<Option<Vec<u8>>> {
        Ok(self.rx.recv().await.flatten())
    }

    async fn resize(&mut self, size: PtySize) -> ConnectionResult<()> {
        self.stats.pty_sizes.lock().push(size);
        Ok(())
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        Ok(())
    }
}

// ============================================================================
// SFTP
// ============================================================================

pub struct MockSftp {
    fs: MockFs,
    stats: Arc<MockStats>,
}

#[async_trait]
impl SftpChannel for MockSftp {
    async fn list(&self, path: &str) -> ConnectionResult<Vec<FileStat>> {
        if !self.fs.has_dir(path) {
            return Err(missing(path));
        }
        Ok(self.fs.children(path))
    }

    async fn stat(&self, path: &str) -> ConnectionResult<FileStat> {
        if self.fs.has_dir(path) {
            return Ok(entry(path, 0, true));
        }
        match self.fs.read(path) {
            Some(content) => Ok(entry(path, content.len() as u64, false)),
            None => Err(missing(path)),
        }
    }

    async fn exists(&self, path: &str) -> ConnectionResult<bool> {
        Ok(self.fs.has_dir(path) || self.fs.is_file(path))
    }

    async fn open_read(&self, path: &str) -> ConnectionResult<RemoteReader> {
        let content = self.fs.read(path).ok_or_else(|| missing(path))?;
        self.stats.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(io::Cursor::new(content)))
    }

    async fn open_write(&self, path: &str) -> ConnectionResult<RemoteWriter> {
        self.stats.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemWriter::create(&self.fs.files, path)))
    }

    async fn mkdir(&self, path: &str) -> ConnectionResult<()> {
        self.fs.dirs.lock().insert(path.to_string());
        Ok(())
    }

    async fn truncate(&self, path: &str) -> ConnectionResult<()> {
        match self.fs.files.lock().get_mut(path) {
            Some(content) => {
                content.clear();
                Ok(())
            }
            None => Err(missing(path)),
        }
    }

    async fn remove_file(&self, path: &str) -> ConnectionResult<()> {
        self.fs
            .files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| missing(path))
    }

    async fn remove_dir(&self, path: &str) -> ConnectionResult<()> {
        if !self.fs.children(path).is_empty() {
            return Err(ConnectionError::TransferFailed(format!(
                "Directory not empty: {}",
                path
            )));
        }
        if self.fs.dirs.lock().remove(path) {
            Ok(())
        } else {
            Err(missing(path))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> ConnectionResult<()> {
        let mut files = self.fs.files.lock();
        let content = files.remove(from).ok_or_else(|| missing(from))?;
        files.insert(to.to_string(), content);
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> ConnectionResult<()> {
        if !self.fs.is_file(path) && !self.fs.has_dir(path) {
            return Err(missing(path));
        }
        self.fs.modes.lock().insert(path.to_string(), mode);
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.stats.sftp_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Exec
// ============================================================================

enum Step {
    Emit(ExecEvent),
    Sleep(Duration),
    Until(Instant),
}

/// Scripted exec channel.
///
/// The command (or, for an uploaded script, the script's content) is a
/// `;`-separated list of `echo <text>`, `warn <text>`, `bytes <hex>` (raw
/// stdout chunk), `sleep <ms>` and `exit <code>`. Without `exit` the process
/// ends with status 0.
pub struct MockExec {
    steps: VecDeque<Step>,
    stats: Arc<MockStats>,
}

impl MockExec {
    fn new(command: &str, fs: &MockFs, stats: Arc<MockStats>) -> Self {
        let unquoted = command.trim_matches('\'');
        let program = fs.read_string(unquoted).unwrap_or_else(|| command.to_string());

        let mut steps = VecDeque::new();
        let mut code = 0;
        for part in program.split(&[';', '\n'][..]) {
            let part = part.trim();
            let (verb, arg) = part.split_once(' ').unwrap_or((part, ""));
            match verb {
                "echo" => steps.push_back(Step::Emit(ExecEvent::Stdout(
                    format!("{}\n", arg).into_bytes(),
                ))),
                "warn" => steps.push_back(Step::Emit(ExecEvent::Stderr(
                    format!("{}\n", arg).into_bytes(),
                ))),
                "bytes" => {
                    let hex = arg.trim();
                    let data = (0..hex.len())
                        .step_by(2)
                        .filter_map(|i| hex.get(i..i + 2))
                        .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
                        .collect();
                    steps.push_back(Step::Emit(ExecEvent::Stdout(data)));
                }
                "sleep" => {
                    let ms = arg.trim().parse().unwrap_or(0);
                    steps.push_back(Step::Sleep(Duration::from_millis(ms)));
                }
                "exit" => {
                    code = arg.trim().parse().unwrap_or(1);
                    break;
                }
                _ => {}
            }
        }
        steps.push_back(Step::Emit(ExecEvent::Exit(code)));
        Self { steps, stats }
    }
}

#[async_trait]
impl ExecChannel for MockExec {
    async fn next_event(&mut self) -> Option<ExecEvent> {
        loop {
            match self.steps.front()? {
                Step::Emit(_) => {
                    return match self.steps.pop_front() {
                        Some(Step::Emit(event)) => Some(event),
                        _ => None,
                    };
                }
                Step::Sleep(duration) => {
                    let deadline = Instant::now() + *duration;
                    if let Some(front) = self.steps.front_mut() {
                        *front = Step::Until(deadline);
                    }
                }
                Step::Until(deadline) => {
                    let deadline = *deadline;
                    tokio::time::sleep_until(deadline).await;
                    self.steps.pop_front();
                }
            }
        }
    }

    async fn terminate(&mut self) -> ConnectionResult<()> {
        self.stats.terminated.fetch_add(1, Ordering::SeqCst);
        self.steps.clear();
        Ok(())
    }
}

// ============================================================================
// Local store
// ============================================================================

/// Local side of transfers, in memory
#[derive(Default)]
pub struct MockLocalStore {
    pub files: SharedFiles,
    held: Mutex<HashMap<String, DuplexStream>>,
    pub opens: AtomicUsize,
}

impl MockLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, local_ref: &str, content: &[u8]) -> Self {
        self.files
            .lock()
            .insert(local_ref.to_string(), content.to_vec());
        self
    }

    /// The next read of `local_ref` yields exactly what is written into the
    /// returned stream, and blocks while it stays open.
    pub fn hold(&self, local_ref: &str) -> DuplexStream {
        let (feed, reader) = tokio::io::duplex(64 * 1024);
        self.held.lock().insert(local_ref.to_string(), reader);
        feed
    }

    pub fn read(&self, local_ref: &str) -> Option<Vec<u8>> {
        self.files.lock().get(local_ref).cloned()
    }
}

#[async_trait]
impl LocalStore for MockLocalStore {
    async fn open_read(&self, local_ref: &str) -> io::Result<LocalReader> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(stream) = self.held.lock().remove(local_ref) {
            return Ok(Box::new(stream));
        }
        match self.files.lock().get(local_ref) {
            Some(content) => Ok(Box::new(io::Cursor::new(content.clone()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, local_ref.to_string())),
        }
    }

    async fn open_write(&self, local_ref: &str) -> io::Result<LocalWriter> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemWriter::create(&self.files, local_ref)))
    }

    async fn size(&self, local_ref: &str) -> io::Result<u64> {
        match self.files.lock().get(local_ref) {
            Some(content) => Ok(content.len() as u64),
            None => Err(io::Error::new(io::ErrorKind::NotFound, local_ref.to_string())),
        }
    }
}
