//! Terminal session manager.
//!
//! Owns at most one PTY-backed shell per connection id. Output is read on a
//! dedicated thread and handed to the connection's `on_data` callback until
//! the session is cleared. All methods block briefly (spawn, kill, write);
//! async callers run them through `spawn_blocking`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};

const TERM_NAME: &str = "xterm-256color";
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to prepare {path}: {source}")]
    Workdir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn terminal: {0}")]
    Spawn(String),
}

/// Receives each chunk of PTY output.
pub type OutputSink = Box<dyn Fn(Vec<u8>) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A session was already running for this id and was kept
    AlreadyRunning,
}

struct TerminalSession {
    generation: u64,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    forwarding: Arc<AtomicBool>,
}

impl TerminalSession {
    /// Stop forwarding, then kill and reap the process.
    fn terminate(mut self) {
        self.forwarding.store(false, Ordering::SeqCst);
        if let Err(e) = self.child.kill() {
            debug!(
                component = "terminal",
                event = "terminal.kill.failed",
                error = %e,
                "Kill failed (process likely already exited)"
            );
        }
        let _ = self.child.wait();
    }
}

/// Connection id → live terminal session.
pub struct TerminalManager {
    shell: String,
    sessions: Arc<DashMap<String, TerminalSession>>,
    next_generation: AtomicU64,
}

impl TerminalManager {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            sessions: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    #[cfg(test)]
    pub(crate) fn process_id(&self, id: &str) -> Option<u32> {
        self.sessions.get(id).and_then(|s| s.child.process_id())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Spawn a shell rooted at `workdir` for `id`, creating the directory if
    /// needed. An id that already has a running session keeps it.
    pub fn create_session(
        &self,
        id: &str,
        workdir: &Path,
        on_data: OutputSink,
    ) -> Result<CreateOutcome, TerminalError> {
        if self.sessions.contains_key(id) {
            info!(
                component = "terminal",
                event = "terminal.create.duplicate",
                connection_id = %id,
                "Terminal already running, keeping existing session"
            );
            return Ok(CreateOutcome::AlreadyRunning);
        }

        std::fs::create_dir_all(workdir).map_err(|source| TerminalError::Workdir {
            path: workdir.display().to_string(),
            source,
        })?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;

        // CommandBuilder starts from the host environment.
        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(workdir);
        cmd.env("TERM", TERM_NAME);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let forwarding = Arc::new(AtomicBool::new(true));
        let session = TerminalSession {
            generation,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child,
            forwarding: forwarding.clone(),
        };

        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => {
                // Lost a race with another create for the same id.
                session.terminate();
                return Ok(CreateOutcome::AlreadyRunning);
            }
            Entry::Vacant(slot) => {
                let pid = session.child.process_id();
                slot.insert(session);
                info!(
                    component = "terminal",
                    event = "terminal.created",
                    connection_id = %id,
                    pid = ?pid,
                    cwd = %workdir.display(),
                    "Terminal created"
                );
            }
        }

        self.spawn_reader(id.to_string(), generation, reader, forwarding, on_data);
        Ok(CreateOutcome::Created)
    }

    fn spawn_reader(
        &self,
        id: String,
        generation: u64,
        mut reader: Box<dyn Read + Send>,
        forwarding: Arc<AtomicBool>,
        on_data: OutputSink,
    ) {
        let sessions = Arc::clone(&self.sessions);
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if !forwarding.load(Ordering::SeqCst) {
                            break;
                        }
                        on_data(buf[..n].to_vec());
                    }
                }
            }

            // The shell exited by itself; forget it so a new one can be requested.
            if forwarding.load(Ordering::SeqCst) {
                if let Some((_, session)) =
                    sessions.remove_if(&id, |_, s| s.generation == generation)
                {
                    session.terminate();
                    info!(
                        component = "terminal",
                        event = "terminal.exited",
                        connection_id = %id,
                        "Terminal process exited"
                    );
                }
            }
        });
    }

    /// Forward input to the session's process. No-op without a session.
    pub fn write(&self, id: &str, data: &[u8]) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let mut writer = lock(&session.writer);
        let result = writer.write_all(data).and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!(
                component = "terminal",
                event = "terminal.write.failed",
                connection_id = %id,
                error = %e,
                "Failed to write to terminal"
            );
        }
    }

    /// Resize the PTY. No-op without a session.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        if let Some(session) = self.sessions.get(id) {
            if let Err(e) = lock(&session.master).resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                warn!(
                    component = "terminal",
                    event = "terminal.resize.failed",
                    connection_id = %id,
                    error = %e,
                    "Failed to resize terminal"
                );
            }
        }
    }

    /// Kill the session's process and drop the record. Returns whether a
    /// session existed; clearing an absent id is a no-op.
    pub fn clear(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        session.terminate();
        info!(
            component = "terminal",
            event = "terminal.cleared",
            connection_id = %id,
            "Terminal cleared"
        );
        true
    }

    /// Terminate every session (process shutdown).
    pub fn clear_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.clear(&id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        self.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn manager() -> TerminalManager {
        TerminalManager::new("/bin/sh")
    }

    fn collecting_sink() -> (OutputSink, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let sink: OutputSink = Box::new(move |chunk| {
            let _ = tx.lock().unwrap().send(chunk);
        });
        (sink, rx)
    }

    fn wait_for_output(rx: &mpsc::Receiver<Vec<u8>>, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Ok(chunk) = rx.recv_timeout(Duration::from_millis(100)) {
                seen.extend(chunk);
                if String::from_utf8_lossy(&seen).contains(needle) {
                    return true;
                }
            }
        }
        false
    }

    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn runs_shell_in_workdir_and_forwards_output() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("alice/proj1");
        let terminals = manager();
        let (sink, rx) = collecting_sink();

        let outcome = terminals.create_session("conn-1", &workdir, sink).unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        assert!(workdir.is_dir());

        terminals.write("conn-1", b"echo \"$TERM\" && pwd\n");
        assert!(wait_for_output(&rx, "xterm-256color"));
        terminals.clear("conn-1");
    }

    #[test]
    fn second_create_keeps_first_process() {
        let dir = tempfile::tempdir().unwrap();
        let terminals = manager();
        let (sink, _rx) = collecting_sink();
        terminals.create_session("conn-1", dir.path(), sink).unwrap();
        let first_pid = terminals.process_id("conn-1");

        let (sink, _rx2) = collecting_sink();
        let outcome = terminals.create_session("conn-1", dir.path(), sink).unwrap();

        assert_eq!(outcome, CreateOutcome::AlreadyRunning);
        assert_eq!(terminals.session_count(), 1);
        assert_eq!(terminals.process_id("conn-1"), first_pid);
        terminals.clear("conn-1");
    }

    #[test]
    fn clear_kills_process_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let terminals = manager();
        let (sink, _rx) = collecting_sink();
        terminals.create_session("conn-1", dir.path(), sink).unwrap();
        let pid = terminals.process_id("conn-1").expect("pid");
        assert!(process_alive(pid));

        assert!(terminals.clear("conn-1"));
        assert!(!process_alive(pid));
        assert!(!terminals.is_running("conn-1"));
    }

    #[test]
    fn clear_and_write_on_absent_session_are_noops() {
        let terminals = manager();
        assert!(!terminals.clear("nobody"));
        terminals.write("nobody", b"ls\n");
        terminals.resize("nobody", 100, 40);

        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = collecting_sink();
        terminals.create_session("conn-1", dir.path(), sink).unwrap();
        assert!(terminals.clear("conn-1"));
        assert!(!terminals.clear("conn-1"));
    }

    #[test]
    fn exited_shell_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let terminals = manager();
        let (sink, _rx) = collecting_sink();
        terminals.create_session("conn-1", dir.path(), sink).unwrap();
        terminals.write("conn-1", b"exit\n");

        let deadline = Instant::now() + Duration::from_secs(10);
        while terminals.is_running("conn-1") && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!terminals.is_running("conn-1"));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let terminals = TerminalManager::new("/definitely/not/a/shell");
        let (sink, _rx) = collecting_sink();
        let err = terminals
            .create_session("conn-1", dir.path(), sink)
            .unwrap_err();
        assert!(matches!(err, TerminalError::Spawn(_)));
        assert!(!terminals.is_running("conn-1"));
    }
}
