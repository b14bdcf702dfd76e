//! PTY process management.
//!
//! This module wraps one OS child process attached to a pseudo-terminal.
//! It provides spawning at a fixed terminal geometry, blocking chunked
//! reads of the combined output stream, writes to the process input,
//! a non-blocking liveness check, and best-effort termination.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// Buffer size for one read from the PTY.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The shell executable could not be started.
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    /// A write was attempted after the process exited.
    #[error("process input closed")]
    BrokenPipe,

    /// The process exited and its output is exhausted. Not a failure;
    /// it triggers the clean shutdown path.
    #[error("end of output stream")]
    EndOfStream,

    /// I/O error on a live process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal geometry, fixed at spawn. No resize protocol is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 140,
        }
    }
}

/// One shell process attached to a pseudo-terminal.
///
/// The reader and writer target independent stream directions, so the
/// output pump and the inbound message handler can operate concurrently
/// without sharing a cursor. Each handle sits behind its own mutex.
pub struct ShellProcess {
    command: String,
    size: TerminalSize,
    pid: Option<u32>,
    // The master must stay alive for the session: dropping it closes
    // the PTY under the child.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl ShellProcess {
    /// Spawns `command` attached to a newly allocated PTY sized to `size`.
    pub fn spawn(command: &str, size: TerminalSize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let cmd = CommandBuilder::new(command);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let pid = child.process_id();

        tracing::debug!(
            command = %command,
            rows = size.rows,
            cols = size.cols,
            pid = ?pid,
            "Spawned shell process"
        );

        Ok(Self {
            command: command.to_string(),
            size,
            pid,
            _master: Mutex::new(pair.master),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
        })
    }

    /// Returns the command this process was spawned with.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the terminal geometry fixed at spawn.
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Returns the OS process id of the child, if available.
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Blocks until at least one byte of output is available and returns it.
    ///
    /// Returns [`PtyError::EndOfStream`] once the process has exited and no
    /// more output remains. Callers are expected to run this on a blocking
    /// task so the async runtime stays responsive.
    pub fn read_chunk(&self) -> Result<Vec<u8>, PtyError> {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let read = {
            let mut reader = self.reader.lock().unwrap();
            reader.read(&mut buffer)
        };

        match read {
            Ok(0) => Err(PtyError::EndOfStream),
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            // On most platforms reading the master after the child exits
            // reports an I/O error rather than a zero-length read.
            Err(_) if !self.is_alive() => Err(PtyError::EndOfStream),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Writes bytes to the process input and flushes.
    ///
    /// Fails with [`PtyError::BrokenPipe`] if the process has already
    /// exited; that is an expected race during teardown.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Err(PtyError::BrokenPipe);
        }

        let mut writer = self.writer.lock().unwrap();
        writer.write_all(bytes).map_err(map_write_error)?;
        writer.flush().map_err(map_write_error)?;
        Ok(())
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap();
        matches!(child.try_wait(), Ok(None))
    }

    /// Requests the process stop. `force` escalates to an unconditional
    /// kill; without it the call only reaps an already-exited child.
    ///
    /// Best-effort: never fails, and is a no-op on a dead process.
    pub fn terminate(&self, force: bool) {
        let mut child = self.child.lock().unwrap();

        if force {
            if let Err(e) = child.kill() {
                tracing::trace!(error = %e, "Kill failed, process likely already gone");
            }
            let _ = child.wait();
        } else {
            let _ = child.try_wait();
        }
    }
}

fn map_write_error(e: std::io::Error) -> PtyError {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => PtyError::BrokenPipe,
        _ => PtyError::Io(e),
    }
}
