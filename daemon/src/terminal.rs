use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

const READ_CHUNK: usize = 4096;
const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("pty I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[allow(dead_code)]
    #[error("failed to resize pty: {0}")]
    Resize(String),
}

/// Handle to a child process running under a PTY
pub struct TerminalHandle {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send>>,
}

impl TerminalHandle {
    /// Spawn `command` (or an interactive login shell when empty) in `cwd`.
    ///
    /// Returns the handle plus a blocking reader over the PTY output.
    pub fn open(
        cwd: &Path,
        cols: u16,
        rows: u16,
        command: &[String],
    ) -> Result<(Self, Box<dyn Read + Send>), TerminalError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| TerminalError::Open(e.to_string()))?;

        let cmd = build_command(cwd, command);
        let program = cmd
            .get_argv()
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Spawn {
                command: program,
                message: e.to_string(),
            })?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Open(format!("reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Open(format!("writer: {e}")))?;

        let handle = Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
        };

        Ok((handle, reader))
    }

    /// Write data to the terminal
    pub async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let master = self.master.lock().await;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| TerminalError::Resize(e.to_string()))
    }

    /// Kill the child process
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill() {
            debug!("Failed to kill pty child: {e}");
        }
    }

    /// Try to get exit status (non-blocking)
    pub async fn try_wait(&self) -> Option<Option<i32>> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => Some(Some(status.exit_code() as i32)),
            Ok(None) => None,
            Err(_) => Some(None),
        }
    }

    /// Wait for the child to exit
    pub async fn wait_exit(&self) -> Option<i32> {
        loop {
            if let Some(code) = self.try_wait().await {
                return code;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

/// Forward PTY output to `tx` from a blocking thread until EOF, a read
/// error, or the receiver going away.
pub fn spawn_output_pump(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO once the child side closes.
                    debug!("pty read ended: {e}");
                    break;
                }
            }
        }
    })
}

/// Forward local stdin to `tx` from a detached thread.
///
/// The thread is never joined; a blocked stdin read must not hold up exit.
pub fn spawn_input_pump(tx: mpsc::UnboundedSender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("stdin read ended: {e}");
                    break;
                }
            }
        }
    });
}

fn build_command(cwd: &Path, command: &[String]) -> CommandBuilder {
    let mut cmd = match command.split_first() {
        Some((program, args)) => {
            let mut cmd = CommandBuilder::new(program);
            cmd.args(args);
            cmd
        }
        None => {
            let mut cmd = CommandBuilder::new(shell_path());
            cmd.arg("-i");
            cmd
        }
    };
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(2),
        cols: cols.max(2),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn shell_path() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn clamps_tiny_sizes() {
        let size = pty_size(0, 1);
        assert_eq!(size.cols, 2);
        assert_eq!(size.rows, 2);
    }

    #[test]
    fn explicit_command_keeps_arguments() {
        let cmd = build_command(
            Path::new("/tmp"),
            &["echo".to_string(), "hello".to_string()],
        );
        let argv: Vec<String> = cmd
            .get_argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv, vec!["echo", "hello"]);
    }

    #[test]
    fn empty_command_starts_interactive_shell() {
        let cmd = build_command(Path::new("/tmp"), &[]);
        let argv = cmd.get_argv();
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[1].to_string_lossy(), "-i");
    }

    #[tokio::test]
    async fn pump_forwards_until_eof() {
        let reader: Box<dyn Read + Send> = Box::new(Cursor::new(b"line one\nline two\n".to_vec()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        spawn_output_pump(reader, tx).await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend(chunk);
        }
        assert_eq!(collected, b"line one\nline two\n");
    }

    #[tokio::test]
    async fn drives_a_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let command: Vec<String> = ["sh", "-c", "read line; echo got:$line; exit 3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (handle, reader) = TerminalHandle::open(dir.path(), 80, 24, &command).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump = spawn_output_pump(reader, tx);

        handle.resize(100, 30).await.unwrap();
        handle.write(b"ping\n").await.unwrap();

        let code = tokio::time::timeout(Duration::from_secs(10), handle.wait_exit())
            .await
            .expect("child exits");
        assert_eq!(code, Some(3));

        let mut output = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            output.extend(chunk);
        }
        drop(handle);
        let _ = tokio::time::timeout(Duration::from_secs(2), pump).await;

        assert!(String::from_utf8_lossy(&output).contains("got:ping"));
    }
}
