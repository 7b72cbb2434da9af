//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a shell with a given size and working
//! directory. The write/resize/kill side is exposed through [`PtyBackend`];
//! the output reader and the child handle are handed back separately so they
//! can be drained on blocking threads.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, info};
use hostlink_core::{LinkError, LinkResult};

/// Control side of a running pseudo-terminal.
pub trait PtyBackend: Send {
    /// Write raw bytes to the terminal input.
    fn write(&mut self, data: &[u8]) -> LinkResult<()>;

    /// Resize the terminal. Callers pass dimensions already clamped to >= 1.
    fn resize(&mut self, cols: u16, rows: u16) -> LinkResult<()>;

    /// Terminate the child process.
    fn kill(&mut self) -> LinkResult<()>;
}

/// Shell spawn parameters.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub cwd: PathBuf,
}

/// Output and exit sources of a spawned PTY.
pub struct PtyIo {
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// A managed PTY instance.
pub struct PtyHandle {
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl PtyHandle {
    /// Spawn `options.shell` on a new PTY.
    pub fn spawn(options: &PtyOptions) -> LinkResult<(Self, PtyIo)> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows.max(1),
                cols: options.cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| LinkError::TerminalSpawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.cwd(&options.cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| LinkError::TerminalSpawn(format!("failed to spawn {}: {e}", options.shell)))?;
        // The slave end belongs to the child now.
        drop(pair.slave);

        info!(
            shell = %options.shell,
            cols = options.cols,
            rows = options.rows,
            pid = child.process_id(),
            "PTY spawned"
        );

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| LinkError::TerminalSpawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| LinkError::TerminalSpawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        Ok((
            Self {
                writer,
                master: pair.master,
                killer,
            },
            PtyIo { reader, child },
        ))
    }

}

impl PtyBackend for PtyHandle {
    fn write(&mut self, data: &[u8]) -> LinkResult<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> LinkResult<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| LinkError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&mut self) -> LinkResult<()> {
        self.killer
            .kill()
            .map_err(|e| LinkError::Other(format!("kill failed: {e}")))
    }
}

/// Split `buf` into the longest valid UTF-8 prefix and an incomplete trailing
/// sequence that may be completed by the next read.
pub(crate) fn take_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => {
            let out = s.to_string();
            buf.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&buf[..valid]).into_owned();
            buf.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_complete() {
        let mut buf = b"hello".to_vec();
        assert_eq!(take_utf8(&mut buf), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn utf8_split_sequence_is_held_back() {
        let snowman = "\u{2603}".as_bytes();
        let mut buf = b"ab".to_vec();
        buf.extend_from_slice(&snowman[..2]);
        assert_eq!(take_utf8(&mut buf), "ab");
        assert_eq!(buf.len(), 2);

        buf.extend_from_slice(&snowman[2..]);
        assert_eq!(take_utf8(&mut buf), "\u{2603}");
        assert!(buf.is_empty());
    }

    #[test]
    fn utf8_invalid_is_replaced() {
        let mut buf = vec![b'a', 0xff, b'b'];
        assert_eq!(take_utf8(&mut buf), "a\u{fffd}b");
        assert!(buf.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn spawn_missing_shell_fails() {
        let opts = PtyOptions {
            shell: "/nonexistent/shell-binary".into(),
            cols: 80,
            rows: 24,
            cwd: std::env::temp_dir(),
        };
        assert!(matches!(
            PtyHandle::spawn(&opts),
            Err(LinkError::TerminalSpawn(_))
        ));
    }
}
