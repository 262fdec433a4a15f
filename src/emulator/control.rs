//! Emulator control channel
//!
//! The qemu monitor listens on a Unix stream socket in readline mode. The
//! protocol is newline-terminated ASCII commands; the harness never parses
//! replies and relies on fixed delays instead. Replies are still drained so
//! the emulator never blocks on a full socket buffer.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::GenericFilePath;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::task::JoinHandle;

/// Upper bound on a single command write
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands understood by the emulator monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    SendKey(String),
    ScreenDump(PathBuf),
    /// Ask the guest to power down cleanly
    SystemPowerdown,
    /// Terminate the emulator immediately
    Quit,
}

impl MonitorCommand {
    /// Wire form, newline included
    pub fn to_line(&self) -> String {
        match self {
            MonitorCommand::SendKey(key) => format!("sendkey {}\n", key),
            MonitorCommand::ScreenDump(path) => format!("screendump {}\n", path.display()),
            MonitorCommand::SystemPowerdown => "system_powerdown\n".to_string(),
            MonitorCommand::Quit => "quit\n".to_string(),
        }
    }
}

/// Connected control channel
pub struct ControlChannel {
    path: PathBuf,
    writer: WriteHalf<Stream>,
    drain: JoinHandle<()>,
}

impl ControlChannel {
    /// Connect to the monitor socket at `path`
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let name = path
            .to_string_lossy()
            .into_owned()
            .to_fs_name::<GenericFilePath>()?;
        let stream = Stream::connect(name).await?;
        let (reader, writer) = tokio::io::split(stream);

        let label = path.display().to_string();
        let drain = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!("monitor {}: {}", label, line);
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            drain,
        })
    }

    /// Send one command; fire-and-forget
    pub async fn send(&mut self, command: &MonitorCommand) -> io::Result<()> {
        let line = command.to_line();
        tracing::trace!("monitor {} <<< {}", self.path.display(), line.trim_end());

        let write = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("monitor write timed out: {}", line.trim_end()),
            )),
        }
    }

    /// Close the connection and stop draining replies
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        self.drain.abort();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.drain.abort();
    }
}
