//! The control socket: workers announce themselves idle and operators
//! stop the service.

use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pool::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcCommand {
    Waiting(WorkerId),
    Shutdown,
}

impl IpcCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        match words.next()?.to_ascii_lowercase().as_str() {
            "waiting" => words.next()?.parse().ok().map(IpcCommand::Waiting),
            "kill" | "quit" => Some(IpcCommand::Shutdown),
            _ => None,
        }
    }
}

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds the control socket, replacing a stale socket file.
    pub fn bind(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        log::info!("Control socket listening on {}", path.display());
        Ok(IpcServer {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts control connections until the returned task is aborted.
    /// Every command is echoed back lower-cased.
    pub fn serve(self, commands: mpsc::Sender<IpcCommand>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let stream = match self.listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        log::warn!("Control socket accept failed: {e}");
                        continue;
                    }
                };
                let commands = commands.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle(stream, commands).await {
                        log::debug!("Control connection ended: {e}");
                    }
                });
            }
        })
    }
}

async fn handle(stream: UnixStream, commands: mpsc::Sender<IpcCommand>) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_ascii_lowercase();
        if line.is_empty() {
            continue;
        }
        write.write_all(format!("{line}\r\n").as_bytes()).await?;
        match IpcCommand::parse(&line) {
            Some(command) => {
                log::info!("Control command: {line}");
                commands.send(command).await?;
            }
            None => log::warn!("Unknown control command: {line}"),
        }
    }
    Ok(())
}

/// Sends one command to a running supervisor and returns its echo.
pub async fn send(path: &Path, command: &str) -> anyhow::Result<String> {
    let stream = UnixStream::connect(path).await?;
    let (read, mut write) = stream.into_split();
    write.write_all(format!("{command}\r\n").as_bytes()).await?;
    let mut echo = String::new();
    BufReader::new(read).read_line(&mut echo).await?;
    Ok(echo.trim_end().to_string())
}
