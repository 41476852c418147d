//! Accepts SMTP connections and bridges each one to a pooled worker
//! process.

pub mod ipc;
pub mod pool;

pub use ipc::{IpcCommand, IpcServer};
pub use pool::{Launcher, ProcessManager, WorkerId, WorkerIo, WorkerState};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::worker::GOODBYE;
use pool::{WorkerInput, WorkerOutput};

const BUSY: &[u8] = b"450 4.3.2 Server busy, try again later\r\n";
const SCE: &str = "550 5.7.1 Server Configuration Error";

pub fn pid_path(config: &Config) -> PathBuf {
    config.storage_dir().join("run").join(format!("{}.pid", config.app_slug()))
}

pub fn socket_path(config: &Config) -> PathBuf {
    config.storage_dir().join("run").join(format!("{}.sock", config.app_slug()))
}

/// Holds the PID file for as long as the supervisor runs.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            anyhow::bail!(
                "Server is already running (PID file {} exists)",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove PID file: {e}");
        }
    }
}

/// A worker subprocess running `mfa-relay worker`.
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl WorkerIo for WorkerProcess {
    fn pipes(&mut self) -> (WorkerInput<'_>, WorkerOutput<'_>, WorkerOutput<'_>) {
        (&mut self.stdin, &mut self.stdout, &mut self.stderr)
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

/// Starts workers by re-executing the current binary.
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: String,
    verbose: bool,
}

impl ProcessLauncher {
    pub fn new(config_path: &str, verbose: bool) -> anyhow::Result<Self> {
        Ok(ProcessLauncher {
            program: std::env::current_exe()?,
            config_path: config_path.to_string(),
            verbose,
        })
    }
}

impl Launcher for ProcessLauncher {
    type Worker = WorkerProcess;

    fn launch(&mut self) -> anyhow::Result<(WorkerId, WorkerProcess)> {
        let mut command = Command::new(&self.program);
        command.arg("worker").arg("--config").arg(&self.config_path);
        if self.verbose {
            command.arg("--verbose");
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let id = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("worker exited during startup"))?;
        let missing = || anyhow::anyhow!("worker {id} has no piped stdio");
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;
        Ok((
            id,
            WorkerProcess {
                child,
                stdin,
                stdout,
                stderr,
            },
        ))
    }
}

/// How a bridged connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The worker finished the session and can serve another.
    Finished,
    /// The client went away while the session was still open.
    ClientGone,
    WorkerFailed(String),
}

/// Copies bytes between a client and a worker until the session ends.
/// The end-of-session sentinel is swallowed.
pub async fn bridge<C, W>(client: &mut C, worker: &mut W, preamble: &str) -> BridgeEnd
where
    C: AsyncRead + AsyncWrite + Unpin,
    W: WorkerIo,
{
    let (stdin, stdout, stderr) = worker.pipes();
    if let Err(e) = send(&mut *stdin, preamble.as_bytes()).await {
        return BridgeEnd::WorkerFailed(format!("worker input closed: {e}"));
    }

    let mut inbound = vec![0u8; 8192];
    let mut outbound = vec![0u8; 8192];
    let mut errors = vec![0u8; 4096];
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            read = client.read(&mut inbound) => match read {
                Ok(0) | Err(_) => return BridgeEnd::ClientGone,
                Ok(n) => {
                    if let Err(e) = send(&mut *stdin, &inbound[..n]).await {
                        return BridgeEnd::WorkerFailed(format!("worker input closed: {e}"));
                    }
                }
            },
            read = stdout.read(&mut outbound) => match read {
                Ok(0) | Err(_) => return BridgeEnd::WorkerFailed("worker exited".to_string()),
                Ok(n) => {
                    pending.extend_from_slice(&outbound[..n]);
                    while let Some(end) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=end).collect();
                        if line.trim_ascii() == GOODBYE.as_bytes() {
                            return BridgeEnd::Finished;
                        }
                        if client.write_all(&line).await.is_err() {
                            return BridgeEnd::ClientGone;
                        }
                    }
                }
            },
            read = stderr.read(&mut errors) => match read {
                Ok(0) | Err(_) => return BridgeEnd::WorkerFailed("worker exited".to_string()),
                Ok(n) => {
                    let message = String::from_utf8_lossy(&errors[..n]).trim().to_string();
                    return BridgeEnd::WorkerFailed(message);
                }
            },
        }
    }
}

async fn send(stdin: WorkerInput<'_>, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

type Returned<W> = (WorkerId, W, BridgeEnd);

pub struct Supervisor<L: Launcher> {
    config: Arc<Config>,
    pool: ProcessManager<L>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(config: Arc<Config>, launcher: L) -> Self {
        let pool = ProcessManager::new(launcher, &config.app.processes);
        Supervisor { config, pool }
    }

    /// Serves until a shutdown command or signal arrives, then stops all
    /// workers and removes the control socket.
    pub async fn run(mut self, listeners: Vec<TcpListener>, control: IpcServer) -> anyhow::Result<()> {
        self.pool.fill()?;
        log::info!("Started {} workers", self.pool.len());

        let (accepted_tx, mut accepted) = mpsc::channel::<(TcpStream, SocketAddr)>(64);
        let acceptors: Vec<JoinHandle<()>> = listeners
            .into_iter()
            .map(|listener| {
                let accepted_tx = accepted_tx.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok(connection) => {
                                if accepted_tx.send(connection).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Accept failed: {e}"),
                        }
                    }
                })
            })
            .collect();

        let (returned_tx, mut returned) = mpsc::channel::<Returned<L::Worker>>(64);
        let (commands_tx, mut commands) = mpsc::channel(16);
        let socket_path = control.path().to_path_buf();
        let control = control.serve(commands_tx);
        let mut reaper = tokio::time::interval(Duration::from_secs(5));
        let mut terminate = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                Some((stream, peer)) = accepted.recv() => self.accept(stream, peer, &returned_tx),
                Some((id, worker, end)) = returned.recv() => self.returned(id, worker, end),
                Some(command) = commands.recv() => match command {
                    IpcCommand::Waiting(id) => {
                        if !self.pool.mark_waiting(id) {
                            log::debug!("Ignoring waiting announcement from worker {id}");
                        }
                    }
                    IpcCommand::Shutdown => break,
                },
                _ = reaper.tick() => {
                    if let Err(e) = self.pool.reap() {
                        log::error!("Unable to replenish workers: {e:#}");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received interrupt");
                    break;
                }
                _ = terminate.recv() => {
                    log::info!("Received SIGTERM");
                    break;
                }
            }
        }

        log::info!("Shutting down");
        for acceptor in acceptors {
            acceptor.abort();
        }
        control.abort();
        self.pool.shutdown();
        if let Err(e) = std::fs::remove_file(&socket_path) {
            log::warn!("Failed to remove control socket: {e}");
        }
        Ok(())
    }

    fn accept(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        returned: &mpsc::Sender<Returned<L::Worker>>,
    ) {
        let assigned = match self.pool.assign() {
            Ok(assigned) => assigned,
            Err(e) => {
                log::error!("Unable to start worker: {e:#}");
                None
            }
        };
        let Some((id, mut worker)) = assigned else {
            log::warn!("No worker available for {peer}");
            tokio::spawn(async move {
                let _ = stream.write_all(BUSY).await;
                let _ = stream.shutdown().await;
            });
            return;
        };

        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                log::warn!("Connection from {peer} lost before bridging: {e}");
                let _ = returned.try_send((id, worker, BridgeEnd::ClientGone));
                return;
            }
        };
        log::debug!("Worker {id} serving {peer}");

        let preamble = format!("CONNECT remote:tcp://{peer} local:tcp://{local}\r\n");
        let debug = self.config.app.debug;
        let returned = returned.clone();
        tokio::spawn(async move {
            let end = bridge(&mut stream, &mut worker, &preamble).await;
            if let BridgeEnd::WorkerFailed(message) = &end {
                log::error!("Worker {id} failed: {message}");
                let reply = match message.lines().next() {
                    Some(first) if debug => format!("550 5.7.1 SCE: {first}\r\n"),
                    _ => format!("{SCE}\r\n"),
                };
                let _ = stream.write_all(reply.as_bytes()).await;
            }
            let _ = stream.shutdown().await;
            let _ = returned.send((id, worker, end)).await;
        });
    }

    fn returned(&mut self, id: WorkerId, worker: L::Worker, end: BridgeEnd) {
        let result = match end {
            BridgeEnd::Finished => self.pool.release(id, worker),
            BridgeEnd::ClientGone | BridgeEnd::WorkerFailed(_) => {
                drop(worker);
                self.pool.kill_process(id)
            }
        };
        if let Err(e) = result {
            log::error!("Unable to replenish workers: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::pool::tests::{fake_worker, FakeEnds};
    use super::*;
    use crate::dns::tests::FixedResolver;
    use crate::filter::Pipeline;
    use crate::worker::Worker;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, BufReader};

    /// Runs each worker as a task inside the test runtime.
    struct InProcessLauncher {
        config: Arc<Config>,
        next: WorkerId,
    }

    impl Launcher for InProcessLauncher {
        type Worker = pool::tests::FakeWorker;

        fn launch(&mut self) -> anyhow::Result<(WorkerId, Self::Worker)> {
            self.next += 1;
            let (worker, ends) = fake_worker();
            let FakeEnds { stdin, stdout, stderr, .. } = ends;
            let config = self.config.clone();
            tokio::spawn(async move {
                let _stderr = stderr;
                let worker = Worker::with_parts(
                    config,
                    Arc::new(Pipeline::new()),
                    Arc::new(FixedResolver(HashMap::new())),
                )
                .unwrap();
                let _ = worker.serve(stdin, stdout).await;
            });
            Ok((self.next, worker))
        }
    }

    async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[test]
    fn test_pid_file_guards_against_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("relay.pid");
        let guard = PidFile::create(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        let err = PidFile::create(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_run_paths() {
        let mut config = Config::default();
        config.app.storage_dir = "/srv/relay".to_string();
        assert_eq!(pid_path(&config), PathBuf::from("/srv/relay/run/mfa-relay-esmtp.pid"));
        assert_eq!(socket_path(&config), PathBuf::from("/srv/relay/run/mfa-relay-esmtp.sock"));
    }

    #[tokio::test]
    async fn test_bridge_swallows_sentinel() {
        let (mut worker, mut ends) = fake_worker();
        let (mut client, mut remote) = tokio::io::duplex(8192);

        let bridging = tokio::spawn(async move {
            let end = bridge(&mut remote, &mut worker, "CONNECT preamble\r\n").await;
            (end, remote)
        });

        let mut preamble = BufReader::new(&mut ends.stdin);
        assert_eq!(read_line(&mut preamble).await, "CONNECT preamble\r\n");

        client.write_all(b"QUIT\r\n").await.unwrap();
        let mut from_client = BufReader::new(&mut ends.stdin);
        assert_eq!(read_line(&mut from_client).await, "QUIT\r\n");

        ends.stdout
            .write_all(b"221 2.0.0 Goodbye\r\nGoodbye\r\n")
            .await
            .unwrap();
        let (end, remote) = bridging.await.unwrap();
        assert_eq!(end, BridgeEnd::Finished);
        drop(remote);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "221 2.0.0 Goodbye\r\n");
    }

    #[tokio::test]
    async fn test_bridge_reports_worker_errors() {
        let (mut worker, mut ends) = fake_worker();
        let (_client, mut remote) = tokio::io::duplex(8192);
        ends.stderr.write_all(b"thread 'main' panicked\n").await.unwrap();
        let end = bridge(&mut remote, &mut worker, "CONNECT\r\n").await;
        assert_eq!(end, BridgeEnd::WorkerFailed("thread 'main' panicked".to_string()));
    }

    #[tokio::test]
    async fn test_bridge_notices_client_leaving() {
        let (mut worker, _ends) = fake_worker();
        let (client, mut remote) = tokio::io::duplex(8192);
        drop(client);
        let end = bridge(&mut remote, &mut worker, "CONNECT\r\n").await;
        assert_eq!(end, BridgeEnd::ClientGone);
    }

    #[tokio::test]
    async fn test_supervisor_serves_and_sheds_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.app.name = "Test ESMTP".to_string();
        config.app.storage_dir = dir.path().to_string_lossy().into_owned();
        config.app.processes.min = 1;
        config.app.processes.max = 1;
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = dir.path().join("relay.sock");
        let control = IpcServer::bind(&socket).unwrap();
        let supervisor = Supervisor::new(
            config.clone(),
            InProcessLauncher {
                config: config.clone(),
                next: 0,
            },
        );
        let running = tokio::spawn(supervisor.run(vec![listener], control));

        let first = TcpStream::connect(addr).await.unwrap();
        let (first_read, mut first_write) = first.into_split();
        let mut first_read = BufReader::new(first_read);
        assert_eq!(read_line(&mut first_read).await, "220 Greetings from MFA Relay\r\n");

        // The only worker is busy.
        let second = TcpStream::connect(addr).await.unwrap();
        let mut second = BufReader::new(second);
        assert_eq!(
            read_line(&mut second).await,
            "450 4.3.2 Server busy, try again later\r\n"
        );

        first_write.write_all(b"HELO client\r\nQUIT\r\n").await.unwrap();
        assert_eq!(read_line(&mut first_read).await, "250 Test ESMTP\r\n");
        assert_eq!(read_line(&mut first_read).await, "221 2.0.0 Goodbye\r\n");
        assert_eq!(read_line(&mut first_read).await, "");

        tokio::time::sleep(Duration::from_millis(200)).await;

        // The same worker takes the next connection.
        let third = TcpStream::connect(addr).await.unwrap();
        let mut third = BufReader::new(third);
        assert_eq!(read_line(&mut third).await, "220 Greetings from MFA Relay\r\n");

        assert_eq!(ipc::send(&socket, "QUIT").await.unwrap(), "quit");
        assert!(running.await.unwrap().is_ok());
        assert!(!socket.exists());
    }
}
