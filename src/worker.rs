//! The worker side of the pool: one SMTP session at a time over
//! stdin/stdout, relayed by the supervisor.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::config::{Config, QueueMode};
use crate::dns::{DnsResolver, Resolve};
use crate::filter::Pipeline;
use crate::queue::QueueProcessor;
use crate::session::{Session, SessionState};

/// Written on its own line once a session is over. Never reaches the
/// client.
pub const GOODBYE: &str = "Goodbye";

/// Sends worker logs to `<storage>/logs/<app>.log`, since stdout carries
/// SMTP and stderr is reserved for fatal errors.
pub fn init_logging(config: &Config, level: log::LevelFilter) -> anyhow::Result<()> {
    let dir = config.storage_dir().join("logs");
    std::fs::create_dir_all(&dir)?;
    let file_name = format!("{}.log", config.app_slug());
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(file_name))?;

    let pid = std::process::id();
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(env_logger::Target::Pipe(Box::new(file)))
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} [{pid}] {} {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()?;
    Ok(())
}

pub struct Worker {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    resolver: Arc<dyn Resolve>,
    processor: Arc<QueueProcessor>,
}

impl Worker {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let pipeline = Arc::new(Pipeline::from_config(&config)?);
        let resolver = DnsResolver::from_system_conf(Duration::from_secs(config.dns.timeout_seconds))?;
        Self::with_parts(Arc::new(config), pipeline, Arc::new(resolver))
    }

    pub fn with_parts(
        config: Arc<Config>,
        pipeline: Arc<Pipeline>,
        resolver: Arc<dyn Resolve>,
    ) -> anyhow::Result<Self> {
        let processor = Arc::new(QueueProcessor::new(&config, pipeline.clone())?);
        Ok(Worker {
            config,
            pipeline,
            resolver,
            processor,
        })
    }

    fn session(&self) -> Session {
        Session::new(self.config.clone(), self.pipeline.clone(), self.resolver.clone())
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serves sessions until `input` is closed.
    pub async fn serve<R, W>(&self, mut input: R, mut output: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let idle = self.config.idle_timeout();
        let mut session = self.session();
        let mut background = JoinSet::new();
        let mut buf = vec![0u8; 8192];

        loop {
            let replies = if session.state() == SessionState::Init {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                session.feed(&buf[..n]).await
            } else {
                match timeout(idle, input.read(&mut buf)).await {
                    Ok(read) => {
                        let n = read?;
                        if n == 0 {
                            log::info!("Input closed mid-session");
                            break;
                        }
                        session.feed(&buf[..n]).await
                    }
                    Err(_) => {
                        log::info!("Session idle for {}s, closing", idle.as_secs());
                        vec![session.timeout()]
                    }
                }
            };

            for reply in &replies {
                output.write_all(reply.line().as_bytes()).await?;
                output.write_all(b"\r\n").await?;
            }
            output.flush().await?;

            while let Some(finished) = background.try_join_next() {
                if let Err(e) = finished {
                    log::warn!("Background delivery task failed: {e}");
                }
            }

            for mail in session.take_queued() {
                match self.config.relay.queue_processor {
                    QueueMode::Background => {
                        let processor = self.processor.clone();
                        background.spawn(async move { processor.run(mail).await });
                    }
                    QueueMode::Inline | QueueMode::Disabled => self.processor.run(mail).await,
                }
            }

            if session.is_closed() {
                output.write_all(format!("{GOODBYE}\r\n").as_bytes()).await?;
                output.flush().await?;
                session = self.session();
            }
        }

        while background.join_next().await.is_some() {}
        Ok(())
    }
}
