//! Virus and spam scanner clients, and the pipeline filters that act on
//! their verdicts.

pub mod clamav;
pub mod dsn;
pub mod spamassassin;

pub use clamav::{ClamAv, ClamAvReport, ScanTarget};
pub use dsn::{Dsn, DsnError};
pub use spamassassin::{SpamAssassin, SpamReport, SpamTest};

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::{ClamAvConfig, FailurePolicy, InfectedAction, SpamAssassinConfig};
use crate::filter::Filter;
use crate::mail::Mail;
use crate::outcome::{Halt, Outcome};
use crate::storage::Storage;

fn unavailable(scanner: &str, policy: FailurePolicy, mail: &mut Mail, error: &str) -> Result<(), Halt> {
    mail.set_supplemental(&format!("{scanner}_error"), error);
    match policy {
        FailurePolicy::Continue => {
            log::warn!("{scanner} unavailable, continuing without it: {error}");
            Ok(())
        }
        FailurePolicy::Defer => {
            log::warn!("{scanner} unavailable, deferring: {error}");
            Err(Outcome::defer(451, "4.7.1 Scanner unavailable, try again later").into())
        }
    }
}

pub struct ClamAvFilter {
    config: ClamAvConfig,
    storage: Storage,
}

impl ClamAvFilter {
    pub fn new(config: ClamAvConfig, storage_dir: PathBuf) -> anyhow::Result<Self> {
        config.socket.parse::<Dsn>()?;
        Ok(ClamAvFilter {
            config,
            storage: Storage::new(storage_dir),
        })
    }
}

#[async_trait]
impl Filter for ClamAvFilter {
    fn name(&self) -> &str {
        "clamav"
    }

    async fn filter(&self, mail: &mut Mail) -> Result<(), Halt> {
        let started = Instant::now();
        let mut scanner = ClamAv::new(&self.config, self.storage.clone())?;
        let report = scanner.scan(mail).await;
        mail.record_timing("clamav", started.elapsed().as_secs_f64());

        let Some(report) = report else {
            let error = scanner.error().unwrap_or("unknown error").to_string();
            return unavailable("clamav", self.config.on_failure, mail, &error);
        };
        mail.set_supplemental("clamav", serde_json::to_value(&report).map_err(anyhow::Error::from)?);

        if !report.infected {
            return Ok(());
        }
        let viruses: Vec<&str> = report.viruses.values().map(String::as_str).collect();
        log::info!(
            "Virus found in {}: {}",
            mail.existing_queue_id().unwrap_or("unqueued message"),
            viruses.join(", ")
        );
        let outcome = match self.config.action {
            InfectedAction::Reject => {
                Outcome::reject(554, format!("5.7.1 Virus found: {}", viruses.join(", ")))
            }
            InfectedAction::Quarantine => Outcome::quarantine(250, "2.0.0 Ok"),
        };
        Err(outcome.into())
    }
}

pub struct SpamAssassinFilter {
    config: SpamAssassinConfig,
}

impl SpamAssassinFilter {
    pub fn new(config: SpamAssassinConfig) -> anyhow::Result<Self> {
        config.socket.parse::<Dsn>()?;
        Ok(SpamAssassinFilter { config })
    }
}

#[async_trait]
impl Filter for SpamAssassinFilter {
    fn name(&self) -> &str {
        "spamassassin"
    }

    async fn filter(&self, mail: &mut Mail) -> Result<(), Halt> {
        let started = Instant::now();
        let mut scanner = SpamAssassin::new(&self.config)?;
        if self.config.user.is_none() {
            if let Some(recipient) = mail.recipients().first() {
                scanner.set_user(recipient.clone());
            }
        }
        let report = scanner.scan(mail).await;
        mail.record_timing("spamassassin", started.elapsed().as_secs_f64());

        let Some(report) = report else {
            let error = scanner.error().unwrap_or("unknown error").to_string();
            return unavailable("spamassassin", self.config.on_failure, mail, &error);
        };
        mail.set_supplemental(
            "spamassassin",
            serde_json::to_value(&report).map_err(anyhow::Error::from)?,
        );

        let score = report.effective_score();
        if self.config.add_headers {
            let tests: Vec<&str> = report.tests.iter().map(|t| t.name.as_str()).collect();
            mail.prepend_header("X-Spam-Tests", tests.join(","));
            mail.prepend_header("X-Spam-Score", format!("{score:.1}"));
        }

        if self.config.reject_score.is_some_and(|limit| score >= limit) {
            log::info!("Rejecting spam with score {score:.1}");
            return Err(Outcome::reject(550, "5.7.1 Message considered spam").into());
        }
        if self.config.quarantine_score.is_some_and(|limit| score >= limit) {
            log::info!("Quarantining spam with score {score:.1}");
            return Err(Outcome::quarantine(250, "2.0.0 Ok").into());
        }
        Ok(())
    }
}
