use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::mail::Mail;
use crate::outcome::Halt;
use crate::rules::RulesFilter;
use crate::scanner::{ClamAvFilter, SpamAssassinFilter};

/// The protocol checkpoints a filter can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Connect,
    Helo,
    MailFrom,
    RcptTo,
    /// Connection details supplied by XFORWARD.
    Connection,
    Data,
    Queued,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Helo => "helo",
            Stage::MailFrom => "mail_from",
            Stage::RcptTo => "rcpt_to",
            Stage::Connection => "connection",
            Stage::Data => "data",
            Stage::Queued => "queued",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the pipeline. Returning `Ok` hands the (possibly modified)
/// mail to the next filter; an `Err` stops the stage.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    async fn filter(&self, mail: &mut Mail) -> Result<(), Halt>;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: HashMap<Stage, Vec<Arc<dyn Filter>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the rule and scanner filters described by the configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut pipeline = Pipeline::new();

        for (stage, rules) in RulesFilter::compile(&config.rules)? {
            pipeline.add(stage, Arc::new(rules));
        }
        if let Some(clamav) = &config.scanners.clamav {
            let filter = ClamAvFilter::new(clamav.clone(), config.storage_dir())?;
            pipeline.add(clamav.stage, Arc::new(filter));
        }
        if let Some(spamassassin) = &config.scanners.spamassassin {
            let filter = SpamAssassinFilter::new(spamassassin.clone())?;
            pipeline.add(spamassassin.stage, Arc::new(filter));
        }

        for (stage, filters) in &pipeline.stages {
            let names: Vec<&str> = filters.iter().map(|f| f.name()).collect();
            log::debug!("Stage {stage}: {}", names.join(", "));
        }
        Ok(pipeline)
    }

    pub fn add(&mut self, stage: Stage, filter: Arc<dyn Filter>) {
        self.stages.entry(stage).or_default().push(filter);
    }

    pub fn with(mut self, stage: Stage, filter: impl Filter + 'static) -> Self {
        self.add(stage, Arc::new(filter));
        self
    }

    pub fn filters(&self, stage: Stage) -> &[Arc<dyn Filter>] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or_default()
    }

    /// Runs a stage's filters in order. Stops as soon as one halts or the
    /// mail has reached a terminal destination.
    pub async fn run(&self, stage: Stage, mail: &mut Mail) -> Result<(), Halt> {
        for filter in self.filters(stage) {
            if mail.final_destination().is_terminal() {
                log::debug!(
                    "Skipping remaining {stage} filters, destination is {}",
                    mail.final_destination()
                );
                break;
            }
            log::debug!("Running filter {} at {stage}", filter.name());
            filter.filter(mail).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mail::Destination;
    use crate::outcome::Outcome;
    use std::sync::Mutex;

    /// Records its name into a shared log, then optionally halts.
    pub(crate) struct Probe {
        pub name: String,
        pub seen: Arc<Mutex<Vec<String>>>,
        pub halt: Option<Outcome>,
    }

    #[async_trait]
    impl Filter for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn filter(&self, mail: &mut Mail) -> Result<(), Halt> {
            self.seen.lock().unwrap().push(self.name.clone());
            mail.append_header("X-Probe", self.name.clone());
            match &self.halt {
                Some(outcome) => Err(outcome.clone().into()),
                None => Ok(()),
            }
        }
    }

    fn probe(name: &str, seen: &Arc<Mutex<Vec<String>>>, halt: Option<Outcome>) -> Probe {
        Probe {
            name: name.to_string(),
            seen: seen.clone(),
            halt,
        }
    }

    #[tokio::test]
    async fn test_filters_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with(Stage::Data, probe("first", &seen, None))
            .with(Stage::Data, probe("second", &seen, None))
            .with(Stage::Helo, probe("other", &seen, None));

        let mut mail = Mail::new();
        assert!(pipeline.run(Stage::Data, &mut mail).await.is_ok());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(mail.header("x-probe").unwrap(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_outcome_stops_the_stage() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with(Stage::RcptTo, probe("blocker", &seen, Some(Outcome::reject(552, "blocked"))))
            .with(Stage::RcptTo, probe("never", &seen, None));

        let mut mail = Mail::new();
        match pipeline.run(Stage::RcptTo, &mut mail).await {
            Err(Halt::Outcome(outcome)) => assert_eq!(outcome.to_string(), "552 blocked"),
            _ => panic!("Expected reject outcome"),
        }
        assert_eq!(*seen.lock().unwrap(), vec!["blocker"]);
    }

    #[tokio::test]
    async fn test_terminal_destination_skips_filters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new().with(Stage::Data, probe("scanner", &seen, None));

        let mut mail = Mail::new();
        mail.set_final_destination(Destination::Quarantine);
        assert!(pipeline.run(Stage::Data, &mut mail).await.is_ok());
        assert!(seen.lock().unwrap().is_empty());

        mail.set_final_destination(Destination::Mailbox("a@example.com".into()));
        assert!(pipeline.run(Stage::Data, &mut mail).await.is_ok());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_from_default_config_is_empty() {
        let pipeline = Pipeline::from_config(&Config::default()).unwrap();
        assert!(pipeline.filters(Stage::Data).is_empty());
    }
}
