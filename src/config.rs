use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::filter::Stage;
use crate::mail::Destination;
use crate::scanner::Dsn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub relay: RelayConfig,
    pub scanners: ScannersConfig,
    pub dns: DnsConfig,
    pub rules: Vec<FilterRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    /// Name announced in EHLO to the next hop. Defaults to a slug of `name`.
    pub hostname: Option<String>,
    pub debug: bool,
    pub defer_on_exception: bool,
    pub storage_dir: String,
    pub processes: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub min: usize,
    pub max: usize,
    pub max_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Run the queue processor before reading the next command.
    Inline,
    /// Run the queue processor as a separate task in the worker.
    Background,
    /// Skip the on-disk queue file, deliver inline.
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub greeting_banner: String,
    pub ports: Vec<String>,
    pub timeout_seconds: u64,
    pub unfold_headers: bool,
    pub queue_processor: QueueMode,
    pub default_relay: String,
    pub connect_timeout_seconds: u64,
    pub xforward: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannersConfig {
    pub clamav: Option<ClamAvConfig>,
    pub spamassassin: Option<SpamAssassinConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    InStream,
    OnDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfectedAction {
    Reject,
    Quarantine,
}

/// What a scanner filter does when the scanner cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Continue,
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendEmailConfig {
    pub enabled: bool,
    pub max_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClamAvConfig {
    pub socket: String,
    pub mode: ScanMode,
    pub max_size: usize,
    pub send_email: SendEmailConfig,
    pub timeout_seconds: u64,
    pub stage: Stage,
    pub action: InfectedAction,
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamAssassinConfig {
    pub socket: String,
    /// Bytes of the message submitted; 0 submits everything.
    pub max_size: usize,
    pub timeout_seconds: u64,
    pub user: Option<String>,
    pub stage: Stage,
    pub quarantine_score: Option<f64>,
    pub reject_score: Option<f64>,
    pub on_failure: FailurePolicy,
    pub add_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub name: String,
    #[serde(default = "default_rule_stage")]
    pub stage: Stage,
    pub criteria: Criteria,
    pub action: Action,
}

fn default_rule_stage() -> Stage {
    Stage::Data
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Criteria {
    SenderPattern {
        pattern: String,
    },
    RecipientPattern {
        pattern: String,
    },
    HeloPattern {
        pattern: String,
    },
    SenderIpPattern {
        pattern: String,
    },
    SenderNamePattern {
        pattern: String,
    },
    HeaderPattern {
        header: String,
        pattern: String,
    },
    /// Shell-style match: `*`, `?`, `[abc]` and `[!abc]`.
    SenderGlob {
        pattern: String,
    },
    RecipientGlob {
        pattern: String,
    },
    And {
        criteria: Vec<Criteria>,
    },
    Or {
        criteria: Vec<Criteria>,
    },
    Not {
        criteria: Box<Criteria>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    Reject {
        code: Option<u16>,
        message: Option<String>,
    },
    Defer {
        code: Option<u16>,
        message: Option<String>,
    },
    Quarantine {
        code: Option<u16>,
        message: Option<String>,
    },
    Drop {
        code: Option<u16>,
        message: Option<String>,
    },
    Route {
        destination: String,
    },
    AddHeader {
        name: String,
        value: String,
    },
    Accept,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            name: "MFA Relay ESMTP".to_string(),
            hostname: None,
            debug: false,
            defer_on_exception: false,
            storage_dir: "/var/lib/mfa-relay".to_string(),
            processes: ProcessConfig::default(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            min: 5,
            max: 20,
            max_requests: 1000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            greeting_banner: "Greetings from MFA Relay".to_string(),
            ports: vec!["127.0.0.1:2525".to_string()],
            timeout_seconds: 300,
            unfold_headers: true,
            queue_processor: QueueMode::Inline,
            default_relay: "127.0.0.1:10026".to_string(),
            connect_timeout_seconds: 30,
            xforward: false,
        }
    }
}

impl Default for SendEmailConfig {
    fn default() -> Self {
        SendEmailConfig {
            enabled: false,
            max_size: 128_000,
        }
    }
}

impl Default for ClamAvConfig {
    fn default() -> Self {
        ClamAvConfig {
            socket: "unix:///var/run/clamav/clamd.ctl".to_string(),
            mode: ScanMode::InStream,
            max_size: 64_000,
            send_email: SendEmailConfig::default(),
            timeout_seconds: 30,
            stage: Stage::Data,
            action: InfectedAction::Reject,
            on_failure: FailurePolicy::Continue,
        }
    }
}

impl Default for SpamAssassinConfig {
    fn default() -> Self {
        SpamAssassinConfig {
            socket: "ipv4://127.0.0.1:783".to_string(),
            max_size: 0,
            timeout_seconds: 30,
            user: None,
            stage: Stage::Data,
            quarantine_score: Some(5.0),
            reject_score: None,
            on_failure: FailurePolicy::Continue,
            add_headers: true,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig { timeout_seconds: 10 }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks everything that would otherwise only fail at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        let processes = &self.app.processes;
        if processes.max == 0 || processes.min > processes.max {
            anyhow::bail!(
                "app.processes: need 0 < max and min <= max (min {}, max {})",
                processes.min,
                processes.max
            );
        }
        self.listen_addrs()?;

        match self.relay.default_relay.parse::<Destination>() {
            Ok(Destination::Relay { .. }) => {}
            _ => anyhow::bail!(
                "relay.default_relay must be ip:port, got '{}'",
                self.relay.default_relay
            ),
        }

        if let Some(clamav) = &self.scanners.clamav {
            clamav
                .socket
                .parse::<Dsn>()
                .context("scanners.clamav.socket")?;
        }
        if let Some(spamassassin) = &self.scanners.spamassassin {
            spamassassin
                .socket
                .parse::<Dsn>()
                .context("scanners.spamassassin.socket")?;
        }

        crate::rules::RulesFilter::compile(&self.rules)?;
        Ok(())
    }

    /// Listening addresses. A bare port listens on 127.0.0.1.
    pub fn listen_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.relay
            .ports
            .iter()
            .map(|port| {
                let addr = if port.contains(':') {
                    port.clone()
                } else {
                    format!("127.0.0.1:{port}")
                };
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid listen address '{port}'"))
            })
            .collect()
    }

    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.storage_dir)
    }

    /// File-name friendly form of the application name.
    pub fn app_slug(&self) -> String {
        self.app
            .name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
            .collect()
    }

    pub fn ehlo_name(&self) -> String {
        match &self.app.hostname {
            Some(hostname) if !hostname.trim().is_empty() => hostname.trim().to_string(),
            _ => self.app_slug(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.connect_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ehlo_name_is_a_single_token() {
        let mut config = Config::default();
        assert_eq!(config.app_slug(), "mfa-relay-esmtp");
        assert_eq!(config.ehlo_name(), "mfa-relay-esmtp");
        config.app.hostname = Some("relay.example.com".to_string());
        assert_eq!(config.ehlo_name(), "relay.example.com");
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.app.processes.min, 5);
        assert_eq!(config.app.processes.max, 20);
        assert_eq!(config.relay.timeout_seconds, 300);
        assert_eq!(config.relay.queue_processor, QueueMode::Inline);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
app:
  name: Test Relay
relay:
  ports: ["2525", "0.0.0.0:25"]
  queue_processor: none
scanners:
  clamav:
    socket: ipv4://127.0.0.1:3310
    mode: on_disk
rules:
  - name: block example
    stage: rcpt_to
    criteria:
      type: RecipientPattern
      pattern: "@blocked\\.example$"
    action:
      type: Reject
      code: 552
      message: blocked
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.app.name, "Test Relay");
        assert_eq!(config.app.processes.max_requests, 1000);
        assert_eq!(config.relay.queue_processor, QueueMode::Disabled);
        let clamav = config.scanners.clamav.as_ref().unwrap();
        assert_eq!(clamav.mode, ScanMode::OnDisk);
        assert_eq!(clamav.max_size, 64_000);
        assert!(config.scanners.spamassassin.is_none());
        assert_eq!(config.rules[0].stage, Stage::RcptTo);

        let addrs = config.listen_addrs().unwrap();
        assert_eq!(addrs[0].to_string(), "127.0.0.1:2525");
        assert_eq!(addrs[1].to_string(), "0.0.0.0:25");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.app.processes.min = 30;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.default_relay = "nowhere".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rules.push(FilterRule {
            name: "broken".to_string(),
            stage: Stage::Data,
            criteria: Criteria::SenderPattern {
                pattern: "([".to_string(),
            },
            action: Action::Accept,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.scanners.spamassassin = Some(SpamAssassinConfig::default());
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.app.name, config.app.name);
        assert_eq!(
            loaded.scanners.spamassassin.unwrap().quarantine_score,
            Some(5.0)
        );
    }
}
