use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::dsn::Dsn;
use crate::config::SpamAssassinConfig;
use crate::mail::Mail;

lazy_static! {
    static ref CONTINUATION: Regex = Regex::new(r"(?i)^\s+[a-z]+").unwrap();
    static ref SPAM_LINE: Regex =
        Regex::new(r"(?i)^Spam:\s+(True|False|Yes|No)\s+;\s+(-?[0-9.]+)\s+/\s+(-?[0-9.]+)").unwrap();
    static ref SPAM_STATUS: Regex = Regex::new(concat!(
        r"^X-Spam-Status: ",
        r"(?:(?:Yes|No), score=[0-9.\-]+ required=[0-9.\-]+ )?",
        r"tests=(.*) autolearn=(yes|no)(?: autolearn_force=(yes|no))?",
        r" version=([0-9.]+)$"
    ))
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpamTest {
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpamReport {
    pub total_score: f64,
    pub tests: Vec<SpamTest>,
    pub autolearn: bool,
    pub autolearn_force: bool,
    pub version: String,
    /// From the `Spam:` response header, when spamd sends one.
    pub is_spam: Option<bool>,
    pub score: Option<f64>,
    pub required: Option<f64>,
}

impl Default for SpamReport {
    fn default() -> Self {
        SpamReport {
            total_score: 0.0,
            tests: Vec::new(),
            autolearn: false,
            autolearn_force: false,
            version: "v0.0.0".to_string(),
            is_spam: None,
            score: None,
            required: None,
        }
    }
}

impl SpamReport {
    /// Parses a spamd `HEADERS` response. Folded lines are joined before
    /// matching.
    pub fn parse(response: &str) -> Self {
        let mut logical: Vec<String> = Vec::new();
        for line in response.lines() {
            if CONTINUATION.is_match(line) {
                if let Some(current) = logical.last_mut() {
                    current.push(' ');
                    current.push_str(line.trim());
                    continue;
                }
            }
            logical.push(line.trim().to_string());
        }

        let mut report = SpamReport::default();
        for line in &logical {
            if let Some(caps) = SPAM_LINE.captures(line) {
                let verdict = caps[1].to_ascii_lowercase();
                report.is_spam = Some(verdict == "true" || verdict == "yes");
                report.score = caps[2].parse().ok();
                report.required = caps[3].parse().ok();
            } else if let Some(caps) = SPAM_STATUS.captures(line) {
                report.tests = caps[1]
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty() && *t != "none")
                    .map(|test| match test.split_once('=') {
                        Some((name, score)) => SpamTest {
                            name: name.trim().to_string(),
                            score: score.trim().parse().unwrap_or(0.0),
                        },
                        None => SpamTest {
                            name: test.to_string(),
                            score: 0.0,
                        },
                    })
                    .collect();
                report.total_score = report.tests.iter().map(|t| t.score).sum();
                report.autolearn = caps[2].eq_ignore_ascii_case("yes");
                report.autolearn_force = caps
                    .get(3)
                    .map(|m| m.as_str().eq_ignore_ascii_case("yes"))
                    .unwrap_or(false);
                report.version = caps[4].to_string();
            }
        }
        report
    }

    /// The score to act on: the sum of test scores, or spamd's own score
    /// when no tests were reported.
    pub fn effective_score(&self) -> f64 {
        match (self.tests.is_empty(), self.score) {
            (true, Some(score)) => score,
            _ => self.total_score,
        }
    }
}

/// A spamc client for one message. Socket failures leave the reason in
/// `error()`.
pub struct SpamAssassin {
    dsn: Dsn,
    max_size: usize,
    timeout: Duration,
    user: Option<String>,
    error: Option<String>,
}

impl SpamAssassin {
    pub fn new(config: &SpamAssassinConfig) -> anyhow::Result<Self> {
        Ok(SpamAssassin {
            dsn: config.socket.parse()?,
            max_size: config.max_size,
            timeout: Duration::from_secs(config.timeout_seconds),
            user: config.user.clone(),
            error: None,
        })
    }

    pub fn set_user(&mut self, user: impl Into<String>) -> &mut Self {
        self.user = Some(user.into());
        self
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of message bytes submitted.
    pub fn content_length(&self, mail: &Mail) -> usize {
        let len = mail.raw().len();
        if self.max_size > 0 {
            len.min(self.max_size)
        } else {
            len
        }
    }

    pub async fn scan(&mut self, mail: &Mail) -> Option<SpamReport> {
        match tokio::time::timeout(self.timeout, self.exchange(mail)).await {
            Ok(Ok(response)) => Some(SpamReport::parse(&response)),
            Ok(Err(e)) => {
                log::warn!("SpamAssassin scan aborted: {e:#}");
                self.error = Some(format!("{e:#}"));
                None
            }
            Err(_) => {
                log::warn!("SpamAssassin scan timed out");
                self.error = Some("timed out waiting for spamd".to_string());
                None
            }
        }
    }

    async fn exchange(&self, mail: &Mail) -> anyhow::Result<String> {
        let length = self.content_length(mail);
        let mut request = format!("HEADERS SPAMC/1.2\r\nContent-length: {length}\r\n");
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            request.push_str(&format!("User: {user}\r\n"));
        }
        request.push_str("\r\n");

        let mut stream = self.dsn.connect(self.timeout).await?;
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(&mail.raw()[..length]).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}
