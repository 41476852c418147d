//! The SMTP conversation of one client connection.
//!
//! A session is fed raw bytes (first the supervisor's `CONNECT` preamble,
//! then whatever the client sends) and answers with reply lines. Filters
//! run at each protocol checkpoint; their outcomes become the reply to the
//! command being processed.

use lazy_static::lazy_static;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, QueueMode};
use crate::dns::{Lookup, Resolve};
use crate::filter::{Pipeline, Stage};
use crate::id;
use crate::mail::{Connection, Mail, MessageParser, ParseState, UNKNOWN_SENDER_NAME};
use crate::outcome::{Halt, Outcome};
use crate::storage::Storage;

lazy_static! {
    static ref CONNECT: Regex =
        Regex::new(r"(?i)^CONNECT remote:\w+://(.+):\d+ local:\w+://.+:(.+)$").unwrap();
}

/// One reply line, without its CRLF terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Say(String),
    /// Send the line, then end the connection.
    Close(String),
}

impl Output {
    pub fn line(&self) -> &str {
        match self {
            Output::Say(line) | Output::Close(line) => line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Ready,
    Helo,
    MailFrom,
    RcptTo,
    DataHeaders,
    DataBody,
    Closed,
}

pub struct Session {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    resolver: Arc<dyn Resolve>,
    storage: Storage,
    state: SessionState,
    mail: Mail,
    parser: Option<MessageParser>,
    buffer: Vec<u8>,
    replies: Vec<Output>,
    queued: Vec<Mail>,
}

/// Splits `VERB: <path> PARAMS` into the bare address. The null path
/// stays `<>`.
fn parse_path(argument: &str) -> String {
    let token = argument.split_whitespace().next().unwrap_or_default();
    if token == "<>" {
        return token.to_string();
    }
    let token = token.strip_prefix('<').unwrap_or(token);
    token.strip_suffix('>').unwrap_or(token).to_string()
}

impl Session {
    pub fn new(config: Arc<Config>, pipeline: Arc<Pipeline>, resolver: Arc<dyn Resolve>) -> Self {
        let storage = Storage::new(config.storage_dir());
        Session {
            config,
            pipeline,
            resolver,
            storage,
            state: SessionState::Init,
            mail: Mail::new(),
            parser: None,
            buffer: Vec::new(),
            replies: Vec::new(),
            queued: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.parser, self.state) {
            (Some(parser), _) if parser.state() == ParseState::ReadingHeaders => {
                SessionState::DataHeaders
            }
            (Some(_), _) => SessionState::DataBody,
            (None, state) => state,
        }
    }

    pub fn mail(&self) -> &Mail {
        &self.mail
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Messages accepted since the last call, ready for the queue processor.
    pub fn take_queued(&mut self) -> Vec<Mail> {
        std::mem::take(&mut self.queued)
    }

    /// The reply sent when the client has been idle for too long.
    pub fn timeout(&mut self) -> Output {
        self.state = SessionState::Closed;
        Output::Close(format!(
            "421 4.4.2 {} Error: timeout exceeded",
            self.config.app.name
        ))
    }

    /// Processes every complete line in `chunk` and returns the replies.
    /// A trailing partial line is kept until the next chunk.
    pub async fn feed(&mut self, chunk: &[u8]) -> Vec<Output> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }

        let pipelined = lines.len() > 1 && self.parser.is_none();
        for line in lines {
            if self.is_closed() {
                break;
            }
            if self.parser.is_some() {
                self.data_line(line).await;
            } else {
                let text = String::from_utf8_lossy(&line).into_owned();
                self.command(text.trim()).await;
                if pipelined && !self.is_closed() {
                    self.mail.set_supplemental("pipelining_in_use", true);
                }
            }
        }

        std::mem::take(&mut self.replies)
    }

    fn say(&mut self, line: impl Into<String>) {
        self.replies.push(Output::Say(line.into()));
    }

    fn close(&mut self, line: impl Into<String>) {
        self.replies.push(Output::Close(line.into()));
        self.state = SessionState::Closed;
        self.parser = None;
    }

    async fn command(&mut self, line: &str) {
        let lower = line.to_ascii_lowercase();

        if lower.starts_with("connect") {
            return self.connect(line).await;
        }
        if self.state == SessionState::Init {
            // No client is attached yet, so nothing may be answered.
            if !line.is_empty() {
                log::debug!("Discarding input before CONNECT: {line}");
            }
            return;
        }

        if lower.starts_with("helo") || lower.starts_with("ehlo") {
            self.helo(line).await;
        } else if lower.starts_with("mail from") {
            self.mail_from(line).await;
        } else if lower.starts_with("rcpt to") {
            self.rcpt_to(line).await;
        } else if lower.starts_with("xforward") {
            self.xforward(line).await;
        } else if lower.starts_with("data") {
            if lower != "data" {
                self.say("501 5.5.4 Syntax: DATA");
            } else if self.mail.recipients().is_empty() {
                self.say("503 5.5.1 Error: need RCPT command");
            } else {
                self.say("354 End data with <CR><LF>.<CR><LF>");
                self.parser = Some(MessageParser::new(self.config.relay.unfold_headers));
            }
        } else if lower.starts_with("quit") {
            self.close("221 2.0.0 Goodbye");
        } else if lower.starts_with("rset") {
            self.reset();
            self.say("250 2.0.0 Ok");
        } else if lower.starts_with("noop") {
            self.say("250 2.0.0 Ok");
        } else if lower.starts_with("vrfy") {
            self.say("502 5.5.1 VRFY command is disabled");
        } else if lower.starts_with("starttls") {
            self.say("502 5.5.1 STARTTLS not yet implemented");
        } else if !line.is_empty() {
            log::debug!("Unknown command: {line}");
            self.say("502 5.5.2 Error: command not recognized");
        }
    }

    fn reset(&mut self) {
        self.mail = self.mail.reset();
        self.parser = None;
        self.state = if self.mail.helo().is_empty() {
            SessionState::Ready
        } else {
            SessionState::Helo
        };
    }

    /// Runs a stage unless the mail already has a terminal destination.
    /// Returns true when the command may send its success reply.
    async fn run_stage(&mut self, stage: Stage) -> bool {
        if self.mail.final_destination().is_terminal() {
            return true;
        }
        match self.pipeline.run(stage, &mut self.mail).await {
            Ok(()) => true,
            Err(Halt::Outcome(outcome)) => {
                self.apply_outcome(stage, outcome);
                false
            }
            Err(Halt::Failed(error)) => {
                log::error!("Filter failure at {stage}: {error:#}");
                let reply = self.internal_error_reply(&error);
                self.say(reply);
                false
            }
        }
    }

    fn apply_outcome(&mut self, stage: Stage, outcome: Outcome) {
        log::info!("Outcome at {stage}: {outcome}");
        if outcome.closes_connection() {
            self.mail = self.mail.reset();
            self.close(outcome.to_string());
            return;
        }
        self.mail.set_final_destination(outcome.kind().destination());
        self.say(outcome.to_string());
    }

    fn internal_error_reply(&self, error: &anyhow::Error) -> String {
        if self.config.app.debug {
            format!("550 5.7.1 SCE: {error}")
        } else if self.config.app.defer_on_exception {
            "450 4.3.0 Server Configuration Error".to_string()
        } else {
            "550 5.7.1 Server Configuration Error".to_string()
        }
    }

    async fn connect(&mut self, line: &str) {
        let mut connection = Connection::default();
        match CONNECT.captures(line) {
            Some(caps) => {
                let remote = caps[1].trim_matches(|c| c == '[' || c == ']');
                connection.sender_ip = remote.to_string();
                connection.received_port = caps[2].trim().parse().unwrap_or_default();
                if let Ok(ip) = remote.parse::<IpAddr>() {
                    connection.sender_name = match self.resolver.ptr(ip).await {
                        Lookup::Found(name) => name,
                        _ => UNKNOWN_SENDER_NAME.to_string(),
                    };
                }
            }
            None => log::warn!("Malformed connection preamble: {line}"),
        }
        log::info!(
            "Connection from {} [{}] on port {}",
            connection.sender_name,
            connection.sender_ip,
            connection.received_port
        );

        self.mail = Mail::with_connection(connection);
        self.parser = None;
        self.state = SessionState::Ready;

        if self.run_stage(Stage::Connect).await {
            let banner = if self.config.relay.greeting_banner.is_empty() {
                self.config.app.name.clone()
            } else {
                self.config.relay.greeting_banner.clone()
            };
            self.say(format!("220 {banner}"));
        }
    }

    async fn helo(&mut self, line: &str) {
        let started = Instant::now();
        if !self.mail.sender().is_empty() {
            self.mail = self.mail.reset();
        }
        let extended = line.to_ascii_lowercase().starts_with("ehlo");
        let argument = line
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or_default();
        self.mail.set_helo(argument);
        if extended {
            self.mail.connection.protocol = "ESMTP".to_string();
        }
        self.state = SessionState::Helo;

        if self.run_stage(Stage::Helo).await {
            let name = self.config.app.name.clone();
            if extended {
                self.say(format!("250-{name}"));
                for capability in ["ENHANCEDSTATUSCODES", "PIPELINING", "SMTPUTF8", "8BITMIME"] {
                    self.say(format!("250-{capability}"));
                }
                self.say("250 XFORWARD");
            } else {
                self.say(format!("250 {name}"));
            }
        }
        self.mail
            .record_timing("helo", started.elapsed().as_secs_f64());
    }

    async fn mail_from(&mut self, line: &str) {
        let started = Instant::now();
        if self.mail.helo().is_empty() {
            return self.say("503 5.5.1 Error: send HELO/EHLO first");
        }
        let Some((_, argument)) = line.split_once(':') else {
            return self.say("501 5.5.4 Syntax: MAIL FROM:<address>");
        };

        self.mail.set_sender(parse_path(argument));
        self.state = SessionState::MailFrom;
        if self.run_stage(Stage::MailFrom).await {
            self.say("250 2.1.0 Ok");
        }
        self.mail
            .record_timing("mail_from", started.elapsed().as_secs_f64());
    }

    async fn rcpt_to(&mut self, line: &str) {
        let started = Instant::now();
        if self.mail.sender().is_empty() {
            return self.say("503 5.5.1 Error: need MAIL command");
        }
        let recipient = match line.split_once(':') {
            Some((_, argument)) => parse_path(argument),
            None => String::new(),
        };
        if recipient.is_empty() || recipient == "<>" {
            return self.say("501 5.5.4 Syntax: RCPT TO:<address>");
        }

        self.mail.add_recipient(recipient);
        self.state = SessionState::RcptTo;
        if self.run_stage(Stage::RcptTo).await {
            self.say("250 2.1.5 Ok");
        }
        self.mail
            .record_timing("rcpt_to", started.elapsed().as_secs_f64());
    }

    async fn xforward(&mut self, line: &str) {
        let started = Instant::now();
        if self.mail.recipients().is_empty() {
            return self.say("503 Mail transaction in progress");
        }

        let mut attrs = Vec::new();
        for token in line["xforward".len()..].split_whitespace() {
            let (attr, value) = token.split_once('=').unwrap_or((token, ""));
            let attr = attr.trim().to_ascii_lowercase();
            let value = value.trim();
            match attr.as_str() {
                "helo" => self.mail.set_helo(value),
                "addr" => {
                    let addr = value.strip_prefix("IPV6:").unwrap_or(value);
                    self.mail.connection.sender_ip = addr.to_string();
                }
                "proto" => self.mail.connection.protocol = value.to_string(),
                "name" => self.mail.connection.sender_name = value.to_string(),
                "ident" | "source" | "port" => {}
                _ => return self.say("501 Unrecognized parameter"),
            }
            attrs.push(attr);
        }

        let mut stage_ran = false;
        if attrs.iter().any(|a| matches!(a.as_str(), "proto" | "addr" | "name")) {
            if !self.run_stage(Stage::Connection).await {
                return self
                    .mail
                    .record_timing("xforward", started.elapsed().as_secs_f64());
            }
            stage_ran = true;
        }
        if attrs.iter().any(|a| a == "helo") {
            if !self.run_stage(Stage::Helo).await {
                return self
                    .mail
                    .record_timing("xforward", started.elapsed().as_secs_f64());
            }
            stage_ran = true;
        }

        if stage_ran {
            self.say("250 Ok");
        }
        self.mail
            .record_timing("xforward", started.elapsed().as_secs_f64());
    }

    async fn data_line(&mut self, line: Vec<u8>) {
        if line.trim_ascii() == b"." {
            return self.end_of_data().await;
        }
        let content = line.strip_prefix(b".").unwrap_or(&line);
        if let Some(parser) = self.parser.as_mut() {
            parser.feed(&mut self.mail, content);
        }
    }

    async fn end_of_data(&mut self) {
        let started = Instant::now();
        if let Some(mut parser) = self.parser.take() {
            parser.finish(&mut self.mail);
        }

        if self.run_stage(Stage::Data).await {
            match self.persist() {
                Ok(queue_id) => self.say(format!("250 2.0.0 Ok: queued as {queue_id}")),
                Err(e) => {
                    log::error!("Unable to queue message: {e:#}");
                    let reply = self.internal_error_reply(&e);
                    self.say(reply);
                    self.reset();
                    return;
                }
            }
        }
        self.mail
            .record_timing("data", started.elapsed().as_secs_f64());

        if self.is_closed() {
            return;
        }
        let next = self.mail.reset();
        let done = std::mem::replace(&mut self.mail, next);
        self.queued.push(done);
        self.state = SessionState::Helo;
    }

    /// Assigns the queue id and writes the raw message to the queue
    /// directory unless queueing is disabled.
    fn persist(&mut self) -> anyhow::Result<String> {
        let queue_id = self.mail.queue_id().to_string();
        if self.config.relay.queue_processor != QueueMode::Disabled {
            let path = format!("queue/{}/{queue_id}", id::shard(&queue_id));
            self.storage.put(&path, self.mail.raw())?;
        }
        log::info!(
            "Queued {queue_id} from <{}> for {} recipient(s)",
            self.mail.sender(),
            self.mail.recipients().len()
        );
        Ok(queue_id)
    }
}
