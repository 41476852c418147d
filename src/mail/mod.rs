//! The in-memory message built from one SMTP transaction.

mod body_part;
mod headers;
mod parser;

pub use body_part::{BodyPart, Disposition};
pub use headers::HeaderMap;
pub use parser::{MessageParser, ParseState};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::id;

pub const UNKNOWN_SENDER_NAME: &str = "[UNKNOWN]";

lazy_static! {
    static ref MAILBOX: Regex = Regex::new(r"^.+@\w+\..+$").unwrap();
    static ref RELAY: Regex =
        Regex::new(r"^(?:relay:)?(\[[A-Fa-f0-9:]+\]|\d{1,3}(?:\.\d{1,3}){3}):(\d{1,5})$").unwrap();
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Envelope {
    pub helo: String,
    pub sender: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub received_port: u16,
    pub protocol: String,
    pub sender_ip: String,
    pub sender_name: String,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            received_port: 0,
            protocol: "SMTP".to_string(),
            sender_ip: String::new(),
            sender_name: UNKNOWN_SENDER_NAME.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid final destination: {0:?}")]
pub struct DestinationError(pub String);

/// Where a message goes once the pipeline is done with it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destination {
    #[default]
    Allow,
    Reject,
    Defer,
    Quarantine,
    Drop,
    Relay { host: String, port: u16 },
    Mailbox(String),
}

impl Destination {
    /// Reject, defer, quarantine and drop stop all further filtering.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Destination::Reject | Destination::Defer | Destination::Quarantine | Destination::Drop
        )
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "allow" => return Ok(Destination::Allow),
            "reject" => return Ok(Destination::Reject),
            "defer" => return Ok(Destination::Defer),
            "quarantine" => return Ok(Destination::Quarantine),
            "drop" => return Ok(Destination::Drop),
            _ => {}
        }

        if let Some(caps) = RELAY.captures(s) {
            let host = caps[1].trim_matches(|c| c == '[' || c == ']');
            let port = caps[2].parse::<u16>().ok();
            if let (Ok(ip), Some(port)) = (host.parse::<IpAddr>(), port) {
                return Ok(Destination::Relay {
                    host: ip.to_string(),
                    port,
                });
            }
        } else if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Destination::Relay {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        } else if MAILBOX.is_match(s) {
            return Ok(Destination::Mailbox(s.to_string()));
        }

        Err(DestinationError(s.to_string()))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Allow => f.write_str("allow"),
            Destination::Reject => f.write_str("reject"),
            Destination::Defer => f.write_str("defer"),
            Destination::Quarantine => f.write_str("quarantine"),
            Destination::Drop => f.write_str("drop"),
            Destination::Relay { host, port } if host.contains(':') => {
                write!(f, "[{host}]:{port}")
            }
            Destination::Relay { host, port } => write!(f, "{host}:{port}"),
            Destination::Mailbox(address) => f.write_str(address),
        }
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Mail {
    pub envelope: Envelope,
    pub connection: Connection,
    headers: HeaderMap,
    body_parts: Vec<BodyPart>,
    #[serde(skip)]
    raw: Vec<u8>,
    /// Headers added after the message was received, kept in their
    /// original spelling so they can be written out with `raw`.
    #[serde(skip)]
    prepended: Vec<(String, String)>,
    #[serde(skip)]
    appended: Vec<(String, String)>,
    mime_boundary: Option<String>,
    queue_id: Option<String>,
    final_destination: Destination,
    pub timings: HashMap<String, f64>,
    pub supplemental: HashMap<String, serde_json::Value>,
}

impl Mail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(connection: Connection) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Parses a complete message, e.g. one read back from the queue.
    pub fn from_raw(raw: &[u8], unfold_headers: bool) -> Self {
        let mut mail = Mail::new();
        let mut parser = MessageParser::new(unfold_headers);
        let body = raw.strip_suffix(b"\n").unwrap_or(raw);
        if !raw.is_empty() {
            for line in body.split(|&b| b == b'\n') {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                parser.feed(&mut mail, line);
            }
        }
        parser.finish(&mut mail);
        mail
    }

    /// A fresh transaction on the same connection, keeping helo.
    pub fn reset(&self) -> Mail {
        let mut mail = Mail::with_connection(self.connection.clone());
        mail.envelope.helo = self.envelope.helo.clone();
        mail
    }

    pub fn helo(&self) -> &str {
        &self.envelope.helo
    }

    pub fn set_helo(&mut self, helo: impl Into<String>) {
        self.envelope.helo = helo.into();
    }

    pub fn sender(&self) -> &str {
        &self.envelope.sender
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.envelope.sender = sender.into();
    }

    pub fn recipients(&self) -> &[String] {
        &self.envelope.recipients
    }

    pub fn add_recipient(&mut self, recipient: impl Into<String>) {
        self.envelope.recipients.push(recipient.into());
    }

    /// Blind copy: adds an envelope recipient only.
    pub fn bcc(&mut self, recipient: impl Into<String>) {
        self.add_recipient(recipient);
    }

    /// Adds an envelope recipient and records it in a `Cc` header.
    pub fn cc(&mut self, recipient: impl Into<String>) {
        let recipient = recipient.into();
        self.append_header("Cc", recipient.clone());
        self.add_recipient(recipient);
    }

    pub fn remove_recipient(&mut self, recipient: &str) -> bool {
        let before = self.envelope.recipients.len();
        self.envelope
            .recipients
            .retain(|r| !r.eq_ignore_ascii_case(recipient));
        before != self.envelope.recipients.len()
    }

    pub fn remove_all_recipients(&mut self) {
        self.envelope.recipients.clear();
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&[String]> {
        self.headers.get(name)
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.appended.push((name.to_string(), value.clone()));
        self.headers.append(name, value);
    }

    pub fn prepend_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.prepended.insert(0, (name.to_string(), value.clone()));
        self.headers.prepend(name, value);
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.append_header(name, value);
    }

    pub fn alter_header<F>(&mut self, name: &str, alteration: F, which: Option<usize>) -> bool
    where
        F: FnMut(&str) -> String,
    {
        self.headers.alter(name, which, alteration)
    }

    pub fn delete_header(&mut self, name: &str, which: Option<usize>) -> bool {
        self.headers.delete(name, which)
    }

    pub fn newest_header_index(&self, name: &str) -> Option<usize> {
        self.headers.newest_index(name)
    }

    pub fn body_parts(&self) -> &[BodyPart] {
        &self.body_parts
    }

    pub fn attach(&mut self, part: BodyPart) {
        self.body_parts.push(part);
    }

    pub fn attach_raw(&mut self, raw: &[u8]) {
        self.attach(BodyPart::from_raw(raw));
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn append_raw(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
    }

    /// The message as it leaves the relay: prepended headers ahead of the
    /// received bytes, appended ones at the end of the header block.
    pub fn rendered(&self) -> Vec<u8> {
        if self.prepended.is_empty() && self.appended.is_empty() {
            return self.raw.clone();
        }
        let mut out = Vec::with_capacity(self.raw.len() + 256);
        for (name, value) in &self.prepended {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }

        let split = header_block_end(&self.raw);
        out.extend_from_slice(&self.raw[..split]);
        if split > 0 && !self.raw[..split].ends_with(b"\n") {
            out.extend_from_slice(b"\r\n");
        }
        for (name, value) in &self.appended {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(&self.raw[split..]);
        out
    }

    pub fn mime_boundary(&self) -> Option<&str> {
        self.mime_boundary.as_deref()
    }

    /// Assigns the boundary unless one is already set.
    pub fn set_mime_boundary(&mut self, boundary: &str) -> bool {
        if self.mime_boundary.is_some() {
            return false;
        }
        self.mime_boundary = Some(boundary.to_string());
        true
    }

    /// The queue id, generated on first use.
    pub fn queue_id(&mut self) -> &str {
        if self.queue_id.is_none() {
            let id = id::unique_id(&[
                &self.envelope.helo,
                &self.connection.sender_ip,
                &self.envelope.sender,
            ]);
            self.queue_id = Some(id);
        }
        self.queue_id.as_deref().unwrap_or_default()
    }

    pub fn existing_queue_id(&self) -> Option<&str> {
        self.queue_id.as_deref()
    }

    pub fn final_destination(&self) -> &Destination {
        &self.final_destination
    }

    pub fn set_final_destination(&mut self, destination: Destination) {
        self.final_destination = destination;
    }

    pub fn route_to(&mut self, destination: &str) -> Result<(), DestinationError> {
        self.final_destination = destination.parse()?;
        Ok(())
    }

    pub fn record_timing(&mut self, checkpoint: &str, seconds: f64) {
        self.timings.insert(checkpoint.to_string(), seconds);
    }

    pub fn set_supplemental(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.supplemental.insert(key.to_string(), value.into());
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Offset of the blank line separating headers from the body, or the end
/// of `raw` when there is none.
fn header_block_end(raw: &[u8]) -> usize {
    let mut start = 0;
    while start < raw.len() {
        let end = raw[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(raw.len(), |p| start + p + 1);
        let line = &raw[start..end];
        if line == b"\r\n" || line == b"\n" {
            return start;
        }
        start = end;
    }
    raw.len()
}
