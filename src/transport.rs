//! Outbound delivery of a processed message.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::Config;
use crate::id;
use crate::mail::{Destination, Mail};
use crate::storage::Storage;

/// The next hop answered with something other than what the current step
/// needs. Fatal to the delivery attempt.
#[derive(Debug, Error)]
#[error("Error in transport during {stage}: {message}")]
pub struct TransportError {
    pub code: u16,
    pub stage: String,
    pub message: String,
}

/// What the transport did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Reject and defer were answered during the SMTP session.
    Answered,
    Quarantined(String),
    Relayed { host: String, port: u16 },
}

#[derive(Debug)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn last(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or_default()
    }

    /// Whether an EHLO reply lists `keyword` among its extensions.
    fn advertises(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.get(4..)
                .and_then(|ext| ext.split_whitespace().next())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(keyword))
        })
    }
}

async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Reply> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            anyhow::bail!("connection closed by next hop");
        }
        let line = line.trim_end().to_string();
        let more = line.as_bytes().get(3) == Some(&b'-');
        lines.push(line);
        if !more {
            break;
        }
    }
    let code = lines[0]
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed reply from next hop: {:?}", lines[0]))?;
    Ok(Reply { code, lines })
}

/// Writes `raw` line by line with dot-stuffing and CRLF endings.
fn dot_stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 16);
    if raw.is_empty() {
        return out;
    }
    let body = raw.strip_suffix(b"\n").unwrap_or(raw);
    for line in body.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn path(address: &str) -> String {
    if address == "<>" {
        address.to_string()
    } else {
        format!("<{address}>")
    }
}

fn unavailable(value: &str) -> &str {
    if value.is_empty() {
        "[UNAVAILABLE]"
    } else {
        value
    }
}

struct Conversation {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl Conversation {
    async fn reply(&mut self, stage: &str) -> anyhow::Result<Reply> {
        timeout(self.timeout, read_reply(&mut self.stream))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for reply during {stage}"))?
    }

    /// Sends one command and checks the reply code against `accept`.
    async fn step(
        &mut self,
        stage: &str,
        command: Option<&[u8]>,
        accept: std::ops::Range<u16>,
    ) -> anyhow::Result<Reply> {
        if let Some(command) = command {
            self.stream.get_mut().write_all(command).await?;
        }
        let reply = self.reply(stage).await?;
        log::debug!("{stage}: {}", reply.last());
        if !accept.contains(&reply.code) {
            return Err(TransportError {
                code: reply.code,
                stage: stage.to_string(),
                message: reply.last().to_string(),
            }
            .into());
        }
        Ok(reply)
    }
}

pub struct Transport {
    ehlo_name: String,
    default_relay: (String, u16),
    timeout: Duration,
    xforward: bool,
    storage: Storage,
}

impl Transport {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let default_relay = match config.relay.default_relay.parse::<Destination>() {
            Ok(Destination::Relay { host, port }) => (host, port),
            _ => anyhow::bail!(
                "relay.default_relay must be ip:port, got '{}'",
                config.relay.default_relay
            ),
        };
        Ok(Transport {
            ehlo_name: config.ehlo_name(),
            default_relay,
            timeout: config.connect_timeout(),
            xforward: config.relay.xforward,
            storage: Storage::new(config.storage_dir()),
        })
    }

    /// Delivers, quarantines or skips `mail` according to its final
    /// destination.
    pub async fn send(&self, mail: &mut Mail) -> anyhow::Result<Delivery> {
        let (host, port) = match mail.final_destination().clone() {
            Destination::Reject | Destination::Defer => return Ok(Delivery::Answered),
            Destination::Quarantine | Destination::Drop => {
                let queue_id = mail.queue_id().to_string();
                let path = format!("quarantine/{}/{queue_id}.eml", id::shard(&queue_id));
                self.storage.put(&path, &mail.rendered())?;
                log::info!("Quarantined {queue_id} to {path}");
                return Ok(Delivery::Quarantined(path));
            }
            Destination::Mailbox(address) => {
                mail.remove_all_recipients();
                mail.add_recipient(address);
                self.default_relay.clone()
            }
            Destination::Relay { host, port } => (host, port),
            Destination::Allow => self.default_relay.clone(),
        };

        self.relay(mail, &host, port).await?;
        log::info!(
            "Relayed {} to {host}:{port} for {} recipient(s)",
            mail.existing_queue_id().unwrap_or("-"),
            mail.recipients().len()
        );
        Ok(Delivery::Relayed { host, port })
    }

    async fn relay(&self, mail: &Mail, host: &str, port: u16) -> anyhow::Result<()> {
        let stream = timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {host}:{port}"))??;
        let mut conversation = Conversation {
            stream: BufReader::new(stream),
            timeout: self.timeout,
        };

        conversation.step("connect", None, 200..400).await?;
        let ehlo = conversation
            .step("ehlo", Some(format!("EHLO {}\r\n", self.ehlo_name).as_bytes()), 200..400)
            .await?;

        if self.xforward && ehlo.advertises("XFORWARD") {
            let connection = &mail.connection;
            let command = format!(
                "XFORWARD NAME={} ADDR={} PROTO={} HELO={}\r\n",
                unavailable(&connection.sender_name),
                unavailable(&connection.sender_ip),
                unavailable(&connection.protocol),
                unavailable(mail.helo()),
            );
            conversation
                .step("xforward", Some(command.as_bytes()), 200..400)
                .await?;
        }

        let command = format!("MAIL FROM:{}\r\n", path(mail.sender()));
        conversation
            .step("mail_from", Some(command.as_bytes()), 200..400)
            .await?;
        for recipient in mail.recipients() {
            let command = format!("RCPT TO:{}\r\n", path(recipient));
            conversation
                .step("rcpt_to", Some(command.as_bytes()), 200..400)
                .await?;
        }
        conversation.step("data", Some(b"DATA\r\n"), 300..400).await?;

        let mut payload = dot_stuff(&mail.rendered());
        payload.extend_from_slice(b".\r\n");
        conversation
            .step("end_of_data", Some(&payload), 200..300)
            .await?;

        if let Err(e) = conversation.step("quit", Some(b"QUIT\r\n"), 200..300).await {
            log::debug!("Ignoring QUIT failure: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Minimal MTA: accepts one client, answers every command, and returns
    /// the lines it received. `reject` names a verb answered with 554.
    async fn mock_mta(reject: Option<&'static str>) -> (SocketAddr, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            let mut in_data = false;
            write.write_all(b"220 mock ESMTP\r\n").await.unwrap();

            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line.clone());
                if in_data {
                    if line == "." {
                        in_data = false;
                        write.write_all(b"250 2.0.0 Ok: queued as MOCK\r\n").await.unwrap();
                    }
                    continue;
                }
                let verb = line
                    .split([' ', ':'])
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase();
                if reject == Some(verb.as_str()) {
                    write.write_all(b"554 5.7.1 nope\r\n").await.unwrap();
                    continue;
                }
                let reply = match verb.as_str() {
                    "EHLO" => "250-mock\r\n250-XFORWARD NAME ADDR PROTO HELO\r\n250 8BITMIME\r\n",
                    "DATA" => {
                        in_data = true;
                        "354 End data with <CR><LF>.<CR><LF>\r\n"
                    }
                    "QUIT" => {
                        write.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
                        break;
                    }
                    _ => "250 2.0.0 Ok\r\n",
                };
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });
        (addr, handle)
    }

    fn transport(dir: &std::path::Path, default_relay: &str, xforward: bool) -> Transport {
        let mut config = Config::default();
        config.app.name = "Test ESMTP".to_string();
        config.app.storage_dir = dir.to_string_lossy().into_owned();
        config.relay.default_relay = default_relay.to_string();
        config.relay.xforward = xforward;
        config.relay.connect_timeout_seconds = 5;
        Transport::new(&config).unwrap()
    }

    fn message() -> Mail {
        let mut mail = Mail::from_raw(b"Subject: hi\r\n\r\n.hidden\r\nvisible\r\n", true);
        mail.set_helo("client.example.net");
        mail.set_sender("alice@example.com");
        mail.add_recipient("bob@example.org");
        mail.add_recipient("carol@example.org");
        mail.connection.sender_ip = "192.0.2.7".to_string();
        mail
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b".a\r\nb\n..c\r\n"), b"..a\r\nb\r\n...c\r\n");
        assert!(dot_stuff(b"").is_empty());
    }

    #[tokio::test]
    async fn test_relay_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, server) = mock_mta(None).await;
        let transport = transport(dir.path(), "127.0.0.1:1", true);

        let mut mail = message();
        mail.set_final_destination(Destination::Relay {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        });
        let delivery = transport.send(&mut mail).await.unwrap();
        assert_eq!(
            delivery,
            Delivery::Relayed {
                host: "127.0.0.1".to_string(),
                port: addr.port()
            }
        );

        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                "EHLO test-esmtp",
                "XFORWARD NAME=[UNKNOWN] ADDR=192.0.2.7 PROTO=SMTP HELO=client.example.net",
                "MAIL FROM:<alice@example.com>",
                "RCPT TO:<bob@example.org>",
                "RCPT TO:<carol@example.org>",
                "DATA",
                "Subject: hi",
                "",
                "..hidden",
                "visible",
                ".",
                "QUIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_headers_reach_the_next_hop() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, server) = mock_mta(None).await;
        let transport = transport(dir.path(), &addr.to_string(), false);

        let mut mail = message();
        mail.prepend_header("X-Spam-Score", "9.9");
        mail.append_header("X-Policy", "tagged");
        transport.send(&mut mail).await.unwrap();

        let seen = server.await.unwrap();
        let data = seen.iter().position(|l| l == "DATA").unwrap();
        assert_eq!(
            seen[data + 1..],
            ["X-Spam-Score: 9.9", "Subject: hi", "X-Policy: tagged", "", "..hidden", "visible", ".", "QUIT"]
        );
    }

    #[tokio::test]
    async fn test_mailbox_destination_uses_default_relay() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, server) = mock_mta(None).await;
        let transport = transport(dir.path(), &addr.to_string(), false);

        let mut mail = message();
        mail.route_to("postmaster@example.net").unwrap();
        transport.send(&mut mail).await.unwrap();
        assert_eq!(mail.recipients(), ["postmaster@example.net"]);

        let seen = server.await.unwrap();
        assert!(!seen.iter().any(|l| l.starts_with("XFORWARD")));
        assert_eq!(seen.iter().filter(|l| l.starts_with("RCPT TO")).count(), 1);
        assert!(seen.contains(&"RCPT TO:<postmaster@example.net>".to_string()));
    }

    #[tokio::test]
    async fn test_rejection_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _server) = mock_mta(Some("RCPT")).await;
        let transport = transport(dir.path(), &addr.to_string(), false);

        let mut mail = message();
        let err = transport.send(&mut mail).await.unwrap_err();
        match err.downcast_ref::<TransportError>() {
            Some(e) => {
                assert_eq!(e.code, 554);
                assert_eq!(e.stage, "rcpt_to");
                assert_eq!(
                    e.to_string(),
                    "Error in transport during rcpt_to: 554 5.7.1 nope"
                );
            }
            None => panic!("Expected TransportError, got {err}"),
        }
    }

    #[tokio::test]
    async fn test_quarantine_and_drop_write_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(dir.path(), "127.0.0.1:1", false);

        for destination in [Destination::Quarantine, Destination::Drop] {
            let mut mail = message();
            mail.prepend_header("X-Spam-Score", "9.9");
            mail.set_final_destination(destination);
            let queue_id = mail.queue_id().to_string();
            match transport.send(&mut mail).await.unwrap() {
                Delivery::Quarantined(path) => {
                    assert_eq!(path, format!("quarantine/{}/{queue_id}.eml", &queue_id[..2]));
                    let stored = std::fs::read(dir.path().join(&path)).unwrap();
                    assert!(stored.starts_with(b"X-Spam-Score: 9.9\r\nSubject: hi\r\n"));
                    assert_eq!(stored, mail.rendered());
                }
                other => panic!("Expected quarantine, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_answered_destinations_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(dir.path(), "127.0.0.1:1", false);
        for destination in [Destination::Reject, Destination::Defer] {
            let mut mail = message();
            mail.set_final_destination(destination);
            assert_eq!(transport.send(&mut mail).await.unwrap(), Delivery::Answered);
        }
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = transport(dir.path(), &addr.to_string(), false);
        let mut mail = message();
        assert!(transport.send(&mut mail).await.is_err());
    }

    #[test]
    fn test_invalid_default_relay() {
        let mut config = Config::default();
        config.relay.default_relay = "mail.example.com".to_string();
        assert!(Transport::new(&config).is_err());
    }
}
