use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::dsn::Dsn;
use crate::config::{ClamAvConfig, ScanMode};
use crate::mail::Mail;
use crate::storage::Storage;

const CHUNK_SIZE: usize = 512;

lazy_static! {
    static ref FOUND: Regex = Regex::new(r"^(.*):\s+(.*)\s+FOUND$").unwrap();
    static ref ERROR: Regex = Regex::new(r"^(.*):\s+(.*)\s+ERROR$").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClamAvReport {
    pub infected: bool,
    pub error: bool,
    pub viruses: BTreeMap<String, String>,
    pub errors: BTreeMap<String, String>,
}

impl ClamAvReport {
    /// Folds one clamd response line into the report.
    pub fn record(&mut self, line: &str) {
        let line = line.trim_end_matches(['\0', '\r', '\n']);
        if let Some(caps) = FOUND.captures(line) {
            let verdict = caps[2].trim();
            if !verdict.starts_with("Infected Archive") {
                self.viruses.insert(basename(&caps[1]), verdict.to_string());
                self.infected = true;
            }
        } else if let Some(caps) = ERROR.captures(line) {
            self.errors
                .insert(basename(&caps[1]), caps[2].trim().to_string());
            self.error = true;
        }
    }
}

fn basename(name: &str) -> String {
    Path::new(name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.trim().to_string())
}

/// One file handed to clamd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub name: String,
    pub data: Vec<u8>,
}

/// A single ClamAV scan. Socket failures leave the reason in `error()`.
pub struct ClamAv {
    dsn: Dsn,
    config: ClamAvConfig,
    storage: Storage,
    error: Option<String>,
}

impl ClamAv {
    pub fn new(config: &ClamAvConfig, storage: Storage) -> anyhow::Result<Self> {
        Ok(ClamAv {
            dsn: config.socket.parse()?,
            config: config.clone(),
            storage,
            error: None,
        })
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Everything that will be scanned: the optional truncated message and
    /// each body part within the size cap.
    pub fn targets(&self, mail: &Mail) -> Vec<ScanTarget> {
        let mut targets = Vec::new();

        if self.config.send_email.enabled {
            let raw = mail.raw();
            let max = self.config.send_email.max_size;
            let end = if max == 0 { raw.len() } else { raw.len().min(max) };
            targets.push(ScanTarget {
                name: "email.eml".to_string(),
                data: raw[..end].to_vec(),
            });
        }

        for (i, part) in mail.body_parts().iter().enumerate() {
            let name = part
                .filename
                .as_deref()
                .map(basename)
                .filter(|n| !n.is_empty() && n != "." && n != "..")
                .unwrap_or_else(|| format!("part{i}"));
            if part.size > self.config.max_size {
                log::debug!(
                    "Not scanning {name}: {} bytes exceeds {}",
                    part.size,
                    self.config.max_size
                );
                continue;
            }
            targets.push(ScanTarget {
                name,
                data: part.decoded_body(),
            });
        }

        targets
    }

    pub async fn scan(&mut self, mail: &mut Mail) -> Option<ClamAvReport> {
        let targets = self.targets(mail);
        let result = match self.config.mode {
            ScanMode::InStream => self.instream(&targets).await,
            ScanMode::OnDisk => {
                let queue_id = mail.queue_id().to_string();
                self.multiscan(&queue_id, &targets).await
            }
        };

        match result {
            Ok(report) => Some(report),
            Err(e) => {
                log::warn!("ClamAV scan aborted: {e:#}");
                self.error = Some(format!("{e:#}"));
                None
            }
        }
    }

    async fn instream(&self, targets: &[ScanTarget]) -> anyhow::Result<ClamAvReport> {
        let mut report = ClamAvReport::default();
        for target in targets {
            let response =
                tokio::time::timeout(self.timeout(), self.instream_one(&target.data))
                    .await
                    .map_err(|_| anyhow::anyhow!("timed out scanning {}", target.name))??;
            for line in response.lines() {
                // clamd names the stream "stream"; report the file name instead.
                let line = match line.split_once(": ") {
                    Some((_, verdict)) => format!("{}: {verdict}", target.name),
                    None => line.to_string(),
                };
                report.record(&line);
            }
        }
        Ok(report)
    }

    async fn instream_one(&self, data: &[u8]) -> anyhow::Result<String> {
        let mut stream = self.dsn.connect(self.timeout()).await?;
        stream.write_all(b"nINSTREAM\n").await?;
        for chunk in data.chunks(CHUNK_SIZE) {
            stream.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
            stream.write_all(chunk).await?;
        }
        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    async fn multiscan(
        &self,
        queue_id: &str,
        targets: &[ScanTarget],
    ) -> anyhow::Result<ClamAvReport> {
        let scratch = format!("clamav/{queue_id}");
        let result = self.multiscan_dir(&scratch, targets).await;
        if let Err(e) = self.storage.delete_dir(&scratch) {
            log::warn!("Failed to remove {scratch}: {e:#}");
        }
        result
    }

    async fn multiscan_dir(
        &self,
        scratch: &str,
        targets: &[ScanTarget],
    ) -> anyhow::Result<ClamAvReport> {
        let dir = self.storage.ensure_dir(scratch)?;
        for target in targets {
            self.storage
                .put(&format!("{scratch}/{}", target.name), &target.data)?;
        }

        let exchange = async {
            let mut stream = self.dsn.connect(self.timeout()).await?;
            stream
                .write_all(format!("MULTISCAN {}\r\n", dir.display()).as_bytes())
                .await?;
            stream.flush().await?;
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            anyhow::Ok(String::from_utf8_lossy(&response).into_owned())
        };
        let response = tokio::time::timeout(self.timeout(), exchange)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for MULTISCAN"))??;

        let mut report = ClamAvReport::default();
        for line in response.lines() {
            report.record(line);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendEmailConfig;
    use tokio::net::TcpListener;

    /// Accepts `connections` clients, captures what each sent and answers
    /// with `reply`.
    async fn mock_clamd(
        reply: &'static str,
        connections: usize,
    ) -> (String, tokio::task::JoinHandle<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            for _ in 0..connections {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    // INSTREAM ends with a zero-length chunk, MULTISCAN with a newline.
                    if request.ends_with(&[0, 0, 0, 0]) || request.ends_with(b"\r\n") {
                        break;
                    }
                }
                socket.write_all(reply.as_bytes()).await.unwrap();
                received.push(request);
            }
            received
        });
        (format!("ipv4://{addr}"), handle)
    }

    fn mail_with_attachment(body: &str) -> Mail {
        let mut mail = Mail::new();
        mail.attach_raw(
            format!(
                "Content-Type: text/plain\r\nContent-Disposition: attachment; filename=\"eicar.txt\"\r\n\r\n{body}"
            )
            .as_bytes(),
        );
        mail
    }

    fn config(socket: String, mode: ScanMode) -> ClamAvConfig {
        ClamAvConfig {
            socket,
            mode,
            timeout_seconds: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_report_lines() {
        let mut report = ClamAvReport::default();
        report.record("/tmp/clamav/abc/eicar.txt: eicarTestVirus FOUND");
        report.record("/tmp/clamav/abc/big.zip: Infected Archive FOUND");
        report.record("/tmp/clamav/abc/part1: Access denied. ERROR");
        report.record("/tmp/clamav/abc/part2: OK");

        assert!(report.infected);
        assert_eq!(report.viruses.len(), 1);
        assert_eq!(report.viruses["eicar.txt"], "eicarTestVirus");
        assert!(report.error);
        assert_eq!(report.errors["part1"], "Access denied.");
    }

    #[tokio::test]
    async fn test_instream_found() {
        let (socket, server) = mock_clamd("eicar.txt: eicarTestVirus FOUND\n", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let mut scanner =
            ClamAv::new(&config(socket, ScanMode::InStream), Storage::new(dir.path())).unwrap();

        let mut mail = mail_with_attachment("X5O!P%@AP");
        let report = scanner.scan(&mut mail).await.unwrap();

        let mut expected = ClamAvReport {
            infected: true,
            ..Default::default()
        };
        expected
            .viruses
            .insert("eicar.txt".to_string(), "eicarTestVirus".to_string());
        assert_eq!(report, expected);
        assert!(scanner.error().is_none());

        let received = server.await.unwrap();
        let request = &received[0];
        assert!(request.starts_with(b"nINSTREAM\n"));
        assert_eq!(&request[10..14], &9u32.to_be_bytes());
        assert_eq!(&request[14..23], b"X5O!P%@AP");
        assert_eq!(&request[23..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_instream_chunks_and_one_connection_per_file() {
        let (socket, server) = mock_clamd("stream: OK\n", 2).await;
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(socket, ScanMode::InStream);
        cfg.send_email = SendEmailConfig {
            enabled: true,
            max_size: 0,
        };
        let mut scanner = ClamAv::new(&cfg, Storage::new(dir.path())).unwrap();

        let mut mail = mail_with_attachment(&"a".repeat(600));
        let report = scanner.scan(&mut mail).await.unwrap();
        assert!(!report.infected);

        let received = server.await.unwrap();
        assert_eq!(received.len(), 2);
        let part = &received[1];
        assert_eq!(&part[10..14], &512u32.to_be_bytes());
        assert_eq!(&part[526..530], &88u32.to_be_bytes());
        assert!(part.ends_with(&[0, 0, 0, 0]));
    }

    #[test]
    fn test_oversized_parts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("ipv4://127.0.0.1:9".to_string(), ScanMode::InStream);
        cfg.max_size = 10;
        let scanner = ClamAv::new(&cfg, Storage::new(dir.path())).unwrap();

        let mut mail = mail_with_attachment("this body is too large");
        mail.attach_raw(b"small");
        let targets = scanner.targets(&mail);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "part1");
    }

    #[tokio::test]
    async fn test_multiscan_writes_scratch_files() {
        let (socket, server) = mock_clamd("/x/eicar.txt: eicarTestVirus FOUND\n", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let mut scanner = ClamAv::new(&config(socket, ScanMode::OnDisk), storage.clone()).unwrap();

        let mut mail = mail_with_attachment("payload");
        let queue_id = mail.queue_id().to_string();
        let report = scanner.scan(&mut mail).await.unwrap();
        assert_eq!(report.viruses["eicar.txt"], "eicarTestVirus");

        let received = server.await.unwrap();
        let command = String::from_utf8(received[0].clone()).unwrap();
        let expected_dir = storage.path(&format!("clamav/{queue_id}")).unwrap();
        assert_eq!(command, format!("MULTISCAN {}\r\n", expected_dir.display()));
        assert!(!storage.exists(&format!("clamav/{queue_id}")));
    }

    #[tokio::test]
    async fn test_unavailable_scanner_returns_none() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mut scanner = ClamAv::new(
            &config(format!("ipv4://{addr}"), ScanMode::InStream),
            Storage::new(dir.path()),
        )
        .unwrap();
        let mut mail = mail_with_attachment("x");
        assert!(scanner.scan(&mut mail).await.is_none());
        assert!(scanner.error().is_some());
    }
}
