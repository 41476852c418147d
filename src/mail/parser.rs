use lazy_static::lazy_static;
use regex::Regex;

use super::{BodyPart, Mail};

lazy_static! {
    static ref BOUNDARY: Regex =
        Regex::new(r#"(?i)boundary\s*=\s*(?:"([^"]+)"|([^;\s]+))"#).unwrap();
}

/// Splits `Name: value` into a lower-cased name and the value.
pub(crate) fn split_field(line: &str) -> Option<(String, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name.to_ascii_lowercase(), value.trim_start()))
}

/// A folded header continuation: leading whitespace followed by content.
pub(crate) fn is_continuation(line: &str) -> bool {
    line.starts_with([' ', '\t']) && !line.trim().is_empty()
}

pub(crate) fn extract_boundary(content_type: &str) -> Option<String> {
    let caps = BOUNDARY.captures(content_type)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    ReadingHeaders,
    ReadingBody,
    BetweenParts,
    Ended,
}

#[derive(Debug, Default)]
struct PartBuilder {
    raw: Vec<u8>,
    in_headers: bool,
}

/// Incremental DATA ingestion. Lines arrive without their line terminator
/// and with dot-stuffing already removed.
#[derive(Debug, Default)]
pub struct MessageParser {
    state: ParseState,
    unfold_headers: bool,
    pending_header: Option<String>,
    boundaries: Vec<String>,
    part: Option<PartBuilder>,
    single_body: Vec<u8>,
}

impl MessageParser {
    pub fn new(unfold_headers: bool) -> Self {
        Self {
            unfold_headers,
            ..Default::default()
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn feed(&mut self, mail: &mut Mail, line: &[u8]) {
        mail.append_raw(line);
        mail.append_raw(b"\r\n");

        match self.state {
            ParseState::ReadingHeaders => self.header_line(mail, line),
            ParseState::ReadingBody | ParseState::BetweenParts => self.body_line(mail, line),
            ParseState::Ended => {}
        }
    }

    /// Flushes whatever is still buffered once the message is complete.
    pub fn finish(&mut self, mail: &mut Mail) {
        match self.state {
            ParseState::ReadingHeaders => self.commit_header(mail),
            ParseState::ReadingBody if self.boundaries.is_empty() => {
                let part = self.single_part(mail);
                mail.attach(part);
            }
            _ => {}
        }
        self.finish_part(mail);
        self.state = ParseState::Ended;
    }

    fn header_line(&mut self, mail: &mut Mail, line: &[u8]) {
        let text = String::from_utf8_lossy(line);

        if text.trim().is_empty() {
            self.commit_header(mail);
            match mail.mime_boundary() {
                Some(boundary) => {
                    self.boundaries.push(boundary.to_string());
                    self.state = ParseState::BetweenParts;
                }
                None => self.state = ParseState::ReadingBody,
            }
            return;
        }

        if is_continuation(&text) {
            if let Some(pending) = self.pending_header.as_mut() {
                if self.unfold_headers {
                    let trimmed = pending.trim_end().len();
                    pending.truncate(trimmed);
                    pending.push(' ');
                    pending.push_str(text.trim_start());
                } else {
                    pending.push_str(&text);
                }
                return;
            }
        }

        self.commit_header(mail);
        self.pending_header = Some(text.into_owned());
    }

    fn commit_header(&mut self, mail: &mut Mail) {
        let Some(line) = self.pending_header.take() else {
            return;
        };
        let Some((name, value)) = split_field(&line) else {
            log::debug!("Ignoring malformed header line: {line}");
            return;
        };
        if name == "content-type" {
            if let Some(boundary) = extract_boundary(value) {
                mail.set_mime_boundary(&boundary);
            }
        }
        mail.headers_mut().append(&name, value);
    }

    fn body_line(&mut self, mail: &mut Mail, line: &[u8]) {
        if let Some((level, closing)) = self.match_boundary(line) {
            self.finish_part(mail);
            self.boundaries.truncate(level + 1);
            if closing {
                self.boundaries.pop();
                self.state = if self.boundaries.is_empty() {
                    ParseState::Ended
                } else {
                    ParseState::BetweenParts
                };
            } else {
                self.part = Some(PartBuilder {
                    raw: Vec::new(),
                    in_headers: true,
                });
                self.state = ParseState::ReadingBody;
            }
            return;
        }

        if self.state == ParseState::BetweenParts {
            // Preamble or epilogue text.
            return;
        }

        let Some(part) = self.part.as_mut() else {
            self.single_body.extend_from_slice(line);
            self.single_body.extend_from_slice(b"\r\n");
            return;
        };

        part.raw.extend_from_slice(line);
        part.raw.extend_from_slice(b"\r\n");

        if part.in_headers && line.iter().all(u8::is_ascii_whitespace) {
            part.in_headers = false;
            let nested = BodyPart::from_raw(&part.raw)
                .content_type
                .filter(|ct| ct.to_ascii_lowercase().starts_with("multipart/"))
                .and_then(|ct| extract_boundary(&ct));
            if let Some(boundary) = nested {
                self.part = None;
                self.boundaries.push(boundary);
                self.state = ParseState::BetweenParts;
            }
        }
    }

    /// Finds the innermost open boundary a `--boundary` line refers to.
    fn match_boundary(&self, line: &[u8]) -> Option<(usize, bool)> {
        let rest = line.strip_prefix(b"--")?;
        let rest = String::from_utf8_lossy(rest);
        let rest = rest.trim_end();
        self.boundaries
            .iter()
            .enumerate()
            .rev()
            .find_map(|(level, boundary)| {
                if rest == boundary {
                    Some((level, false))
                } else if rest.strip_suffix("--") == Some(boundary.as_str()) {
                    Some((level, true))
                } else {
                    None
                }
            })
    }

    fn finish_part(&mut self, mail: &mut Mail) {
        if let Some(part) = self.part.take() {
            mail.attach(BodyPart::from_raw(&part.raw));
        }
    }

    /// Builds the only part of a non-multipart message from its top-level
    /// content headers and body.
    fn single_part(&mut self, mail: &Mail) -> BodyPart {
        let mut raw = Vec::new();
        for name in ["content-type", "content-transfer-encoding", "content-disposition"] {
            if let Some(value) = mail.headers().first(name) {
                raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
            }
        }
        raw.extend_from_slice(b"\r\n");
        raw.append(&mut self.single_body);
        BodyPart::from_raw(&raw)
    }
}
