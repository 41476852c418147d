use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use super::parser::{is_continuation, split_field};

lazy_static! {
    static ref NAME_PARAM: Regex = Regex::new(r#"(?i)(?:^|;)\s*name\s*=\s*"?([^";]+)"?"#).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    #[default]
    Body,
    Attachment,
}

/// One leaf section of a message body with its content headers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BodyPart {
    pub filename: Option<String>,
    pub disposition: Disposition,
    pub size: usize,
    pub content_transfer_encoding: Option<String>,
    pub content_type: Option<String>,
    #[serde(skip)]
    pub raw: Vec<u8>,
    #[serde(skip)]
    body: Vec<u8>,
}

impl BodyPart {
    /// Parses a part from its raw bytes: a content header block, a blank
    /// line, then the body. Input without a blank line is all body.
    pub fn from_raw(raw: &[u8]) -> Self {
        let mut part = BodyPart {
            raw: raw.to_vec(),
            ..Default::default()
        };

        let (fields, body_start) = header_block(raw);
        part.body = raw[body_start..].to_vec();

        let mut declared_size = None;
        for (name, value) in fields {
            match name.as_str() {
                "content-transfer-encoding" => {
                    part.content_transfer_encoding = Some(value.trim().to_ascii_lowercase())
                }
                "content-type" => {
                    if part.filename.is_none() {
                        if let Some(caps) = NAME_PARAM.captures(&value) {
                            part.filename = Some(caps[1].trim().to_string());
                        }
                    }
                    part.content_type = Some(value.trim().to_string());
                }
                "content-disposition" => {
                    for param in value.split(';').map(str::trim) {
                        let lower = param.to_ascii_lowercase();
                        if lower == "attachment" {
                            part.disposition = Disposition::Attachment;
                        } else if lower.starts_with("filename=") {
                            let name = param["filename=".len()..].trim().trim_matches('"');
                            part.filename = Some(name.to_string());
                        } else if lower.starts_with("size=") {
                            declared_size = param["size=".len()..].trim().parse().ok();
                        }
                    }
                }
                _ => {}
            }
        }

        part.size = declared_size.unwrap_or_else(|| part.decoded_body().len());
        part
    }

    /// Lower-cased MIME type without parameters, e.g. `text/plain`.
    pub fn mime_type(&self) -> Option<String> {
        self.content_type.as_deref().map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn is_attachment(&self) -> bool {
        self.disposition == Disposition::Attachment
    }

    /// The undecoded body bytes following the part headers.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body with its transfer encoding removed. Base64 is decoded; anything
    /// else has trailing line breaks trimmed. Undecodable base64 is returned
    /// as-is.
    pub fn decoded_body(&self) -> Vec<u8> {
        if self.content_transfer_encoding.as_deref() == Some("base64") {
            let cleaned: Vec<u8> = self
                .body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            match base64::engine::general_purpose::STANDARD.decode(&cleaned) {
                Ok(decoded) => return decoded,
                Err(e) => log::debug!("Body part is not valid base64: {e}"),
            }
        }

        let mut end = self.body.len();
        while end > 0 && matches!(self.body[end - 1], b'\r' | b'\n') {
            end -= 1;
        }
        self.body[..end].to_vec()
    }
}

/// Parses the leading header block of `raw`, returning the unfolded
/// `(lower-cased name, value)` fields and the byte offset where the body
/// begins.
fn header_block(raw: &[u8]) -> (Vec<(String, String)>, usize) {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let end = raw[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| offset + p + 1)
            .unwrap_or(raw.len());
        let line = String::from_utf8_lossy(&raw[offset..end]);
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            return (fields, end);
        }
        if is_continuation(line) {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim_start());
            }
        } else if let Some((name, value)) = split_field(line) {
            fields.push((name, value.to_string()));
        } else {
            // Not a header line, so the part has no header block.
            return (Vec::new(), 0);
        }
        offset = end;
    }

    // Headers only, no body.
    (fields, raw.len())
}
