//! Turns submitted bytes plus relay sidecar headers into an [`EmailRecord`].
//!
//! Everything in here is pure: no I/O, no clock reads beyond stamping
//! `received_at`, no logging. The HTTP layer decides which entry point to call
//! via [`SubmissionFormat::detect`].

use crate::email::{
    AuthenticationMetadata, ConnectionInfo, DkimInfo, DmarcInfo, EmailRecord, SpfInfo,
};
use chrono::Utc;
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lowercase prefix shared by all relay-supplied headers.
pub const SIDECAR_PREFIX: &str = "x-original-";

pub const SIDECAR_SENDER: &str = "x-original-sender";
pub const SIDECAR_RECIPIENT: &str = "x-original-recipient";
pub const SIDECAR_CLIENT_ADDRESS: &str = "x-original-client-address";
pub const SIDECAR_CLIENT_HOSTNAME: &str = "x-original-client-hostname";
pub const SIDECAR_HELO: &str = "x-original-helo";
pub const SIDECAR_MAIL_FROM: &str = "x-original-mail-from";

const KNOWN_SIDECAR: [&str; 6] = [
    SIDECAR_SENDER,
    SIDECAR_RECIPIENT,
    SIDECAR_CLIENT_ADDRESS,
    SIDECAR_CLIENT_HOSTNAME,
    SIDECAR_HELO,
    SIDECAR_MAIL_FROM,
];

/// Longest sender/recipient we accept, matching the RFC 5322 line limit.
const MAX_ADDRESS_LEN: usize = 998;

/// Errors produced while parsing a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Raw message was empty or whitespace only
    EmptyMessage,
    /// Message bytes could not be framed as an RFC 5322 message
    Malformed(String),
    /// JSON body failed to decode
    InvalidJson(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "message is empty"),
            Self::Malformed(msg) => write!(f, "malformed message: {msg}"),
            Self::InvalidJson(msg) => write!(f, "invalid JSON: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Relay-supplied headers, keyed by lowercase name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sidecar {
    headers: BTreeMap<String, String>,
}

impl Sidecar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a header if it carries the sidecar prefix. Returns whether it was kept.
    pub fn insert(&mut self, name: &str, value: &str) -> bool {
        let name = name.to_ascii_lowercase();
        if !name.starts_with(SIDECAR_PREFIX) {
            return false;
        }
        self.headers.insert(name, value.trim().to_string());
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn owned(&self, name: &str) -> Option<String> {
        self.get(name).map(String::from)
    }

    /// Sidecar headers that have no dedicated record field.
    fn passthrough(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter(|(k, _)| !KNOWN_SIDECAR.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Sidecar {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut sidecar = Self::new();
        for (k, v) in iter {
            sidecar.insert(k.as_ref(), v.as_ref());
        }
        sidecar
    }
}

/// Which parser a submission is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFormat {
    Rfc822,
    Json,
}

impl SubmissionFormat {
    /// Pick a parser from the declared content type, sniffing the body when
    /// the content type is absent or unrecognized.
    #[must_use]
    pub fn detect(content_type: Option<&str>, body: &[u8]) -> Self {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase());
        match essence.as_deref() {
            Some("message/rfc822") => Self::Rfc822,
            Some("application/json") => Self::Json,
            _ => match body.iter().find(|b| !b.is_ascii_whitespace()) {
                Some(b'{') => Self::Json,
                _ => Self::Rfc822,
            },
        }
    }
}

/// Parse a raw RFC 5322 message.
pub fn parse_raw(id: &str, raw: &[u8], sidecar: &Sidecar) -> Result<EmailRecord, ParseError> {
    let text = String::from_utf8_lossy(raw).into_owned();
    let derived = parse_message(&text)?;

    let mut record = new_record(id, sidecar);
    record.sender = derived.sender.unwrap_or_default();
    record.recipient = derived.recipient.unwrap_or_default();
    record.subject = derived.subject;
    record.message_id = derived.message_id;
    record.body = derived.body;
    record.authentication.dkim = derived.dkim;
    record.authentication.dmarc = derived.dmarc;
    record.authentication.spf.received_spf = derived.received_spf;
    record.raw = text;

    apply_sidecar_overrides(&mut record, sidecar);
    Ok(record)
}

#[derive(Debug, Default, Deserialize)]
struct JsonSubmission {
    #[serde(default, alias = "from")]
    sender: Option<String>,
    #[serde(default, alias = "to")]
    recipient: Option<String>,
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    connection: Option<JsonConnection>,
}

#[derive(Debug, Default, Deserialize)]
struct JsonConnection {
    #[serde(default)]
    client_address: Option<String>,
    #[serde(default)]
    client_hostname: Option<String>,
    #[serde(default)]
    client_helo: Option<String>,
}

/// Parse a structured JSON submission.
///
/// Named fields always win; an embedded `raw` message only fills the gaps and
/// supplies the authentication evidence.
pub fn parse_json(id: &str, body: &[u8], sidecar: &Sidecar) -> Result<EmailRecord, ParseError> {
    let submission: JsonSubmission =
        serde_json::from_slice(body).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let derived = match submission.raw.as_deref() {
        Some(raw) if !raw.trim().is_empty() => Some(parse_message(raw)?),
        _ => None,
    };

    let mut record = new_record(id, sidecar);
    record.sender = present(submission.sender).unwrap_or_default();
    record.recipient = present(submission.recipient).unwrap_or_default();
    record.subject = present(submission.subject);
    record.message_id = present(submission.message_id);
    record.body = present(submission.body);
    record.raw = submission.raw.unwrap_or_default();

    if let Some(conn) = submission.connection {
        let info = &mut record.connection_info;
        info.client_address = info.client_address.take().or(present(conn.client_address));
        info.client_hostname = info.client_hostname.take().or(present(conn.client_hostname));
        info.client_helo = info.client_helo.take().or(present(conn.client_helo));
    }

    if let Some(derived) = derived {
        if record.sender.is_empty() {
            record.sender = derived.sender.unwrap_or_default();
        }
        if record.recipient.is_empty() {
            record.recipient = derived.recipient.unwrap_or_default();
        }
        record.subject = record.subject.or(derived.subject);
        record.message_id = record.message_id.or(derived.message_id);
        record.body = record.body.or(derived.body);
        record.authentication.dkim = derived.dkim;
        record.authentication.dmarc = derived.dmarc;
        record.authentication.spf.received_spf = derived.received_spf;
    }

    apply_sidecar_overrides(&mut record, sidecar);
    Ok(record)
}

/// Extract the signing domain (`d=` tag) from a DKIM-Signature value.
#[must_use]
pub fn dkim_signing_domain(signature: &str) -> Option<String> {
    signature.split(';').find_map(|tag| {
        let (name, value) = tag.split_once('=')?;
        if name.trim() != "d" {
            return None;
        }
        let domain = value.split_whitespace().next()?.trim();
        (!domain.is_empty()).then(|| domain.to_string())
    })
}

/// A field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Check a normalized record is acceptable for storage.
pub fn validate(record: &EmailRecord) -> Result<(), Vec<FieldError>> {
    let mut problems = Vec::new();
    for (field, value) in [("sender", &record.sender), ("recipient", &record.recipient)] {
        if value.trim().is_empty() {
            problems.push(FieldError {
                field,
                message: format!("{field} is required"),
            });
        } else if value.len() > MAX_ADDRESS_LEN {
            problems.push(FieldError {
                field,
                message: format!("{field} exceeds {MAX_ADDRESS_LEN} bytes"),
            });
        } else if value.chars().any(char::is_control) {
            problems.push(FieldError {
                field,
                message: format!("{field} contains control characters"),
            });
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

/// What a raw message contributes, before sidecar data is layered on.
#[derive(Debug, Default)]
struct HeaderDerived {
    sender: Option<String>,
    recipient: Option<String>,
    subject: Option<String>,
    message_id: Option<String>,
    body: Option<String>,
    received_spf: Option<String>,
    dkim: DkimInfo,
    dmarc: DmarcInfo,
}

fn parse_message(text: &str) -> Result<HeaderDerived, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::EmptyMessage);
    }
    let fields = header_fields(text);
    let message = MessageParser::default()
        .parse(text.as_bytes())
        .ok_or_else(|| ParseError::Malformed("no headers or body found".to_string()))?;

    let from_header = first_value(&fields, "From");
    let parsed_from = message
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .filter(|a| a.contains('@'))
        .map(String::from);
    let parsed_to = message
        .to()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .filter(|a| a.contains('@'))
        .map(String::from);

    let signatures = all_values(&fields, "DKIM-Signature");
    let signed_by = signatures
        .iter()
        .filter_map(|s| dkim_signing_domain(s))
        .collect();
    let from_domain = parsed_from
        .as_deref()
        .and_then(|addr| addr.rsplit_once('@'))
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .filter(|d| !d.is_empty());

    Ok(HeaderDerived {
        sender: parsed_from.or_else(|| from_header.clone()),
        recipient: parsed_to.or_else(|| first_value(&fields, "To")),
        subject: message
            .subject()
            .map(String::from)
            .or_else(|| first_value(&fields, "Subject")),
        message_id: first_value(&fields, "Message-ID"),
        body: message.body_text(0).map(|b| b.into_owned()),
        received_spf: first_value(&fields, "Received-SPF"),
        dkim: DkimInfo {
            signatures,
            from_domain,
            signed_by,
        },
        dmarc: DmarcInfo {
            from_header,
            return_path: first_value(&fields, "Return-Path"),
            authentication_results: first_value(&fields, "Authentication-Results"),
        },
    })
}

/// Split the header block into `(name, value)` pairs in encounter order.
///
/// Values keep their fold points as `\n` so callers can unfold them.
fn header_fields(text: &str) -> Vec<(&str, String)> {
    let mut fields: Vec<(&str, String)> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = fields.last_mut() {
                value.push('\n');
                value.push_str(line);
            }
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                fields.push((name.trim(), value.to_string()));
            }
            _ => break,
        }
    }
    fields
}

/// Collapse each line break plus the whitespace following it into one space.
fn unfold(value: &str) -> String {
    let mut lines = value.split('\n');
    let mut out = lines.next().unwrap_or_default().trim_end().to_string();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(line);
    }
    out.trim().to_string()
}

fn all_values(fields: &[(&str, String)], name: &str) -> Vec<String> {
    fields
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| unfold(v))
        .collect()
}

fn first_value(fields: &[(&str, String)], name: &str) -> Option<String> {
    fields
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| unfold(v))
        .filter(|v| !v.is_empty())
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn new_record(id: &str, sidecar: &Sidecar) -> EmailRecord {
    EmailRecord {
        id: id.to_string(),
        sender: String::new(),
        recipient: String::new(),
        received_at: Utc::now(),
        raw: String::new(),
        subject: None,
        message_id: None,
        body: None,
        connection_info: ConnectionInfo {
            client_address: sidecar.owned(SIDECAR_CLIENT_ADDRESS),
            client_hostname: sidecar.owned(SIDECAR_CLIENT_HOSTNAME),
            client_helo: sidecar.owned(SIDECAR_HELO),
        },
        authentication: AuthenticationMetadata {
            spf: SpfInfo {
                client_ip: sidecar.owned(SIDECAR_CLIENT_ADDRESS),
                mail_from: sidecar.owned(SIDECAR_MAIL_FROM),
                helo_domain: sidecar.owned(SIDECAR_HELO),
                received_spf: None,
            },
            ..AuthenticationMetadata::default()
        },
        sidecar: sidecar.passthrough(),
    }
}

/// The relay saw the real SMTP envelope; message headers are only claims.
fn apply_sidecar_overrides(record: &mut EmailRecord, sidecar: &Sidecar) {
    if let Some(sender) = sidecar.owned(SIDECAR_SENDER) {
        record.sender = sender;
    }
    if let Some(recipient) = sidecar.owned(SIDECAR_RECIPIENT) {
        record.recipient = recipient;
    }
}
