//! Canonical email record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A normalized, persistence-ready email submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub connection_info: ConnectionInfo,
    #[serde(default)]
    pub authentication: AuthenticationMetadata,
    /// Sidecar headers without a dedicated field, keyed by lowercase name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sidecar: BTreeMap<String, String>,
}

/// Transport evidence reported by the upstream relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_helo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationMetadata {
    #[serde(default)]
    pub spf: SpfInfo,
    #[serde(default)]
    pub dkim: DkimInfo,
    #[serde(default)]
    pub dmarc: DmarcInfo,
}

/// What the relay saw during the SMTP transaction. Nothing here is verified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpfInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mail_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helo_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_spf: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimInfo {
    /// Unfolded `DKIM-Signature` values in header order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_domain: Option<String>,
    /// `d=` domains of the signatures they could be extracted from, same order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signed_by: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmarcInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_results: Option<String>,
}
