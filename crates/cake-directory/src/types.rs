//! Directory record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user as the directory stores it.
///
/// `date_of_birth` is kept as the raw string the directory returned so that a
/// single malformed value can be rejected for that user alone instead of
/// failing the whole page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Opaque user id.
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Birth date, `YYYY-MM-DD` or an RFC 3339 timestamp.
    pub date_of_birth: String,
    /// IANA timezone identifier, e.g. `America/Sao_Paulo`.
    pub location: String,
    /// When the last birthday email was delivered (or the year was abandoned).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_email_sent: Option<DateTime<Utc>>,
    /// Consecutive failed attempts in the current retry chain.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// Name used to address the user in the email.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// One page of users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPage {
    #[serde(rename = "body")]
    pub records: Vec<UserRecord>,
    pub total: u64,
    pub page: u32,
    pub last_page: u32,
}

impl UserPage {
    /// Whether a page after this one exists.
    pub fn has_more(&self) -> bool {
        !self.records.is_empty() && self.page < self.last_page
    }
}

/// A partial update of a user's delivery state. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_email_sent: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl UserPatch {
    /// Patch recording a successful delivery.
    pub fn delivered(at: DateTime<Utc>) -> Self {
        Self {
            last_email_sent: Some(at),
            retry_count: Some(0),
            ..Default::default()
        }
    }

    /// Patch recording another failed attempt in the retry chain.
    pub fn retrying(retry_count: u32) -> Self {
        Self {
            retry_count: Some(retry_count),
            ..Default::default()
        }
    }

    /// Patch recording that the retry budget ran out.
    ///
    /// Names are echoed back unchanged; `last_email_sent` closes the year so no
    /// later sweep picks the user up again until next birthday.
    pub fn exhausted(user: &UserRecord, at: DateTime<Utc>) -> Self {
        Self {
            first_name: Some(user.first_name.clone()),
            last_name: Some(user.last_name.clone()),
            last_email_sent: Some(at),
            retry_count: Some(0),
        }
    }

    /// Apply this patch to a record in place.
    pub fn apply(&self, user: &mut UserRecord) {
        if let Some(first_name) = &self.first_name {
            user.first_name = first_name.clone();
        }
        if let Some(last_name) = &self.last_name {
            user.last_name = last_name.clone();
        }
        if let Some(at) = self.last_email_sent {
            user.last_email_sent = Some(at);
        }
        if let Some(count) = self.retry_count {
            user.retry_count = count;
        }
    }
}
