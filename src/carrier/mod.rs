//! The carrier surface: every platform endpoint the tunnel can hide
//! datagrams in, expressed as one async trait so the engine never owns the
//! HTTP details and tests can substitute an in-memory platform.

pub mod http;
pub mod qr;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{ClubConfig, UserConfig};

/// Platform error code for rate limiting ("flood control").
pub const API_CODE_FLOOD: i64 = 9;

/// Platform error code for a missing or invalid user authorisation.
pub const API_CODE_UNAUTHORIZED: i64 = 5;

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("HTTP {0}")]
    Http(u16),

    #[error("api code {code}: {message}")]
    Api { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl CarrierError {
    /// Rate limiting; the datagram is recoverable via RETRY, callers only
    /// log it.
    pub fn is_flood(&self) -> bool {
        matches!(self, CarrierError::Api { code, .. } if *code == API_CODE_FLOOD)
    }

    /// Missing user token; disables user-scoped methods for the run.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CarrierError::Api { code, .. } if *code == API_CODE_UNAUTHORIZED)
    }
}

/// Handle for the platform's push channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LongPollServer {
    pub server: String,
    pub key: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub ts: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LongPollBatch {
    #[serde(deserialize_with = "string_or_number", default)]
    pub ts: String,
    #[serde(default)]
    pub failed: i64,
    #[serde(default)]
    pub updates: Vec<Update>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LongPollSettings {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub events: std::collections::HashMap<String, bool>,
}

/// One long-poll event. The platform names event types with strings; the
/// router turns them into [`UpdateKind`] and pattern-matches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub object: UpdateObject,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateObject {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub orig_photo: UpdatePhoto,
    #[serde(default)]
    pub changes: UpdateChanges,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePhoto {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateChanges {
    #[serde(default)]
    pub website: UpdateValueChange,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateValueChange {
    #[serde(default)]
    pub old_value: String,
    #[serde(default)]
    pub new_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    MessageReply,
    WallPostNew,
    WallReplyNew,
    PhotoNew,
    GroupChangeSettings,
    StorageChange,
    Unsupported,
}

impl Update {
    pub fn kind(&self) -> UpdateKind {
        match self.kind.as_str() {
            "message_reply" => UpdateKind::MessageReply,
            "wall_post_new" => UpdateKind::WallPostNew,
            "wall_reply_new" => UpdateKind::WallReplyNew,
            "photo_new" => UpdateKind::PhotoNew,
            "group_change_settings" => UpdateKind::GroupChangeSettings,
            "storage_change" => UpdateKind::StorageChange,
            _ => UpdateKind::Unsupported,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct GroupsEdit {
    pub description: Option<String>,
    pub website: Option<String>,
}

/// Everything the tunnel asks of the platform. One implementation talks
/// real HTTP ([`http::HttpCarrier`]); tests wire two engines together with
/// a channel-backed double.
#[async_trait]
pub trait Carrier: Send + Sync {
    async fn send_message(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        text: &str,
    ) -> Result<i64, CarrierError>;

    /// Conversation backlog; only consulted during bootstrap or as a
    /// fallback when the push channel is unavailable.
    async fn message_history(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        offset: i64,
        count: i64,
        rev: i64,
    ) -> Result<Vec<Message>, CarrierError>;

    async fn long_poll_server(&self, club: &ClubConfig) -> Result<LongPollServer, CarrierError>;

    async fn long_poll(
        &self,
        club: &ClubConfig,
        server: &LongPollServer,
        ts: &str,
        wait: u64,
    ) -> Result<LongPollBatch, CarrierError>;

    async fn long_poll_settings(
        &self,
        club: &ClubConfig,
    ) -> Result<LongPollSettings, CarrierError>;

    async fn wall_post(&self, club: &ClubConfig, text: &str) -> Result<i64, CarrierError>;

    async fn wall_comment(
        &self,
        club: &ClubConfig,
        post_id: i64,
        text: &str,
    ) -> Result<i64, CarrierError>;

    async fn docs_upload(
        &self,
        club: &ClubConfig,
        data: Vec<u8>,
    ) -> Result<Document, CarrierError>;

    async fn download_url(&self, url: &str) -> Result<Vec<u8>, CarrierError>;

    async fn photos_upload(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<i64, CarrierError>;

    async fn storage_get(
        &self,
        club: &ClubConfig,
        keys: &[String],
    ) -> Result<Vec<StorageEntry>, CarrierError>;

    async fn storage_set(
        &self,
        club: &ClubConfig,
        key: &str,
        value: &str,
    ) -> Result<(), CarrierError>;

    async fn groups_edit(&self, club: &ClubConfig, edit: GroupsEdit) -> Result<(), CarrierError>;

    async fn video_comment(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        text: &str,
    ) -> Result<(), CarrierError>;

    async fn photo_comment(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        text: &str,
    ) -> Result<(), CarrierError>;

    /// Cheap credential probe for startup validation.
    async fn check_club(&self, club: &ClubConfig) -> Result<(), CarrierError>;

    /// Cheap user-token probe for startup validation.
    async fn check_user(&self, user: &UserConfig) -> Result<(), CarrierError>;
}

/// Accept both `"123"` and `123` for timestamp-ish fields.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;

    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
