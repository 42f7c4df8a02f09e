//! Per-user settings: the record type, its defaults and the dual-backend store.

mod file;
mod sqlite;
mod store;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::PhoneNumber, Result};

pub use file::JsonFileBackend;
pub use sqlite::SqliteBackend;
pub use store::{SettingsStore, StorageHealth, StorageStatus};

pub const DEFAULT_PREFIX: &str = ".";
pub const DEFAULT_STATUS_READ_MESSAGE: &str = "Your Status has been read";

/// Settings record, one per phone number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub phone_number: PhoneNumber,
    /// Backup reference (`vault://…`, `local_session_<phone>` or a legacy URL).
    pub session_id: Option<String>,
    pub display_name: Option<String>,
    pub auto_read: bool,
    pub auto_typing: bool,
    pub auto_recording: bool,
    pub always_online: bool,
    pub anti_call: bool,
    pub anti_link: bool,
    pub status_read_enabled: bool,
    pub auto_react_enabled: bool,
    pub status_react_notify: bool,
    pub prefix: String,
    pub status_read_message: String,
    pub vcf_file_name: Option<String>,
    pub last_vcf_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSettings {
    /// Default configuration for a number that has no record yet.
    pub fn defaults(phone: PhoneNumber) -> Self {
        let now = Utc::now();
        Self {
            phone_number: phone,
            session_id: None,
            display_name: None,
            auto_read: false,
            auto_typing: false,
            auto_recording: false,
            always_online: false,
            anti_call: false,
            anti_link: false,
            status_read_enabled: true,
            auto_react_enabled: false,
            status_react_notify: true,
            prefix: DEFAULT_PREFIX.to_string(),
            status_read_message: DEFAULT_STATUS_READ_MESSAGE.to_string(),
            vcf_file_name: None,
            last_vcf_update: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overlay the fields present in `patch`. Does not touch `updated_at`.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(v) = &patch.session_id {
            self.session_id = Some(v.clone());
        }
        if let Some(v) = &patch.display_name {
            self.display_name = Some(v.clone());
        }
        if let Some(v) = patch.auto_read {
            self.auto_read = v;
        }
        if let Some(v) = patch.auto_typing {
            self.auto_typing = v;
        }
        if let Some(v) = patch.auto_recording {
            self.auto_recording = v;
        }
        if let Some(v) = patch.always_online {
            self.always_online = v;
        }
        if let Some(v) = patch.anti_call {
            self.anti_call = v;
        }
        if let Some(v) = patch.anti_link {
            self.anti_link = v;
        }
        if let Some(v) = patch.status_read_enabled {
            self.status_read_enabled = v;
        }
        if let Some(v) = patch.auto_react_enabled {
            self.auto_react_enabled = v;
        }
        if let Some(v) = patch.status_react_notify {
            self.status_react_notify = v;
        }
        if let Some(v) = patch.prefix.as_deref().filter(|p| !p.trim().is_empty()) {
            self.prefix = v.trim().to_string();
        }
        if let Some(v) = &patch.status_read_message {
            self.status_read_message = v.clone();
        }
        if let Some(v) = &patch.vcf_file_name {
            self.vcf_file_name = Some(v.clone());
        }
        if let Some(v) = patch.last_vcf_update {
            self.last_vcf_update = Some(v);
        }
    }
}

/// Partial update; `None` leaves the stored value alone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_recording: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_call: Option<bool>,
    #[serde(default, alias = "antilink", skip_serializing_if = "Option::is_none")]
    pub anti_link: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_read_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_react_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_react_notify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_read_message: Option<String>,
    #[serde(default, alias = "vcfFilename", skip_serializing_if = "Option::is_none")]
    pub vcf_file_name: Option<String>,
    #[serde(default, alias = "lastVCFUpdate", skip_serializing_if = "Option::is_none")]
    pub last_vcf_update: Option<DateTime<Utc>>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self == &SettingsPatch::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Sqlite,
    JsonFile,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => f.write_str("sqlite"),
            BackendKind::JsonFile => f.write_str("json-file"),
        }
    }
}

/// Storage backend for settings records.
///
/// `upsert` creates from defaults when missing; `update` never creates.
#[async_trait]
pub trait SettingsBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn get(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>>;

    async fn upsert(&self, phone: &PhoneNumber, patch: &SettingsPatch) -> Result<UserSettings>;

    async fn update(
        &self,
        phone: &PhoneNumber,
        patch: &SettingsPatch,
    ) -> Result<Option<UserSettings>>;

    async fn delete(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>>;

    /// Store `record` verbatim, timestamps included.
    async fn put(&self, record: &UserSettings) -> Result<()>;

    /// Newest first.
    async fn list_all(&self) -> Result<Vec<UserSettings>>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;
}

/// Newest first, phone number as tie-breaker.
pub(crate) fn sort_newest_first(users: &mut [UserSettings]) {
    users.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.phone_number.cmp(&b.phone_number))
    });
}
