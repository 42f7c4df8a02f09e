use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{
    domain::PhoneNumber,
    settings::{sort_newest_first, BackendKind, SettingsBackend, SettingsPatch, UserSettings},
    Result,
};

/// On-disk record. Every field is optional so older files load with defaults.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord {
    #[serde(flatten)]
    patch: SettingsPatch,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    fn into_settings(self, phone: PhoneNumber) -> UserSettings {
        let mut s = UserSettings::defaults(phone);
        s.apply(&self.patch);
        if let Some(t) = self.created_at {
            s.created_at = t;
        }
        s.updated_at = self.updated_at.unwrap_or(s.created_at);
        s
    }
}

/// Fallback backend: one JSON object keyed by phone number.
///
/// Writers are serialized in-process and every write replaces the file
/// atomically (temp file + rename).
pub struct JsonFileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<PhoneNumber, UserSettings>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let records: BTreeMap<String, FileRecord> = serde_json::from_str(&raw)?;
        let mut out = BTreeMap::new();
        for (key, record) in records {
            match PhoneNumber::parse(&key) {
                Ok(phone) => {
                    out.insert(phone.clone(), record.into_settings(phone));
                }
                Err(_) => tracing::warn!("[STORE] Skipping fallback record with bad key {key:?}"),
            }
        }
        Ok(out)
    }

    async fn write_all(&self, users: &BTreeMap<PhoneNumber, UserSettings>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(users)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsBackend for JsonFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::JsonFile
    }

    async fn get(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(phone))
    }

    async fn upsert(&self, phone: &PhoneNumber, patch: &SettingsPatch) -> Result<UserSettings> {
        let _guard = self.lock.lock().await;
        let mut users = self.read_all().await?;
        let record = users
            .entry(phone.clone())
            .or_insert_with(|| UserSettings::defaults(phone.clone()));
        record.apply(patch);
        record.updated_at = Utc::now();
        let out = record.clone();
        self.write_all(&users).await?;
        Ok(out)
    }

    async fn update(
        &self,
        phone: &PhoneNumber,
        patch: &SettingsPatch,
    ) -> Result<Option<UserSettings>> {
        let _guard = self.lock.lock().await;
        let mut users = self.read_all().await?;
        let Some(record) = users.get_mut(phone) else {
            return Ok(None);
        };
        record.apply(patch);
        record.updated_at = Utc::now();
        let out = record.clone();
        self.write_all(&users).await?;
        Ok(Some(out))
    }

    async fn delete(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        let _guard = self.lock.lock().await;
        let mut users = self.read_all().await?;
        let removed = users.remove(phone);
        if removed.is_some() {
            self.write_all(&users).await?;
        }
        Ok(removed)
    }

    async fn put(&self, record: &UserSettings) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut users = self.read_all().await?;
        users.insert(record.phone_number.clone(), record.clone());
        self.write_all(&users).await
    }

    async fn list_all(&self) -> Result<Vec<UserSettings>> {
        let _guard = self.lock.lock().await;
        let mut users: Vec<_> = self.read_all().await?.into_values().collect();
        sort_newest_first(&mut users);
        Ok(users)
    }

    async fn ping(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.read_all().await.map(|_| ())
    }
}
