//! Remote mirror of session credential blobs.
//!
//! Every user owns exactly one object key, `sessions_<phone>/creds.json`, and
//! the settings record stores a backup reference pointing at it.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::{Config, VaultConfig},
    domain::PhoneNumber,
    errors::Error,
    Result,
};

pub const VAULT_SCHEME: &str = "vault://";
pub const LOCAL_SESSION_PREFIX: &str = "local_session_";
pub const CREDS_FILE: &str = "creds.json";

/// Object key inside the vault.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn for_phone(phone: &PhoneNumber) -> Self {
        Self(format!("sessions_{phone}/{CREDS_FILE}"))
    }

    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim_matches('/');
        let safe = !raw.is_empty()
            && Path::new(raw)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::InvalidReference(format!("bad object key: {raw:?}")));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value stored in the settings record.
    pub fn reference(&self) -> String {
        format!("{VAULT_SCHEME}{}", self.0)
    }
}

/// Parsed `sessionId` value of a settings record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupReference {
    /// Per-user object in the vault.
    Remote(ObjectKey),
    /// No remote copy; resume from the local auth directory.
    Local(PhoneNumber),
    /// Pre-reorganisation link that must be migrated.
    Legacy(String),
}

impl BackupReference {
    pub fn local(phone: &PhoneNumber) -> String {
        format!("{LOCAL_SESSION_PREFIX}{phone}")
    }

    /// Classify a stored reference. Anything unrecognised is `InvalidReference`.
    pub fn parse(raw: &str, legacy_prefix: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(key) = raw.strip_prefix(VAULT_SCHEME) {
            return ObjectKey::parse(key).map(BackupReference::Remote);
        }
        if let Some(digits) = raw.strip_prefix(LOCAL_SESSION_PREFIX) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return PhoneNumber::parse(digits).map(BackupReference::Local);
            }
            return Err(Error::InvalidReference(raw.to_string()));
        }
        if !legacy_prefix.is_empty() && raw.starts_with(legacy_prefix) {
            reqwest::Url::parse(raw)
                .map_err(|e| Error::InvalidReference(format!("Invalid URL {raw:?}: {e}")))?;
            return Ok(BackupReference::Legacy(raw.to_string()));
        }
        Err(Error::InvalidReference(raw.to_string()))
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, BackupReference::Legacy(_))
    }
}

#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// `false` when backups are switched off.
    fn is_configured(&self) -> bool {
        true
    }

    /// Store the blob; returns the backup reference to persist.
    async fn put(&self, key: &ObjectKey, data: Vec<u8>) -> Result<String>;

    async fn get(&self, key: &ObjectKey) -> Result<Vec<u8>>;

    /// Missing objects are not an error.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Download a blob from a legacy share link.
    async fn fetch_legacy(&self, url: &str) -> Result<Vec<u8>>;
}

pub fn build_vault(cfg: &Config) -> Result<Arc<dyn CredentialVault>> {
    Ok(match &cfg.vault {
        VaultConfig::Disabled => Arc::new(DisabledVault::new()?),
        VaultConfig::LocalDir(dir) => Arc::new(LocalDirVault::new(dir.clone())?),
        VaultConfig::Http { url, token } => Arc::new(HttpVault::new(url.clone(), token.clone())?),
    })
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Vault(format!("http client build failed: {e}")))
}

async fn download(http: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Vault(format!("legacy download error: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        return Err(Error::Vault(format!("legacy download failed: {status}")));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| Error::Vault(format!("legacy download body error: {e}")))?;
    Ok(bytes.to_vec())
}

/// Backups switched off. Legacy links can still be read so old sessions restore.
pub struct DisabledVault {
    http: reqwest::Client,
}

impl DisabledVault {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_secs(30))?,
        })
    }
}

#[async_trait]
impl CredentialVault for DisabledVault {
    fn is_configured(&self) -> bool {
        false
    }

    async fn put(&self, _key: &ObjectKey, _data: Vec<u8>) -> Result<String> {
        Err(Error::Vault("credential vault not configured".to_string()))
    }

    async fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        Err(Error::Vault(format!(
            "credential vault not configured, cannot fetch {}",
            key.as_str()
        )))
    }

    async fn delete(&self, _key: &ObjectKey) -> Result<()> {
        Ok(())
    }

    async fn fetch_legacy(&self, url: &str) -> Result<Vec<u8>> {
        download(&self.http, url).await
    }
}

/// Mirrors blobs into a directory tree (`<root>/sessions_<phone>/creds.json`).
pub struct LocalDirVault {
    root: PathBuf,
    http: reqwest::Client,
}

impl LocalDirVault {
    pub fn new(root: PathBuf) -> Result<Self> {
        Ok(Self {
            root,
            http: http_client(Duration::from_secs(30))?,
        })
    }

    fn path_for(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.as_str())
    }
}

#[async_trait]
impl CredentialVault for LocalDirVault {
    async fn put(&self, key: &ObjectKey, data: Vec<u8>) -> Result<String> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(key.reference())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.as_str().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            // Only succeeds when empty.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }

    async fn fetch_legacy(&self, url: &str) -> Result<Vec<u8>> {
        download(&self.http, url).await
    }
}

/// Object store spoken to over plain HTTP verbs with an optional bearer token.
pub struct HttpVault {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpVault {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: http_client(Duration::from_secs(30))?,
        })
    }

    fn url_for(&self, key: &ObjectKey) -> String {
        format!("{}/{}", self.base_url, key.as_str())
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait]
impl CredentialVault for HttpVault {
    async fn put(&self, key: &ObjectKey, data: Vec<u8>) -> Result<String> {
        let resp = self
            .authed(self.http.put(self.url_for(key)))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Vault(format!("upload error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Vault(format!(
                "upload failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(key.reference())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        let resp = self
            .authed(self.http.get(self.url_for(key)))
            .send()
            .await
            .map_err(|e| Error::Vault(format!("download error: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(key.as_str().to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Error::Vault(format!("download failed: {status}")));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Vault(format!("download body error: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let resp = self
            .authed(self.http.delete(self.url_for(key)))
            .send()
            .await
            .map_err(|e| Error::Vault(format!("delete error: {e}")))?;

        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::Vault(format!("delete failed: {status}")))
    }

    async fn fetch_legacy(&self, url: &str) -> Result<Vec<u8>> {
        download(&self.http, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "https://mega.nz";

    fn phone(s: &str) -> PhoneNumber {
        PhoneNumber::parse(s).unwrap()
    }

    #[test]
    fn keys_are_per_user() {
        let a = ObjectKey::for_phone(&phone("1555"));
        let b = ObjectKey::for_phone(&phone("1666"));
        assert_eq!(a.as_str(), "sessions_1555/creds.json");
        assert_ne!(a, b);
        assert_eq!(a.reference(), "vault://sessions_1555/creds.json");
    }

    #[test]
    fn references_are_classified() {
        assert_eq!(
            BackupReference::parse("vault://sessions_1555/creds.json", LEGACY).unwrap(),
            BackupReference::Remote(ObjectKey::for_phone(&phone("1555")))
        );
        assert_eq!(
            BackupReference::parse("local_session_1555", LEGACY).unwrap(),
            BackupReference::Local(phone("1555"))
        );
        assert!(BackupReference::parse("https://mega.nz/file/abc#key", LEGACY)
            .unwrap()
            .is_legacy());
    }

    #[test]
    fn malformed_references_are_rejected() {
        for raw in [
            "",
            "garbage",
            "local_session_",
            "local_session_12ab",
            "vault://../etc/passwd",
            "vault://",
            "https://mega.nz:notaport/x",
        ] {
            let err = BackupReference::parse(raw, LEGACY).unwrap_err();
            assert!(matches!(err, Error::InvalidReference(_)), "{raw:?} -> {err}");
        }
    }

    #[test]
    fn new_references_never_look_legacy() {
        let r = ObjectKey::for_phone(&phone("1555")).reference();
        assert!(!r.starts_with(LEGACY));
        assert!(!BackupReference::parse(&r, LEGACY).unwrap().is_legacy());
    }

    #[tokio::test]
    async fn local_dir_vault_round_trips_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let vault = LocalDirVault::new(dir.path().to_path_buf()).unwrap();
        let key = ObjectKey::for_phone(&phone("1555"));

        let reference = vault.put(&key, b"{\"me\":1}".to_vec()).await.unwrap();
        assert_eq!(reference, "vault://sessions_1555/creds.json");
        assert_eq!(vault.get(&key).await.unwrap(), b"{\"me\":1}".to_vec());

        vault.delete(&key).await.unwrap();
        assert!(matches!(vault.get(&key).await, Err(Error::NotFound(_))));
        vault.delete(&key).await.unwrap();
    }
}
