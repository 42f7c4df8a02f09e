use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono_tz::Tz;

use crate::{errors::Error, Result};

/// Where session credential backups go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VaultConfig {
    /// Backups disabled; every reference falls back to `local_session_<phone>`.
    Disabled,
    /// Mirror blobs into a directory (mounted volume, synced folder).
    LocalDir(PathBuf),
    /// Object store reachable over HTTP (`PUT/GET/DELETE <url>/<key>`).
    Http { url: String, token: Option<String> },
}

/// Typed configuration for the bot.
#[derive(Clone, Debug)]
pub struct Config {
    // HTTP control surface
    pub port: u16,

    // Filesystem layout
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub restored_sessions_dir: PathBuf,
    pub database_path: Option<PathBuf>,
    pub fallback_store_path: PathBuf,
    pub vcf_dir: PathBuf,

    // Credential backups
    pub vault: VaultConfig,
    pub legacy_backup_prefix: String,

    // Protocol bridge
    pub bridge_url: String,
    pub bridge_token: Option<String>,

    // Identity
    pub owner_numbers: Vec<String>,
    pub owner_name: String,
    pub bot_name: String,
    pub bot_version: String,
    pub custom_pairing_code: String,

    // Session lifecycle timings
    pub reconnect_delay: Duration,
    pub restore_stagger: Duration,
    pub pairing_settle: Duration,

    // Outbound pacing per connection
    pub send_global_interval: Duration,
    pub send_per_chat_interval: Duration,

    // Background jobs
    pub cleanup_interval: Duration,
    pub storage_probe_interval: Duration,
    pub vcf_cron: String,
    pub vcf_timezone: Tz,
    pub vcf_send_delay: Duration,
    pub scheduler_start_delay: Duration,

    // Plugins
    pub tiktok_api_url: String,
    pub tiktok_api_key: Option<String>,
    pub menu_image_url: Option<String>,
    pub greeting_image_url: Option<String>,
}

impl Config {
    /// Defaults with every path rooted at `root`.
    pub fn with_root(root: &Path) -> Self {
        let data_dir = root.join("data");
        Self {
            port: 3000,
            database_path: Some(data_dir.join("wab.sqlite3")),
            fallback_store_path: data_dir.join("users.json"),
            vcf_dir: data_dir.join("vcf"),
            sessions_dir: root.join("sessions"),
            restored_sessions_dir: root.join("restored_sessions"),
            data_dir,
            vault: VaultConfig::Disabled,
            legacy_backup_prefix: "https://mega.nz".to_string(),
            bridge_url: "http://127.0.0.1:8085".to_string(),
            bridge_token: None,
            owner_numbers: vec!["13056978303".to_string()],
            owner_name: "ShizzyBot Team".to_string(),
            bot_name: "SHIZZY BOT".to_string(),
            bot_version: "1.0.0".to_string(),
            custom_pairing_code: "SHIZZYBOT".to_string(),
            reconnect_delay: Duration::from_secs(5),
            restore_stagger: Duration::from_secs(5),
            pairing_settle: Duration::from_secs(3),
            send_global_interval: Duration::from_millis(100),
            send_per_chat_interval: Duration::from_millis(500),
            cleanup_interval: Duration::from_secs(60 * 60),
            storage_probe_interval: Duration::from_secs(60),
            vcf_cron: "0 12 * * *".to_string(),
            vcf_timezone: chrono_tz::America::New_York,
            vcf_send_delay: Duration::from_secs(1),
            scheduler_start_delay: Duration::from_secs(10),
            tiktok_api_url: "https://api.neoxr.my.id/api/tiktok".to_string(),
            tiktok_api_key: None,
            menu_image_url: None,
            greeting_image_url: None,
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let root = env_path("BOT_ROOT").unwrap_or_else(|| PathBuf::from("."));
        let mut cfg = Self::with_root(&root);

        if let Some(port) = env_str("PORT") {
            cfg.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("PORT is not a valid port: {port}")))?;
        }

        if let Some(dir) = env_path("DATA_DIR") {
            cfg.fallback_store_path = dir.join("users.json");
            cfg.vcf_dir = dir.join("vcf");
            cfg.database_path = Some(dir.join("wab.sqlite3"));
            cfg.data_dir = dir;
        }
        if let Some(dir) = env_path("SESSIONS_DIR") {
            cfg.sessions_dir = dir;
        }
        if let Some(dir) = env_path("RESTORED_SESSIONS_DIR") {
            cfg.restored_sessions_dir = dir;
        }
        if let Some(path) = env_path("DATABASE_PATH") {
            cfg.database_path = Some(path);
        }
        if env_bool("DISABLE_DATABASE").unwrap_or(false) {
            cfg.database_path = None;
        }

        cfg.vault = match (
            env_path("VAULT_DIR"),
            env_str("VAULT_URL").and_then(non_empty),
        ) {
            (Some(dir), _) => VaultConfig::LocalDir(dir),
            (None, Some(url)) => VaultConfig::Http {
                url: url.trim_end_matches('/').to_string(),
                token: env_str("VAULT_TOKEN").and_then(non_empty),
            },
            (None, None) => VaultConfig::Disabled,
        };
        if let Some(prefix) = env_str("LEGACY_BACKUP_PREFIX").and_then(non_empty) {
            cfg.legacy_backup_prefix = prefix;
        }

        if let Some(url) = env_str("BRIDGE_URL").and_then(non_empty) {
            cfg.bridge_url = url.trim_end_matches('/').to_string();
        }
        cfg.bridge_token = env_str("BRIDGE_TOKEN").and_then(non_empty);

        let owners = parse_csv_digits(env_str("OWNER_NUMBERS"));
        if !owners.is_empty() {
            cfg.owner_numbers = owners;
        }
        if let Some(v) = env_str("OWNER_NAME").and_then(non_empty) {
            cfg.owner_name = v;
        }
        if let Some(v) = env_str("BOT_NAME").and_then(non_empty) {
            cfg.bot_name = v;
        }
        if let Some(v) = env_str("BOT_VERSION").and_then(non_empty) {
            cfg.bot_version = v;
        }
        if let Some(v) = env_str("CUSTOM_PAIRING_CODE").and_then(non_empty) {
            cfg.custom_pairing_code = v;
        }

        if let Some(ms) = env_u64("RECONNECT_DELAY_MS") {
            cfg.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RESTORE_STAGGER_MS") {
            cfg.restore_stagger = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PAIRING_SETTLE_MS") {
            cfg.pairing_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SEND_GLOBAL_INTERVAL_MS") {
            cfg.send_global_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SEND_PER_CHAT_INTERVAL_MS") {
            cfg.send_per_chat_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("CLEANUP_INTERVAL_SECS") {
            cfg.cleanup_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("STORAGE_PROBE_INTERVAL_SECS") {
            cfg.storage_probe_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(expr) = env_str("VCF_CRON").and_then(non_empty) {
            cfg.vcf_cron = expr;
        }
        if let Some(tz) = env_str("VCF_TIMEZONE").and_then(non_empty) {
            cfg.vcf_timezone = tz
                .trim()
                .parse::<Tz>()
                .map_err(|_| Error::Config(format!("VCF_TIMEZONE is not a known zone: {tz}")))?;
        }
        if let Some(ms) = env_u64("VCF_SEND_DELAY_MS") {
            cfg.vcf_send_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("SCHEDULER_START_DELAY_SECS") {
            cfg.scheduler_start_delay = Duration::from_secs(secs);
        }

        if let Some(url) = env_str("TIKTOK_API_URL").and_then(non_empty) {
            cfg.tiktok_api_url = url;
        }
        cfg.tiktok_api_key = env_str("TIKTOK_API_KEY").and_then(non_empty);
        cfg.menu_image_url = env_str("MENU_IMAGE_URL").and_then(non_empty);
        cfg.greeting_image_url = env_str("GREETING_IMAGE_URL").and_then(non_empty);

        Ok(cfg)
    }

    /// Create the directories the bot writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.sessions_dir,
            &self.restored_sessions_dir,
            &self.vcf_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        if let VaultConfig::LocalDir(dir) = &self.vault {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue; // existing env wins
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv_digits(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_rooted_and_use_new_york_schedule() {
        let cfg = Config::with_root(Path::new("/srv/bot"));
        assert_eq!(cfg.sessions_dir, PathBuf::from("/srv/bot/sessions"));
        assert_eq!(
            cfg.fallback_store_path,
            PathBuf::from("/srv/bot/data/users.json")
        );
        assert_eq!(cfg.vcf_dir, PathBuf::from("/srv/bot/data/vcf"));
        assert_eq!(cfg.vcf_cron, "0 12 * * *");
        assert_eq!(cfg.vcf_timezone, chrono_tz::America::New_York);
        assert_eq!(cfg.vault, VaultConfig::Disabled);
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn owner_csv_keeps_digits_only() {
        let owners = parse_csv_digits(Some("+1 305 697 8303, ,2348012345678".to_string()));
        assert_eq!(owners, vec!["13056978303", "2348012345678"]);
    }

    #[test]
    fn dotenv_does_not_override_existing_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nWAB_TEST_DOTENV_A=\"quoted\"\nWAB_TEST_DOTENV_B=from_file\n",
        )
        .unwrap();
        env::set_var("WAB_TEST_DOTENV_B", "from_env");

        load_dotenv_if_present(&path);

        assert_eq!(env::var("WAB_TEST_DOTENV_A").unwrap(), "quoted");
        assert_eq!(env::var("WAB_TEST_DOTENV_B").unwrap(), "from_env");
    }
}
