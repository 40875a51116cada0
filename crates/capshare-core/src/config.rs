use anyhow::{Context, Result};
use mdns_core::ServiceId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_SERVICE_ID: &str = "capshare";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Holds the identity key, this file, and the staging and incoming
    /// directories
    pub data_dir: PathBuf,

    /// Name shown to peers
    pub display_name: String,

    /// Discovery scope; only peers with the same id see each other
    pub service_id: String,

    /// Where the advertiser accepts links; port 0 picks a free one
    pub listen_addr: SocketAddr,

    /// Upper bound for connect + handshake + invitation, in seconds
    pub invite_timeout_secs: u64,

    /// Announce and browse over mDNS. Without it peers are reached by
    /// explicit address only
    pub mdns: bool,

    /// Interface whose address is announced; the first usable one if unset
    pub interface: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".capshare"),
            display_name: "capshare".to_string(),
            service_id: DEFAULT_SERVICE_ID.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            invite_timeout_secs: 10,
            mdns: true,
            interface: None,
        }
    }
}

impl SessionConfig {
    /// Read `config.json` from `data_dir`, falling back to defaults when it
    /// does not exist. `data_dir` always wins over the stored value.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<SessionConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            SessionConfig::default()
        };
        cfg.data_dir = data_dir.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.service_id()?;
        if self.display_name.trim().is_empty() {
            anyhow::bail!("display name must not be empty");
        }
        Ok(())
    }

    pub fn service_id(&self) -> Result<ServiceId> {
        ServiceId::parse(&self.service_id)
            .with_context(|| format!("invalid service id {:?}", self.service_id))
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs.max(1))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    /// Parent of every staging root.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Partially received containers.
    pub fn incoming_dir(&self) -> PathBuf {
        self.data_dir.join("incoming")
    }

    /// Containers packed for sending.
    pub fn outgoing_dir(&self) -> PathBuf {
        self.data_dir.join("outgoing")
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::create_dir_all(self.incoming_dir())?;
        std::fs::create_dir_all(self.outgoing_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults_in_data_dir() {
        let dir = TempDir::new().unwrap();
        let cfg = SessionConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.data_dir, dir.path());
        assert_eq!(cfg.service_id().unwrap().as_str(), "capshare");
        assert_eq!(cfg.invite_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.staging_dir(), dir.path().join("staging"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let cfg = SessionConfig {
            data_dir: dir.path().to_path_buf(),
            display_name: "Studio iPad".into(),
            service_id: "scan-2".into(),
            mdns: false,
            ..SessionConfig::default()
        };
        cfg.save().unwrap();

        let loaded = SessionConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.display_name, "Studio iPad");
        assert_eq!(loaded.service_id, "scan-2");
        assert!(!loaded.mdns);
    }

    #[test]
    fn test_partial_file_is_filled_with_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "display_name": "Bench" }"#,
        )
        .unwrap();
        let cfg = SessionConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.display_name, "Bench");
        assert!(cfg.mdns);
    }

    #[test]
    fn test_invalid_service_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "service_id": "Not_Valid" }"#,
        )
        .unwrap();
        assert!(SessionConfig::load_or_default(dir.path()).is_err());
    }
}
