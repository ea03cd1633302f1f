use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_USER_PREFIX: &str = "user";
const DEFAULT_SYNC_INTERVAL_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read session config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse session config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParticipantRole {
    Host,
    Guest,
    /// Single participant without peers.
    #[default]
    Local,
}

impl ParticipantRole {
    /// Whether this participant holds creation/destruction authority.
    pub fn is_authoritative(self) -> bool {
        !matches!(self, ParticipantRole::Guest)
    }

    pub fn is_networked(self) -> bool {
        matches!(self, ParticipantRole::Host | ParticipantRole::Guest)
    }
}

/// Scene session settings shared by every plugin of a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub participant: ParticipantRole,
    pub session_name: String,
    pub user_prefix: String,
    #[serde(default)]
    pub unique_user_name: String,
    pub sync_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            participant: ParticipantRole::default(),
            session_name: "scene".to_string(),
            user_prefix: DEFAULT_USER_PREFIX.to_string(),
            unique_user_name: generate_unique_name(DEFAULT_USER_PREFIX),
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
        }
    }
}

impl SessionConfig {
    pub fn for_role(participant: ParticipantRole) -> Self {
        Self {
            participant,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: SessionConfig = serde_json::from_str(json)?;
        config.normalize();
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&contents)?;
        log::info!(
            "[config] loaded session '{}' from {} as {:?} ({})",
            config.session_name,
            path.display(),
            config.participant,
            config.unique_user_name
        );
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    /// Prefixes a locally created entity name with this participant's unique
    /// user name so it cannot collide with other participants' entities.
    pub fn scoped_name(&self, local: &str) -> String {
        format!("{}_{}", self.unique_user_name, local)
    }

    fn normalize(&mut self) {
        if self.user_prefix.trim().is_empty() {
            self.user_prefix = DEFAULT_USER_PREFIX.to_string();
        }
        if self.unique_user_name.trim().is_empty() {
            self.unique_user_name = generate_unique_name(&self.user_prefix);
        }
        if self.sync_interval_ms == 0 {
            log::warn!(
                "[config] sync_interval_ms of 0 replaced with {}",
                DEFAULT_SYNC_INTERVAL_MS
            );
            self.sync_interval_ms = DEFAULT_SYNC_INTERVAL_MS;
        }
    }
}

/// `<prefix>_<8 hex digits>`.
pub fn generate_unique_name(prefix: &str) -> String {
    format!("{}_{:08x}", prefix, rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_generate_a_unique_user_name() {
        let a = SessionConfig::default();
        let b = SessionConfig::default();
        assert!(a.unique_user_name.starts_with("user_"));
        assert_eq!(a.unique_user_name.len(), "user_".len() + 8);
        assert_ne!(a.unique_user_name, b.unique_user_name);
        assert_eq!(a.participant, ParticipantRole::Local);
        assert_eq!(a.sync_interval(), Duration::from_millis(50));
    }

    #[test]
    fn json_fills_in_missing_fields() {
        let config =
            SessionConfig::from_json_str(r#"{"participant":"Guest","user_prefix":"visitor"}"#)
                .expect("parse");
        assert_eq!(config.participant, ParticipantRole::Guest);
        assert!(config.unique_user_name.starts_with("visitor_"));
        assert_eq!(config.sync_interval_ms, 50);
        assert!(!config.participant.is_authoritative());
    }

    #[test]
    fn explicit_name_is_kept_and_scopes_entities() {
        let config = SessionConfig::from_json_str(
            r#"{"participant":"Host","unique_user_name":"alice_0000beef","sync_interval_ms":0}"#,
        )
        .expect("parse");
        assert_eq!(config.unique_user_name, "alice_0000beef");
        assert_eq!(config.scoped_name("camera"), "alice_0000beef_camera");
        assert_eq!(config.sync_interval_ms, 50);
    }

    #[test]
    fn load_reads_from_disk_and_reports_errors() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"participant":"Host","session_name":"lab"}}"#).expect("write");
        let config = SessionConfig::load(file.path()).expect("load");
        assert_eq!(config.session_name, "lab");
        assert!(config.participant.is_networked());

        let missing = SessionConfig::load(Path::new("/definitely/not/here.json"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
        assert!(matches!(
            SessionConfig::from_json_str("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
