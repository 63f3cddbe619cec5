use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;

/// Server tunables loaded from `game.json`. Every field has a default so a
/// partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub max_players: usize,
    pub default_min_word_length: usize,
    pub max_timer_seconds: u32,
    pub host_grace_seconds: u64,
    pub player_grace_seconds: u64,
    pub start_ack_timeout_ms: u64,
    pub ai_timeout_seconds: u64,
    pub peer_validation_seconds: u64,
    pub peer_validation_min_players: usize,
    pub combo_decay_ms: u64,
    pub community_approval_threshold: i64,
    pub backup_ttl_seconds: u64,
    pub stale_room_minutes: u64,
    pub afk_after_seconds: u64,
    pub tournament_break_seconds: u64,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_events: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_players: 50,
            default_min_word_length: 2,
            max_timer_seconds: 1200,
            host_grace_seconds: 30,
            player_grace_seconds: 45,
            start_ack_timeout_ms: 2000,
            ai_timeout_seconds: 8,
            peer_validation_seconds: 20,
            peer_validation_min_players: 4,
            combo_decay_ms: 8000,
            community_approval_threshold: 3,
            backup_ttl_seconds: 3600,
            stale_room_minutes: 120,
            afk_after_seconds: 120,
            tournament_break_seconds: 15,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_events: 20,
        }
    }
}

impl ServerConfig {
    pub fn host_grace(&self) -> Duration {
        Duration::from_secs(self.host_grace_seconds)
    }

    pub fn player_grace(&self) -> Duration {
        Duration::from_secs(self.player_grace_seconds)
    }

    pub fn start_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.start_ack_timeout_ms)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_seconds)
    }

    pub fn peer_validation_window(&self) -> Duration {
        Duration::from_secs(self.peer_validation_seconds)
    }

    pub fn combo_decay(&self) -> Duration {
        Duration::from_millis(self.combo_decay_ms)
    }

    pub fn backup_ttl(&self) -> Duration {
        Duration::from_secs(self.backup_ttl_seconds)
    }

    pub fn stale_room_after(&self) -> Duration {
        Duration::from_secs(self.stale_room_minutes * 60)
    }

    /// Heartbeat silence after which a connected player is shown as away.
    pub fn afk_after(&self) -> Duration {
        Duration::from_secs(self.afk_after_seconds)
    }

    pub fn tournament_break(&self) -> Duration {
        Duration::from_secs(self.tournament_break_seconds)
    }
}

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize config directory with defaults if missing.
pub fn init() {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base).expect("Failed to create config directory");
    }

    let game_path = config_path("game.json");
    if !game_path.exists() {
        let defaults = serde_json::to_string_pretty(&ServerConfig::default())
            .expect("default config serializes");
        fs::write(&game_path, defaults).expect("Failed to write default game.json");
    }

    let dict_dir = config_path("dictionaries");
    if !dict_dir.exists() {
        fs::create_dir_all(&dict_dir).expect("Failed to create dictionaries directory");
        fs::write(dict_dir.join("en.txt"), "cat\ndog\nrat\ntag\ngoat\n")
            .expect("Failed to write example dictionary");
    }
}

/// Load the server configuration, falling back to defaults on a bad file.
pub fn load_server_config() -> ServerConfig {
    let path = config_path("game.json");
    match fs::read_to_string(&path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            tracing::error!("Failed to parse {}: {}, using defaults", path.display(), e);
            ServerConfig::default()
        }),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}, using defaults", path.display(), e);
            ServerConfig::default()
        }
    }
}

/// Load every `dictionaries/<language>.txt` plus the optional `blocklist.txt`.
pub fn load_dictionary() -> Dictionary {
    let mut dictionary = Dictionary::default();

    let dict_dir = config_path("dictionaries");
    let entries = match fs::read_dir(&dict_dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to read dictionaries directory: {}", e);
            return dictionary;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }

        let language = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        match fs::read_to_string(&path) {
            Ok(data) => {
                dictionary.extend(&language, data.lines());
                tracing::info!(
                    "Loaded {} words for language {}",
                    dictionary.word_count(&language),
                    language
                );
            }
            Err(e) => tracing::error!("Failed to read dictionary {}: {}", path.display(), e),
        }
    }

    if let Ok(data) = fs::read_to_string(config_path("blocklist.txt")) {
        dictionary.block(data.lines());
    }

    dictionary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"hostGraceSeconds": 5, "rateLimit": {"maxEvents": 3}}"#)
                .unwrap();
        assert_eq!(cfg.host_grace(), Duration::from_secs(5));
        assert_eq!(cfg.player_grace_seconds, 45);
        assert_eq!(cfg.rate_limit.max_events, 3);
        assert_eq!(cfg.rate_limit.window_ms, 1000);
        assert_eq!(cfg.peer_validation_min_players, 4);
    }
}
