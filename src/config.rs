use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::node::{NodeDescriptor, PoolSettings};
use crate::audio::registry::RegistrySettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Lavalink
    pub lavalink_uri: String,
    pub lavalink_password: String,
    pub lavalink_backup_uri: Option<String>,
    pub lavalink_backup_password: Option<String>,
    pub node_heartbeat_secs: u64,
    pub node_max_missed_heartbeats: u32,

    // Búsqueda
    pub search_timeout_secs: u64,
    pub invidious_instances: Vec<String>,

    // Límites
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub max_song_duration: u64, // En segundos, 0 = sin límite

    // Paths
    pub data_dir: PathBuf,

    // Features
    pub enable_autoplay: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,

            // Lavalink
            lavalink_uri: std::env::var("LAVALINK_URI")
                .unwrap_or_else(|_| "http://localhost:2333".to_string()),
            lavalink_password: std::env::var("LAVALINK_PASSWORD")
                .unwrap_or_else(|_| "youshallnotpass".to_string()),
            lavalink_backup_uri: non_empty_var("LAVALINK_BACKUP_URI"),
            lavalink_backup_password: non_empty_var("LAVALINK_BACKUP_PASSWORD"),
            node_heartbeat_secs: std::env::var("NODE_HEARTBEAT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            node_max_missed_heartbeats: std::env::var("NODE_MAX_MISSED_HEARTBEATS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,

            // Búsqueda
            search_timeout_secs: std::env::var("SEARCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            invidious_instances: parse_list(&std::env::var("INVIDIOUS_INSTANCES").unwrap_or_default()),

            // Límites
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            max_playlist_size: std::env::var("MAX_PLAYLIST_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            max_song_duration: std::env::var("MAX_SONG_DURATION")
                .unwrap_or_else(|_| "7200".to_string()) // 2 horas
                .parse()?,

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),

            // Features
            enable_autoplay: std::env::var("ENABLE_AUTOPLAY")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Node URIs must be `http(s)` URLs
    /// - A backup node needs its own password
    /// - Heartbeat interval, missed-heartbeat limit and search timeout must be > 0
    /// - Queue and playlist limits must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN must not be empty");
        }

        check_node_uri("LAVALINK_URI", &self.lavalink_uri)?;
        if let Some(uri) = &self.lavalink_backup_uri {
            check_node_uri("LAVALINK_BACKUP_URI", uri)?;
            if self.lavalink_backup_password.is_none() {
                anyhow::bail!("LAVALINK_BACKUP_PASSWORD is required when LAVALINK_BACKUP_URI is set");
            }
        }

        if self.node_heartbeat_secs == 0 {
            anyhow::bail!("Node heartbeat interval must be greater than 0");
        }

        if self.node_max_missed_heartbeats == 0 {
            anyhow::bail!("Max missed heartbeats must be greater than 0");
        }

        if self.search_timeout_secs == 0 {
            anyhow::bail!("Search timeout must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        Ok(())
    }

    /// Resumen de la configuración para logs, sin secretos.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Nodes: primary {} (backup: {})\n  \
            Heartbeat: every {}s, {} missed = down\n  \
            Search: {}s timeout, {} Invidious instances\n  \
            Limits: {} queue, {} playlist, {} max duration\n  \
            Features: Autoplay={}",
            self.lavalink_uri,
            self.lavalink_backup_uri.as_deref().unwrap_or("none"),
            self.node_heartbeat_secs,
            self.node_max_missed_heartbeats,
            self.search_timeout_secs,
            self.invidious_instances.len(),
            self.max_queue_size,
            self.max_playlist_size,
            self.max_track_duration()
                .map_or("unlimited".to_string(), |d| humantime::format_duration(d).to_string()),
            self.enable_autoplay
        )
    }

    pub fn primary_node(&self) -> NodeDescriptor {
        NodeDescriptor {
            name: "primary".to_string(),
            uri: self.lavalink_uri.clone(),
            password: self.lavalink_password.clone(),
        }
    }

    pub fn backup_node(&self) -> Option<NodeDescriptor> {
        let uri = self.lavalink_backup_uri.clone()?;
        Some(NodeDescriptor {
            name: "backup".to_string(),
            uri,
            password: self.lavalink_backup_password.clone().unwrap_or_default(),
        })
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            heartbeat_interval: Duration::from_secs(self.node_heartbeat_secs),
            max_missed_heartbeats: self.node_max_missed_heartbeats,
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_queue_size: self.max_queue_size,
            max_playlist_size: self.max_playlist_size,
            max_track_duration: self.max_track_duration(),
            autoplay_default: self.enable_autoplay,
        }
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    fn max_track_duration(&self) -> Option<Duration> {
        (self.max_song_duration > 0).then(|| Duration::from_secs(self.max_song_duration))
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn check_node_uri(key: &str, uri: &str) -> Result<()> {
    let parsed = url::Url::parse(uri).map_err(|e| anyhow::anyhow!("{key} is not a valid URL ({uri}): {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("{key} must use http or https, got: {}", parsed.scheme());
    }
    Ok(())
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),

            lavalink_uri: "http://localhost:2333".to_string(),
            lavalink_password: "youshallnotpass".to_string(),
            lavalink_backup_uri: None,
            lavalink_backup_password: None,
            node_heartbeat_secs: 5,
            node_max_missed_heartbeats: 3,

            search_timeout_secs: 10,
            invidious_instances: Vec::new(),

            max_queue_size: 1000,
            max_playlist_size: 100,
            max_song_duration: 7200, // 2 hours

            data_dir: "/app/data".into(),

            enable_autoplay: false,
        }
    }
}
