use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

/// Configuración de servidor almacenada en JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSettings {
    pub guild_id: u64,
    /// Canal de texto donde se aceptan comandos de música (ninguno = todos).
    pub music_channel_id: Option<u64>,
    /// Rol con permisos de DJ (skip forzado, stop).
    pub dj_role_id: Option<u64>,
}

impl GuildSettings {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id: guild_id.get(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait GuildStore: Send + Sync {
    /// Configuración del guild, o la de por defecto si no hay nada guardado.
    async fn get(&self, guild_id: GuildId) -> Result<GuildSettings>;

    async fn set(&self, settings: GuildSettings) -> Result<()>;
}

/// Manager de almacenamiento basado en archivos JSON
pub struct JsonStorage {
    data_dir: PathBuf,
    servers_cache: RwLock<HashMap<u64, GuildSettings>>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let servers_dir = data_dir.join("servers");
        fs::create_dir_all(&servers_dir).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let storage = Self {
            data_dir,
            servers_cache: RwLock::new(HashMap::new()),
        };

        // Cargar configuraciones existentes
        storage.load_all_servers().await?;

        Ok(storage)
    }

    async fn load_server_config(&self, guild_id: u64) -> Result<GuildSettings> {
        let file_path = self.get_server_file_path(guild_id);
        let content = fs::read_to_string(&file_path).await?;
        let settings: GuildSettings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    async fn save_server_config(&self, settings: &GuildSettings) -> Result<()> {
        let file_path = self.get_server_file_path(settings.guild_id);
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&file_path, content).await?;
        Ok(())
    }

    async fn load_all_servers(&self) -> Result<()> {
        let servers_dir = self.data_dir.join("servers");
        let mut files = fs::read_dir(&servers_dir).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|name| name.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_server_config(guild_id).await {
                Ok(settings) => {
                    self.servers_cache.write().insert(guild_id, settings);
                    loaded_count += 1;
                }
                Err(e) => {
                    warn!("Error cargando configuración para guild {}: {}", guild_id, e);
                }
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargadas {} configuraciones de servidor", loaded_count);
        }

        Ok(())
    }

    fn get_server_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join("servers").join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl GuildStore for JsonStorage {
    async fn get(&self, guild_id: GuildId) -> Result<GuildSettings> {
        // Verificar cache primero
        if let Some(settings) = self.servers_cache.read().get(&guild_id.get()) {
            return Ok(settings.clone());
        }
        Ok(GuildSettings::new(guild_id))
    }

    async fn set(&self, settings: GuildSettings) -> Result<()> {
        let guild_id = settings.guild_id;
        self.save_server_config(&settings).await?;
        self.servers_cache.write().insert(guild_id, settings);

        info!("💾 Configuración actualizada para guild {}", guild_id);
        Ok(())
    }
}
