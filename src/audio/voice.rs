use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::Songbird;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{MusicError, MusicResult};

/// Credenciales de voz que Discord entrega al unirse; el nodo las necesita
/// para enviar audio en nombre del bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConnection {
    pub channel_id: ChannelId,
    pub endpoint: String,
    pub session_id: String,
    pub token: String,
}

/// Conexión/desconexión de canales de voz.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<VoiceConnection>;

    async fn leave(&self, guild_id: GuildId) -> MusicResult<()>;
}

/// Songbird solo negocia el gateway de voz; el audio lo envía Lavalink.
pub struct SongbirdVoice {
    manager: Arc<Songbird>,
}

impl SongbirdVoice {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdVoice {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<VoiceConnection> {
        info!("🔗 Conectando al canal {} en guild {}", channel_id, guild_id);

        let (info, _call) = self
            .manager
            .join_gateway(guild_id, channel_id)
            .await
            .map_err(|e| MusicError::Voice(format!("{:?}", e)))?;

        Ok(VoiceConnection {
            channel_id,
            endpoint: info.endpoint,
            session_id: info.session_id,
            token: info.token,
        })
    }

    async fn leave(&self, guild_id: GuildId) -> MusicResult<()> {
        if self.manager.get(guild_id).is_none() {
            return Ok(());
        }

        if let Err(e) = self.manager.remove(guild_id).await {
            warn!("Error al salir del canal de voz en guild {}: {:?}", guild_id, e);
            return Err(MusicError::Voice(format!("{:?}", e)));
        }

        info!("👋 Desconectado del canal de voz en guild {}", guild_id);
        Ok(())
    }
}
