//! # Bot Module
//!
//! Glue con el gateway de Discord.
//!
//! - `ready`: activa la presencia y conecta el pool de nodos en segundo plano
//! - `voice_state_update`: desconexiones forzadas del bot y auto-salida
//!   cuando el último oyente humano deja el canal
//!
//! Los comandos llegan ya tipados a [`commands::MusicCommands`]; el parseo y
//! el registro de slash commands no viven aquí.

use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Ready, UserId, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info};

pub mod commands;

use crate::audio::node::AudioNodePool;
use crate::audio::registry::SessionRegistry;
use crate::presence::DiscordPresence;

pub struct MusicBot {
    registry: Arc<SessionRegistry>,
    pool: Arc<AudioNodePool>,
    presence: Arc<DiscordPresence>,
    commands: Arc<commands::MusicCommands>,
}

impl MusicBot {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pool: Arc<AudioNodePool>,
        presence: Arc<DiscordPresence>,
        commands: Arc<commands::MusicCommands>,
    ) -> Self {
        Self {
            registry,
            pool,
            presence,
            commands,
        }
    }

    /// Punto de entrada para la capa que traduce interacciones a intents.
    pub fn commands(&self) -> &Arc<commands::MusicCommands> {
        &self.commands
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        self.presence.attach(ctx);

        let pool = self.pool.clone();
        tokio::spawn(async move {
            match pool.ensure_connected().await {
                Ok(node) => info!("✅ Nodo de audio listo: {}", node.name()),
                Err(e) => error!("❌ Ningún nodo de audio disponible al iniciar: {}", e),
            }
        });
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let bot_id = ctx.cache.current_user().id;

        // Detectar si el bot fue desconectado
        if new.user_id == bot_id {
            if old.is_some() && new.channel_id.is_none() {
                info!("🔌 Bot desconectado en guild {}", guild_id);
                self.registry.on_bot_disconnected(guild_id).await;
            }
            return;
        }

        // Auto-desconectar si el bot queda sin oyentes
        let Some(bot_channel) = self.registry.voice_channel(guild_id).await else {
            return;
        };
        let left_bot_channel = old.as_ref().and_then(|o| o.channel_id) == Some(bot_channel)
            && new.channel_id != Some(bot_channel);
        if !left_bot_channel {
            return;
        }

        let Some(listeners) = listeners_in(&ctx, guild_id, bot_channel, bot_id) else {
            debug!("Guild {} no está en caché", guild_id);
            return;
        };
        self.registry
            .on_voice_occupancy(guild_id, bot_channel, listeners)
            .await;
    }
}

/// Oyentes humanos en un canal según la caché. El `GuildRef` no debe
/// sobrevivir a ningún `.await`.
pub fn listeners_in(ctx: &Context, guild_id: GuildId, channel_id: ChannelId, bot_id: UserId) -> Option<usize> {
    let guild = ctx.cache.guild(guild_id)?;
    let count = guild
        .voice_states
        .values()
        .filter(|state| state.channel_id == Some(channel_id))
        .filter(|state| state.user_id != bot_id)
        .filter(|state| !state.member.as_ref().is_some_and(|m| m.user.bot))
        .count();
    Some(count)
}
