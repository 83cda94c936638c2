use parking_lot::RwLock;
use serenity::all::{ActivityData, Context};
use serenity::model::id::GuildId;
use tracing::debug;

use crate::audio::track::Track;

const IDLE_ACTIVITY: &str = "/play";

/// Destino de los cambios de "now playing" (la actividad del bot).
pub trait PresenceSink: Send + Sync {
    fn now_playing(&self, guild_id: GuildId, track: &Track);

    fn idle(&self, guild_id: GuildId);
}

/// Actividad de Discord. Hasta que llega `ready` no hay `Context` y las
/// actualizaciones se descartan.
#[derive(Default)]
pub struct DiscordPresence {
    ctx: RwLock<Option<Context>>,
}

impl DiscordPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, ctx: Context) {
        ctx.set_activity(Some(ActivityData::listening(IDLE_ACTIVITY)));
        *self.ctx.write() = Some(ctx);
    }
}

impl PresenceSink for DiscordPresence {
    fn now_playing(&self, guild_id: GuildId, track: &Track) {
        if let Some(ctx) = self.ctx.read().as_ref() {
            debug!("🎧 Presencia: {} (guild {})", track.title, guild_id);
            ctx.set_activity(Some(ActivityData::listening(track.title.clone())));
        }
    }

    fn idle(&self, guild_id: GuildId) {
        if let Some(ctx) = self.ctx.read().as_ref() {
            debug!("💤 Presencia en reposo (guild {})", guild_id);
            ctx.set_activity(Some(ActivityData::listening(IDLE_ACTIVITY)));
        }
    }
}
