//! # Audio Module
//!
//! Núcleo de reproducción por guild. El audio en sí lo envía un nodo
//! Lavalink; aquí vive todo lo que decide *qué* suena y *cuándo*.
//!
//! ## Architecture
//!
//! ### [`node`] - Audio Node Pool
//! - Conexión al nodo primario con failover al backup
//! - Heartbeat periódico y detección de nodos caídos
//! - Un único stream de eventos para todos los nodos
//!
//! ### [`registry`] - Session Registry
//! - Una [`session::GuildSession`] por guild, cada una con su propio lock
//! - Comandos de reproducción (play, skip, votos, pausa, stop, disconnect)
//!
//! ### [`events`] - Playback Event Router
//! - Aplica inicio/fin/error de tracks a la sesión correcta
//! - Descarta eventos obsoletos (sesión destruida, track ya reemplazado)
//!
//! ### [`queue`] - Queue Management
//! - FIFO con loop de track o de cola, shuffle y vista paginada
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guild_music::audio::{events::PlaybackEventRouter, registry::SessionRegistry};
//! use guild_music::sources::SearchSource;
//! use serenity::all::{ChannelId, GuildId, UserId};
//! use std::sync::Arc;
//!
//! # async fn example(registry: Arc<SessionRegistry>, events: tokio::sync::broadcast::Receiver<guild_music::audio::node::NodeEvent>) -> anyhow::Result<()> {
//! PlaybackEventRouter::new(registry.clone()).spawn(events, Default::default());
//!
//! let guild_id = GuildId::new(123456789);
//! registry
//!     .play(guild_id, UserId::new(1), ChannelId::new(2), "never gonna give you up", SearchSource::YouTube)
//!     .await?;
//! registry.pause(guild_id).await?;
//! registry.resume(guild_id).await?;
//! registry.skip(guild_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod lavalink;
pub mod node;
pub mod queue;
pub mod registry;
pub mod session;
pub mod track;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;
