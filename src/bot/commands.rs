//! Superficie de comandos: intents tipados sobre un snapshot de quien invoca.
//!
//! El parseo, el registro de slash commands y el renderizado de embeds viven
//! fuera de este crate; aquí solo se validan permisos/canales y se delega en
//! el [`SessionRegistry`].

use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::queue::{LoopMode, QueueEntry, QueuePage};
use crate::audio::registry::{EnqueueReport, SessionRegistry};
use crate::audio::session::{Toggle, VoteOutcome};
use crate::audio::track::{format_length, Track};
use crate::error::{MusicError, MusicResult};
use crate::sources::{SearchSource, TrackResolver};
use crate::storage::{GuildSettings, GuildStore};

/// Candidatos que devuelve `search`.
pub const SEARCH_RESULTS: usize = 5;

/// Quién invoca y desde dónde, tal como lo ve el gateway.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub text_channel: ChannelId,
    /// Canal de voz del usuario, si está en uno.
    pub voice_channel: Option<ChannelId>,
    /// Oyentes humanos en ese canal de voz (incluye a quien invoca).
    pub occupancy: usize,
    pub roles: Vec<RoleId>,
    /// Administrador del guild.
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MusicIntent {
    Play { query: String, source: SearchSource },
    Search { query: String, source: SearchSource },
    Join,
    Pause,
    Resume,
    Skip,
    Stop,
    Disconnect,
    Loop(LoopMode),
    Autoplay(bool),
    Remove(usize),
    RemoveTitle(String),
    Shuffle,
    Clear,
    Queue { page: usize },
    NowPlaying,
    Seek(Duration),
    SetMusicChannel(Option<ChannelId>),
    SetDjRole(Option<RoleId>),
}

impl MusicIntent {
    /// Solo lectura: no exige estar en voz.
    fn is_read_only(&self) -> bool {
        matches!(
            self,
            MusicIntent::Search { .. } | MusicIntent::Queue { .. } | MusicIntent::NowPlaying
        )
    }

    fn is_settings(&self) -> bool {
        matches!(self, MusicIntent::SetMusicChannel(_) | MusicIntent::SetDjRole(_))
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Enqueued(EnqueueReport),
    SearchResults(Vec<Arc<Track>>),
    Joined(ChannelId),
    Paused(Toggle),
    Resumed(Toggle),
    Skipped { next: Option<Arc<Track>> },
    Voted(VoteOutcome),
    Stopped { cleared: usize },
    Disconnected,
    LoopSet(LoopMode),
    AutoplaySet(bool),
    Removed(Arc<Track>),
    Shuffled(usize),
    Cleared(usize),
    Queue {
        current: Option<Arc<Track>>,
        page: Option<QueuePage>,
    },
    NowPlaying(Option<QueueEntry>),
    Seeked(Duration),
    SettingsUpdated(GuildSettings),
}

impl Reply {
    /// Texto plano para la capa de presentación.
    pub fn summary(&self) -> String {
        match self {
            Reply::Enqueued(report) => enqueue_summary(report),
            Reply::SearchResults(tracks) => {
                let mut out = String::from("🔍 Results:");
                for (i, track) in tracks.iter().enumerate() {
                    let _ = write!(out, "\n{}. {} - {} [{}]", i + 1, track.title, track.author, track.format_length());
                }
                out
            }
            Reply::Joined(channel) => format!("🔊 Joined <#{}>", channel),
            Reply::Paused(Toggle::Changed) => "⏸️ Paused".to_string(),
            Reply::Paused(Toggle::Unchanged) => "Already paused".to_string(),
            Reply::Resumed(Toggle::Changed) => "▶️ Resumed".to_string(),
            Reply::Resumed(Toggle::Unchanged) => "Not paused".to_string(),
            Reply::Skipped { next: Some(track) } => format!("⏭️ Skipped, now playing **{}**", track.title),
            Reply::Skipped { next: None } => "⏭️ Skipped, the queue is empty".to_string(),
            Reply::Voted(VoteOutcome::Recorded { votes, needed }) => {
                format!("🗳️ Vote recorded ({votes}/{needed})")
            }
            Reply::Voted(VoteOutcome::AlreadyVoted { votes, needed }) => {
                format!("You already voted ({votes}/{needed})")
            }
            Reply::Voted(VoteOutcome::Passed) => "⏭️ Vote passed".to_string(),
            Reply::Stopped { cleared } => format!("⏹️ Stopped and cleared {} tracks", cleared),
            Reply::Disconnected => "👋 Disconnected".to_string(),
            Reply::LoopSet(mode) => format!("🔁 Loop: {}", mode.label()),
            Reply::AutoplaySet(enabled) => {
                format!("🤖 Autoplay {}", if *enabled { "enabled" } else { "disabled" })
            }
            Reply::Removed(track) => format!("❌ Removed **{}**", track.title),
            Reply::Shuffled(len) => format!("🔀 Shuffled {} tracks", len),
            Reply::Cleared(len) => format!("🗑️ Cleared {} tracks", len),
            Reply::Queue { current, page } => queue_summary(current.as_deref(), page.as_ref()),
            Reply::NowPlaying(Some(entry)) => {
                let track = &entry.track;
                format!(
                    "🎵 Now playing **{}** by {} [{}]\n👤 Requested by <@{}> at {}",
                    track.title,
                    track.author,
                    track.format_length(),
                    entry.requested_by,
                    entry.added_at.format("%H:%M UTC")
                )
            }
            Reply::NowPlaying(None) => "Nothing is playing".to_string(),
            Reply::Seeked(position) => format!("⏩ Seeked to {}", format_length(position.as_millis() as u64)),
            Reply::SettingsUpdated(_) => "⚙️ Settings updated".to_string(),
        }
    }
}

fn enqueue_summary(report: &EnqueueReport) -> String {
    let mut out = match (&report.playlist, report.added.as_slice()) {
        (Some(name), added) => format!("📃 Added {} tracks from **{}**", added.len(), name),
        (None, [(position, track)]) => format!("➕ Added **{}** at position {}", track.title, position),
        (None, _) => "Nothing was added".to_string(),
    };
    if let Some(track) = &report.started {
        let _ = write!(out, "\n🎵 Now playing **{}**", track.title);
    }
    for (track, reason) in &report.skipped {
        let _ = write!(out, "\n⚠️ Skipped **{}**: {}", track.title, reason.describe());
    }
    if report.truncated > 0 {
        let _ = write!(out, "\n⚠️ {} tracks over the playlist limit were ignored", report.truncated);
    }
    out
}

fn queue_summary(current: Option<&Track>, page: Option<&QueuePage>) -> String {
    let mut out = match current {
        Some(track) => format!("🎵 Now: **{}** [{}]", track.title, track.format_length()),
        None => "Nothing is playing".to_string(),
    };
    match page {
        Some(page) => {
            for (offset, track) in page.items.iter().enumerate() {
                let _ = write!(
                    out,
                    "\n{}. {} [{}]",
                    page.first_position + offset,
                    track.title,
                    track.format_length()
                );
            }
            let _ = write!(out, "\nPage {}/{}", page.number, page.total_pages);
        }
        None => out.push_str("\nThe queue is empty"),
    }
    out
}

pub struct MusicCommands {
    registry: Arc<SessionRegistry>,
    resolver: Arc<TrackResolver>,
    store: Arc<dyn GuildStore>,
}

impl MusicCommands {
    pub fn new(registry: Arc<SessionRegistry>, resolver: Arc<TrackResolver>, store: Arc<dyn GuildStore>) -> Self {
        Self {
            registry,
            resolver,
            store,
        }
    }

    pub async fn execute(&self, invocation: &Invocation, intent: MusicIntent) -> MusicResult<Reply> {
        let guild_id = invocation.guild_id;
        debug!("🎛️ {:?} de {} en guild {}", intent, invocation.user_id, guild_id);

        let settings = self.settings(guild_id).await;
        let dj = is_dj(invocation, &settings);

        if intent.is_settings() {
            if !dj {
                return Err(MusicError::InvalidState("only DJs can change music settings"));
            }
        } else {
            self.check_channels(invocation, &intent, &settings).await?;
        }

        match intent {
            MusicIntent::Play { query, source } => {
                let channel = invocation.voice_channel.ok_or(MusicError::NotInVoice)?;
                let report = self
                    .registry
                    .play(guild_id, invocation.user_id, channel, &query, source)
                    .await?;
                Ok(Reply::Enqueued(report))
            }
            MusicIntent::Search { query, source } => {
                let tracks = self.resolver.search(&query, source, SEARCH_RESULTS).await?;
                Ok(Reply::SearchResults(tracks))
            }
            MusicIntent::Join => {
                let channel = invocation.voice_channel.ok_or(MusicError::NotInVoice)?;
                self.registry.join(guild_id, channel).await?;
                Ok(Reply::Joined(channel))
            }
            MusicIntent::Pause => Ok(Reply::Paused(self.registry.pause(guild_id).await?)),
            MusicIntent::Resume => Ok(Reply::Resumed(self.registry.resume(guild_id).await?)),
            MusicIntent::Skip => {
                if dj {
                    let next = self.registry.skip(guild_id).await?;
                    return Ok(Reply::Skipped { next });
                }
                let (outcome, next) = self
                    .registry
                    .vote_skip(guild_id, invocation.user_id, invocation.occupancy)
                    .await?;
                match outcome {
                    VoteOutcome::Passed => Ok(Reply::Skipped { next }),
                    other => Ok(Reply::Voted(other)),
                }
            }
            MusicIntent::Stop => {
                require_control(dj, invocation)?;
                let cleared = self.registry.stop(guild_id).await?;
                Ok(Reply::Stopped { cleared })
            }
            MusicIntent::Disconnect => {
                require_control(dj, invocation)?;
                self.registry.disconnect(guild_id).await?;
                Ok(Reply::Disconnected)
            }
            MusicIntent::Loop(mode) => {
                self.registry.set_loop_mode(guild_id, mode).await?;
                Ok(Reply::LoopSet(mode))
            }
            MusicIntent::Autoplay(enabled) => {
                self.registry.set_autoplay(guild_id, enabled).await?;
                Ok(Reply::AutoplaySet(enabled))
            }
            MusicIntent::Remove(position) => Ok(Reply::Removed(self.registry.remove(guild_id, position).await?)),
            MusicIntent::RemoveTitle(title) => Ok(Reply::Removed(
                self.registry.remove_by_title(guild_id, &title).await?,
            )),
            MusicIntent::Shuffle => Ok(Reply::Shuffled(self.registry.shuffle(guild_id).await?)),
            MusicIntent::Clear => Ok(Reply::Cleared(self.registry.clear_queue(guild_id).await?)),
            MusicIntent::Queue { page } => {
                let snapshot = self.registry.snapshot(guild_id).await.ok_or(MusicError::NotInVoice)?;
                let current = snapshot.queue.current.clone();
                let page = snapshot.queue.page(page.max(1));
                Ok(Reply::Queue { current, page })
            }
            MusicIntent::NowPlaying => Ok(Reply::NowPlaying(self.registry.now_playing(guild_id).await)),
            MusicIntent::Seek(position) => {
                self.registry.seek(guild_id, position).await?;
                Ok(Reply::Seeked(position))
            }
            MusicIntent::SetMusicChannel(channel) => {
                let mut settings = settings;
                settings.music_channel_id = channel.map(|c| c.get());
                self.save(settings).await
            }
            MusicIntent::SetDjRole(role) => {
                let mut settings = settings;
                settings.dj_role_id = role.map(|r| r.get());
                self.save(settings).await
            }
        }
    }

    async fn settings(&self, guild_id: GuildId) -> GuildSettings {
        match self.store.get(guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Error leyendo configuración de guild {}: {}", guild_id, e);
                GuildSettings::new(guild_id)
            }
        }
    }

    async fn save(&self, settings: GuildSettings) -> MusicResult<Reply> {
        self.store
            .set(settings.clone())
            .await
            .map_err(|e| MusicError::Transport(e.to_string()))?;
        Ok(Reply::SettingsUpdated(settings))
    }

    /// Canal de música configurado, usuario en voz y en el mismo canal que el bot.
    async fn check_channels(
        &self,
        invocation: &Invocation,
        intent: &MusicIntent,
        settings: &GuildSettings,
    ) -> MusicResult<()> {
        if let Some(music_channel) = settings.music_channel_id {
            if invocation.text_channel.get() != music_channel {
                return Err(MusicError::WrongTextChannel(music_channel));
            }
        }

        if intent.is_read_only() {
            return Ok(());
        }

        let user_channel = invocation.voice_channel.ok_or(MusicError::NotInVoice)?;
        if let Some(bot_channel) = self.registry.voice_channel(invocation.guild_id).await {
            if bot_channel != user_channel {
                return Err(MusicError::WrongVoiceChannel(bot_channel.get()));
            }
        }
        Ok(())
    }
}

fn is_dj(invocation: &Invocation, settings: &GuildSettings) -> bool {
    invocation.privileged
        || settings
            .dj_role_id
            .is_some_and(|role| invocation.roles.contains(&RoleId::new(role)))
}

/// Stop y disconnect: DJ, o quien está solo con el bot.
fn require_control(dj: bool, invocation: &Invocation) -> MusicResult<()> {
    if dj || invocation.occupancy <= 1 {
        Ok(())
    } else {
        Err(MusicError::InvalidState("only DJs can do that while others are listening"))
    }
}
