//! Registro de sesiones de reproducción, una por guild.
//!
//! Cada sesión vive detrás de su propio lock async: las operaciones de un
//! guild se serializan entre sí y nunca bloquean a otros guilds. Las
//! operaciones que destruyen la sesión cancelan su token *antes* de tomar el
//! lock, así que cualquier otra operación en vuelo (por ejemplo, esperando al
//! nodo) termina con `Cancelled` en lugar de revivir la sesión.

use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::node::{ActiveNode, AudioNodePool};
use crate::audio::queue::{LoopMode, QueueEntry};
use crate::audio::session::{GuildSession, SessionSnapshot, Toggle, VoteOutcome};
use crate::audio::track::Track;
use crate::audio::voice::VoiceGateway;
use crate::error::{MusicError, MusicResult};
use crate::presence::PresenceSink;
use crate::sources::{check_track, AutoplayStrategy, Resolved, SearchSource, SkipReason, TrackResolver};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub max_track_duration: Option<Duration>,
    pub autoplay_default: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_playlist_size: 100,
            max_track_duration: Some(Duration::from_secs(7200)),
            autoplay_default: false,
        }
    }
}

pub struct SessionHandle {
    id: u64,
    guild_id: GuildId,
    state: Mutex<GuildSession>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Toma el lock del guild. Si la sesión se destruye mientras se espera,
    /// devuelve `Cancelled`.
    pub async fn lock(&self) -> MusicResult<MutexGuard<'_, GuildSession>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MusicError::Cancelled),
            guard = self.state.lock() => Ok(guard),
        }
    }
}

/// Qué pasó al encolar un lote.
#[derive(Debug, Clone, Default)]
pub struct EnqueueReport {
    pub playlist: Option<String>,
    /// Posición en la cola (desde 1) y track.
    pub added: Vec<(usize, Arc<Track>)>,
    pub skipped: Vec<(Arc<Track>, SkipReason)>,
    /// Tracks de la playlist que excedían el máximo permitido.
    pub truncated: usize,
    /// Track que empezó a sonar por este comando.
    pub started: Option<Arc<Track>>,
}

pub struct SessionRegistry {
    sessions: DashMap<GuildId, Arc<SessionHandle>>,
    next_id: AtomicU64,
    pool: Arc<AudioNodePool>,
    resolver: Arc<TrackResolver>,
    voice: Arc<dyn VoiceGateway>,
    presence: Arc<dyn PresenceSink>,
    autoplay: Arc<dyn AutoplayStrategy>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(
        pool: Arc<AudioNodePool>,
        resolver: Arc<TrackResolver>,
        voice: Arc<dyn VoiceGateway>,
        presence: Arc<dyn PresenceSink>,
        autoplay: Arc<dyn AutoplayStrategy>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            pool,
            resolver,
            voice,
            presence,
            autoplay,
            settings,
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&guild_id).map(|entry| entry.value().clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn presence(&self) -> &Arc<dyn PresenceSink> {
        &self.presence
    }

    fn session(&self, guild_id: GuildId) -> MusicResult<Arc<SessionHandle>> {
        self.get(guild_id).ok_or(MusicError::NotInVoice)
    }

    fn get_or_create(&self, guild_id: GuildId) -> Arc<SessionHandle> {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                debug!("🆕 Sesión {} creada para guild {}", id, guild_id);
                Arc::new(SessionHandle {
                    id,
                    guild_id,
                    state: Mutex::new(GuildSession::new(
                        guild_id,
                        self.settings.max_queue_size,
                        self.settings.autoplay_default,
                    )),
                    cancel: CancellationToken::new(),
                })
            })
            .clone()
    }

    /// Conecta (o mueve) al bot al canal de voz indicado.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<()> {
        let handle = self.get_or_create(guild_id);
        let mut state = handle.lock().await?;
        self.ensure_voice(&handle, &mut state, channel_id).await
    }

    async fn ensure_voice(
        &self,
        handle: &SessionHandle,
        state: &mut GuildSession,
        channel_id: ChannelId,
    ) -> MusicResult<()> {
        match state.voice_channel() {
            Some(current) if current == channel_id => return Ok(()),
            Some(current) if state.is_active() => return Err(MusicError::WrongVoiceChannel(current.get())),
            _ => {}
        }

        let connection = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(MusicError::Cancelled),
            joined = self.voice.join(handle.guild_id, channel_id) => joined?,
        };
        state.bind_voice(connection);
        Ok(())
    }

    /// Resuelve la consulta (sin tomar el lock del guild) y encola el
    /// resultado.
    pub async fn play(
        self: &Arc<Self>,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: ChannelId,
        query: &str,
        source: SearchSource,
    ) -> MusicResult<EnqueueReport> {
        let resolved = self.resolver.resolve(query, source).await?;
        self.enqueue(guild_id, user_id, channel_id, resolved).await
    }

    pub async fn enqueue(
        self: &Arc<Self>,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: ChannelId,
        resolved: Resolved,
    ) -> MusicResult<EnqueueReport> {
        // el nodo se garantiza antes de tocar la cola
        self.pool.ensure_connected().await?;

        let handle = self.get_or_create(guild_id);
        let mut state = handle.lock().await?;
        self.ensure_voice(&handle, &mut state, channel_id).await?;
        if state.is_active() {
            self.live_node(&handle, &mut state).await?;
        }

        let mut report = EnqueueReport::default();
        let single = matches!(resolved, Resolved::Tracks(_));
        let mut tracks = match resolved {
            Resolved::Tracks(tracks) => tracks,
            Resolved::Playlist { name, tracks } => {
                report.playlist = Some(name);
                tracks
            }
        };
        if tracks.len() > self.settings.max_playlist_size {
            report.truncated = tracks.len() - self.settings.max_playlist_size;
            tracks.truncate(self.settings.max_playlist_size);
        }

        for track in tracks {
            if let Err(reason) = check_track(&track, state.queue(), self.settings.max_track_duration) {
                debug!("⏭️ {} omitido: {}", track.title, reason.describe());
                report.skipped.push((track, reason));
                continue;
            }
            let position = state.queue_mut().enqueue(track.clone(), user_id)?;
            report.added.push((position, track));
        }

        if single && report.added.is_empty() {
            if let Some((_, SkipReason::QueueFull)) = report.skipped.first() {
                return Err(MusicError::QueueFull(self.settings.max_queue_size));
            }
        }

        info!(
            "📥 Guild {}: {} agregados, {} omitidos",
            guild_id,
            report.added.len(),
            report.skipped.len()
        );

        if !state.is_active() && !report.added.is_empty() {
            report.started = self.start_next(&handle, &mut state, false).await?;
        }

        Ok(report)
    }

    pub async fn pause(&self, guild_id: GuildId) -> MusicResult<Toggle> {
        self.set_paused(guild_id, true).await
    }

    pub async fn resume(&self, guild_id: GuildId) -> MusicResult<Toggle> {
        self.set_paused(guild_id, false).await
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> MusicResult<Toggle> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;
        if !state.is_active() {
            return Err(MusicError::InvalidState("nothing is playing right now"));
        }
        let node = self.live_node(&handle, &mut state).await?;

        let toggle = state.set_paused(paused)?;
        if toggle == Toggle::Unchanged {
            return Ok(toggle);
        }

        if let Err(e) = node.transport().set_paused(guild_id, paused).await {
            // revertir: el nodo no aplicó el cambio
            state.set_paused(!paused)?;
            return Err(e);
        }

        info!("{} Guild {}", if paused { "⏸️ Pausado" } else { "▶️ Reanudado" }, guild_id);
        Ok(toggle)
    }

    pub async fn seek(&self, guild_id: GuildId, position: Duration) -> MusicResult<()> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;
        let current = state
            .current()
            .ok_or(MusicError::InvalidState("nothing is playing right now"))?;
        if current.is_stream {
            return Err(MusicError::InvalidState("live streams cannot be seeked"));
        }
        if position > current.duration() {
            return Err(MusicError::InvalidState("position is past the end of the track"));
        }

        let node = self.live_node(&handle, &mut state).await?;
        node.transport().seek(guild_id, position.as_millis() as u64).await
    }

    /// Skip forzado (DJ o único oyente). Devuelve lo que empezó a sonar.
    pub async fn skip(self: &Arc<Self>, guild_id: GuildId) -> MusicResult<Option<Arc<Track>>> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;
        if !state.is_active() {
            return Err(MusicError::InvalidState("nothing is playing right now"));
        }
        self.skip_locked(&handle, &mut state).await
    }

    /// Voto de skip. Si se alcanza el umbral se salta el track y el segundo
    /// valor trae lo que empezó a sonar.
    pub async fn vote_skip(
        self: &Arc<Self>,
        guild_id: GuildId,
        user_id: UserId,
        occupancy: usize,
    ) -> MusicResult<(VoteOutcome, Option<Arc<Track>>)> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;

        let outcome = state.cast_vote(user_id, occupancy)?;
        debug!("🗳️ Voto de {} en guild {}: {:?}", user_id, guild_id, outcome);
        if outcome != VoteOutcome::Passed {
            return Ok((outcome, None));
        }

        info!("🗳️ Votación aprobada en guild {}", guild_id);
        let next = self.skip_locked(&handle, &mut state).await?;
        Ok((outcome, next))
    }

    async fn skip_locked(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        state: &mut GuildSession,
    ) -> MusicResult<Option<Arc<Track>>> {
        let seed = self.seed(state);
        let next = self.start_next(handle, state, true).await?;
        if next.is_none() {
            self.stop_player(state).await;
            self.queue_drained(handle, state, seed);
        }
        Ok(next)
    }

    /// Fin natural del track actual (lo invoca el router de eventos).
    pub(crate) async fn track_finished(self: &Arc<Self>, handle: &Arc<SessionHandle>, state: &mut GuildSession) {
        let seed = self.seed(state);
        let next = state.advance(false);
        self.continue_with(handle, state, seed, next).await;
    }

    /// El nodo no pudo reproducir el track actual. Se avanza sin repetirlo;
    /// con `end_pending` el `TrackEnded` que llegue después se descarta.
    pub(crate) async fn track_failed(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        state: &mut GuildSession,
        end_pending: bool,
    ) {
        let seed = self.seed(state);
        let next = state.abandon_current(end_pending);
        if next.is_none() {
            self.stop_player(state).await;
        }
        self.continue_with(handle, state, seed, next).await;
    }

    async fn continue_with(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        state: &mut GuildSession,
        seed: Option<(Arc<Track>, UserId)>,
        next: Option<Arc<Track>>,
    ) {
        match self.start(handle, state, next).await {
            Ok(Some(_)) => {}
            Ok(None) => self.queue_drained(handle, state, seed),
            Err(MusicError::Cancelled) => debug!("Avance cancelado en guild {}", handle.guild_id),
            Err(e) => error!("❌ No se pudo iniciar el siguiente track en guild {}: {}", handle.guild_id, e),
        }
    }

    fn seed(&self, state: &GuildSession) -> Option<(Arc<Track>, UserId)> {
        state
            .queue()
            .current_entry()
            .map(|entry| (entry.track.clone(), entry.requested_by))
    }

    /// Avanza la cola y manda el siguiente track al nodo.
    async fn start_next(
        &self,
        handle: &SessionHandle,
        state: &mut GuildSession,
        skipping: bool,
    ) -> MusicResult<Option<Arc<Track>>> {
        let next = state.advance(skipping);
        self.start(handle, state, next).await
    }

    async fn start(
        &self,
        handle: &SessionHandle,
        state: &mut GuildSession,
        next: Option<Arc<Track>>,
    ) -> MusicResult<Option<Arc<Track>>> {
        let Some(track) = next else {
            return Ok(None);
        };

        if let Err(e) = self.dispatch(handle, state, &track).await {
            state.queue_mut().take_current();
            self.presence.idle(handle.guild_id);
            return Err(e);
        }
        Ok(Some(track))
    }

    async fn dispatch(&self, handle: &SessionHandle, state: &mut GuildSession, track: &Track) -> MusicResult<()> {
        let voice = state.voice().cloned().ok_or(MusicError::NotInVoice)?;

        let node = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(MusicError::Cancelled),
            node = self.pool.ensure_connected() => node?,
        };
        tokio::select! {
            _ = handle.cancel.cancelled() => return Err(MusicError::Cancelled),
            sent = node.transport().play(handle.guild_id, track, &voice) => sent?,
        }

        state.set_node_session(Some(node.session_id().to_string()));
        info!("🎵 Reproduciendo en guild {}: {}", handle.guild_id, track.title);
        Ok(())
    }

    /// La cola se agotó: queda en `ConnectedEmpty` y, con autoplay, se pide
    /// una sugerencia fuera del lock.
    fn queue_drained(self: &Arc<Self>, handle: &Arc<SessionHandle>, state: &GuildSession, seed: Option<(Arc<Track>, UserId)>) {
        self.presence.idle(handle.guild_id);

        if !state.autoplay() {
            return;
        }
        let Some((seed, requester)) = seed else {
            return;
        };
        tokio::spawn(self.clone().autoplay_from(handle.clone(), seed, requester));
    }

    async fn autoplay_from(self: Arc<Self>, handle: Arc<SessionHandle>, seed: Arc<Track>, requester: UserId) {
        let suggestion = match self.autoplay.suggest_next(&seed).await {
            Ok(Some(track)) => Arc::new(track),
            Ok(None) => return,
            Err(e) => {
                warn!("🤖 Autoplay falló en guild {}: {}", handle.guild_id, e);
                return;
            }
        };

        let Ok(mut state) = handle.lock().await else {
            return;
        };
        // mientras se buscaba pudo llegar un play, un stop o un disconnect
        if state.is_active() || !state.autoplay() || state.voice().is_none() {
            debug!("Sugerencia de autoplay descartada en guild {}", handle.guild_id);
            return;
        }

        state.begin(suggestion.clone(), requester);
        if let Err(e) = self.dispatch(&handle, &mut state, &suggestion).await {
            error!("❌ Autoplay no pudo reproducir {}: {}", suggestion.title, e);
            state.queue_mut().take_current();
        }
    }

    /// Stop forzado: vacía la cola, apaga autoplay y deja la sesión en
    /// `Idle`. Devuelve cuántos tracks había en cola.
    pub async fn stop(&self, guild_id: GuildId) -> MusicResult<usize> {
        let cleared = self.teardown(guild_id, "stop").await.ok_or(MusicError::NotInVoice)?;
        info!("⏹️ Reproducción detenida en guild {} ({} en cola)", guild_id, cleared);
        Ok(cleared)
    }

    async fn stop_player(&self, state: &GuildSession) {
        if let Ok(node) = self.player_node(state) {
            if let Err(e) = node.transport().stop(state.guild_id()).await {
                warn!("Error deteniendo el player de guild {}: {}", state.guild_id(), e);
            }
        }
    }

    /// Nodo sano para el player del guild. Si el player quedó en un nodo que
    /// ya no está (failover), el track actual se vuelve a mandar al nodo nuevo.
    async fn live_node(&self, handle: &SessionHandle, state: &mut GuildSession) -> MusicResult<Arc<ActiveNode>> {
        let node = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(MusicError::Cancelled),
            node = self.pool.ensure_connected() => node?,
        };
        if !state.is_active() || state.node_session() == Some(node.session_id()) {
            return Ok(node);
        }

        if let Some(track) = state.restart_current() {
            warn!("♻️ Player de guild {} perdido con su nodo, reanudando {}", handle.guild_id, track.title);
            self.start(handle, state, Some(track)).await?;
        }
        Ok(node)
    }

    /// Nodo donde vive el player de este guild.
    fn player_node(&self, state: &GuildSession) -> MusicResult<Arc<ActiveNode>> {
        let node = self.pool.get_node()?;
        match state.node_session() {
            Some(session) if session == node.session_id() => Ok(node),
            _ => Err(MusicError::NoNodeAvailable),
        }
    }

    pub async fn disconnect(&self, guild_id: GuildId) -> MusicResult<()> {
        self.teardown(guild_id, "comando")
            .await
            .map(|_| ())
            .ok_or(MusicError::NotInVoice)
    }

    /// El bot fue sacado del canal (kick, canal borrado).
    pub async fn on_bot_disconnected(&self, guild_id: GuildId) {
        if self.teardown(guild_id, "desconexión externa").await.is_some() {
            warn!("🔌 Bot desconectado de la voz en guild {}", guild_id);
        }
    }

    /// Ocupación humana del canal donde está el bot; sin oyentes se sale.
    pub async fn on_voice_occupancy(&self, guild_id: GuildId, channel_id: ChannelId, listeners: usize) {
        if listeners > 0 {
            return;
        }
        let Some(handle) = self.get(guild_id) else {
            return;
        };
        let in_channel = match handle.lock().await {
            Ok(state) => state.voice_channel() == Some(channel_id),
            Err(_) => false,
        };
        if in_channel {
            info!("👋 Canal {} vacío, saliendo de guild {}", channel_id, guild_id);
            self.teardown(guild_id, "canal vacío").await;
        }
    }

    /// Destruye la sesión: cancela operaciones en vuelo, borra el player del
    /// nodo y sale de la voz. Devuelve cuántos tracks quedaban en cola, o
    /// `None` si no había sesión.
    async fn teardown(&self, guild_id: GuildId, reason: &str) -> Option<usize> {
        let (_, handle) = self.sessions.remove(&guild_id)?;
        // cancelar antes del lock: quien lo tenga (un play en vuelo) lo suelta
        handle.cancel.cancel();

        let (node_session, cleared) = {
            let mut state = handle.state.lock().await;
            let session = state.node_session().map(str::to_string);
            (session, state.reset())
        };

        if let (Ok(node), Some(session)) = (self.pool.get_node(), node_session) {
            if node.session_id() == session {
                if let Err(e) = node.transport().destroy(guild_id).await {
                    warn!("Error destruyendo el player de guild {}: {}", guild_id, e);
                }
            }
        }
        if let Err(e) = self.voice.leave(guild_id).await {
            warn!("Error saliendo de la voz en guild {}: {}", guild_id, e);
        }
        self.presence.idle(guild_id);

        info!("🧹 Sesión {} de guild {} destruida ({})", handle.id, guild_id, reason);
        Some(cleared)
    }

    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            self.teardown(guild_id, "apagado").await;
        }
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> MusicResult<()> {
        let handle = self.session(guild_id)?;
        handle.lock().await?.set_loop_mode(mode);
        Ok(())
    }

    pub async fn set_autoplay(&self, guild_id: GuildId, enabled: bool) -> MusicResult<()> {
        let handle = self.session(guild_id)?;
        handle.lock().await?.set_autoplay(enabled);
        Ok(())
    }

    pub async fn remove(&self, guild_id: GuildId, position: usize) -> MusicResult<Arc<Track>> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;
        state.queue_mut().remove(position)
    }

    pub async fn remove_by_title(&self, guild_id: GuildId, title: &str) -> MusicResult<Arc<Track>> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;
        state
            .queue_mut()
            .remove_by_title(title)
            .ok_or_else(|| MusicError::NoResults(title.to_string()))
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> MusicResult<usize> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;
        state.queue_mut().shuffle();
        Ok(state.queue().len())
    }

    pub async fn clear_queue(&self, guild_id: GuildId) -> MusicResult<usize> {
        let handle = self.session(guild_id)?;
        let mut state = handle.lock().await?;
        Ok(state.queue_mut().clear())
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> Option<SessionSnapshot> {
        let handle = self.get(guild_id)?;
        let state = handle.lock().await.ok()?;
        Some(state.snapshot())
    }

    /// Track actual junto con quién lo pidió y cuándo.
    pub async fn now_playing(&self, guild_id: GuildId) -> Option<QueueEntry> {
        let handle = self.get(guild_id)?;
        let state = handle.lock().await.ok()?;
        state.queue().current_entry().cloned()
    }

    pub async fn voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let handle = self.get(guild_id)?;
        let state = handle.lock().await.ok()?;
        state.voice_channel()
    }
}
