use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info};

use crate::audio::queue::{LoopMode, MusicQueue, QueueSnapshot};
use crate::audio::track::Track;
use crate::audio::voice::VoiceConnection;
use crate::error::{MusicError, MusicResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Sin canal de voz.
    Idle,
    /// En un canal, sin nada sonando.
    ConnectedEmpty,
    Playing,
    Paused,
}

/// Resultado de pausar/reanudar: pedir el estado en el que ya se está no es
/// un error, solo se informa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded { votes: usize, needed: usize },
    AlreadyVoted { votes: usize, needed: usize },
    /// Se alcanzó el umbral; el ledger queda vacío.
    Passed,
}

/// Votos de skip del track actual. Se vacía en cada cambio de track.
#[derive(Debug, Default)]
pub struct VoteLedger {
    voters: HashSet<UserId>,
}

impl VoteLedger {
    pub fn threshold(occupancy: usize) -> usize {
        occupancy / 2
    }

    /// Un voto nuevo se evalúa contra los votos ya registrados: si estos
    /// alcanzan el umbral, el skip procede. Quien repite nunca dispara el skip.
    pub fn cast(&mut self, user: UserId, occupancy: usize) -> VoteOutcome {
        let needed = Self::threshold(occupancy);

        if self.voters.contains(&user) {
            return VoteOutcome::AlreadyVoted {
                votes: self.voters.len(),
                needed,
            };
        }

        if self.voters.len() >= needed {
            self.clear();
            return VoteOutcome::Passed;
        }

        self.voters.insert(user);

        VoteOutcome::Recorded {
            votes: self.voters.len(),
            needed,
        }
    }

    pub fn clear(&mut self) {
        if !self.voters.is_empty() {
            debug!("🗳️ Votos de skip reiniciados ({})", self.voters.len());
        }
        self.voters.clear();
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }
}

/// Estado de reproducción de un guild.
///
/// Solo se toca con el lock del guild tomado (ver `SessionHandle`), así que
/// todos los métodos son síncronos: las llamadas de red las hace el registry.
#[derive(Debug)]
pub struct GuildSession {
    guild_id: GuildId,
    voice: Option<VoiceConnection>,
    queue: MusicQueue,
    paused: bool,
    autoplay: bool,
    votes: VoteLedger,
    /// Sesión del nodo donde vive el player actual.
    node_session: Option<String>,
    /// Track que falló en el nodo y cuyo `TrackEnded` todavía no llegó.
    abandoned: Option<String>,
}

impl GuildSession {
    pub fn new(guild_id: GuildId, max_queue_size: usize, autoplay: bool) -> Self {
        Self {
            guild_id,
            voice: None,
            queue: MusicQueue::new(max_queue_size),
            paused: false,
            autoplay,
            votes: VoteLedger::default(),
            node_session: None,
            abandoned: None,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn state(&self) -> SessionState {
        match (&self.voice, self.queue.current(), self.paused) {
            (None, _, _) => SessionState::Idle,
            (Some(_), None, _) => SessionState::ConnectedEmpty,
            (Some(_), Some(_), true) => SessionState::Paused,
            (Some(_), Some(_), false) => SessionState::Playing,
        }
    }

    pub fn is_active(&self) -> bool {
        self.queue.current().is_some()
    }

    pub fn bind_voice(&mut self, connection: VoiceConnection) {
        info!(
            "🔗 Guild {} vinculado al canal de voz {}",
            self.guild_id, connection.channel_id
        );
        self.voice = Some(connection);
    }

    pub fn voice(&self) -> Option<&VoiceConnection> {
        self.voice.as_ref()
    }

    pub fn voice_channel(&self) -> Option<ChannelId> {
        self.voice.as_ref().map(|v| v.channel_id)
    }

    pub fn queue(&self) -> &MusicQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MusicQueue {
        &mut self.queue
    }

    pub fn current(&self) -> Option<&Arc<Track>> {
        self.queue.current()
    }

    pub fn node_session(&self) -> Option<&str> {
        self.node_session.as_deref()
    }

    pub fn set_node_session(&mut self, session: Option<String>) {
        self.node_session = session;
    }

    pub fn autoplay(&self) -> bool {
        self.autoplay
    }

    pub fn set_autoplay(&mut self, enabled: bool) {
        self.autoplay = enabled;
        info!(
            "🤖 Autoplay {} en guild {}",
            if enabled { "activado" } else { "desactivado" },
            self.guild_id
        );
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.queue.loop_mode()
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.queue.set_loop_mode(mode);
    }

    pub fn votes(&self) -> &VoteLedger {
        &self.votes
    }

    pub fn cast_vote(&mut self, user: UserId, occupancy: usize) -> MusicResult<VoteOutcome> {
        if !self.is_active() {
            return Err(MusicError::InvalidState("nothing is playing right now"));
        }
        Ok(self.votes.cast(user, occupancy))
    }

    /// Avanza al siguiente track (fin natural o skip). Cambiar de track
    /// siempre vacía los votos.
    pub fn advance(&mut self, skipping: bool) -> Option<Arc<Track>> {
        self.votes.clear();
        self.paused = false;
        if skipping {
            self.queue.skip()
        } else {
            self.queue.dequeue_next()
        }
    }

    /// El nodo no pudo reproducir el track actual. Sale de la rotación (ni
    /// repeat ni loop de cola lo devuelven) y se pasa al siguiente. Con
    /// `end_pending`, el `TrackEnded` que el nodo mande después para ese track
    /// queda marcado como eco.
    pub fn abandon_current(&mut self, end_pending: bool) -> Option<Arc<Track>> {
        if let Some(failed) = self.queue.take_current() {
            debug!("🚫 {} sale de la rotación en guild {}", failed.title, self.guild_id);
            if end_pending {
                self.abandoned = Some(failed.key().to_string());
            }
        }
        self.advance(true)
    }

    /// `true` si `track` es el abandonado; consume la marca.
    pub fn take_abandoned_end(&mut self, track: &Track) -> bool {
        if self.abandoned.as_deref() == Some(track.key()) {
            self.abandoned = None;
            return true;
        }
        false
    }

    /// El player se perdió con su nodo: el track actual empieza de nuevo.
    pub fn restart_current(&mut self) -> Option<Arc<Track>> {
        self.votes.clear();
        self.paused = false;
        self.node_session = None;
        self.queue.current().cloned()
    }

    /// Inicia un track que no pasó por la cola (autoplay).
    pub fn begin(&mut self, track: Arc<Track>, requested_by: UserId) {
        self.votes.clear();
        self.paused = false;
        self.queue.set_current(track, requested_by);
    }

    /// El nodo confirmó el inicio del track.
    pub fn track_started(&mut self) {
        self.votes.clear();
    }

    pub fn set_paused(&mut self, paused: bool) -> MusicResult<Toggle> {
        if !self.is_active() {
            return Err(MusicError::InvalidState("nothing is playing right now"));
        }
        if self.paused == paused {
            return Ok(Toggle::Unchanged);
        }
        self.paused = paused;
        Ok(Toggle::Changed)
    }

    /// Detiene lo que suena y limpia la cola. Devuelve cuántos tracks había.
    pub fn stop(&mut self) -> usize {
        self.votes.clear();
        self.paused = false;
        self.queue.take_current();
        self.queue.clear()
    }

    /// Transición a `Idle`: suelta la voz y todo el estado de reproducción.
    /// Devuelve cuántos tracks quedaban en cola.
    pub fn reset(&mut self) -> usize {
        let cleared = self.stop();
        self.voice = None;
        self.node_session = None;
        self.abandoned = None;
        cleared
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            voice_channel: self.voice_channel(),
            autoplay: self.autoplay,
            votes: self.votes.len(),
            queue: self.queue.snapshot(),
        }
    }
}

/// Vista de solo lectura para la UI.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub voice_channel: Option<ChannelId>,
    pub autoplay: bool,
    pub votes: usize,
    pub queue: QueueSnapshot,
}
