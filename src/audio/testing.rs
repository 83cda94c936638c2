//! Dobles de prueba compartidos por los tests del crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::node::{LoadResult, NodeConnection, NodeConnector, NodeDescriptor, NodeEvent, NodeTransport};
use crate::audio::track::Track;
use crate::audio::voice::{VoiceConnection, VoiceGateway};
use crate::error::{MusicError, MusicResult};
use crate::presence::PresenceSink;
use crate::sources::AutoplayStrategy;

/// Nodo en memoria que registra cada llamada como texto.
pub struct FakeTransport {
    session: String,
    calls: Mutex<Vec<String>>,
    load_result: Mutex<LoadResult>,
    fail_heartbeats: AtomicBool,
    fail_play: AtomicBool,
}

impl FakeTransport {
    pub fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
            calls: Mutex::new(Vec::new()),
            load_result: Mutex::new(LoadResult::Empty),
            fail_heartbeats: AtomicBool::new(false),
            fail_play: AtomicBool::new(false),
        }
    }

    pub fn fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    pub fn fail_play(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_result(&self, result: LoadResult) {
        *self.load_result.lock() = result;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Identificadores enviados con `play`, en orden.
    pub fn played(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| c.strip_prefix("play ").map(|rest| rest.split(' ').nth(1).unwrap_or("").to_string()))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl NodeTransport for FakeTransport {
    fn session_id(&self) -> &str {
        &self.session
    }

    async fn heartbeat(&self) -> MusicResult<()> {
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(MusicError::Transport("heartbeat refused".to_string()));
        }
        Ok(())
    }

    async fn load_tracks(&self, identifier: &str) -> MusicResult<LoadResult> {
        self.record(format!("load {identifier}"));
        Ok(self.load_result.lock().clone())
    }

    async fn play(&self, guild_id: GuildId, track: &Track, _voice: &VoiceConnection) -> MusicResult<()> {
        self.record(format!("play {} {}", guild_id, track.identifier));
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(MusicError::Transport("player update rejected".to_string()));
        }
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> MusicResult<()> {
        self.record(format!("stop {guild_id}"));
        Ok(())
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> MusicResult<()> {
        self.record(format!("pause {guild_id} {paused}"));
        Ok(())
    }

    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> MusicResult<()> {
        self.record(format!("seek {guild_id} {position_ms}"));
        Ok(())
    }

    async fn destroy(&self, guild_id: GuildId) -> MusicResult<()> {
        self.record(format!("destroy {guild_id}"));
        Ok(())
    }
}

/// Conector que entrega siempre el mismo transporte hasta que se cambia con
/// `reconnect_to`. Guarda los emisores de eventos para que el nodo no se
/// marque caído.
pub struct FakeConnector {
    transport: Mutex<Arc<FakeTransport>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<NodeEvent>>>,
}

impl FakeConnector {
    pub fn new(transport: Arc<FakeTransport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Transporte que recibirá la próxima conexión.
    pub fn reconnect_to(&self, transport: Arc<FakeTransport>) {
        *self.transport.lock() = transport;
    }

    /// Cierra los streams de eventos: el pool marca el nodo como caído.
    pub fn close_streams(&self) {
        self.senders.lock().clear();
    }
}

#[async_trait]
impl NodeConnector for FakeConnector {
    async fn connect(&self, _node: &NodeDescriptor) -> MusicResult<NodeConnection> {
        let (tx, events) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        let transport: Arc<dyn NodeTransport> = self.transport.lock().clone();
        Ok(NodeConnection { transport, events })
    }
}

/// Conector lento para forzar intentos concurrentes.
pub struct SlowConnector {
    failing: Vec<&'static str>,
    calls: Mutex<Vec<String>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<NodeEvent>>>,
}

impl SlowConnector {
    pub fn failing_primary() -> Self {
        Self::failing(vec!["primary"])
    }

    pub fn always_failing() -> Self {
        Self::failing(vec!["primary", "backup"])
    }

    fn failing(failing: Vec<&'static str>) -> Self {
        Self {
            failing,
            calls: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NodeConnector for SlowConnector {
    async fn connect(&self, node: &NodeDescriptor) -> MusicResult<NodeConnection> {
        self.calls.lock().push(node.name.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        if self.failing.contains(&node.name.as_str()) {
            return Err(MusicError::Transport(format!("{} refused", node.name)));
        }

        let (tx, events) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        Ok(NodeConnection {
            transport: Arc::new(FakeTransport::new(&format!("{}-session", node.name))),
            events,
        })
    }
}

/// Gateway de voz que acepta cualquier canal, opcionalmente con demora.
#[derive(Default)]
pub struct FakeVoice {
    pub joins: Mutex<Vec<(GuildId, ChannelId)>>,
    pub leaves: Mutex<Vec<GuildId>>,
    pub join_delay: Mutex<Option<Duration>>,
}

#[async_trait]
impl VoiceGateway for FakeVoice {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<VoiceConnection> {
        self.joins.lock().push((guild_id, channel_id));
        let delay = *self.join_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(VoiceConnection {
            channel_id,
            endpoint: "voice.example".to_string(),
            session_id: format!("voice-{guild_id}"),
            token: "token".to_string(),
        })
    }

    async fn leave(&self, guild_id: GuildId) -> MusicResult<()> {
        self.leaves.lock().push(guild_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPresence {
    pub updates: Mutex<Vec<String>>,
}

impl RecordingPresence {
    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().clone()
    }
}

impl PresenceSink for RecordingPresence {
    fn now_playing(&self, _guild_id: GuildId, track: &Track) {
        self.updates.lock().push(format!("playing {}", track.identifier));
    }

    fn idle(&self, _guild_id: GuildId) {
        self.updates.lock().push("idle".to_string());
    }
}

/// Autoplay con una sugerencia fija (o ninguna).
#[derive(Default)]
pub struct FixedAutoplay {
    pub suggestion: Mutex<Option<Track>>,
}

impl FixedAutoplay {
    pub fn suggesting(track: Track) -> Self {
        Self {
            suggestion: Mutex::new(Some(track)),
        }
    }
}

#[async_trait]
impl AutoplayStrategy for FixedAutoplay {
    async fn suggest_next(&self, _last: &Track) -> MusicResult<Option<Track>> {
        Ok(self.suggestion.lock().clone())
    }
}
