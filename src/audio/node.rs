//! Pool de nodos de audio externos (Lavalink) con failover primario/backup.
//!
//! El pool es dueño de la vida de los nodos: las sesiones solo guardan el id
//! de sesión del nodo donde viven sus players. Todos los eventos de los nodos
//! se reenvían a un único canal `broadcast` al que se suscribe el router.

use async_trait::async_trait;
use parking_lot::RwLock;
use serenity::model::id::GuildId;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::track::Track;
use crate::audio::voice::VoiceConnection;
use crate::error::{MusicError, MusicResult};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub name: String,
    pub uri: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Resultado de `loadtracks`.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Track(Track),
    Playlist { name: String, tracks: Vec<Track> },
    Search(Vec<Track>),
    Empty,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl EndReason {
    /// Solo un fin natural (o fallo de carga) avanza la cola; el resto es el
    /// eco de nuestros propios stop/skip.
    pub fn may_start_next(&self) -> bool {
        matches!(self, EndReason::Finished | EndReason::LoadFailed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    TrackStarted {
        node_session: String,
        guild_id: GuildId,
        track: Track,
    },
    TrackEnded {
        node_session: String,
        guild_id: GuildId,
        track: Track,
        reason: EndReason,
    },
    TrackException {
        node_session: String,
        guild_id: GuildId,
        track: Track,
        message: String,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            NodeEvent::TrackStarted { guild_id, .. }
            | NodeEvent::TrackEnded { guild_id, .. }
            | NodeEvent::TrackException { guild_id, .. } => *guild_id,
        }
    }

    pub fn node_session(&self) -> &str {
        match self {
            NodeEvent::TrackStarted { node_session, .. }
            | NodeEvent::TrackEnded { node_session, .. }
            | NodeEvent::TrackException { node_session, .. } => node_session,
        }
    }
}

/// Operaciones request/response contra un nodo ya conectado.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Id de sesión que el nodo asignó a esta conexión.
    fn session_id(&self) -> &str;

    async fn heartbeat(&self) -> MusicResult<()>;

    async fn load_tracks(&self, identifier: &str) -> MusicResult<LoadResult>;

    async fn play(&self, guild_id: GuildId, track: &Track, voice: &VoiceConnection) -> MusicResult<()>;

    async fn stop(&self, guild_id: GuildId) -> MusicResult<()>;

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> MusicResult<()>;

    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> MusicResult<()>;

    async fn destroy(&self, guild_id: GuildId) -> MusicResult<()>;
}

pub struct NodeConnection {
    pub transport: Arc<dyn NodeTransport>,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, node: &NodeDescriptor) -> MusicResult<NodeConnection>;
}

/// Nodo registrado en el pool.
pub struct ActiveNode {
    descriptor: NodeDescriptor,
    transport: Arc<dyn NodeTransport>,
    status: RwLock<NodeStatus>,
    missed_heartbeats: AtomicU32,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ActiveNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveNode")
            .field("name", &self.descriptor.name)
            .field("session_id", &self.session_id())
            .field("status", &self.status())
            .finish()
    }
}

impl ActiveNode {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn transport(&self) -> &Arc<dyn NodeTransport> {
        &self.transport
    }

    pub fn session_id(&self) -> &str {
        self.transport.session_id()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == NodeStatus::Connected
    }

    fn mark_disconnected(&self, reason: &str) {
        let mut status = self.status.write();
        if *status != NodeStatus::Disconnected {
            warn!("🔌 Nodo {} desconectado: {}", self.descriptor.name, reason);
            *status = NodeStatus::Disconnected;
        }
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            max_missed_heartbeats: 3,
        }
    }
}

/// Registro del último intento de conexión.
#[derive(Default)]
struct AttemptLog {
    last_error: Option<MusicError>,
}

pub struct AudioNodePool {
    primary: NodeDescriptor,
    backup: Option<NodeDescriptor>,
    connector: Arc<dyn NodeConnector>,
    settings: PoolSettings,
    active: RwLock<Option<Arc<ActiveNode>>>,
    connect_lock: Mutex<AttemptLog>,
    attempts: AtomicU64,
    connecting: parking_lot::Mutex<bool>,
    events: broadcast::Sender<NodeEvent>,
}

impl AudioNodePool {
    pub fn new(
        primary: NodeDescriptor,
        backup: Option<NodeDescriptor>,
        connector: Arc<dyn NodeConnector>,
        settings: PoolSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            primary,
            backup,
            connector,
            settings,
            active: RwLock::new(None),
            connect_lock: Mutex::new(AttemptLog::default()),
            attempts: AtomicU64::new(0),
            connecting: parking_lot::Mutex::new(false),
            events,
        }
    }

    /// Stream de eventos de cualquier nodo activo.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Nodo sano actual, o `NoNodeAvailable`.
    pub fn get_node(&self) -> MusicResult<Arc<ActiveNode>> {
        self.healthy().ok_or(MusicError::NoNodeAvailable)
    }

    pub fn status(&self) -> (Option<String>, NodeStatus) {
        if *self.connecting.lock() {
            return (None, NodeStatus::Connecting);
        }
        match self.active.read().as_ref() {
            Some(node) => (Some(node.name().to_string()), node.status()),
            None => (None, NodeStatus::Disconnected),
        }
    }

    /// Garantiza un nodo sano. Los intentos concurrentes se agrupan en uno
    /// solo: quien esperaba detrás de un intento recibe su resultado.
    pub async fn ensure_connected(&self) -> MusicResult<Arc<ActiveNode>> {
        if let Some(node) = self.healthy() {
            return Ok(node);
        }

        let seen = self.attempts.load(Ordering::SeqCst);
        let mut log = self.connect_lock.lock().await;

        if let Some(node) = self.healthy() {
            return Ok(node);
        }
        if self.attempts.load(Ordering::SeqCst) != seen {
            if let Some(err) = log.last_error.clone() {
                debug!("Reutilizando el fallo del intento de conexión concurrente");
                return Err(err);
            }
        }

        *self.connecting.lock() = true;
        let result = self.connect_any().await;
        *self.connecting.lock() = false;
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(node) => {
                log.last_error = None;
                Ok(node)
            }
            Err(e) => {
                log.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn healthy(&self) -> Option<Arc<ActiveNode>> {
        self.active
            .read()
            .as_ref()
            .filter(|node| node.is_healthy())
            .cloned()
    }

    async fn connect_any(&self) -> MusicResult<Arc<ActiveNode>> {
        if let Some(old) = self.active.write().take() {
            old.mark_disconnected("reemplazado por reconexión");
        }

        let primary_error = match self.connect_node(&self.primary).await {
            Ok(node) => return Ok(node),
            Err(e) => {
                warn!("❌ Nodo primario {} falló: {}", self.primary.name, e);
                e
            }
        };

        let Some(backup) = &self.backup else {
            return Err(MusicError::NodeUnavailable(primary_error.to_string()));
        };

        info!("🔄 Intentando nodo de respaldo {}", backup.name);
        match self.connect_node(backup).await {
            Ok(node) => Ok(node),
            Err(e) => {
                error!("❌ Nodo de respaldo {} falló: {}", backup.name, e);
                Err(MusicError::NodeUnavailable(format!(
                    "primary: {primary_error}; backup: {e}"
                )))
            }
        }
    }

    async fn connect_node(&self, descriptor: &NodeDescriptor) -> MusicResult<Arc<ActiveNode>> {
        info!("🎼 Conectando a nodo {} ({})", descriptor.name, descriptor.uri);
        let NodeConnection { transport, events } = self.connector.connect(descriptor).await?;

        let node = Arc::new(ActiveNode {
            descriptor: descriptor.clone(),
            transport,
            status: RwLock::new(NodeStatus::Connected),
            missed_heartbeats: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(forward_events(node.clone(), events, self.events.clone()));
        tokio::spawn(heartbeat_loop(node.clone(), self.settings.clone()));

        *self.active.write() = Some(node.clone());
        info!(
            "✅ Conectado a nodo {} (sesión {})",
            descriptor.name,
            node.session_id()
        );
        Ok(node)
    }
}

async fn forward_events(
    node: Arc<ActiveNode>,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    sink: broadcast::Sender<NodeEvent>,
) {
    loop {
        tokio::select! {
            _ = node.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    // sin suscriptores no es un error
                    let _ = sink.send(event);
                }
                None => {
                    node.mark_disconnected("stream de eventos cerrado");
                    break;
                }
            }
        }
    }
}

async fn heartbeat_loop(node: Arc<ActiveNode>, settings: PoolSettings) {
    let mut ticker = tokio::time::interval(settings.heartbeat_interval);
    // el primer tick es inmediato
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = node.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match node.transport.heartbeat().await {
            Ok(()) => {
                node.missed_heartbeats.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                let missed = node.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("💔 Heartbeat perdido en nodo {} ({}): {}", node.name(), missed, e);
                if missed >= settings.max_missed_heartbeats {
                    node.mark_disconnected("heartbeats perdidos");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{FakeTransport, SlowConnector};
    use pretty_assertions::assert_eq;

    fn descriptor(name: &str) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            uri: format!("http://{name}:2333"),
            password: "pw".to_string(),
        }
    }

    fn connection(session: &str) -> NodeConnection {
        let (tx, events) = mpsc::unbounded_channel();
        // mantener vivo el stream para que el nodo no se marque caído
        std::mem::forget(tx);
        NodeConnection {
            transport: Arc::new(FakeTransport::new(session)),
            events,
        }
    }

    fn pool_with(connector: Arc<dyn NodeConnector>) -> AudioNodePool {
        AudioNodePool::new(
            descriptor("primary"),
            Some(descriptor("backup")),
            connector,
            PoolSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_primary_fails_backup_succeeds() {
        let mut connector = MockNodeConnector::new();
        connector
            .expect_connect()
            .withf(|node| node.name == "primary")
            .times(1)
            .returning(|_| Err(MusicError::Transport("connection refused".to_string())));
        connector
            .expect_connect()
            .withf(|node| node.name == "backup")
            .times(1)
            .returning(|_| Ok(connection("backup-session")));

        let pool = pool_with(Arc::new(connector));
        let node = pool.ensure_connected().await.unwrap();
        assert_eq!(node.name(), "backup");
        assert_eq!(pool.status(), (Some("backup".to_string()), NodeStatus::Connected));

        // idempotente: no hay más llamadas al conector (times(1) lo verifica)
        let again = pool.ensure_connected().await.unwrap();
        assert!(Arc::ptr_eq(&node, &again));
        assert_eq!(pool.get_node().unwrap().session_id(), "backup-session");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_attempt() {
        let connector = Arc::new(SlowConnector::failing_primary());
        let pool = pool_with(connector.clone());

        let (a, b) = tokio::join!(pool.ensure_connected(), pool.ensure_connected());
        assert_eq!(a.unwrap().name(), "backup");
        assert_eq!(b.unwrap().name(), "backup");
        assert_eq!(connector.calls(), vec!["primary", "backup"]);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_fail_uniformly() {
        let connector = Arc::new(SlowConnector::always_failing());
        let pool = pool_with(connector.clone());

        let (a, b) = tokio::join!(pool.ensure_connected(), pool.ensure_connected());
        let a = a.unwrap_err();
        assert!(matches!(a, MusicError::NodeUnavailable(_)));
        assert_eq!(b.unwrap_err(), a);
        assert_eq!(connector.calls().len(), 2);

        // el siguiente comando sí reintenta
        assert!(pool.ensure_connected().await.is_err());
        assert_eq!(connector.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_get_node_without_connection() {
        let pool = pool_with(Arc::new(MockNodeConnector::new()));
        assert!(matches!(pool.get_node(), Err(MusicError::NoNodeAvailable)));
        assert_eq!(pool.status(), (None, NodeStatus::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_disconnect_node() {
        let transport = Arc::new(FakeTransport::new("s1"));
        transport.fail_heartbeats(true);
        let (tx, events) = mpsc::unbounded_channel();
        let conn_transport = transport.clone();
        let mut connector = MockNodeConnector::new();
        connector.expect_connect().times(1).return_once(move |_| {
            Ok(NodeConnection {
                transport: conn_transport,
                events,
            })
        });

        let pool = pool_with(Arc::new(connector));
        let node = pool.ensure_connected().await.unwrap();
        assert!(node.is_healthy());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(node.status(), NodeStatus::Disconnected);
        assert!(matches!(pool.get_node(), Err(MusicError::NoNodeAvailable)));
        drop(tx);
    }

    #[tokio::test]
    async fn test_events_are_forwarded_to_subscribers() {
        let (tx, events) = mpsc::unbounded_channel();
        let mut connector = MockNodeConnector::new();
        connector.expect_connect().times(1).return_once(move |_| {
            Ok(NodeConnection {
                transport: Arc::new(FakeTransport::new("s1")),
                events,
            })
        });
        let pool = pool_with(Arc::new(connector));
        let mut rx = pool.subscribe();
        pool.ensure_connected().await.unwrap();

        let event = NodeEvent::TrackStarted {
            node_session: "s1".to_string(),
            guild_id: GuildId::new(1),
            track: crate::audio::track::test_track("a"),
        };
        tx.send(event.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);

        drop(tx);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.get_node().is_err());
    }
}
