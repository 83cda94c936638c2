//! # Sources
//!
//! Resolución de consultas del usuario a tracks reproducibles.
//!
//! - Un término libre pasa por los back-ends de búsqueda en orden; gana el
//!   primero que responde con resultados y se toma solo el primer match.
//! - Una URL se carga directamente en el nodo, que devuelve un track o una
//!   playlist.
//!
//! Los back-ends implementan [`SearchBackend`]. El filtro de validez
//! ([`check_track`]) decide qué tracks pueden entrar a una cola concreta.

pub mod autoplay;
pub mod invidious;

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::audio::node::{AudioNodePool, LoadResult};
use crate::audio::queue::MusicQueue;
use crate::audio::track::Track;
use crate::error::{MusicError, MusicResult};

pub use autoplay::{AutoplayStrategy, YouTubeMixAutoplay};
pub use invidious::InvidiousSearch;

/// Plataforma para búsquedas por texto libre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchSource {
    #[default]
    YouTube,
    YouTubeMusic,
    SoundCloud,
}

impl SearchSource {
    pub fn prefix(&self) -> &'static str {
        match self {
            SearchSource::YouTube => "ytsearch",
            SearchSource::YouTubeMusic => "ytmsearch",
            SearchSource::SoundCloud => "scsearch",
        }
    }
}

/// Resultado de resolver una consulta.
#[derive(Debug, Clone)]
pub enum Resolved {
    Tracks(Vec<Arc<Track>>),
    Playlist { name: String, tracks: Vec<Arc<Track>> },
}

impl Resolved {
    pub fn tracks(&self) -> &[Arc<Track>] {
        match self {
            Resolved::Tracks(tracks) => tracks,
            Resolved::Playlist { tracks, .. } => tracks,
        }
    }

    pub fn into_tracks(self) -> Vec<Arc<Track>> {
        match self {
            Resolved::Tracks(tracks) => tracks,
            Resolved::Playlist { tracks, .. } => tracks,
        }
    }
}

/// Back-end de búsqueda por texto libre.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, term: &str, source: SearchSource, limit: usize) -> MusicResult<Vec<Track>>;
}

/// Busca directamente en el nodo con los prefijos `ytsearch:`/`scsearch:`.
pub struct NodeSearch {
    pool: Arc<AudioNodePool>,
}

impl NodeSearch {
    pub fn new(pool: Arc<AudioNodePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SearchBackend for NodeSearch {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn search(&self, term: &str, source: SearchSource, limit: usize) -> MusicResult<Vec<Track>> {
        let identifier = format!("{}:{}", source.prefix(), term);
        let node = self.pool.ensure_connected().await?;
        let tracks = match node.transport().load_tracks(&identifier).await? {
            LoadResult::Search(tracks) => tracks,
            LoadResult::Track(track) => vec![track],
            LoadResult::Playlist { tracks, .. } => tracks,
            LoadResult::Empty => Vec::new(),
            LoadResult::Error(message) => return Err(MusicError::ResolutionFailed(message)),
        };
        Ok(tracks.into_iter().take(limit).collect())
    }
}

pub struct TrackResolver {
    pool: Arc<AudioNodePool>,
    backends: Vec<Arc<dyn SearchBackend>>,
    timeout: Duration,
}

impl TrackResolver {
    pub fn new(pool: Arc<AudioNodePool>, backends: Vec<Arc<dyn SearchBackend>>, timeout: Duration) -> Self {
        Self {
            pool,
            backends,
            timeout,
        }
    }

    /// Resuelve una consulta libre o una URL.
    pub async fn resolve(&self, query: &str, source: SearchSource) -> MusicResult<Resolved> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MusicError::NoResults(String::new()));
        }

        if is_url(query) {
            info!("🔗 Cargando URL: {}", query);
            return self.load(query).await;
        }

        info!("🔍 Buscando: {} ({:?})", query, source);
        let mut tracks = self.search(query, source, 1).await?;
        tracks.truncate(1);
        Ok(Resolved::Tracks(tracks))
    }

    /// Varios candidatos para un término (selector de resultados).
    pub async fn search(&self, term: &str, source: SearchSource, limit: usize) -> MusicResult<Vec<Arc<Track>>> {
        let mut answered_empty = false;
        let mut last_error: Option<MusicError> = None;

        for backend in &self.backends {
            let attempt = tokio::time::timeout(self.timeout, backend.search(term, source, limit)).await;
            match attempt {
                Ok(Ok(tracks)) if !tracks.is_empty() => {
                    debug!("✅ {} resultados desde {}", tracks.len(), backend.name());
                    return Ok(tracks.into_iter().map(Arc::new).collect());
                }
                Ok(Ok(_)) => {
                    debug!("Sin resultados en {}", backend.name());
                    answered_empty = true;
                }
                Ok(Err(e @ MusicError::NodeUnavailable(_))) => return Err(e),
                Ok(Err(e)) => {
                    warn!("❌ Búsqueda en {} falló: {}", backend.name(), e);
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!("⏰ Timeout buscando en {}", backend.name());
                    last_error = Some(MusicError::ResolutionFailed(format!(
                        "{} timed out",
                        backend.name()
                    )));
                }
            }
        }

        match last_error {
            Some(e) if !answered_empty => Err(as_resolution_failure(e)),
            _ => Err(MusicError::NoResults(term.to_string())),
        }
    }

    /// Carga un identificador (URL) en el nodo.
    pub async fn load(&self, identifier: &str) -> MusicResult<Resolved> {
        let node = self.pool.ensure_connected().await?;
        let loaded = tokio::time::timeout(self.timeout, node.transport().load_tracks(identifier))
            .await
            .map_err(|_| MusicError::ResolutionFailed(format!("loading `{identifier}` timed out")))?
            .map_err(as_resolution_failure)?;

        match loaded {
            LoadResult::Track(track) => Ok(Resolved::Tracks(vec![Arc::new(track)])),
            LoadResult::Search(tracks) => match tracks.into_iter().next() {
                Some(track) => Ok(Resolved::Tracks(vec![Arc::new(track)])),
                None => Err(MusicError::NoResults(identifier.to_string())),
            },
            LoadResult::Playlist { name, tracks } => {
                info!("📃 Playlist {}: {} tracks", name, tracks.len());
                Ok(Resolved::Playlist {
                    name,
                    tracks: tracks.into_iter().map(Arc::new).collect(),
                })
            }
            LoadResult::Empty => Err(MusicError::NoResults(identifier.to_string())),
            LoadResult::Error(message) => Err(MusicError::ResolutionFailed(message)),
        }
    }
}

fn as_resolution_failure(e: MusicError) -> MusicError {
    match e {
        MusicError::Transport(message) => MusicError::ResolutionFailed(message),
        other => other,
    }
}

pub fn is_url(query: &str) -> bool {
    url::Url::parse(query)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Por qué un track no entra a la cola.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    TooLong,
    QueueFull,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::Duplicate => "already in the queue",
            SkipReason::TooLong => "longer than the allowed duration",
            SkipReason::QueueFull => "queue is full",
        }
    }
}

/// Filtro de validez contra la cola destino. Se evalúa track a track mientras
/// se encola, así que los duplicados dentro del mismo lote también cuentan.
pub fn check_track(track: &Track, queue: &MusicQueue, max_duration: Option<Duration>) -> Result<(), SkipReason> {
    if queue.contains(track) {
        return Err(SkipReason::Duplicate);
    }
    if let Some(max) = max_duration {
        if !track.is_stream && track.duration() > max {
            return Err(SkipReason::TooLong);
        }
    }
    if queue.is_full() {
        return Err(SkipReason::QueueFull);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::node::{NodeDescriptor, PoolSettings};
    use crate::audio::testing::{FakeConnector, FakeTransport};
    use crate::audio::track::test_track;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    struct StaticBackend {
        name: &'static str,
        result: MusicResult<Vec<Track>>,
    }

    #[async_trait]
    impl SearchBackend for StaticBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(&self, _term: &str, _source: SearchSource, _limit: usize) -> MusicResult<Vec<Track>> {
            self.result.clone()
        }
    }

    fn pool(transport: Arc<FakeTransport>) -> Arc<AudioNodePool> {
        Arc::new(AudioNodePool::new(
            NodeDescriptor {
                name: "primary".to_string(),
                uri: "http://localhost:2333".to_string(),
                password: "pw".to_string(),
            },
            None,
            Arc::new(FakeConnector::new(transport)),
            PoolSettings::default(),
        ))
    }

    fn resolver(transport: Arc<FakeTransport>, backends: Vec<Arc<dyn SearchBackend>>) -> TrackResolver {
        TrackResolver::new(pool(transport), backends, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_search_term_returns_first_match_of_first_backend() {
        let backends: Vec<Arc<dyn SearchBackend>> = vec![
            Arc::new(StaticBackend {
                name: "broken",
                result: Err(MusicError::Transport("503".to_string())),
            }),
            Arc::new(StaticBackend {
                name: "ok",
                result: Ok(vec![test_track("a"), test_track("b")]),
            }),
        ];
        let resolver = resolver(Arc::new(FakeTransport::new("s")), backends);

        let resolved = resolver.resolve("never gonna", SearchSource::YouTube).await.unwrap();
        let ids: Vec<_> = resolved.tracks().iter().map(|t| t.identifier.clone()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_search_failures() {
        let empty: Vec<Arc<dyn SearchBackend>> = vec![Arc::new(StaticBackend {
            name: "empty",
            result: Ok(vec![]),
        })];
        let resolver_empty = resolver(Arc::new(FakeTransport::new("s")), empty);
        assert!(matches!(
            resolver_empty.resolve("zzz", SearchSource::YouTube).await,
            Err(MusicError::NoResults(_))
        ));

        let broken: Vec<Arc<dyn SearchBackend>> = vec![Arc::new(StaticBackend {
            name: "broken",
            result: Err(MusicError::Transport("503".to_string())),
        })];
        let resolver_broken = resolver(Arc::new(FakeTransport::new("s")), broken);
        assert!(matches!(
            resolver_broken.resolve("zzz", SearchSource::YouTube).await,
            Err(MusicError::ResolutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_url_loads_playlist_through_node() {
        let transport = Arc::new(FakeTransport::new("s"));
        transport.set_load_result(LoadResult::Playlist {
            name: "Mix".to_string(),
            tracks: vec![test_track("a"), test_track("b")],
        });
        let resolver = resolver(transport.clone(), vec![]);

        let resolved = resolver
            .resolve("https://www.youtube.com/playlist?list=PL1", SearchSource::YouTube)
            .await
            .unwrap();
        assert!(matches!(resolved, Resolved::Playlist { ref name, .. } if name == "Mix"));
        assert_eq!(resolved.tracks().len(), 2);
        assert_eq!(
            transport.calls(),
            vec!["load https://www.youtube.com/playlist?list=PL1"]
        );
    }

    #[tokio::test]
    async fn test_url_with_empty_or_error_result() {
        let transport = Arc::new(FakeTransport::new("s"));
        let resolver = resolver(transport.clone(), vec![]);

        transport.set_load_result(LoadResult::Empty);
        assert!(matches!(
            resolver.resolve("https://soundcloud.com/x/y", SearchSource::SoundCloud).await,
            Err(MusicError::NoResults(_))
        ));

        transport.set_load_result(LoadResult::Error("unavailable".to_string()));
        assert_eq!(
            resolver
                .resolve("https://soundcloud.com/x/y", SearchSource::SoundCloud)
                .await
                .unwrap_err(),
            MusicError::ResolutionFailed("unavailable".to_string())
        );
    }

    #[tokio::test]
    async fn test_node_search_uses_source_prefix() {
        let transport = Arc::new(FakeTransport::new("s"));
        transport.set_load_result(LoadResult::Search(vec![test_track("x")]));
        let node_search = NodeSearch::new(pool(transport.clone()));

        let tracks = node_search.search("lofi", SearchSource::SoundCloud, 5).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(transport.calls(), vec!["load scsearch:lofi"]);
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_url("http://example.com/a.mp3"));
        assert!(!is_url("never gonna give you up"));
        assert!(!is_url("ytsearch:abc"));
    }

    #[test]
    fn test_check_track() {
        let mut queue = MusicQueue::new(2);
        let a = Arc::new(test_track("a"));
        queue.enqueue(a.clone(), UserId::new(1)).unwrap();

        assert_eq!(check_track(&a, &queue, None), Err(SkipReason::Duplicate));
        assert_eq!(check_track(&test_track("b"), &queue, None), Ok(()));

        let mut long = test_track("long");
        long.length_ms = 3 * 3600 * 1000;
        assert_eq!(
            check_track(&long, &queue, Some(Duration::from_secs(7200))),
            Err(SkipReason::TooLong)
        );

        queue.enqueue(Arc::new(test_track("b")), UserId::new(1)).unwrap();
        assert_eq!(check_track(&test_track("c"), &queue, None), Err(SkipReason::QueueFull));
    }
}
