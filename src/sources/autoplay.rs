use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Resolved, SearchSource, TrackResolver};
use crate::audio::track::{SourceKind, Track};
use crate::error::{MusicError, MusicResult};

/// Elige qué sonará cuando la cola se vacía con autoplay activo.
#[async_trait]
pub trait AutoplayStrategy: Send + Sync {
    async fn suggest_next(&self, last: &Track) -> MusicResult<Option<Track>>;
}

/// Usa el mix automático de YouTube (`list=RD{id}`) del último track; para
/// otras fuentes busca más canciones del mismo artista.
pub struct YouTubeMixAutoplay {
    resolver: Arc<TrackResolver>,
}

impl YouTubeMixAutoplay {
    pub fn new(resolver: Arc<TrackResolver>) -> Self {
        Self { resolver }
    }

    pub fn mix_url(video_id: &str) -> String {
        format!("https://www.youtube.com/watch?v={video_id}&list=RD{video_id}")
    }
}

#[async_trait]
impl AutoplayStrategy for YouTubeMixAutoplay {
    async fn suggest_next(&self, last: &Track) -> MusicResult<Option<Track>> {
        let candidates = match last.source {
            SourceKind::YouTube | SourceKind::YouTubeMusic => {
                match self.resolver.load(&Self::mix_url(&last.identifier)).await {
                    Ok(Resolved::Playlist { tracks, .. }) | Ok(Resolved::Tracks(tracks)) => tracks,
                    Err(MusicError::NoResults(_)) => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
            _ => {
                let source = match last.source {
                    SourceKind::SoundCloud => SearchSource::SoundCloud,
                    _ => SearchSource::YouTube,
                };
                match self.resolver.search(&last.author, source, 5).await {
                    Ok(tracks) => tracks,
                    Err(MusicError::NoResults(_)) => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
        };

        let next = candidates.into_iter().find(|t| !t.same_as(last));
        match &next {
            Some(track) => info!("🤖 Autoplay sugiere: {}", track.title),
            None => debug!("Autoplay sin sugerencias para {}", last.title),
        }
        Ok(next.map(|t| (*t).clone()))
    }
}
