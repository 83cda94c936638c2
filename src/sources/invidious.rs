use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SearchBackend, SearchSource};
use crate::audio::node::{AudioNodePool, LoadResult};
use crate::audio::track::Track;
use crate::error::{MusicError, MusicResult};

/// Búsqueda en YouTube vía instancias públicas de Invidious. Solo aporta ids
/// de video: el track reproducible lo sigue cargando el nodo desde
/// `https://youtu.be/{id}`.
pub struct InvidiousSearch {
    client: reqwest::Client,
    instances: Vec<String>,
    current_instance: AtomicUsize,
    pool: Arc<AudioNodePool>,
}

#[derive(Debug, Deserialize)]
struct InvidiousSearchResult {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

impl InvidiousSearch {
    pub fn new(instances: Vec<String>, pool: Arc<AudioNodePool>) -> MusicResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;

        Ok(Self {
            client,
            instances,
            current_instance: AtomicUsize::new(0),
            pool,
        })
    }

    /// Instancias en orden rotado: cada búsqueda empieza por la siguiente.
    fn rotation(&self) -> Vec<&str> {
        if self.instances.is_empty() {
            return Vec::new();
        }
        let start = self.current_instance.fetch_add(1, Ordering::SeqCst) % self.instances.len();
        self.instances[start..]
            .iter()
            .chain(self.instances[..start].iter())
            .map(String::as_str)
            .collect()
    }

    async fn video_ids(&self, term: &str, limit: usize) -> MusicResult<Vec<String>> {
        let mut last_error = None;

        for instance in self.rotation() {
            match self.try_search(instance, term, limit).await {
                Ok(ids) if !ids.is_empty() => {
                    info!("✅ Búsqueda exitosa en {}: {} resultados", instance, ids.len());
                    return Ok(ids);
                }
                Ok(_) => {
                    warn!("⚠️ {} devolvió 0 resultados", instance);
                    return Ok(Vec::new());
                }
                Err(e) => {
                    warn!("❌ Falló búsqueda en {}: {}", instance, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    async fn try_search(&self, instance: &str, term: &str, limit: usize) -> MusicResult<Vec<String>> {
        let url = format!("{}/api/v1/search", instance.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("q", term), ("type", "video")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MusicError::Transport(format!("{} → HTTP {}", url, response.status())));
        }

        let results: Vec<InvidiousSearchResult> = response.json().await?;
        Ok(video_ids(results, limit))
    }
}

fn video_ids(results: Vec<InvidiousSearchResult>, limit: usize) -> Vec<String> {
    results
        .into_iter()
        .filter(|r| r.kind == "video")
        .filter_map(|r| r.video_id)
        .take(limit)
        .collect()
}

#[async_trait]
impl SearchBackend for InvidiousSearch {
    fn name(&self) -> &'static str {
        "invidious"
    }

    async fn search(&self, term: &str, source: SearchSource, limit: usize) -> MusicResult<Vec<Track>> {
        // Invidious solo indexa YouTube
        if source == SearchSource::SoundCloud {
            return Ok(Vec::new());
        }

        let ids = self.video_ids(term, limit).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let node = self.pool.ensure_connected().await?;
        let mut tracks = Vec::with_capacity(ids.len());
        for id in ids {
            let url = format!("https://youtu.be/{}", id);
            match node.transport().load_tracks(&url).await? {
                LoadResult::Track(track) => tracks.push(track),
                LoadResult::Search(found) => tracks.extend(found.into_iter().take(1)),
                other => debug!("Video {} no cargable: {:?}", id, other),
            }
        }
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_video_ids_skip_channels_and_playlists() {
        let raw = r#"[
            {"type":"channel","author":"Someone"},
            {"type":"video","videoId":"dQw4w9WgXcQ","title":"Never Gonna Give You Up"},
            {"type":"playlist","playlistId":"PL1"},
            {"type":"video","videoId":"yPYZpwSpKmA","title":"Together Forever"}
        ]"#;
        let results: Vec<InvidiousSearchResult> = serde_json::from_str(raw).unwrap();

        assert_eq!(video_ids(results, 5), vec!["dQw4w9WgXcQ", "yPYZpwSpKmA"]);
    }

    #[test]
    fn test_video_ids_respect_limit() {
        let raw = r#"[{"type":"video","videoId":"a"},{"type":"video","videoId":"b"}]"#;
        let results: Vec<InvidiousSearchResult> = serde_json::from_str(raw).unwrap();

        assert_eq!(video_ids(results, 1), vec!["a"]);
    }
}
