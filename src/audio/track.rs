use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Origen de un track tal como lo reporta el nodo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    YouTube,
    YouTubeMusic,
    SoundCloud,
    Http,
    Stream,
    Other(String),
}

impl SourceKind {
    /// Traduce el `sourceName` de Lavalink.
    pub fn from_node_name(name: &str, is_stream: bool) -> Self {
        match name {
            "youtube" => SourceKind::YouTube,
            "youtubemusic" => SourceKind::YouTubeMusic,
            "soundcloud" => SourceKind::SoundCloud,
            "http" if is_stream => SourceKind::Stream,
            "http" => SourceKind::Http,
            _ if is_stream => SourceKind::Stream,
            other => SourceKind::Other(other.to_string()),
        }
    }
}

/// Track inmutable. Se crea en el resolver y se comparte con `Arc`; la cola
/// solo guarda referencias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Referencia opaca que el nodo necesita para reproducir.
    pub encoded: String,
    pub identifier: String,
    pub uri: Option<String>,
    pub title: String,
    pub author: String,
    pub length_ms: u64,
    pub artwork_url: Option<String>,
    pub source: SourceKind,
    pub is_stream: bool,
}

impl Track {
    /// Identidad usada para detectar duplicados y eventos obsoletos.
    pub fn key(&self) -> &str {
        self.uri.as_deref().unwrap_or(&self.identifier)
    }

    pub fn same_as(&self, other: &Track) -> bool {
        self.key() == other.key()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.length_ms)
    }

    /// `mm:ss`, o `LIVE` para streams.
    pub fn format_length(&self) -> String {
        if self.is_stream {
            return "LIVE".to_string();
        }
        format_length(self.length_ms)
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.title)
    }
}

pub fn format_length(length_ms: u64) -> String {
    let total = length_ms / 1000;
    let (minutes, seconds) = (total / 60, total % 60);
    format!("{:02}:{:02}", minutes, seconds)
}

#[cfg(test)]
pub(crate) fn test_track(name: &str) -> Track {
    Track {
        encoded: format!("enc-{name}"),
        identifier: name.to_string(),
        uri: Some(format!("https://youtu.be/{name}")),
        title: format!("Song {name}"),
        author: "Tester".to_string(),
        length_ms: 180_000,
        artwork_url: None,
        source: SourceKind::YouTube,
        is_stream: false,
    }
}
