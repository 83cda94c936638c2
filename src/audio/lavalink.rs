use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use serenity::model::id::GuildId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::HeaderValue,
    protocol::Message,
};
use tracing::{debug, error, warn};

use crate::audio::node::{
    EndReason, LoadResult, NodeConnection, NodeConnector, NodeDescriptor, NodeEvent, NodeTransport,
};
use crate::audio::track::{SourceKind, Track};
use crate::audio::voice::VoiceConnection;
use crate::error::{MusicError, MusicResult};

const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Conector Lavalink v4: REST para comandos y WebSocket para eventos.
pub struct LavalinkConnector {
    http: reqwest::Client,
    user_id: u64,
    client_name: String,
}

impl LavalinkConnector {
    pub fn new(user_id: u64) -> MusicResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            user_id,
            client_name: format!("guild-music/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    fn header(value: &str) -> MusicResult<HeaderValue> {
        HeaderValue::from_str(value)
            .map_err(|e| MusicError::Transport(format!("invalid header value: {e}")))
    }
}

#[async_trait]
impl NodeConnector for LavalinkConnector {
    async fn connect(&self, node: &NodeDescriptor) -> MusicResult<NodeConnection> {
        let base = node.uri.trim_end_matches('/').to_string();

        // Verificar que el nodo responde antes de abrir el websocket
        self.http
            .get(format!("{base}/v4/info"))
            .header("Authorization", &node.password)
            .send()
            .await?
            .error_for_status()?;

        let ws_url = format!("{}/v4/websocket", base.replacen("http", "ws", 1));
        let mut request = ws_url
            .into_client_request()
            .map_err(|e| MusicError::Transport(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", Self::header(&node.password)?);
        headers.insert("User-Id", Self::header(&self.user_id.to_string())?);
        headers.insert("Client-Name", Self::header(&self.client_name)?);

        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| MusicError::Transport(e.to_string()))?;

        let session_id = tokio::time::timeout(READY_TIMEOUT, async {
            while let Some(message) = stream.next().await {
                let message = message.map_err(|e| MusicError::Transport(e.to_string()))?;
                if let Message::Text(text) = message {
                    if let Ok(IncomingMessage::Ready { session_id, resumed }) =
                        serde_json::from_str::<IncomingMessage>(&text)
                    {
                        debug!("Nodo listo (resumed={})", resumed);
                        return Ok(session_id);
                    }
                }
            }
            Err(MusicError::Transport("websocket closed before ready".to_string()))
        })
        .await
        .map_err(|_| MusicError::Transport("timed out waiting for ready op".to_string()))??;

        let (tx, events) = mpsc::unbounded_channel();
        let reader_session = session_id.clone();
        let node_name = node.name.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_event(&reader_session, &text) {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        warn!("🔌 Nodo {} cerró el websocket: {:?}", node_name, frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("❌ Error en websocket del nodo {}: {}", node_name, e);
                        break;
                    }
                }
            }
            // soltar `tx` cierra el stream y el pool marca el nodo caído
        });

        let transport = LavalinkTransport {
            http: self.http.clone(),
            base,
            password: node.password.clone(),
            session_id,
        };

        Ok(NodeConnection {
            transport: Arc::new(transport),
            events,
        })
    }
}

pub struct LavalinkTransport {
    http: reqwest::Client,
    base: String,
    password: String,
    session_id: String,
}

impl LavalinkTransport {
    fn player_url(&self, guild_id: GuildId) -> String {
        format!(
            "{}/v4/sessions/{}/players/{}",
            self.base, self.session_id, guild_id
        )
    }

    async fn update_player(&self, guild_id: GuildId, body: serde_json::Value) -> MusicResult<()> {
        self.http
            .patch(self.player_url(guild_id))
            .query(&[("noReplace", "false")])
            .header("Authorization", &self.password)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl NodeTransport for LavalinkTransport {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn heartbeat(&self) -> MusicResult<()> {
        self.http
            .get(format!("{}/version", self.base))
            .header("Authorization", &self.password)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn load_tracks(&self, identifier: &str) -> MusicResult<LoadResult> {
        debug!("🔍 loadtracks: {}", identifier);
        let response: LoadTracksResponse = self
            .http
            .get(format!("{}/v4/loadtracks", self.base))
            .query(&[("identifier", identifier)])
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.into())
    }

    async fn play(&self, guild_id: GuildId, track: &Track, voice: &VoiceConnection) -> MusicResult<()> {
        debug!("▶️ PATCH player {} → {}", guild_id, track.identifier);
        self.update_player(
            guild_id,
            json!({
                "track": { "encoded": track.encoded },
                "paused": false,
                "voice": {
                    "token": voice.token,
                    "endpoint": voice.endpoint,
                    "sessionId": voice.session_id,
                },
            }),
        )
        .await
    }

    async fn stop(&self, guild_id: GuildId) -> MusicResult<()> {
        self.update_player(guild_id, json!({ "track": { "encoded": null } }))
            .await
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> MusicResult<()> {
        self.update_player(guild_id, json!({ "paused": paused })).await
    }

    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> MusicResult<()> {
        self.update_player(guild_id, json!({ "position": position_ms }))
            .await
    }

    async fn destroy(&self, guild_id: GuildId) -> MusicResult<()> {
        self.http
            .delete(self.player_url(guild_id))
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// Modelos del protocolo

#[derive(Debug, Deserialize)]
struct LavalinkTrack {
    encoded: String,
    info: LavalinkTrackInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LavalinkTrackInfo {
    identifier: String,
    author: String,
    length: u64,
    is_stream: bool,
    title: String,
    uri: Option<String>,
    artwork_url: Option<String>,
    source_name: String,
}

impl From<LavalinkTrack> for Track {
    fn from(t: LavalinkTrack) -> Self {
        let info = t.info;
        Track {
            encoded: t.encoded,
            source: SourceKind::from_node_name(&info.source_name, info.is_stream),
            identifier: info.identifier,
            uri: info.uri,
            title: info.title,
            author: info.author,
            length_ms: info.length,
            artwork_url: info.artwork_url,
            is_stream: info.is_stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LavalinkPlaylist {
    info: LavalinkPlaylistInfo,
    tracks: Vec<LavalinkTrack>,
}

#[derive(Debug, Deserialize)]
struct LavalinkPlaylistInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LavalinkException {
    message: Option<String>,
    severity: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "lowercase")]
enum LoadTracksResponse {
    Track(LavalinkTrack),
    Playlist(LavalinkPlaylist),
    Search(Vec<LavalinkTrack>),
    Empty(serde::de::IgnoredAny),
    Error(LavalinkException),
}

impl From<LoadTracksResponse> for LoadResult {
    fn from(response: LoadTracksResponse) -> Self {
        match response {
            LoadTracksResponse::Track(track) => LoadResult::Track(track.into()),
            LoadTracksResponse::Playlist(playlist) => LoadResult::Playlist {
                name: playlist.info.name,
                tracks: playlist.tracks.into_iter().map(Track::from).collect(),
            },
            LoadTracksResponse::Search(tracks) => {
                LoadResult::Search(tracks.into_iter().map(Track::from).collect())
            }
            LoadTracksResponse::Empty(_) => LoadResult::Empty,
            LoadTracksResponse::Error(e) => LoadResult::Error(
                e.message.unwrap_or_else(|| format!("{} load failure", e.severity)),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum IncomingMessage {
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
        resumed: bool,
    },
    Event(EventPayload),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum EventPayload {
    TrackStartEvent {
        #[serde(rename = "guildId")]
        guild_id: String,
        track: LavalinkTrack,
    },
    TrackEndEvent {
        #[serde(rename = "guildId")]
        guild_id: String,
        track: LavalinkTrack,
        reason: LavalinkEndReason,
    },
    TrackExceptionEvent {
        #[serde(rename = "guildId")]
        guild_id: String,
        track: LavalinkTrack,
        exception: LavalinkException,
    },
    TrackStuckEvent {
        #[serde(rename = "guildId")]
        guild_id: String,
        track: LavalinkTrack,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },
    WebSocketClosedEvent {
        #[serde(rename = "guildId")]
        guild_id: String,
        code: u16,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum LavalinkEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl From<LavalinkEndReason> for EndReason {
    fn from(reason: LavalinkEndReason) -> Self {
        match reason {
            LavalinkEndReason::Finished => EndReason::Finished,
            LavalinkEndReason::LoadFailed => EndReason::LoadFailed,
            LavalinkEndReason::Stopped => EndReason::Stopped,
            LavalinkEndReason::Replaced => EndReason::Replaced,
            LavalinkEndReason::Cleanup => EndReason::Cleanup,
        }
    }
}

fn parse_guild(raw: &str) -> Option<GuildId> {
    raw.parse::<u64>().ok().filter(|id| *id != 0).map(GuildId::new)
}

/// Traduce un mensaje del websocket a un evento de nodo. Mensajes que no son
/// eventos de track (stats, playerUpdate, cierres de voz) devuelven `None`.
fn parse_event(node_session: &str, text: &str) -> Option<NodeEvent> {
    let message = match serde_json::from_str::<IncomingMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Mensaje de nodo no reconocido: {}", e);
            return None;
        }
    };

    let IncomingMessage::Event(payload) = message else {
        return None;
    };

    let node_session = node_session.to_string();
    match payload {
        EventPayload::TrackStartEvent { guild_id, track } => Some(NodeEvent::TrackStarted {
            node_session,
            guild_id: parse_guild(&guild_id)?,
            track: track.into(),
        }),
        EventPayload::TrackEndEvent {
            guild_id,
            track,
            reason,
        } => Some(NodeEvent::TrackEnded {
            node_session,
            guild_id: parse_guild(&guild_id)?,
            track: track.into(),
            reason: reason.into(),
        }),
        EventPayload::TrackExceptionEvent {
            guild_id,
            track,
            exception,
        } => Some(NodeEvent::TrackException {
            node_session,
            guild_id: parse_guild(&guild_id)?,
            track: track.into(),
            message: exception
                .message
                .unwrap_or_else(|| format!("{} failure", exception.severity)),
        }),
        EventPayload::TrackStuckEvent {
            guild_id,
            track,
            threshold_ms,
        } => Some(NodeEvent::TrackException {
            node_session,
            guild_id: parse_guild(&guild_id)?,
            track: track.into(),
            message: format!("track stuck for more than {threshold_ms}ms"),
        }),
        EventPayload::WebSocketClosedEvent {
            guild_id,
            code,
            reason,
        } => {
            warn!(
                "🔌 Conexión de voz del nodo cerrada en guild {} ({}): {}",
                guild_id, code, reason
            );
            None
        }
    }
}
