use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::node::{EndReason, NodeEvent};
use crate::audio::registry::SessionRegistry;

/// Qué hizo el router con un evento.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Evento válido que no requiere acción (eco de un stop/skip propio).
    Ignored,
    /// El evento ya no corresponde a la sesión actual.
    Stale,
}

/// Reparte los eventos de los nodos a la sesión de su guild.
#[derive(Clone)]
pub struct PlaybackEventRouter {
    registry: Arc<SessionRegistry>,
}

impl PlaybackEventRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Consume el stream de eventos hasta el apagado. Cada evento se procesa en
    /// su propia task para que un guild lento no frene a los demás.
    pub fn spawn(self, mut events: broadcast::Receiver<NodeEvent>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("📡 Router de eventos de reproducción iniciado");
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => {
                        let router = self.clone();
                        tokio::spawn(async move {
                            router.route(event).await;
                        });
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("⚠️ Router atrasado, {} eventos descartados", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("📡 Router de eventos detenido");
        })
    }

    pub async fn route(&self, event: NodeEvent) -> Disposition {
        let guild_id = event.guild_id();
        let Some(handle) = self.registry.get(guild_id) else {
            debug!("Evento para guild {} sin sesión", guild_id);
            return Disposition::Stale;
        };
        let Ok(mut state) = handle.lock().await else {
            return Disposition::Stale;
        };

        if state.node_session() != Some(event.node_session()) {
            debug!("Evento de otra sesión de nodo en guild {}", guild_id);
            return Disposition::Stale;
        }

        if let NodeEvent::TrackEnded { track, .. } = &event {
            if state.take_abandoned_end(track) {
                debug!("Fin de un track que ya había fallado en guild {}: {}", guild_id, track.title);
                return Disposition::Stale;
            }
        }

        let track = match &event {
            NodeEvent::TrackStarted { track, .. }
            | NodeEvent::TrackEnded { track, .. }
            | NodeEvent::TrackException { track, .. } => track,
        };
        if !state.current().is_some_and(|current| current.same_as(track)) {
            debug!("Evento de un track que ya no suena en guild {}: {}", guild_id, track.title);
            return Disposition::Stale;
        }

        match &event {
            NodeEvent::TrackStarted { track, .. } => {
                state.track_started();
                self.registry.presence().now_playing(guild_id, track);
                Disposition::Applied
            }
            NodeEvent::TrackEnded {
                reason: EndReason::LoadFailed,
                track,
                ..
            } => {
                warn!("⚠️ El nodo no pudo cargar {} en guild {}", track.title, guild_id);
                self.registry.track_failed(&handle, &mut state, false).await;
                Disposition::Applied
            }
            NodeEvent::TrackEnded { reason, .. } => {
                if !reason.may_start_next() {
                    debug!("Fin de track por {:?} en guild {}, sin avanzar", reason, guild_id);
                    return Disposition::Ignored;
                }
                self.registry.track_finished(&handle, &mut state).await;
                Disposition::Applied
            }
            NodeEvent::TrackException { track, message, .. } => {
                error!("❌ Error reproduciendo {} en guild {}: {}", track.title, guild_id, message);
                self.registry.track_failed(&handle, &mut state, true).await;
                Disposition::Applied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::LoopMode;
    use crate::audio::registry::tests::{fixture, single, CHANNEL, GUILD, USER};
    use crate::audio::session::SessionState;
    use crate::audio::track::test_track;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ended(name: &str, reason: EndReason) -> NodeEvent {
        NodeEvent::TrackEnded {
            node_session: "node-1".to_string(),
            guild_id: GUILD,
            track: test_track(name),
            reason,
        }
    }

    #[tokio::test]
    async fn test_finished_track_advances_queue() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("b")).await.unwrap();

        assert_eq!(router.route(ended("a", EndReason::Finished)).await, Disposition::Applied);
        assert_eq!(fx.transport.played(), vec!["a", "b"]);

        assert_eq!(router.route(ended("b", EndReason::Finished)).await, Disposition::Applied);
        let snapshot = fx.registry.snapshot(GUILD).await.unwrap();
        assert_eq!(snapshot.state, SessionState::ConnectedEmpty);
        assert_eq!(fx.presence.updates().last().map(String::as_str), Some("idle"));
    }

    #[tokio::test]
    async fn test_stale_end_event_is_noop() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("b")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("c")).await.unwrap();
        fx.registry.skip(GUILD).await.unwrap();

        // fin atrasado de "a" tras el skip
        assert_eq!(router.route(ended("a", EndReason::Finished)).await, Disposition::Stale);
        assert_eq!(fx.transport.played(), vec!["a", "b"]);
        assert_eq!(
            fx.registry.now_playing(GUILD).await.map(|e| e.track.identifier.clone()),
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn test_replaced_and_stopped_are_ignored() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("b")).await.unwrap();

        assert_eq!(router.route(ended("a", EndReason::Replaced)).await, Disposition::Ignored);
        assert_eq!(router.route(ended("a", EndReason::Stopped)).await, Disposition::Ignored);
        assert_eq!(fx.transport.played(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_events_from_other_node_session_or_guild_are_stale() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();

        let other_node = NodeEvent::TrackEnded {
            node_session: "node-0".to_string(),
            guild_id: GUILD,
            track: test_track("a"),
            reason: EndReason::Finished,
        };
        assert_eq!(router.route(other_node).await, Disposition::Stale);

        fx.registry.disconnect(GUILD).await.unwrap();
        assert_eq!(router.route(ended("a", EndReason::Finished)).await, Disposition::Stale);
    }

    #[tokio::test]
    async fn test_repeat_current_replays_on_finish() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("b")).await.unwrap();
        fx.registry.set_loop_mode(GUILD, LoopMode::Track).await.unwrap();

        router.route(ended("a", EndReason::Finished)).await;
        assert_eq!(fx.transport.played(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_track_start_updates_presence_and_clears_votes() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.vote_skip(GUILD, USER, 10).await.unwrap();

        let started = NodeEvent::TrackStarted {
            node_session: "node-1".to_string(),
            guild_id: GUILD,
            track: test_track("a"),
        };
        assert_eq!(router.route(started).await, Disposition::Applied);
        assert_eq!(fx.presence.updates(), vec!["playing a"]);
        assert_eq!(fx.registry.snapshot(GUILD).await.unwrap().votes, 0);
    }

    #[tokio::test]
    async fn test_exception_advances() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("b")).await.unwrap();

        let exception = NodeEvent::TrackException {
            node_session: "node-1".to_string(),
            guild_id: GUILD,
            track: test_track("a"),
            message: "This video is unavailable".to_string(),
        };
        assert_eq!(router.route(exception).await, Disposition::Applied);
        // el TrackEnded(loadFailed) que sigue ya es obsoleto
        assert_eq!(router.route(ended("a", EndReason::LoadFailed)).await, Disposition::Stale);
        assert_eq!(fx.transport.played(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_exception_under_repeat_current_moves_on() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("b")).await.unwrap();
        fx.registry.set_loop_mode(GUILD, LoopMode::Track).await.unwrap();

        let exception = NodeEvent::TrackException {
            node_session: "node-1".to_string(),
            guild_id: GUILD,
            track: test_track("a"),
            message: "This video is unavailable".to_string(),
        };
        assert_eq!(router.route(exception).await, Disposition::Applied);
        assert_eq!(router.route(ended("a", EndReason::LoadFailed)).await, Disposition::Stale);

        assert_eq!(fx.transport.played(), vec!["a", "b"]);
        assert_eq!(
            fx.registry.now_playing(GUILD).await.map(|e| e.track.identifier.clone()),
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn test_load_failed_with_queue_loop_drops_track() {
        let fx = fixture();
        let router = PlaybackEventRouter::new(fx.registry.clone());
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.set_loop_mode(GUILD, LoopMode::Queue).await.unwrap();

        assert_eq!(router.route(ended("a", EndReason::LoadFailed)).await, Disposition::Applied);
        assert_eq!(fx.transport.played(), vec!["a"]);

        let snapshot = fx.registry.snapshot(GUILD).await.unwrap();
        assert_eq!(snapshot.state, SessionState::ConnectedEmpty);
        assert!(snapshot.queue.items.is_empty());
        assert!(fx.transport.calls().contains(&format!("stop {}", GUILD)));
    }

    #[tokio::test]
    async fn test_spawned_router_consumes_broadcast() {
        let fx = fixture();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("a")).await.unwrap();
        fx.registry.enqueue(GUILD, USER, CHANNEL, single("b")).await.unwrap();

        let (tx, rx) = broadcast::channel(8);
        let shutdown = CancellationToken::new();
        let task = PlaybackEventRouter::new(fx.registry.clone()).spawn(rx, shutdown.clone());

        tx.send(ended("a", EndReason::Finished)).unwrap();
        for _ in 0..20 {
            if fx.transport.played().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.transport.played(), vec!["a", "b"]);

        shutdown.cancel();
        task.await.unwrap();
    }
}
