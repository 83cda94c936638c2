use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serenity::model::id::UserId;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::audio::track::Track;
use crate::error::{MusicError, MusicResult};

/// Tracks por página en la vista paginada de la cola.
pub const PAGE_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub track: Arc<Track>,
    pub requested_by: UserId,
    /// Orden de inserción dentro del guild, nunca se reutiliza.
    pub seq: u64,
    /// Momento en que se pidió (se muestra en "now playing").
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    /// Repite el track actual.
    Track,
    /// Al terminar, el track vuelve al final de la cola.
    Queue,
}

impl LoopMode {
    pub fn label(&self) -> &'static str {
        match self {
            LoopMode::Off => "off",
            LoopMode::Track => "repeat current",
            LoopMode::Queue => "repeat all",
        }
    }
}

/// Cola FIFO de un guild. El track actual vive fuera de `items`, "delante" de
/// la cabeza.
#[derive(Debug)]
pub struct MusicQueue {
    items: VecDeque<QueueEntry>,
    current: Option<QueueEntry>,
    loop_mode: LoopMode,
    max_size: usize,
    next_seq: u64,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            loop_mode: LoopMode::Off,
            max_size,
            next_seq: 0,
        }
    }

    /// Agrega un track al final. Devuelve la posición (desde 1).
    pub fn enqueue(&mut self, track: Arc<Track>, requested_by: UserId) -> MusicResult<usize> {
        if self.items.len() >= self.max_size {
            return Err(MusicError::QueueFull(self.max_size));
        }

        let entry = self.entry(track, requested_by);
        info!("➕ Agregado a la cola: {}", entry.track.title);
        self.items.push_back(entry);

        Ok(self.items.len())
    }

    /// Termina el track actual y devuelve el siguiente según el modo de loop.
    pub fn dequeue_next(&mut self) -> Option<Arc<Track>> {
        self.advance(false)
    }

    /// Como `dequeue_next`, pero un skip nunca repite el track actual.
    pub fn skip(&mut self) -> Option<Arc<Track>> {
        self.advance(true)
    }

    fn advance(&mut self, skipping: bool) -> Option<Arc<Track>> {
        if let Some(finished) = self.current.take() {
            match self.loop_mode {
                LoopMode::Track if !skipping => {
                    info!("🔂 Repitiendo track: {}", finished.track.title);
                    let track = finished.track.clone();
                    self.current = Some(finished);
                    return Some(track);
                }
                LoopMode::Queue => {
                    debug!("🔁 Track devuelto al final por loop de cola: {}", finished.track.title);
                    let entry = self.entry(finished.track, finished.requested_by);
                    self.items.push_back(entry);
                }
                _ => {}
            }
        }

        match self.items.pop_front() {
            Some(next) => {
                info!("➡️ Siguiente en cola: {}", next.track.title);
                let track = next.track.clone();
                self.current = Some(next);
                Some(track)
            }
            None => {
                info!("📭 Cola vacía, no hay siguiente track");
                None
            }
        }
    }

    /// Coloca un track como actual sin pasar por la cola (autoplay).
    pub fn set_current(&mut self, track: Arc<Track>, requested_by: UserId) {
        let entry = self.entry(track, requested_by);
        self.current = Some(entry);
    }

    pub fn take_current(&mut self) -> Option<Arc<Track>> {
        self.current.take().map(|entry| entry.track)
    }

    /// Elimina la posición indicada (desde 1).
    pub fn remove(&mut self, position: usize) -> MusicResult<Arc<Track>> {
        let len = self.items.len();
        if position == 0 || position > len {
            return Err(MusicError::IndexOutOfRange { index: position, len });
        }

        let removed = self
            .items
            .remove(position - 1)
            .ok_or(MusicError::IndexOutOfRange { index: position, len })?;
        debug!("❌ Track eliminado en posición {}", position);
        Ok(removed.track)
    }

    /// Elimina el primer track cuyo título coincide (sin distinguir mayúsculas).
    pub fn remove_by_title(&mut self, title: &str) -> Option<Arc<Track>> {
        let index = self
            .items
            .iter()
            .position(|entry| entry.track.title.eq_ignore_ascii_case(title))?;
        self.items.remove(index).map(|entry| entry.track)
    }

    /// Limpia la cola (no toca el track actual).
    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        info!("🗑️ Cola limpiada: {} tracks", cleared);
        cleared
    }

    pub fn shuffle(&mut self) {
        let mut items: Vec<_> = self.items.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.items.extend(items);
        info!("🔀 Cola mezclada");
    }

    pub fn contains(&self, track: &Track) -> bool {
        self.items.iter().any(|entry| entry.track.same_as(track))
    }

    pub fn current_entry(&self) -> Option<&QueueEntry> {
        self.current.as_ref()
    }

    pub fn current(&self) -> Option<&Arc<Track>> {
        self.current.as_ref().map(|entry| &entry.track)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Track => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    /// Copia del estado para la UI; no es un cursor vivo.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.as_ref().map(|entry| entry.track.clone()),
            items: self.items.iter().map(|entry| entry.track.clone()).collect(),
            loop_mode: self.loop_mode,
            total_duration: self.total_duration(),
        }
    }

    fn total_duration(&self) -> Duration {
        let queued: Duration = self.items.iter().map(|entry| entry.track.duration()).sum();
        let current = self
            .current
            .as_ref()
            .map(|entry| entry.track.duration())
            .unwrap_or_default();
        queued + current
    }

    fn entry(&mut self, track: Arc<Track>, requested_by: UserId) -> QueueEntry {
        self.next_seq += 1;
        QueueEntry {
            track,
            requested_by,
            seq: self.next_seq,
            added_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<Arc<Track>>,
    pub items: Vec<Arc<Track>>,
    pub loop_mode: LoopMode,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    pub fn total_pages(&self) -> usize {
        self.items.len().div_ceil(PAGE_SIZE)
    }

    /// Página `page` (desde 1), o `None` si no existe.
    pub fn page(&self, page: usize) -> Option<QueuePage> {
        if page == 0 {
            return None;
        }
        self.pages().nth(page - 1)
    }

    /// Secuencia perezosa y finita de páginas de `PAGE_SIZE` tracks.
    pub fn pages(&self) -> impl Iterator<Item = QueuePage> + '_ {
        let total_pages = self.total_pages();
        self.items
            .chunks(PAGE_SIZE)
            .enumerate()
            .map(move |(i, chunk)| QueuePage {
                number: i + 1,
                total_pages,
                first_position: i * PAGE_SIZE + 1,
                items: chunk.to_vec(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub number: usize,
    pub total_pages: usize,
    /// Posición en la cola del primer item de la página.
    pub first_position: usize,
    pub items: Vec<Arc<Track>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::test_track;
    use pretty_assertions::assert_eq;

    fn user() -> UserId {
        UserId::new(42)
    }

    fn queue_with(names: &[&str]) -> MusicQueue {
        let mut queue = MusicQueue::new(100);
        for name in names {
            queue.enqueue(Arc::new(test_track(name)), user()).unwrap();
        }
        queue
    }

    fn titles(queue: &MusicQueue) -> Vec<String> {
        queue.snapshot().items.iter().map(|t| t.identifier.clone()).collect()
    }

    #[test]
    fn test_enqueue_preserves_order_and_positions() {
        let mut queue = MusicQueue::new(100);
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let position = queue.enqueue(Arc::new(test_track(name)), user()).unwrap();
            assert_eq!(position, i + 1);
        }
        assert_eq!(titles(&queue), vec!["a", "b", "c", "d"]);

        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue_next())
            .map(|t| t.identifier.clone())
            .collect();
        assert_eq!(drained, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_round_trip_loop_off() {
        let mut queue = MusicQueue::new(100);
        let track = Arc::new(test_track("a"));
        queue.enqueue(track.clone(), user()).unwrap();
        let before = queue.len();

        let next = queue.dequeue_next().unwrap();
        assert!(Arc::ptr_eq(&next, &track));
        assert_eq!(queue.len(), before - 1);
    }

    #[test]
    fn test_repeat_current_returns_finished_track() {
        let mut queue = queue_with(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Track);
        let playing = queue.dequeue_next().unwrap();
        let len = queue.len();

        let again = queue.dequeue_next().unwrap();
        assert_eq!(again, playing);
        assert_eq!(queue.len(), len);
    }

    #[test]
    fn test_skip_bypasses_repeat_current() {
        let mut queue = queue_with(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Track);
        queue.dequeue_next();
        assert_eq!(queue.skip().unwrap().identifier, "b");
    }

    #[test]
    fn test_repeat_all_cycles_back_to_original_order() {
        let mut queue = queue_with(&["a", "b", "c", "d"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.dequeue_next();
        let current = queue.current().unwrap().identifier.clone();
        let original = titles(&queue);

        let n = original.len() + 1;
        for _ in 0..n {
            queue.dequeue_next();
        }
        assert_eq!(queue.current().unwrap().identifier, current);
        assert_eq!(titles(&queue), original);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut queue = queue_with(&["a", "b"]);
        assert_eq!(
            queue.remove(3).unwrap_err(),
            MusicError::IndexOutOfRange { index: 3, len: 2 }
        );
        assert!(queue.remove(0).is_err());
        assert_eq!(queue.remove(2).unwrap().identifier, "b");
        assert_eq!(titles(&queue), vec!["a"]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut queue = MusicQueue::new(1);
        queue.enqueue(Arc::new(test_track("a")), user()).unwrap();
        assert_eq!(
            queue.enqueue(Arc::new(test_track("b")), user()).unwrap_err(),
            MusicError::QueueFull(1)
        );
    }

    #[test]
    fn test_pages_are_restartable_snapshots() {
        let names: Vec<String> = (0..23).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut queue = queue_with(&refs);
        let snapshot = queue.snapshot();

        let sizes: Vec<usize> = snapshot.pages().map(|p| p.items.len()).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(snapshot.pages().count(), 3);
        assert_eq!(snapshot.page(3).unwrap().first_position, 21);
        assert!(snapshot.page(4).is_none());

        // mutar la cola no altera una instantánea ya tomada
        queue.clear();
        assert_eq!(snapshot.pages().count(), 3);
        assert_eq!(queue.snapshot().pages().count(), 0);
    }
}
