use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::bmf::Bmf;

/// Largest number of items handed out per read call.
pub const READ_BATCH: usize = 64;

/// Per-publication tuning. Every field maps to a recognized configuration
/// option of the same name.
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
#[serde(default)]
pub struct QueueOptions {
    pub capacity: usize,
    pub pacing_on_threshold: f32,
    pub pacing_off_threshold: f32,
    pub alpha: f32,
    pub minimum_writes_limit: u32,
    pub pacing_interval: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 10000,
            pacing_on_threshold: 0.75,
            pacing_off_threshold: 0.5,
            alpha: 0.5,
            minimum_writes_limit: 100,
            pacing_interval: 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ReaderState {
    /// Absolute sequence number of the next item this reader will see.
    pos: u64,
    read_items: u64,
}

#[derive(Debug, Clone, Copy)]
struct WriterState {
    /// Writes consumed in the current pacing interval.
    used: u32,
    /// Current per-interval quota; meaningful only while pacing is on.
    limit: f32,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<Arc<Bmf>>,
    /// Sequence number of `items[0]`.
    base: u64,
    readers: Vec<Option<ReaderState>>,
    writers: Vec<Option<WriterState>>,
    interval_start: Instant,
    pacing: bool,
    pacing_count: u64,
    discarded: u64,
    shutdown: bool,
}

/// A multi-reader bounded publication. An item is freed only once every
/// live reader has passed it; each reader owns an independent cursor.
#[derive(Debug)]
pub struct Publication {
    name: String,
    opts: QueueOptions,
    inner: Mutex<Inner>,
    /// Signalled when a slot may have been freed.
    space: Notify,
    /// Signalled when an item has been published or on shutdown.
    arrival: Notify,
}

/// Point-in-time counters for the status sampler.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub capacity: usize,
    pub used: usize,
    pub readers: usize,
    pub writers: usize,
    pub pacing: bool,
    pub writes_limit: u32,
    pub pacing_count: u64,
    pub discarded: u64,
}

impl Publication {
    pub fn new(name: &str, opts: QueueOptions) -> Arc<Publication> {
        Arc::new(Publication {
            name: name.to_string(),
            opts,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                base: 0,
                readers: Vec::new(),
                writers: Vec::new(),
                interval_start: Instant::now(),
                pacing: false,
                pacing_count: 0,
                discarded: 0,
                shutdown: false,
            }),
            space: Notify::new(),
            arrival: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.opts.capacity
    }

    pub fn add_writer(self: &Arc<Self>) -> QueueWriter {
        let mut inner = self.inner.lock().unwrap();
        let state = WriterState {
            used: 0,
            limit: self.opts.capacity as f32,
        };
        let index = match inner.writers.iter().position(|w| w.is_none()) {
            Some(i) => {
                inner.writers[i] = Some(state);
                i
            }
            None => {
                inner.writers.push(Some(state));
                inner.writers.len() - 1
            }
        };
        QueueWriter {
            publication: self.clone(),
            index,
        }
    }

    pub fn add_reader(self: &Arc<Self>) -> QueueReader {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.base + inner.items.len() as u64;
        let state = ReaderState { pos, read_items: 0 };
        let index = match inner.readers.iter().position(|r| r.is_none()) {
            Some(i) => {
                inner.readers[i] = Some(state);
                i
            }
            None => {
                inner.readers.push(Some(state));
                inner.readers.len() - 1
            }
        };
        QueueReader {
            publication: self.clone(),
            index,
        }
    }

    /// Mark the publication as being torn down; readers drain what is
    /// buffered and then receive the end sentinel.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        drop(inner);
        self.arrival.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            name: self.name.clone(),
            capacity: self.opts.capacity,
            used: inner.items.len(),
            readers: inner.readers.iter().flatten().count(),
            writers: inner.writers.iter().flatten().count(),
            pacing: inner.pacing,
            writes_limit: if inner.pacing {
                inner
                    .writers
                    .iter()
                    .flatten()
                    .map(|w| w.limit as u32)
                    .min()
                    .unwrap_or(0)
            } else {
                0
            },
            pacing_count: inner.pacing_count,
            discarded: inner.discarded,
        }
    }

    /// Roll the pacing interval over if it has elapsed and recompute each
    /// writer's quota: while pacing is on quotas decay toward the minimum
    /// writes limit by exponential moving average.
    fn roll_interval(&self, inner: &mut Inner) {
        let interval = Duration::from_secs(self.opts.pacing_interval.max(1));
        if inner.interval_start.elapsed() < interval {
            return;
        }
        inner.interval_start = Instant::now();

        let occupancy = inner.items.len() as f32 / self.opts.capacity as f32;
        if !inner.pacing && occupancy > self.opts.pacing_on_threshold {
            inner.pacing = true;
            inner.pacing_count += 1;
            debug!("queue {}: pacing on at {:.0}% full", self.name, occupancy * 100.0);
        } else if inner.pacing && occupancy < self.opts.pacing_off_threshold {
            inner.pacing = false;
            debug!("queue {}: pacing off", self.name);
        }

        let alpha = self.opts.alpha.clamp(0.0, 1.0);
        let min = self.opts.minimum_writes_limit as f32;
        for writer in inner.writers.iter_mut().flatten() {
            writer.used = 0;
            if inner.pacing {
                writer.limit = (alpha * writer.limit + (1.0 - alpha) * min).max(min);
            } else {
                writer.limit = self.opts.capacity as f32;
            }
        }
    }

    /// When the publication is full and the slowest reader has fallen more
    /// than half the capacity behind the next-slowest, skip it forward past
    /// the messages nobody else still needs. Called on the write path with
    /// the lock held.
    fn adjust_slowest_reader(&self, inner: &mut Inner) {
        let mut cursors: Vec<(usize, u64)> = inner
            .readers
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|r| (i, r.pos)))
            .collect();
        if cursors.len() < 2 {
            return;
        }
        cursors.sort_by_key(|(_, pos)| *pos);
        let (slowest_index, slowest_pos) = cursors[0];
        let (_, next_pos) = cursors[1];
        let threshold = (self.opts.capacity / 2) as u64;
        if next_pos - slowest_pos <= threshold {
            return;
        }
        let skipped = next_pos - slowest_pos;
        if let Some(reader) = inner.readers[slowest_index].as_mut() {
            reader.pos = next_pos;
        }
        inner.discarded += skipped;
        warn!(
            "queue {}: slowest reader skipped forward {} messages",
            self.name, skipped
        );
        self.reclaim(inner);
    }

    /// Drop items every live reader has passed.
    fn reclaim(&self, inner: &mut Inner) {
        let Some(min_pos) = inner.readers.iter().flatten().map(|r| r.pos).min() else {
            // No readers at all: the publication drains into the void.
            inner.base += inner.items.len() as u64;
            inner.items.clear();
            return;
        };
        let mut freed = false;
        while inner.base < min_pos && !inner.items.is_empty() {
            inner.items.pop_front();
            inner.base += 1;
            freed = true;
        }
        if freed {
            self.space.notify_waiters();
        }
    }

    async fn write(&self, index: usize, bmf: Bmf) {
        let item = Arc::new(bmf);
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            let wait_interval;
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutdown {
                    return;
                }
                self.roll_interval(&mut inner);

                let quota_left = match inner.writers.get(index).and_then(|w| *w) {
                    Some(w) => !inner.pacing || w.used < w.limit as u32,
                    None => return,
                };
                if quota_left {
                    if inner.items.len() >= self.opts.capacity {
                        self.reclaim(&mut inner);
                        if inner.items.len() >= self.opts.capacity {
                            self.adjust_slowest_reader(&mut inner);
                        }
                    }
                    if inner.items.len() < self.opts.capacity {
                        inner.items.push_back(item.clone());
                        if let Some(writer) = inner.writers[index].as_mut() {
                            writer.used += 1;
                        }
                        drop(inner);
                        self.arrival.notify_waiters();
                        return;
                    }
                    wait_interval = None;
                } else {
                    // Quota exhausted: sleep out the rest of the interval.
                    let interval = Duration::from_secs(self.opts.pacing_interval.max(1));
                    wait_interval =
                        Some(interval.saturating_sub(inner.interval_start.elapsed()));
                }
            }
            match wait_interval {
                Some(remaining) => {
                    tokio::time::sleep(remaining.max(Duration::from_millis(10))).await
                }
                None => space.await,
            }
        }
    }

    async fn read(&self, index: usize) -> Option<Vec<Arc<Bmf>>> {
        loop {
            let arrival = self.arrival.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                let Some(reader) = inner.readers.get(index).and_then(|r| *r) else {
                    return None;
                };
                let avail = (inner.base + inner.items.len() as u64).saturating_sub(reader.pos);
                if avail > 0 {
                    let take = (avail as usize).min(READ_BATCH);
                    let start = (reader.pos - inner.base) as usize;
                    let batch: Vec<Arc<Bmf>> = inner
                        .items
                        .iter()
                        .skip(start)
                        .take(take)
                        .cloned()
                        .collect();
                    if let Some(reader) = inner.readers[index].as_mut() {
                        reader.pos += take as u64;
                        reader.read_items += take as u64;
                    }
                    self.reclaim(&mut inner);
                    return Some(batch);
                }
                if inner.shutdown {
                    return None;
                }
            }
            arrival.await;
        }
    }

    fn remove_writer(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.writers.get_mut(index) {
            *slot = None;
        }
    }

    fn remove_reader(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.readers.get_mut(index) {
            *slot = None;
        }
        self.reclaim(&mut inner);
    }
}

/// Write handle; registration is released on drop.
#[derive(Debug)]
pub struct QueueWriter {
    publication: Arc<Publication>,
    index: usize,
}

impl QueueWriter {
    /// Publish one item. Blocks while the publication is full or the
    /// writer's pacing quota is spent; never silently drops.
    pub async fn write(&self, bmf: Bmf) {
        self.publication.write(self.index, bmf).await
    }

    pub fn publication(&self) -> &Arc<Publication> {
        &self.publication
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        self.publication.remove_writer(self.index);
    }
}

/// Read handle; registration is released on drop, which also frees any
/// items this reader alone was holding back.
#[derive(Debug)]
pub struct QueueReader {
    publication: Arc<Publication>,
    index: usize,
}

impl QueueReader {
    /// Receive the next batch, blocking while the publication is empty.
    /// Returns `None` once the publication is being torn down and nothing
    /// is left to drain.
    pub async fn read(&self) -> Option<Vec<Arc<Bmf>>> {
        self.publication.read(self.index).await
    }
}

impl Drop for QueueReader {
    fn drop(&mut self) {
        self.publication.remove_reader(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bmf::BmfType;

    fn bmf(n: u32) -> Bmf {
        Bmf::with_payload(n, BmfType::MsgFromPeer, vec![n as u8])
    }

    #[tokio::test]
    async fn fifo_order_single_reader() {
        let publication = Publication::new("test", QueueOptions::default());
        let writer = publication.add_writer();
        let reader = publication.add_reader();

        for n in 0..10 {
            writer.write(bmf(n)).await;
        }
        let mut seen = Vec::new();
        while seen.len() < 10 {
            let batch = reader.read().await.unwrap();
            seen.extend(batch.iter().map(|b| b.session_id));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn all_readers_see_every_item() {
        let publication = Publication::new("test", QueueOptions::default());
        let writer = publication.add_writer();
        let first = publication.add_reader();
        let second = publication.add_reader();

        for n in 0..5 {
            writer.write(bmf(n)).await;
        }
        for reader in [&first, &second] {
            let mut seen = Vec::new();
            while seen.len() < 5 {
                let batch = reader.read().await.unwrap();
                seen.extend(batch.iter().map(|b| b.session_id));
            }
            assert_eq!(seen, (0..5).collect::<Vec<_>>());
        }
        assert!(publication.is_empty());
    }

    #[tokio::test]
    async fn slot_freed_only_after_slowest_reader() {
        let publication = Publication::new("test", QueueOptions::default());
        let writer = publication.add_writer();
        let fast = publication.add_reader();
        let _slow = publication.add_reader();

        writer.write(bmf(1)).await;
        let _ = fast.read().await.unwrap();
        // The slow reader has not read yet, so the item must remain.
        assert!(!publication.is_empty());
    }

    #[tokio::test]
    async fn reader_join_sees_only_later_items() {
        let publication = Publication::new("test", QueueOptions::default());
        let writer = publication.add_writer();
        let early = publication.add_reader();
        writer.write(bmf(1)).await;
        let late = publication.add_reader();
        writer.write(bmf(2)).await;

        let mut early_seen = Vec::new();
        while early_seen.len() < 2 {
            early_seen.extend(
                early
                    .read()
                    .await
                    .unwrap()
                    .iter()
                    .map(|b| b.session_id),
            );
        }
        assert_eq!(early_seen, vec![1, 2]);

        let late_seen = late.read().await.unwrap();
        assert_eq!(late_seen.len(), 1);
        assert_eq!(late_seen[0].session_id, 2);
    }

    #[tokio::test]
    async fn shutdown_returns_sentinel_after_drain() {
        let publication = Publication::new("test", QueueOptions::default());
        let writer = publication.add_writer();
        let reader = publication.add_reader();
        writer.write(bmf(7)).await;
        publication.shutdown();

        let batch = reader.read().await.unwrap();
        assert_eq!(batch[0].session_id, 7);
        assert!(reader.read().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_blocks_writer_until_read() {
        let opts = QueueOptions {
            capacity: 2,
            ..Default::default()
        };
        let publication = Publication::new("test", opts);
        let writer = publication.add_writer();
        let reader = publication.add_reader();

        writer.write(bmf(1)).await;
        writer.write(bmf(2)).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), writer.write(bmf(3)));
        assert!(blocked.await.is_err());

        let _ = reader.read().await.unwrap();
        tokio::time::timeout(Duration::from_millis(200), writer.write(bmf(3)))
            .await
            .expect("write must proceed after a slot frees");
    }

    #[tokio::test]
    async fn slowest_reader_skipped_when_far_behind() {
        let opts = QueueOptions {
            capacity: 4,
            ..Default::default()
        };
        let publication = Publication::new("test", opts);
        let writer = publication.add_writer();
        let fast = publication.add_reader();
        let slow = publication.add_reader();

        for n in 0..4 {
            writer.write(bmf(n)).await;
        }
        // Fast reader drains everything; slow reader sits at the start,
        // more than capacity/2 behind.
        let mut drained = 0;
        while drained < 4 {
            drained += fast.read().await.unwrap().len();
        }
        writer.write(bmf(4)).await;

        let batch = slow.read().await.unwrap();
        // The slow reader was skipped past the discarded prefix.
        assert!(batch[0].session_id >= 4);
        assert!(publication.stats().discarded > 0);
    }
}
