//! Event aggregator contract: the upstream component that supplies ordered
//! pages of matched events and advances a finality checkpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::IndexerError;
use crate::selector::EventSelector;
use crate::types::{EventPage, EventSourceDescriptor, LogEvent, PageMetadata, SourceEventCount};

/// A lazily pulled sequence of pages covering one `[from, to]` range.
pub type EventPageStream<'a> = BoxStream<'a, Result<EventPage, IndexerError>>;

/// Notifications published by an aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorEvent {
    /// Complete, finalized event data is available through `timestamp`.
    NewCheckpoint { timestamp: u64 },
    /// Every block after `common_ancestor_timestamp` was invalidated.
    Reorg { common_ancestor_timestamp: u64 },
}

/// Trait for the upstream event aggregator.
pub trait EventAggregator: Send + Sync {
    /// The timestamp through which finalized event data is available.
    fn checkpoint(&self) -> u64;

    /// Pages covering `[from, to]` in ascending order. Finite for a bounded range.
    fn get_events(&self, from: u64, to: u64) -> EventPageStream<'_>;

    /// Subscribe to checkpoint and reorg notifications.
    fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent>;
}

// ─── In-memory aggregator (for testing and replay) ───────────────────────────

/// In-memory aggregator serving a fixed set of events.
///
/// Events are filtered through each source's criteria on insertion, paged by
/// `page_size` (never splitting a timestamp across two pages), and every
/// requested range is recorded so callers can inspect fetch windows.
pub struct MemoryAggregator {
    sources: Vec<EventSourceDescriptor>,
    page_size: usize,
    events: Mutex<Vec<LogEvent>>,
    checkpoint: AtomicU64,
    requests: Mutex<Vec<(u64, u64)>>,
    fail_next: AtomicBool,
    tx: broadcast::Sender<AggregatorEvent>,
}

impl MemoryAggregator {
    pub fn new(sources: Vec<EventSourceDescriptor>, page_size: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            sources,
            page_size: page_size.max(1),
            events: Mutex::new(vec![]),
            checkpoint: AtomicU64::new(0),
            requests: Mutex::new(vec![]),
            fail_next: AtomicBool::new(false),
            tx,
        }
    }

    /// Add events. Events whose source is unknown or whose log fails the
    /// source filter are dropped. Returns the number kept.
    pub fn push_events(&self, events: impl IntoIterator<Item = LogEvent>) -> usize {
        let mut stored = self.events.lock().unwrap();
        let before = stored.len();
        stored.extend(events.into_iter().filter(|e| {
            self.sources
                .iter()
                .any(|s| s.name == e.source && s.filter.matches_log(&e.log))
        }));
        stored.sort_by_key(|e| (e.block.timestamp, e.block.number, e.log.log_index));
        stored.len() - before
    }

    /// Advance the checkpoint and notify subscribers.
    pub fn set_checkpoint(&self, timestamp: u64) {
        self.checkpoint.store(timestamp, Ordering::SeqCst);
        let _ = self.tx.send(AggregatorEvent::NewCheckpoint { timestamp });
    }

    /// Drop every event after `common_ancestor_timestamp`, pull the checkpoint
    /// back to it, and notify subscribers.
    pub fn reorg(&self, common_ancestor_timestamp: u64) {
        self.events
            .lock()
            .unwrap()
            .retain(|e| e.block.timestamp <= common_ancestor_timestamp);
        debug!(common_ancestor_timestamp, "Aggregator reorg");
        self.checkpoint
            .fetch_min(common_ancestor_timestamp, Ordering::SeqCst);
        let _ = self.tx.send(AggregatorEvent::Reorg {
            common_ancestor_timestamp,
        });
    }

    /// Make the next `get_events` call fail.
    pub fn fail_next_fetch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every `[from, to]` range requested so far.
    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.requests.lock().unwrap().clone()
    }

    fn selector_of(&self, event: &LogEvent) -> Option<EventSelector> {
        self.sources
            .iter()
            .find(|s| s.name == event.source)
            .and_then(|s| s.find_event(&event.name))
            .map(|sig| sig.selector())
            .or_else(|| EventSelector::from_topics(&event.log.topics))
    }

    fn paginate(&self, from: u64, to: u64) -> Vec<EventPage> {
        let in_range: Vec<LogEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block.timestamp >= from && e.block.timestamp <= to)
            .cloned()
            .collect();

        let mut pages = vec![];
        let mut current: Vec<LogEvent> = vec![];
        for event in in_range {
            let boundary = current.len() >= self.page_size
                && current
                    .last()
                    .map(|last| last.block.timestamp != event.block.timestamp)
                    .unwrap_or(false);
            if boundary {
                let ends_at = current.last().map(|e| e.block.timestamp).unwrap_or(to);
                pages.push(self.page(std::mem::take(&mut current), ends_at));
            }
            current.push(event);
        }
        pages.push(self.page(current, to));
        pages
    }

    fn page(&self, events: Vec<LogEvent>, ends_at: u64) -> EventPage {
        let mut counts: BTreeMap<(String, EventSelector), u64> = BTreeMap::new();
        for event in &events {
            if let Some(selector) = self.selector_of(event) {
                *counts.entry((event.source.clone(), selector)).or_default() += 1;
            }
        }
        EventPage {
            events,
            metadata: PageMetadata {
                page_ends_at_timestamp: ends_at,
                counts: counts
                    .into_iter()
                    .map(|((source, selector), count)| SourceEventCount {
                        source,
                        selector,
                        count,
                    })
                    .collect(),
            },
        }
    }
}

impl EventAggregator for MemoryAggregator {
    fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    fn get_events(&self, from: u64, to: u64) -> EventPageStream<'_> {
        self.requests.lock().unwrap().push((from, to));
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return stream::once(async move {
                Err(IndexerError::Aggregator(format!(
                    "event store unavailable for [{from}, {to}]"
                )))
            })
            .boxed();
        }
        stream::iter(self.paginate(from, to).into_iter().map(Ok)).boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, EventFilter, Log, Transaction};
    use futures::TryStreamExt;

    fn sources() -> Vec<EventSourceDescriptor> {
        vec![EventSourceDescriptor::new("Token", EventFilter::address("0xaa"))
            .event("Transfer(address,address,uint256)")]
    }

    fn ev(address: &str, ts: u64, log_index: u32) -> LogEvent {
        LogEvent {
            source: "Token".into(),
            name: "Transfer".into(),
            params: serde_json::Value::Null,
            log: Log {
                id: format!("0x{ts}-{log_index}"),
                address: address.into(),
                topics: vec![],
                data: "0x".into(),
                log_index,
            },
            block: Block {
                number: ts,
                hash: format!("0x{ts}"),
                parent_hash: format!("0x{}", ts.saturating_sub(1)),
                timestamp: ts,
            },
            transaction: Transaction {
                hash: format!("0xt{ts}"),
                from: "0xf".into(),
                to: Some("0xaa".into()),
                index: 0,
            },
        }
    }

    #[test]
    fn push_filters_by_source_criteria() {
        let agg = MemoryAggregator::new(sources(), 10);
        assert_eq!(agg.push_events([ev("0xaa", 1, 0), ev("0xbb", 2, 0)]), 1);
    }

    #[tokio::test]
    async fn pages_never_split_a_timestamp() {
        let agg = MemoryAggregator::new(sources(), 2);
        agg.push_events([
            ev("0xaa", 1, 0),
            ev("0xaa", 2, 0),
            ev("0xaa", 2, 1),
            ev("0xaa", 3, 0),
        ]);
        let pages: Vec<EventPage> = agg.get_events(0, 10).try_collect().await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].events.len(), 3);
        assert_eq!(pages[0].metadata.page_ends_at_timestamp, 2);
        assert_eq!(pages[1].metadata.page_ends_at_timestamp, 10);
        assert_eq!(pages[0].metadata.counts[0].count, 3);
        assert_eq!(agg.requested_ranges(), vec![(0, 10)]);
    }

    #[tokio::test]
    async fn empty_range_yields_single_empty_page() {
        let agg = MemoryAggregator::new(sources(), 2);
        let pages: Vec<EventPage> = agg.get_events(5, 9).try_collect().await.unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].events.is_empty());
        assert_eq!(pages[0].metadata.page_ends_at_timestamp, 9);
    }

    #[tokio::test]
    async fn reorg_drops_events_and_notifies() {
        let agg = MemoryAggregator::new(sources(), 10);
        let mut rx = agg.subscribe();
        agg.push_events([ev("0xaa", 4, 0), ev("0xaa", 8, 0)]);
        agg.set_checkpoint(10);
        agg.reorg(6);
        assert_eq!(agg.checkpoint(), 6);
        assert_eq!(
            rx.recv().await.unwrap(),
            AggregatorEvent::NewCheckpoint { timestamp: 10 }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            AggregatorEvent::Reorg {
                common_ancestor_timestamp: 6
            }
        );
        let pages: Vec<EventPage> = agg.get_events(0, 10).try_collect().await.unwrap();
        assert_eq!(pages[0].events.len(), 1);
    }

    #[tokio::test]
    async fn injected_fetch_failure() {
        let agg = MemoryAggregator::new(sources(), 10);
        agg.fail_next_fetch();
        let res: Result<Vec<EventPage>, _> = agg.get_events(0, 1).try_collect().await;
        assert!(matches!(res, Err(IndexerError::Aggregator(_))));
        let res: Result<Vec<EventPage>, _> = agg.get_events(0, 1).try_collect().await;
        assert!(res.is_ok());
    }
}
