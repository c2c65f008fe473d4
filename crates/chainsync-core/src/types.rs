//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

use crate::selector::{EventSelector, EventSignature};

// ─── Block / Transaction / Log ───────────────────────────────────────────────

/// The block an event was emitted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
}

/// The transaction that emitted an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash.
    pub hash: String,
    /// Sender address.
    pub from: String,
    /// Recipient address; `None` for contract creation.
    pub to: Option<String>,
    /// Position of the transaction within its block.
    pub index: u32,
}

/// Identity and raw content of a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Stable identifier (`<blockHash>-<logIndex>`).
    pub id: String,
    /// Contract address that emitted the log.
    pub address: String,
    /// Raw topics; `topics[0]` is the event selector.
    pub topics: Vec<String>,
    /// Raw ABI-encoded data.
    pub data: String,
    /// Log index within the block.
    pub log_index: u32,
}

// ─── LogEvent ────────────────────────────────────────────────────────────────

/// A matched, decoded log event as delivered by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Name of the event source that matched (e.g. `"Pool"`).
    pub source: String,
    /// Event name (e.g. `"Swap"`).
    pub name: String,
    /// Decoded parameters.
    pub params: serde_json::Value,
    pub log: Log,
    pub block: Block,
    pub transaction: Transaction,
}

impl LogEvent {
    /// Metric/registry label: `"<source>:<event>"`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.source, self.name)
    }

    /// Block timestamp of the event.
    pub fn timestamp(&self) -> u64 {
        self.block.timestamp
    }
}

// ─── EventPage ───────────────────────────────────────────────────────────────

/// Number of matched logs for one (source, selector) pair within a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEventCount {
    pub source: String,
    pub selector: EventSelector,
    pub count: u64,
}

/// Metadata describing a single page of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    /// Every event with a timestamp at or before this value has been
    /// delivered once this page is consumed.
    pub page_ends_at_timestamp: u64,
    /// Per-source match counts, including sources with no handler.
    #[serde(default)]
    pub counts: Vec<SourceEventCount>,
}

/// One page of events, ordered by (block, log index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<LogEvent>,
    pub metadata: PageMetadata,
}

// ─── EventFilter ─────────────────────────────────────────────────────────────

/// Filter for which logs an event source matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only match logs from these contract addresses (empty = all addresses).
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Only match logs with this topic[0] value (empty = all events).
    #[serde(default)]
    pub topic0_values: Vec<String>,
}

impl EventFilter {
    /// Create a filter for a single contract address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            addresses: vec![addr.into()],
            ..Default::default()
        }
    }

    /// Add a topic0 filter (event selector).
    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        self.topic0_values.push(topic.into());
        self
    }

    /// Returns `true` if `address` matches this filter.
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Returns `true` if `topic0` matches this filter.
    pub fn matches_topic0(&self, topic0: &str) -> bool {
        self.topic0_values.is_empty()
            || self.topic0_values.iter().any(|t| t.eq_ignore_ascii_case(topic0))
    }

    /// Returns `true` if `log` passes both the address and topic0 filters.
    pub fn matches_log(&self, log: &Log) -> bool {
        self.matches_address(&log.address)
            && log
                .topics
                .first()
                .map(|t| self.matches_topic0(t))
                .unwrap_or(self.topic0_values.is_empty())
    }
}

// ─── EventSourceDescriptor ───────────────────────────────────────────────────

/// A configured event source: a named contract (or set of contracts) plus the
/// events it emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSourceDescriptor {
    /// Source name, used as the first half of every handler key.
    pub name: String,
    /// Canonical ABI signatures of the events this source decodes.
    pub events: Vec<EventSignature>,
    /// Criteria filter (addresses / topics).
    #[serde(default)]
    pub filter: EventFilter,
}

impl EventSourceDescriptor {
    pub fn new(name: impl Into<String>, filter: EventFilter) -> Self {
        Self {
            name: name.into(),
            events: vec![],
            filter,
        }
    }

    /// Add an event by its canonical signature, e.g. `"Transfer(address,address,uint256)"`.
    pub fn event(mut self, signature: impl Into<String>) -> Self {
        self.events.push(EventSignature::new(signature));
        self
    }

    /// Find an event of this source by name.
    pub fn find_event(&self, name: &str) -> Option<&EventSignature> {
        self.events.iter().find(|e| e.name() == name)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn log(address: &str, topic0: &str) -> Log {
        Log {
            id: "0xb-0".into(),
            address: address.into(),
            topics: vec![topic0.into()],
            data: "0x".into(),
            log_index: 0,
        }
    }

    #[test]
    fn event_filter_matches_address() {
        let f = EventFilter::address("0xAbCdEf");
        assert!(f.matches_address("0xabcdef")); // case-insensitive
        assert!(!f.matches_address("0x111111"));
    }

    #[test]
    fn event_filter_empty_matches_all() {
        let f = EventFilter::default();
        assert!(f.matches_address("0xanything"));
        assert!(f.matches_topic0("0xanything"));
        assert!(f.matches_log(&log("0x1", "0x2")));
    }

    #[test]
    fn event_filter_matches_log_requires_both() {
        let f = EventFilter::address("0xaa").topic0("0xddf2");
        assert!(f.matches_log(&log("0xAA", "0xDDF2")));
        assert!(!f.matches_log(&log("0xaa", "0x1234")));
        assert!(!f.matches_log(&log("0xbb", "0xddf2")));
    }

    #[test]
    fn descriptor_finds_events_by_name() {
        let src = EventSourceDescriptor::new("Token", EventFilter::default())
            .event("Transfer(address,address,uint256)")
            .event("Approval(address,address,uint256)");
        assert!(src.find_event("Approval").is_some());
        assert!(src.find_event("Mint").is_none());
    }

    #[test]
    fn log_event_label() {
        let ev = LogEvent {
            source: "Token".into(),
            name: "Transfer".into(),
            params: serde_json::Value::Null,
            log: log("0x1", "0x2"),
            block: Block {
                number: 1,
                hash: "0xb".into(),
                parent_hash: "0xa".into(),
                timestamp: 12,
            },
            transaction: Transaction {
                hash: "0xt".into(),
                from: "0xf".into(),
                to: None,
                index: 0,
            },
        };
        assert_eq!(ev.label(), "Token:Transfer");
        assert_eq!(ev.timestamp(), 12);
    }
}
