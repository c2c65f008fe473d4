//! Indexing function traits + the handler registry.
//!
//! Users hand the service a set of [`IndexingFunctions`] keyed by
//! `"<source>:<event>"`. On every reset these are resolved against the
//! configured event sources into an immutable [`HandlerRegistry`] keyed by
//! `(source, selector)`, so dispatch is a single map lookup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::context::IndexingContext;
use crate::error::IndexerError;
use crate::selector::{safe_name, EventSelector};
use crate::types::{EventSourceDescriptor, LogEvent};

/// Label used for the one-time setup function.
pub const SETUP_LABEL: &str = "setup";

/// Trait for user-provided event handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for each event routed to this handler.
    async fn handle(&self, event: &LogEvent, ctx: &IndexingContext) -> anyhow::Result<()>;
}

/// Trait for the one-time setup function, run before the first event after a reset.
#[async_trait]
pub trait SetupHandler: Send + Sync {
    async fn setup(&self, ctx: &IndexingContext) -> anyhow::Result<()>;
}

/// User-registered indexing functions, keyed by `"<source>:<event>"`.
#[derive(Clone, Default)]
pub struct IndexingFunctions {
    handlers: Vec<(String, Arc<dyn EventHandler>)>,
    setup: Option<Arc<dyn SetupHandler>>,
}

impl IndexingFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `"<source>:<event>"`. A later registration for
    /// the same key replaces the earlier one.
    pub fn on(mut self, key: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        let key = key.into();
        self.handlers.retain(|(k, _)| *k != key);
        self.handlers.push((key, handler));
        self
    }

    /// Register the setup function.
    pub fn setup(mut self, handler: Arc<dyn SetupHandler>) -> Self {
        self.setup = Some(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.setup.is_none()
    }
}

/// A resolved handler plus its static metadata.
#[derive(Clone)]
pub struct HandlerEntry {
    /// Selector of the log topic this handler consumes.
    pub selector: EventSelector,
    /// Display-safe `"<source>:<event>"` name.
    pub safe_name: String,
    /// Metrics label, `"<source>:<event>"`.
    pub label: String,
    pub handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("selector", &self.selector)
            .field("safe_name", &self.safe_name)
            .finish()
    }
}

type SourceKey = (String, EventSelector);

/// Immutable `(source, selector)` → handler map.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<SourceKey, HandlerEntry>,
    /// `(source, event name)` → selector, for every configured source event.
    selectors: HashMap<(String, String), EventSelector>,
    /// `(source, selector)` → label, for every configured source event.
    labels: HashMap<SourceKey, String>,
    setup: Option<Arc<dyn SetupHandler>>,
}

impl HandlerRegistry {
    /// Resolve `functions` against `sources`.
    ///
    /// Fails if a key is malformed or names an unknown source or event.
    pub fn build(
        sources: &[EventSourceDescriptor],
        functions: &IndexingFunctions,
    ) -> Result<Self, IndexerError> {
        let mut registry = Self {
            setup: functions.setup.clone(),
            ..Default::default()
        };

        for source in sources {
            for sig in &source.events {
                let selector = sig.selector();
                registry.selectors.insert(
                    (source.name.clone(), sig.name().to_string()),
                    selector.clone(),
                );
                registry.labels.insert(
                    (source.name.clone(), selector),
                    format!("{}:{}", source.name, sig.name()),
                );
            }
        }

        for (key, handler) in &functions.handlers {
            let (source_name, event_name) = key.split_once(':').ok_or_else(|| {
                IndexerError::Config(format!(
                    "indexing function key '{key}' must be '<source>:<event>'"
                ))
            })?;
            let source = sources
                .iter()
                .find(|s| s.name == source_name)
                .ok_or_else(|| {
                    IndexerError::Config(format!("unknown event source '{source_name}' in '{key}'"))
                })?;
            let sig = source.find_event(event_name).ok_or_else(|| {
                IndexerError::Config(format!(
                    "source '{source_name}' has no event named '{event_name}'"
                ))
            })?;
            let selector = sig.selector();
            registry.entries.insert(
                (source.name.clone(), selector.clone()),
                HandlerEntry {
                    selector,
                    safe_name: safe_name(source_name, event_name),
                    label: key.clone(),
                    handler: handler.clone(),
                },
            );
        }

        debug!(
            handlers = registry.entries.len(),
            setup = registry.setup.is_some(),
            "Handler registry built"
        );
        Ok(registry)
    }

    /// Selector for a source's event by name.
    pub fn selector_for(&self, source: &str, event: &str) -> Option<&EventSelector> {
        self.selectors.get(&(source.to_string(), event.to_string()))
    }

    /// Find the handler for a delivered event.
    pub fn lookup(&self, event: &LogEvent) -> Option<&HandlerEntry> {
        let selector = self.selector_for(&event.source, &event.name)?;
        self.entries.get(&(event.source.clone(), selector.clone()))
    }

    /// Metrics label for a `(source, selector)` count; falls back to the
    /// selector hex for events not declared by the source.
    pub fn label_for(&self, source: &str, selector: &EventSelector) -> String {
        self.labels
            .get(&(source.to_string(), selector.clone()))
            .cloned()
            .unwrap_or_else(|| format!("{source}:{selector}"))
    }

    pub fn setup(&self) -> Option<&Arc<dyn SetupHandler>> {
        self.setup.as_ref()
    }

    /// Number of registered event handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
