//! Input sources for engine tasks and stages.
//!
//! A [`Source`] yields one [`Item`] per pull; an [`InboxSource`] yields a
//! whole inbox (the ordered collection a single unit call consumes). Raw
//! sequences, engine task outputs and stage taps all hide behind these two
//! traits, which is what lets one task's input be another task's output.

use crate::item::Item;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;

/// An asynchronous pull-based stream of items. `None` is end-of-stream.
#[async_trait]
pub trait Source: Send {
    /// Pulls the next item.
    async fn pull(&mut self) -> Option<Item>;
}

/// A boxed [`Source`].
pub type BoxSource = Box<dyn Source>;

/// An asynchronous pull-based stream of inboxes. `None` is end-of-stream.
#[async_trait]
pub trait InboxSource: Send {
    /// Pulls the next inbox.
    async fn pull(&mut self) -> Option<Vec<Item>>;
}

/// A boxed [`InboxSource`].
pub type BoxInboxSource = Box<dyn InboxSource>;

/// A source over an in-memory sequence of values.
#[derive(Debug, Default)]
pub struct SequenceSource {
    items: VecDeque<Value>,
}

impl SequenceSource {
    /// Creates a source from a sequence of values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            items: values.into_iter().collect(),
        }
    }
}

impl From<Vec<Value>> for SequenceSource {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

#[async_trait]
impl Source for SequenceSource {
    async fn pull(&mut self) -> Option<Item> {
        self.items.pop_front().map(Item::Value)
    }
}

/// A source over pre-built items, used by tests and adapters.
#[derive(Debug, Default)]
pub struct ItemSequenceSource {
    items: VecDeque<Item>,
}

impl ItemSequenceSource {
    /// Creates a source from a sequence of items.
    #[must_use]
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Source for ItemSequenceSource {
    async fn pull(&mut self) -> Option<Item> {
        self.items.pop_front()
    }
}

/// Wraps a single-item source so each item becomes a one-slot inbox.
pub struct SingleInbox {
    inner: BoxSource,
}

impl SingleInbox {
    /// Wraps a source.
    #[must_use]
    pub fn new(inner: BoxSource) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl InboxSource for SingleInbox {
    async fn pull(&mut self) -> Option<Vec<Item>> {
        self.inner.pull().await.map(|item| vec![item])
    }
}

/// Zips several parallel sources, one item from each per inbox.
///
/// Ends when the first member ends.
pub struct ZipInbox {
    inner: Vec<BoxSource>,
}

impl ZipInbox {
    /// Zips the given sources in order.
    #[must_use]
    pub fn new(inner: Vec<BoxSource>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl InboxSource for ZipInbox {
    async fn pull(&mut self) -> Option<Vec<Item>> {
        let mut inbox = Vec::with_capacity(self.inner.len());
        for source in &mut self.inner {
            inbox.push(source.pull().await?);
        }
        Some(inbox)
    }
}
