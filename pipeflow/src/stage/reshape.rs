//! Cardinality-reshaping adapters.
//!
//! All reshaping is expressed against the engine's stride batch unit so
//! sibling branches that change item counts stay positionally aligned and
//! can be zipped back together later.
//!
//! * replay (`produce`/`spawn`): each stride-sized window is emitted
//!   `times` over; a window cut short by upstream end pads its remaining
//!   slots with the exhausted marker, and one final all-exhausted window is
//!   emitted before true end-of-stream.
//! * consume: `group` consecutive windows are transposed into `stride`
//!   inboxes of `group` positionally-aligned items each; with stride 1 this
//!   degenerates to grouping `group` consecutive items.

use crate::engine::source::{BoxSource, InboxSource, Source};
use crate::item::Item;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Resumable state machine for window replay.
///
/// Drivers feed upstream items in when asked and pull emitted items out,
/// which keeps the machine usable from both infallible sources and
/// fallible engine pulls without duplicating the window rules.
#[derive(Debug)]
pub(crate) struct ReplayWindow {
    stride: usize,
    times: usize,
    window: Vec<Item>,
    pos: usize,
    round: usize,
    upstream_done: bool,
    finished: bool,
}

/// One turn of the replay state machine.
#[derive(Debug)]
pub(crate) enum WindowStep {
    /// The machine needs one more upstream item (or end-of-stream).
    Need,
    /// The next emitted item.
    Yield(Item),
    /// True end-of-stream.
    Finished,
}

impl ReplayWindow {
    pub(crate) fn new(stride: usize, times: usize) -> Self {
        Self {
            stride: stride.max(1),
            times: times.max(1),
            window: Vec::new(),
            pos: 0,
            round: 0,
            upstream_done: false,
            finished: false,
        }
    }

    /// Feeds the machine after a [`WindowStep::Need`]; `None` marks the
    /// upstream as ended.
    pub(crate) fn feed(&mut self, item: Option<Item>) {
        match item {
            Some(item) => self.window.push(item),
            None => self.upstream_done = true,
        }
    }

    /// Advances the machine.
    pub(crate) fn step(&mut self) -> WindowStep {
        loop {
            if self.finished {
                return WindowStep::Finished;
            }
            if self.window.len() < self.stride {
                if self.upstream_done {
                    self.window.push(Item::Exhausted);
                    continue;
                }
                return WindowStep::Need;
            }
            if self.pos < self.stride {
                let item = self.window[self.pos].clone();
                self.pos += 1;
                return WindowStep::Yield(item);
            }
            // One replay of the window finished.
            self.round += 1;
            self.pos = 0;
            if self.round >= self.times {
                if self.window.iter().all(Item::is_exhausted) {
                    self.finished = true;
                    return WindowStep::Finished;
                }
                self.window.clear();
                self.round = 0;
            }
        }
    }
}

/// Replays each upstream stride window a fixed number of times.
///
/// This is the `spawn` adapter on a stage's input side; the same machine
/// drives `produce` on the output side.
pub struct ReplaySource {
    inner: BoxSource,
    window: ReplayWindow,
}

impl ReplaySource {
    /// Wraps a source so each stride window is emitted `times` over.
    #[must_use]
    pub fn new(inner: BoxSource, stride: usize, times: usize) -> Self {
        Self {
            inner,
            window: ReplayWindow::new(stride, times),
        }
    }
}

#[async_trait]
impl Source for ReplaySource {
    async fn pull(&mut self) -> Option<Item> {
        loop {
            match self.window.step() {
                WindowStep::Yield(item) => return Some(item),
                WindowStep::Finished => return None,
                WindowStep::Need => {
                    let item = self.inner.pull().await;
                    self.window.feed(item);
                }
            }
        }
    }
}

/// Groups replayed windows back into positionally-aligned inboxes.
///
/// The inverse of [`ReplaySource`] over matched stride and count: `group`
/// consecutive windows of `stride` items are transposed so inbox *j*
/// holds position *j* of every window.
pub struct ConsumeSource {
    inner: BoxSource,
    stride: usize,
    group: usize,
    queue: VecDeque<Vec<Item>>,
    done: bool,
}

impl ConsumeSource {
    /// Wraps a source, grouping `group` windows of `stride` per transpose.
    #[must_use]
    pub fn new(inner: BoxSource, stride: usize, group: usize) -> Self {
        Self {
            inner,
            stride: stride.max(1),
            group: group.max(1),
            queue: VecDeque::new(),
            done: false,
        }
    }
}

#[async_trait]
impl InboxSource for ConsumeSource {
    async fn pull(&mut self) -> Option<Vec<Item>> {
        if let Some(inbox) = self.queue.pop_front() {
            return Some(inbox);
        }
        if self.done {
            return None;
        }
        let span = self.group * self.stride;
        let mut items = Vec::with_capacity(span);
        while items.len() < span {
            match self.inner.pull().await {
                Some(item) => items.push(item),
                None => {
                    self.done = true;
                    if items.is_empty() {
                        return None;
                    }
                    items.resize(span, Item::Exhausted);
                    break;
                }
            }
        }
        for j in 0..self.stride {
            let inbox = (0..self.group)
                .map(|i| items[i * self.stride + j].clone())
                .collect();
            self.queue.push_back(inbox);
        }
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::source::SequenceSource;
    use serde_json::json;

    fn numbers(n: i64) -> BoxSource {
        Box::new(SequenceSource::new((0..n).map(|v| json!(v)).collect()))
    }

    fn v(n: i64) -> Item {
        Item::Value(json!(n))
    }

    async fn collect(mut source: ReplaySource) -> Vec<Item> {
        let mut out = Vec::new();
        while let Some(item) = source.pull().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_replay_stride3_times2_over_seven_items() {
        let source = ReplaySource::new(numbers(7), 3, 2);
        let out = collect(source).await;
        let s = Item::Exhausted;
        let expected = vec![
            v(0), v(1), v(2), v(0), v(1), v(2),
            v(3), v(4), v(5), v(3), v(4), v(5),
            v(6), s.clone(), s.clone(), v(6), s.clone(), s.clone(),
            s.clone(), s.clone(), s.clone(), s.clone(), s.clone(), s,
        ];
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_replay_exact_multiple_still_flushes_terminal_window() {
        let source = ReplaySource::new(numbers(3), 3, 2);
        let out = collect(source).await;
        // [0,1,2] twice, then the all-exhausted flush window twice.
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..6], &[v(0), v(1), v(2), v(0), v(1), v(2)]);
        assert!(out[6..].iter().all(Item::is_exhausted));
    }

    #[tokio::test]
    async fn test_consume_inverts_replay() {
        let replayed = ReplaySource::new(numbers(7), 3, 2);
        let mut consume = ConsumeSource::new(Box::new(replayed), 3, 2);

        let mut groups = Vec::new();
        while let Some(inbox) = consume.pull().await {
            groups.push(inbox);
        }
        let s = Item::Exhausted;
        let mut expected: Vec<Vec<Item>> =
            (0..=6).map(|n| vec![v(n), v(n)]).collect();
        for _ in 0..5 {
            expected.push(vec![s.clone(), s.clone()]);
        }
        assert_eq!(groups, expected);
    }

    #[tokio::test]
    async fn test_consume_with_stride_one_groups_consecutive_items() {
        let mut consume = ConsumeSource::new(numbers(4), 1, 2);
        assert_eq!(consume.pull().await, Some(vec![v(0), v(1)]));
        assert_eq!(consume.pull().await, Some(vec![v(2), v(3)]));
        assert_eq!(consume.pull().await, None);
    }

    #[tokio::test]
    async fn test_consume_pads_a_short_tail() {
        let mut consume = ConsumeSource::new(numbers(3), 1, 2);
        assert_eq!(consume.pull().await, Some(vec![v(0), v(1)]));
        assert_eq!(consume.pull().await, Some(vec![v(2), Item::Exhausted]));
        assert_eq!(consume.pull().await, None);
    }

    #[tokio::test]
    async fn test_replay_of_empty_upstream_emits_flush_window_only() {
        let source = ReplaySource::new(numbers(0), 2, 2);
        let out = collect(source).await;
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(Item::is_exhausted));
    }
}
