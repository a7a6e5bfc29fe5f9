//! Queue & Arbitration
//!
//! Priority-and-pin ordered queue of rendered segments. The total order is
//! (pinned desc, priority desc, enqueue sequence asc); every mutation
//! re-sorts so readers always observe that order.

use crate::error::{Result, RjError};
use crate::models::segment::clamp_priority;
use crate::models::{QueueItem, RenderedSegment};
use chrono::Utc;

#[derive(Debug, Default)]
pub struct PlayoutQueue {
    items: Vec<QueueItem>,
    next_seq: u64,
}

impl PlayoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, mut segment: RenderedSegment) -> QueueItem {
        segment.priority = clamp_priority(segment.priority);
        let item = QueueItem {
            segment,
            enqueued_at: Utc::now(),
            enqueue_seq: self.next_seq,
        };
        self.next_seq += 1;
        self.items.push(item.clone());
        self.resort();
        item
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.segment.id != id);
        let removed = self.items.len() != before;
        if removed {
            self.resort();
        }
        removed
    }

    pub fn update(
        &mut self,
        id: &str,
        priority: Option<u16>,
        pinned: Option<bool>,
    ) -> Result<QueueItem> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.segment.id == id)
            .ok_or_else(|| RjError::QueueMiss(id.to_string()))?;
        if let Some(priority) = priority {
            item.segment.priority = clamp_priority(priority);
        }
        if let Some(pinned) = pinned {
            item.segment.pinned = pinned;
        }
        let updated = item.clone();
        self.resort();
        Ok(updated)
    }

    pub fn head(&self) -> Option<&QueueItem> {
        self.items.first()
    }

    pub fn pop(&mut self) -> Option<QueueItem> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_duration_sec(&self) -> f64 {
        self.items.iter().map(|item| item.segment.duration_sec).sum()
    }

    fn resort(&mut self) {
        self.items.sort_by(|a, b| {
            b.segment
                .pinned
                .cmp(&a.segment.pinned)
                .then(b.segment.priority.cmp(&a.segment.priority))
                .then(a.enqueue_seq.cmp(&b.enqueue_seq))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SegmentKind, SegmentSource};
    use std::path::PathBuf;

    fn seg(note: &str, source: SegmentSource, priority: u16, pinned: bool) -> RenderedSegment {
        let mut s = RenderedSegment::new(
            SegmentKind::Song,
            PathBuf::from(format!("/tmp/{note}.wav")),
            30.0,
            note,
            source,
        )
        .with_priority(priority);
        s.pinned = pinned;
        s
    }

    fn order_is_valid(queue: &PlayoutQueue) -> bool {
        queue.items().windows(2).all(|pair| {
            let (a, b) = (&pair[0].segment, &pair[1].segment);
            (a.pinned, a.priority) > (b.pinned, b.priority)
                || ((a.pinned, a.priority) == (b.pinned, b.priority)
                    && pair[0].enqueue_seq < pair[1].enqueue_seq)
        })
    }

    #[test]
    fn total_order_pinned_priority_then_seq() {
        let mut queue = PlayoutQueue::new();
        let a = queue.enqueue(seg("a", SegmentSource::Auto, 50, false));
        let b = queue.enqueue(seg("b", SegmentSource::Manual, 100, false));
        let c = queue.enqueue(seg("c", SegmentSource::Manual, 120, true));

        assert_eq!(queue.head().unwrap().segment.id, c.segment.id);
        assert!(order_is_valid(&queue));

        // Pinning b below c's priority keeps c at the head, b second.
        queue
            .update(&b.segment.id, Some(80), Some(true))
            .expect("b exists");
        assert_eq!(queue.head().unwrap().segment.id, c.segment.id);
        assert_eq!(queue.items()[1].segment.id, b.segment.id);
        assert_eq!(queue.items()[2].segment.id, a.segment.id);
        assert!(order_is_valid(&queue));
    }

    #[test]
    fn equal_keys_tie_break_by_enqueue_order() {
        let mut queue = PlayoutQueue::new();
        let first = queue.enqueue(seg("first", SegmentSource::Auto, 50, false));
        let second = queue.enqueue(seg("second", SegmentSource::Auto, 50, false));
        assert_eq!(queue.items()[0].segment.id, first.segment.id);
        assert_eq!(queue.items()[1].segment.id, second.segment.id);
    }

    #[test]
    fn enqueue_then_remove_restores_previous_state() {
        let mut queue = PlayoutQueue::new();
        queue.enqueue(seg("keep", SegmentSource::Auto, 50, false));
        let before: Vec<String> = queue.items().iter().map(|i| i.segment.id.clone()).collect();
        let before_duration = queue.total_duration_sec();

        let added = queue.enqueue(seg("gone", SegmentSource::Manual, 150, true));
        assert!(queue.remove(&added.segment.id));

        let after: Vec<String> = queue.items().iter().map(|i| i.segment.id.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(before_duration, queue.total_duration_sec());
    }

    #[test]
    fn remove_unknown_returns_false() {
        let mut queue = PlayoutQueue::new();
        assert!(!queue.remove("nope"));
    }

    #[test]
    fn update_is_idempotent() {
        let mut queue = PlayoutQueue::new();
        let item = queue.enqueue(seg("x", SegmentSource::Auto, 50, false));
        queue.enqueue(seg("y", SegmentSource::Auto, 60, false));

        queue.update(&item.segment.id, Some(90), Some(true)).unwrap();
        let once: Vec<String> = queue.items().iter().map(|i| i.segment.id.clone()).collect();
        queue.update(&item.segment.id, Some(90), Some(true)).unwrap();
        let twice: Vec<String> = queue.items().iter().map(|i| i.segment.id.clone()).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn update_clamps_priority() {
        let mut queue = PlayoutQueue::new();
        let item = queue.enqueue(seg("x", SegmentSource::Auto, 50, false));
        let updated = queue.update(&item.segment.id, Some(999), None).unwrap();
        assert_eq!(updated.segment.priority, 200);
    }

    #[test]
    fn update_unknown_is_queue_miss() {
        let mut queue = PlayoutQueue::new();
        assert!(matches!(
            queue.update("ghost", Some(10), None),
            Err(RjError::QueueMiss(_))
        ));
    }

    #[test]
    fn pop_observes_current_total_order() {
        let mut queue = PlayoutQueue::new();
        queue.enqueue(seg("low", SegmentSource::Auto, 10, false));
        let high = queue.enqueue(seg("high", SegmentSource::Auto, 90, false));
        assert_eq!(queue.pop().unwrap().segment.id, high.segment.id);
        assert_eq!(queue.len(), 1);
    }
}
