//! Per-connection bounded outbound queue.
//!
//! The queue is a fixed-capacity ring. Messages handed to the transport stay
//! in the ring until the next writable opportunity, because a transport may
//! still be flushing the bytes of the previous write when it returns.

pub const STREAM_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    kind: MessageKind,
    payload: Vec<u8>,
    stream_id: Option<String>,
}

impl OutboundMessage {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: payload.into().into_bytes(),
            stream_id: None,
        }
    }

    /// Binary frame prefixed with a NUL-padded stream identifier.
    pub fn video_frame(stream_id: &str, frame: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(STREAM_ID_LEN + frame.len());
        payload.extend_from_slice(&encode_stream_id(stream_id));
        payload.extend_from_slice(frame);
        Self {
            kind: MessageKind::Binary,
            payload,
            stream_id: Some(stream_id.to_string()),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }
}

/// Identifiers longer than the fixed width are truncated.
pub fn encode_stream_id(id: &str) -> [u8; STREAM_ID_LEN] {
    let mut buf = [0u8; STREAM_ID_LEN];
    let bytes = id.as_bytes();
    let len = bytes.len().min(STREAM_ID_LEN);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

pub fn split_stream_message(payload: &[u8]) -> Option<(&str, &[u8])> {
    if payload.len() < STREAM_ID_LEN {
        return None;
    }
    let (id, frame) = payload.split_at(STREAM_ID_LEN);
    let end = id.iter().position(|b| *b == 0).unwrap_or(STREAM_ID_LEN);
    let id = std::str::from_utf8(&id[..end]).ok()?;
    Some((id, frame))
}

/// Fixed-capacity FIFO ring.
///
/// `head` and `tail` are running counters, the slot index is the counter
/// modulo capacity, so `head - tail` is always the number of stored entries.
#[derive(Debug)]
pub struct RingQueue<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
}

impl<T> RingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn insert(&mut self, item: T) -> bool {
        if self.free_count() == 0 {
            return false;
        }
        let idx = self.head % self.capacity();
        self.slots[idx] = Some(item);
        self.head = self.head.wrapping_add(1);
        true
    }

    pub fn peek_oldest(&self) -> Option<&T> {
        self.get(0)
    }

    /// Entry `offset` positions after the oldest one.
    pub fn get(&self, offset: usize) -> Option<&T> {
        if offset >= self.len() {
            return None;
        }
        let idx = self.tail.wrapping_add(offset) % self.capacity();
        self.slots[idx].as_ref()
    }

    pub fn consume_oldest(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let idx = self.tail % self.capacity();
        self.tail = self.tail.wrapping_add(1);
        self.slots[idx].take()
    }

    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while self.consume_oldest().is_some() {
            dropped += 1;
        }
        dropped
    }
}

/// Ring of outbound messages with the deferred-consume discipline.
#[derive(Debug)]
pub struct OutboundQueue {
    ring: RingQueue<OutboundMessage>,
    in_flight: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingQueue::new(capacity),
            in_flight: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.ring.free_count()
    }

    pub fn insert(&mut self, message: OutboundMessage) -> bool {
        self.ring.insert(message)
    }

    /// Consumes the entries written on the previous writable opportunity.
    pub fn complete_previous_writes(&mut self) -> usize {
        let completed = self.in_flight;
        for _ in 0..completed {
            self.ring.consume_oldest();
        }
        self.in_flight = 0;
        completed
    }

    pub fn next_unwritten(&self) -> Option<&OutboundMessage> {
        self.ring.get(self.in_flight)
    }

    pub fn mark_written(&mut self) {
        if self.in_flight < self.ring.len() {
            self.in_flight += 1;
        }
    }

    pub fn has_unwritten(&self) -> bool {
        self.in_flight < self.ring.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight > 0
    }

    pub fn drain(&mut self) -> usize {
        self.in_flight = 0;
        self.ring.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_four_scenario() {
        let mut ring = RingQueue::new(4);
        for i in 0..4 {
            assert!(ring.insert(i));
        }
        assert_eq!(ring.free_count(), 0);
        assert!(!ring.insert(4));
        assert_eq!(ring.peek_oldest(), Some(&0));
        assert_eq!(ring.consume_oldest(), Some(0));
        assert_eq!(ring.free_count(), 1);
        assert!(ring.insert(4));
        let rest: Vec<_> = std::iter::from_fn(|| ring.consume_oldest()).collect();
        assert_eq!(rest, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rejected_insert_keeps_entries() {
        let mut ring = RingQueue::new(2);
        assert!(ring.insert("a"));
        assert!(ring.insert("b"));
        assert!(!ring.insert("c"));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get(0), Some(&"a"));
        assert_eq!(ring.get(1), Some(&"b"));
        assert_eq!(ring.get(2), None);
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let mut ring = RingQueue::new(3);
        let mut expected = 0;
        for i in 0..50 {
            assert!(ring.insert(i));
            if i % 2 == 1 {
                assert_eq!(ring.consume_oldest(), Some(expected));
                expected += 1;
                assert_eq!(ring.consume_oldest(), Some(expected));
                expected += 1;
            }
            assert!(ring.free_count() <= ring.capacity());
        }
        assert!(ring.is_empty());
        assert_eq!(ring.consume_oldest(), None);
    }

    #[test]
    fn test_deferred_consume() {
        let mut queue = OutboundQueue::new(4);
        assert!(queue.insert(OutboundMessage::text("one")));
        assert!(queue.insert(OutboundMessage::text("two")));

        assert_eq!(queue.complete_previous_writes(), 0);
        assert_eq!(queue.next_unwritten().map(|m| m.payload()), Some(&b"one"[..]));
        queue.mark_written();
        // written but still occupying its slot until the next opportunity
        assert_eq!(queue.free_count(), 2);
        assert_eq!(queue.next_unwritten().map(|m| m.payload()), Some(&b"two"[..]));

        assert_eq!(queue.complete_previous_writes(), 1);
        assert_eq!(queue.free_count(), 3);
        assert_eq!(queue.next_unwritten().map(|m| m.payload()), Some(&b"two"[..]));
        queue.mark_written();
        assert!(!queue.has_unwritten());
        assert!(queue.has_in_flight());
        assert_eq!(queue.complete_previous_writes(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain() {
        let mut queue = OutboundQueue::new(4);
        queue.insert(OutboundMessage::text("a"));
        queue.insert(OutboundMessage::text("b"));
        queue.mark_written();
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
        assert!(!queue.has_in_flight());
    }

    #[test]
    fn test_video_frame_layout() {
        let message = OutboundMessage::video_frame("drpai+camera", &[1, 2, 3]);
        assert_eq!(message.kind(), MessageKind::Binary);
        assert_eq!(message.payload().len(), STREAM_ID_LEN + 3);
        assert_eq!(&message.payload()[..12], b"drpai+camera");
        assert!(message.payload()[12..STREAM_ID_LEN].iter().all(|b| *b == 0));
        let (id, frame) = split_stream_message(message.payload()).unwrap();
        assert_eq!(id, "drpai+camera");
        assert_eq!(frame, &[1, 2, 3]);
    }

    #[test]
    fn test_long_stream_id_truncated() {
        let id = encode_stream_id("a-very-long-stream-identifier");
        assert_eq!(&id, b"a-very-long-stre");
        assert!(split_stream_message(&[0u8; 4]).is_none());
    }
}
