//! Receive staging
//!
//! Two FIFOs couple pending application reads with accepted inbound
//! payloads. An accepted payload either completes the oldest waiting read
//! or is staged for a later one; a read either takes the oldest staged
//! payload or parks a waiter. At most one of the two queues is non-empty
//! at any instant.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::error::{Result, TransportError};

type PayloadSender = oneshot::Sender<Result<Vec<u8>>>;

/// Completion handle a parked read awaits.
pub type PayloadReceiver = oneshot::Receiver<Result<Vec<u8>>>;

#[derive(Default)]
pub struct ReceiveQueue {
    /// Pending application reads, oldest first.
    input: VecDeque<PayloadSender>,
    /// Accepted payloads awaiting a read, oldest first.
    output: VecDeque<Vec<u8>>,
}

impl ReceiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce side: hand an accepted payload to the oldest live waiter, or
    /// stage it. Waiters whose receive future was dropped are skipped.
    pub fn push_payload(&mut self, mut payload: Vec<u8>) {
        while let Some(tx) = self.input.pop_front() {
            match tx.send(Ok(payload)) {
                Ok(()) => return,
                Err(Ok(rejected)) => payload = rejected,
                Err(Err(_)) => return,
            }
        }
        debug_assert!(self.input.is_empty());
        self.output.push_back(payload);
    }

    /// Consume side, fast path: take the oldest staged payload.
    pub fn pop_payload(&mut self) -> Option<Vec<u8>> {
        self.output.pop_front()
    }

    /// Consume side, slow path: park a waiter for the next payload. Callers
    /// must try [`pop_payload`](Self::pop_payload) first so the two queues
    /// are never both non-empty.
    pub fn push_request(&mut self) -> PayloadReceiver {
        debug_assert!(self.output.is_empty());
        let (tx, rx) = oneshot::channel();
        self.input.push_back(tx);
        rx
    }

    pub fn has_staged(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn has_pending_request(&self) -> bool {
        !self.input.is_empty()
    }

    /// Resolve every parked read with a cancellation error and drop the
    /// staged payloads.
    pub fn cancel_all(&mut self) {
        for tx in self.input.drain(..) {
            let _ = tx.send(Err(TransportError::Cancelled));
        }
        self.output.clear();
    }
}

/// Truncating byte-count copy into a caller buffer; returns bytes copied.
/// A payload longer than the buffer is cut off, never split across reads.
pub fn copy_into(payload: &[u8], buf: &mut [u8]) -> usize {
    let n = payload.len().min(buf.len());
    buf[..n].copy_from_slice(&payload[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_then_request() {
        let mut queue = ReceiveQueue::new();
        queue.push_payload(b"one".to_vec());
        queue.push_payload(b"two".to_vec());
        assert!(queue.has_staged());

        assert_eq!(queue.pop_payload().unwrap(), b"one");
        assert_eq!(queue.pop_payload().unwrap(), b"two");
        assert!(queue.pop_payload().is_none());
    }

    #[test]
    fn test_request_then_payload() {
        let mut queue = ReceiveQueue::new();
        let mut rx = queue.push_request();
        assert!(queue.has_pending_request());

        queue.push_payload(b"hello".to_vec());
        assert!(!queue.has_pending_request());
        assert!(!queue.has_staged());
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_dropped_waiter_is_skipped() {
        let mut queue = ReceiveQueue::new();
        let rx1 = queue.push_request();
        let mut rx2 = queue.push_request();
        drop(rx1);

        queue.push_payload(b"data".to_vec());
        assert_eq!(rx2.try_recv().unwrap().unwrap(), b"data");
    }

    #[test]
    fn test_never_both_non_empty() {
        let mut queue = ReceiveQueue::new();
        let _rx = queue.push_request();
        queue.push_payload(b"x".to_vec());
        // The payload paired with the waiter instead of being staged.
        assert!(!(queue.has_staged() && queue.has_pending_request()));
    }

    #[test]
    fn test_cancel_all() {
        let mut queue = ReceiveQueue::new();
        let mut rx = queue.push_request();
        queue.cancel_all();
        assert!(matches!(rx.try_recv().unwrap(), Err(TransportError::Cancelled)));

        queue.push_payload(b"late".to_vec());
        queue.cancel_all();
        assert!(!queue.has_staged());
    }

    #[test]
    fn test_copy_into_truncates() {
        let mut buf = [0u8; 3];
        assert_eq!(copy_into(b"hello", &mut buf), 3);
        assert_eq!(&buf, b"hel");

        let mut big = [0u8; 8];
        assert_eq!(copy_into(b"hi", &mut big), 2);
        assert_eq!(&big[..2], b"hi");
    }
}
