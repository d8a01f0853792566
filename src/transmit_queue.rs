//! Per-connection transmit queue
//!
//! Outbound sequence-consuming frames (handshakes and data) wait here until
//! the peer's cumulative acknowledgement covers them. Only the head entry is
//! ever on the wire; later entries start transmitting once everything before
//! them is acknowledged. Each transmission arms a per-entry deadline; an
//! unacknowledged head is re-sent when it expires, with the deadline reset
//! on every retransmission.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::sequence::SequenceNumber;

/// Frame body of a queued transmission. The wire acknowledgement field of a
/// data frame is filled in from connection state at each (re)transmission,
/// so a long-queued frame still carries the current cumulative ack.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Handshake { ack: Option<SequenceNumber> },
    Data { payload: Vec<u8> },
}

/// How the removal of an entry is reported.
pub enum TransmitCompletion {
    /// An application send; resolves with the recorded payload size.
    Send(oneshot::Sender<Result<usize, TransportError>>),
    /// A connect/accept handshake frame. Success is absorbed by the state
    /// machine; failure closes the connection.
    Handshake,
}

struct TransmitEntry {
    sequence: SequenceNumber,
    size: usize,
    frame: OutboundFrame,
    /// None until the first transmission.
    deadline: Option<Instant>,
    completion: TransmitCompletion,
}

/// Snapshot of the head entry handed to the send path.
pub struct HeadFrame {
    pub sequence: SequenceNumber,
    pub frame: OutboundFrame,
    pub retransmission: bool,
}

pub struct TransmitQueue {
    entries: VecDeque<TransmitEntry>,
    timeout: Duration,
}

impl TransmitQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append an entry. It starts transmitting once it becomes the head.
    pub fn push(
        &mut self,
        sequence: SequenceNumber,
        size: usize,
        frame: OutboundFrame,
        completion: TransmitCompletion,
    ) {
        self.entries.push_back(TransmitEntry {
            sequence,
            size,
            frame,
            deadline: None,
            completion,
        });
    }

    /// The head entry if it is due at `now`: either never transmitted or
    /// past its retransmission deadline.
    pub fn head_due(&self, now: Instant) -> Option<HeadFrame> {
        let entry = self.entries.front()?;
        let due = match entry.deadline {
            None => true,
            Some(deadline) => deadline <= now,
        };
        if !due {
            return None;
        }
        Some(HeadFrame {
            sequence: entry.sequence,
            frame: entry.frame.clone(),
            retransmission: entry.deadline.is_some(),
        })
    }

    /// The head's retransmission deadline; None while the queue is empty or
    /// the head has not been transmitted yet.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.front().and_then(|entry| entry.deadline)
    }

    /// Record a successful transmission of the head and arm its deadline.
    pub fn mark_head_transmitted(&mut self, now: Instant) {
        if let Some(entry) = self.entries.front_mut() {
            entry.deadline = Some(now + self.timeout);
        }
    }

    /// Cumulative acknowledgement: remove every entry whose sequence is
    /// modularly at or before `ack`, resolving each completion with success
    /// and its recorded size, in insertion order. Returns true if any entry
    /// was removed (the next entry, if present, needs transmission).
    pub fn apply_ack(&mut self, ack: SequenceNumber) -> bool {
        let mut removed = false;
        while let Some(entry) = self.entries.front() {
            if !entry.sequence.is_before_or_eq(ack) {
                break;
            }
            removed = true;
            if let Some(entry) = self.entries.pop_front() {
                if let TransmitCompletion::Send(tx) = entry.completion {
                    let _ = tx.send(Ok(entry.size));
                }
            }
        }
        removed
    }

    /// Remove the head after a hard substrate send failure, returning its
    /// completion for the caller to resolve. Later entries remain queued.
    pub fn take_failed_head(&mut self) -> Option<TransmitCompletion> {
        self.entries.pop_front().map(|entry| entry.completion)
    }

    /// Resolve every remaining completion with a cancellation error.
    /// Returns true if a handshake frame was among them.
    pub fn cancel_all(&mut self) -> bool {
        let mut had_handshake = false;
        for entry in self.entries.drain(..) {
            match entry.completion {
                TransmitCompletion::Send(tx) => {
                    let _ = tx.send(Err(TransportError::Cancelled));
                }
                TransmitCompletion::Handshake => had_handshake = true,
            }
        }
        had_handshake
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_entry(queue: &mut TransmitQueue, seq: u32) -> oneshot::Receiver<Result<usize, TransportError>> {
        let (tx, rx) = oneshot::channel();
        queue.push(
            SequenceNumber::new(seq),
            seq as usize,
            OutboundFrame::Data {
                payload: vec![0u8; seq as usize],
            },
            TransmitCompletion::Send(tx),
        );
        rx
    }

    #[test]
    fn test_only_head_is_due() {
        let mut queue = TransmitQueue::new(Duration::from_millis(100));
        let _rx1 = data_entry(&mut queue, 1);
        let _rx2 = data_entry(&mut queue, 2);

        let now = Instant::now();
        let head = queue.head_due(now).unwrap();
        assert_eq!(head.sequence, SequenceNumber::new(1));
        assert!(!head.retransmission);

        // Once transmitted, the head waits for its deadline.
        queue.mark_head_transmitted(now);
        assert!(queue.head_due(now).is_none());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(100)));

        // Past the deadline it is due again, flagged as a retransmission.
        let later = now + Duration::from_millis(150);
        let head = queue.head_due(later).unwrap();
        assert!(head.retransmission);
    }

    #[test]
    fn test_cumulative_ack_resolves_in_order() {
        let mut queue = TransmitQueue::new(Duration::from_millis(100));
        let mut rx1 = data_entry(&mut queue, 1);
        let mut rx2 = data_entry(&mut queue, 2);
        let mut rx3 = data_entry(&mut queue, 3);

        assert!(queue.apply_ack(SequenceNumber::new(2)));
        assert_eq!(rx1.try_recv().unwrap().unwrap(), 1);
        assert_eq!(rx2.try_recv().unwrap().unwrap(), 2);
        assert!(rx3.try_recv().is_err());
        assert_eq!(queue.len(), 1);

        // The surviving entry has not been transmitted yet, so it is due.
        assert!(queue.head_due(Instant::now()).is_some());
    }

    #[test]
    fn test_ack_before_head_removes_nothing() {
        let mut queue = TransmitQueue::new(Duration::from_millis(100));
        let mut rx = data_entry(&mut queue, 10);

        assert!(!queue.apply_ack(SequenceNumber::new(9)));
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ack_across_wrap() {
        let mut queue = TransmitQueue::new(Duration::from_millis(100));
        let (tx, mut rx) = oneshot::channel();
        queue.push(
            SequenceNumber::new(u32::MAX),
            4,
            OutboundFrame::Data { payload: vec![0; 4] },
            TransmitCompletion::Send(tx),
        );

        // Ack of the wrapped successor covers the queued entry.
        assert!(queue.apply_ack(SequenceNumber::new(0)));
        assert_eq!(rx.try_recv().unwrap().unwrap(), 4);
    }

    #[test]
    fn test_failed_head_leaves_rest() {
        let mut queue = TransmitQueue::new(Duration::from_millis(100));
        let mut rx1 = data_entry(&mut queue, 1);
        let _rx2 = data_entry(&mut queue, 2);

        match queue.take_failed_head() {
            Some(TransmitCompletion::Send(tx)) => {
                let _ = tx.send(Err(TransportError::Cancelled));
            }
            _ => panic!("expected a send completion"),
        }
        assert!(matches!(rx1.try_recv().unwrap(), Err(TransportError::Cancelled)));
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.head_due(Instant::now()).unwrap().sequence,
            SequenceNumber::new(2)
        );
    }

    #[test]
    fn test_cancel_all() {
        let mut queue = TransmitQueue::new(Duration::from_millis(100));
        let mut rx1 = data_entry(&mut queue, 1);
        let mut rx2 = data_entry(&mut queue, 2);
        queue.push(
            SequenceNumber::new(3),
            0,
            OutboundFrame::Handshake { ack: None },
            TransmitCompletion::Handshake,
        );

        assert!(queue.cancel_all());
        assert!(queue.is_empty());
        assert!(matches!(rx1.try_recv().unwrap(), Err(TransportError::Cancelled)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(TransportError::Cancelled)));
    }
}
