//! Outgoing and pending queues, and the outbound serial counter.
//!
//! Invariants enforced here:
//! - serials are assigned pre-incremented from a counter starting at -1, so
//!   the first ack-required frame on a connection carries serial 0;
//! - the pending queue holds ack-required frames in a contiguous, strictly
//!   increasing serial run;
//! - a frame leaves the outgoing queue only to the transport, and an
//!   ack-required frame leaves the pending queue only on Ack, Nack, or
//!   connection reset.

use std::collections::VecDeque;

use rtlink_protocol::{ErrorInfo, ProtocolMessage, error_codes};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

pub(crate) type AckWaiter = oneshot::Sender<Result<()>>;

/// A frame travelling through the dispatch pipeline, with the caller's ack
/// completion if one is attached.
pub(crate) struct QueuedFrame {
    pub msg: ProtocolMessage,
    pub waiter: Option<AckWaiter>,
}

impl QueuedFrame {
    pub fn settle(self, result: Result<()>) {
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(result);
        }
    }
}

// ---------------------------------------------------------------------------
// SerialCounter
// ---------------------------------------------------------------------------

/// Monotonic outbound serial source.  Pre-incremented before use; assignment
/// is transactional — a failed enqueue rolls the counter back.
#[derive(Debug)]
pub(crate) struct SerialCounter {
    value: i64,
}

impl SerialCounter {
    pub fn new() -> Self {
        SerialCounter { value: -1 }
    }

    pub fn assign(&mut self) -> i64 {
        self.value += 1;
        self.value
    }

    pub fn rollback(&mut self) {
        self.value -= 1;
    }

    /// Fresh session: the next assigned serial is 0 again.
    pub fn reset(&mut self) {
        self.value = -1;
    }
}

// ---------------------------------------------------------------------------
// OutgoingQueue
// ---------------------------------------------------------------------------

/// FIFO of frames awaiting transmission.
pub(crate) struct OutgoingQueue {
    frames: VecDeque<QueuedFrame>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        OutgoingQueue {
            frames: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, frame: QueuedFrame) {
        self.frames.push_back(frame);
    }

    /// Put replayed pending frames ahead of everything queued, preserving
    /// their order.
    pub fn requeue_front(&mut self, frames: Vec<QueuedFrame>) {
        for frame in frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
    }

    pub fn pop_front(&mut self) -> Option<QueuedFrame> {
        self.frames.pop_front()
    }

    /// Undo the most recent [`OutgoingQueue::push_back`] when the enqueue
    /// operation aborts.
    pub fn pop_back(&mut self) -> Option<QueuedFrame> {
        self.frames.pop_back()
    }

    /// Re-stamp ack-required frames from a reset counter.  Used when the
    /// server assigns a new connection id and queued serials belong to the
    /// dead generation.
    pub fn reassign_serials(&mut self, serials: &mut SerialCounter) {
        for frame in &mut self.frames {
            if frame.msg.ack_required() {
                frame.msg.msg_serial = Some(serials.assign());
            }
        }
    }

    /// Reject every queued frame.  Used on terminal transitions.
    pub fn reject_all(&mut self, err: &Error) -> usize {
        let n = self.frames.len();
        for frame in self.frames.drain(..) {
            frame.settle(Err(err.clone()));
        }
        n
    }
}

// ---------------------------------------------------------------------------
// PendingQueue
// ---------------------------------------------------------------------------

/// Outcome of applying an Ack or Nack frame to the pending queue.
#[derive(Debug, Default)]
pub(crate) struct AckReport {
    pub settled: usize,
    /// Contiguity problems observed: stale entries below the acked range, or
    /// an ack range extending past the highest pending serial.
    pub violations: Vec<String>,
}

/// Ack-required frames handed to the transport and awaiting Ack/Nack.
pub(crate) struct PendingQueue {
    entries: VecDeque<QueuedFrame>,
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue {
            entries: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn serials(&self) -> Vec<i64> {
        self.entries
            .iter()
            .filter_map(|f| f.msg.msg_serial)
            .collect()
    }

    /// Append a frame just before its transport write.
    ///
    /// The serial must extend the queue's contiguous run; a frame that does
    /// not is settled with the violation and never enters the queue.
    pub fn push(&mut self, frame: QueuedFrame) -> Result<()> {
        let violation = if let Some(serial) = frame.msg.msg_serial {
            match self.entries.back().and_then(|f| f.msg.msg_serial) {
                Some(last) if serial != last + 1 => Some(Error::ProtocolViolation(format!(
                    "pending serial {serial} does not extend {last}"
                ))),
                _ => None,
            }
        } else {
            Some(Error::ProtocolViolation(
                "ack-required frame without serial".to_owned(),
            ))
        };
        if let Some(err) = violation {
            frame.settle(Err(err.clone()));
            return Err(err);
        }
        self.entries.push_back(frame);
        Ok(())
    }

    /// Resolve entries covered by `Ack{msg_serial, count}`.
    pub fn ack(&mut self, serial: i64, count: u32) -> AckReport {
        self.settle_range(serial, count, &Ok(()))
    }

    /// Reject entries covered by `Nack{msg_serial, count}` with the frame's
    /// error.
    pub fn nack(&mut self, serial: i64, count: u32, error: Option<ErrorInfo>) -> AckReport {
        let info = error.unwrap_or_else(|| {
            ErrorInfo::new(error_codes::MESSAGE_NACKED, "message not accepted", false)
        });
        self.settle_range(serial, count, &Err(Error::Server(info)))
    }

    fn settle_range(&mut self, serial: i64, count: u32, result: &Result<()>) -> AckReport {
        let mut report = AckReport::default();
        let end = serial + i64::from(count);

        // Stale entries below the range mean the server skipped serials we
        // still consider outstanding.
        while let Some(front) = self.entries.front() {
            let s = front.msg.msg_serial.unwrap_or(i64::MIN);
            if s >= serial {
                break;
            }
            report
                .violations
                .push(format!("serial {s} skipped by ack at {serial}"));
            self.entries.pop_front().unwrap().settle(Err(
                Error::ProtocolViolation(format!("serial {s} skipped by server ack")),
            ));
        }

        let mut covered = 0u32;
        while let Some(front) = self.entries.front() {
            let s = front.msg.msg_serial.unwrap_or(i64::MIN);
            if s >= end {
                break;
            }
            self.entries.pop_front().unwrap().settle(result.clone());
            report.settled += 1;
            covered += 1;
        }

        if covered < count {
            report.violations.push(format!(
                "ack range {serial}+{count} extends past highest pending serial"
            ));
        }
        report
    }

    /// Remove everything for replay on a resumable disconnect.
    pub fn take_all(&mut self) -> Vec<QueuedFrame> {
        self.entries.drain(..).collect()
    }

    /// Reject everything.  Used on generation change and terminal states.
    pub fn reject_all(&mut self, err: &Error) -> usize {
        let n = self.entries.len();
        for frame in self.entries.drain(..) {
            frame.settle(Err(err.clone()));
        }
        n
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rtlink_protocol::ChannelMessage;

    fn frame(serial: i64) -> QueuedFrame {
        let mut msg = ProtocolMessage::message(
            "ch",
            ChannelMessage {
                name: Some("n".to_owned()),
                ..ChannelMessage::default()
            },
        );
        msg.msg_serial = Some(serial);
        QueuedFrame { msg, waiter: None }
    }

    fn frame_with_waiter(serial: i64) -> (QueuedFrame, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let mut f = frame(serial);
        f.waiter = Some(tx);
        (f, rx)
    }

    #[test]
    fn serial_counter_starts_at_zero_after_first_assign() {
        let mut c = SerialCounter::new();
        assert_eq!(c.assign(), 0);
        assert_eq!(c.assign(), 1);
        c.rollback();
        assert_eq!(c.assign(), 1);
        c.reset();
        assert_eq!(c.assign(), 0);
    }

    #[test]
    fn pending_push_enforces_contiguity() {
        let mut q = PendingQueue::new();
        q.push(frame(0)).unwrap();
        q.push(frame(1)).unwrap();
        assert!(matches!(
            q.push(frame(3)),
            Err(Error::ProtocolViolation(_))
        ));
        assert_eq!(q.serials(), vec![0, 1]);
    }

    #[tokio::test]
    async fn ack_resolves_covered_range() {
        let mut q = PendingQueue::new();
        let (f0, rx0) = frame_with_waiter(0);
        let (f1, rx1) = frame_with_waiter(1);
        let (f2, _rx2) = frame_with_waiter(2);
        q.push(f0).unwrap();
        q.push(f1).unwrap();
        q.push(f2).unwrap();

        let report = q.ack(0, 2);
        assert_eq!(report.settled, 2);
        assert!(report.violations.is_empty());
        assert!(rx0.await.unwrap().is_ok());
        assert!(rx1.await.unwrap().is_ok());
        assert_eq!(q.serials(), vec![2]);
    }

    #[tokio::test]
    async fn nack_rejects_with_attached_error() {
        let mut q = PendingQueue::new();
        let (f0, rx0) = frame_with_waiter(0);
        q.push(f0).unwrap();
        let report = q.nack(
            0,
            1,
            Some(ErrorInfo::new(error_codes::MESSAGE_NACKED, "no", false)),
        );
        assert_eq!(report.settled, 1);
        let err = rx0.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Server(info) if info.code == error_codes::MESSAGE_NACKED));
    }

    #[tokio::test]
    async fn skipped_serials_are_reported_and_rejected() {
        let mut q = PendingQueue::new();
        let (f0, rx0) = frame_with_waiter(0);
        let (f1, rx1) = frame_with_waiter(1);
        q.push(f0).unwrap();
        q.push(f1).unwrap();

        let report = q.ack(1, 1);
        assert_eq!(report.settled, 1);
        assert_eq!(report.violations.len(), 1);
        assert!(matches!(
            rx0.await.unwrap().unwrap_err(),
            Error::ProtocolViolation(_)
        ));
        assert!(rx1.await.unwrap().is_ok());
        assert!(q.is_empty());
    }

    #[test]
    fn ack_past_highest_serial_is_a_violation_not_a_panic() {
        let mut q = PendingQueue::new();
        q.push(frame(0)).unwrap();
        let report = q.ack(0, 5);
        assert_eq!(report.settled, 1);
        assert_eq!(report.violations.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn outgoing_requeue_front_preserves_replay_order() {
        let mut out = OutgoingQueue::new();
        out.push_back(frame(5));
        out.requeue_front(vec![frame(3), frame(4)]);
        let serials: Vec<i64> = std::iter::from_fn(|| out.pop_front())
            .filter_map(|f| f.msg.msg_serial)
            .collect();
        assert_eq!(serials, vec![3, 4, 5]);
    }

    #[test]
    fn reassign_serials_restamps_only_ack_required_frames() {
        let mut out = OutgoingQueue::new();
        out.push_back(frame(7));
        out.push_back(QueuedFrame {
            msg: ProtocolMessage::heartbeat(),
            waiter: None,
        });
        out.push_back(frame(8));

        let mut serials = SerialCounter::new();
        out.reassign_serials(&mut serials);

        let restamped: Vec<Option<i64>> = std::iter::from_fn(|| out.pop_front())
            .map(|f| f.msg.msg_serial)
            .collect();
        assert_eq!(restamped, vec![Some(0), None, Some(1)]);
    }

    #[tokio::test]
    async fn reject_all_settles_every_waiter() {
        let mut q = PendingQueue::new();
        let (f0, rx0) = frame_with_waiter(0);
        let (f1, rx1) = frame_with_waiter(1);
        q.push(f0).unwrap();
        q.push(f1).unwrap();
        let n = q.reject_all(&Error::ConnectionReset("new generation".to_owned()));
        assert_eq!(n, 2);
        assert!(matches!(
            rx0.await.unwrap().unwrap_err(),
            Error::ConnectionReset(_)
        ));
        assert!(matches!(
            rx1.await.unwrap().unwrap_err(),
            Error::ConnectionReset(_)
        ));
    }
}
