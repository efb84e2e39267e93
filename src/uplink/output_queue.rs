use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::message::GwMessage;

#[derive(Debug)]
struct QueuedMessage {
    message: GwMessage,
    enqueued_at: Instant,
}

/// Bounded FIFO of outbound messages awaiting a session.
///
/// The queue survives reconnects: [`flush_on_disconnect`] drops only items
/// older than `resend_timeout` and preserves the rest for the next session.
///
/// [`flush_on_disconnect`]: Self::flush_on_disconnect
#[derive(Debug)]
pub(crate) struct OutputQueue {
    capacity: usize,
    resend_timeout: Duration,
    inner: Mutex<VecDeque<QueuedMessage>>,
    ready: Notify,
}

impl OutputQueue {
    pub(crate) fn new(capacity: usize, resend_timeout: Duration) -> Self {
        Self {
            capacity,
            resend_timeout,
            inner: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Appends a message. When the queue is full the oldest non-critical
    /// message is dropped to make room; critical messages are never shed.
    pub(crate) fn enqueue(&self, message: GwMessage) {
        {
            let mut inner = self.inner.lock().expect("output queue lock poisoned");
            if inner.len() >= self.capacity {
                let victim = inner
                    .iter()
                    .position(|queued| !queued.message.is_critical());
                match victim {
                    Some(index) => {
                        let dropped = inner.remove(index).expect("victim index is in range");
                        warn!(
                            correlation_id = %dropped.message.id(),
                            "output queue full, dropping oldest non-critical message"
                        );
                    }
                    None if !message.is_critical() => {
                        warn!(
                            correlation_id = %message.id(),
                            "output queue full of critical messages, dropping new message"
                        );
                        return;
                    }
                    None => {}
                }
            }
            inner.push_back(QueuedMessage {
                message,
                enqueued_at: Instant::now(),
            });
        }
        self.ready.notify_one();
    }

    /// Puts a message back at the head, keeping FIFO order after a failed
    /// send attempt.
    pub(crate) fn requeue_front(&self, message: GwMessage) {
        {
            let mut inner = self.inner.lock().expect("output queue lock poisoned");
            inner.push_front(QueuedMessage {
                message,
                enqueued_at: Instant::now(),
            });
        }
        self.ready.notify_one();
    }

    /// Removes and returns the head message, waiting up to `max_wait` for
    /// one to arrive. Returns `None` on timeout.
    pub(crate) async fn dequeue_ready(&self, max_wait: Duration) -> Option<GwMessage> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.ready.notified();
            if let Some(message) = self.try_dequeue() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue();
            }
        }
    }

    fn try_dequeue(&self) -> Option<GwMessage> {
        let mut inner = self.inner.lock().expect("output queue lock poisoned");
        inner.pop_front().map(|queued| queued.message)
    }

    /// Age of the head message, for backpressure decisions.
    pub(crate) fn peek_age_oldest(&self) -> Option<Duration> {
        let inner = self.inner.lock().expect("output queue lock poisoned");
        inner
            .front()
            .map(|queued| queued.enqueued_at.elapsed())
    }

    /// Drops messages that aged beyond `resend_timeout`; the remainder is
    /// kept for the next session.
    pub(crate) fn flush_on_disconnect(&self) {
        let mut inner = self.inner.lock().expect("output queue lock poisoned");
        let before = inner.len();
        inner.retain(|queued| queued.enqueued_at.elapsed() <= self.resend_timeout);
        let dropped = before - inner.len();
        if dropped > 0 {
            debug!(dropped, kept = inner.len(), "flushed aged messages on disconnect");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("output queue lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::message::CommandStatus;

    fn queue(capacity: usize) -> OutputQueue {
        OutputQueue::new(capacity, Duration::from_secs(10))
    }

    fn sensor_data() -> GwMessage {
        GwMessage::SensorData {
            id: Uuid::new_v4(),
            device_id: crate::model::DeviceId::from(0xa300000000000001),
            values: Vec::new(),
        }
    }

    fn critical() -> GwMessage {
        GwMessage::CommandResponse {
            id: Uuid::new_v4(),
            status: CommandStatus::Success,
            reason: None,
        }
    }

    #[tokio::test]
    async fn dequeue_preserves_fifo_order() {
        let queue = queue(8);
        let first = sensor_data();
        let second = sensor_data();
        queue.enqueue(first.clone());
        queue.enqueue(second.clone());

        assert_eq!(
            Some(first.id()),
            queue.dequeue_ready(Duration::ZERO).await.map(|m| m.id())
        );
        assert_eq!(
            Some(second.id()),
            queue.dequeue_ready(Duration::ZERO).await.map(|m| m.id())
        );
        assert_eq!(None, queue.dequeue_ready(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn overflow_sheds_oldest_non_critical_first() {
        let queue = queue(2);
        let shed = sensor_data();
        let kept = critical();
        let newest = sensor_data();
        queue.enqueue(shed);
        queue.enqueue(kept.clone());
        queue.enqueue(newest.clone());

        assert_eq!(2, queue.len());
        assert_eq!(
            Some(kept.id()),
            queue.dequeue_ready(Duration::ZERO).await.map(|m| m.id())
        );
        assert_eq!(
            Some(newest.id()),
            queue.dequeue_ready(Duration::ZERO).await.map(|m| m.id())
        );
    }

    #[tokio::test]
    async fn critical_messages_are_never_shed() {
        let queue = queue(1);
        queue.enqueue(critical());
        let overflow = sensor_data();
        queue.enqueue(overflow);

        let head = queue.dequeue_ready(Duration::ZERO).await;
        assert!(head.is_some_and(|m| m.is_critical()));
        assert_eq!(None, queue.dequeue_ready(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_concurrent_enqueue() {
        let queue = std::sync::Arc::new(queue(4));
        let waiter = std::sync::Arc::clone(&queue);
        let task =
            tokio::spawn(async move { waiter.dequeue_ready(Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        queue.enqueue(sensor_data());

        let received = task.await.expect("dequeue task should finish");
        assert!(received.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_on_disconnect_drops_only_aged_messages() {
        let queue = OutputQueue::new(8, Duration::from_secs(10));
        queue.enqueue(sensor_data());
        tokio::time::advance(Duration::from_secs(11)).await;
        let fresh = sensor_data();
        queue.enqueue(fresh.clone());

        queue.flush_on_disconnect();

        assert_eq!(1, queue.len());
        assert_eq!(
            Some(fresh.id()),
            queue.dequeue_ready(Duration::ZERO).await.map(|m| m.id())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn peek_age_tracks_the_head_message() {
        let queue = queue(4);
        assert_eq!(None, queue.peek_age_oldest());

        queue.enqueue(sensor_data());
        tokio::time::advance(Duration::from_secs(3)).await;

        let age = queue.peek_age_oldest().expect("queue should have a head");
        assert!(age >= Duration::from_secs(3));
    }
}
