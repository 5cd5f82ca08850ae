use tokio_stream::StreamExt;
use tokio_util::time::{delay_queue, DelayQueue};

pub use tokio::time::Instant;

/// Stable handle to a scheduled event, valid until it fires or is removed.
pub type TimerHandle = delay_queue::Key;

/// The collaborator a scheduler drives its timers through. Kept as a trait
/// so a production responder can swap in its own event loop's timer wheel
/// instead of `WheelTimeEventQueue`.
pub trait TimeEventQueue<T> {
    fn add(&mut self, deadline: Instant, payload: T) -> TimerHandle;
    fn update(&mut self, handle: TimerHandle, deadline: Instant);
    fn remove(&mut self, handle: TimerHandle);
}

/// Reference implementation backed by `tokio_util::time::DelayQueue`, which
/// already implements `Stream`; `next()` polls it the same way the teacher
/// binary polls a `Framed` connection.
#[derive(Debug, Default)]
pub struct WheelTimeEventQueue<T> {
    inner: DelayQueue<T>,
}

impl<T> WheelTimeEventQueue<T> {
    pub fn new() -> Self {
        Self { inner: DelayQueue::new() }
    }

    /// Waits for the next event to elapse. Returns `None` once the wheel is
    /// empty (no events scheduled at all, not merely none yet due).
    pub async fn next(&mut self) -> Option<T> {
        self.inner.next().await.map(|expired| expired.into_inner())
    }
}

impl<T> TimeEventQueue<T> for WheelTimeEventQueue<T> {
    fn add(&mut self, deadline: Instant, payload: T) -> TimerHandle {
        let delay = deadline.saturating_duration_since(Instant::now());
        self.inner.insert(payload, delay)
    }

    fn update(&mut self, handle: TimerHandle, deadline: Instant) {
        let delay = deadline.saturating_duration_since(Instant::now());
        self.inner.reset(&handle, delay);
    }

    fn remove(&mut self, handle: TimerHandle) {
        self.inner.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut q: WheelTimeEventQueue<&'static str> = WheelTimeEventQueue::new();
        let now = Instant::now();
        q.add(now + Duration::from_millis(50), "second");
        q.add(now + Duration::from_millis(10), "first");

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(q.next().await, Some("first"));

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(q.next().await, Some("second"));
    }

    #[tokio::test]
    async fn empty_wheel_ends_the_stream() {
        let mut q: WheelTimeEventQueue<()> = WheelTimeEventQueue::new();
        assert_eq!(q.next().await, None);
    }
}
