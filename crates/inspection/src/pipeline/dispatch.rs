//! Bounded frame queue between camera intake and the inference workers.
//!
//! A full queue first tries to make room by evicting the oldest frame the
//! [`EvictionPolicy`] allows; failing that the producer blocks up to its
//! timeout and the frame is handed back. Nothing is ever dropped silently: the
//! caller receives every evicted or refused frame.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use line_ingest::Frame;

/// Decides whether a queued frame may be discarded to admit a newer one.
pub trait EvictionPolicy: Send + Sync {
    fn may_evict(&self, frame: &Frame) -> bool;
}

/// Never evicts; producers always block.
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn may_evict(&self, _frame: &Frame) -> bool {
        false
    }
}

#[derive(Debug)]
pub enum PushOutcome {
    Enqueued,
    /// Admitted after evicting the returned frame.
    Evicted(Frame),
    /// The queue stayed full for the whole timeout.
    TimedOut(Frame),
    Closed(Frame),
}

#[derive(Debug)]
pub enum Popped {
    Frame(Frame),
    TimedOut,
    /// Closed and fully drained.
    Closed,
}

struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
}

pub struct DispatchQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    policy: Arc<dyn EvictionPolicy>,
}

impl DispatchQueue {
    pub fn new(capacity: usize, policy: Arc<dyn EvictionPolicy>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn push(&self, frame: Frame, timeout: Duration) -> PushOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return PushOutcome::Closed(frame);
            }
            if state.frames.len() < self.capacity {
                state.frames.push_back(frame);
                self.not_empty.notify_one();
                return PushOutcome::Enqueued;
            }
            if let Some(index) = state
                .frames
                .iter()
                .position(|queued| self.policy.may_evict(queued))
            {
                if let Some(evicted) = state.frames.remove(index) {
                    state.frames.push_back(frame);
                    self.not_empty.notify_one();
                    return PushOutcome::Evicted(evicted);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return PushOutcome::TimedOut(frame);
            }
            state = match self.not_full.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Take the oldest frame, waiting up to `timeout`. Frames queued before
    /// `close` are still handed out.
    pub fn pop(&self, timeout: Duration) -> Popped {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                self.not_full.notify_one();
                return Popped::Frame(frame);
            }
            if state.closed {
                return Popped::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Popped::TimedOut;
            }
            state = match self.not_empty.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Refuse further pushes and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<Frame> {
        let drained: Vec<Frame> = self.lock().frames.drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use line_ingest::{CameraId, FrameFormat, FrameImage, RollerId};

    use super::*;

    fn frame(camera: u16, roller: u64) -> Frame {
        Frame::new(
            CameraId(camera),
            roller,
            Instant::now(),
            0.0,
            FrameImage::blank(1, 1, FrameFormat::Gray8),
        )
        .assigned_to(RollerId(roller))
    }

    struct EvictRoller(u64);

    impl EvictionPolicy for EvictRoller {
        fn may_evict(&self, frame: &Frame) -> bool {
            frame.roller_id() == Some(RollerId(self.0))
        }
    }

    #[test]
    fn full_queue_times_out_without_eviction() {
        let queue = DispatchQueue::new(1, Arc::new(NoEviction));
        assert!(matches!(
            queue.push(frame(1, 1), Duration::ZERO),
            PushOutcome::Enqueued
        ));
        let started = Instant::now();
        match queue.push(frame(1, 2), Duration::from_millis(20)) {
            PushOutcome::TimedOut(refused) => assert_eq!(refused.roller_id(), Some(RollerId(2))),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn eviction_makes_room_for_newer_frames() {
        let queue = DispatchQueue::new(2, Arc::new(EvictRoller(2)));
        queue.push(frame(1, 1), Duration::ZERO);
        queue.push(frame(1, 2), Duration::ZERO);
        match queue.push(frame(1, 3), Duration::ZERO) {
            PushOutcome::Evicted(evicted) => assert_eq!(evicted.roller_id(), Some(RollerId(2))),
            other => panic!("expected eviction, got {other:?}"),
        }
        let order: Vec<_> = (0..2)
            .map(|_| match queue.pop(Duration::ZERO) {
                Popped::Frame(frame) => frame.roller_id(),
                other => panic!("expected frame, got {other:?}"),
            })
            .collect();
        assert_eq!(order, vec![Some(RollerId(1)), Some(RollerId(3))]);
    }

    #[test]
    fn blocked_producer_resumes_when_consumer_pops() {
        let queue = Arc::new(DispatchQueue::new(1, Arc::new(NoEviction)));
        queue.push(frame(1, 1), Duration::ZERO);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                queue.pop(Duration::from_secs(1))
            })
        };
        assert!(matches!(
            queue.push(frame(1, 2), Duration::from_secs(1)),
            PushOutcome::Enqueued
        ));
        assert!(matches!(consumer.join().unwrap(), Popped::Frame(_)));
    }

    #[test]
    fn close_drains_before_reporting_closed() {
        let queue = DispatchQueue::new(4, Arc::new(NoEviction));
        queue.push(frame(1, 1), Duration::ZERO);
        queue.close();
        assert!(matches!(
            queue.push(frame(1, 2), Duration::ZERO),
            PushOutcome::Closed(_)
        ));
        assert!(matches!(queue.pop(Duration::ZERO), Popped::Frame(_)));
        assert!(matches!(queue.pop(Duration::ZERO), Popped::Closed));
    }
}
