use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

static NEXT_TIMEOUT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique timeout object id.
pub fn next_timeout_id() -> u64 {
    NEXT_TIMEOUT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something that must be notified once a deadline passes.
pub trait TimeoutObject: Send + Sync {
    fn timeout_id(&self) -> u64;

    fn end_time(&self) -> Instant;

    /// Called at most once, on the scheduler's thread.
    fn on_timeout(&self);
}

/// The scheduler the manager registers transaction timeouts and salvage timers with.
pub trait TimeoutScheduler: Send + Sync {
    fn add_timeout_object(&self, obj: Arc<dyn TimeoutObject>);

    /// Returns true if the object was still scheduled.
    fn remove_timeout_object(&self, id: u64) -> bool;
}

struct ProcessorShared {
    queue: SkipMap<(Instant, u64), Arc<dyn TimeoutObject>>,
    deadlines: DashMap<u64, Instant>,
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl ProcessorShared {
    /// Pop the earliest object whose deadline has passed.
    fn pop_expired(&self, now: Instant) -> Option<Arc<dyn TimeoutObject>> {
        loop {
            let front = self.queue.front()?;
            if front.key().0 > now {
                return None;
            }
            // A concurrent remove may have taken it first.
            if front.remove() {
                self.deadlines.remove(&front.key().1);
                return Some(front.value().clone());
            }
        }
    }

    fn run(&self) {
        let mut stopped = self.stopped.lock();
        loop {
            if *stopped {
                return;
            }
            if let Some(obj) = self.pop_expired(Instant::now()) {
                drop(stopped);
                debug!(id = obj.timeout_id(), "timeout object expired");
                obj.on_timeout();
                stopped = self.stopped.lock();
                continue;
            }
            match self.queue.front() {
                Some(front) => {
                    let deadline = front.key().0;
                    drop(front);
                    self.cv.wait_until(&mut stopped, deadline);
                }
                None => self.cv.wait(&mut stopped),
            }
        }
    }
}

/// A [`TimeoutScheduler`] backed by a single worker thread that fires objects
/// in deadline order.
pub struct TimeoutProcessor {
    shared: Arc<ProcessorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutProcessor {
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(ProcessorShared {
            queue: SkipMap::new(),
            deadlines: DashMap::new(),
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("gridcache-timeout".into())
            .spawn(move || worker_shared.run())?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Number of scheduled objects.
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Stop the worker thread. Objects still scheduled never fire.
    pub fn stop(&self) {
        *self.shared.stopped.lock() = true;
        self.shared.cv.notify_all();
        let worker = self.worker.lock().take();
        if let Some(Err(_)) = worker.map(JoinHandle::join) {
            warn!("timeout worker panicked");
        }
    }
}

impl TimeoutScheduler for TimeoutProcessor {
    fn add_timeout_object(&self, obj: Arc<dyn TimeoutObject>) {
        let id = obj.timeout_id();
        let deadline = obj.end_time();
        self.shared.deadlines.insert(id, deadline);
        self.shared.queue.insert((deadline, id), obj);
        // Taking the lock orders the insert before the worker's next check.
        let _guard = self.shared.stopped.lock();
        self.shared.cv.notify_all();
    }

    fn remove_timeout_object(&self, id: u64) -> bool {
        match self.shared.deadlines.remove(&id) {
            Some((_, deadline)) => self.shared.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }
}

impl Drop for TimeoutProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    struct Recorder {
        id: u64,
        end: Instant,
        fired: Arc<Mutex<Vec<u64>>>,
        hits: AtomicUsize,
    }

    impl TimeoutObject for Recorder {
        fn timeout_id(&self) -> u64 {
            self.id
        }

        fn end_time(&self) -> Instant {
            self.end
        }

        fn on_timeout(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.fired.lock().push(self.id);
        }
    }

    fn recorder(after: Duration, fired: &Arc<Mutex<Vec<u64>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            id: next_timeout_id(),
            end: Instant::now() + after,
            fired: fired.clone(),
            hits: AtomicUsize::new(0),
        })
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let processor = TimeoutProcessor::start().unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let late = recorder(Duration::from_millis(60), &fired);
        let early = recorder(Duration::from_millis(20), &fired);
        processor.add_timeout_object(late.clone());
        processor.add_timeout_object(early.clone());

        wait_for(|| fired.lock().len() == 2);
        assert_eq!(*fired.lock(), vec![early.id, late.id]);
        assert_eq!(late.hits.load(Ordering::SeqCst), 1);
        assert!(processor.is_empty());
    }

    struct Failing {
        id: u64,
    }

    impl TimeoutObject for Failing {
        fn timeout_id(&self) -> u64 {
            self.id
        }

        fn end_time(&self) -> Instant {
            Instant::now()
        }

        fn on_timeout(&self) {
            panic!("timeout handler failed");
        }
    }

    #[test]
    fn test_stop_after_worker_panic() {
        let processor = TimeoutProcessor::start().unwrap();
        processor.add_timeout_object(Arc::new(Failing {
            id: next_timeout_id(),
        }));
        wait_for(|| processor.is_empty());
        processor.stop();
        processor.stop();
    }

    #[test]
    fn test_removed_object_never_fires() {
        let processor = TimeoutProcessor::start().unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let obj = recorder(Duration::from_millis(30), &fired);
        let marker = recorder(Duration::from_millis(60), &fired);
        processor.add_timeout_object(obj.clone());
        processor.add_timeout_object(marker.clone());
        assert!(processor.remove_timeout_object(obj.id));
        assert!(!processor.remove_timeout_object(obj.id));

        wait_for(|| !fired.lock().is_empty());
        assert_eq!(*fired.lock(), vec![marker.id]);
    }
}
