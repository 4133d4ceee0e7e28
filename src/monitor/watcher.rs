//! Watcher lifecycle shared by the process monitor and bypass detector.
//!
//! # Reference counting
//!
//! [`RefCountedWatchers`] starts its watchers when the first package
//! registers and stops them when the last one unregisters. Both transitions
//! happen while the registry lock is held, so concurrent callers can never
//! observe a double start or a stop racing a start.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::MonitorError;

/// Something with a global start/stop lifecycle.
pub trait Watcher: Send + Sync {
    /// Short name for logs and events.
    fn name(&self) -> &'static str;

    /// Begin watching. Called once per lifecycle.
    fn start(&self);

    /// Stop watching. Called once per lifecycle.
    fn stop(&self);
}

/// Watchers started by the first registration and stopped by the last.
pub struct RefCountedWatchers<W: ?Sized + Watcher> {
    watchers: Vec<Arc<W>>,
    registered: Mutex<BTreeSet<String>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl<W: ?Sized + Watcher> RefCountedWatchers<W> {
    /// Wrap a watcher set; nothing starts until the first registration.
    pub fn new(watchers: Vec<Arc<W>>) -> Self {
        Self {
            watchers,
            registered: Mutex::new(BTreeSet::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.registered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `key`. Returns `false` if it was already registered.
    pub fn register(&self, key: &str) -> bool {
        let mut registered = self.lock();
        if registered.contains(key) {
            return false;
        }
        if registered.is_empty() {
            for watcher in &self.watchers {
                debug!("Starting watcher {}", watcher.name());
                watcher.start();
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        registered.insert(key.to_string());
        true
    }

    /// Unregister `key`. Returns `false` if it was not registered.
    pub fn unregister(&self, key: &str) -> bool {
        let mut registered = self.lock();
        if !registered.remove(key) {
            return false;
        }
        if registered.is_empty() {
            for watcher in &self.watchers {
                debug!("Stopping watcher {}", watcher.name());
                watcher.stop();
            }
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        true
    }

    /// Registered keys, sorted.
    pub fn registered(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Whether `key` is registered.
    pub fn is_registered(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Whether the watchers are currently running.
    pub fn is_running(&self) -> bool {
        !self.lock().is_empty()
    }

    /// The wrapped watchers.
    pub fn watchers(&self) -> &[Arc<W>] {
        &self.watchers
    }

    /// Lifecycles started so far.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Lifecycles stopped so far.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// A periodic blocking job on the tokio runtime.
///
/// Each tick runs on the blocking pool since ticks read procfs or spawn
/// privileged commands.
#[derive(Default)]
pub(crate) struct PollTask {
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl PollTask {
    fn lock(&self) -> MutexGuard<'_, Option<(watch::Sender<bool>, JoinHandle<()>)>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start ticking every `interval`. A running task is left alone.
    pub(crate) fn start<F>(
        &self,
        name: &'static str,
        interval: Duration,
        tick: F,
    ) -> Result<(), MonitorError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut running = self.lock();
        if running.is_some() {
            return Ok(());
        }
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| MonitorError::NoRuntime(name))?;

        let (tx, mut rx) = watch::channel(false);
        let tick = Arc::new(tick);
        let task = handle.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut timer = tokio::time::interval_at(start, interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let tick = tick.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                            warn!("Watcher {} tick failed: {}", name, e);
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
            debug!("Watcher {} stopped polling", name);
        });

        *running = Some((tx, task));
        Ok(())
    }

    /// Stop ticking.
    pub(crate) fn stop(&self) {
        if let Some((tx, task)) = self.lock().take() {
            let _ = tx.send(true);
            task.abort();
        }
    }

    /// Whether a task is running.
    pub(crate) fn is_running(&self) -> bool {
        self.lock().is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Watcher that only counts lifecycle calls.
    #[derive(Default)]
    pub(crate) struct CountingWatcher {
        pub(crate) starts: AtomicUsize,
        pub(crate) stops: AtomicUsize,
    }

    impl Watcher for CountingWatcher {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_start_once_stop_once() {
        let watcher = Arc::new(CountingWatcher::default());
        let set = RefCountedWatchers::new(vec![watcher.clone()]);

        assert!(set.register("pkg.a"));
        assert!(set.register("pkg.b"));
        assert!(!set.register("pkg.a"));
        assert_eq!(watcher.starts.load(Ordering::SeqCst), 1);

        assert!(set.unregister("pkg.a"));
        assert_eq!(watcher.stops.load(Ordering::SeqCst), 0);
        assert!(!set.unregister("pkg.a"));
        assert!(set.unregister("pkg.b"));
        assert_eq!(watcher.stops.load(Ordering::SeqCst), 1);
        assert!(!set.is_running());
    }

    #[test]
    fn test_restart_after_drain() {
        let watcher = Arc::new(CountingWatcher::default());
        let set = RefCountedWatchers::new(vec![watcher.clone()]);

        set.register("pkg.a");
        set.unregister("pkg.a");
        set.register("pkg.a");

        assert_eq!(set.start_count(), 2);
        assert_eq!(set.stop_count(), 1);
        assert!(set.is_running());
    }

    #[test]
    fn test_concurrent_registration() {
        let watcher = Arc::new(CountingWatcher::default());
        let set = Arc::new(RefCountedWatchers::new(vec![watcher.clone()]));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let set = set.clone();
                std::thread::spawn(move || {
                    let key = format!("pkg.{i}");
                    set.register(&key);
                    set.unregister(&key);
                    set.register(&key);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.registered().len(), 16);

        for i in 0..16 {
            set.unregister(&format!("pkg.{i}"));
        }
        let starts = watcher.starts.load(Ordering::SeqCst);
        let stops = watcher.stops.load(Ordering::SeqCst);
        assert_eq!(starts, stops);
        assert_eq!(set.start_count(), starts);
        assert!(!set.is_running());
    }

    #[tokio::test]
    async fn test_poll_task_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = PollTask::default();
        let counter = count.clone();
        task.start("test", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.stop();
        assert!(!task.is_running());

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(count.load(Ordering::SeqCst) <= seen + 1);
    }

    #[test]
    fn test_poll_task_needs_runtime() {
        let task = PollTask::default();
        let result = task.start("test", Duration::from_millis(10), || {});
        assert!(matches!(result, Err(MonitorError::NoRuntime("test"))));
    }
}
