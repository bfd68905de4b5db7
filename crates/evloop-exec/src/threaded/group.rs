use std::{
    sync::{
        Mutex, OnceLock, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use evloop_core::{EventLoop, LoopError};
use tracing::{debug, info};

use super::ThreadedEventLoop;
use crate::LoopGroupConfig;

static SINGLETON: OnceLock<MultiThreadedEventLoopGroup> = OnceLock::new();

/// Fixed set of [`ThreadedEventLoop`]s handed out round robin.
///
/// Dropping the group signals every loop to shut down without waiting for the threads.
pub struct MultiThreadedEventLoopGroup {
    loops: Vec<ThreadedEventLoop>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    is_singleton: bool,
}

impl MultiThreadedEventLoopGroup {
    /// Starts `threads` loops named `evloop-{index}`.
    pub fn new(threads: usize) -> Result<Self, LoopError> {
        Self::with_config(LoopGroupConfig::with_threads(threads))
    }

    pub fn with_config(config: LoopGroupConfig) -> Result<Self, LoopError> {
        config.validate()?;
        Self::start(&config, false)
    }

    /// Process-wide group sized to the available parallelism. It lives until the process exits
    /// and refuses to be shut down.
    pub fn singleton() -> Result<&'static Self, LoopError> {
        if let Some(group) = SINGLETON.get() {
            return Ok(group);
        }
        let group = Self::start(&LoopGroupConfig::default(), true)?;
        // losing the race drops our copy, which shuts its loops down
        let _ = SINGLETON.set(group);
        SINGLETON
            .get()
            .ok_or_else(|| LoopError::Spawn("singleton group unavailable".into()))
    }

    fn start(config: &LoopGroupConfig, is_singleton: bool) -> Result<Self, LoopError> {
        let mut loops = Vec::with_capacity(config.threads);
        let mut threads = Vec::with_capacity(config.threads);

        for index in 0..config.threads {
            match ThreadedEventLoop::spawn(config.thread_name(index)) {
                Ok((el, handle)) => {
                    loops.push(el);
                    threads.push(handle);
                }
                Err(e) => {
                    for el in &loops {
                        el.signal_shutdown();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            target: "evloop.exec.group",
            threads = config.threads,
            prefix = %config.thread_name_prefix,
            "event loop group started"
        );
        Ok(Self {
            loops,
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
            is_singleton,
        })
    }

    /// Next loop in round-robin order.
    pub fn next(&self) -> ThreadedEventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }

    pub fn loops(&self) -> &[ThreadedEventLoop] {
        &self.loops
    }

    /// Cancels all pending timers and waits for every loop thread to exit.
    pub async fn shutdown_gracefully(&self) -> Result<(), LoopError> {
        let threads = self.begin_shutdown()?;
        tokio::task::spawn_blocking(move || join_all(threads))
            .await
            .map_err(|e| LoopError::Panicked(e.to_string()))?
    }

    /// Blocking form of [`MultiThreadedEventLoopGroup::shutdown_gracefully`]. Fails with
    /// [`LoopError::ShutdownFromLoop`] when called on one of the group's own threads.
    pub fn sync_shutdown_gracefully(&self) -> Result<(), LoopError> {
        let threads = self.begin_shutdown()?;
        join_all(threads)
    }

    fn begin_shutdown(&self) -> Result<Vec<JoinHandle<()>>, LoopError> {
        if self.is_singleton {
            return Err(LoopError::SingletonShutdown);
        }
        if self.loops.iter().any(|el| el.in_event_loop()) {
            return Err(LoopError::ShutdownFromLoop);
        }

        debug!(target: "evloop.exec.group", loops = self.loops.len(), "shutting down group");
        for el in &self.loops {
            el.signal_shutdown();
        }
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::take(&mut *threads))
    }
}

impl Drop for MultiThreadedEventLoopGroup {
    fn drop(&mut self) {
        for el in &self.loops {
            el.signal_shutdown();
        }
    }
}

fn join_all(threads: Vec<JoinHandle<()>>) -> Result<(), LoopError> {
    let mut result = Ok(());
    for handle in threads {
        if handle.join().is_err() {
            result = Err(LoopError::Panicked("event loop thread panicked".into()));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, atomic::AtomicUsize, mpsc},
        thread,
        time::{Duration, Instant},
    };

    use evloop_core::{EventLoopExt, TimeAmount, TimerHandler};

    use super::*;

    #[derive(Default)]
    struct MockTimerHandler {
        fired: AtomicUsize,
    }

    impl MockTimerHandler {
        fn count(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    impl TimerHandler for MockTimerHandler {
        fn timer_fired(&self, _event_loop: &dyn EventLoop) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool, window: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < window {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn timer_fires_on_a_real_loop() {
        let group = MultiThreadedEventLoopGroup::new(1).unwrap();
        let handler = Arc::new(MockTimerHandler::default());

        let timer = group
            .next()
            .set_timer_in(TimeAmount::milliseconds(1), handler.clone());
        assert!(timer.is_custom());

        // 1ms deadline plus 10ms of scheduling slack
        assert!(wait_for(|| handler.count() == 1, Duration::from_millis(11)));
        group.sync_shutdown_gracefully().unwrap();
        assert_eq!(handler.count(), 1);
    }

    #[test]
    fn cancelled_timer_stays_silent() {
        let group = MultiThreadedEventLoopGroup::new(1).unwrap();
        let el = group.next();
        let handler = Arc::new(MockTimerHandler::default());

        // park the loop thread so the cancellation deterministically precedes the deadline
        let (started_tx, started) = mpsc::channel::<()>();
        let (release, parked) = mpsc::channel::<()>();
        el.submit(move |_| {
            let _ = started_tx.send(());
            let _ = parked.recv();
            Ok(())
        });
        started.recv_timeout(Duration::from_secs(1)).unwrap();

        let timer = el.set_timer_in(TimeAmount::milliseconds(1), handler.clone());
        timer.cancel();
        release.send(()).unwrap();

        assert!(!wait_for(|| handler.count() > 0, Duration::from_millis(50)));
        assert_eq!(el.pending_count(), 0);
        group.sync_shutdown_gracefully().unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_instead_of_waiting() {
        let group = MultiThreadedEventLoopGroup::new(2).unwrap();
        let handler = Arc::new(MockTimerHandler::default());
        let el = group.next();

        el.set_timer_in(TimeAmount::milliseconds(100), handler.clone());
        let task = el.schedule_task_in(TimeAmount::milliseconds(100), |_| Ok(()));

        let started = Instant::now();
        group.shutdown_gracefully().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(task.future().get().await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handler.count(), 0);
        assert!(group.loops().iter().all(|el| el.is_shut_down()));

        group.shutdown_gracefully().await.unwrap();
    }

    #[test]
    fn hands_out_loops_round_robin() {
        let config = LoopGroupConfig {
            threads: 3,
            thread_name_prefix: "rr".to_string(),
        };
        let group = MultiThreadedEventLoopGroup::with_config(config).unwrap();

        let names: Vec<_> = (0..4).map(|_| group.next().name().to_string()).collect();
        assert_eq!(names, ["rr-0", "rr-1", "rr-2", "rr-0"]);
        assert_eq!(group.loops().len(), 3);
        group.sync_shutdown_gracefully().unwrap();
    }

    #[test]
    fn invalid_config_fails_at_construction() {
        assert!(matches!(
            MultiThreadedEventLoopGroup::new(0),
            Err(LoopError::Config(_))
        ));
    }

    #[test]
    fn shutdown_from_a_loop_thread_is_refused() {
        let group = Arc::new(MultiThreadedEventLoopGroup::new(1).unwrap());

        let inner = Arc::clone(&group);
        let outcome = group
            .next()
            .submit(move |_| Ok(inner.sync_shutdown_gracefully().map_err(|e| e.to_string())))
            .wait_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome,
            Err(LoopError::ShutdownFromLoop.to_string())
        );

        group.sync_shutdown_gracefully().unwrap();
    }

    #[test]
    fn singleton_cannot_be_shut_down() {
        let group = MultiThreadedEventLoopGroup::singleton().unwrap();
        assert!(std::ptr::eq(group, MultiThreadedEventLoopGroup::singleton().unwrap()));
        assert!(matches!(
            group.sync_shutdown_gracefully(),
            Err(LoopError::SingletonShutdown)
        ));
        assert!(!group.next().is_shut_down());
    }
}
