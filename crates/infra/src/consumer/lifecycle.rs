//! Background loops and their start/stop control.
//!
//! `start()` ensures the group and spawns two threads:
//! - fetch loop: `poll_once` back to back, pausing after broker errors
//! - reclaim loop: `reclaim_once` every `reclaim_interval`
//!
//! Each loop body runs under a supervisor that catches panics and restarts the
//! iteration per the [`RestartPolicy`](super::RestartPolicy). A loop that
//! exhausts its restarts stops both loops.
//!
//! `stop()` is cooperative: the in-flight iteration (including a blocking
//! fetch) completes, then both threads are joined.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::broker::BrokerError;

use super::{ConsumerError, RestartPolicy, StreamConsumer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Stop flag with interruptible waits.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    fn flag(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stopped(&self) -> bool {
        *self.flag()
    }

    fn trigger(&self) {
        *self.flag() = true;
        self.changed.notify_all();
    }

    fn reset(&self) {
        *self.flag() = false;
    }

    /// Sleep up to `timeout`, waking early on stop. Returns whether stop was
    /// requested.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.flag();
        while !*stopped {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            stopped = match self.changed.wait_timeout(stopped, remaining) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        *stopped
    }
}

struct Shared {
    consumer: Arc<StreamConsumer>,
    state: Mutex<LifecycleState>,
    stop: StopSignal,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Starts, stops and reports on a consumer's background loops.
pub struct ConsumerController {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl core::fmt::Debug for ConsumerController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerController")
            .field("consumer", &self.shared.consumer.consumer_name())
            .field("state", &self.state())
            .finish()
    }
}

impl ConsumerController {
    pub fn new(consumer: Arc<StreamConsumer>) -> Self {
        Self {
            shared: Arc::new(Shared {
                consumer,
                state: Mutex::new(LifecycleState::Stopped),
                stop: StopSignal::default(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn consumer(&self) -> &Arc<StreamConsumer> {
        &self.shared.consumer
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Ensure the group exists and start both loops.
    ///
    /// Calling `start` while starting or running is a logged no-op. If the
    /// group cannot be ensured the error is returned and the controller stays
    /// stopped.
    pub fn start(&self) -> Result<(), ConsumerError> {
        {
            let mut state = self.shared.state();
            match *state {
                LifecycleState::Starting | LifecycleState::Running => {
                    warn!(
                        consumer = %self.shared.consumer.consumer_name(),
                        "consumer already running; ignoring start"
                    );
                    return Ok(());
                }
                LifecycleState::Stopping => return Err(ConsumerError::Stopping),
                LifecycleState::Stopped => *state = LifecycleState::Starting,
            }
        }

        // Threads left behind by a loop that gave up.
        self.join_workers();

        if let Err(e) = self.shared.consumer.ensure_group() {
            error!(error = %e, "failed to ensure consumer group; not starting");
            *self.shared.state() = LifecycleState::Stopped;
            return Err(e);
        }

        self.shared.stop.reset();
        let spawned = self
            .spawn("fetch", fetch_iteration)
            .and_then(|fetch| Ok((fetch, self.spawn("reclaim", reclaim_iteration)?)));

        let (fetch, reclaim) = match spawned {
            Ok(handles) => handles,
            Err(e) => {
                self.shared.stop.trigger();
                self.join_workers();
                *self.shared.state() = LifecycleState::Stopped;
                return Err(e);
            }
        };
        self.lock_workers().extend([fetch, reclaim]);

        let s = self.shared.consumer.settings();
        {
            let mut state = self.shared.state();
            // A loop may already have given up.
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
            }
        }
        info!(
            stream = %s.stream,
            group = %s.group,
            consumer = %self.shared.consumer.consumer_name(),
            "consumer started"
        );
        Ok(())
    }

    /// Request both loops to stop and wait for them. No-op when stopped.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state();
            match *state {
                LifecycleState::Stopped | LifecycleState::Stopping => {}
                LifecycleState::Starting | LifecycleState::Running => {
                    *state = LifecycleState::Stopping;
                }
            }
        }

        self.shared.stop.trigger();
        self.join_workers();

        let mut state = self.shared.state();
        if *state != LifecycleState::Stopped {
            *state = LifecycleState::Stopped;
            info!(consumer = %self.shared.consumer.consumer_name(), "consumer stopped");
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join_workers(&self) {
        let workers: Vec<_> = self.lock_workers().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("consumer thread exited with a panic");
            }
        }
    }

    fn spawn(
        &self,
        name: &'static str,
        iteration: fn(&Shared),
    ) -> Result<thread::JoinHandle<()>, ConsumerError> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("finstream-{}", name))
            .spawn(move || supervise(name, &shared, iteration))
            .map_err(|e| ConsumerError::Spawn(e.to_string()))
    }
}

impl Drop for ConsumerController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `iteration` until stop, restarting it after panics.
fn supervise(name: &'static str, shared: &Shared, iteration: fn(&Shared)) {
    let policy: &RestartPolicy = &shared.consumer.settings().restart;
    let mut crashes: u32 = 0;

    while !shared.stop.is_stopped() {
        match catch_unwind(AssertUnwindSafe(|| iteration(shared))) {
            Ok(()) => crashes = 0,
            Err(_) => {
                crashes += 1;
                if !policy.allows_restart(crashes) {
                    error!(
                        loop_name = name,
                        crashes,
                        "consumer loop crashed too often; stopping consumer"
                    );
                    *shared.state() = LifecycleState::Stopped;
                    shared.stop.trigger();
                    return;
                }

                let delay = policy.backoff(crashes);
                error!(
                    loop_name = name,
                    crashes,
                    restart_in_ms = delay.as_millis() as u64,
                    "consumer loop crashed; restarting"
                );
                if shared.stop.wait(delay) {
                    break;
                }
            }
        }
    }
}

fn fetch_iteration(shared: &Shared) {
    let consumer = &shared.consumer;
    match consumer.poll_once() {
        Ok(_) => {}
        Err(ConsumerError::Broker(BrokerError::NoGroup { .. })) => {
            warn!(consumer = %consumer.consumer_name(), "consumer group disappeared; recreating");
            if consumer.ensure_group().is_err() {
                shared.stop.wait(consumer.settings().error_pause);
            }
        }
        Err(_) => {
            shared.stop.wait(consumer.settings().error_pause);
        }
    }
}

fn reclaim_iteration(shared: &Shared) {
    let consumer = &shared.consumer;
    if shared.stop.wait(consumer.settings().reclaim_interval) {
        return;
    }
    // Failures are counted and logged inside; the interval is the backoff.
    let _ = consumer.reclaim_once();
}
