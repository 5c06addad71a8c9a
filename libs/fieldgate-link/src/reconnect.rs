//! Reconnection supervisor
//!
//! `ReconnectHelper` owns the attempt counter and the delay schedule.
//! `ReconnectSupervisor` is the background task a client channel wakes when
//! its link drops: it sleeps for the scheduled delay, re-dials, and stops when
//! the link is back, the retry budget is spent, or the channel shuts down.

use crate::config::{ReconnectOptions, ReconnectStrategy};
use crate::error::{LinkError, Result};
use crate::logging::ChannelLogger;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before attempt number `attempt` (1-based), without jitter
pub fn delay_for(options: &ReconnectOptions, attempt: u32) -> Duration {
    let base = options.base_interval();
    let step = attempt.saturating_sub(1);
    let delay = match options.strategy {
        ReconnectStrategy::Simple => base,
        ReconnectStrategy::ExponentialBackoff => {
            let factor = options.multiplier.max(1.0).powi(step.min(i32::MAX as u32) as i32);
            let millis = base.as_millis() as f64 * factor;
            if millis.is_finite() && millis < options.max_interval_ms as f64 {
                Duration::from_millis(millis as u64)
            } else {
                options.max_interval()
            }
        },
        ReconnectStrategy::LinearBackoff => {
            let extra = options.multiplier.max(0.0) * f64::from(step);
            base + Duration::from_millis(extra.min(u64::MAX as f64) as u64)
        },
    };
    delay.min(options.max_interval())
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub give_ups: u64,
}

/// Attempt counter plus delay schedule for one outage
#[derive(Debug)]
pub struct ReconnectHelper {
    options: ReconnectOptions,
    current_attempt: u32,
}

impl ReconnectHelper {
    pub fn new(options: ReconnectOptions) -> Self {
        Self {
            options,
            current_attempt: 0,
        }
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// True once `max_retry_count` attempts were made (never for negative counts)
    pub fn exhausted(&self) -> bool {
        self.options.max_retry_count >= 0
            && i64::from(self.current_attempt) >= i64::from(self.options.max_retry_count)
    }

    /// Count a new attempt and return its delay
    pub fn begin_attempt(&mut self) -> Duration {
        self.current_attempt = self.current_attempt.saturating_add(1);
        self.calculate_next_delay()
    }

    /// Delay for the current attempt, with optional +-25% jitter
    pub fn calculate_next_delay(&self) -> Duration {
        let delay = delay_for(&self.options, self.current_attempt.max(1));
        if !self.options.jitter || delay.is_zero() {
            return delay;
        }
        let jitter_range = delay.as_millis() as f64 * 0.25;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// A successful connect resets the counter
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Something the supervisor can re-dial
#[async_trait]
pub trait Reconnect: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<()>;
}

type FailedHook = Arc<dyn Fn(u32, &LinkError) + Send + Sync>;
type GiveUpHook = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Default, Clone)]
struct ReconnectHooks {
    on_failed: Option<FailedHook>,
    on_give_up: Option<GiveUpHook>,
}

pub struct ReconnectSupervisor {
    options: ReconnectOptions,
    logger: ChannelLogger,
    paused: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
    hooks: RwLock<ReconnectHooks>,
    stats: Mutex<ReconnectStats>,
}

impl ReconnectSupervisor {
    pub fn new(
        options: ReconnectOptions,
        logger: ChannelLogger,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            logger,
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            cancel,
            hooks: RwLock::new(ReconnectHooks::default()),
            stats: Mutex::new(ReconnectStats::default()),
        })
    }

    pub fn options(&self) -> &ReconnectOptions {
        &self.options
    }

    /// Start an outage cycle (no-op while one is running)
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Hold off dialing until [`ReconnectSupervisor::resume`]
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Called after every failed attempt with the attempt number and error
    pub fn on_failed(&self, hook: impl Fn(u32, &LinkError) + Send + Sync + 'static) {
        self.hooks.write().on_failed = Some(Arc::new(hook));
    }

    /// Called once the retry budget is spent, with the number of attempts made
    pub fn on_give_up(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        self.hooks.write().on_give_up = Some(Arc::new(hook));
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats.lock().clone()
    }

    /// Run the supervisor loop until the cancel token fires or the target is dropped
    pub fn spawn<T>(self: &Arc<Self>, target: Weak<T>) -> JoinHandle<()>
    where
        T: Reconnect + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run(target).await })
    }

    async fn run<T>(self: Arc<Self>, target: Weak<T>)
    where
        T: Reconnect + 'static,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {},
            }
            if !self.outage(&target).await {
                break;
            }
        }
        debug!("Reconnect supervisor stopped: {}", self.logger.name());
    }

    /// One outage. Returns false when the supervisor should stop for good.
    async fn outage<T>(&self, target: &Weak<T>) -> bool
    where
        T: Reconnect + 'static,
    {
        let mut helper = ReconnectHelper::new(self.options.clone());

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let Some(channel) = target.upgrade() else {
                return false;
            };
            if channel.is_connected() {
                return true;
            }
            drop(channel);

            if self.is_paused() {
                debug!("Reconnect paused: {}", self.logger.name());
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return false,
                    _ = self.wake.notified() => continue,
                }
            }

            if helper.exhausted() {
                let attempts = helper.current_attempt();
                warn!(
                    "Maximum reconnection attempts ({}) exceeded: {}",
                    attempts,
                    self.logger.name()
                );
                self.stats.lock().give_ups += 1;
                let hook = self.hooks.read().on_give_up.clone();
                if let Some(hook) = hook {
                    hook(attempts);
                }
                return true;
            }

            let delay = helper.begin_attempt();
            let attempt = helper.current_attempt();
            self.logger.log_retry(
                attempt,
                self.options.max_retry_count,
                delay,
                "link lost",
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {},
            }

            // Re-check both flags right before dialing
            if self.cancel.is_cancelled() {
                return false;
            }
            if self.is_paused() {
                continue;
            }
            let Some(channel) = target.upgrade() else {
                return false;
            };
            if channel.is_connected() {
                return true;
            }

            self.stats.lock().total_attempts += 1;
            match channel.reconnect(&self.cancel).await {
                Ok(()) => {
                    info!(
                        "Reconnection successful (attempt {}): {}",
                        attempt,
                        self.logger.name()
                    );
                    self.stats.lock().successful_reconnects += 1;
                    helper.reset();
                    return true;
                },
                Err(LinkError::Cancelled) => return false,
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt, e);
                    self.stats.lock().failed_reconnects += 1;
                    let hook = self.hooks.read().on_failed.clone();
                    if let Some(hook) = hook {
                        hook(attempt, &e);
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("channel", &self.logger.name())
            .field("paused", &self.is_paused())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn exponential() -> ReconnectOptions {
        ReconnectOptions {
            strategy: ReconnectStrategy::ExponentialBackoff,
            base_interval_ms: 100,
            max_interval_ms: 5000,
            multiplier: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_backoff_schedule() {
        let options = exponential();
        let delays: Vec<u64> = (1..=8)
            .map(|a| delay_for(&options, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
        assert_eq!(delay_for(&options, 200), Duration::from_millis(5000));
    }

    #[test]
    fn test_simple_and_linear_schedules() {
        let simple = ReconnectOptions {
            strategy: ReconnectStrategy::Simple,
            base_interval_ms: 250,
            ..Default::default()
        };
        assert_eq!(delay_for(&simple, 1), Duration::from_millis(250));
        assert_eq!(delay_for(&simple, 9), Duration::from_millis(250));

        let linear = ReconnectOptions {
            strategy: ReconnectStrategy::LinearBackoff,
            base_interval_ms: 1000,
            max_interval_ms: 3500,
            multiplier: 1000.0,
            ..Default::default()
        };
        let delays: Vec<u64> = (1..=5)
            .map(|a| delay_for(&linear, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 3000, 3500, 3500]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let options = ReconnectOptions {
            jitter: true,
            ..exponential()
        };
        let mut helper = ReconnectHelper::new(options);
        for _ in 0..3 {
            helper.begin_attempt();
        }
        for _ in 0..50 {
            let d = helper.calculate_next_delay().as_millis() as u64;
            assert!((300..=500).contains(&d), "{}", d);
        }
    }

    #[test]
    fn test_retry_budget() {
        let mut helper = ReconnectHelper::new(ReconnectOptions {
            max_retry_count: 2,
            ..Default::default()
        });
        assert!(!helper.exhausted());
        helper.begin_attempt();
        helper.begin_attempt();
        assert!(helper.exhausted());
        helper.reset();
        assert!(!helper.exhausted());

        let unbounded = ReconnectHelper::new(ReconnectOptions {
            max_retry_count: -1,
            ..Default::default()
        });
        assert!(!unbounded.exhausted());
    }

    /// Fails `fail_first` times, then connects
    struct FlakyLink {
        connected: AtomicBool,
        attempts: AtomicU32,
        fail_first: u32,
        dialed_at: Mutex<Vec<Instant>>,
    }

    impl FlakyLink {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                fail_first,
                dialed_at: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Reconnect for FlakyLink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn reconnect(&self, _cancel: &CancellationToken) -> Result<()> {
            self.dialed_at.lock().push(Instant::now());
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(LinkError::transport("refused"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_backs_off_then_connects() {
        let link = FlakyLink::new(3);
        let cancel = CancellationToken::new();
        let supervisor =
            ReconnectSupervisor::new(exponential(), ChannelLogger::new("test"), cancel.clone());
        let failures = Arc::new(AtomicU32::new(0));
        let counter = failures.clone();
        supervisor.on_failed(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let start = Instant::now();
        let handle = supervisor.spawn(Arc::downgrade(&link));
        supervisor.wake();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(link.is_connected());
        assert_eq!(link.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(failures.load(Ordering::SeqCst), 3);

        let offsets: Vec<u64> = link
            .dialed_at
            .lock()
            .iter()
            .map(|t| t.duration_since(start).as_millis() as u64)
            .collect();
        assert_eq!(offsets, vec![100, 300, 700, 1500]);

        let stats = supervisor.stats();
        assert_eq!(stats.successful_reconnects, 1);
        assert_eq!(stats.failed_reconnects, 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_gives_up() {
        let link = FlakyLink::new(u32::MAX);
        let cancel = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(
            ReconnectOptions {
                base_interval_ms: 50,
                max_retry_count: 3,
                ..Default::default()
            },
            ChannelLogger::new("test"),
            cancel.clone(),
        );
        let gave_up = Arc::new(AtomicU32::new(0));
        let flag = gave_up.clone();
        supervisor.on_give_up(move |attempts| {
            flag.store(attempts, Ordering::SeqCst);
        });

        let handle = supervisor.spawn(Arc::downgrade(&link));
        supervisor.wake();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(link.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(gave_up.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.stats().give_ups, 1);

        // A new outage starts with a fresh budget
        supervisor.wake();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(link.attempts.load(Ordering::SeqCst), 6);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_respects_pause() {
        let link = FlakyLink::new(0);
        let cancel = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(
            ReconnectOptions {
                base_interval_ms: 10,
                ..Default::default()
            },
            ChannelLogger::new("test"),
            cancel.clone(),
        );
        supervisor.pause();
        let handle = supervisor.spawn(Arc::downgrade(&link));
        supervisor.wake();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(link.attempts.load(Ordering::SeqCst), 0);

        supervisor.resume();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(link.is_connected());

        cancel.cancel();
        handle.await.unwrap();
    }
}
