use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TICK_CHANNEL_CAPACITY: usize = 16;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_unix_ms()
    }
}

/// Clock whose reading only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRemaining {
    pub ended: bool,
    pub total_ms: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl TimeRemaining {
    pub fn between(now_ms: i64, end_time_ms: i64) -> Self {
        let total_ms = end_time_ms.saturating_sub(now_ms);
        if total_ms <= 0 {
            return Self {
                ended: true,
                total_ms: 0,
                days: 0,
                hours: 0,
                minutes: 0,
                seconds: 0,
            };
        }

        let total_seconds = total_ms / 1_000;
        Self {
            ended: false,
            total_ms,
            days: total_seconds / 86_400,
            hours: (total_seconds / 3_600) % 24,
            minutes: (total_seconds / 60) % 60,
            seconds: total_seconds % 60,
        }
    }
}

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ended {
            return f.write_str("Auction Ended");
        }
        if self.days > 0 {
            write!(f, "{}d ", self.days)?;
        }
        write!(f, "{}h {}m {}s", self.hours, self.minutes, self.seconds)
    }
}

/// Fans a wall-clock sample out to every subscriber once per interval.
///
/// Each tick re-reads the clock rather than adding the interval to the last
/// value, so a late tick never compounds into the next one.
pub struct ClockTickSource {
    sender: broadcast::Sender<i64>,
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl ClockTickSource {
    pub fn start(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        let task_sender = sender.clone();
        let task_cancel = cancel_token.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // No receivers is fine; views come and go.
                        let _ = task_sender.send(clock.now_ms());
                    }
                }
            }
            debug!("clock tick source stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "clock tick source started");
        Self {
            sender,
            cancel_token,
            join_handle,
        }
    }

    pub fn subscribe(&self) -> TickSubscription {
        TickSubscription {
            receiver: self.sender.subscribe(),
            cancel_token: self.cancel_token.child_token(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        let _ = (&mut self.join_handle).await;
    }
}

impl Drop for ClockTickSource {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

pub struct TickSubscription {
    receiver: broadcast::Receiver<i64>,
    cancel_token: CancellationToken,
}

impl TickSubscription {
    /// Next wall-clock sample, or `None` once cancelled or the source stops.
    pub async fn next(&mut self) -> Option<i64> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return None,
                received = self.receiver.recv() => received,
            };

            match received {
                Ok(now_ms) => return Some(now_ms),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "tick subscriber lagged; using latest sample");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_remaining_time_like_the_countdown_label() {
        let remaining = TimeRemaining::between(0, 90_061_000);
        assert_eq!(remaining.to_string(), "1d 1h 1m 1s");

        let under_a_day = TimeRemaining::between(0, 3_723_500);
        assert_eq!(under_a_day.to_string(), "1h 2m 3s");
    }

    #[test]
    fn remaining_time_is_ended_at_exact_deadline() {
        let remaining = TimeRemaining::between(5_000, 5_000);
        assert!(remaining.ended);
        assert_eq!(remaining.to_string(), "Auction Ended");

        let one_ms_left = TimeRemaining::between(4_999, 5_000);
        assert!(!one_ms_left.ended);
        assert_eq!(one_ms_left.to_string(), "0h 0m 0s");
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_sample_absolute_clock_on_every_interval() {
        let clock = Arc::new(ManualClock::new(1_000));
        let source = ClockTickSource::start(clock.clone(), Duration::from_secs(1));
        let mut subscription = source.subscribe();

        assert_eq!(subscription.next().await, Some(1_000));

        // A jump in wall-clock time shows up as-is instead of as 1_000 + interval.
        clock.set(7_500);
        assert_eq!(subscription.next().await, Some(7_500));
    }

    #[tokio::test(start_paused = true)]
    async fn every_subscriber_receives_the_same_tick() {
        let clock = Arc::new(ManualClock::new(42));
        let source = ClockTickSource::start(clock, Duration::from_secs(1));
        let mut first = source.subscribe();
        let mut second = source.subscribe();

        assert_eq!(source.subscriber_count(), 2);
        assert_eq!(first.next().await, Some(42));
        assert_eq!(second.next().await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_subscription_stops_delivery_without_affecting_others() {
        let clock = Arc::new(ManualClock::new(0));
        let source = ClockTickSource::start(clock, Duration::from_secs(1));
        let mut cancelled = source.subscribe();
        let mut live = source.subscribe();

        cancelled.cancel();
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.next().await, None);
        assert_eq!(live.next().await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_all_subscriptions() {
        let clock = Arc::new(ManualClock::new(0));
        let source = ClockTickSource::start(clock, Duration::from_secs(1));
        let mut subscription = source.subscribe();

        source.shutdown().await;
        assert_eq!(subscription.next().await, None);
    }
}
