//! Schedulers
//!
//! Timer-driven callers of the diff engine:
//!
//! - **auto-send**: every interval, diff one randomly chosen active arm
//! - **swap-pedal-auto**: every interval, press the swap pedal
//!
//! The interval is read when a scheduler starts; changing it affects the
//! next start. Each scheduler runs as its own cancellable task.

use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attributes::arm_label;
use crate::diff::DiffEngine;
use crate::events::EventSink;
use crate::transport::server::JOIN_TIMEOUT;

/// Interval used when none, or an invalid one, is given
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Errors raised when toggling a scheduler
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler is already running
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// The scheduler is not running
    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// Auto-send found no arm with an enabled attribute
    #[error("No arm has an enabled attribute")]
    NoActiveArms,
}

/// Parse interval text in milliseconds
///
/// Returns `None` unless the text is a positive finite number.
#[must_use]
pub fn parse_interval(text: &str) -> Option<Duration> {
    let millis: f64 = text.trim().parse().ok()?;
    if !(millis.is_finite() && millis > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(millis / 1000.0).ok()
}

struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn stop(self, name: &'static str) {
        self.cancel.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(JOIN_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => debug!(scheduler = name, "Scheduler finished"),
            Ok(Err(e)) => warn!(scheduler = name, error = %e, "Scheduler ended abnormally"),
            Err(_) => {
                warn!(scheduler = name, "Timed out waiting for scheduler, aborting");
                handle.abort();
            }
        }
    }
}

/// Auto-send and swap-pedal-auto toggles
pub struct Scheduler {
    engine: DiffEngine,
    events: EventSink,
    interval: Mutex<Duration>,
    auto_send: Mutex<Option<ScheduledTask>>,
    swap_pedal_auto: Mutex<Option<ScheduledTask>>,
}

const AUTO_SEND: &str = "auto-send";
const SWAP_PEDAL_AUTO: &str = "swap-pedal-auto";

impl Scheduler {
    /// Create stopped schedulers driving `engine`
    #[must_use]
    pub fn new(engine: DiffEngine, events: EventSink) -> Self {
        Self {
            engine,
            events,
            interval: Mutex::new(DEFAULT_INTERVAL),
            auto_send: Mutex::new(None),
            swap_pedal_auto: Mutex::new(None),
        }
    }

    /// Interval used by the next scheduler start
    #[must_use]
    pub fn interval(&self) -> Duration {
        *self.interval.lock()
    }

    /// Set the interval
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock() = interval;
    }

    /// Set the interval from operator text in milliseconds
    ///
    /// Text that is not a positive number resets the interval to
    /// [`DEFAULT_INTERVAL`]. Returns the interval now in effect.
    pub fn set_interval_text(&self, text: &str) -> Duration {
        let interval = parse_interval(text).unwrap_or_else(|| {
            self.events.status(format!(
                "invalid interval {text:?}, using {} ms",
                DEFAULT_INTERVAL.as_millis()
            ));
            DEFAULT_INTERVAL
        });
        self.set_interval(interval);
        interval
    }

    /// Whether auto-send is running
    #[must_use]
    pub fn is_auto_sending(&self) -> bool {
        self.auto_send.lock().as_ref().is_some_and(ScheduledTask::is_active)
    }

    /// Whether swap-pedal-auto is running
    #[must_use]
    pub fn is_swap_pedal_auto(&self) -> bool {
        self.swap_pedal_auto
            .lock()
            .as_ref()
            .is_some_and(ScheduledTask::is_active)
    }

    /// Start auto-send over the arms active right now
    ///
    /// Returns the arms it will pick from. With no active arm it reports a
    /// status and does not start.
    pub fn start_auto_send(&self) -> Result<Vec<usize>, SchedulerError> {
        let mut slot = self.auto_send.lock();
        if slot.as_ref().is_some_and(ScheduledTask::is_active) {
            return Err(SchedulerError::AlreadyRunning(AUTO_SEND));
        }

        let arms = self.engine.store().active_arms();
        if arms.is_empty() {
            self.events
                .status("auto-send stopped: no arm has an enabled attribute");
            return Err(SchedulerError::NoActiveArms);
        }

        let interval = self.interval();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(auto_send_loop(
            self.engine.clone(),
            self.events.clone(),
            arms.clone(),
            interval,
            cancel.clone(),
        ));
        *slot = Some(ScheduledTask { cancel, handle });

        info!(
            arms = ?arms,
            interval_ms = %interval.as_millis(),
            "Auto-send started"
        );
        self.events.status(format!(
            "auto-send started every {} ms",
            interval.as_millis()
        ));
        Ok(arms)
    }

    /// Stop auto-send, waiting up to the join timeout
    pub async fn stop_auto_send(&self) -> Result<(), SchedulerError> {
        let task = self
            .auto_send
            .lock()
            .take()
            .ok_or(SchedulerError::NotRunning(AUTO_SEND))?;
        task.stop(AUTO_SEND).await;
        self.events.status("auto-send stopped");
        Ok(())
    }

    /// Start pressing the swap pedal every interval
    pub fn start_swap_pedal_auto(&self) -> Result<(), SchedulerError> {
        let mut slot = self.swap_pedal_auto.lock();
        if slot.as_ref().is_some_and(ScheduledTask::is_active) {
            return Err(SchedulerError::AlreadyRunning(SWAP_PEDAL_AUTO));
        }

        let interval = self.interval();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(swap_pedal_loop(
            self.engine.clone(),
            self.events.clone(),
            interval,
            cancel.clone(),
        ));
        *slot = Some(ScheduledTask { cancel, handle });

        info!(interval_ms = %interval.as_millis(), "Swap-pedal-auto started");
        self.events.status(format!(
            "swap-pedal-auto started every {} ms",
            interval.as_millis()
        ));
        Ok(())
    }

    /// Stop swap-pedal-auto, waiting up to the join timeout
    pub async fn stop_swap_pedal_auto(&self) -> Result<(), SchedulerError> {
        let task = self
            .swap_pedal_auto
            .lock()
            .take()
            .ok_or(SchedulerError::NotRunning(SWAP_PEDAL_AUTO))?;
        task.stop(SWAP_PEDAL_AUTO).await;
        self.events.status("swap-pedal-auto stopped");
        Ok(())
    }

    /// Stop whichever schedulers are running
    pub async fn stop_all(&self) {
        if self.auto_send.lock().is_some() {
            let _ = self.stop_auto_send().await;
        }
        if self.swap_pedal_auto.lock().is_some() {
            let _ = self.stop_swap_pedal_auto().await;
        }
    }
}

/// Sleep for `interval`, returning `false` if cancelled first
async fn pause(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(interval) => true,
    }
}

async fn auto_send_loop(
    engine: DiffEngine,
    events: EventSink,
    arms: Vec<usize>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let arm = arms.choose(&mut rand::thread_rng()).copied();
        if let Some(arm) = arm {
            if let Err(e) = engine.send_arm_state(arm) {
                warn!(arm = %arm_label(arm), error = %e, "Auto-send diff failed");
                events.status(format!("auto-send failed for {}: {e}", arm_label(arm)));
            }
        }

        if !pause(interval, &cancel).await {
            break;
        }
    }
    debug!("Auto-send loop exited");
}

async fn swap_pedal_loop(
    engine: DiffEngine,
    events: EventSink,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if let Err(e) = engine.swap_pedal() {
            warn!(error = %e, "Swap pedal failed");
            events.status(format!("swap pedal failed: {e}"));
        }

        if !pause(interval, &cancel).await {
            break;
        }
    }
    debug!("Swap-pedal-auto loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::attributes::{Selection, IS_SELECTED};
    use crate::queue::OutboundQueue;
    use crate::state::ArmStateStore;

    fn scheduler() -> (Scheduler, Arc<ArmStateStore>, Arc<OutboundQueue>) {
        let store = Arc::new(ArmStateStore::new());
        let queue = Arc::new(OutboundQueue::new());
        let engine = DiffEngine::new(Arc::clone(&store), Arc::clone(&queue));
        (Scheduler::new(engine, EventSink::new()), store, queue)
    }

    fn drain(queue: &OutboundQueue) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| queue.try_dequeue())
            .map(|json| serde_json::from_str(&json).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("250"), Some(Duration::from_millis(250)));
        assert_eq!(parse_interval(" 1500 "), Some(Duration::from_millis(1500)));
        assert!(parse_interval("0.5").is_some());
        assert_eq!(parse_interval("0"), None);
        assert_eq!(parse_interval("-10"), None);
        assert_eq!(parse_interval("fast"), None);
        assert_eq!(parse_interval("NaN"), None);
        assert_eq!(parse_interval("inf"), None);
        assert_eq!(parse_interval("1e300"), None);
    }

    #[test]
    fn test_invalid_interval_resets_to_default() {
        let (scheduler, _store, _queue) = scheduler();
        assert_eq!(
            scheduler.set_interval_text("20"),
            Duration::from_millis(20)
        );
        assert_eq!(scheduler.set_interval_text("soon"), DEFAULT_INTERVAL);
        assert_eq!(scheduler.interval(), DEFAULT_INTERVAL);
    }

    #[tokio::test]
    async fn test_auto_send_without_active_arms_does_not_start() {
        let (scheduler, _store, queue) = scheduler();
        assert_eq!(
            scheduler.start_auto_send(),
            Err(SchedulerError::NoActiveArms)
        );
        assert!(!scheduler.is_auto_sending());
        assert!(queue.is_empty());
        assert_eq!(
            scheduler.stop_auto_send().await,
            Err(SchedulerError::NotRunning(AUTO_SEND))
        );
    }

    #[tokio::test]
    async fn test_auto_send_only_picks_active_arms() {
        let (scheduler, store, queue) = scheduler();
        store
            .set_attribute_selection(2, "esu_state", Selection::Change, true)
            .unwrap();
        scheduler.set_interval(Duration::from_millis(5));

        assert_eq!(scheduler.start_auto_send().unwrap(), vec![2]);
        assert!(scheduler.is_auto_sending());
        assert_eq!(
            scheduler.start_auto_send(),
            Err(SchedulerError::AlreadyRunning(AUTO_SEND))
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop_auto_send().await.unwrap();
        assert!(!scheduler.is_auto_sending());

        let messages = drain(&queue);
        assert!(messages.len() >= 2);
        assert!(messages.iter().all(|m| m["arm_index"] == 2));
    }

    #[tokio::test]
    async fn test_swap_pedal_auto_alternates_selection() {
        let (scheduler, store, queue) = scheduler();
        store
            .set_attribute_selection(0, IS_SELECTED, Selection::Fixed(1), true)
            .unwrap();
        store
            .set_attribute_selection(1, IS_SELECTED, Selection::Fixed(0), true)
            .unwrap();
        scheduler.set_interval(Duration::from_millis(5));

        scheduler.start_swap_pedal_auto().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.stop_swap_pedal_auto().await.unwrap();

        let messages = drain(&queue);
        assert!(messages.len() >= 4);
        assert_eq!(messages.len() % 2, 0);
        for pair in messages.chunks(2) {
            assert_eq!(pair[0]["arm_index"], 0);
            assert_eq!(pair[1]["arm_index"], 1);
            assert_ne!(pair[0][IS_SELECTED], pair[1][IS_SELECTED]);
        }
    }

    #[tokio::test]
    async fn test_stop_all_stops_both() {
        let (scheduler, store, _queue) = scheduler();
        store.set_enabled(3, "is_trocar", true).unwrap();

        scheduler.start_auto_send().unwrap();
        scheduler.start_swap_pedal_auto().unwrap();
        scheduler.stop_all().await;

        assert!(!scheduler.is_auto_sending());
        assert!(!scheduler.is_swap_pedal_auto());
    }
}
