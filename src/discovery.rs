//! Scan lifecycle and the advertisement → presence → snapshot pipeline.
//!
//! ```text
//! Adapter ─advertisements─▶ event loop ──observe/prune──▶ PresenceTracker
//!                               │   └─ new identity ──▶ Discovered(device)
//!                               └─ debounce expiry ──▶ Updated(snapshot)
//! ```
//!
//! All tracker mutation happens in the single event-loop task, one
//! advertisement at a time, so a snapshot never reflects half an update.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::adapter::{Adapter, EventStream, SlotClaim};
use crate::debounce::Debouncer;
use crate::error::{Result, ScaleError};
use crate::events::{lock, Subscribers, Subscription};
use crate::identity::identify;
use crate::protocol::{
    DEFAULT_DEBOUNCE_DELAY, DEFAULT_PRESENCE_WINDOW, DEFAULT_PRUNE_INTERVAL, DEFAULT_READY_TIMEOUT,
};
use crate::tracker::PresenceTracker;
use crate::types::{Advertisement, DiscoveryEvent, ScanState, TrackedDevice};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Timing knobs for a [`DiscoverySession`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// A device not re-observed for this long is dropped.
    pub presence_window: Duration,
    /// Quiet period before a full snapshot is published.
    pub debounce_delay: Duration,
    /// How often stale devices are pruned when no advertisements arrive.
    pub prune_interval: Duration,
    /// Bound on the wait for the adapter to power on.  `None` waits forever.
    pub ready_timeout: Option<Duration>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            presence_window: DEFAULT_PRESENCE_WINDOW,
            debounce_delay: DEFAULT_DEBOUNCE_DELAY,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

struct Lifecycle {
    state: ScanState,
    /// Bumped by every `stop()` and by the event loop when its stream ends;
    /// lets an in-flight `start()` or a finishing loop notice it is stale.
    generation: u64,
    task: Option<JoinHandle<()>>,
    /// Ownership of the adapter's scan while `Scanning`.
    claim: Option<SlotClaim>,
}

/// Owns the scan and the presence tracker.
///
/// Only one session per adapter can scan at a time: a second one sharing
/// the adapter gets [`ScaleError::AlreadyActive`] from [`start`](Self::start)
/// until the first stops.
pub struct DiscoverySession<A: Adapter> {
    adapter: Arc<A>,
    config: DiscoveryConfig,
    lifecycle: Arc<Mutex<Lifecycle>>,
    tracker: Arc<Mutex<PresenceTracker>>,
    events: Subscribers<DiscoveryEvent>,
}

impl<A: Adapter> DiscoverySession<A> {
    pub fn new(adapter: Arc<A>, config: DiscoveryConfig) -> Self {
        Self {
            adapter,
            config,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ScanState::Stopped,
                generation: 0,
                task: None,
                claim: None,
            })),
            tracker: Arc::new(Mutex::new(PresenceTracker::new())),
            events: Subscribers::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        lock(&self.lifecycle).state
    }

    /// Current tracked devices, ordered by first sighting.
    pub fn snapshot(&self) -> Vec<TrackedDevice> {
        lock(&self.tracker).snapshot()
    }

    /// Register for [`DiscoveryEvent`]s.  Drop the subscription to unsubscribe.
    pub fn subscribe(&self) -> Subscription<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Wait for the adapter, start scanning and spawn the event loop.
    ///
    /// Fails with [`ScaleError::AlreadyActive`] unless the session is
    /// stopped and no other session is scanning on the same adapter.  On any
    /// adapter failure the session is back in [`ScanState::Stopped`] when
    /// this returns.
    pub async fn start(&self) -> Result<()> {
        let (generation, claim) = {
            let mut lc = lock(&self.lifecycle);
            if lc.state != ScanState::Stopped {
                return Err(ScaleError::AlreadyActive);
            }
            let Some(claim) = self.adapter.scan_slot().try_claim() else {
                warn!("Discovery: another session is already scanning on this adapter");
                return Err(ScaleError::AlreadyActive);
            };
            lc.state = ScanState::Starting;
            (lc.generation, claim)
        };
        info!("Discovery: starting");

        let advertisements = match self.begin_scan().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Discovery: could not start scanning: {e}");
                let mut lc = lock(&self.lifecycle);
                if lc.generation == generation {
                    lc.state = ScanState::Stopped;
                }
                return Err(e);
            }
        };

        let mut claim = Some(claim);
        let cancelled = {
            let mut lc = lock(&self.lifecycle);
            if lc.generation == generation {
                let pipeline = Pipeline {
                    adapter: Arc::clone(&self.adapter),
                    lifecycle: Arc::clone(&self.lifecycle),
                    generation,
                    tracker: Arc::clone(&self.tracker),
                    events: self.events.clone(),
                    config: self.config.clone(),
                };
                lc.task = Some(tokio::spawn(pipeline.run(advertisements)));
                lc.claim = claim.take();
                lc.state = ScanState::Scanning;
                false
            } else {
                true
            }
        };

        if cancelled {
            // stop() ran while the scan was starting; undo the scan it missed.
            info!("Discovery: stopped while starting");
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Discovery: stop_scan after cancelled start failed: {e}");
            }
        } else {
            info!("Discovery: scanning");
        }
        drop(claim);
        Ok(())
    }

    async fn begin_scan(&self) -> Result<EventStream<Advertisement>> {
        match self.config.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, self.adapter.wait_ready())
                .await
                .map_err(|_| ScaleError::NotReady)??,
            None => self.adapter.wait_ready().await?,
        }
        let advertisements = self.adapter.advertisements().await?;
        self.adapter.start_scan().await?;
        Ok(advertisements)
    }

    /// Stop scanning and forget every tracked device.  Subscribers are not
    /// notified.  Adapter failures are logged and otherwise ignored.
    pub async fn stop(&self) {
        let (previous, task, claim) = {
            let mut lc = lock(&self.lifecycle);
            let previous = lc.state;
            lc.state = ScanState::Stopped;
            lc.generation += 1;
            (previous, lc.task.take(), lc.claim.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        lock(&self.tracker).clear();

        if previous == ScanState::Scanning {
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Discovery: stop_scan failed: {e}");
            }
            info!("Discovery: stopped");
        }
        drop(claim);
    }
}

impl<A: Adapter> Drop for DiscoverySession<A> {
    fn drop(&mut self) {
        let mut lc = lock(&self.lifecycle);
        if let Some(task) = lc.task.take() {
            task.abort();
        }
        lc.claim = None;
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Everything the spawned event loop needs from its session.
struct Pipeline<A: Adapter> {
    adapter: Arc<A>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    generation: u64,
    tracker: Arc<Mutex<PresenceTracker>>,
    events: Subscribers<DiscoveryEvent>,
    config: DiscoveryConfig,
}

impl<A: Adapter> Pipeline<A> {
    async fn run(self, mut advertisements: EventStream<Advertisement>) {
        let window = self.config.presence_window;
        let interval = self.config.prune_interval;
        let mut debouncer = Debouncer::new(self.config.debounce_delay);
        let mut prune_tick = interval_at(Instant::now() + interval, interval);
        prune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                adv = advertisements.next() => {
                    let Some(adv) = adv else {
                        warn!("Discovery: advertisement stream ended");
                        break;
                    };
                    let now = Instant::now();
                    let key = identify(&adv);
                    let discovered = {
                        let mut tracker = lock(&self.tracker);
                        let is_new = tracker.observe(adv, now);
                        let removed = tracker.prune(now, window);
                        if removed > 0 {
                            debug!("Discovery: pruned {removed} stale device(s)");
                        }
                        if is_new { tracker.get(&key).cloned() } else { None }
                    };
                    if let Some(device) = discovered {
                        info!("Discovery: found {}  [{}]", device.name(), device.identity);
                        self.events.publish(DiscoveryEvent::Discovered(device));
                    }
                    debouncer.trigger(now);
                }
                _ = sleep_until_deadline(debouncer.deadline()) => {
                    if debouncer.fire_if_due(Instant::now()) {
                        let snapshot = lock(&self.tracker).snapshot();
                        debug!("Discovery: publishing snapshot of {} device(s)", snapshot.len());
                        self.events.publish(DiscoveryEvent::Updated(snapshot));
                    }
                }
                _ = prune_tick.tick() => {
                    let now = Instant::now();
                    let removed = lock(&self.tracker).prune(now, window);
                    if removed > 0 {
                        debug!("Discovery: {removed} device(s) went out of range");
                        debouncer.trigger(now);
                    }
                }
            }
        }

        self.stream_ended().await;
    }

    /// Return the session to `Stopped` so it can be started again, unless
    /// `stop()` already took over.
    async fn stream_ended(self) {
        let claim = {
            let mut lc = lock(&self.lifecycle);
            if lc.generation != self.generation {
                return;
            }
            lc.generation += 1;
            lc.state = ScanState::Stopped;
            // Detaches this task's own handle.
            lc.task = None;
            lc.claim.take()
        };
        let had_devices = {
            let mut tracker = lock(&self.tracker);
            let had = !tracker.is_empty();
            tracker.clear();
            had
        };
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Discovery: stop_scan after stream end failed: {e}");
        }
        drop(claim);
        info!("Discovery: stopped (advertisement stream ended)");
        if had_devices {
            self.events.publish(DiscoveryEvent::Updated(Vec::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimAdapter;

    fn session(sim: &SimAdapter) -> DiscoverySession<SimAdapter> {
        DiscoverySession::new(Arc::new(sim.clone()), DiscoveryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_fails_fast() {
        let sim = SimAdapter::new();
        let discovery = session(&sim);
        discovery.start().await.unwrap();
        assert_eq!(discovery.start().await, Err(ScaleError::AlreadyActive));
        assert_eq!(discovery.state(), ScanState::Scanning);
        assert_eq!(sim.scan_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_failure_returns_to_stopped() {
        let sim = SimAdapter::new();
        sim.set_scan_failure(Some("radio busy"));
        let discovery = session(&sim);
        assert_eq!(
            discovery.start().await,
            Err(ScaleError::Adapter("radio busy".into()))
        );
        assert_eq!(discovery.state(), ScanState::Stopped);

        sim.set_scan_failure(None);
        discovery.start().await.unwrap();
        assert_eq!(discovery.state(), ScanState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn unpowered_adapter_times_out_as_not_ready() {
        let sim = SimAdapter::new();
        sim.set_powered(false);
        let discovery = session(&sim);
        assert_eq!(discovery.start().await, Err(ScaleError::NotReady));
        assert_eq!(discovery.state(), ScanState::Stopped);
        assert_eq!(sim.scan_starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_starting_leaves_no_scan_running() {
        let sim = SimAdapter::new();
        sim.set_powered(false);
        let discovery = Arc::new(session(&sim));

        let starting = tokio::spawn({
            let discovery = Arc::clone(&discovery);
            async move { discovery.start().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(discovery.state(), ScanState::Starting);

        discovery.stop().await;
        sim.set_powered(true);
        assert!(starting.await.unwrap().is_ok());
        assert_eq!(discovery.state(), ScanState::Stopped);
        assert!(!sim.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_devices_and_allows_restart() {
        let sim = SimAdapter::new();
        let discovery = session(&sim);
        let mut events = discovery.subscribe();
        discovery.start().await.unwrap();

        sim.advertise(Advertisement {
            peripheral_id: "p".into(),
            address: Some("AA:AA:AA:AA:AA:AA".into()),
            ..Default::default()
        });
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Discovered(_))));
        assert_eq!(discovery.snapshot().len(), 1);

        discovery.stop().await;
        assert!(discovery.snapshot().is_empty());
        assert_eq!(discovery.state(), ScanState::Stopped);
        assert_eq!(sim.scan_stops(), 1);

        discovery.start().await.unwrap();
        assert_eq!(sim.scan_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_session_on_one_adapter_fails_fast() {
        let sim = SimAdapter::new();
        let first = session(&sim);
        let second = session(&sim);
        first.start().await.unwrap();

        assert_eq!(second.start().await, Err(ScaleError::AlreadyActive));
        assert_eq!(second.state(), ScanState::Stopped);
        assert_eq!(sim.scan_starts(), 1);

        // The scan is free again once its owner stops.
        first.stop().await;
        second.start().await.unwrap();
        assert_eq!(second.state(), ScanState::Scanning);
        assert!(sim.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn ended_advertisement_stream_returns_to_stopped() {
        let sim = SimAdapter::new();
        let discovery = session(&sim);
        let mut events = discovery.subscribe();
        discovery.start().await.unwrap();

        sim.advertise(Advertisement {
            peripheral_id: "p".into(),
            address: Some("AA:AA:AA:AA:AA:AA".into()),
            ..Default::default()
        });
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Discovered(_))));

        sim.close_advertisements();
        assert!(matches!(
            events.recv().await,
            Some(DiscoveryEvent::Updated(list)) if list.is_empty()
        ));
        assert_eq!(discovery.state(), ScanState::Stopped);
        assert!(discovery.snapshot().is_empty());
        assert!(!sim.is_scanning());

        discovery.start().await.unwrap();
        assert_eq!(discovery.state(), ScanState::Scanning);
    }
}
