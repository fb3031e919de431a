use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    address::Address,
    alerts::Notifier,
    oracle::BalanceLookup,
    store::{Snapshot, SubscriptionStore},
    sweep::{pause, QueryOutcome, SweepConfig, SweepReport, Sweeper},
};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub cooldown: chrono::Duration,
    pub sweep: SweepConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            cooldown: chrono::Duration::hours(24),
            sweep: SweepConfig::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvaluationCounters {
    pub alerts_sent: usize,
    pub alerts_suppressed: usize,
    pub dispatch_failures: usize,
}

/// Matches the successful balances of a sweep against every subscriber of
/// the address and dispatches alerts, gated by the alert cooldown.
///
/// The last alert is recorded only once the notifier accepted the alert.
pub async fn evaluate(
    store: &SubscriptionStore,
    notifier: &dyn Notifier,
    snapshot: &Snapshot,
    report: &SweepReport,
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
) -> EvaluationCounters {
    let mut counters = EvaluationCounters::default();

    for (address, subscribers) in snapshot.address_index() {
        let balance = match report.outcomes.get(&address) {
            Some(QueryOutcome::Success(balance)) => balance,
            Some(QueryOutcome::Failure(_)) | None => continue,
        };

        for subscriber in subscribers {
            let threshold = snapshot.threshold(subscriber);
            if !balance.is_below(&threshold) {
                continue;
            }

            if !store.should_alert(subscriber, &address, now, cooldown).await {
                debug!(subscriber, %address, "alert recently sent, skipping");
                counters.alerts_suppressed += 1;
                continue;
            }

            match notifier
                .notify(subscriber, &address, balance, &threshold)
                .await
            {
                Ok(()) => {
                    info!(
                        subscriber,
                        address = %address.short(),
                        %balance,
                        %threshold,
                        "sent low balance alert"
                    );
                    counters.alerts_sent += 1;
                    if let Err(err) = store
                        .record_alert(subscriber, &address, now, cooldown)
                        .await
                    {
                        error!(subscriber, %address, %err, "failed to record sent alert");
                    }
                }
                Err(err) => {
                    warn!(subscriber, %address, ?err, "failed to dispatch low balance alert");
                    counters.dispatch_failures += 1;
                }
            }
        }
    }

    counters
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub finished_at: DateTime<Utc>,
    pub addresses_checked: usize,
    pub failures: usize,
    pub rounds: u32,
    #[serde(flatten)]
    pub counters: EvaluationCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

/// Periodically sweeps every monitored address and alerts subscribers whose
/// balance dropped below their threshold.
pub struct BalanceMonitor {
    cooldown: chrono::Duration,
    interval: Duration,
    last_sweep: RwLock<Option<SweepSummary>>,
    lookup: Arc<dyn BalanceLookup>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<MonitorState>,
    stop_requested: AtomicBool,
    store: Arc<SubscriptionStore>,
    sweep_lock: Mutex<()>,
    sweeper: Sweeper,
}

impl BalanceMonitor {
    pub fn new(
        lookup: Arc<dyn BalanceLookup>,
        store: Arc<SubscriptionStore>,
        notifier: Arc<dyn Notifier>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            cooldown: config.cooldown,
            interval: config.interval,
            last_sweep: RwLock::new(None),
            lookup,
            notifier,
            state: Mutex::new(MonitorState::Idle),
            stop_requested: AtomicBool::new(false),
            store,
            sweep_lock: Mutex::new(()),
            sweeper: Sweeper::new(config.sweep),
        }
    }

    pub async fn state(&self) -> MonitorState {
        *self.state.lock().await
    }

    pub async fn last_sweep(&self) -> Option<SweepSummary> {
        self.last_sweep.read().await.clone()
    }

    /// Spawns the sweep loop. Does nothing unless the monitor is idle.
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state.lock().await;
            if *state != MonitorState::Idle {
                warn!(state = ?*state, "monitor already started, ignoring start");
                return None;
            }
            *state = MonitorState::Running;
        }

        let monitor = self.clone();
        Some(tokio::spawn(async move { monitor.run_loop().await }))
    }

    /// Stops the loop and any sweep in flight, at most a second into a wait.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        *self.state.lock().await = MonitorState::Stopped;
        info!("stop requested for balance monitor");
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting balance monitor"
        );

        while !self.is_stop_requested() {
            // A panicking pass must not take the loop down with it.
            let monitor = self.clone();
            if let Err(err) = tokio::spawn(async move { monitor.run_once().await }).await {
                error!(%err, "balance sweep aborted");
            }

            if !self.wait_for_next_pass().await {
                break;
            }
        }

        info!("balance monitor stopped");
    }

    /// Returns false when a stop was requested during the interval.
    async fn wait_for_next_pass(&self) -> bool {
        pause(self.interval, &self.stop_requested).await
    }

    /// Runs `task` exclusively against the balance sources: it waits for a
    /// sweep in progress, and no sweep starts until it is done.
    pub async fn with_sweep_lock<T>(&self, task: impl Future<Output = T>) -> T {
        let _sweep_guard = self.sweep_lock.lock().await;
        task.await
    }

    /// Sweeps `addresses` with at most `max_rounds` rounds, queued behind
    /// any other sweep.
    pub async fn sweep_addresses(&self, addresses: Vec<Address>, max_rounds: u32) -> SweepReport {
        let sweeper = Sweeper::new(self.sweeper.config().with_max_rounds(max_rounds));
        self.with_sweep_lock(sweeper.sweep(
            self.lookup.as_ref(),
            addresses,
            &self.stop_requested,
        ))
        .await
    }

    /// One sweep and evaluation over every monitored address. Passes never
    /// overlap, a second caller waits for the running pass to finish.
    pub async fn run_once(&self) -> SweepSummary {
        let _sweep_guard = self.sweep_lock.lock().await;

        let snapshot = self.store.snapshot().await;
        let addresses = snapshot.address_index().into_keys().collect::<Vec<_>>();
        info!(addresses = addresses.len(), "starting balance sweep");

        let report = self
            .sweeper
            .sweep(self.lookup.as_ref(), addresses, &self.stop_requested)
            .await;

        let counters = evaluate(
            &self.store,
            self.notifier.as_ref(),
            &snapshot,
            &report,
            Utc::now(),
            self.cooldown,
        )
        .await;

        let summary = SweepSummary {
            finished_at: Utc::now(),
            addresses_checked: report.outcomes.len(),
            failures: report.failed_count(),
            rounds: report.rounds,
            counters,
        };
        info!(
            addresses_checked = summary.addresses_checked,
            failures = summary.failures,
            rounds = summary.rounds,
            alerts_sent = counters.alerts_sent,
            alerts_suppressed = counters.alerts_suppressed,
            dispatch_failures = counters.dispatch_failures,
            "balance sweep completed"
        );

        *self.last_sweep.write().await = Some(summary.clone());
        summary
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::time::sleep;

    use super::*;
    use crate::{
        alerts::testing::RecordingNotifier,
        balance::Balance,
        oracle::OracleError,
        store::testing::memory_store,
        sweep::testing::ScriptedLookup,
    };

    const A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn address(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn report(outcomes: Vec<(&str, QueryOutcome)>) -> SweepReport {
        SweepReport {
            outcomes: outcomes
                .into_iter()
                .map(|(s, outcome)| (address(s), outcome))
                .collect(),
            rounds: 1,
        }
    }

    fn success(balance: &str) -> QueryOutcome {
        QueryOutcome::Success(balance.parse().unwrap())
    }

    async fn monitor_with(
        lookup: ScriptedLookup,
        store: SubscriptionStore,
    ) -> (Arc<BalanceMonitor>, Arc<RecordingNotifier>, Arc<SubscriptionStore>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(store);
        let monitor = Arc::new(BalanceMonitor::new(
            Arc::new(lookup),
            store.clone(),
            notifier.clone(),
            MonitorConfig::default(),
        ));
        (monitor, notifier, store)
    }

    #[tokio::test]
    async fn alerts_once_per_cooldown_window() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        let notifier = RecordingNotifier::default();
        let cooldown = chrono::Duration::hours(24);
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let low = report(vec![(A, success("0.01"))]);

        let mut sent = Vec::new();
        for hours in [0, 1, 25] {
            let snapshot = store.snapshot().await;
            let now = start + chrono::Duration::hours(hours);
            let counters = evaluate(&store, &notifier, &snapshot, &low, now, cooldown).await;
            sent.push(counters.alerts_sent);
        }

        assert_eq!(sent, vec![1, 0, 1]);
        assert_eq!(notifier.sent().len(), 2);
        assert_eq!(
            store.last_alert(1, &address(A)).await,
            Some(start + chrono::Duration::hours(25))
        );
    }

    #[tokio::test]
    async fn balance_equal_to_threshold_does_not_alert() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        store.set_threshold(1, "0.05").await.unwrap();
        let notifier = RecordingNotifier::default();
        let snapshot = store.snapshot().await;

        let at_threshold = report(vec![(A, success("0.05"))]);
        let counters = evaluate(
            &store,
            &notifier,
            &snapshot,
            &at_threshold,
            Utc::now(),
            chrono::Duration::hours(24),
        )
        .await;
        assert_eq!(counters, EvaluationCounters::default());

        let just_below = report(vec![(A, success("0.049999999999999999"))]);
        let counters = evaluate(
            &store,
            &notifier,
            &snapshot,
            &just_below,
            Utc::now(),
            chrono::Duration::hours(24),
        )
        .await;
        assert_eq!(counters.alerts_sent, 1);
    }

    #[tokio::test]
    async fn failed_dispatch_is_not_recorded() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        let notifier = RecordingNotifier::default();
        notifier.set_failing(true);
        let snapshot = store.snapshot().await;
        let low = report(vec![(A, success("0.001"))]);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cooldown = chrono::Duration::hours(24);

        let counters = evaluate(&store, &notifier, &snapshot, &low, now, cooldown).await;
        assert_eq!(counters.dispatch_failures, 1);
        assert_eq!(store.last_alert(1, &address(A)).await, None);

        // the next sweep retries the alert
        notifier.set_failing(false);
        let counters = evaluate(&store, &notifier, &snapshot, &low, now, cooldown).await;
        assert_eq!(counters.alerts_sent, 1);
    }

    #[tokio::test]
    async fn failed_queries_are_skipped() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        store.add_address(1, B).await.unwrap();
        let notifier = RecordingNotifier::default();
        let snapshot = store.snapshot().await;
        let outcomes = report(vec![
            (
                A,
                QueryOutcome::Failure(crate::oracle::OracleError::AllSourcesExhausted(
                    crate::oracle::SourceError::Provider("down".to_string()),
                )),
            ),
            (B, success("0.01")),
        ]);

        let counters = evaluate(
            &store,
            &notifier,
            &snapshot,
            &outcomes,
            Utc::now(),
            chrono::Duration::hours(24),
        )
        .await;

        assert_eq!(counters.alerts_sent, 1);
        assert_eq!(notifier.sent()[0].address, address(B));
        assert_eq!(store.last_alert(1, &address(A)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn alerts_only_subscribers_whose_threshold_exceeds_balance() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        store.set_threshold(1, "0.1").await.unwrap();
        store.add_address(2, A).await.unwrap();
        store.set_threshold(2, "0.01").await.unwrap();
        let lookup = ScriptedLookup::default().answer(A, 0, "0.05");
        let (monitor, notifier, store) = monitor_with(lookup, store).await;

        let summary = monitor.run_once().await;

        assert_eq!(summary.addresses_checked, 1);
        assert_eq!(summary.counters.alerts_sent, 1);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subscriber, 1);
        assert_eq!(sent[0].balance, "0.05".parse().unwrap());
        assert!(store.last_alert(1, &address(A)).await.is_some());
        assert!(store.last_alert(2, &address(A)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_address_is_queried_once_per_sweep() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        store.add_address(2, A).await.unwrap();
        let lookup = Arc::new(ScriptedLookup::default().answer(A, 0, "1"));
        let monitor = BalanceMonitor::new(
            lookup.clone(),
            Arc::new(store),
            Arc::new(RecordingNotifier::default()),
            MonitorConfig::default(),
        );

        monitor.run_once().await;

        assert_eq!(lookup.calls_for(A).len(), 1);
        assert!(monitor.last_sweep().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_a_no_op_unless_idle() {
        let (store, _) = memory_store().await;
        let (monitor, _, _) = monitor_with(ScriptedLookup::default(), store).await;

        let handle = monitor.start().await;
        assert!(handle.is_some());
        assert_eq!(monitor.state().await, MonitorState::Running);
        assert!(monitor.start().await.is_none());

        monitor.stop().await;
        assert!(monitor.start().await.is_none());
        assert_eq!(monitor.state().await, MonitorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_promptly_during_interval_wait() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        let lookup = ScriptedLookup::default().answer(A, 0, "5");
        let (monitor, _, _) = monitor_with(lookup, store).await;

        let handle = monitor.start().await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert!(monitor.last_sweep().await.is_some());

        monitor.stop().await;
        let stopped = tokio::time::timeout(Duration::from_secs(2), handle).await;

        assert!(stopped.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_sweep_in_progress() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        let (monitor, _, _) = monitor_with(ScriptedLookup::default().unreachable(A), store).await;

        let handle = monitor.start().await.unwrap();
        sleep(Duration::from_secs(1)).await;
        monitor.stop().await;
        let stopped = tokio::time::timeout(Duration::from_secs(2), handle).await;

        assert!(stopped.is_ok());
        let summary = monitor.last_sweep().await.unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.rounds, 1);
    }

    /// Panics on its first lookup, answers afterwards.
    #[derive(Default)]
    struct PanicsOnce {
        panicked: AtomicBool,
    }

    #[async_trait]
    impl BalanceLookup for PanicsOnce {
        async fn lookup(&self, _address: &Address) -> Result<Balance, OracleError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("source client blew up");
            }
            Ok("1".parse().unwrap())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_pass_keeps_the_loop_running() {
        let (store, _) = memory_store().await;
        store.add_address(1, A).await.unwrap();
        let monitor = Arc::new(BalanceMonitor::new(
            Arc::new(PanicsOnce::default()),
            Arc::new(store),
            Arc::new(RecordingNotifier::default()),
            MonitorConfig {
                interval: Duration::from_secs(60),
                ..MonitorConfig::default()
            },
        ));

        let handle = monitor.start().await.unwrap();
        sleep(Duration::from_secs(30)).await;
        assert!(monitor.last_sweep().await.is_none());
        assert_eq!(monitor.state().await, MonitorState::Running);

        sleep(Duration::from_secs(60)).await;
        let summary = monitor.last_sweep().await.unwrap();
        assert_eq!(summary.addresses_checked, 1);
        assert_eq!(summary.failures, 0);
        assert_eq!(monitor.state().await, MonitorState::Running);
        assert!(!handle.is_finished());

        monitor.stop().await;
        assert!(tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .is_ok());
    }
}
