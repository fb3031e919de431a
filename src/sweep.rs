use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use itertools::Itertools;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    address::Address,
    balance::Balance,
    oracle::{BalanceLookup, OracleError},
};

/// Granularity at which a sleeping task notices a stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sleeps `duration` in short slices. Returns false as soon as `stop` is
/// seen set.
pub(crate) async fn pause(duration: Duration, stop: &AtomicBool) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(STOP_POLL_INTERVAL);
        sleep(slice).await;
        remaining -= slice;
    }
    !stop.load(Ordering::SeqCst)
}

async fn stopped(stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        sleep(STOP_POLL_INTERVAL).await;
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Upper bound on rounds, the first pass included.
    pub max_rounds: u32,
    pub base_wait: Duration,
    pub cap_wait: Duration,
    /// Pause after every single query, keeps us under provider rate limits.
    pub request_delay: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            base_wait: Duration::from_secs(2),
            cap_wait: Duration::from_secs(10),
            request_delay: Duration::from_millis(300),
        }
    }
}

impl SweepConfig {
    pub fn with_max_rounds(&self, max_rounds: u32) -> Self {
        Self {
            max_rounds,
            ..self.clone()
        }
    }

    /// Wait before re-querying in `round`, `min(round * base_wait, cap_wait)`.
    pub fn backoff(&self, round: u32) -> Duration {
        self.base_wait.saturating_mul(round).min(self.cap_wait)
    }
}

#[derive(Debug)]
pub enum QueryOutcome {
    Success(Balance),
    Failure(OracleError),
}

impl QueryOutcome {
    pub fn balance(&self) -> Option<&Balance> {
        match self {
            QueryOutcome::Success(balance) => Some(balance),
            QueryOutcome::Failure(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub outcomes: HashMap<Address, QueryOutcome>,
    /// Rounds actually run.
    pub rounds: u32,
}

impl SweepReport {
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| matches!(outcome, QueryOutcome::Failure(_)))
            .count()
    }
}

/// Queries balances one at a time with fixed pacing, retrying only the
/// addresses that failed, for a bounded number of rounds.
#[derive(Debug, Clone, Default)]
pub struct Sweeper {
    config: SweepConfig,
}

impl Sweeper {
    /// At least one round is always run.
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config: SweepConfig {
                max_rounds: config.max_rounds.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Sweeps `addresses`, giving up early once `stop` is set. Addresses
    /// never queried before the stop are left out of the report.
    pub async fn sweep(
        &self,
        lookup: &dyn BalanceLookup,
        addresses: impl IntoIterator<Item = Address>,
        stop: &AtomicBool,
    ) -> SweepReport {
        let mut pending: Vec<(Address, Option<OracleError>)> = addresses
            .into_iter()
            .unique()
            .map(|address| (address, None))
            .collect();
        let mut report = SweepReport::default();
        let mut cancelled = false;

        for round in 1..=self.config.max_rounds {
            if pending.is_empty() || stop.load(Ordering::SeqCst) {
                break;
            }

            if round > 1 {
                let wait = self.config.backoff(round);
                info!(
                    round,
                    pending = pending.len(),
                    wait_ms = wait.as_millis() as u64,
                    "retrying failed balance queries"
                );
                if !pause(wait, stop).await {
                    break;
                }
            }
            report.rounds = round;

            let mut still_failing = Vec::new();
            let mut queue = pending.into_iter();
            for (address, previous) in queue.by_ref() {
                let answered = tokio::select! {
                    result = lookup.lookup(&address) => Some(result),
                    _ = stopped(stop) => None,
                };
                let result = match answered {
                    Some(result) => result,
                    None => {
                        still_failing.push((address, previous));
                        cancelled = true;
                        break;
                    }
                };
                let paced = pause(self.config.request_delay, stop).await;

                match result {
                    Ok(balance) => {
                        debug!(round, %address, %balance, "balance query succeeded");
                        report
                            .outcomes
                            .insert(address, QueryOutcome::Success(balance));
                    }
                    Err(err) => {
                        debug!(round, %address, %err, "balance query failed");
                        still_failing.push((address, Some(err)));
                    }
                }

                if !paced {
                    cancelled = true;
                    break;
                }
            }
            still_failing.extend(queue);
            pending = still_failing;

            if cancelled {
                break;
            }
        }

        if stop.load(Ordering::SeqCst) {
            info!(
                rounds = report.rounds,
                pending = pending.len(),
                "balance sweep stopped early"
            );
        }

        for (address, err) in pending.into_iter() {
            // Never queried before a stop.
            let err = match err {
                Some(err) => err,
                None => continue,
            };
            warn!(%address, %err, rounds = report.rounds, "balance unavailable this sweep");
            report.outcomes.insert(address, QueryOutcome::Failure(err));
        }

        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::{
        address::Address,
        balance::Balance,
        oracle::{BalanceLookup, OracleError, SourceError},
    };

    /// Lookup that fails each address a configurable number of times before
    /// answering, and records when it was asked.
    #[derive(Default)]
    pub struct ScriptedLookup {
        script: Mutex<HashMap<Address, (u32, Option<Balance>)>>,
        pub calls: Mutex<Vec<(Address, Instant)>>,
    }

    impl ScriptedLookup {
        pub fn answer(self, address: &str, failures: u32, balance: &str) -> Self {
            self.script.lock().unwrap().insert(
                address.parse().unwrap(),
                (failures, Some(balance.parse().unwrap())),
            );
            self
        }

        pub fn unreachable(self, address: &str) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(address.parse().unwrap(), (u32::MAX, None));
            self
        }

        pub fn calls_for(&self, address: &str) -> Vec<Instant> {
            let address: Address = address.parse().unwrap();
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(called, _)| *called == address)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl BalanceLookup for ScriptedLookup {
        async fn lookup(&self, address: &Address) -> Result<Balance, OracleError> {
            self.calls
                .lock()
                .unwrap()
                .push((address.clone(), Instant::now()));

            let mut script = self.script.lock().unwrap();
            match script.get_mut(address) {
                Some((failures, balance)) if *failures == 0 => balance.clone().ok_or_else(|| {
                    OracleError::AllSourcesExhausted(SourceError::Provider("down".into()))
                }),
                Some((failures, _)) => {
                    *failures = failures.saturating_sub(1);
                    Err(OracleError::AllSourcesExhausted(SourceError::Status(
                        reqwest::StatusCode::TOO_MANY_REQUESTS,
                    )))
                }
                None => Err(OracleError::AllSourcesExhausted(SourceError::Provider(
                    "unknown address".into(),
                ))),
            }
        }
    }
}
