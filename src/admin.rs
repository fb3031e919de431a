use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    address::Address,
    balance::{Balance, Threshold},
    monitor::{BalanceMonitor, SweepSummary},
    store::{AddOutcome, StoreError, SubscriberId, SubscriptionStore},
    sweep::QueryOutcome,
};

/// Rounds spent probing the balance of a freshly added address.
const ADD_PROBE_ROUNDS: u32 = 3;
/// Rounds spent on a subscriber's own balance check.
const LIST_ROUNDS: u32 = 5;

#[derive(Debug, Serialize)]
pub struct AddedAddress {
    pub address: Address,
    pub outcome: AddOutcome,
    /// Absent when the address was already monitored or the probe failed.
    pub balance: Option<Balance>,
    pub threshold: Threshold,
    pub below_threshold: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct AddressBalance {
    pub address: Address,
    pub balance: Option<Balance>,
    pub below_threshold: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BalanceListing {
    pub threshold: Threshold,
    pub rounds: u32,
    pub addresses: Vec<AddressBalance>,
}

/// Administrative operations on subscriptions, backing the HTTP api.
///
/// Balance checks go through the monitor, so they queue behind a running
/// sweep instead of querying the sources alongside it.
pub struct AdminService {
    monitor: Arc<BalanceMonitor>,
    store: Arc<SubscriptionStore>,
}

impl AdminService {
    pub fn new(monitor: Arc<BalanceMonitor>, store: Arc<SubscriptionStore>) -> Self {
        Self { monitor, store }
    }

    /// Adds an address and probes its current balance. The address stays
    /// monitored when the probe fails.
    pub async fn add_address(
        &self,
        subscriber: SubscriberId,
        address: &str,
    ) -> Result<AddedAddress, StoreError> {
        let address: Address = address.parse()?;
        let outcome = self.store.add_address(subscriber, address.as_str()).await?;
        let threshold = self.store.get_threshold(subscriber).await;

        let balance = match outcome {
            AddOutcome::AlreadyPresent => None,
            AddOutcome::Added => {
                let mut report = self
                    .monitor
                    .sweep_addresses(vec![address.clone()], ADD_PROBE_ROUNDS)
                    .await;
                match report.outcomes.remove(&address) {
                    Some(QueryOutcome::Success(balance)) => Some(balance),
                    Some(QueryOutcome::Failure(err)) => {
                        debug!(subscriber, %address, %err, "balance probe failed after add");
                        None
                    }
                    None => None,
                }
            }
        };

        info!(subscriber, %address, ?outcome, "address added");
        Ok(AddedAddress {
            below_threshold: balance.as_ref().map(|balance| balance.is_below(&threshold)),
            address,
            outcome,
            balance,
            threshold,
        })
    }

    /// False when the address was not monitored by the subscriber.
    pub async fn remove_address(
        &self,
        subscriber: SubscriberId,
        address: &str,
    ) -> Result<bool, StoreError> {
        self.store.remove_address(subscriber, address).await
    }

    pub async fn list_addresses(&self, subscriber: SubscriberId) -> Vec<Address> {
        self.store.list_addresses(subscriber).await
    }

    /// Live balances of every address of the subscriber, in the order they
    /// were added.
    pub async fn list_addresses_with_balances(&self, subscriber: SubscriberId) -> BalanceListing {
        let addresses = self.store.list_addresses(subscriber).await;
        let threshold = self.store.get_threshold(subscriber).await;

        let mut report = self
            .monitor
            .sweep_addresses(addresses.clone(), LIST_ROUNDS)
            .await;

        let addresses = addresses
            .into_iter()
            .map(|address| match report.outcomes.remove(&address) {
                Some(QueryOutcome::Success(balance)) => AddressBalance {
                    below_threshold: Some(balance.is_below(&threshold)),
                    balance: Some(balance),
                    error: None,
                    address,
                },
                Some(QueryOutcome::Failure(err)) => AddressBalance {
                    address,
                    balance: None,
                    below_threshold: None,
                    error: Some(err.to_string()),
                },
                // Only after the monitor was stopped.
                None => AddressBalance {
                    address,
                    balance: None,
                    below_threshold: None,
                    error: Some("balance check stopped".to_string()),
                },
            })
            .collect();

        BalanceListing {
            threshold,
            rounds: report.rounds,
            addresses,
        }
    }

    pub async fn set_threshold(
        &self,
        subscriber: SubscriberId,
        value: &str,
    ) -> Result<Threshold, StoreError> {
        self.store.set_threshold(subscriber, value).await
    }

    pub async fn get_threshold(&self, subscriber: SubscriberId) -> Threshold {
        self.store.get_threshold(subscriber).await
    }

    /// Runs a full sweep now, waiting for one already in progress first.
    pub async fn trigger_immediate_sweep(&self) -> SweepSummary {
        info!("immediate sweep requested");
        self.monitor.run_once().await
    }

    pub fn monitor(&self) -> &BalanceMonitor {
        &self.monitor
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        alerts::testing::RecordingNotifier,
        monitor::MonitorConfig,
        store::testing::memory_store,
        sweep::testing::ScriptedLookup,
    };

    pub struct Harness {
        pub admin: AdminService,
        pub lookup: Arc<ScriptedLookup>,
        pub notifier: Arc<RecordingNotifier>,
    }

    pub async fn harness(lookup: ScriptedLookup) -> Harness {
        let (store, _) = memory_store().await;
        let store = Arc::new(store);
        let lookup = Arc::new(lookup);
        let notifier = Arc::new(RecordingNotifier::default());
        let monitor = Arc::new(BalanceMonitor::new(
            lookup.clone(),
            store.clone(),
            notifier.clone(),
            MonitorConfig::default(),
        ));
        let admin = AdminService::new(monitor, store);
        Harness {
            admin,
            lookup,
            notifier,
        }
    }
}
