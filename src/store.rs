mod file;

pub use file::JsonFileStorage;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    address::{Address, AddressError},
    balance::{Threshold, ThresholdError},
};

/// Telegram chat id of the subscriber.
pub type SubscriberId = i64;

pub type Subscribers = BTreeMap<SubscriberId, Subscriber>;

/// Subscribers watching an address, derived from a snapshot.
pub type AddressIndex = BTreeMap<Address, Vec<SubscriberId>>;

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Monitored addresses in the order they were added.
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde_as(as = "BTreeMap<_, TimestampSeconds<i64>>")]
    #[serde(default)]
    pub last_alert: BTreeMap<Address, DateTime<Utc>>,
    /// Unset means [`Threshold::default`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
}

impl Subscriber {
    pub fn threshold(&self) -> Threshold {
        self.threshold.clone().unwrap_or_default()
    }
}

/// Where subscriber state lives between restarts.
#[async_trait]
pub trait StateStorage: Send + Sync {
    async fn load(&self) -> anyhow::Result<Subscribers>;

    async fn save(&self, subscribers: &Subscribers) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error(transparent)]
    InvalidThreshold(#[from] ThresholdError),
    #[error("failed to persist subscriptions: {0:#}")]
    Persistence(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

/// A consistent copy of all subscriber state, taken at the start of a sweep.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    subscribers: Subscribers,
}

impl Snapshot {
    pub fn address_index(&self) -> AddressIndex {
        let mut index = AddressIndex::new();
        for (id, subscriber) in self.subscribers.iter() {
            for address in subscriber.addresses.iter() {
                index.entry(address.clone()).or_default().push(*id);
            }
        }
        index
    }

    pub fn threshold(&self, id: SubscriberId) -> Threshold {
        self.subscribers
            .get(&id)
            .map(Subscriber::threshold)
            .unwrap_or_default()
    }

    pub fn subscriber(&self, id: SubscriberId) -> Option<&Subscriber> {
        self.subscribers.get(&id)
    }
}

/// Owns subscriber, threshold and alert dedup state.
///
/// Every mutation is applied to a copy, persisted, and only then made
/// visible. A failed save leaves the state as it was.
pub struct SubscriptionStore {
    state: Mutex<Subscribers>,
    storage: Box<dyn StateStorage>,
}

impl SubscriptionStore {
    pub async fn open(storage: impl StateStorage + 'static) -> anyhow::Result<Self> {
        let subscribers = storage.load().await?;
        info!(subscribers = subscribers.len(), "loaded subscriptions");
        Ok(Self {
            state: Mutex::new(subscribers),
            storage: Box::new(storage),
        })
    }

    /// Runs `change` against a copy of the state and persists it when it
    /// reports a modification.
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut Subscribers) -> (T, bool),
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let (value, changed) = change(&mut next);
        if changed {
            self.storage
                .save(&next)
                .await
                .map_err(StoreError::Persistence)?;
            *state = next;
        }
        Ok(value)
    }

    pub async fn add_address(
        &self,
        id: SubscriberId,
        address: &str,
    ) -> Result<AddOutcome, StoreError> {
        let address: Address = address.parse()?;
        let outcome = self
            .update(|subscribers| {
                let subscriber = subscribers.entry(id).or_default();
                if subscriber.addresses.contains(&address) {
                    (AddOutcome::AlreadyPresent, false)
                } else {
                    subscriber.addresses.push(address.clone());
                    (AddOutcome::Added, true)
                }
            })
            .await?;
        debug!(subscriber = id, %address, ?outcome, "add address");
        Ok(outcome)
    }

    /// Returns false when the address was not monitored. Alert history for
    /// the address is kept.
    pub async fn remove_address(&self, id: SubscriberId, address: &str) -> Result<bool, StoreError> {
        let address: Address = address.parse()?;
        let removed = self
            .update(|subscribers| match subscribers.get_mut(&id) {
                Some(subscriber) => {
                    let before = subscriber.addresses.len();
                    subscriber.addresses.retain(|existing| *existing != address);
                    let removed = subscriber.addresses.len() != before;
                    (removed, removed)
                }
                None => (false, false),
            })
            .await?;
        debug!(subscriber = id, %address, removed, "remove address");
        Ok(removed)
    }

    pub async fn list_addresses(&self, id: SubscriberId) -> Vec<Address> {
        self.state
            .lock()
            .await
            .get(&id)
            .map(|subscriber| subscriber.addresses.clone())
            .unwrap_or_default()
    }

    pub async fn set_threshold(&self, id: SubscriberId, value: &str) -> Result<Threshold, StoreError> {
        let threshold: Threshold = value.parse()?;
        self.update(|subscribers| {
            subscribers.entry(id).or_default().threshold = Some(threshold.clone());
            ((), true)
        })
        .await?;
        info!(subscriber = id, %threshold, "threshold updated");
        Ok(threshold)
    }

    pub async fn get_threshold(&self, id: SubscriberId) -> Threshold {
        self.state
            .lock()
            .await
            .get(&id)
            .map(Subscriber::threshold)
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            subscribers: self.state.lock().await.clone(),
        }
    }

    pub async fn last_alert(&self, id: SubscriberId, address: &Address) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .get(&id)
            .and_then(|subscriber| subscriber.last_alert.get(address).copied())
    }

    /// True when no alert for the pair was sent within `cooldown` before `now`.
    pub async fn should_alert(
        &self,
        id: SubscriberId,
        address: &Address,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> bool {
        match self.last_alert(id, address).await {
            Some(last_alert) => now - last_alert > cooldown,
            None => true,
        }
    }

    /// Records `now`, truncated to whole seconds as it is persisted.
    ///
    /// Entries of addresses the subscriber no longer monitors are dropped
    /// once their cooldown has passed, they can no longer suppress anything.
    pub async fn record_alert(
        &self,
        id: SubscriberId,
        address: &Address,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<(), StoreError> {
        let now = now.trunc_subsecs(0);
        self.update(|subscribers| {
            let subscriber = subscribers.entry(id).or_default();
            let monitored = &subscriber.addresses;
            subscriber
                .last_alert
                .retain(|alerted, at| monitored.contains(alerted) || now - *at <= cooldown);
            subscriber.last_alert.insert(address.clone(), now);
            ((), true)
        })
        .await
    }
}
