pub mod telegram;

use async_trait::async_trait;

use crate::{
    address::Address,
    balance::{Balance, Threshold},
    store::SubscriberId,
};

pub use telegram::TelegramNotifier;

/// Delivers a low balance alert to one subscriber.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        subscriber: SubscriberId,
        address: &Address,
        balance: &Balance,
        threshold: &Threshold,
    ) -> anyhow::Result<()>;
}
