use anyhow::Result;

#[tokio::main]
pub async fn main() -> Result<()> {
    gas_alert::run_service().await
}
