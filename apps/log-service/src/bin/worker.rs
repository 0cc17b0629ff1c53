#[tokio::main]
async fn main() -> anyhow::Result<()> {
    log_service::worker::run_worker().await
}
