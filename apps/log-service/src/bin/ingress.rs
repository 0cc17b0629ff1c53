#[tokio::main]
async fn main() -> anyhow::Result<()> {
    log_service::run_ingress().await
}
