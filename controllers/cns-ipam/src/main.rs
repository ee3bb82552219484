use cns_ipam_controller::{Config, Controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let client = kube::Client::try_default().await?;

    let controller = Controller::new(client, config).await?;
    let stop = controller.shutdown_token();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop.cancel();
    });

    controller.run().await;
    Ok(())
}
