use std::sync::Arc;

use anyhow::Context;

use remitsync_api::app::{self, services, AppServices};
use remitsync_infra::{JsonRpcLedger, SchedulerDriver, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    remitsync_observability::init();

    let settings = Settings::load().context("failed to load settings")?;
    if let Err(err) = settings.validate() {
        // Passes fail their batches until this is fixed; the API still serves.
        tracing::error!(error = %err, "remote ledger configuration is incomplete");
    }

    let store = services::build_store(&settings)
        .await
        .context("failed to open pipeline store")?;
    let ledger =
        Arc::new(JsonRpcLedger::new(&settings.remote).context("failed to build ledger client")?);
    let flow = Arc::new(services::build_flow_control(&settings));
    let bind_address = settings.bind_address.clone();

    let driver = Arc::new(SchedulerDriver::new(store, ledger, flow, settings));
    let handle = Arc::clone(&driver).spawn();
    let services = Arc::new(AppServices::new(driver, Some(handle.trigger())));
    let app = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server failed")?;

    handle.shutdown().await;
    Ok(())
}
