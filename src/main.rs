/// Tollgate server binary
use std::sync::Arc;
use tollgate::{config::ServerConfig, jobs, server, AppContext, EngineResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> EngineResult<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tollgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    let config = ServerConfig::from_env()?;

    let ctx = Arc::new(AppContext::new(config).await?);

    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    server::serve((*ctx).clone()).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  _        _ _             _
 | |_ ___ | | | __ _  __ _| |_ ___
 | __/ _ \| | |/ _` |/ _` | __/ _ \
 | || (_) | | | (_| | (_| | ||  __/
  \__\___/|_|_|\__, |\__,_|\__\___|
               |___/

        Entitlement engine v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
