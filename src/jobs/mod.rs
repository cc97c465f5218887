use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::expiry_sweep_job(Arc::clone(&self)));
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Downgrade elapsed subscriptions and renew free windows
    async fn expiry_sweep_job(scheduler: Arc<Self>) {
        let period = Duration::from_secs(scheduler.context.config.jobs.sweep_interval_secs);
        let mut interval = interval(period);

        loop {
            interval.tick().await;
            info!("Running expiry sweep");
            let started = Instant::now();

            match tasks::expiry_sweep(&scheduler.context).await {
                Ok(report) => {
                    crate::metrics::record_background_job(
                        "expiry_sweep",
                        "success",
                        started.elapsed().as_secs_f64(),
                    );
                    info!(
                        downgraded = report.downgraded,
                        renewed = report.renewed,
                        "Expiry sweep finished"
                    );
                }
                Err(e) => {
                    crate::metrics::record_background_job(
                        "expiry_sweep",
                        "failure",
                        started.elapsed().as_secs_f64(),
                    );
                    error!("Expiry sweep failed: {}", e);
                }
            }
        }
    }

    async fn health_check_job(scheduler: Arc<Self>) {
        let period = Duration::from_secs(scheduler.context.config.jobs.health_check_interval_secs);
        let mut interval = interval(period);

        loop {
            interval.tick().await;

            if let Err(e) = tasks::health_check(&scheduler.context).await {
                error!("Health check failed: {}", e);
            }
        }
    }
}
