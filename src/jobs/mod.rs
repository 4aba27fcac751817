use std::sync::Arc;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, Duration},
};
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

    /// Start all background jobs; each exits once `shutdown` flips to true
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Starting background job scheduler");

        let handles = vec![
            tokio::spawn(Self::retention_sweep_job(Arc::clone(&self), shutdown.clone())),
            tokio::spawn(Self::health_check_job(Arc::clone(&self), shutdown)),
        ];

        info!("Background jobs started");
        handles
    }

    /// Purge terminal event records past retention (hourly by default)
    async fn retention_sweep_job(scheduler: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = scheduler.context.config.retention.sweep_interval_secs.max(1);
        let mut interval = interval(Duration::from_secs(period));

        while wait_for_tick(&mut interval, &mut shutdown).await {
            match tasks::purge_expired_events(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Purged {} expired event records", count);
                    }
                }
                Err(e) => error!("Failed to purge expired event records: {}", e),
            }
        }

        info!("Retention sweep stopped");
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = interval(Duration::from_secs(300));

        while wait_for_tick(&mut interval, &mut shutdown).await {
            if let Err(e) = tasks::health_check(&scheduler.context).await {
                error!("Health check failed: {}", e);
            }
        }
    }
}

/// Wait for the next tick; `false` once shutdown is requested or its sender is gone
async fn wait_for_tick(interval: &mut tokio::time::Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = interval.tick() => return true,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PipelineConfig, RootConfig},
        context::AppContext,
        db,
    };
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_jobs_stop_on_shutdown() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::with_roots(
            dir.path().to_path_buf(),
            vec![RootConfig {
                id: "notes".to_string(),
                path: dir.path().join("vault"),
            }],
        );
        let ctx = AppContext::with_pool(config, db::memory_pool().await.unwrap()).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = Arc::new(JobScheduler::new(Arc::new(ctx))).start(shutdown_rx);
        assert_eq!(handles.len(), 2);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
