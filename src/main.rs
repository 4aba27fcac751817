/// Vault Pipeline - file operation queue with batched git commits
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vault_pipeline::{jobs::JobScheduler, server, AppContext, PipelineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = PipelineConfig::from_env()?;

    // Initialize logging
    let fmt_layer = if config.logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| "vault_pipeline=debug,tower_http=debug".into()),
        )
        .with(fmt_layer)
        .init();

    print_banner();

    // Create application context
    let ctx = AppContext::new(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // Workers and watchers
    let handles = ctx.start_pipeline(shutdown_rx.clone())?;

    // Start background jobs
    let scheduler = Arc::new(JobScheduler::new(Arc::new(ctx.clone())));
    let jobs = scheduler.start(shutdown_rx.clone());

    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = signal_tx.send(true);
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let mut server_rx = shutdown_rx;
    let served = server::serve(ctx, async move {
        let _ = server_rx.wait_for(|stopping| *stopping).await;
    })
    .await;

    // Server is down; let workers drain and flush their final commits
    let _ = shutdown_tx.send(true);
    handles.join().await;
    for job in futures::future::join_all(jobs).await {
        if let Err(e) = job {
            error!("Background job ended abnormally: {}", e);
        }
    }
    info!("Pipeline stopped");

    served?;
    Ok(())
}

fn print_banner() {
    println!(
        r#"
 _   __          ____    ___  _         ___
| | / /__ ___ __/ / /_  / _ \(_)__  ___/ (_)__  ___
| |/ / _ `/ // / / __/ / ___/ / _ \/ -_) / / _ \/ -_)
|___/\_,_/\_,_/_/\__/ /_/  /_/ .__/\__/_/_/_//_/\__/
                            /_/
        File event pipeline v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
