use anyhow::{bail, Context, Result};
use chrono::Utc;
use goes_viewer::delivery::ConsumerParams;
use goes_viewer::io::ObjectStore;
use goes_viewer::{Config, HttpObjectStore, Mode, Pipeline, Poller, QueueConsumer, SqsQueue};
use std::sync::Arc;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env().context("Invalid configuration")?;
    log::info!(
        "Starting in {:?} mode: prefix {}, output {}",
        config.mode,
        config.source_prefix,
        config.output_dir.display()
    );
    log::debug!(
        "Dashboard settings: page {}, tiles {}, lon {:?}, lat {:?}",
        config.dashboard_file,
        config.tile_source,
        config.lon_limits,
        config.lat_limits
    );

    // Built outside the async runtime: the blocking HTTP client owns its own
    let store: Arc<dyn ObjectStore> = Arc::new(
        HttpObjectStore::new(&config.object_endpoint, config.request_timeout)
            .context("Failed to build HTTP client")?,
    );
    let pipeline = Arc::new(Pipeline::new(&config, Arc::clone(&store))?);

    match config.mode {
        Mode::Poll => {
            let poller = Poller::new(
                store,
                pipeline,
                &config.source_bucket,
                &config.source_prefix,
                &config.lock_dir,
            );
            let summary = poller.run_once(Utc::now())?;
            if summary.failed > 0 {
                bail!("{} of {} units failed", summary.failed, summary.listed);
            }
        }
        Mode::Queue => {
            let url = config
                .queue_url
                .clone()
                .context("GV_SQS_URL is required in queue mode")?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async {
                let queue = Arc::new(SqsQueue::connect(&url, config.request_timeout).await);
                QueueConsumer::new(queue, pipeline, ConsumerParams::from_config(&config))
                    .run()
                    .await
            })?;
        }
    }

    Ok(())
}
