//! Enqueues a batch of jobs, some of which fail, and drains the queue.
//!
//! Runs against in-memory storage unless a database URL is given.

use anyhow::Result;
use clap::Parser;
use job_queue::{
    BackgroundJob, EventKind, JobData, JobRegistry, JobStorage, JobStorageExt, MemoryStorage,
    PgStorage, Runner, setup_database,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Drains a queue of simulated thumbnail jobs
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of jobs to enqueue
    #[arg(short, long, default_value_t = 50)]
    jobs: usize,

    /// Number of processors polling the queue
    #[arg(short, long, default_value_t = 4)]
    processors: usize,

    /// Percentage of jobs that fail
    #[arg(long, default_value_t = 10)]
    failure_rate: u32,

    /// Use PostgreSQL instead of in-memory storage
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Thumbnail {
    image: String,
    width: u32,
    fail: bool,
}

impl JobData for Thumbnail {
    const DATA_TYPE: &'static str = "thumbnail";
}

#[derive(Clone, Default)]
struct Stats {
    rendered: Arc<AtomicUsize>,
}

struct RenderThumbnail {
    stats: Stats,
}

impl BackgroundJob for RenderThumbnail {
    const JOB_TYPE: &'static str = "render_thumbnail";
    type Data = Thumbnail;
    type Context = Stats;

    fn build(ctx: &Stats) -> Self {
        Self { stats: ctx.clone() }
    }

    async fn run(&self, data: Thumbnail) -> Result<()> {
        let millis = rand::thread_rng().gen_range(5..50);
        sleep(Duration::from_millis(millis)).await;

        if data.fail {
            anyhow::bail!("could not decode {}", data.image);
        }

        info!("Rendered {} at {}px", data.image, data.width);
        self.stats.rendered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn create_storage(args: &Args, registry: &JobRegistry<Stats>) -> Result<Arc<dyn JobStorage>> {
    let types = registry.types().clone();
    match &args.database_url {
        Some(url) => {
            info!("Connecting to database…");
            let pool = PgPool::connect(url).await?;
            setup_database(&pool).await?;
            Ok(Arc::new(PgStorage::new(pool, types)))
        }
        None => Ok(Arc::new(MemoryStorage::new(types))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,basic=info,job_queue=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();

    let args = Args::parse();
    let registry = JobRegistry::new().register::<RenderThumbnail>();
    let storage = create_storage(&args, &registry).await?;

    let failed = Arc::new(AtomicUsize::new(0));
    storage.events().subscribe_to(EventKind::Failed, {
        let failed = failed.clone();
        move |event| {
            let failed = failed.clone();
            async move {
                warn!(job.id = event.job().id(), "Job failed");
                failed.fetch_add(1, Ordering::Relaxed);
                anyhow::Ok(())
            }
        }
    });

    info!("Enqueuing {} jobs…", args.jobs);
    for i in 0..args.jobs {
        let data = Thumbnail {
            image: format!("image-{i}.png"),
            width: rand::thread_rng().gen_range(64..512),
            fail: rand::thread_rng().gen_range(0..100) < args.failure_rate,
        };
        storage.enqueue_job::<RenderThumbnail>(data).await?;
    }

    let stats = Stats::default();
    let runner = Runner::new(storage.clone(), registry, stats.clone())
        .num_processors(args.processors)
        .poll_interval(Duration::from_millis(100))
        .jitter(Duration::from_millis(50))
        .shutdown_when_queue_empty();

    let start = Instant::now();
    let handle = runner.start().await?;
    handle.wait_for_shutdown().await;

    let elapsed = start.elapsed();
    info!(
        "Done in {:.2}s: {} rendered, {} failed, {} left in storage",
        elapsed.as_secs_f64(),
        stats.rendered.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        storage.list_all().await?.len(),
    );

    Ok(())
}
