use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use enrichflow::{
    build_provider, Catalog, CatalogProgress, EnrichmentPipeline, InMemoryStore, LineItem,
    PipelineConfig, ProviderCredentials, ProviderKind, ProviderOptions, RawFields,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde_json::json;
use tokio::time::sleep;

const DEFAULT_ITEM_COUNT: usize = 400;
const DEFAULT_BATCH_SIZE: usize = 25;
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_PROVIDER: &str = "amazon";
const DEFAULT_LOG_DIRECTIVE: &str = "warn";
const DEMO_API_KEY: &str = "demo-key";
const DEMO_API_SECRET: &str = "demo-secret";

const PRODUCT_NAMES: [&str; 8] = [
    "USB-C Hub",
    "Wireless Mouse",
    "Mechanical Keyboard",
    "Laptop Stand",
    "Webcam Cover",
    "Desk Mat",
    "Cable Organizer",
    "Monitor Light Bar",
];

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    let args = ExampleArgs::from_env()?;
    let bar = build_progress_bar(args.item_count);
    bar.println(format!(
        "Enriching {} items through the {} provider with {} workers (batches of {})",
        args.item_count, args.provider, args.worker_count, args.batch_size
    ));

    let config = args.to_pipeline_config()?;
    let provider = build_provider(args.provider, &args.credentials(), ProviderOptions::default())?;
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline = EnrichmentPipeline::new(config, provider, store.clone());

    pipeline.start().await?;
    let catalog = demo_catalog("demo-catalog", args.item_count);
    let receipt = pipeline.submit_catalog(&catalog).await?;
    bar.println(format!(
        "Submitted catalog {} as {} batches",
        receipt.catalog_id, receipt.total_batches
    ));

    let started = Instant::now();
    let progress = drive_progress_bar(&pipeline, &bar, &receipt.catalog_id).await?;
    bar.finish_with_message(progress.status.to_string());

    pipeline.stop().await?;
    print_summary(&pipeline, &bar, &progress, started.elapsed()).await;

    Ok(())
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    enrichflow::init_tracing();
}

fn build_progress_bar(item_count: usize) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(
        Some(item_count as u64),
        ProgressDrawTarget::stdout_with_hz(12),
    );
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} items ({per_sec}) {msg}",
    )
    .expect("valid progress bar template")
    .progress_chars("=>-");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Synthetic catalog with name and sku fields, the shape a CSV importer
/// would hand to the splitter.
fn demo_catalog(catalog_id: &str, item_count: usize) -> Catalog {
    let items = (0..item_count)
        .map(|idx| {
            let name = PRODUCT_NAMES[idx % PRODUCT_NAMES.len()];
            let mut fields = RawFields::new();
            fields.insert("name".to_string(), json!(format!("{name} v{idx}")));
            fields.insert("sku".to_string(), json!(format!("DEMO-{idx:05}")));
            LineItem::new(format!("item-{idx:05}"), fields)
        })
        .collect();
    Catalog::new(catalog_id, "demo-user", items)
}

async fn drive_progress_bar(
    pipeline: &EnrichmentPipeline,
    bar: &ProgressBar,
    catalog_id: &str,
) -> Result<CatalogProgress> {
    loop {
        let progress = pipeline.progress(catalog_id).await?;
        bar.set_position((progress.items_succeeded + progress.items_failed) as u64);
        bar.set_message(format!(
            "{}/{} batches",
            progress.batches_reported + progress.batches_dead_lettered,
            progress.total_batches
        ));

        if progress.status.is_terminal() {
            return Ok(progress);
        }
        if let Some(stall) = pipeline.current_stall() {
            bar.println(format!("warning: {stall}"));
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn print_summary(
    pipeline: &EnrichmentPipeline,
    bar: &ProgressBar,
    progress: &CatalogProgress,
    elapsed: Duration,
) {
    let seconds = elapsed.as_secs_f64();
    let rate = if seconds > 0.0 {
        progress.items_succeeded as f64 / seconds
    } else {
        0.0
    };
    let telemetry = pipeline.telemetry().snapshot();

    bar.println(format!(
        "Catalog {} finished as {}: {} enriched, {} failed in {:.2}s [{:.1} items/s]",
        progress.catalog_id,
        progress.status,
        progress.items_succeeded,
        progress.items_failed,
        seconds,
        rate
    ));
    bar.println(format!(
        "Batches: {} completed, {} requeued, {} dead-lettered; provider retries: {}",
        telemetry.batches_completed,
        telemetry.batches_requeued,
        telemetry.batches_dead_lettered,
        telemetry.provider_retries
    ));

    let parked = pipeline.dead_letters().await;
    for entry in parked {
        bar.println(format!(
            "dead-lettered: {} after {} attempts ({})",
            entry.payload().batch_id,
            entry.attempts(),
            entry.reason()
        ));
    }
}

struct ExampleArgs {
    item_count: usize,
    batch_size: usize,
    worker_count: usize,
    provider: ProviderKind,
}

impl ExampleArgs {
    fn from_env() -> Result<Self> {
        let item_count =
            parse_env_with_default::<usize>("ENRICHFLOW_ITEM_COUNT", DEFAULT_ITEM_COUNT)?;
        let batch_size =
            parse_env_with_default::<usize>("ENRICHFLOW_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let worker_count =
            parse_env_with_default::<usize>("ENRICHFLOW_WORKER_COUNT", DEFAULT_WORKER_COUNT)?;
        let provider = match read_env_or_default("ENRICHFLOW_PROVIDER", DEFAULT_PROVIDER).as_str() {
            "amazon" => ProviderKind::Amazon,
            "keepa" => ProviderKind::Keepa,
            other => bail!("ENRICHFLOW_PROVIDER must be 'amazon' or 'keepa', got '{other}'"),
        };

        ensure!(item_count > 0, "ENRICHFLOW_ITEM_COUNT must be greater than 0");
        ensure!(batch_size > 0, "ENRICHFLOW_BATCH_SIZE must be greater than 0");
        ensure!(
            worker_count > 0,
            "ENRICHFLOW_WORKER_COUNT must be greater than 0"
        );

        Ok(Self {
            item_count,
            batch_size,
            worker_count,
            provider,
        })
    }

    /// The amazon adapter synthesizes data locally, so placeholder
    /// credentials keep the demo runnable out of the box. Keepa performs
    /// real HTTP calls and needs `KEEPA_API_KEY`.
    fn credentials(&self) -> ProviderCredentials {
        match self.provider {
            ProviderKind::Amazon => ProviderCredentials::amazon(
                read_env_or_default("AMAZON_API_KEY", DEMO_API_KEY),
                read_env_or_default("AMAZON_API_SECRET", DEMO_API_SECRET),
            ),
            ProviderKind::Keepa => ProviderCredentials::from_env(),
        }
    }

    fn to_pipeline_config(&self) -> Result<PipelineConfig> {
        PipelineConfig::builder()
            .provider(self.provider)
            .batch_size(self.batch_size)
            .worker_count(self.worker_count)
            .poll_wait(Duration::from_millis(200))
            .build()
    }
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
