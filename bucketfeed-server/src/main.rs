use bucketfeed::persistence::{
    Bucket, FlushedSerials, PartitionId, PersistenceProvider, Watermarks,
};
use bucketfeed::{Command, DocumentDbProvider, MetricsRegistry, PersistenceShards, ReplyPayload, StorageConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "bucketfeed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Action>,

    #[arg(long, env = "BUCKETFEED_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Replay over the watermarks the last `flush` recorded per partition
    #[arg(long, global = true, conflicts_with_all = ["flushed_meta", "flushed_doc", "flushed_index", "flushed_attribute"])]
    recorded_watermarks: bool,

    /// Flushed serial of the metadata store in every partition
    #[arg(long, global = true)]
    flushed_meta: Option<u64>,

    /// Flushed serial of the document store in every partition
    #[arg(long, global = true)]
    flushed_doc: Option<u64>,

    /// Flushed serial of the indexed-field store in every partition
    #[arg(long, global = true)]
    flushed_index: Option<u64>,

    /// Flushed serial of the attribute store in every partition
    #[arg(long, global = true)]
    flushed_attribute: Option<u64>,
}

impl Cli {
    fn watermarks(&self) -> Watermarks {
        if self.recorded_watermarks {
            return Watermarks::Recorded;
        }
        let given = [
            self.flushed_meta,
            self.flushed_doc,
            self.flushed_index,
            self.flushed_attribute,
        ];
        if given.iter().all(Option::is_none) {
            return Watermarks::Zero;
        }
        Watermarks::Fixed(FlushedSerials {
            meta: self.flushed_meta.unwrap_or(0),
            document: self.flushed_doc.unwrap_or(0),
            index: self.flushed_index.unwrap_or(0),
            attribute: self.flushed_attribute.unwrap_or(0),
        })
    }
}

#[derive(Subcommand)]
enum Action {
    /// Recover every partition and print its buckets as JSON (default)
    Buckets,
    /// Compact the lid space of every partition
    Compact,
    /// Recover, flush every store, record and print the flushed serials
    Flush,
    /// Recover and print per-partition serials and store writes of the replay
    Replay,
    /// Recover and print Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&cli.data_dir)?;
    let config = StorageConfig::load_or_default(&cli.data_dir);
    config.validate()?;
    let metrics = MetricsRegistry::new()?;
    let watermarks = cli.watermarks();
    let provider = Arc::new(
        DocumentDbProvider::open_with(&config, &metrics, &cli.data_dir, watermarks).await?,
    );

    match cli.command.unwrap_or(Action::Buckets) {
        Action::Buckets => {
            let shards = PersistenceShards::start(&config, provider.clone(), &metrics);
            let mut listing = Vec::new();
            for partition in 0..provider.partition_count() {
                let partition = partition as PartitionId;
                let reply = shards.submit(Command::ReadBucketList { partition }).await;
                let ReplyPayload::BucketList(buckets) = reply.payload else {
                    return Err(format!("listing partition {}: {}", partition, reply.message).into());
                };
                for id in buckets {
                    let reply = shards
                        .submit(Command::ReadBucketInfo {
                            bucket: Bucket::new(id, partition),
                        })
                        .await;
                    listing.push(serde_json::json!({
                        "partition": partition,
                        "bucket": id.to_string(),
                        "info": reply.bucket_info(),
                    }));
                }
            }
            shards.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Action::Compact => {
            for partition in 0..provider.partition_count() {
                let db = provider.partition(partition as PartitionId)?;
                let limit = db.compact_lid_space().await?;
                println!("{}: lid limit {}", db.name(), limit);
            }
        }
        Action::Flush => {
            let mut flushed = Vec::new();
            for partition in 0..provider.partition_count() {
                let db = provider.partition(partition as PartitionId)?;
                let serials = db.flush_all().await?;
                flushed.push(serde_json::json!({
                    "partition": partition,
                    "meta": serials.meta,
                    "document": serials.document,
                    "index": serials.index,
                    "attribute": serials.attribute,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&flushed)?);
        }
        Action::Replay => {
            let mut report = Vec::new();
            for partition in 0..provider.partition_count() {
                let db = provider.partition(partition as PartitionId)?;
                report.push(serde_json::json!({
                    "partition": partition,
                    "serial": db.current_serial(),
                    "writes": db.store_writes(),
                    "buckets": db.list_buckets().iter().map(|b| b.to_string()).collect::<Vec<_>>(),
                }));
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Action::Metrics => {
            print!("{}", metrics.gather_text());
        }
    }
    Ok(())
}
