use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use spicedb_sync::{sink, Config, Error, Replicator, Result};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "spicedb-sync")]
#[command(about = "Syncs PostgreSQL rows into SpiceDB relationships", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Log relationship updates without writing them")]
    dry_run: bool,

    #[arg(long, help = "Run the initial table sweep and exit")]
    backfill_only: bool,

    #[arg(
        long,
        help = "Print a mapping derived from the database's foreign keys and exit"
    )]
    print_mapping: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("starting spicedb-sync v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            eprintln!("\nRequired environment variables:");
            eprintln!("  PG_DATABASE      - PostgreSQL database name");
            eprintln!("  PG_USERNAME      - PostgreSQL username");
            eprintln!("  PG_PASSWORD      - PostgreSQL password");
            eprintln!("  MAPPING_FILE     - path to the table mapping JSON");
            std::process::exit(1);
        }
    };

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        mapping_file = %config.sync.mapping_file.display(),
        batch_size = config.sync.batch_size,
        metrics_addr = %config.sync.metrics_addr,
        dry_run = args.dry_run,
        "configuration summary"
    );

    if !args.print_mapping {
        init_metrics(config.sync.metrics_addr)?;
    }

    // the SpiceDB client lives outside this crate; the binary only carries
    // the dry-run sink
    if !args.dry_run && !args.print_mapping {
        return Err(Error::Config(
            "no relationship sink is built in: run with --dry-run, or embed \
             spicedb_sync as a library and provide a RelationshipSink"
                .to_string(),
        ));
    }

    let batch_size = config.sync.batch_size;
    let replicator = Replicator::new(config, sink::batching(sink::dry_run(), batch_size));

    if args.print_mapping {
        let mapping = replicator.provisional_mapping().await?;
        println!("{}", serde_json::to_string_pretty(&mapping)?);
        return Ok(());
    }

    if args.backfill_only {
        return replicator.backfill().await;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    match replicator.run(cancel).await {
        Ok(()) => {
            info!("sync stopped");
            Ok(())
        }
        Err(e) => {
            error!("sync failed: {e}");
            Err(e)
        }
    }
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::Config(format!("failed to serve metrics on {addr}: {e}")))?;
    info!(metrics_addr = %addr, "serving prometheus metrics");
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("spicedb_sync=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("spicedb_sync=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
