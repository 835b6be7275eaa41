use clap::Parser;
use miette::{IntoDiagnostic, Result};
use order_saga::application::runtime::{SagaPorts, SagaRuntime};
use order_saga::config::{RetryPolicy, SagaConfig};
use order_saga::domain::payment::PaymentMethod;
use order_saga::domain::ports::ProcessingPolicyRef;
use order_saga::infrastructure::processing_policy::RandomProcessingPolicy;
use order_saga::interfaces::csv::order_reader::OrderReader;
use order_saga::interfaces::csv::payment_writer::PaymentWriter;
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Runs the order/payment saga over a CSV of orders and prints the payments.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input orders CSV file (`customer, amount`)
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "SAGA_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Seed for the simulated payment gateway, for reproducible runs
    #[arg(long, env = "SAGA_SEED")]
    seed: Option<u64>,

    /// Probability that a payment is approved
    #[arg(long, env = "SAGA_SUCCESS_RATE", default_value_t = 0.8)]
    success_rate: f64,

    #[arg(long, env = "SAGA_MIN_LATENCY_MS", default_value_t = 1000)]
    min_latency_ms: u64,

    #[arg(long, env = "SAGA_MAX_LATENCY_MS", default_value_t = 3000)]
    max_latency_ms: u64,

    /// Upper bound on a single processing attempt
    #[arg(long, env = "SAGA_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Deliveries handled concurrently per consumer
    #[arg(long, env = "SAGA_WORKERS", default_value_t = 8)]
    workers: usize,

    /// Method assigned to every payment
    #[arg(long, env = "SAGA_METHOD", default_value = "CREDIT_CARD")]
    method: PaymentMethod,

    /// Handler attempts before an event is dead-lettered
    #[arg(long, env = "SAGA_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Leave orders untouched by payment outcomes
    #[arg(long, env = "SAGA_NO_CLOSE_LOOP")]
    no_close_loop: bool,

    /// How long to wait for every order to settle before printing
    #[arg(long, env = "SAGA_SETTLE_TIMEOUT_MS", default_value_t = 60_000)]
    settle_timeout_ms: u64,
}

impl Cli {
    fn saga_config(&self) -> SagaConfig {
        let defaults = SagaConfig::default();
        SagaConfig {
            default_method: self.method,
            success_rate: self.success_rate,
            min_latency: Duration::from_millis(self.min_latency_ms),
            max_latency: Duration::from_millis(self.max_latency_ms),
            processing_timeout: Duration::from_millis(self.timeout_ms),
            worker_pool_size: self.workers,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..defaults.retry
            },
            close_loop: !self.no_close_loop,
            ..defaults
        }
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_ports(db_path: Option<&Path>, policy: ProcessingPolicyRef) -> Result<SagaPorts> {
    use order_saga::infrastructure::rocksdb::RocksDBStore;

    let Some(db_path) = db_path else {
        return Ok(SagaPorts::in_memory(policy));
    };
    let store = Arc::new(RocksDBStore::open(db_path).into_diagnostic()?);
    Ok(SagaPorts {
        orders: store.clone(),
        payments: store.clone(),
        guard: store,
        ..SagaPorts::in_memory(policy)
    })
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_ports(db_path: Option<&Path>, policy: ProcessingPolicyRef) -> Result<SagaPorts> {
    if db_path.is_some() {
        warn!(
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(SagaPorts::in_memory(policy))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();
    let config = cli.saga_config();

    let policy: ProcessingPolicyRef =
        Arc::new(RandomProcessingPolicy::from_config(&config, cli.seed));
    let ports = open_ports(cli.db_path.as_deref(), policy)?;
    let runtime = SagaRuntime::start(ports, &config).await.into_diagnostic()?;

    let file = File::open(&cli.input).into_diagnostic()?;
    let mut created = Vec::new();
    for (index, request) in OrderReader::new(file).orders().enumerate() {
        let row = index + 1;
        match request {
            Ok(new_order) => match runtime.orders().create(new_order).await {
                Ok(order) => created.push(order.id),
                Err(e) => error!(row, error = %e, "Error creating order"),
            },
            Err(e) => error!(row, error = %e, "Error reading order"),
        }
    }

    let unsettled = runtime
        .wait_for_settlement(&created, Duration::from_millis(cli.settle_timeout_ms))
        .await
        .into_diagnostic()?;
    if !unsettled.is_empty() {
        warn!(count = unsettled.len(), "Some orders did not settle in time");
    }

    let mut payments = Vec::new();
    for order_id in &created {
        payments.extend(
            runtime
                .payments()
                .list_by_order(*order_id)
                .await
                .into_diagnostic()?,
        );
    }
    runtime.shutdown().await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = PaymentWriter::new(stdout.lock());
    writer.write_payments(payments).into_diagnostic()?;

    Ok(())
}
