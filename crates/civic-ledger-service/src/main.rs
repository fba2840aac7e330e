use civic_ledger_core::{ConversionEscrow, LedgerConfig, LedgerStorageConfig, SpendCapPolicy};
use civic_ledger_service::{build_router, spawn_reconciliation, ServiceConfig, ServiceState};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LedgerStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SpendCapMode {
    RequireAllocation,
    FlatCap,
    AllocationOrFlat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EscrowMode {
    Reserve,
    RecheckOnly,
}

#[derive(Debug, Parser)]
#[command(name = "civicd", version, about = "Civic token ledger REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8095
    #[arg(long, default_value = "127.0.0.1:8095", env = "CIVIC_LISTEN")]
    listen: SocketAddr,
    /// Ledger persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = LedgerStorageMode::Auto, env = "CIVIC_LEDGER_STORAGE")]
    ledger_storage: LedgerStorageMode,
    /// PostgreSQL url for ledger persistence.
    #[arg(long, env = "CIVIC_LEDGER_DATABASE_URL")]
    ledger_database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "CIVIC_LEDGER_PG_MAX_CONNECTIONS")]
    ledger_pg_max_connections: u32,
    /// How per-citizen and per-project spend caps are resolved. Has no default.
    #[arg(long, value_enum, env = "CIVIC_SPEND_CAP_POLICY")]
    spend_cap_policy: SpendCapMode,
    /// Per-citizen cap for the flat policies.
    #[arg(long, default_value_t = 5, env = "CIVIC_FLAT_CITIZEN_CAP")]
    flat_citizen_cap: u64,
    /// Payment minor units per claimed token.
    #[arg(long, default_value_t = 100, env = "CIVIC_CLAIM_TOKEN_RATE")]
    claim_token_rate: u64,
    /// Fiat minor units paid out per converted token.
    #[arg(long, default_value_t = 100, env = "CIVIC_FIAT_MINOR_PER_TOKEN")]
    fiat_minor_per_token: u64,
    /// UTC offset in seconds that defines the issuance day.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true, env = "CIVIC_ISSUANCE_UTC_OFFSET_SECONDS")]
    issuance_utc_offset_seconds: i32,
    #[arg(long, value_enum, default_value_t = EscrowMode::Reserve, env = "CIVIC_CONVERSION_ESCROW")]
    conversion_escrow: EscrowMode,
    /// Hours an idempotency key stays replayable; 0 keeps keys forever.
    #[arg(long, default_value_t = 720, env = "CIVIC_IDEMPOTENCY_RETENTION_HOURS")]
    idempotency_retention_hours: u32,
    /// Seconds between reconciliation and pruning runs; 0 disables the job.
    #[arg(long, default_value_t = 300, env = "CIVIC_RECONCILE_INTERVAL_SECONDS")]
    reconcile_interval_seconds: u64,
}

fn resolve_ledger_storage(cli: &Cli) -> anyhow::Result<LedgerStorageConfig> {
    let resolved_url = cli
        .ledger_database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.ledger_storage {
        LedgerStorageMode::Memory => LedgerStorageConfig::Memory,
        LedgerStorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!(
                    "ledger_storage=postgres requires --ledger-database-url or DATABASE_URL"
                )
            })?;
            LedgerStorageConfig::postgres(database_url, cli.ledger_pg_max_connections)
        }
        LedgerStorageMode::Auto => match resolved_url {
            Some(database_url) => {
                LedgerStorageConfig::postgres(database_url, cli.ledger_pg_max_connections)
            }
            None => LedgerStorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn ledger_config(cli: &Cli) -> anyhow::Result<LedgerConfig> {
    let policy = match cli.spend_cap_policy {
        SpendCapMode::RequireAllocation => SpendCapPolicy::RequireAllocation,
        SpendCapMode::FlatCap => SpendCapPolicy::FlatCap {
            per_citizen: cli.flat_citizen_cap,
        },
        SpendCapMode::AllocationOrFlat => SpendCapPolicy::AllocationOrFlat {
            fallback_per_citizen: cli.flat_citizen_cap,
        },
    };

    let mut config = LedgerConfig::new(policy);
    config.claim_token_rate = cli.claim_token_rate;
    config.fiat_minor_per_token = cli.fiat_minor_per_token;
    config.issuance_utc_offset_seconds = cli.issuance_utc_offset_seconds;
    config.conversion_escrow = match cli.conversion_escrow {
        EscrowMode::Reserve => ConversionEscrow::Reserve,
        EscrowMode::RecheckOnly => ConversionEscrow::RecheckOnly,
    };
    config.idempotency_retention = match cli.idempotency_retention_hours {
        0 => None,
        hours => Some(chrono::Duration::hours(i64::from(hours))),
    };
    config.ledger_storage = resolve_ledger_storage(cli)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "civic_ledger_service=info,civic_ledger_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        ledger: ledger_config(&cli)?,
    };
    let state = ServiceState::bootstrap(config).await?;

    if cli.reconcile_interval_seconds > 0 {
        spawn_reconciliation(
            state.ledger.clone(),
            Duration::from_secs(cli.reconcile_interval_seconds),
        );
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("civic-ledger-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
