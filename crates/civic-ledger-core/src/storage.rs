use crate::allocation::AllocationLimit;
use crate::conversion::ConversionRequest;
use crate::error::{LedgerError, StorageError};
use crate::ledger::{Direction, EntryStatus, LedgerEntry, TransactionType};
use crate::project::Project;
use crate::requests::{FundRequest, TokenClaim, TokenRequest};
use crate::state::{CommitBatch, IdempotencyRecord, LedgerSnapshot, LedgerState, Record};
use crate::types::Account;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Ledger persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum LedgerStorageConfig {
    /// Keep all records and entries in process memory only.
    #[default]
    Memory,
    /// Persist everything in PostgreSQL and hydrate state on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl LedgerStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Durable store behind the engine.
///
/// `commit` must persist the whole batch or nothing, and must refuse a batch
/// whose record versions or ledger head no longer match with
/// [`StorageError::Conflict`].
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn load(&self) -> Result<LedgerSnapshot, StorageError>;

    async fn commit(&self, batch: &CommitBatch) -> Result<(), StorageError>;

    /// Delete idempotency records written before `cutoff`.
    async fn prune_idempotency(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

pub async fn bootstrap(config: LedgerStorageConfig) -> Result<Arc<dyn LedgerRepository>, LedgerError> {
    match config {
        LedgerStorageConfig::Memory => Ok(Arc::new(MemoryRepository::new())),
        LedgerStorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresRepository::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Process-local repository. Several engines may share one instance, which
/// behaves like several service replicas on one database.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: AsyncMutex<LedgerState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        Ok(Self {
            state: AsyncMutex::new(LedgerState::from_snapshot(snapshot)?),
        })
    }
}

#[async_trait]
impl LedgerRepository for MemoryRepository {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<LedgerSnapshot, StorageError> {
        Ok(self.state.lock().await.to_snapshot())
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.check_batch(batch)?;
        state
            .apply(batch.clone())
            .map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    async fn prune_idempotency(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        Ok(self.state.lock().await.prune_idempotency(cutoff) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

const ENTRY_TABLE: &str = "civic_ledger_entries";
const IDEMPOTENCY_TABLE: &str = "civic_idempotency_keys";

const RECORD_TABLES: [&str; 7] = [
    Account::TABLE,
    Project::TABLE,
    AllocationLimit::TABLE,
    ConversionRequest::TABLE,
    TokenClaim::TABLE,
    TokenRequest::TABLE,
    FundRequest::TABLE,
];

fn backend(context: &str) -> impl Fn(sqlx::Error) -> StorageError + '_ {
    move |e| StorageError::Backend(format!("postgres {context} failed: {e}"))
}

fn to_i64(value: u64, field: &str) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Backend(format!("{field} exceeds postgres BIGINT range")))
}

fn to_u64(value: i64, field: &str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Corrupt(format!("negative {field} in storage")))
}

impl PostgresRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        // One versioned JSONB table per record kind; the engine owns the
        // payload shape and the version sequence.
        for table in RECORD_TABLES {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    version BIGINT NOT NULL,
                    payload JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#
            ))
            .execute(&self.pool)
            .await
            .map_err(backend("schema create"))?;
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {ENTRY_TABLE} (
                ledger_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                transaction_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                from_user TEXT NULL,
                to_user TEXT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                related_project TEXT NULL,
                reference TEXT NULL,
                token_type TEXT NULL,
                category TEXT NULL,
                city TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(backend("schema create"))?;

        for (name, column) in [
            ("idx_civic_ledger_from_user", "from_user"),
            ("idx_civic_ledger_to_user", "to_user"),
            ("idx_civic_ledger_related_project", "related_project"),
            ("idx_civic_ledger_created_at", "created_at"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {name} ON {ENTRY_TABLE} ({column})"
            ))
            .execute(&self.pool)
            .await
            .map_err(backend("index create"))?;
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {IDEMPOTENCY_TABLE} (
                scoped_key TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                response JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(backend("schema create"))?;

        Ok(())
    }

    async fn load_records<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        let rows = sqlx::query(&format!("SELECT payload FROM {} ORDER BY id ASC", R::TABLE))
            .fetch_all(&self.pool)
            .await
            .map_err(backend("load"))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get("payload").map_err(|e| {
                StorageError::Corrupt(format!("postgres decode {} payload failed: {e}", R::TABLE))
            })?;
            let record = serde_json::from_value(payload).map_err(|e| {
                StorageError::Corrupt(format!("{} payload does not parse: {e}", R::TABLE))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    async fn load_entries(&self) -> Result<Vec<LedgerEntry>, StorageError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT
                ledger_index,
                entry_id,
                transaction_type,
                direction,
                from_user,
                to_user,
                amount,
                related_project,
                reference,
                token_type,
                category,
                city,
                status,
                created_at,
                previous_hash,
                entry_hash
            FROM {ENTRY_TABLE}
            ORDER BY ledger_index ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend("load"))?;

        let decode = |field: &str, e: sqlx::Error| {
            StorageError::Corrupt(format!("postgres decode {field} failed: {e}"))
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: i64 = row.try_get("ledger_index").map_err(|e| decode("ledger_index", e))?;
            let amount: i64 = row.try_get("amount").map_err(|e| decode("amount", e))?;
            let transaction_type: String = row
                .try_get("transaction_type")
                .map_err(|e| decode("transaction_type", e))?;
            let direction: String = row.try_get("direction").map_err(|e| decode("direction", e))?;
            let status: String = row.try_get("status").map_err(|e| decode("status", e))?;

            entries.push(LedgerEntry {
                entry_id: row.try_get("entry_id").map_err(|e| decode("entry_id", e))?,
                index: to_u64(index, "ledger index")?,
                transaction_type: TransactionType::parse(&transaction_type).ok_or_else(|| {
                    StorageError::Corrupt(format!("unknown transaction type '{transaction_type}'"))
                })?,
                direction: Direction::parse(&direction).ok_or_else(|| {
                    StorageError::Corrupt(format!("unknown direction '{direction}'"))
                })?,
                from_user: row.try_get("from_user").map_err(|e| decode("from_user", e))?,
                to_user: row.try_get("to_user").map_err(|e| decode("to_user", e))?,
                amount: to_u64(amount, "amount")?,
                related_project: row
                    .try_get("related_project")
                    .map_err(|e| decode("related_project", e))?,
                reference: row.try_get("reference").map_err(|e| decode("reference", e))?,
                token_type: row.try_get("token_type").map_err(|e| decode("token_type", e))?,
                category: row.try_get("category").map_err(|e| decode("category", e))?,
                city: row.try_get("city").map_err(|e| decode("city", e))?,
                status: EntryStatus::parse(&status).ok_or_else(|| {
                    StorageError::Corrupt(format!("unknown entry status '{status}'"))
                })?,
                created_at: row.try_get("created_at").map_err(|e| decode("created_at", e))?,
                previous_hash: row
                    .try_get("previous_hash")
                    .map_err(|e| decode("previous_hash", e))?,
                entry_hash: row.try_get("entry_hash").map_err(|e| decode("entry_hash", e))?,
            });
        }
        Ok(entries)
    }

    async fn load_idempotency(&self) -> Result<Vec<IdempotencyRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT scoped_key, operation, fingerprint, response, recorded_at FROM {IDEMPOTENCY_TABLE}"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend("load"))?;

        rows.into_iter()
            .map(|row| {
                let decode = |e: sqlx::Error| {
                    StorageError::Corrupt(format!("postgres decode idempotency row failed: {e}"))
                };
                Ok(IdempotencyRecord {
                    key: row.try_get("scoped_key").map_err(decode)?,
                    operation: row.try_get("operation").map_err(decode)?,
                    fingerprint: row.try_get("fingerprint").map_err(decode)?,
                    response: row.try_get("response").map_err(decode)?,
                    recorded_at: row.try_get("recorded_at").map_err(decode)?,
                })
            })
            .collect()
    }
}

async fn write_records<R: Record>(
    tx: &mut Transaction<'_, Postgres>,
    records: &[R],
) -> Result<(), StorageError> {
    for record in records {
        let version = to_i64(record.version(), "record version")?;
        let payload = serde_json::to_value(record)
            .map_err(|e| StorageError::Backend(format!("encode {} failed: {e}", R::TABLE)))?;

        let result = if record.version() == 1 {
            sqlx::query(&format!(
                "INSERT INTO {} (id, version, payload) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
                R::TABLE
            ))
            .bind(record.record_id())
            .bind(version)
            .bind(&payload)
            .execute(&mut **tx)
            .await
        } else {
            sqlx::query(&format!(
                "UPDATE {} SET version = $2, payload = $3, updated_at = now() WHERE id = $1 AND version = $4",
                R::TABLE
            ))
            .bind(record.record_id())
            .bind(version)
            .bind(&payload)
            .bind(version - 1)
            .execute(&mut **tx)
            .await
        };
        let result = result.map_err(backend("write"))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "{} '{}' changed since version {}",
                R::TABLE,
                record.record_id(),
                record.version() - 1
            )));
        }
    }
    Ok(())
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &LedgerEntry,
) -> Result<(), StorageError> {
    let result = sqlx::query(&format!(
        r#"
        INSERT INTO {ENTRY_TABLE} (
            ledger_index,
            entry_id,
            transaction_type,
            direction,
            from_user,
            to_user,
            amount,
            related_project,
            reference,
            token_type,
            category,
            city,
            status,
            created_at,
            previous_hash,
            entry_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#
    ))
    .bind(to_i64(entry.index, "ledger index")?)
    .bind(&entry.entry_id)
    .bind(entry.transaction_type.name())
    .bind(entry.direction.name())
    .bind(&entry.from_user)
    .bind(&entry.to_user)
    .bind(to_i64(entry.amount, "amount")?)
    .bind(&entry.related_project)
    .bind(&entry.reference)
    .bind(&entry.token_type)
    .bind(&entry.category)
    .bind(&entry.city)
    .bind(entry.status.name())
    .bind(entry.created_at)
    .bind(&entry.previous_hash)
    .bind(&entry.entry_hash)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StorageError::Conflict(
            format!("ledger index {} already written", entry.index),
        )),
        Err(e) => Err(backend("entry insert")(e)),
    }
}

async fn verify_head(
    tx: &mut Transaction<'_, Postgres>,
    first: &LedgerEntry,
) -> Result<(), StorageError> {
    let head = sqlx::query(&format!(
        "SELECT entry_hash FROM {ENTRY_TABLE} ORDER BY ledger_index DESC LIMIT 1"
    ))
    .fetch_optional(&mut **tx)
    .await
    .map_err(backend("head read"))?;

    let head_hash: Option<String> = match head {
        Some(row) => Some(
            row.try_get("entry_hash")
                .map_err(|e| StorageError::Corrupt(format!("postgres decode entry_hash failed: {e}")))?,
        ),
        None => None,
    };
    if head_hash != first.previous_hash {
        return Err(StorageError::Conflict(
            "ledger head moved since the batch was staged".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl LedgerRepository for PostgresRepository {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self) -> Result<LedgerSnapshot, StorageError> {
        Ok(LedgerSnapshot {
            accounts: self.load_records().await?,
            projects: self.load_records().await?,
            allocations: self.load_records().await?,
            conversions: self.load_records().await?,
            claims: self.load_records().await?,
            token_requests: self.load_records().await?,
            fund_requests: self.load_records().await?,
            entries: self.load_entries().await?,
            idempotency: self.load_idempotency().await?,
        })
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend("begin"))?;

        write_records(&mut tx, &batch.accounts).await?;
        write_records(&mut tx, &batch.projects).await?;
        write_records(&mut tx, &batch.allocations).await?;
        write_records(&mut tx, &batch.conversions).await?;
        write_records(&mut tx, &batch.claims).await?;
        write_records(&mut tx, &batch.token_requests).await?;
        write_records(&mut tx, &batch.fund_requests).await?;

        if let Some(first) = batch.entries.first() {
            verify_head(&mut tx, first).await?;
        }
        for entry in &batch.entries {
            insert_entry(&mut tx, entry).await?;
        }

        if let Some(record) = &batch.idempotency {
            let result = sqlx::query(&format!(
                r#"
                INSERT INTO {IDEMPOTENCY_TABLE} (scoped_key, operation, fingerprint, response, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (scoped_key) DO NOTHING
                "#
            ))
            .bind(&record.key)
            .bind(&record.operation)
            .bind(&record.fingerprint)
            .bind(&record.response)
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(backend("idempotency insert"))?;
            if result.rows_affected() == 0 {
                return Err(StorageError::Conflict(format!(
                    "idempotency key '{}' recorded concurrently",
                    record.key
                )));
            }
        }

        // Dropping `tx` on any early return rolls the batch back.
        tx.commit().await.map_err(backend("commit"))
    }

    async fn prune_idempotency(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {IDEMPOTENCY_TABLE} WHERE recorded_at < $1"
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(backend("idempotency prune"))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::UnitOfWork;
    use crate::types::UserType;

    fn account(id: &str) -> Account {
        let now = Utc::now();
        Account {
            id: id.to_string(),
            user_type: UserType::Citizen,
            city: "lagos".into(),
            is_approved: true,
            token_balance: 0,
            reserved_tokens: 0,
            daily_issuance_limit: None,
            deleted: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn memory_repository_refuses_stale_batches() {
        let repo = MemoryRepository::new();
        let snapshot = LedgerState::from_snapshot(repo.load().await.unwrap()).unwrap();

        let batch = {
            let mut uow = UnitOfWork::new(&snapshot, Utc::now());
            uow.put_account(account("alice"));
            uow.into_parts().0
        };
        repo.commit(&batch).await.unwrap();

        // Same staging base, second writer loses.
        assert!(matches!(
            repo.commit(&batch).await,
            Err(StorageError::Conflict(_))
        ));

        let reloaded = repo.load().await.unwrap();
        assert_eq!(reloaded.accounts.len(), 1);
        assert_eq!(reloaded.accounts[0].version, 1);
    }

    #[tokio::test]
    async fn memory_repository_prunes_only_expired_replays() {
        let now = Utc::now();
        let record = |key: &str, age_days: i64| IdempotencyRecord {
            key: key.to_string(),
            operation: "issue_tokens".into(),
            fingerprint: "f".into(),
            response: serde_json::Value::Null,
            recorded_at: now - chrono::Duration::days(age_days),
        };
        let repo = MemoryRepository::from_snapshot(LedgerSnapshot {
            idempotency: vec![record("gov:old", 40), record("gov:fresh", 2)],
            ..LedgerSnapshot::default()
        })
        .unwrap();

        let pruned = repo
            .prune_idempotency(now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        let kept = repo.load().await.unwrap().idempotency;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].key, "gov:fresh");
    }

    #[tokio::test]
    async fn bootstrap_memory_backend() {
        let repo = bootstrap(LedgerStorageConfig::default()).await.unwrap();
        assert_eq!(repo.backend_label(), "memory");
        assert!(repo.load().await.unwrap().entries.is_empty());
    }

    #[test]
    fn storage_labels() {
        assert_eq!(LedgerStorageConfig::memory().label(), "memory");
        assert_eq!(LedgerStorageConfig::postgres("postgres://x", 4).label(), "postgres");
    }
}
