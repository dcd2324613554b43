//! PostgreSQL order repository.
//!
//! Uses deadpool-postgres for pooling. `create_order` runs the existence
//! check, the guarded decrement and the insert inside one transaction.

use super::traits::OrderRepository;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use rushline_core::{
    Order, OrderId, PersistOutcome, RushlineError, RushlineResult, StoreError, Timestamp, UserId,
    VoucherId, VoucherStock,
};
use std::time::Duration;
use tokio_postgres::{NoTls, Row};

const BACKEND: &str = "postgres";

/// Schema for the voucher and order tables.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS seckill_vouchers (
    voucher_id  BIGINT PRIMARY KEY,
    stock       BIGINT NOT NULL CHECK (stock >= 0),
    begin_at    TIMESTAMPTZ NOT NULL,
    end_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS voucher_orders (
    id          BIGINT PRIMARY KEY,
    user_id     BIGINT NOT NULL,
    voucher_id  BIGINT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    UNIQUE (user_id, voucher_id)
);
"#;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait for a pooled connection
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "rushline".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from `RUSHLINE_DB_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("RUSHLINE_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("RUSHLINE_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("RUSHLINE_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("RUSHLINE_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("RUSHLINE_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("RUSHLINE_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: Duration::from_secs(
                std::env::var("RUSHLINE_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.timeout.as_secs()),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> RushlineResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(self.max_size);
        pool_config.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::unavailable(BACKEND, format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

fn query_err(err: tokio_postgres::Error) -> RushlineError {
    if err.is_closed() {
        StoreError::unavailable(BACKEND, err).into()
    } else {
        StoreError::Query {
            reason: err.to_string(),
        }
        .into()
    }
}

fn to_db_id(id: u64) -> i64 {
    id as i64
}

fn row_to_voucher(row: &Row) -> RushlineResult<VoucherStock> {
    let voucher_id: i64 = row.try_get("voucher_id").map_err(query_err)?;
    let stock: i64 = row.try_get("stock").map_err(query_err)?;
    let begin_at: Timestamp = row.try_get("begin_at").map_err(query_err)?;
    let end_at: Timestamp = row.try_get("end_at").map_err(query_err)?;
    Ok(VoucherStock::new(
        VoucherId::new(voucher_id as u64),
        stock,
        begin_at,
        end_at,
    ))
}

fn row_to_order(row: &Row) -> RushlineResult<Order> {
    let id: i64 = row.try_get("id").map_err(query_err)?;
    let user_id: i64 = row.try_get("user_id").map_err(query_err)?;
    let voucher_id: i64 = row.try_get("voucher_id").map_err(query_err)?;
    let created_at: Timestamp = row.try_get("created_at").map_err(query_err)?;
    Ok(Order {
        order_id: OrderId::new(id as u64),
        user_id: UserId::new(user_id as u64),
        voucher_id: VoucherId::new(voucher_id as u64),
        created_at,
    })
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// [`OrderRepository`] over PostgreSQL.
#[derive(Clone)]
pub struct PgOrderRepository {
    pool: Pool,
}

impl PgOrderRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> RushlineResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Create the tables if they do not exist.
    pub async fn ensure_schema(&self) -> RushlineResult<()> {
        let client = self.get_conn().await?;
        client.batch_execute(SCHEMA_SQL).await.map_err(query_err)
    }

    async fn get_conn(&self) -> RushlineResult<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, e).into())
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn voucher(&self, voucher_id: VoucherId) -> RushlineResult<Option<VoucherStock>> {
        let client = self.get_conn().await?;
        let row = client
            .query_opt(
                "SELECT voucher_id, stock, begin_at, end_at FROM seckill_vouchers WHERE voucher_id = $1",
                &[&to_db_id(voucher_id.get())],
            )
            .await
            .map_err(query_err)?;
        row.as_ref().map(row_to_voucher).transpose()
    }

    async fn upsert_voucher(&self, voucher: &VoucherStock) -> RushlineResult<()> {
        let client = self.get_conn().await?;
        client
            .execute(
                "INSERT INTO seckill_vouchers (voucher_id, stock, begin_at, end_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (voucher_id) DO UPDATE \
                 SET stock = EXCLUDED.stock, begin_at = EXCLUDED.begin_at, end_at = EXCLUDED.end_at",
                &[
                    &to_db_id(voucher.voucher_id.get()),
                    &voucher.stock,
                    &voucher.begin_at,
                    &voucher.end_at,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn order_exists(&self, user_id: UserId, voucher_id: VoucherId) -> RushlineResult<bool> {
        Ok(self.find_order(user_id, voucher_id).await?.is_some())
    }

    async fn find_order(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> RushlineResult<Option<Order>> {
        let client = self.get_conn().await?;
        let row = client
            .query_opt(
                "SELECT id, user_id, voucher_id, created_at FROM voucher_orders \
                 WHERE user_id = $1 AND voucher_id = $2",
                &[&to_db_id(user_id.get()), &to_db_id(voucher_id.get())],
            )
            .await
            .map_err(query_err)?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn count_orders(&self, voucher_id: VoucherId) -> RushlineResult<u64> {
        let client = self.get_conn().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM voucher_orders WHERE voucher_id = $1",
                &[&to_db_id(voucher_id.get())],
            )
            .await
            .map_err(query_err)?;
        let n: i64 = row.try_get("n").map_err(query_err)?;
        Ok(n as u64)
    }

    async fn buyers(&self, voucher_id: VoucherId) -> RushlineResult<Vec<UserId>> {
        let client = self.get_conn().await?;
        let rows = client
            .query(
                "SELECT user_id FROM voucher_orders WHERE voucher_id = $1",
                &[&to_db_id(voucher_id.get())],
            )
            .await
            .map_err(query_err)?;
        rows.iter()
            .map(|row| -> RushlineResult<UserId> {
                let user_id: i64 = row.try_get("user_id").map_err(query_err)?;
                Ok(UserId::new(user_id as u64))
            })
            .collect()
    }

    async fn create_order(&self, order: &Order) -> RushlineResult<PersistOutcome> {
        let user_id = to_db_id(order.user_id.get());
        let voucher_id = to_db_id(order.voucher_id.get());

        let mut client = self.get_conn().await?;
        let tx = client.transaction().await.map_err(query_err)?;

        let existing = tx
            .query_opt(
                "SELECT 1 FROM voucher_orders WHERE user_id = $1 AND voucher_id = $2",
                &[&user_id, &voucher_id],
            )
            .await
            .map_err(query_err)?;
        if existing.is_some() {
            tx.rollback().await.map_err(query_err)?;
            return Ok(PersistOutcome::AlreadyExists);
        }

        let decremented = tx
            .execute(
                "UPDATE seckill_vouchers SET stock = stock - 1 WHERE voucher_id = $1 AND stock > 0",
                &[&voucher_id],
            )
            .await
            .map_err(query_err)?;
        if decremented == 0 {
            tx.rollback().await.map_err(query_err)?;
            return Ok(PersistOutcome::StockExhausted);
        }

        // A concurrent writer can win the unique constraint after our check.
        let inserted = tx
            .execute(
                "INSERT INTO voucher_orders (id, user_id, voucher_id, created_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (user_id, voucher_id) DO NOTHING",
                &[
                    &to_db_id(order.order_id.get()),
                    &user_id,
                    &voucher_id,
                    &order.created_at,
                ],
            )
            .await
            .map_err(query_err)?;
        if inserted == 0 {
            tx.rollback().await.map_err(query_err)?;
            return Ok(PersistOutcome::AlreadyExists);
        }

        tx.commit().await.map_err(query_err)?;
        Ok(PersistOutcome::Persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn db_tests_enabled() -> bool {
        std::env::var("RUSHLINE_DB_TESTS").as_deref() == Ok("1")
    }

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "rushline");
        assert_eq!(config.max_size, 16);
    }

    #[test]
    fn test_schema_declares_uniqueness() {
        assert!(SCHEMA_SQL.contains("UNIQUE (user_id, voucher_id)"));
        assert!(SCHEMA_SQL.contains("CHECK (stock >= 0)"));
    }

    #[tokio::test]
    async fn test_create_order_against_postgres() {
        if !db_tests_enabled() {
            return;
        }
        let repo = PgOrderRepository::from_config(&DbConfig::from_env()).unwrap();
        repo.ensure_schema().await.unwrap();

        let now = Utc::now();
        let voucher_id = VoucherId::new((now.timestamp_micros() % i64::MAX) as u64);
        repo.upsert_voucher(&VoucherStock::new(
            voucher_id,
            1,
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
        ))
        .await
        .unwrap();

        let order = Order {
            order_id: OrderId::new(voucher_id.get()),
            user_id: UserId::new(1),
            voucher_id,
            created_at: now,
        };
        assert_eq!(repo.create_order(&order).await.unwrap(), PersistOutcome::Persisted);
        assert_eq!(
            repo.create_order(&order).await.unwrap(),
            PersistOutcome::AlreadyExists
        );

        let other = Order {
            order_id: OrderId::new(voucher_id.get() + 1),
            user_id: UserId::new(2),
            ..order.clone()
        };
        assert_eq!(
            repo.create_order(&other).await.unwrap(),
            PersistOutcome::StockExhausted
        );
        assert_eq!(repo.count_orders(voucher_id).await.unwrap(), 1);
        assert_eq!(repo.buyers(voucher_id).await.unwrap(), vec![UserId::new(1)]);
        assert_eq!(repo.voucher(voucher_id).await.unwrap().unwrap().stock, 0);
    }
}
