//! PostgreSQL database client implementation.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::domain::{
    AppError, Asset, BlockchainAddress, DatabaseError, DepositRoute, PayIn, PayInIdentity,
    PayInRepository, PayInStatus, SpecificationRepository, TransactionSpecification,
};

const PAY_IN_COLUMNS: &str = r#"
    id, status, in_tx_id, tx_type, tx_sequence, block_height, address, blockchain,
    destination_address, destination_blockchain, amount, asset_id, asset_name, asset_type,
    asset_blockchain, asset_dex_name, asset_chain_id, asset_sellable, btc_amount, usdt_amount,
    purpose, route_id, route_type, aml_check, send_type, prepare_tx_id, out_tx_id,
    return_tx_id, forward_fee_amount, is_confirmed, broadcast_started_at, comment, created_at,
    updated_at
"#;

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL database client with connection pooling
pub struct PostgresClient {
    pool: PgPool,
}

fn corrupt(column: &str, message: String) -> AppError {
    AppError::Database(DatabaseError::Corrupt(format!("{column}: {message}")))
}

fn parse_column<T: FromStr<Err = String>>(column: &str, value: &str) -> Result<T, AppError> {
    value.parse().map_err(|e| corrupt(column, e))
}

fn parse_optional<T: FromStr<Err = String>>(
    column: &str,
    value: Option<String>,
) -> Result<Option<T>, AppError> {
    value.map(|v| parse_column(column, &v)).transpose()
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a specification rule, returning its id
    #[instrument(skip(self, spec), fields(system = %spec.system))]
    pub async fn insert_specification(
        &self,
        spec: &TransactionSpecification,
    ) -> Result<i64, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO transaction_specifications (system, asset, direction, min_fee, min_volume)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&spec.system)
        .bind(&spec.asset)
        .bind(spec.direction.map(|d| d.as_str()))
        .bind(spec.min_fee)
        .bind(spec.min_volume)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row.get("id"))
    }

    fn row_to_asset(row: &sqlx::postgres::PgRow) -> Result<Option<Asset>, AppError> {
        let Some(id) = row.get::<Option<i64>, _>("asset_id") else {
            return Ok(None);
        };
        let name: Option<String> = row.get("asset_name");
        let asset_type: Option<String> = row.get("asset_type");
        let blockchain: Option<String> = row.get("asset_blockchain");

        let (Some(name), Some(asset_type), Some(blockchain)) = (name, asset_type, blockchain)
        else {
            return Err(corrupt("asset", format!("incomplete asset columns for id {id}")));
        };

        Ok(Some(Asset {
            id,
            dex_name: row
                .get::<Option<String>, _>("asset_dex_name")
                .unwrap_or_else(|| name.clone()),
            name,
            blockchain: parse_column("asset_blockchain", &blockchain)?,
            asset_type: parse_column("asset_type", &asset_type)?,
            chain_id: row.get("asset_chain_id"),
            sellable: row.get::<Option<bool>, _>("asset_sellable").unwrap_or(true),
        }))
    }

    /// Parse a database row into a PayIn
    fn row_to_pay_in(row: &sqlx::postgres::PgRow) -> Result<PayIn, AppError> {
        let status: String = row.get("status");
        let blockchain: String = row.get("blockchain");
        let address = BlockchainAddress::new(
            row.get::<String, _>("address"),
            parse_column("blockchain", &blockchain)?,
        );

        let destination_address = match (
            row.get::<Option<String>, _>("destination_address"),
            row.get::<Option<String>, _>("destination_blockchain"),
        ) {
            (Some(dest), Some(chain)) => Some(BlockchainAddress::new(
                dest,
                parse_column("destination_blockchain", &chain)?,
            )),
            _ => None,
        };

        let route = match (
            row.get::<Option<i64>, _>("route_id"),
            row.get::<Option<String>, _>("route_type"),
        ) {
            (Some(id), Some(route_type)) => Some(DepositRoute {
                id,
                route_type: parse_column("route_type", &route_type)?,
                deposit: address.clone(),
            }),
            _ => None,
        };

        Ok(PayIn {
            id: row.get("id"),
            status: parse_column::<PayInStatus>("status", &status)?,
            in_tx_id: row.get("in_tx_id"),
            tx_type: row.get("tx_type"),
            tx_sequence: row.get("tx_sequence"),
            block_height: row.get("block_height"),
            address,
            destination_address,
            amount: row.get("amount"),
            asset: Self::row_to_asset(row)?,
            btc_amount: row.get("btc_amount"),
            usdt_amount: row.get("usdt_amount"),
            purpose: parse_optional("purpose", row.get("purpose"))?,
            route,
            aml_check: parse_optional("aml_check", row.get("aml_check"))?,
            send_type: parse_optional("send_type", row.get("send_type"))?,
            prepare_tx_id: row.get("prepare_tx_id"),
            out_tx_id: row.get("out_tx_id"),
            return_tx_id: row.get("return_tx_id"),
            forward_fee_amount: row.get("forward_fee_amount"),
            is_confirmed: row.get("is_confirmed"),
            broadcast_started_at: row.get("broadcast_started_at"),
            comment: row.get("comment"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Write the mutable columns of one record
    async fn update_pay_in(
        sql_tx: &mut Transaction<'_, Postgres>,
        pay_in: &PayIn,
    ) -> Result<(), AppError> {
        let asset = pay_in.asset.as_ref();
        let destination = pay_in.destination_address.as_ref();
        let route = pay_in.route.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE pay_ins SET
                status = $2,
                destination_address = $3,
                destination_blockchain = $4,
                asset_id = $5,
                asset_name = $6,
                asset_type = $7,
                asset_blockchain = $8,
                asset_dex_name = $9,
                asset_chain_id = $10,
                asset_sellable = $11,
                btc_amount = $12,
                usdt_amount = $13,
                purpose = $14,
                route_id = $15,
                route_type = $16,
                aml_check = $17,
                send_type = $18,
                prepare_tx_id = $19,
                out_tx_id = $20,
                return_tx_id = $21,
                forward_fee_amount = $22,
                is_confirmed = $23,
                broadcast_started_at = $24,
                comment = $25,
                updated_at = $26
            WHERE id = $1
            "#,
        )
        .bind(&pay_in.id)
        .bind(pay_in.status.as_str())
        .bind(destination.map(|d| d.address.clone()))
        .bind(destination.map(|d| d.blockchain.as_str()))
        .bind(asset.map(|a| a.id))
        .bind(asset.map(|a| a.name.clone()))
        .bind(asset.map(|a| a.asset_type.as_str()))
        .bind(asset.map(|a| a.blockchain.as_str()))
        .bind(asset.map(|a| a.dex_name.clone()))
        .bind(asset.and_then(|a| a.chain_id.clone()))
        .bind(asset.map(|a| a.sellable))
        .bind(pay_in.btc_amount)
        .bind(pay_in.usdt_amount)
        .bind(pay_in.purpose.map(|p| p.as_str()))
        .bind(route.map(|r| r.id))
        .bind(route.map(|r| r.route_type.as_str()))
        .bind(pay_in.aml_check.map(|a| a.as_str()))
        .bind(pay_in.send_type.map(|s| s.as_str()))
        .bind(&pay_in.prepare_tx_id)
        .bind(&pay_in.out_tx_id)
        .bind(&pay_in.return_tx_id)
        .bind(pay_in.forward_fee_amount)
        .bind(pay_in.is_confirmed)
        .bind(pay_in.broadcast_started_at)
        .bind(&pay_in.comment)
        .bind(Utc::now())
        .execute(&mut **sql_tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Database(DatabaseError::NotFound(
                pay_in.id.clone(),
            )));
        }
        Ok(())
    }

    fn row_to_specification(
        row: &sqlx::postgres::PgRow,
    ) -> Result<TransactionSpecification, AppError> {
        Ok(TransactionSpecification {
            id: row.get("id"),
            system: row.get("system"),
            asset: row.get("asset"),
            direction: parse_optional("direction", row.get("direction"))?,
            min_fee: row.get::<Decimal, _>("min_fee"),
            min_volume: row.get::<Decimal, _>("min_volume"),
        })
    }
}

#[async_trait]
impl PayInRepository for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, pay_in), fields(id = %pay_in.id, in_tx_id = %pay_in.in_tx_id))]
    async fn create_pay_in(&self, pay_in: &PayIn) -> Result<PayIn, AppError> {
        let asset = pay_in.asset.as_ref();
        let inserted = sqlx::query(
            r#"
            INSERT INTO pay_ins (
                id, status, in_tx_id, tx_type, tx_sequence, block_height, address, blockchain,
                amount, asset_id, asset_name, asset_type, asset_blockchain, asset_dex_name,
                asset_chain_id, asset_sellable, btc_amount, usdt_amount, is_confirmed, comment,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&pay_in.id)
        .bind(pay_in.status.as_str())
        .bind(&pay_in.in_tx_id)
        .bind(&pay_in.tx_type)
        .bind(pay_in.tx_sequence)
        .bind(pay_in.block_height)
        .bind(&pay_in.address.address)
        .bind(pay_in.address.blockchain.as_str())
        .bind(pay_in.amount)
        .bind(asset.map(|a| a.id))
        .bind(asset.map(|a| a.name.clone()))
        .bind(asset.map(|a| a.asset_type.as_str()))
        .bind(asset.map(|a| a.blockchain.as_str()))
        .bind(asset.map(|a| a.dex_name.clone()))
        .bind(asset.and_then(|a| a.chain_id.clone()))
        .bind(asset.map(|a| a.sellable))
        .bind(pay_in.btc_amount)
        .bind(pay_in.usdt_amount)
        .bind(pay_in.is_confirmed)
        .bind(&pay_in.comment)
        .bind(pay_in.created_at)
        .bind(pay_in.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if inserted.rows_affected() == 0 {
            warn!("Pay-in already recorded, returning stored record");
        }

        self.find_by_identity(&pay_in.identity())
            .await?
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(pay_in.id.clone())))
    }

    #[instrument(skip(self))]
    async fn find_by_identity(
        &self,
        identity: &PayInIdentity,
    ) -> Result<Option<PayIn>, AppError> {
        let query = format!(
            r#"
            SELECT {PAY_IN_COLUMNS}
            FROM pay_ins
            WHERE in_tx_id = $1
              AND COALESCE(asset_id, -1) = COALESCE($2, -1)
              AND address = $3
              AND blockchain = $4
            "#
        );
        let row = sqlx::query(&query)
            .bind(&identity.in_tx_id)
            .bind(identity.asset_id)
            .bind(&identity.address)
            .bind(&identity.blockchain)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.as_ref().map(Self::row_to_pay_in).transpose()
    }

    #[instrument(skip(self))]
    async fn get_pay_in(&self, id: &str) -> Result<Option<PayIn>, AppError> {
        let query = format!("SELECT {PAY_IN_COLUMNS} FROM pay_ins WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.as_ref().map(Self::row_to_pay_in).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_status(&self, statuses: &[PayInStatus]) -> Result<Vec<PayIn>, AppError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let query = format!(
            r#"
            SELECT {PAY_IN_COLUMNS}
            FROM pay_ins
            WHERE status = ANY($1)
            ORDER BY created_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&query)
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_pay_in).collect()
    }

    #[instrument(skip(self))]
    async fn find_unconfirmed(&self) -> Result<Vec<PayIn>, AppError> {
        let query = format!(
            r#"
            SELECT {PAY_IN_COLUMNS}
            FROM pay_ins
            WHERE is_confirmed = FALSE
              AND status NOT IN ('Failed', 'Ignored')
            ORDER BY created_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_pay_in).collect()
    }

    #[instrument(skip(self, pay_in), fields(id = %pay_in.id, status = %pay_in.status))]
    async fn save_pay_in(&self, pay_in: &PayIn) -> Result<(), AppError> {
        self.save_pay_ins(std::slice::from_ref(pay_in)).await
    }

    /// All records are written in one transaction, or none is
    #[instrument(skip(self, pay_ins), fields(count = pay_ins.len()))]
    async fn save_pay_ins(&self, pay_ins: &[PayIn]) -> Result<(), AppError> {
        let mut sql_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        for pay_in in pay_ins {
            Self::update_pay_in(&mut sql_tx, pay_in).await?;
        }

        sql_tx
            .commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))
    }
}

#[async_trait]
impl SpecificationRepository for PostgresClient {
    #[instrument(skip(self))]
    async fn list_specifications(&self) -> Result<Vec<TransactionSpecification>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, system, asset, direction, min_fee, min_volume
            FROM transaction_specifications
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_specification).collect()
    }
}
