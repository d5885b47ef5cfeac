use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::error;

use super::models::{address_text, hash_text, HeaderRow, UnconfirmedRow, WaitingRow};
use super::TxStore;
use crate::types::{ExternalBlockHeader, UnconfirmedTxRecord, WaitingBroadcastRecord};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

const UNCONFIRMED_COLUMNS: &str = r#"external_tx_hash, nerve_tx_hash, tx_type, block_height,
    from_address, to_address, value::TEXT AS value, decimals, is_contract_asset,
    contract_address, asset_id, create_time, tx_time, status, validated, skip_rounds,
    resend_count, delete_flag, delete_height, signers"#;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and migrate
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl TxStore for PgStore {
    async fn latest_header(&self) -> Result<Option<ExternalBlockHeader>> {
        let row = sqlx::query_as::<_, HeaderRow>(
            r#"SELECT h.height, h.hash FROM block_headers h
               JOIN header_pointer p ON p.latest_height = h.height
               WHERE p.id = 1"#,
        )
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get latest header")?;

        row.map(ExternalBlockHeader::try_from).transpose()
    }

    async fn save_header(&self, header: &ExternalBlockHeader) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO block_headers (height, hash) VALUES ($1, $2)
               ON CONFLICT (height) DO UPDATE SET hash = EXCLUDED.hash"#,
        )
        .bind(header.height as i64)
        .bind(hash_text(&header.hash))
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to save header")?;

        sqlx::query(
            r#"INSERT INTO header_pointer (id, latest_height) VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE SET latest_height = EXCLUDED.latest_height"#,
        )
        .bind(header.height as i64)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to move header pointer")?;

        tx.commit().await?;
        Ok(())
    }

    async fn header_by_height(&self, height: u64) -> Result<Option<ExternalBlockHeader>> {
        let row = sqlx::query_as::<_, HeaderRow>(
            "SELECT height, hash FROM block_headers WHERE height = $1",
        )
        .bind(height as i64)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get header")?;

        row.map(ExternalBlockHeader::try_from).transpose()
    }

    async fn roll_back_header(&self, height: u64) -> Result<Option<ExternalBlockHeader>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM block_headers WHERE height = $1")
            .bind(height as i64)
            .execute(&mut *tx)
            .await
            .wrap_err("Failed to delete header")?;

        let previous = match height.checked_sub(1) {
            Some(prev) => sqlx::query_as::<_, HeaderRow>(
                "SELECT height, hash FROM block_headers WHERE height = $1",
            )
            .bind(prev as i64)
            .fetch_optional(&mut *tx)
            .await
            .wrap_err("Failed to get previous header")?,
            None => None,
        };
        let previous = previous.map(ExternalBlockHeader::try_from).transpose()?;

        sqlx::query(
            r#"INSERT INTO header_pointer (id, latest_height) VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE SET latest_height = EXCLUDED.latest_height"#,
        )
        .bind(previous.map(|h| h.height as i64))
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to move header pointer")?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn delete_all_headers(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM block_headers")
            .execute(&mut *tx)
            .await
            .wrap_err("Failed to clear headers")?;
        sqlx::query("DELETE FROM header_pointer")
            .execute(&mut *tx)
            .await
            .wrap_err("Failed to clear header pointer")?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_unconfirmed(&self, record: &UnconfirmedTxRecord) -> Result<()> {
        let signers: Vec<String> = record.signers.iter().map(address_text).collect();

        sqlx::query(
            r#"
            INSERT INTO unconfirmed_txs (external_tx_hash, nerve_tx_hash, tx_type, block_height,
                from_address, to_address, value, decimals, is_contract_asset, contract_address,
                asset_id, create_time, tx_time, status, validated, skip_rounds, resend_count,
                delete_flag, delete_height, signers)
            VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20)
            ON CONFLICT (external_tx_hash) DO UPDATE SET
                nerve_tx_hash = EXCLUDED.nerve_tx_hash,
                tx_type = EXCLUDED.tx_type,
                block_height = EXCLUDED.block_height,
                tx_time = EXCLUDED.tx_time,
                status = EXCLUDED.status,
                validated = EXCLUDED.validated,
                skip_rounds = EXCLUDED.skip_rounds,
                resend_count = EXCLUDED.resend_count,
                delete_flag = EXCLUDED.delete_flag,
                delete_height = EXCLUDED.delete_height,
                signers = EXCLUDED.signers,
                updated_at = NOW()
            "#,
        )
        .bind(hash_text(&record.external_tx_hash))
        .bind(&record.nerve_tx_hash)
        .bind(record.tx_type.as_str())
        .bind(record.block_height.map(|h| h as i64))
        .bind(address_text(&record.from))
        .bind(&record.to)
        .bind(record.value.to_string())
        .bind(i16::from(record.decimals))
        .bind(record.is_contract_asset)
        .bind(record.contract_address.as_ref().map(address_text))
        .bind(i64::from(record.asset_id))
        .bind(record.create_time as i64)
        .bind(record.tx_time.map(|t| t as i64))
        .bind(record.status.as_str())
        .bind(record.validated)
        .bind(record.skip_rounds as i32)
        .bind(record.resend_count as i32)
        .bind(record.delete_flag)
        .bind(record.delete_height.map(|h| h as i64))
        .bind(serde_json::to_string(&signers)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error saving unconfirmed record: {:?}", e);
            e
        })
        .wrap_err("Failed to save unconfirmed record")?;

        Ok(())
    }

    async fn find_unconfirmed(
        &self,
        external_tx_hash: B256,
    ) -> Result<Option<UnconfirmedTxRecord>> {
        let row = sqlx::query_as::<_, UnconfirmedRow>(&format!(
            "SELECT {} FROM unconfirmed_txs WHERE external_tx_hash = $1",
            UNCONFIRMED_COLUMNS
        ))
        .bind(hash_text(&external_tx_hash))
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to find unconfirmed record")?;

        row.map(UnconfirmedTxRecord::try_from).transpose()
    }

    async fn remove_unconfirmed(&self, external_tx_hash: B256) -> Result<()> {
        sqlx::query("DELETE FROM unconfirmed_txs WHERE external_tx_hash = $1")
            .bind(hash_text(&external_tx_hash))
            .execute(&self.pool)
            .await
            .wrap_err("Failed to remove unconfirmed record")?;
        Ok(())
    }

    async fn all_unconfirmed(&self) -> Result<Vec<UnconfirmedTxRecord>> {
        let rows = sqlx::query_as::<_, UnconfirmedRow>(&format!(
            "SELECT {} FROM unconfirmed_txs ORDER BY create_time",
            UNCONFIRMED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to load unconfirmed records")?;

        rows.into_iter().map(UnconfirmedTxRecord::try_from).collect()
    }

    async fn save_waiting(&self, record: &WaitingBroadcastRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO waiting_broadcasts (nerve_tx_hash, tx_type, resend_count, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (nerve_tx_hash) DO UPDATE SET
                resend_count = EXCLUDED.resend_count,
                record = EXCLUDED.record,
                updated_at = NOW()
            "#,
        )
        .bind(&record.nerve_tx_hash)
        .bind(record.tx_type.as_str())
        .bind(record.resend_count as i32)
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to save waiting record")?;
        Ok(())
    }

    async fn remove_waiting(&self, nerve_tx_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM waiting_broadcasts WHERE nerve_tx_hash = $1")
            .bind(nerve_tx_hash)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to remove waiting record")?;
        Ok(())
    }

    async fn all_waiting(&self) -> Result<Vec<WaitingBroadcastRecord>> {
        let rows = sqlx::query_as::<_, WaitingRow>(
            "SELECT nerve_tx_hash, record FROM waiting_broadcasts ORDER BY nerve_tx_hash",
        )
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to load waiting records")?;

        rows.into_iter().map(WaitingBroadcastRecord::try_from).collect()
    }

    async fn save_relation(
        &self,
        external_tx_hash: B256,
        nerve_tx_hash: &str,
        sent_at: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO tx_relations (external_tx_hash, nerve_tx_hash, sent_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (external_tx_hash) DO NOTHING"#,
        )
        .bind(hash_text(&external_tx_hash))
        .bind(nerve_tx_hash)
        .bind(sent_at as i64)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to save tx relation")?;
        Ok(())
    }

    async fn nerve_by_external(&self, external_tx_hash: B256) -> Result<Option<String>> {
        let row = sqlx::query("SELECT nerve_tx_hash FROM tx_relations WHERE external_tx_hash = $1")
            .bind(hash_text(&external_tx_hash))
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to look up tx relation")?;

        Ok(row.map(|r| r.get("nerve_tx_hash")))
    }

    async fn remove_relations(&self, nerve_tx_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM tx_relations WHERE nerve_tx_hash = $1")
            .bind(nerve_tx_hash)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to remove tx relations")?;
        Ok(())
    }
}
