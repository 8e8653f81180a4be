//! Postgres-backed stock ledger.
//!
//! Transactions are plain `sqlx` transactions. Row locks are
//! `SELECT ... ORDER BY id FOR UPDATE`, upserts are `INSERT ... ON CONFLICT`
//! on the natural keys.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Constraint` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (check constraint violation) | `23514` | `Constraint` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use stockroom_core::{
    AllocationId, ChannelId, ChannelListingId, OrderLineId, PreorderAllocationId, StockId,
    VariantId, WarehouseId,
};
use stockroom_warehouse::{Allocation, PreorderAllocation, Stock, VariantChannelListing};

use super::r#trait::{
    AllocationFilter, PreorderAllocationFilter, StockFilter, StockStore, StockTransaction, StoreError,
};

const SCHEMA: &str = include_str!("../../migrations/0001_stock_allocation.sql");

const SELECT_STOCKS: &str = r#"
    SELECT id, warehouse_id, variant_id, quantity
    FROM stocks
    WHERE ($1::uuid[] IS NULL OR variant_id = ANY($1))
        AND ($2::uuid[] IS NULL OR warehouse_id = ANY($2))
        AND ($3::uuid[] IS NULL OR id = ANY($3))
    ORDER BY id
"#;

const SELECT_ALLOCATIONS: &str = r#"
    SELECT id, order_line_id, stock_id, quantity_allocated, created_at
    FROM allocations
    WHERE ($1::uuid[] IS NULL OR order_line_id = ANY($1))
        AND ($2::uuid[] IS NULL OR stock_id = ANY($2))
    ORDER BY created_at, id
"#;

const SELECT_LISTINGS: &str = r#"
    SELECT id, variant_id, channel_id, preorder_quantity_threshold, preorder_quantity_sold
    FROM variant_channel_listings
    WHERE variant_id = ANY($1)
    ORDER BY id
"#;

const SELECT_PREORDER_ALLOCATIONS: &str = r#"
    SELECT id, order_line_id, channel_listing_id, quantity
    FROM preorder_allocations
    WHERE ($1::uuid[] IS NULL OR order_line_id = ANY($1))
        AND ($2::uuid[] IS NULL OR channel_listing_id = ANY($2))
    ORDER BY id
"#;

fn uuids<T: Copy>(ids: &Option<Vec<T>>, as_uuid: impl Fn(T) -> Uuid) -> Option<Vec<Uuid>> {
    ids.as_ref().map(|ids| ids.iter().copied().map(as_uuid).collect())
}

fn stock_filter_binds(filter: &StockFilter) -> (Option<Vec<Uuid>>, Option<Vec<Uuid>>, Option<Vec<Uuid>>) {
    (
        uuids(&filter.variant_ids, |id: VariantId| *id.as_uuid()),
        uuids(&filter.warehouse_ids, |id: WarehouseId| *id.as_uuid()),
        uuids(&filter.stock_ids, |id: StockId| *id.as_uuid()),
    )
}

fn allocation_filter_binds(filter: &AllocationFilter) -> (Option<Vec<Uuid>>, Option<Vec<Uuid>>) {
    (
        uuids(&filter.order_line_ids, |id: OrderLineId| *id.as_uuid()),
        uuids(&filter.stock_ids, |id: StockId| *id.as_uuid()),
    )
}

fn preorder_filter_binds(filter: &PreorderAllocationFilter) -> (Option<Vec<Uuid>>, Option<Vec<Uuid>>) {
    (
        uuids(&filter.order_line_ids, |id: OrderLineId| *id.as_uuid()),
        uuids(&filter.channel_listing_ids, |id: ChannelListingId| *id.as_uuid()),
    )
}

fn variant_uuids(variant_ids: &[VariantId]) -> Vec<Uuid> {
    variant_ids.iter().map(|id| *id.as_uuid()).collect()
}

/// Postgres-backed stock store.
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StockStore for PostgresStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresStockTransaction { tx }))
    }

    async fn filter_stocks(&self, filter: &StockFilter) -> Result<Vec<Stock>, StoreError> {
        let (variants, warehouses, stocks) = stock_filter_binds(filter);
        let rows = sqlx::query(SELECT_STOCKS)
            .bind(variants)
            .bind(warehouses)
            .bind(stocks)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("filter_stocks", e))?;
        decode_rows::<StockRow, Stock>(&rows)
    }

    async fn filter_allocations(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
        let (lines, stocks) = allocation_filter_binds(filter);
        let rows = sqlx::query(SELECT_ALLOCATIONS)
            .bind(lines)
            .bind(stocks)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("filter_allocations", e))?;
        decode_rows::<AllocationRow, Allocation>(&rows)
    }

    async fn filter_preorder_allocations(
        &self,
        filter: &PreorderAllocationFilter,
    ) -> Result<Vec<PreorderAllocation>, StoreError> {
        let (lines, listings) = preorder_filter_binds(filter);
        let rows = sqlx::query(SELECT_PREORDER_ALLOCATIONS)
            .bind(lines)
            .bind(listings)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("filter_preorder_allocations", e))?;
        decode_rows::<PreorderAllocationRow, PreorderAllocation>(&rows)
    }
}

/// Open Postgres transaction; dropping it rolls back.
pub struct PostgresStockTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl StockTransaction for PostgresStockTransaction {
    async fn lock_stocks(&mut self, filter: &StockFilter) -> Result<Vec<Stock>, StoreError> {
        let (variants, warehouses, stocks) = stock_filter_binds(filter);
        let sql = format!("{SELECT_STOCKS} FOR UPDATE");
        let rows = sqlx::query(&sql)
            .bind(variants)
            .bind(warehouses)
            .bind(stocks)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_stocks", e))?;
        decode_rows::<StockRow, Stock>(&rows)
    }

    async fn filter_allocations(&mut self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
        let (lines, stocks) = allocation_filter_binds(filter);
        let rows = sqlx::query(SELECT_ALLOCATIONS)
            .bind(lines)
            .bind(stocks)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("filter_allocations", e))?;
        decode_rows::<AllocationRow, Allocation>(&rows)
    }

    async fn upsert_stocks(&mut self, stocks: Vec<Stock>) -> Result<Vec<Stock>, StoreError> {
        let mut stored = Vec::with_capacity(stocks.len());
        for stock in stocks {
            let row = sqlx::query(
                r#"
                INSERT INTO stocks (id, warehouse_id, variant_id, quantity)
                VALUES ($1, $2, $3, GREATEST($4, 0))
                ON CONFLICT (warehouse_id, variant_id)
                DO UPDATE SET quantity = EXCLUDED.quantity
                RETURNING id, warehouse_id, variant_id, quantity
                "#,
            )
            .bind(stock.id.as_uuid())
            .bind(stock.warehouse_id.as_uuid())
            .bind(stock.variant_id.as_uuid())
            .bind(stock.quantity())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_stock", e))?;
            stored.push(decode_row::<StockRow, Stock>(&row)?);
        }
        Ok(stored)
    }

    async fn upsert_allocations(&mut self, allocations: Vec<Allocation>) -> Result<(), StoreError> {
        for allocation in allocations {
            sqlx::query(
                r#"
                INSERT INTO allocations (id, order_line_id, stock_id, quantity_allocated, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (order_line_id, stock_id)
                DO UPDATE SET quantity_allocated = EXCLUDED.quantity_allocated
                "#,
            )
            .bind(allocation.id.as_uuid())
            .bind(allocation.order_line_id.as_uuid())
            .bind(allocation.stock_id.as_uuid())
            .bind(allocation.quantity_allocated)
            .bind(allocation.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_allocation", e))?;
        }
        Ok(())
    }

    async fn delete_allocations(&mut self, ids: &[AllocationId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query("DELETE FROM allocations WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_allocations", e))?;
        Ok(())
    }

    async fn lock_channel_listings(
        &mut self,
        variant_ids: &[VariantId],
    ) -> Result<Vec<VariantChannelListing>, StoreError> {
        let sql = format!("{SELECT_LISTINGS} FOR UPDATE");
        let rows = sqlx::query(&sql)
            .bind(variant_uuids(variant_ids))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_channel_listings", e))?;
        decode_rows::<ListingRow, VariantChannelListing>(&rows)
    }

    async fn filter_preorder_allocations(
        &mut self,
        filter: &PreorderAllocationFilter,
    ) -> Result<Vec<PreorderAllocation>, StoreError> {
        let (lines, listings) = preorder_filter_binds(filter);
        let rows = sqlx::query(SELECT_PREORDER_ALLOCATIONS)
            .bind(lines)
            .bind(listings)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("filter_preorder_allocations", e))?;
        decode_rows::<PreorderAllocationRow, PreorderAllocation>(&rows)
    }

    async fn upsert_preorder_allocations(&mut self, allocations: Vec<PreorderAllocation>) -> Result<(), StoreError> {
        for allocation in allocations {
            sqlx::query(
                r#"
                INSERT INTO preorder_allocations (id, order_line_id, channel_listing_id, quantity)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (order_line_id, channel_listing_id)
                DO UPDATE SET quantity = EXCLUDED.quantity
                "#,
            )
            .bind(allocation.id.as_uuid())
            .bind(allocation.order_line_id.as_uuid())
            .bind(allocation.channel_listing_id.as_uuid())
            .bind(allocation.quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_preorder_allocation", e))?;
        }
        Ok(())
    }

    async fn delete_preorder_allocations(&mut self, ids: &[PreorderAllocationId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query("DELETE FROM preorder_allocations WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_preorder_allocations", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique, foreign key and check violations
                Some("23505") | Some("23503") | Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(io) => StoreError::Unavailable(format!("io error in {operation}: {io}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn decode_row<R, T>(row: &PgRow) -> Result<T, StoreError>
where
    R: for<'r> FromRow<'r, PgRow> + Into<T>,
{
    R::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::Storage(format!("failed to decode row: {e}")))
}

fn decode_rows<R, T>(rows: &[PgRow]) -> Result<Vec<T>, StoreError>
where
    R: for<'r> FromRow<'r, PgRow> + Into<T>,
{
    rows.iter().map(decode_row::<R, T>).collect()
}

#[derive(Debug)]
struct StockRow {
    id: Uuid,
    warehouse_id: Uuid,
    variant_id: Uuid,
    quantity: i32,
}

impl<'r> FromRow<'r, PgRow> for StockRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StockRow {
            id: row.try_get("id")?,
            warehouse_id: row.try_get("warehouse_id")?,
            variant_id: row.try_get("variant_id")?,
            quantity: row.try_get("quantity")?,
        })
    }
}

impl From<StockRow> for Stock {
    fn from(row: StockRow) -> Self {
        Stock::with_id(
            StockId::from_uuid(row.id),
            WarehouseId::from_uuid(row.warehouse_id),
            VariantId::from_uuid(row.variant_id),
            row.quantity,
        )
    }
}

#[derive(Debug)]
struct AllocationRow {
    id: Uuid,
    order_line_id: Uuid,
    stock_id: Uuid,
    quantity_allocated: i32,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AllocationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AllocationRow {
            id: row.try_get("id")?,
            order_line_id: row.try_get("order_line_id")?,
            stock_id: row.try_get("stock_id")?,
            quantity_allocated: row.try_get("quantity_allocated")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<AllocationRow> for Allocation {
    fn from(row: AllocationRow) -> Self {
        Allocation {
            id: AllocationId::from_uuid(row.id),
            order_line_id: OrderLineId::from_uuid(row.order_line_id),
            stock_id: StockId::from_uuid(row.stock_id),
            quantity_allocated: row.quantity_allocated,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct ListingRow {
    id: Uuid,
    variant_id: Uuid,
    channel_id: Uuid,
    preorder_quantity_threshold: Option<i32>,
    preorder_quantity_sold: i32,
}

impl<'r> FromRow<'r, PgRow> for ListingRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ListingRow {
            id: row.try_get("id")?,
            variant_id: row.try_get("variant_id")?,
            channel_id: row.try_get("channel_id")?,
            preorder_quantity_threshold: row.try_get("preorder_quantity_threshold")?,
            preorder_quantity_sold: row.try_get("preorder_quantity_sold")?,
        })
    }
}

impl From<ListingRow> for VariantChannelListing {
    fn from(row: ListingRow) -> Self {
        VariantChannelListing {
            id: ChannelListingId::from_uuid(row.id),
            variant_id: VariantId::from_uuid(row.variant_id),
            channel_id: ChannelId::from_uuid(row.channel_id),
            preorder_quantity_threshold: row.preorder_quantity_threshold,
            preorder_quantity_sold: row.preorder_quantity_sold,
        }
    }
}

#[derive(Debug)]
struct PreorderAllocationRow {
    id: Uuid,
    order_line_id: Uuid,
    channel_listing_id: Uuid,
    quantity: i32,
}

impl<'r> FromRow<'r, PgRow> for PreorderAllocationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PreorderAllocationRow {
            id: row.try_get("id")?,
            order_line_id: row.try_get("order_line_id")?,
            channel_listing_id: row.try_get("channel_listing_id")?,
            quantity: row.try_get("quantity")?,
        })
    }
}

impl From<PreorderAllocationRow> for PreorderAllocation {
    fn from(row: PreorderAllocationRow) -> Self {
        PreorderAllocation {
            id: PreorderAllocationId::from_uuid(row.id),
            order_line_id: OrderLineId::from_uuid(row.order_line_id),
            channel_listing_id: ChannelListingId::from_uuid(row.channel_listing_id),
            quantity: row.quantity,
        }
    }
}
