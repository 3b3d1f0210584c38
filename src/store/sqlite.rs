use crate::auction::clock::Clock;
use crate::auction::types::{AuctionDocument, BidRecord};
use crate::error::StoreError;
use crate::session::Session;
use crate::store::hub::{ChangeHub, DocumentLoader};
use crate::store::memory::demo_auctions;
use crate::store::{
    check_append_precondition, sort_documents, AppendReceipt, ConditionalAppend, DocumentFeed,
    DocumentStore, OrderField, QueryFeed,
};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const AUCTION_COLUMNS: &str =
    "id, title, description, image, owner, end_time_ms, current_bid, version";

struct SqliteInner {
    pool: SqlitePool,
    hub: ChangeHub,
    clock: Arc<dyn Clock>,
}

/// Store backed by a local SQLite file. Change notifications cover writes
/// made through this handle (and its clones).
#[derive(Clone)]
pub struct SqliteDocumentStore {
    inner: Arc<SqliteInner>,
}

fn map_bid_row(row: &SqliteRow) -> Result<BidRecord, StoreError> {
    Ok(BidRecord {
        bidder: row.try_get("bidder")?,
        bidder_id: row.try_get("bidder_id")?,
        amount: row.try_get("amount")?,
        placed_at_ms: row.try_get("placed_at_ms")?,
    })
}

fn map_auction_row(row: &SqliteRow, bids: Vec<BidRecord>) -> Result<AuctionDocument, StoreError> {
    let version: i64 = row.try_get("version")?;

    Ok(AuctionDocument {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        image: row.try_get("image")?,
        owner: row.try_get("owner")?,
        end_time_ms: row.try_get("end_time_ms")?,
        current_bid: row.try_get("current_bid")?,
        bids: Some(bids),
        revision: Some(version.to_string()),
    })
}

async fn fetch_bids(
    conn: &mut SqliteConnection,
    collection: &str,
    auction_id: &str,
) -> Result<Vec<BidRecord>, StoreError> {
    let rows = sqlx::query(
        "SELECT bidder, bidder_id, amount, placed_at_ms FROM auction_bids \
         WHERE collection = ? AND auction_id = ? ORDER BY seq ASC",
    )
    .bind(collection)
    .bind(auction_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut bids = Vec::with_capacity(rows.len());
    for row in rows {
        bids.push(map_bid_row(&row)?);
    }
    Ok(bids)
}

async fn fetch_document(
    conn: &mut SqliteConnection,
    collection: &str,
    document_id: &str,
) -> Result<Option<AuctionDocument>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {AUCTION_COLUMNS} FROM auctions WHERE collection = ? AND id = ?"
    ))
    .bind(collection)
    .bind(document_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let bids = fetch_bids(conn, collection, document_id).await?;
    map_auction_row(&row, bids).map(Some)
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(SqliteInner {
                pool,
                hub: ChangeHub::new(),
                clock,
            }),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Replaces the stored auction and its bid list wholesale.
    pub async fn upsert_auction(
        &self,
        collection: &str,
        document: &AuctionDocument,
    ) -> Result<(), StoreError> {
        let now_ms = self.inner.clock.now_ms();
        let mut tx = self.inner.pool.begin().await?;

        sqlx::query(
            "INSERT INTO auctions (collection, id, title, description, image, owner, end_time_ms, current_bid, version, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?) \
             ON CONFLICT(collection, id) DO UPDATE SET \
               title=excluded.title, \
               description=excluded.description, \
               image=excluded.image, \
               owner=excluded.owner, \
               end_time_ms=excluded.end_time_ms, \
               current_bid=excluded.current_bid, \
               version=auctions.version + 1, \
               updated_at_ms=excluded.updated_at_ms",
        )
        .bind(collection)
        .bind(&document.id)
        .bind(document.title.as_deref())
        .bind(document.description.as_deref())
        .bind(document.image.as_deref())
        .bind(document.owner.as_deref())
        .bind(document.end_time_ms)
        .bind(document.current_bid)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM auction_bids WHERE collection = ? AND auction_id = ?")
            .bind(collection)
            .bind(&document.id)
            .execute(&mut *tx)
            .await?;

        for (index, bid) in document.bids.iter().flatten().enumerate() {
            sqlx::query(
                "INSERT INTO auction_bids (collection, auction_id, seq, bidder, bidder_id, amount, placed_at_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(collection)
            .bind(&document.id)
            .bind(index as i64 + 1)
            .bind(&bid.bidder)
            .bind(bid.bidder_id.as_deref())
            .bind(bid.amount)
            .bind(bid.placed_at_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.inner.hub.publish(collection, &document.id);
        Ok(())
    }

    pub async fn delete_auction(&self, collection: &str, document_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM auctions WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(document_id)
            .execute(&self.inner.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.inner.hub.publish(collection, document_id);
        }
        Ok(removed)
    }

    pub async fn document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<AuctionDocument>, StoreError> {
        self.inner.load_document(collection, document_id).await
    }

    /// Seeds the demo auctions into an empty collection; a collection that
    /// already holds auctions is left alone.
    pub async fn seed_demo_auctions(&self, collection: &str, now_ms: i64) -> Result<bool, StoreError> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM auctions WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.inner.pool)
            .await?;
        if existing > 0 {
            debug!(collection, existing, "collection already populated; skipping demo seed");
            return Ok(false);
        }

        for document in demo_auctions(now_ms) {
            self.upsert_auction(collection, &document).await?;
        }
        info!(collection, "seeded demo auctions");
        Ok(true)
    }
}

#[async_trait]
impl DocumentLoader for SqliteInner {
    async fn load_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<AuctionDocument>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_document(&mut *conn, collection, document_id).await
    }

    async fn load_collection(
        &self,
        collection: &str,
        order_by: OrderField,
    ) -> Result<Vec<AuctionDocument>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions WHERE collection = ?"
        ))
        .bind(collection)
        .fetch_all(&mut *conn)
        .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let auction_id: String = row.try_get("id")?;
            let bids = fetch_bids(&mut *conn, collection, &auction_id).await?;
            documents.push(map_auction_row(&row, bids)?);
        }
        sort_documents(&mut documents, order_by);
        Ok(documents)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn subscribe_document(
        &self,
        _session: &Session,
        collection: &str,
        document_id: &str,
        cancel_token: CancellationToken,
    ) -> Result<DocumentFeed, StoreError> {
        Ok(self.inner.hub.spawn_document_feed(
            Arc::clone(&self.inner),
            collection.to_string(),
            document_id.to_string(),
            cancel_token,
        ))
    }

    async fn subscribe_query(
        &self,
        _session: &Session,
        collection: &str,
        order_by: OrderField,
        cancel_token: CancellationToken,
    ) -> Result<QueryFeed, StoreError> {
        Ok(self.inner.hub.spawn_query_feed(
            Arc::clone(&self.inner),
            collection.to_string(),
            order_by,
            cancel_token,
        ))
    }

    async fn conditional_append(
        &self,
        _session: &Session,
        request: ConditionalAppend,
    ) -> Result<AppendReceipt, StoreError> {
        let now_ms = self.inner.clock.now_ms();
        let amount = request.bid.amount;
        if !amount.is_finite() {
            return Err(StoreError::Conflict("bid amount must be finite".to_string()));
        }

        let mut tx = self.inner.pool.begin().await?;

        // The guard repeats check_append_precondition in SQL so the check and
        // the write happen under the same write lock.
        let updated = sqlx::query(
            "UPDATE auctions SET current_bid = ?, version = version + 1, updated_at_ms = ? \
             WHERE collection = ? AND id = ? \
               AND end_time_ms IS NOT NULL AND end_time_ms > ? \
               AND ? > MAX(0, COALESCE(current_bid, 0), COALESCE(( \
                 SELECT MAX(amount) FROM auction_bids \
                 WHERE auction_bids.collection = auctions.collection AND auction_bids.auction_id = auctions.id \
               ), 0))",
        )
        .bind(amount)
        .bind(now_ms)
        .bind(&request.collection)
        .bind(&request.document_id)
        .bind(now_ms)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current = fetch_document(&mut *tx, &request.collection, &request.document_id).await?;
            check_append_precondition(current.as_ref(), amount, now_ms)?;
            return Err(StoreError::Conflict(format!(
                "auction {} changed during the write",
                request.document_id
            )));
        }

        sqlx::query(
            "INSERT INTO auction_bids (collection, auction_id, seq, bidder, bidder_id, amount, placed_at_ms) \
             VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM auction_bids WHERE collection = ? AND auction_id = ?), ?, ?, ?, ?)",
        )
        .bind(&request.collection)
        .bind(&request.document_id)
        .bind(&request.collection)
        .bind(&request.document_id)
        .bind(&request.bid.bidder)
        .bind(request.bid.bidder_id.as_deref())
        .bind(amount)
        .bind(request.bid.placed_at_ms)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT a.version, (SELECT COUNT(*) FROM auction_bids b WHERE b.collection = a.collection AND b.auction_id = a.id) AS bid_count \
             FROM auctions a WHERE a.collection = ? AND a.id = ?",
        )
        .bind(&request.collection)
        .bind(&request.document_id)
        .fetch_one(&mut *tx)
        .await?;
        let version: i64 = row.try_get("version")?;
        let bid_count: i64 = row.try_get("bid_count")?;

        tx.commit().await?;

        debug!(
            collection = %request.collection,
            document_id = %request.document_id,
            current_bid = amount,
            version,
            "conditional append committed"
        );
        self.inner
            .hub
            .publish(&request.collection, &request.document_id);

        Ok(AppendReceipt {
            document_id: request.document_id,
            current_bid: amount,
            bid_count: usize::try_from(bid_count).unwrap_or_default(),
            revision: Some(version.to_string()),
        })
    }

    async fn ping(&self, _session: &Session, collection: &str) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM auctions WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.inner.pool)
            .await?;
        Ok(())
    }
}
