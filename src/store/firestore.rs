//! Firestore v1 REST adapter.
//!
//! Firestore's push channel is gRPC-only, so live feeds are emulated by
//! polling and emitting whenever a document's `updateTime` (or existence)
//! changes. Conditional appends run a read, check, commit loop guarded by an
//! `updateTime` precondition.

use crate::auction::clock::Clock;
use crate::auction::types::{
    format_timestamp_ms, parse_end_time_ms, parse_lenient_amount, AuctionDocument, BidRecord,
    BIDS_FIELD, CURRENT_BID_FIELD, END_TIME_FIELD,
};
use crate::config::FirestoreConfig;
use crate::error::StoreError;
use crate::session::{Session, FALLBACK_BIDDER_LABEL};
use crate::store::{
    check_append_precondition, sort_documents, AppendReceipt, ConditionalAppend, DocumentChange,
    DocumentFeed, DocumentStore, OrderField, QueryFeed, FEED_CAPACITY,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_COMMIT_ATTEMPTS: usize = 3;
const MIN_POLL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum FirestoreValue {
    NullValue(Option<()>),
    BooleanValue(bool),
    IntegerValue(String),
    DoubleValue(f64),
    TimestampValue(String),
    StringValue(String),
    BytesValue(String),
    ReferenceValue(String),
    GeoPointValue(GeoPoint),
    ArrayValue(ArrayValue),
    MapValue(MapValue),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArrayValue {
    #[serde(default)]
    pub values: Vec<FirestoreValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MapValue {
    #[serde(default)]
    pub fields: BTreeMap<String, FirestoreValue>,
}

impl FirestoreValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            Self::StringValue(value) => Some(value),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::DoubleValue(value) => Some(*value).filter(|value| value.is_finite()),
            Self::IntegerValue(raw) | Self::StringValue(raw) => parse_lenient_amount(raw),
            _ => None,
        }
    }

    fn as_timestamp_ms(&self) -> Option<i64> {
        match self {
            Self::TimestampValue(raw) | Self::StringValue(raw) | Self::IntegerValue(raw) => {
                parse_end_time_ms(raw)
            }
            Self::DoubleValue(value) if value.is_finite() => Some(*value as i64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentWire {
    name: String,
    #[serde(default)]
    fields: BTreeMap<String, FirestoreValue>,
    update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunQueryResponseWire {
    document: Option<DocumentWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsWire {
    #[serde(default)]
    documents: Vec<DocumentWire>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunQueryRequest {
    structured_query: StructuredQuery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StructuredQuery {
    from: Vec<CollectionSelector>,
    order_by: Vec<QueryOrder>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CollectionSelector {
    collection_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryOrder {
    field: FieldReference,
    direction: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FieldReference {
    field_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitRequest {
    writes: Vec<WriteWire>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteWire {
    update: DocumentUpdateWire,
    update_mask: DocumentMaskWire,
    update_transforms: Vec<FieldTransformWire>,
    current_document: PreconditionWire,
}

#[derive(Debug, Serialize)]
struct DocumentUpdateWire {
    name: String,
    fields: BTreeMap<String, FirestoreValue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentMaskWire {
    field_paths: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FieldTransformWire {
    field_path: String,
    append_missing_elements: ArrayValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreconditionWire {
    update_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponseWire {
    #[serde(default)]
    write_results: Vec<WriteResultWire>,
    commit_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResultWire {
    update_time: Option<String>,
}

fn database_path(config: &FirestoreConfig) -> String {
    format!(
        "projects/{}/databases/{}/documents",
        config.project_id, config.database
    )
}

fn document_name(config: &FirestoreConfig, collection: &str, document_id: &str) -> String {
    format!("{}/{collection}/{document_id}", database_path(config))
}

fn with_api_key(endpoint: String, config: &FirestoreConfig) -> String {
    match config.api_key.as_deref() {
        Some(key) => {
            let separator = if endpoint.contains('?') { '&' } else { '?' };
            format!("{endpoint}{separator}key={key}")
        }
        None => endpoint,
    }
}

fn document_endpoint(config: &FirestoreConfig, collection: &str, document_id: &str) -> String {
    with_api_key(
        format!(
            "{FIRESTORE_BASE_URL}/{}",
            document_name(config, collection, document_id)
        ),
        config,
    )
}

fn list_endpoint(config: &FirestoreConfig, collection: &str, page_size: u32) -> String {
    with_api_key(
        format!(
            "{FIRESTORE_BASE_URL}/{}/{collection}?pageSize={page_size}",
            database_path(config)
        ),
        config,
    )
}

fn run_query_endpoint(config: &FirestoreConfig) -> String {
    with_api_key(
        format!("{FIRESTORE_BASE_URL}/{}:runQuery", database_path(config)),
        config,
    )
}

fn commit_endpoint(config: &FirestoreConfig) -> String {
    with_api_key(
        format!("{FIRESTORE_BASE_URL}/{}:commit", database_path(config)),
        config,
    )
}

/// Wait before the next poll after `failures` consecutive errors. Starts at
/// the poll interval and doubles, with up to a quarter of the step added as
/// jitter, never beyond `MAX_POLL_BACKOFF`.
fn poll_backoff(poll_interval: Duration, failures: u32, jitter_seed: i64) -> Duration {
    let step = poll_interval
        .max(MIN_POLL_BACKOFF)
        .saturating_mul(1_u32 << failures.min(8));
    let jitter_span_ms = (step.as_millis() / 4).clamp(1, u128::from(u64::MAX)) as u64;
    let jitter = Duration::from_millis(jitter_seed.unsigned_abs() % jitter_span_ms);
    step.saturating_add(jitter).min(MAX_POLL_BACKOFF)
}

fn status_error(status: StatusCode, body: &[u8]) -> StoreError {
    let detail = String::from_utf8_lossy(body);
    let message = format!("firestore responded {status}: {}", detail.trim());
    match status.as_u16() {
        401 | 403 => StoreError::Permission(message),
        404 => StoreError::NotFound(message),
        409 => StoreError::Conflict(message),
        400 if detail.contains("FAILED_PRECONDITION") => StoreError::Conflict(message),
        408 | 429 | 500..=599 => StoreError::Network(message),
        _ => StoreError::Backend(message),
    }
}

fn decode_bid(value: &FirestoreValue) -> Option<BidRecord> {
    let FirestoreValue::MapValue(map) = value else {
        return None;
    };
    let field = |name: &str| map.fields.get(name);

    let bidder = field("user")
        .or_else(|| field("bidder"))
        .and_then(FirestoreValue::as_str)
        .unwrap_or(FALLBACK_BIDDER_LABEL)
        .to_string();

    Some(BidRecord {
        bidder,
        bidder_id: field("userId")
            .and_then(FirestoreValue::as_str)
            .map(str::to_string),
        amount: field("amount")
            .and_then(FirestoreValue::as_f64)
            .unwrap_or(0.0),
        placed_at_ms: field("time").and_then(FirestoreValue::as_timestamp_ms),
    })
}

fn encode_bid(bid: &BidRecord) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        "user".to_string(),
        FirestoreValue::StringValue(bid.bidder.clone()),
    );
    if let Some(bidder_id) = &bid.bidder_id {
        fields.insert(
            "userId".to_string(),
            FirestoreValue::StringValue(bidder_id.clone()),
        );
    }
    fields.insert("amount".to_string(), FirestoreValue::DoubleValue(bid.amount));
    if let Some(time) = bid.placed_at_ms.and_then(format_timestamp_ms) {
        fields.insert("time".to_string(), FirestoreValue::StringValue(time));
    }
    FirestoreValue::MapValue(MapValue { fields })
}

fn decode_document(wire: DocumentWire) -> AuctionDocument {
    let id = wire
        .name
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let text = |name: &str| {
        wire.fields
            .get(name)
            .and_then(FirestoreValue::as_str)
            .map(str::to_string)
    };

    let bids = match wire.fields.get(BIDS_FIELD) {
        Some(FirestoreValue::ArrayValue(array)) => {
            Some(array.values.iter().filter_map(decode_bid).collect())
        }
        _ => None,
    };

    AuctionDocument {
        title: text("title"),
        description: text("description"),
        image: text("image"),
        owner: text("owner"),
        end_time_ms: wire
            .fields
            .get(END_TIME_FIELD)
            .and_then(FirestoreValue::as_timestamp_ms),
        current_bid: wire
            .fields
            .get(CURRENT_BID_FIELD)
            .and_then(FirestoreValue::as_f64),
        bids,
        revision: wire.update_time.clone(),
        id,
    }
}

fn parse_document_payload(payload: &mut [u8]) -> Result<AuctionDocument, StoreError> {
    let wire: DocumentWire = simd_json::serde::from_slice(payload)?;
    Ok(decode_document(wire))
}

fn parse_query_payload(payload: &mut [u8]) -> Result<Vec<AuctionDocument>, StoreError> {
    let rows: Vec<RunQueryResponseWire> = simd_json::serde::from_slice(payload)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.document)
        .map(decode_document)
        .collect())
}

fn build_commit_request(
    config: &FirestoreConfig,
    request: &ConditionalAppend,
    update_time: String,
) -> CommitRequest {
    let mut fields = BTreeMap::new();
    fields.insert(
        CURRENT_BID_FIELD.to_string(),
        FirestoreValue::DoubleValue(request.bid.amount),
    );

    CommitRequest {
        writes: vec![WriteWire {
            update: DocumentUpdateWire {
                name: document_name(config, &request.collection, &request.document_id),
                fields,
            },
            update_mask: DocumentMaskWire {
                field_paths: vec![CURRENT_BID_FIELD.to_string()],
            },
            update_transforms: vec![FieldTransformWire {
                field_path: BIDS_FIELD.to_string(),
                append_missing_elements: ArrayValue {
                    values: vec![encode_bid(&request.bid)],
                },
            }],
            current_document: PreconditionWire { update_time },
        }],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PollMarker {
    Missing,
    Revision(Option<String>),
}

struct FirestoreInner {
    client: Client,
    config: FirestoreConfig,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct FirestoreDocumentStore {
    inner: Arc<FirestoreInner>,
}

impl FirestoreDocumentStore {
    pub fn new(
        config: FirestoreConfig,
        poll_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        info!(
            project_id = %config.project_id,
            database = %config.database,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "firestore store configured"
        );
        Ok(Self {
            inner: Arc::new(FirestoreInner {
                client,
                config,
                poll_interval,
                clock,
            }),
        })
    }
}

fn authorize(request: RequestBuilder, session: &Session) -> RequestBuilder {
    match session.id_token.as_deref() {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn ping_request(
    client: &Client,
    config: &FirestoreConfig,
    session: &Session,
    collection: &str,
) -> RequestBuilder {
    authorize(client.get(list_endpoint(config, collection, 1)), session)
}

async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, StoreError> {
    let status = response.status();
    let body = response.bytes().await?.to_vec();
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    Ok(body)
}

impl FirestoreInner {
    async fn fetch_document(
        &self,
        session: &Session,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<AuctionDocument>, StoreError> {
        let endpoint = document_endpoint(&self.config, collection, document_id);
        let response = authorize(self.client.get(endpoint), session).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut body = read_body(response).await?;
        parse_document_payload(&mut body).map(Some)
    }

    async fn fetch_collection(
        &self,
        session: &Session,
        collection: &str,
        order_by: OrderField,
    ) -> Result<Vec<AuctionDocument>, StoreError> {
        let query = RunQueryRequest {
            structured_query: StructuredQuery {
                from: vec![CollectionSelector {
                    collection_id: collection.to_string(),
                }],
                order_by: vec![QueryOrder {
                    field: FieldReference {
                        field_path: order_by.as_str().to_string(),
                    },
                    direction: "ASCENDING",
                }],
            },
        };

        let endpoint = run_query_endpoint(&self.config);
        let response = authorize(self.client.post(endpoint).json(&query), session)
            .send()
            .await?;
        let mut body = read_body(response).await?;
        let mut documents = parse_query_payload(&mut body)?;
        // Mixed string and timestamp endTime values sort by type upstream.
        sort_documents(&mut documents, order_by);
        Ok(documents)
    }

    async fn commit(
        &self,
        session: &Session,
        commit: &CommitRequest,
    ) -> Result<Option<String>, StoreError> {
        let endpoint = commit_endpoint(&self.config);
        let response = authorize(self.client.post(endpoint).json(commit), session)
            .send()
            .await?;
        let mut body = read_body(response).await?;
        let parsed: CommitResponseWire = simd_json::serde::from_slice(&mut body)?;
        Ok(parsed
            .write_results
            .into_iter()
            .find_map(|result| result.update_time)
            .or(parsed.commit_time))
    }
}

async fn pause_or_stop(
    delay: Duration,
    cancel_token: &CancellationToken,
    sender_closed: impl std::future::Future<Output = ()>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => false,
        _ = sender_closed => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn deliver<T>(
    sender: &mpsc::Sender<Result<T, StoreError>>,
    item: Result<T, StoreError>,
    cancel_token: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => false,
        sent = sender.send(item) => sent.is_ok(),
    }
}

#[async_trait]
impl DocumentStore for FirestoreDocumentStore {
    fn backend_name(&self) -> &'static str {
        "firestore"
    }

    async fn subscribe_document(
        &self,
        session: &Session,
        collection: &str,
        document_id: &str,
        cancel_token: CancellationToken,
    ) -> Result<DocumentFeed, StoreError> {
        let inner = Arc::clone(&self.inner);
        let session = session.clone();
        let collection = collection.to_string();
        let document_id = document_id.to_string();
        let (sender, receiver) = mpsc::channel(FEED_CAPACITY);

        tokio::spawn(async move {
            let mut last_marker: Option<PollMarker> = None;
            let mut failures: u32 = 0;

            loop {
                let fetched = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    fetched = inner.fetch_document(&session, &collection, &document_id) => fetched,
                };

                let delay = match fetched {
                    Ok(found) => {
                        failures = 0;
                        let (marker, change) = match found {
                            Some(document) => (
                                PollMarker::Revision(document.revision.clone()),
                                DocumentChange::Found(document),
                            ),
                            None => (PollMarker::Missing, DocumentChange::Missing),
                        };
                        if last_marker.as_ref() != Some(&marker) {
                            if !deliver(&sender, Ok(change), &cancel_token).await {
                                break;
                            }
                            last_marker = Some(marker);
                        }
                        inner.poll_interval
                    }
                    Err(error) => {
                        let delay = poll_backoff(inner.poll_interval, failures, inner.clock.now_ms());
                        warn!(
                            %collection,
                            %document_id,
                            error = %error,
                            retry_in_ms = delay.as_millis() as u64,
                            "firestore document poll failed"
                        );
                        failures = failures.saturating_add(1);
                        // Re-emit the current state once polling recovers.
                        last_marker = None;
                        if !deliver(&sender, Err(error), &cancel_token).await {
                            break;
                        }
                        delay
                    }
                };

                if !pause_or_stop(delay, &cancel_token, sender.closed()).await {
                    break;
                }
            }
            debug!(%collection, %document_id, "firestore document poll stopped");
        });

        Ok(receiver)
    }

    async fn subscribe_query(
        &self,
        session: &Session,
        collection: &str,
        order_by: OrderField,
        cancel_token: CancellationToken,
    ) -> Result<QueryFeed, StoreError> {
        let inner = Arc::clone(&self.inner);
        let session = session.clone();
        let collection = collection.to_string();
        let (sender, receiver) = mpsc::channel(FEED_CAPACITY);

        tokio::spawn(async move {
            let mut last_marker: Option<Vec<(String, Option<String>)>> = None;
            let mut failures: u32 = 0;

            loop {
                let fetched = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    fetched = inner.fetch_collection(&session, &collection, order_by) => fetched,
                };

                let delay = match fetched {
                    Ok(documents) => {
                        failures = 0;
                        let marker: Vec<(String, Option<String>)> = documents
                            .iter()
                            .map(|document| (document.id.clone(), document.revision.clone()))
                            .collect();
                        if last_marker.as_ref() != Some(&marker) {
                            if !deliver(&sender, Ok(documents), &cancel_token).await {
                                break;
                            }
                            last_marker = Some(marker);
                        }
                        inner.poll_interval
                    }
                    Err(error) => {
                        let delay = poll_backoff(inner.poll_interval, failures, inner.clock.now_ms());
                        warn!(
                            %collection,
                            error = %error,
                            retry_in_ms = delay.as_millis() as u64,
                            "firestore query poll failed"
                        );
                        failures = failures.saturating_add(1);
                        last_marker = None;
                        if !deliver(&sender, Err(error), &cancel_token).await {
                            break;
                        }
                        delay
                    }
                };

                if !pause_or_stop(delay, &cancel_token, sender.closed()).await {
                    break;
                }
            }
            debug!(%collection, "firestore query poll stopped");
        });

        Ok(receiver)
    }

    async fn conditional_append(
        &self,
        session: &Session,
        request: ConditionalAppend,
    ) -> Result<AppendReceipt, StoreError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self
                .inner
                .fetch_document(session, &request.collection, &request.document_id)
                .await?;
            let now_ms = self.inner.clock.now_ms();
            check_append_precondition(current.as_ref(), request.bid.amount, now_ms)?;

            let Some(document) = current else {
                return Err(StoreError::NotFound(request.document_id));
            };
            let update_time = document.revision.clone().ok_or_else(|| {
                StoreError::Decode("document is missing updateTime".to_string())
            })?;
            let prior_bids = document.bids.as_ref().map(Vec::len).unwrap_or_default();

            let commit = build_commit_request(&self.inner.config, &request, update_time);
            match self.inner.commit(session, &commit).await {
                Ok(revision) => {
                    debug!(
                        collection = %request.collection,
                        document_id = %request.document_id,
                        amount = request.bid.amount,
                        attempt,
                        "firestore conditional append committed"
                    );
                    return Ok(AppendReceipt {
                        document_id: request.document_id,
                        current_bid: request.bid.amount,
                        bid_count: prior_bids + 1,
                        revision,
                    });
                }
                Err(StoreError::Conflict(message)) => {
                    debug!(
                        document_id = %request.document_id,
                        attempt,
                        %message,
                        "firestore document changed under commit; re-checking"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Err(StoreError::Conflict(format!(
            "auction {} kept changing during the write",
            request.document_id
        )))
    }

    async fn ping(&self, session: &Session, collection: &str) -> Result<(), StoreError> {
        let response = ping_request(&self.inner.client, &self.inner.config, session, collection)
            .send()
            .await?;
        let mut body = read_body(response).await?;
        let listed: ListDocumentsWire = simd_json::serde::from_slice(&mut body)?;
        debug!(collection, sampled = listed.documents.len(), "firestore reachable");
        Ok(())
    }
}
