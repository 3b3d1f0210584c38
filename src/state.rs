use crate::auction::clock::{Clock, ClockTickSource, SystemClock};
use crate::config::{ClientConfig, StoreBackend};
use crate::db::initialize_pool;
use crate::error::AppError;
use crate::session::Session;
use crate::store::firestore::FirestoreDocumentStore;
use crate::store::memory::MemoryDocumentStore;
use crate::store::sqlite::SqliteDocumentStore;
use crate::store::DocumentStore;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Everything a host keeps for the lifetime of the client: config, the
/// authoritative store, the shared clock and tick source, and the signed-in
/// session. Views are created from it and own their own subscriptions.
pub struct ClientState {
    pub started_at: Instant,
    pub config: ClientConfig,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn DocumentStore>,
    pub ticks: ClockTickSource,
    session: RwLock<Session>,
}

impl ClientState {
    pub async fn initialize(config: ClientConfig) -> Result<Self, AppError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now_ms = clock.now_ms();

        let store: Arc<dyn DocumentStore> = match config.backend {
            StoreBackend::Memory => {
                let store = MemoryDocumentStore::new(Arc::clone(&clock));
                if config.seed_demo_data {
                    store.seed_demo_auctions(&config.collection, now_ms);
                }
                Arc::new(store)
            }
            StoreBackend::Sqlite => {
                let pool = initialize_pool(&config).await?;
                let store = SqliteDocumentStore::new(pool, Arc::clone(&clock));
                if config.seed_demo_data {
                    store.seed_demo_auctions(&config.collection, now_ms).await?;
                }
                Arc::new(store)
            }
            StoreBackend::Firestore => {
                let firestore = config.firestore.clone().ok_or_else(|| {
                    AppError::InvalidArgument(
                        "firestore backend selected without firestore settings".to_string(),
                    )
                })?;
                Arc::new(FirestoreDocumentStore::new(
                    firestore,
                    Duration::from_millis(config.poll_interval_ms),
                    Arc::clone(&clock),
                )?)
            }
        };

        info!(
            backend = store.backend_name(),
            collection = %config.collection,
            "client state initialized"
        );
        Ok(Self::with_store(config, store, clock))
    }

    /// Builds state around an existing store and clock. Must be called
    /// inside a tokio runtime because it starts the tick source.
    pub fn with_store(config: ClientConfig, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        let ticks = ClockTickSource::start(
            Arc::clone(&clock),
            Duration::from_millis(config.tick_interval_ms),
        );

        Self {
            started_at: Instant::now(),
            config,
            clock,
            store,
            ticks,
            session: RwLock::new(Session::anonymous()),
        }
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    /// Replaces the session for views opened from now on. Open views keep the
    /// session they were created with.
    pub fn set_session(&self, session: Session) {
        info!(
            authenticated = session.is_authenticated(),
            role = ?session.role,
            "session changed"
        );
        *self.session.write() = session;
    }

    pub async fn shutdown(self) {
        self.ticks.shutdown().await;
        info!("client state shut down");
    }
}
