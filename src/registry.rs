//! Wallet lifecycle.
//!
//! Registering a wallet creates the store record (state pending), subscribes
//! upstream best-effort, and kicks off an asynchronous history backfill.
//! Unregistering pauses: every historical row is preserved. Bulk
//! registration is all-or-nothing and aborts before any write on duplicate
//! input.

use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::cache::{CacheService, WarmReport};
use crate::config::RegistryConfig;
use crate::indexer::Indexer;
use crate::store;
use crate::store::{NewWalletRegistration, WalletRegistration};
use crate::types::{IndexingState, WalletAddress};
use crate::upstream::UpstreamClient;

/// Registration request.
#[derive(Debug, Clone)]
pub struct RegisterParams {
    pub address: String,
    pub privacy: bool,
    pub label: Option<String>,
    pub agent_id: Option<String>,
}

impl RegisterParams {
    pub fn plain(address: &str) -> Self {
        Self {
            address: address.to_string(),
            privacy: false,
            label: None,
            agent_id: None,
        }
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<IndexingState>,
    pub privacy: Option<bool>,
    pub agent_id: Option<String>,
}

pub struct WalletRegistry {
    db: PgPool,
    upstream: Arc<UpstreamClient>,
    indexer: Arc<Indexer>,
    config: RegistryConfig,
}

impl WalletRegistry {
    pub fn new(
        db: PgPool,
        upstream: Arc<UpstreamClient>,
        indexer: Arc<Indexer>,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            upstream,
            indexer,
            config,
        })
    }

    /// Register one wallet. Refuses an already-registered address. The
    /// upstream subscribe is best effort; the backfill runs detached.
    pub async fn register(&self, params: RegisterParams) -> Result<WalletRegistration> {
        let address = WalletAddress::parse(&params.address)
            .map_err(|e| eyre!("invalid wallet address: {}", e))?;

        let new = NewWalletRegistration {
            address: address.as_str().to_string(),
            is_privacy: params.privacy,
            label: params.label,
            agent_id: params.agent_id,
        };
        let inserted = store::insert_registration(&self.db, &new).await?;
        if !inserted {
            return Err(eyre!("wallet {} is already registered", address));
        }
        info!(wallet = %address, privacy = new.is_privacy, "Wallet registered");

        // Subscription failure must not fail the registration; the
        // reconnect path re-issues the authoritative set anyway.
        if let Err(e) = self.upstream.subscribe(address.as_str()).await {
            warn!(wallet = %address, error = %e, "Upstream subscribe failed at registration");
        }

        let indexer = Arc::clone(&self.indexer);
        let backfill_address = address.as_str().to_string();
        tokio::spawn(async move {
            match indexer.backfill(&backfill_address).await {
                Ok(summary) if summary.indexed > 0 => {
                    info!(
                        wallet = %backfill_address,
                        indexed = summary.indexed,
                        "Backfill complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(wallet = %backfill_address, error = %e, "Backfill failed"),
            }
        });

        store::get_registration(&self.db, address.as_str())
            .await?
            .ok_or_else(|| eyre!("registration vanished after insert"))
    }

    /// Pause a wallet. History is never deleted; the registration moves to
    /// paused and the upstream subscription is dropped best-effort.
    pub async fn unregister(&self, address: &str) -> Result<()> {
        let registration = store::get_registration(&self.db, address)
            .await?
            .ok_or_else(|| eyre!("wallet {} is not registered", address))?;

        if let Err(e) = self.upstream.unsubscribe(&registration.address).await {
            warn!(wallet = %address, error = %e, "Upstream unsubscribe failed");
        }

        store::set_registration_state(&self.db, address, IndexingState::Paused, None).await?;
        info!(wallet = %address, "Wallet paused");
        Ok(())
    }

    pub async fn get(&self, address: &str) -> Result<Option<WalletRegistration>> {
        store::get_registration(&self.db, address).await
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Vec<WalletRegistration>> {
        store::list_registrations(
            &self.db,
            filter.state,
            filter.privacy,
            filter.agent_id.as_deref(),
        )
        .await
    }

    /// All-or-nothing bulk registration: validates every address, refuses
    /// duplicates within the batch and addresses already registered, all
    /// before the first write. The inserts commit in one transaction.
    pub async fn register_bulk(&self, addresses: &[String]) -> Result<Vec<WalletRegistration>> {
        let mut validated = Vec::with_capacity(addresses.len());
        for raw in addresses {
            let address = WalletAddress::parse(raw)
                .map_err(|e| eyre!("invalid wallet address '{}': {}", raw, e))?;
            if validated.contains(&address) {
                return Err(eyre!("duplicate address {} in bulk request", address));
            }
            validated.push(address);
        }

        for address in &validated {
            if store::get_registration(&self.db, address.as_str())
                .await?
                .is_some()
            {
                return Err(eyre!(
                    "wallet {} is already registered; bulk request aborted",
                    address
                ));
            }
        }

        let mut dbtx = self
            .db
            .begin()
            .await
            .wrap_err("Failed to open bulk registration transaction")?;
        for address in &validated {
            sqlx::query(
                r#"INSERT INTO wallet_registrations (address) VALUES ($1)"#,
            )
            .bind(address.as_str())
            .execute(&mut *dbtx)
            .await
            .wrap_err_with(|| format!("Failed to insert registration for {}", address))?;
        }
        dbtx.commit()
            .await
            .wrap_err("Failed to commit bulk registration")?;

        info!(count = validated.len(), "Bulk registration complete");

        for address in &validated {
            if let Err(e) = self.upstream.subscribe(address.as_str()).await {
                warn!(wallet = %address, error = %e, "Upstream subscribe failed after bulk insert");
            }
        }

        let mut registered = Vec::with_capacity(validated.len());
        for address in &validated {
            if let Some(registration) =
                store::get_registration(&self.db, address.as_str()).await?
            {
                registered.push(registration);
            }
        }
        Ok(registered)
    }

    /// Register the configured wallet list. Per-address failures are logged
    /// and never abort the batch. Returns the count newly registered.
    pub async fn auto_register(&self) -> usize {
        if !self.config.auto_register {
            return 0;
        }
        let mut registered = 0usize;
        for address in &self.config.wallets {
            match store::get_registration(&self.db, address).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    error!(wallet = %address, error = %e, "Auto-register lookup failed");
                    continue;
                }
            }
            match self.register(RegisterParams::plain(address)).await {
                Ok(_) => registered += 1,
                Err(e) => error!(wallet = %address, error = %e, "Auto-register failed"),
            }
        }
        info!(registered, "Auto-registration pass complete");
        registered
    }

    /// Auto-register, then warm the cache for the full configured set
    /// (including wallets registered on earlier runs).
    pub async fn auto_register_and_warm(
        &self,
        cache: &Arc<CacheService>,
    ) -> (usize, WarmReport) {
        let registered = self.auto_register().await;
        let report = cache.warm(&self.db, &self.config.wallets).await;
        (registered, report)
    }
}
