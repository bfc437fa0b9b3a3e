//! Integration tests for the wallet memory core
//!
//! Run with: cargo test --test integration_test -- --nocapture
//!
//! Prerequisites for the ignored tests:
//! - Postgres running and DATABASE_URL set (migrations are applied)
//! - Redis running and REDIS_URL set

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;

use walletmem::cache::{keys, CacheService};
use walletmem::clock::system_clock;
use walletmem::config::{CacheConfig, RegistryConfig, UpstreamConfig};
use walletmem::crypto;
use walletmem::error::CoreError;
use walletmem::events::EventBus;
use walletmem::indexer::{Indexer, NullBatchFeed};
use walletmem::pnl::{consume_fifo, Lot, NullPriceSource};
use walletmem::registry::{RegisterParams, WalletRegistry};
use walletmem::risk::RiskEngine;
use walletmem::store;
use walletmem::types::{IndexingState, TxKind};
use walletmem::upstream::protocol::{parse_frame, InboundFrame};
use walletmem::upstream::{UpstreamClient, UpstreamTransaction};

mod helpers {
    use std::time::Duration;

    /// Test configuration loaded from environment variables
    pub struct TestConfig {
        pub database_url: String,
        pub redis_url: String,
    }

    impl TestConfig {
        /// Load test configuration from environment variables
        pub fn from_env() -> Option<Self> {
            Some(TestConfig {
                database_url: std::env::var("DATABASE_URL").ok()?,
                redis_url: std::env::var("REDIS_URL").ok()?,
            })
        }
    }

    /// Check database connectivity
    pub async fn check_database_connectivity(url: &str) -> bool {
        matches!(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await,
            Ok(_)
        )
    }

    /// Check redis connectivity
    pub async fn check_redis_connectivity(url: &str) -> bool {
        match redis::Client::open(url) {
            Ok(client) => client.get_async_connection().await.is_ok(),
            Err(_) => false,
        }
    }

    /// A fresh random base58 wallet address (43-44 chars)
    pub fn random_wallet() -> String {
        let bytes: [u8; 32] = rand::random();
        bs58::encode(bytes).into_string()
    }
}

/// Wired service set for the ignored end-to-end tests.
struct TestServices {
    db: sqlx::PgPool,
    cache: Arc<CacheService>,
    indexer: Arc<Indexer>,
    registry: Arc<WalletRegistry>,
}

const TEST_SALT: &str = "integration-test-salt-0123456789abcdef";

async fn wire_services(config: &helpers::TestConfig) -> TestServices {
    let db = store::create_pool(&config.database_url)
        .await
        .expect("database reachable");
    store::run_migrations(&db).await.expect("migrations apply");

    let clock = system_clock();
    let cache = CacheService::connect(
        &CacheConfig {
            url: config.redis_url.clone(),
            password: None,
            pool_min: 2,
            pool_max: 8,
            default_ttl_secs: 60,
            memory_pressure_threshold: 0.95,
        },
        clock.clone(),
    )
    .await
    .expect("redis reachable");

    let events = EventBus::new(clock.clone());
    let risk = Arc::new(RiskEngine::new(db.clone(), clock.clone()));
    let indexer = Indexer::new(
        db.clone(),
        Arc::clone(&cache),
        events,
        risk,
        Arc::new(NullPriceSource),
        Arc::new(NullBatchFeed),
        TEST_SALT.to_string(),
        clock,
    );

    // The upstream socket is never opened in these tests; subscribe calls
    // fail best-effort inside the registry.
    let (ingest_tx, _ingest_rx) = tokio::sync::mpsc::channel(8);
    let (upstream, _status) = UpstreamClient::new(
        UpstreamConfig {
            ws_url: "ws://127.0.0.1:1".to_string(),
            api_key: "test".to_string(),
        },
        ingest_tx,
    );

    let registry = WalletRegistry::new(
        db.clone(),
        upstream,
        Arc::clone(&indexer),
        RegistryConfig {
            auto_register: false,
            wallets: vec![],
        },
    );

    TestServices {
        db,
        cache,
        indexer,
        registry,
    }
}

fn feed_tx(wallet: &str, signature: &str, kind: TxKind, amount: f64) -> UpstreamTransaction {
    UpstreamTransaction {
        signature: signature.to_string(),
        wallet_address: wallet.to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        kind,
        amount,
        token_mint: "So11111111111111111111111111111111111111112".to_string(),
        metadata: serde_json::Map::new(),
    }
}

// ============================================================================
// Environment Tests (require running infrastructure)
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_environment_setup() {
    let config = helpers::TestConfig::from_env();
    assert!(
        config.is_some(),
        "Test configuration not found. Set DATABASE_URL and REDIS_URL"
    );

    let config = config.unwrap();

    assert!(
        helpers::check_database_connectivity(&config.database_url).await,
        "Failed to connect to database"
    );
    println!("Database OK");

    assert!(
        helpers::check_redis_connectivity(&config.redis_url).await,
        "Failed to connect to redis at {}",
        config.redis_url
    );
    println!("Redis OK");
}

#[tokio::test]
#[ignore]
async fn test_index_is_idempotent_on_signature() {
    let config = helpers::TestConfig::from_env().expect("Test configuration required");
    let services = wire_services(&config).await;

    let wallet = helpers::random_wallet();
    services
        .registry
        .register(RegisterParams::plain(&wallet))
        .await
        .expect("registration succeeds");

    let signature = format!("sig-{}", helpers::random_wallet());
    let tx = feed_tx(&wallet, &signature, TxKind::Transfer, 42.0);

    let first = services.indexer.index(&tx).await.unwrap();
    assert!(first.inserted);
    let second = services.indexer.index(&tx).await.unwrap();
    assert!(!second.inserted, "duplicate signature must coalesce");

    let stored = store::get_transaction(&services.db, &signature)
        .await
        .unwrap()
        .expect("row exists");
    assert_eq!(stored.wallet_address, wallet);

    // The counter counts distinct stored rows: one
    let registration = store::get_registration(&services.db, &wallet)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registration.transaction_count, 1);
    assert_eq!(registration.indexing_state, IndexingState::Active);

    let balances = store::get_balances(&services.db, &wallet).await.unwrap();
    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].amount, 42.0);
}

#[tokio::test]
#[ignore]
async fn test_privacy_round_trip() {
    let config = helpers::TestConfig::from_env().expect("Test configuration required");
    let services = wire_services(&config).await;

    let wallet = helpers::random_wallet();
    let other = helpers::random_wallet();
    services
        .registry
        .register(RegisterParams {
            address: wallet.clone(),
            privacy: true,
            label: None,
            agent_id: None,
        })
        .await
        .unwrap();

    let mut tx = feed_tx(&wallet, &format!("sig-{}", helpers::random_wallet()), TxKind::Transfer, 100.5);
    tx.metadata = json!({"counterparty": "Cpty", "fee": 0.000005})
        .as_object()
        .cloned()
        .unwrap();

    services.indexer.index(&tx).await.unwrap();

    let stored = store::get_transaction(&services.db, &tx.signature)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_privacy);
    assert!(stored.amount.is_none());
    assert!(stored.counterparty.is_none());
    assert!(stored.metadata.is_none());
    let blob_value = stored.encrypted_payload.expect("blob present");
    let blob: crypto::EncryptedBlob = serde_json::from_value(blob_value).unwrap();

    let payload = crypto::decrypt_payload(&blob, &wallet, TEST_SALT).unwrap();
    assert_eq!(payload.amount, 100.5);
    assert_eq!(payload.counterparty.as_deref(), Some("Cpty"));

    let err = crypto::decrypt_payload(&blob, &other, TEST_SALT).unwrap_err();
    assert!(matches!(err, CoreError::DecryptionFailed(_)));
}

#[tokio::test]
#[ignore]
async fn test_index_invalidates_wallet_keys() {
    let config = helpers::TestConfig::from_env().expect("Test configuration required");
    let services = wire_services(&config).await;

    let wallet = helpers::random_wallet();
    services
        .registry
        .register(RegisterParams::plain(&wallet))
        .await
        .unwrap();

    let key = keys::balances_key(&wallet);
    services
        .cache
        .set(&key, "[\"stale\"]", Some(300))
        .await
        .unwrap();
    assert!(services.cache.exists(&key).await.unwrap());

    let tx = feed_tx(&wallet, &format!("sig-{}", helpers::random_wallet()), TxKind::Transfer, 1.0);
    services.indexer.index(&tx).await.unwrap();

    assert!(
        !services.cache.exists(&key).await.unwrap(),
        "commit must purge the wallet key family"
    );
}

#[tokio::test]
#[ignore]
async fn test_unregister_preserves_history() {
    let config = helpers::TestConfig::from_env().expect("Test configuration required");
    let services = wire_services(&config).await;

    let wallet = helpers::random_wallet();
    services
        .registry
        .register(RegisterParams::plain(&wallet))
        .await
        .unwrap();

    let tx = feed_tx(&wallet, &format!("sig-{}", helpers::random_wallet()), TxKind::Transfer, 5.0);
    services.indexer.index(&tx).await.unwrap();

    services.registry.unregister(&wallet).await.unwrap();

    let registration = store::get_registration(&services.db, &wallet)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registration.indexing_state, IndexingState::Paused);

    // Every historical row survives
    assert!(store::get_transaction(&services.db, &tx.signature)
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        store::get_balances(&services.db, &wallet).await.unwrap().len(),
        1
    );
}

// ============================================================================
// Scenario Tests (no infrastructure required)
// ============================================================================

#[test]
fn test_cache_key_param_order_equivalence() {
    let a: keys::Params = json!({"page": 1, "size": 50, "type": "swap"})
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let b: keys::Params = json!({"type": "swap", "size": 50, "page": 1})
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let c: keys::Params = json!({"page": 2, "size": 50, "type": "swap"})
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let key_a = keys::wallet_key("A", "transactions", Some(&a));
    let key_b = keys::wallet_key("A", "transactions", Some(&b));
    let key_c = keys::wallet_key("A", "transactions", Some(&c));

    assert_eq!(key_a, key_b, "key order must not matter");
    assert_ne!(key_a, key_c, "different parameters must derive different keys");
}

#[test]
fn test_fifo_consumption_scenario() {
    // Lots (100 @ 10), (50 @ 12), (75 @ 11); sell 120 @ 15
    let lots = vec![
        Lot { id: 1, remaining: 100.0, cost_per_token: 10.0 },
        Lot { id: 2, remaining: 50.0, cost_per_token: 12.0 },
        Lot { id: 3, remaining: 75.0, cost_per_token: 11.0 },
    ];
    let consumption = consume_fifo(&lots, 120.0);

    assert_eq!(consumption.consumed_cost, 1240.0);
    let realized = 120.0 * 15.0 - consumption.consumed_cost;
    assert_eq!(realized, 560.0);

    // Remaining inventory: (30 @ 12), (75 @ 11)
    assert_eq!(consumption.updates.len(), 2);
    assert_eq!(consumption.updates[0].remaining, 0.0);
    assert_eq!(consumption.updates[1].remaining, 30.0);
}

#[test]
fn test_encryption_rejects_tamper_and_wrong_wallet() {
    let wallet = helpers::random_wallet();
    let other = helpers::random_wallet();
    let payload = crypto::PrivatePayload {
        amount: 1.5,
        counterparty: Some("Cpty".to_string()),
        token_mint: "Mint11111111111111111111111111111111111111".to_string(),
        metadata: serde_json::Map::new(),
    };

    let blob = crypto::encrypt_payload(&payload, &wallet, TEST_SALT).unwrap();
    assert_eq!(
        crypto::decrypt_payload(&blob, &wallet, TEST_SALT).unwrap(),
        payload
    );

    assert!(crypto::decrypt_payload(&blob, &other, TEST_SALT).is_err());

    let mut tampered = blob;
    let mut raw = hex::decode(&tampered.ciphertext).unwrap();
    raw[0] ^= 0x01;
    tampered.ciphertext = hex::encode(raw);
    assert!(crypto::decrypt_payload(&tampered, &wallet, TEST_SALT).is_err());
}

#[test]
fn test_inbound_frame_validation() {
    let valid = json!({
        "type": "transaction",
        "data": {
            "signature": "s1",
            "walletAddress": "W",
            "timestamp": 1717243200,
            "type": "swap",
            "amount": -3.0,
            "tokenMint": "M",
        }
    });
    assert!(matches!(
        parse_frame(&valid.to_string()).unwrap(),
        InboundFrame::Transaction(_)
    ));

    let missing_amount = json!({
        "type": "transaction",
        "data": {
            "signature": "s1",
            "walletAddress": "W",
            "timestamp": 1717243200,
            "type": "swap",
            "tokenMint": "M",
        }
    });
    assert!(parse_frame(&missing_amount.to_string()).is_err());
}

#[test]
fn test_balance_delta_per_kind() {
    assert_eq!(TxKind::Transfer.balance_delta(10.0), 10.0);
    assert_eq!(TxKind::Stake.balance_delta(10.0), -10.0);
    assert_eq!(TxKind::Unstake.balance_delta(-10.0), 10.0);
    assert_eq!(TxKind::Vote.balance_delta(10.0), 0.0);
}
