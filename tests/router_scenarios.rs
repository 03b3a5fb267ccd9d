//! End-to-end router scenarios against scripted vendors, an in-memory offer
//! index and an in-memory key-value store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use numbroker_backend::health::{CircuitState, HealthConfig, HealthMetrics, HealthMonitor};
use numbroker_backend::index::{MemoryIndex, SearchIndex};
use numbroker_backend::models::{ActivationState, BuyOptions, Offer, Vendor};
use numbroker_backend::providers::ErrorKind;
use numbroker_backend::router::{ProviderFactory, RouterConfig, RouterError, SmartRouter};
use numbroker_backend::storage::{MemoryKv, Storage};
use numbroker_backend::test_support::{offer_fixture, vendor_fixture, ScriptedProvider};

struct Harness {
    router: SmartRouter,
    health: Arc<HealthMonitor>,
    providers: HashMap<String, Arc<ScriptedProvider>>,
}

async fn build_harness(
    vendors: Vec<(Vendor, ScriptedProvider)>,
    offers: Vec<Offer>,
    health_config: HealthConfig,
) -> Harness {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let kv = Arc::new(MemoryKv::new());
    let metrics = Arc::new(HealthMetrics::new());
    let health = Arc::new(HealthMonitor::new(kv.clone(), health_config, metrics));
    let index = Arc::new(MemoryIndex::new());

    let mut providers: HashMap<String, Arc<ScriptedProvider>> = HashMap::new();
    for (vendor, provider) in vendors {
        storage.insert_vendor(&vendor).unwrap();
        providers.insert(vendor.name.clone(), Arc::new(provider.with_vendor(vendor)));
    }

    index.upsert_offers(&offers).await.unwrap();

    let factory: ProviderFactory = {
        let providers = providers.clone();
        Arc::new(move |vendor: &Vendor| {
            providers
                .get(&vendor.name)
                .cloned()
                .map(|p| -> Arc<dyn numbroker_backend::providers::Provider> { p })
                .ok_or_else(|| anyhow::anyhow!("no scripted provider for {}", vendor.name))
        })
    };

    let router = SmartRouter::new(
        storage,
        kv,
        health.clone(),
        index,
        factory,
        RouterConfig::default(),
    );
    Harness {
        router,
        health,
        providers,
    }
}

fn calls(harness: &Harness, slug: &str) -> Vec<String> {
    harness.providers[slug].calls()
}

fn vendor_with_priority(slug: &str, priority: i64) -> Vendor {
    let mut vendor = vendor_fixture(slug);
    vendor.priority = priority;
    vendor
}

#[tokio::test]
async fn purchase_fails_over_on_no_stock() {
    // The index still believes vendor `a` has stock; the live buy disagrees.
    let mut offer_a = offer_fixture("a", "in", "whatsapp", 1.0);
    offer_a.stock = 10;
    let mut offer_b = offer_fixture("b", "in", "whatsapp", 1.2);
    offer_b.stock = 5;
    let mut offer_c = offer_fixture("c", "in", "whatsapp", 1.5);
    offer_c.stock = 9;

    let harness = build_harness(
        vec![
            (
                vendor_with_priority("a", 1),
                ScriptedProvider::new("a").with_buy_err(ErrorKind::NoStock),
            ),
            (
                vendor_with_priority("b", 2),
                ScriptedProvider::new("b").with_buy_ok("xyz", "+14155550101"),
            ),
            (
                vendor_with_priority("c", 3),
                ScriptedProvider::new("c").with_buy_ok("zzz", "+14155550102"),
            ),
        ],
        vec![offer_a, offer_b, offer_c],
        HealthConfig::default(),
    )
    .await;

    let purchase = harness
        .router
        .buy("in", "whatsapp", &BuyOptions::default())
        .await
        .unwrap();

    assert_eq!(purchase.activation_id, "b:xyz");
    assert_eq!(purchase.vendor, "b");
    assert_eq!(purchase.phone_number, "+14155550101");
    assert_eq!(purchase.sell_price, 1.2);
    assert_eq!(
        numbroker_backend::router::parse_activation_id(&purchase.activation_id),
        Some(("b", "xyz"))
    );

    // a attempted and failed, b attempted and succeeded, c untouched.
    assert_eq!(calls(&harness, "a"), vec!["buy:in:whatsapp"]);
    assert_eq!(calls(&harness, "b"), vec!["buy:in:whatsapp"]);
    assert!(calls(&harness, "c").is_empty());

    // Health recorded one failure on a and one success on b.
    assert!(harness.health.success_rate("a", None).unwrap() < 1.0);
    assert_eq!(harness.health.success_rate("b", None), Some(1.0));
}

#[tokio::test]
async fn no_stock_everywhere_is_distinct_from_all_failed() {
    let harness = build_harness(
        vec![
            (
                vendor_with_priority("a", 1),
                ScriptedProvider::new("a").with_buy_err(ErrorKind::NoStock),
            ),
            (
                vendor_with_priority("b", 2),
                ScriptedProvider::new("b").with_buy_err(ErrorKind::NoStock),
            ),
        ],
        vec![
            offer_fixture("a", "us", "telegram", 1.0),
            offer_fixture("b", "us", "telegram", 1.1),
        ],
        HealthConfig::default(),
    )
    .await;

    let err = harness
        .router
        .buy("us", "telegram", &BuyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::NoStock { .. }));

    // Mixed failures surface the composite error listing attempts instead.
    let harness = build_harness(
        vec![
            (
                vendor_with_priority("a", 1),
                ScriptedProvider::new("a").with_buy_err(ErrorKind::NoStock),
            ),
            (
                vendor_with_priority("b", 2),
                ScriptedProvider::new("b").with_buy_err(ErrorKind::ServerError),
            ),
        ],
        vec![
            offer_fixture("a", "us", "telegram", 1.0),
            offer_fixture("b", "us", "telegram", 1.1),
        ],
        HealthConfig::default(),
    )
    .await;
    let err = harness
        .router
        .buy("us", "telegram", &BuyOptions::default())
        .await
        .unwrap_err();
    match err {
        RouterError::AllFailed { attempted } => {
            assert_eq!(attempted, vec!["a".to_string(), "b".to_string()])
        }
        other => panic!("expected AllFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn pinned_vendor_gets_exactly_one_attempt() {
    let harness = build_harness(
        vec![
            (
                vendor_with_priority("a", 1),
                ScriptedProvider::new("a").with_buy_ok("111", "+1"),
            ),
            (
                vendor_with_priority("b", 2),
                ScriptedProvider::new("b").with_buy_err(ErrorKind::NoStock),
            ),
        ],
        vec![
            offer_fixture("a", "us", "whatsapp", 0.5),
            offer_fixture("b", "us", "whatsapp", 0.9),
        ],
        HealthConfig::default(),
    )
    .await;

    let opts = BuyOptions {
        vendor: Some("b".to_string()),
        ..BuyOptions::default()
    };
    let err = harness.router.buy("us", "whatsapp", &opts).await.unwrap_err();

    // No failover past the pinned vendor, even though `a` would succeed.
    assert!(matches!(err, RouterError::Provider(ref e) if e.kind == ErrorKind::NoStock));
    assert_eq!(calls(&harness, "b"), vec!["buy:us:whatsapp"]);
    assert!(calls(&harness, "a").is_empty());

    let err = harness
        .router
        .buy(
            "us",
            "whatsapp",
            &BuyOptions {
                vendor: Some("ghost".to_string()),
                ..BuyOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownVendor(ref v) if v == "ghost"));
}

#[tokio::test]
async fn open_circuit_excludes_vendor_from_routing() {
    let harness = build_harness(
        vec![
            (
                vendor_with_priority("a", 1),
                ScriptedProvider::new("a").with_buy_ok("111", "+1"),
            ),
            (
                vendor_with_priority("b", 2),
                ScriptedProvider::new("b").with_buy_ok("222", "+2"),
            ),
        ],
        vec![
            offer_fixture("a", "us", "whatsapp", 0.5),
            offer_fixture("b", "us", "whatsapp", 0.9),
        ],
        HealthConfig::default(),
    )
    .await;

    harness.health.force_open("a");
    let purchase = harness
        .router
        .buy("us", "whatsapp", &BuyOptions::default())
        .await
        .unwrap();
    assert_eq!(purchase.vendor, "b");
    assert!(calls(&harness, "a").is_empty());
}

#[tokio::test]
async fn bad_credentials_trips_circuit_and_recovers_to_half_open() {
    let harness = build_harness(
        vec![(
            vendor_with_priority("d", 1),
            ScriptedProvider::new("d").with_buy_err(ErrorKind::BadCredentials),
        )],
        vec![offer_fixture("d", "us", "whatsapp", 1.0)],
        HealthConfig {
            base_open_duration: Duration::from_millis(40),
            ..HealthConfig::default()
        },
    )
    .await;

    let _ = harness
        .router
        .buy("us", "whatsapp", &BuyOptions::default())
        .await;

    // Systemic error: the very next availability check says no.
    assert!(!harness.health.is_available("d"));
    assert_eq!(harness.health.circuit_state("d"), CircuitState::Open);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.health.circuit_state("d"), CircuitState::HalfOpen);
}

#[tokio::test]
async fn quotes_leak_no_admin_economics() {
    let mut expensive = offer_fixture("a", "us", "telegram", 2.0);
    expensive.stock = 3;
    let mut cheap = offer_fixture("b", "us", "telegram", 1.4);
    cheap.stock = 8;
    let mut vendor_a = vendor_with_priority("a", 1);
    vendor_a.weight = 7.5;
    vendor_a.price_multiplier = 1.9;

    let harness = build_harness(
        vec![
            (vendor_a, ScriptedProvider::new("a")),
            (vendor_with_priority("b", 2), ScriptedProvider::new("b")),
        ],
        vec![expensive, cheap],
        HealthConfig::default(),
    )
    .await;

    // a: mixed outcomes keeps the circuit closed but the rate below 0.8.
    for _ in 0..3 {
        harness
            .health
            .record_outcome("a", None, true, 100, None);
        harness
            .health
            .record_outcome("a", None, false, 100, Some(ErrorKind::ServerError));
    }
    // b: all successes, decayed rate stays above 0.8.
    for _ in 0..5 {
        harness.health.record_outcome("b", None, true, 100, None);
    }

    let quotes = harness
        .router
        .get_ranked_providers("us", "telegram")
        .await
        .unwrap();
    assert_eq!(quotes.len(), 2);

    let payload = serde_json::to_string(&quotes).unwrap();
    assert!(!payload.contains("weight"));
    assert!(!payload.to_lowercase().contains("multiplier"));

    let by_provider: HashMap<&str, &numbroker_backend::router::PublicQuote> = quotes
        .iter()
        .map(|q| (q.provider.as_str(), q))
        .collect();
    assert_eq!(by_provider["B"].reliability, "High");
    assert_eq!(by_provider["A"].reliability, "Medium");
    assert!(quotes.iter().all(|q| q.stock > 0));

    // Ranks are 1-based and unique.
    let mut ranks: Vec<u32> = quotes.iter().map(|q| q.rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![1, 2]);
}

#[tokio::test]
async fn activation_id_dispatch_contacts_only_the_named_vendor() {
    let harness = build_harness(
        vec![
            (
                vendor_with_priority("g", 1),
                ScriptedProvider::new("g")
                    .with_status(ActivationState::SmsReceived, vec!["code 1234"]),
            ),
            (
                vendor_with_priority("h", 2),
                ScriptedProvider::new("h")
                    .with_status(ActivationState::WaitingSms, vec![]),
            ),
        ],
        vec![],
        HealthConfig::default(),
    )
    .await;

    let status = harness.router.status("g:42").await.unwrap();
    assert_eq!(status.state, ActivationState::SmsReceived);
    assert_eq!(status.sms, vec!["code 1234".to_string()]);
    assert_eq!(calls(&harness, "g"), vec!["status:42".to_string()]);
    assert!(calls(&harness, "h").is_empty());

    // Unknown vendor prefix: the error names the missing vendor.
    let err = harness.router.status("z:42").await.unwrap_err();
    assert!(matches!(err, RouterError::UnknownVendor(ref v) if v == "z"));
    assert!(err.to_string().contains("z"));
}

#[tokio::test]
async fn missing_prefix_probes_vendors_in_priority_order() {
    let harness = build_harness(
        vec![
            (vendor_with_priority("a", 2), ScriptedProvider::new("a")),
            (
                vendor_with_priority("b", 1),
                ScriptedProvider::new("b")
                    .with_status(ActivationState::WaitingSms, vec![]),
            ),
        ],
        vec![],
        HealthConfig::default(),
    )
    .await;

    // "42" has no legal prefix; b (priority 1) answers first.
    let status = harness.router.status("42").await.unwrap();
    assert_eq!(status.state, ActivationState::WaitingSms);
    assert_eq!(calls(&harness, "b"), vec!["status:42".to_string()]);
    assert!(calls(&harness, "a").is_empty());
}

#[tokio::test]
async fn lifecycle_ops_dispatch_by_prefix() {
    let harness = build_harness(
        vec![
            (vendor_with_priority("g", 1), ScriptedProvider::new("g")),
            (vendor_with_priority("h", 2), ScriptedProvider::new("h")),
        ],
        vec![],
        HealthConfig::default(),
    )
    .await;

    harness.router.cancel("h:7").await.unwrap();
    harness.router.resend("h:7").await.unwrap();
    harness.router.complete("h:7").await.unwrap();
    assert_eq!(
        calls(&harness, "h"),
        vec![
            "cancel:7".to_string(),
            "resend:7".to_string(),
            "complete:7".to_string()
        ]
    );
    assert!(calls(&harness, "g").is_empty());
}

#[tokio::test]
async fn balance_sums_active_vendors_with_failures_as_zero() {
    let harness = build_harness(
        vec![
            (
                vendor_with_priority("a", 1),
                ScriptedProvider::new("a").with_balance(10.5),
            ),
            (
                vendor_with_priority("b", 2),
                ScriptedProvider::new("b").all_failing(),
            ),
            (
                vendor_with_priority("c", 3),
                ScriptedProvider::new("c").with_balance(4.5),
            ),
        ],
        vec![],
        HealthConfig::default(),
    )
    .await;

    let total = harness.router.total_balance().await.unwrap();
    assert_eq!(total, 15.0);
}

#[tokio::test]
async fn selected_vendor_has_best_pre_attempt_score() {
    // b is cheaper and better stocked at equal priority, so it must be
    // attempted before a.
    let mut offer_a = offer_fixture("a", "us", "whatsapp", 3.0);
    offer_a.stock = 2;
    let mut offer_b = offer_fixture("b", "us", "whatsapp", 1.0);
    offer_b.stock = 50;

    let harness = build_harness(
        vec![
            (
                vendor_with_priority("a", 1),
                ScriptedProvider::new("a").with_buy_ok("aaa", "+1"),
            ),
            (
                vendor_with_priority("b", 1),
                ScriptedProvider::new("b").with_buy_ok("bbb", "+2"),
            ),
        ],
        vec![offer_a, offer_b],
        HealthConfig::default(),
    )
    .await;

    let purchase = harness
        .router
        .buy("us", "whatsapp", &BuyOptions::default())
        .await
        .unwrap();
    assert_eq!(purchase.vendor, "b");
    assert!(calls(&harness, "a").is_empty());
}
