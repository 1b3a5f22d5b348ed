//! End-to-end transfer scenarios over the in-memory store and registry.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use xfer_engine::account::{Account, AccountId, AccountKind, LimitsConfig, MemoryRegistry};
use xfer_engine::amount::StatsMap;
use xfer_engine::config::EngineConfig;
use xfer_engine::domain::{
    DepositService, Domain, GamingService, PaymentService, RetailService,
};
use xfer_engine::limits::LimitDomain;
use xfer_engine::xfer::outbox::mock::MockGateway;
use xfer_engine::xfer::{
    CancelRequest, Direction, FeeRequest, MemoryStore, OpResult, OutboxConfig, OutboxStatus,
    OutboxWorker, PeerOp, XferEngine, XferError, XferRecord, XferRef, XferRequest, XferStatus,
    make_ext_id,
};

const EUR: &str = "I:EUR";
const USD: &str = "I:USD";
const GROUP: &str = "default";

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn limits(pairs: &[(&str, &str)]) -> StatsMap {
    pairs.iter().map(|(k, v)| (k.to_string(), d(v))).collect()
}

fn flag(rec: &XferRecord, key: &str) -> bool {
    rec.misc_data.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

struct Fixture {
    store: MemoryStore,
    registry: Arc<MemoryRegistry>,
    engine: Arc<XferEngine>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let store = MemoryStore::new();
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_currency(EUR, 2);
        registry.add_currency(USD, 2);
        for domain in LimitDomain::ALL {
            registry.set_limits(
                GROUP,
                domain,
                LimitsConfig {
                    currency: EUR.into(),
                    ..Default::default()
                },
            );
        }

        let engine = Arc::new(XferEngine::new(
            Arc::new(store.clone()),
            registry.clone(),
            config,
        ));
        Self {
            store,
            registry,
            engine,
        }
    }

    fn hard_limit(&self, domain: LimitDomain, key: &str, value: &str) {
        let mut hard = BTreeMap::new();
        hard.insert(key.to_string(), d(value));
        self.registry.set_limits(
            GROUP,
            domain,
            LimitsConfig {
                currency: EUR.into(),
                hard,
                ..Default::default()
            },
        );
    }

    async fn open(&self, currency: &str, kind: AccountKind, balance: &str) -> AccountId {
        let holder = self.registry.add_holder(GROUP);
        let mut acct = Account::new(holder, currency, 2, kind);
        acct.balance = d(balance);
        if kind == AccountKind::System {
            acct.overdraft = d("1000000");
        }
        self.store.add_account(acct).await
    }

    async fn user(&self, balance: &str) -> AccountId {
        self.open(EUR, AccountKind::Regular, balance).await
    }

    async fn system(&self) -> AccountId {
        self.open(EUR, AccountKind::System, "0").await
    }

    async fn acct(&self, id: &AccountId) -> Account {
        self.store.account(id).await.unwrap()
    }

    async fn counter(&self, id: &AccountId, domain: LimitDomain, key: &str) -> Decimal {
        let holder = self.acct(id).await.holder;
        self.store
            .stats(&holder, domain)
            .await
            .and_then(|row| row.stats.get(key).copied())
            .unwrap_or_default()
    }
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn qa_deposit_replay_posts_once() {
    let fx = Fixture::new();
    let user = fx.user("0").await;
    let system = fx.system().await;
    let deposits = DepositService::new(fx.engine.clone());

    let first = deposits
        .on_deposit(&user, &system, EUR, "0.60", "T1", None)
        .await
        .unwrap();
    let second = deposits
        .on_deposit(&user, &system, EUR, "0.60", "T1", None)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.status, XferStatus::Done);
    assert_eq!(fx.store.xfer_count().await, 1);
    assert_eq!(fx.acct(&user).await.balance, d("0.60"));
    assert_eq!(fx.acct(&system).await.balance, d("-0.60"));
}

#[tokio::test]
async fn qa_concurrent_replays_share_one_row() {
    let fx = Fixture::new();
    let user = fx.user("0").await;
    let system = fx.system().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let deposits = DepositService::new(fx.engine.clone());
        let (user, system) = (user.clone(), system.clone());
        handles.push(tokio::spawn(async move {
            deposits
                .on_deposit(&user, &system, EUR, "0.60", "T-race", None)
                .await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(fx.store.xfer_count().await, 1);
    assert_eq!(fx.acct(&user).await.balance, d("0.60"));
}

#[tokio::test]
async fn qa_replay_with_different_amount_is_mismatch() {
    let fx = Fixture::new();
    let user = fx.user("0").await;
    let system = fx.system().await;
    let deposits = DepositService::new(fx.engine.clone());

    deposits
        .on_deposit(&user, &system, EUR, "0.60", "T2", None)
        .await
        .unwrap();
    let replay = deposits
        .on_deposit(&user, &system, EUR, "0.61", "T2", None)
        .await;

    assert!(matches!(replay, Err(XferError::OriginalMismatch(_))));
    assert_eq!(fx.acct(&user).await.balance, d("0.60"));
}

#[tokio::test]
async fn qa_replay_is_answered_past_the_history_barrier() {
    let fx = Fixture::new();
    let user = fx.user("0").await;
    let system = fx.system().await;
    let orig_ts = Utc::now() - Duration::days(20);

    let first = DepositService::new(fx.engine.clone())
        .on_deposit(&user, &system, EUR, "0.60", "T4", Some(orig_ts))
        .await
        .unwrap();

    // same ledger, barrier tightened after the deposit was recorded
    let strict = Arc::new(XferEngine::new(
        Arc::new(fx.store.clone()),
        fx.registry.clone(),
        EngineConfig {
            history_barrier_days: 10,
            ..EngineConfig::default()
        },
    ));
    let deposits = DepositService::new(strict);

    let replay = deposits
        .on_deposit(&user, &system, EUR, "0.60", "T4", Some(orig_ts))
        .await
        .unwrap();
    assert_eq!(replay.id, first.id);
    assert_eq!(fx.store.xfer_count().await, 1);
    assert_eq!(fx.acct(&user).await.balance, d("0.60"));

    let fresh = deposits
        .on_deposit(&user, &system, EUR, "0.60", "T5", Some(orig_ts))
        .await;
    assert_eq!(fresh, Err(XferError::OriginalTooOld));

    let future = deposits
        .on_deposit(&user, &system, EUR, "0.60", "T6", Some(Utc::now() + Duration::hours(1)))
        .await;
    assert!(matches!(future, Err(XferError::InternalError(_))));

    // a little clock skew is tolerated
    deposits
        .on_deposit(&user, &system, EUR, "0.60", "T7", Some(Utc::now() + Duration::seconds(30)))
        .await
        .unwrap();
    assert_eq!(fx.store.xfer_count().await, 2);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn qa_rejects_before_touching_balances() {
    let fx = Fixture::new();
    let payer = fx.user("10").await;
    let payee = fx.user("0").await;

    let stale = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "1.00")
        .with_orig_ts(Utc::now() - Duration::days(31));
    assert_eq!(
        fx.engine.process_xfer(&stale).await,
        Err(XferError::OriginalTooOld)
    );

    let unscoped = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "1.00")
        .with_ext_id("T3");
    assert!(matches!(
        fx.engine.process_xfer(&unscoped).await,
        Err(XferError::InternalError(_))
    ));

    let unknown_ccy = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), "I:XXX", "1.00");
    assert!(matches!(
        fx.engine.process_xfer(&unknown_ccy).await,
        Err(XferError::UnknownCurrency(_))
    ));

    let too_precise = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "1.001");
    assert!(fx.engine.process_xfer(&too_precise).await.is_err());

    let nowhere = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), AccountId::generate(), EUR, "1.00");
    assert!(matches!(
        fx.engine.process_xfer(&nowhere).await,
        Err(XferError::UnknownAccountID(_))
    ));

    let broke = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "10.01");
    assert_eq!(
        fx.engine.process_xfer(&broke).await,
        Err(XferError::NotEnoughFunds)
    );

    assert_eq!(fx.store.xfer_count().await, 0);
    assert_eq!(fx.acct(&payer).await.balance, d("10"));
    assert_eq!(fx.acct(&payee).await.balance, d("0"));
}

#[tokio::test]
async fn qa_oversized_amounts_are_refused() {
    let fx = Fixture::new();
    let user = fx.user("0").await;
    let transit = fx.open(EUR, AccountKind::Transit, "0").await;
    let deposits = DepositService::new(fx.engine.clone());

    for ext_id in ["Big1", "Big2"] {
        let huge = deposits
            .on_deposit(&user, &transit, EUR, "40000000000000000000000000000", ext_id, None)
            .await;
        assert!(matches!(huge, Err(XferError::InternalError(_))));
    }
    assert_eq!(fx.store.xfer_count().await, 0);

    // the largest accepted amount still adds up safely
    for ext_id in ["Big3", "Big4"] {
        deposits
            .on_deposit(&user, &transit, EUR, "999999999999999999.99", ext_id, None)
            .await
            .unwrap();
    }
    assert_eq!(fx.acct(&user).await.balance, d("1999999999999999999.98"));
    assert_eq!(
        fx.counter(&user, LimitDomain::Deposits, "deposit_daily_amt").await,
        d("1999999999999999999.98")
    );
}

#[tokio::test]
async fn qa_disabled_account_and_force() {
    let fx = Fixture::new();
    let payer = fx.user("10").await;
    let payee = fx.user("0").await;

    fx.store.set_account_enabled(&payee, false).await;
    let mut req = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "1.00");
    assert!(matches!(
        fx.engine.process_xfer(&req).await,
        Err(XferError::DisabledAccount(_))
    ));

    req.force = true;
    let rec = fx.engine.process_xfer(&req).await.unwrap();
    assert_eq!(rec.status, XferStatus::Done);
    assert_eq!(fx.acct(&payee).await.balance, d("1.00"));

    fx.store.set_account_enabled(&payee, true).await;
    let holder = fx.acct(&payer).await.holder;
    fx.registry.set_holder_enabled(&holder, false);
    req.force = false;
    assert!(matches!(
        fx.engine.process_xfer(&req).await,
        Err(XferError::DisabledAccount(_))
    ));
}

// ============================================================================
// Limits
// ============================================================================

#[tokio::test]
async fn qa_daily_hard_limit_is_never_exceeded() {
    let fx = Fixture::new();
    fx.hard_limit(LimitDomain::Retail, "retail_daily_amt", "1.00");
    let buyer = fx.user("20").await;
    let merchant = fx.user("0").await;
    let retail = RetailService::new(fx.engine.clone());

    for (i, amount) in ["0.21", "0.30", "0.20", "0.10"].into_iter().enumerate() {
        retail
            .purchase(&buyer, &merchant, EUR, amount, &format!("P{i}"), None)
            .await
            .unwrap();
    }

    let over = retail
        .purchase(&buyer, &merchant, EUR, "0.25", "P-over", None)
        .await;
    assert_eq!(over, Err(XferError::LimitReject));
    assert_eq!(fx.acct(&buyer).await.balance, d("19.19"));
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_daily_amt").await,
        d("0.81")
    );

    // exactly at the ceiling is allowed
    retail
        .purchase(&buyer, &merchant, EUR, "0.19", "P-edge", None)
        .await
        .unwrap();
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_daily_amt").await,
        d("1.00")
    );
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_daily_cnt").await,
        d("5")
    );
}

#[tokio::test]
async fn qa_soft_tiers_flag_and_counters_follow_stats_currency() {
    let fx = Fixture::new();
    fx.registry.set_ex_rate(EUR, USD, d("2"), d("0"));
    fx.registry.set_limits(
        GROUP,
        LimitDomain::Retail,
        LimitsConfig {
            currency: USD.into(),
            hard: limits(&[("retail_daily_amt", "3.00")]),
            check: limits(&[("retail_daily_amt", "1.00")]),
            risk: limits(&[("retail_daily_amt", "2.50")]),
        },
    );
    let buyer = fx.user("20").await;
    let merchant = fx.user("0").await;
    let retail = RetailService::new(fx.engine.clone());

    let first = retail
        .purchase(&buyer, &merchant, EUR, "1.00", "C1", None)
        .await
        .unwrap();
    assert!(flag(&first, "do_check"));
    assert!(!flag(&first, "do_risk"));
    assert_eq!(first.limits.len(), 1);
    assert_eq!(first.limits[0].currency, USD);
    assert_eq!(first.limits[0].amount, d("2.00"));

    let second = retail
        .purchase(&buyer, &merchant, EUR, "0.50", "C2", None)
        .await
        .unwrap();
    assert!(flag(&second, "do_check"));
    assert!(flag(&second, "do_risk"));
    assert_eq!(second.limits[0].amount, d("1.00"));
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_daily_amt").await,
        d("3.00")
    );

    let over = retail
        .purchase(&buyer, &merchant, EUR, "0.01", "C3", None)
        .await;
    assert_eq!(over, Err(XferError::LimitReject));
    assert_eq!(fx.acct(&buyer).await.balance, d("18.50"));
}

#[tokio::test]
async fn qa_limit_conversion_rounds_against_the_holder() {
    let fx = Fixture::new();
    fx.registry.set_ex_rate(USD, EUR, d("0.8"), d("0"));
    fx.registry.set_limits(
        GROUP,
        LimitDomain::Retail,
        LimitsConfig {
            currency: USD.into(),
            ..Default::default()
        },
    );
    let buyer = fx.user("20").await;
    let merchant = fx.user("0").await;
    let retail = RetailService::new(fx.engine.clone());

    // 0.01 EUR is 0.0125 USD: the counter rounds up
    let rec = retail
        .purchase(&buyer, &merchant, EUR, "0.01", "R1", None)
        .await
        .unwrap();
    assert_eq!(rec.limits[0].amount, d("0.02"));

    // limits move to EUR while the row keeps counting in USD:
    // 0.0699 EUR is 0.087375 USD, the ceiling rounds down to 0.08
    fx.registry.set_limits(
        GROUP,
        LimitDomain::Retail,
        LimitsConfig {
            currency: EUR.into(),
            hard: limits(&[("retail_daily_amt", "0.0699")]),
            ..Default::default()
        },
    );
    retail
        .purchase(&buyer, &merchant, EUR, "0.04", "R2", None)
        .await
        .unwrap();
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_daily_amt").await,
        d("0.07")
    );

    let over = retail
        .purchase(&buyer, &merchant, EUR, "0.01", "R3", None)
        .await;
    assert_eq!(over, Err(XferError::LimitReject));
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_daily_amt").await,
        d("0.07")
    );
}

#[tokio::test]
async fn qa_min_amount_floor_applies_per_transfer() {
    let fx = Fixture::new();
    fx.hard_limit(LimitDomain::Retail, "retail_min_amt", "0.50");
    let buyer = fx.user("20").await;
    let merchant = fx.user("0").await;
    let retail = RetailService::new(fx.engine.clone());

    let small = retail
        .purchase(&buyer, &merchant, EUR, "0.49", "M1", None)
        .await;
    assert_eq!(small, Err(XferError::LimitReject));

    retail
        .purchase(&buyer, &merchant, EUR, "0.50", "M2", None)
        .await
        .unwrap();

    // the floor never accumulates across transfers
    let small = retail
        .purchase(&buyer, &merchant, EUR, "0.49", "M3", None)
        .await;
    assert_eq!(small, Err(XferError::LimitReject));
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_daily_amt").await,
        d("0.50")
    );
    assert_eq!(
        fx.counter(&buyer, LimitDomain::Retail, "retail_min_amt").await,
        d("0")
    );
    assert_eq!(fx.acct(&buyer).await.balance, d("19.50"));
}

#[tokio::test]
async fn qa_missing_limits_surface_from_the_pipeline() {
    let fx = Fixture::new();
    let merchant = fx.user("0").await;
    let mut acct = Account::new(fx.registry.add_holder("vip"), EUR, 2, AccountKind::Regular);
    acct.balance = d("10");
    let buyer = fx.store.add_account(acct).await;
    let retail = RetailService::new(fx.engine.clone());

    let unknown = retail
        .purchase(&buyer, &merchant, EUR, "1.00", "V1", None)
        .await;
    assert_eq!(unknown, Err(XferError::UnknownGroup("vip".into())));

    fx.registry
        .set_limits("vip", LimitDomain::Gaming, LimitsConfig::default());
    let unset = retail
        .purchase(&buyer, &merchant, EUR, "1.00", "V2", None)
        .await;
    assert!(matches!(unset, Err(XferError::LimitsNotSet(_))));

    // transfers that feed no counters are unaffected
    let plain = XferRequest::new(Domain::Generic, "Transfer", buyer.clone(), merchant, EUR, "1.00");
    fx.engine.process_xfer(&plain).await.unwrap();
    assert_eq!(fx.acct(&buyer).await.balance, d("9.00"));
    assert_eq!(fx.store.xfer_count().await, 1);
}

#[tokio::test]
async fn qa_cancel_reverses_counters_in_live_windows_only() {
    let fx = Fixture::new();
    let payer = fx.user("20").await;
    let payee = fx.user("0").await;
    let payments = PaymentService::new(fx.engine.clone());

    let fresh = payments
        .outbound(&payer, &payee, EUR, "3.00", "O1")
        .await
        .unwrap();
    let old = payments
        .outbound(&payer, &payee, EUR, "2.00", "O2")
        .await
        .unwrap();
    assert_eq!(
        fx.counter(&payer, LimitDomain::Payments, "outbound_daily_amt").await,
        d("5.00")
    );

    payments.user_reject(fresh.id).await.unwrap();
    assert_eq!(
        fx.counter(&payer, LimitDomain::Payments, "outbound_daily_amt").await,
        d("2.00")
    );
    assert_eq!(
        fx.counter(&payer, LimitDomain::Payments, "outbound_daily_cnt").await,
        d("1")
    );

    // applied more than a month ago: every window has rolled
    fx.store
        .backdate_xfer(old.id, Utc::now() - Duration::days(40))
        .await;
    payments.user_reject(old.id).await.unwrap();
    assert_eq!(
        fx.counter(&payer, LimitDomain::Payments, "outbound_daily_amt").await,
        d("2.00")
    );

    let acct = fx.acct(&payer).await;
    assert_eq!(acct.reserved, d("0"));
    assert_eq!(acct.balance, d("20"));
}

// ============================================================================
// Reservations
// ============================================================================

#[tokio::test]
async fn qa_user_confirm_lifecycle() {
    let fx = Fixture::new();
    let payer = fx.user("10").await;
    let payee = fx.user("0").await;
    let payments = PaymentService::new(fx.engine.clone());

    let rec = payments
        .outbound(&payer, &payee, EUR, "5.00", "U1")
        .await
        .unwrap();
    assert_eq!(rec.status, XferStatus::WaitUser);
    let acct = fx.acct(&payer).await;
    assert_eq!((acct.balance, acct.reserved), (d("10"), d("5.00")));
    assert_eq!(fx.acct(&payee).await.balance, d("0"));

    let done = payments.user_confirm(rec.id).await.unwrap();
    assert_eq!(done.status, XferStatus::Done);
    let acct = fx.acct(&payer).await;
    assert_eq!((acct.balance, acct.reserved), (d("5.00"), d("0")));
    assert_eq!(fx.acct(&payee).await.balance, d("5.00"));

    assert_eq!(
        payments.user_confirm(rec.id).await,
        Err(XferError::AlreadyCompleted)
    );
    assert_eq!(
        payments.user_reject(rec.id).await,
        Err(XferError::AlreadyCompleted)
    );
}

#[tokio::test]
async fn qa_reject_and_cancel_release_reservation() {
    let fx = Fixture::new();
    let user = fx.user("10").await;
    let system = fx.system().await;
    let payments = PaymentService::new(fx.engine.clone());
    let deposits = DepositService::new(fx.engine.clone());

    let wait = payments
        .outbound(&user, &system, EUR, "3.00", "R1")
        .await
        .unwrap();
    let rejected = payments.user_reject(wait.id).await.unwrap();
    assert_eq!(rejected.status, XferStatus::Canceled);
    assert_eq!(
        payments.user_reject(wait.id).await,
        Err(XferError::AlreadyCanceled)
    );

    // reject only applies to rows awaiting the holder
    let held = deposits
        .on_withdraw(&user, &system, EUR, "4.00", "W1", None)
        .await
        .unwrap();
    assert_eq!(held.status, XferStatus::Pending);
    assert!(matches!(
        fx.engine.process_cancel(&CancelRequest::reject(held.id)).await,
        Err(XferError::InternalError(_))
    ));

    let canceled = deposits
        .reject_withdraw(held.id, "payout bounced")
        .await
        .unwrap();
    assert_eq!(canceled.status, XferStatus::Canceled);
    assert_eq!(canceled.misc_str("cancel_reason"), Some("payout bounced"));

    let acct = fx.acct(&user).await;
    assert_eq!((acct.balance, acct.reserved), (d("10"), d("0")));
    assert_eq!(fx.acct(&system).await.balance, d("0"));
}

#[tokio::test]
async fn qa_confirm_by_external_id() {
    let fx = Fixture::new();
    let user = fx.user("10").await;
    let system = fx.system().await;
    let deposits = DepositService::new(fx.engine.clone());

    deposits
        .on_withdraw(&user, &system, EUR, "4.00", "W2", None)
        .await
        .unwrap();
    let target = XferRef::ExtId(make_ext_id(&user, "W2"));
    let done = fx.engine.confirm_xfer(&target).await.unwrap();

    assert_eq!(done.status, XferStatus::Done);
    assert_eq!(fx.acct(&user).await.balance, d("6.00"));
    assert_eq!(fx.acct(&system).await.balance, d("4.00"));
    assert!(matches!(
        fx.engine
            .confirm_xfer(&XferRef::ExtId(make_ext_id(&user, "missing")))
            .await,
        Err(XferError::UnknownXferID(_))
    ));
}

#[tokio::test]
async fn qa_confirmation_can_be_switched_off() {
    let fx = Fixture::with_config(EngineConfig {
        user_confirm_required: false,
        ..EngineConfig::default()
    });
    let payer = fx.user("10").await;
    let payee = fx.user("0").await;

    let rec = PaymentService::new(fx.engine.clone())
        .outbound(&payer, &payee, EUR, "5.00", "U2")
        .await
        .unwrap();
    assert_eq!(rec.status, XferStatus::Done);
    assert_eq!(fx.acct(&payee).await.balance, d("5.00"));
}

// ============================================================================
// Retail
// ============================================================================

#[tokio::test]
async fn qa_refund_total_never_exceeds_purchase() {
    let fx = Fixture::new();
    let buyer = fx.user("20").await;
    let merchant = fx.user("0").await;
    let retail = RetailService::new(fx.engine.clone());

    let purchase = retail
        .purchase(&buyer, &merchant, EUR, "10.00", "P1", None)
        .await
        .unwrap();

    retail.refund(&purchase, "2.00", "RF1").await.unwrap();
    assert_eq!(
        retail.refund(&purchase, "8.01", "RF2").await,
        Err(XferError::AmountTooLarge)
    );
    retail.refund(&purchase, "8.00", "RF3").await.unwrap();
    assert_eq!(
        retail.refund(&purchase, "0.01", "RF4").await,
        Err(XferError::AlreadyRefunded)
    );

    assert_eq!(fx.acct(&buyer).await.balance, d("20"));
    assert_eq!(fx.acct(&merchant).await.balance, d("0"));
}

#[tokio::test]
async fn qa_refund_of_old_or_unknown_purchase() {
    let fx = Fixture::new();
    let buyer = fx.user("20").await;
    let merchant = fx.user("0").await;
    let retail = RetailService::new(fx.engine.clone());

    let purchase = retail
        .purchase(&buyer, &merchant, EUR, "5.00", "P2", None)
        .await
        .unwrap();
    fx.store
        .backdate_xfer(purchase.id, Utc::now() - Duration::days(91))
        .await;
    assert_eq!(
        retail.refund(&purchase, "1.00", "RF5").await,
        Err(XferError::OriginalTooOld)
    );

    let deposit = DepositService::new(fx.engine.clone())
        .on_deposit(&buyer, &merchant, EUR, "1.00", "D1", None)
        .await
        .unwrap();
    assert_eq!(
        retail.refund(&deposit, "1.00", "RF6").await,
        Err(XferError::PurchaseNotFound)
    );
}

#[tokio::test]
async fn qa_purchase_consumes_preauth() {
    let fx = Fixture::new();
    let buyer = fx.user("6").await;
    let merchant = fx.user("0").await;
    let retail = RetailService::new(fx.engine.clone());

    let preauth = retail
        .preauth(&buyer, &merchant, EUR, "5.00", "A1")
        .await
        .unwrap();
    assert_eq!(preauth.status, XferStatus::Pending);
    assert_eq!(fx.acct(&buyer).await.reserved, d("5.00"));

    assert_eq!(
        retail
            .purchase(&buyer, &merchant, EUR, "4.00", "P3", Some(preauth.id))
            .await,
        Err(XferError::UnavailablePreAuth)
    );
    assert_eq!(
        retail.purchase(&buyer, &merchant, EUR, "6.00", "P4", None).await,
        Err(XferError::NotEnoughFunds)
    );

    let purchase = retail
        .purchase(&buyer, &merchant, EUR, "6.00", "P5", Some(preauth.id))
        .await
        .unwrap();
    assert_eq!(purchase.status, XferStatus::Done);

    let used = fx.engine.get_xfer(preauth.id).await.unwrap();
    assert_eq!(used.status, XferStatus::Canceled);
    assert_eq!(used.misc_str("used_by"), Some(purchase.id.to_string().as_str()));

    let acct = fx.acct(&buyer).await;
    assert_eq!((acct.balance, acct.reserved), (d("0"), d("0")));
    assert_eq!(fx.acct(&merchant).await.balance, d("6.00"));

    assert_eq!(
        retail.release_preauth(preauth.id).await,
        Err(XferError::AlreadyCanceled)
    );
}

// ============================================================================
// Gaming
// ============================================================================

#[tokio::test]
async fn qa_win_split_is_proportional() {
    let fx = Fixture::new();
    let house = fx.system().await;
    let main = fx.user("0").await;
    let bonus = fx.open(EUR, AccountKind::Bonus, "0").await;

    let mut shares = BTreeMap::new();
    shares.insert(main.clone(), d("11"));
    shares.insert(bonus.clone(), d("22"));

    let records = GamingService::new(fx.engine.clone())
        .win_split(&house, &shares, EUR, d("3.33"), 2, "round-1")
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(fx.acct(&main).await.balance, d("1.11"));
    assert_eq!(fx.acct(&bonus).await.balance, d("2.22"));
    assert_eq!(fx.acct(&house).await.balance, d("-3.33"));

    let main_win = records.iter().find(|r| r.dst_account == main).unwrap();
    assert_eq!(main_win.misc_str("game_balance").map(d), Some(d("1.11")));
}

#[tokio::test]
async fn qa_bet_records_game_balance_with_transit() {
    let fx = Fixture::new();
    let player = fx.user("10").await;
    let house = fx.system().await;
    let transit = fx.open(EUR, AccountKind::Transit, "5").await;

    let req = XferRequest::new(Domain::Gaming, "Bet", player.clone(), house.clone(), EUR, "2.00")
        .with_ext_id(make_ext_id(&player, "round-2"))
        .with_src_limit(LimitDomain::Gaming, "bet")
        .with_misc("transit_account", transit.to_string());
    let rec = fx.engine.process_xfer(&req).await.unwrap();

    assert_eq!(rec.misc_str("game_balance").map(d), Some(d("13")));
    assert_eq!(
        fx.counter(&player, LimitDomain::Gaming, "bet_daily_cnt").await,
        d("1")
    );
}

// ============================================================================
// Fees And Conversion
// ============================================================================

fn fee_request(dst: &AccountId, amount: &str) -> FeeRequest {
    FeeRequest {
        xfer_type: "Fee".into(),
        dst_account: dst.clone(),
        currency: EUR.into(),
        amount: amount.into(),
    }
}

#[tokio::test]
async fn qa_fee_moves_with_its_transfer() {
    let fx = Fixture::new();
    let payer = fx.user("10").await;
    let payee = fx.user("0").await;
    let fees = fx.system().await;

    let req = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "5.00")
        .with_fee(fee_request(&fees, "0.50"));
    let rec = fx.engine.process_xfer(&req).await.unwrap();

    let fee = fx.engine.get_xfer(rec.fee_xfer.unwrap()).await.unwrap();
    assert_eq!(fee.status, XferStatus::Done);
    assert_eq!(fee.domain, Domain::Generic);
    assert_eq!(fee.misc_str("fee_for"), Some(rec.id.to_string().as_str()));

    let total = fx.acct(&payer).await.balance
        + fx.acct(&payee).await.balance
        + fx.acct(&fees).await.balance;
    assert_eq!(fx.acct(&payer).await.balance, d("4.50"));
    assert_eq!(total, d("10"));
}

#[tokio::test]
async fn qa_fee_follows_cancel_and_funds_check() {
    let fx = Fixture::new();
    let payer = fx.user("5.50").await;
    let payee = fx.user("0").await;
    let fees = fx.system().await;

    let mut held = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "5.00")
        .with_fee(fee_request(&fees, "0.50"));
    held.hold = true;
    let rec = fx.engine.process_xfer(&held).await.unwrap();
    assert_eq!(fx.acct(&payer).await.reserved, d("5.50"));

    fx.engine
        .process_cancel(&CancelRequest::cancel(rec.id))
        .await
        .unwrap();
    let fee = fx.engine.get_xfer(rec.fee_xfer.unwrap()).await.unwrap();
    assert_eq!(fee.status, XferStatus::Canceled);
    assert_eq!(fx.acct(&payer).await.reserved, d("0"));

    // main leg fits, fee does not: nothing is written
    let count = fx.store.xfer_count().await;
    let tight = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "5.50")
        .with_fee(fee_request(&fees, "0.50"));
    assert_eq!(
        fx.engine.process_xfer(&tight).await,
        Err(XferError::NotEnoughFunds)
    );
    assert_eq!(fx.store.xfer_count().await, count);
    assert_eq!(fx.acct(&payer).await.balance, d("5.50"));
}

#[tokio::test]
async fn qa_conversion_rounds_against_the_holders() {
    let fx = Fixture::new();
    fx.registry.set_ex_rate(EUR, USD, d("1.2345"), d("0.0010"));
    let payer = fx.open(USD, AccountKind::Regular, "10").await;
    let payee = fx.open(USD, AccountKind::Regular, "0").await;

    let req = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), payee.clone(), EUR, "1.00");
    let rec = fx.engine.process_xfer(&req).await.unwrap();

    // sell 1.2355 rounds up, buy 1.2335 rounds down
    assert_eq!(rec.src_amount, d("1.24"));
    assert_eq!(rec.dst_amount, d("1.23"));
    assert_eq!(fx.acct(&payer).await.balance, d("8.76"));
    assert_eq!(fx.acct(&payee).await.balance, d("1.23"));

    fx.registry.set_ex_rate(EUR, "I:GBP", d("0.85"), d("0"));
    let gbp = fx.open("I:GBP", AccountKind::Regular, "0").await;
    let missing = XferRequest::new(Domain::Generic, "Transfer", payer.clone(), gbp, USD, "1.00");
    assert!(matches!(
        fx.engine.process_xfer(&missing).await,
        Err(XferError::UnknownPair(_))
    ));
}

// ============================================================================
// Peer Federation
// ============================================================================

fn worker(fx: &Fixture, gateway: Arc<MockGateway>, max_retries: i32) -> OutboxWorker {
    OutboxWorker::new(
        Arc::new(fx.store.clone()),
        gateway,
        OutboxConfig {
            max_retries,
            ..OutboxConfig::default()
        },
    )
}

#[tokio::test]
async fn qa_transit_sides_reach_the_peer() {
    let fx = Fixture::new();
    let transit = fx.open(EUR, AccountKind::Transit, "0").await;
    let user = fx.user("10").await;
    let gateway = Arc::new(MockGateway::new());

    // transit source: no funds check, pulled from the peer
    let inbound = XferRequest::new(Domain::Payment, "Inbound", transit.clone(), user.clone(), EUR, "3.00");
    let rec_in = fx.engine.process_xfer(&inbound).await.unwrap();
    assert_eq!(fx.acct(&transit).await.balance, d("-3.00"));

    let mut outbound = XferRequest::new(Domain::Payment, "Outbound", user.clone(), transit.clone(), EUR, "4.00");
    outbound.hold = true;
    let rec_out = fx.engine.process_xfer(&outbound).await.unwrap();
    fx.engine
        .process_cancel(&CancelRequest::cancel(rec_out.id))
        .await
        .unwrap();

    let entries = fx.store.outbox().await;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].direction, Direction::In);
    assert_eq!(entries[1].direction, Direction::Out);
    assert_eq!(entries[0].op, PeerOp::Start);
    assert_eq!(entries[2].op, PeerOp::Cancel);
    assert_eq!(entries[2].payload["status"], "CANCELED");

    let delivered = worker(&fx, gateway.clone(), 5).drain_once().await.unwrap();
    assert_eq!(delivered, 3);
    assert_eq!(
        gateway.calls(),
        vec![
            ("pull", rec_in.id.to_string()),
            ("push", rec_out.id.to_string()),
            ("cancel_push", rec_out.id.to_string()),
        ]
    );
    assert!(
        fx.store
            .outbox()
            .await
            .iter()
            .all(|e| e.status == OutboxStatus::Done)
    );
}

#[tokio::test]
async fn qa_confirmed_reservation_reaches_the_peer() {
    let fx = Fixture::new();
    let transit = fx.open(EUR, AccountKind::Transit, "0").await;
    let user = fx.user("10").await;
    let gateway = Arc::new(MockGateway::new());

    let mut outbound = XferRequest::new(Domain::Payment, "Outbound", user.clone(), transit.clone(), EUR, "4.00");
    outbound.hold = true;
    let rec = fx.engine.process_xfer(&outbound).await.unwrap();
    assert_eq!(fx.store.outbox().await.len(), 1);

    let done = fx.engine.confirm_xfer(&XferRef::Id(rec.id)).await.unwrap();
    assert_eq!(done.status, XferStatus::Done);
    assert_eq!(fx.acct(&transit).await.balance, d("4.00"));

    let entries = fx.store.outbox().await;
    assert_eq!(entries.len(), 2);
    assert_eq!((entries[0].direction, entries[0].op), (Direction::Out, PeerOp::Start));
    assert_eq!(entries[0].payload["status"], "PENDING");
    assert_eq!((entries[1].direction, entries[1].op), (Direction::Out, PeerOp::Confirm));
    assert_eq!(entries[1].payload["status"], "DONE");
    assert_eq!(entries[1].payload["amount"], "4.00");

    worker(&fx, gateway.clone(), 5).drain_once().await.unwrap();
    assert_eq!(
        gateway.calls(),
        vec![
            ("push", rec.id.to_string()),
            ("confirm_push", rec.id.to_string()),
        ]
    );

    // a plain user-to-user confirmation queues nothing
    let other = fx.user("0").await;
    let mut local = XferRequest::new(Domain::Generic, "Move", user, other, EUR, "1.00");
    local.hold = true;
    let rec = fx.engine.process_xfer(&local).await.unwrap();
    fx.engine.confirm_xfer(&XferRef::Id(rec.id)).await.unwrap();
    assert_eq!(fx.store.outbox().await.len(), 2);
}

#[tokio::test]
async fn qa_outbox_retries_then_gives_up() {
    let fx = Fixture::new();
    let transit = fx.open(EUR, AccountKind::Transit, "0").await;
    let user = fx.user("0").await;
    let gateway = Arc::new(MockGateway::new());
    gateway.respond(OpResult::Pending);

    let req = XferRequest::new(Domain::Payment, "Inbound", transit, user, EUR, "1.00");
    fx.engine.process_xfer(&req).await.unwrap();

    let worker = worker(&fx, gateway.clone(), 2);
    worker.drain_once().await.unwrap();
    let entry = fx.store.outbox().await.remove(0);
    assert_eq!((entry.status, entry.retry_count), (OutboxStatus::Pending, 1));

    worker.drain_once().await.unwrap();
    let entry = fx.store.outbox().await.remove(0);
    assert_eq!(entry.status, OutboxStatus::Failed);
    assert!(entry.error.is_some());

    // failed entries are not picked up again
    worker.drain_once().await.unwrap();
    assert_eq!(gateway.calls().len(), 2);
}
