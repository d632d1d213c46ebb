// Copyright FlexPrice, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Integration tests implementing the literal scenarios from the credit
//! engine specification (S1-S6), driven against the in-memory store with
//! a settable clock instead of the wall clock.

use flexcore::{
    ApplicationStatus, BillingCadence, BillingCycle, BillingModel, BillingPeriod,
    CancellationSnapshot, ChangeOutcome, CollectionMethod, Context, CreditGrant, CreditOptions,
    DebitOptions, Decimal, Clock, EngineBuilder, EngineConfig, EntityType, Error, ExpirationType,
    GrantCadence, GrantScope, InvoiceCadence, MemLock, MemStore, PauseMode, PaymentBehavior, Price,
    PriceType, ProrationBehavior, Store, Subscription, SubscriptionLineItem, SubscriptionStatus,
    TestClock, TransactionReason, TransactionType, Wallet,
};
use time::macros::datetime;

fn ctx() -> Context {
    Context {
        tenant_id: "tenant_1".into(),
        environment_id: "env_1".into(),
        user_id: "user_1".into(),
        deadline: datetime!(2030-01-01 0:00 UTC),
        idempotency_key: None,
    }
}

fn monthly_subscription(id: &str, plan_id: &str, anchor: time::OffsetDateTime) -> Subscription {
    Subscription {
        id: id.into(),
        customer_id: "cus_1".into(),
        plan_id: plan_id.into(),
        currency: "USD".into(),
        status: SubscriptionStatus::Active,
        billing_cadence: BillingCadence::Recurring,
        billing_period: BillingPeriod::Monthly,
        billing_period_count: 1,
        billing_cycle: BillingCycle::Anniversary,
        billing_anchor: anchor,
        start_date: anchor,
        current_period_start: anchor,
        current_period_end: anchor + time::Duration::days(31),
        trial_start: None,
        trial_end: None,
        cancel_at_period_end: false,
        cancel_at: None,
        cancelled_at: None,
        end_date: None,
        pause_status: None,
        active_pause_id: None,
        collection_method: CollectionMethod::ChargeAutomatically,
        payment_behavior: PaymentBehavior::AllowIncomplete,
        proration_behavior: ProrationBehavior::CreateProrations,
        commitment_amount: None,
        overage_factor: Decimal::ONE,
        invoicing_customer_id: None,
    }
}

fn recurring_grant(subscription_id: &str, start: time::OffsetDateTime) -> CreditGrant {
    CreditGrant {
        id: "grant_1".into(),
        scope: GrantScope::Subscription,
        plan_id: None,
        subscription_id: Some(subscription_id.into()),
        credits: Decimal::from(500),
        cadence: GrantCadence::Recurring,
        period: Some(BillingPeriod::Monthly),
        period_count: Some(1),
        expiration_type: ExpirationType::Never,
        expiration_duration: None,
        expiration_duration_unit: None,
        priority: None,
        conversion_rate: Some(Decimal::ONE),
        topup_conversion_rate: Some(Decimal::ONE),
        start_date: Some(start),
        end_date: None,
        credit_grant_anchor: Some(start),
    }
}

#[tokio::test]
async fn s1_monthly_anniversary_topup_then_debit_consumes_fifo_by_expiry() {
    let store = MemStore::new();
    let now = datetime!(2025-03-15 0:00 UTC);
    let wallet = Wallet::new_default(
        "wal_1".into(),
        "cus_1".into(),
        "USD".into(),
        Decimal::ONE,
        Decimal::ONE,
        now,
    );
    store.create_wallet(wallet).await.unwrap();

    let lock = MemLock::new();
    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(lock),
        clock: std::sync::Arc::new(TestClock::new(now)),
        timezone: "UTC".into(),
    });

    engine
        .ledger()
        .credit(
            "wal_1",
            Decimal::from(100),
            CreditOptions {
                expiry_date: None,
                priority: None,
                reason: TransactionReason::PurchasedCreditDirect,
                reference_type: "test".into(),
                reference_id: "r1".into(),
                idempotency_key: "credit_1".into(),
            },
            datetime!(2025-03-15 0:00 UTC),
        )
        .await
        .unwrap();
    engine
        .ledger()
        .credit(
            "wal_1",
            Decimal::from(50),
            CreditOptions {
                expiry_date: Some(datetime!(2025-03-30 0:00 UTC)),
                priority: None,
                reason: TransactionReason::PurchasedCreditDirect,
                reference_type: "test".into(),
                reference_id: "r2".into(),
                idempotency_key: "credit_2".into(),
            },
            datetime!(2025-03-20 0:00 UTC),
        )
        .await
        .unwrap();

    let debit = engine
        .ledger()
        .debit(
            "wal_1",
            Decimal::from(120),
            DebitOptions {
                reason: TransactionReason::InvoiceDebit,
                reference_type: "invoice".into(),
                reference_id: "inv_1".into(),
                idempotency_key: "debit_1".into(),
                time_reference: None,
            },
            datetime!(2025-03-25 12:00 UTC),
        )
        .await
        .unwrap();
    assert_eq!(debit.tx_type, TransactionType::Debit);

    let wallet = store.get_wallet("wal_1").await.unwrap();
    assert_eq!(wallet.credit_balance, Decimal::from(30));
    assert_eq!(wallet.balance, wallet.credit_balance * wallet.conversion_rate);

    let txs = store.list_wallet_transactions("wal_1").await.unwrap();
    let expiring = txs.iter().find(|t| t.idempotency_key == "credit_2").unwrap();
    let open_ended = txs.iter().find(|t| t.idempotency_key == "credit_1").unwrap();
    assert_eq!(expiring.credits_available, Decimal::ZERO);
    assert_eq!(open_ended.credits_available, Decimal::from(30));
}

#[tokio::test]
async fn s2_insufficient_debit_rejects_without_writing_rows() {
    let store = MemStore::new();
    let now = datetime!(2025-03-15 0:00 UTC);
    let wallet = Wallet::new_default(
        "wal_1".into(),
        "cus_1".into(),
        "USD".into(),
        Decimal::ONE,
        Decimal::ONE,
        now,
    );
    store.create_wallet(wallet).await.unwrap();

    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(TestClock::new(now)),
        timezone: "UTC".into(),
    });

    engine
        .ledger()
        .credit(
            "wal_1",
            Decimal::from(10),
            CreditOptions {
                expiry_date: None,
                priority: None,
                reason: TransactionReason::PurchasedCreditDirect,
                reference_type: "test".into(),
                reference_id: "r1".into(),
                idempotency_key: "credit_1".into(),
            },
            now,
        )
        .await
        .unwrap();

    let err = engine
        .ledger()
        .debit(
            "wal_1",
            Decimal::from(25),
            DebitOptions {
                reason: TransactionReason::InvoiceDebit,
                reference_type: "invoice".into(),
                reference_id: "inv_1".into(),
                idempotency_key: "debit_1".into(),
                time_reference: None,
            },
            now,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));

    let txs = store.list_wallet_transactions("wal_1").await.unwrap();
    assert_eq!(txs.len(), 1);
}

#[tokio::test]
async fn s3_recurring_grant_materialises_across_two_periods() {
    let store = MemStore::new();
    let anchor = datetime!(2025-03-01 0:00 UTC);
    let sub = monthly_subscription("sub_1", "plan_1", anchor);
    store.create_subscription(sub.clone()).await.unwrap();
    let grant = recurring_grant("sub_1", anchor);
    store.create_credit_grant(grant.clone()).await.unwrap();

    let clock = TestClock::new(datetime!(2025-03-01 0:00:01 UTC));
    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(clock.clone()),
        timezone: "UTC".into(),
    });

    let tz = flexcore::lookup_tz("UTC").unwrap();
    engine
        .credit_grants()
        .materialise(&grant, &sub, tz, clock.now())
        .await
        .unwrap();

    let cgas = store
        .list_credit_grant_applications(&Default::default())
        .await
        .unwrap();
    let first = cgas
        .iter()
        .find(|c| c.period_start == datetime!(2025-03-01 0:00 UTC))
        .unwrap();
    assert_eq!(first.application_status, ApplicationStatus::Applied);
    assert_eq!(first.period_end, Some(datetime!(2025-04-01 0:00 UTC)));

    let pending = cgas
        .iter()
        .find(|c| c.period_start == datetime!(2025-04-01 0:00 UTC))
        .unwrap();
    assert_eq!(pending.application_status, ApplicationStatus::Pending);
    assert_eq!(pending.period_end, Some(datetime!(2025-05-01 0:00 UTC)));

    clock.set(datetime!(2025-04-01 0:00:01 UTC));
    engine.credit_grants().process_due(clock.now(), tz).await.unwrap();

    let cgas = store
        .list_credit_grant_applications(&Default::default())
        .await
        .unwrap();
    let second = cgas
        .iter()
        .find(|c| c.period_start == datetime!(2025-04-01 0:00 UTC))
        .unwrap();
    assert_eq!(second.application_status, ApplicationStatus::Applied);

    let next_pending = cgas
        .iter()
        .find(|c| c.period_start == datetime!(2025-05-01 0:00 UTC))
        .unwrap();
    assert_eq!(next_pending.application_status, ApplicationStatus::Pending);
    assert_eq!(next_pending.period_end, Some(datetime!(2025-06-01 0:00 UTC)));
}

#[tokio::test]
async fn s4_paused_subscription_defers_due_application() {
    let store = MemStore::new();
    let anchor = datetime!(2025-03-01 0:00 UTC);
    let mut sub = monthly_subscription("sub_1", "plan_1", anchor);
    store.create_subscription(sub.clone()).await.unwrap();
    let grant = recurring_grant("sub_1", anchor);
    store.create_credit_grant(grant.clone()).await.unwrap();

    let clock = TestClock::new(datetime!(2025-03-01 0:00:01 UTC));
    let tz = flexcore::lookup_tz("UTC").unwrap();
    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(clock.clone()),
        timezone: "UTC".into(),
    });
    engine
        .credit_grants()
        .materialise(&grant, &sub, tz, clock.now())
        .await
        .unwrap();

    sub.pause_immediate(datetime!(2025-03-28 0:00 UTC), "pause_1".into()).unwrap();
    let sub = store.update_subscription(sub).await.unwrap();
    let _ = PauseMode::Immediate;

    let wallet_before = store
        .find_active_wallet(&sub.customer_id, &sub.currency, "prepaid")
        .await
        .unwrap()
        .expect("first materialise() already created and credited the wallet");
    assert_eq!(wallet_before.credit_balance, Decimal::from(500));
    let tx_count_before = store.list_wallet_transactions(&wallet_before.id).await.unwrap().len();

    clock.set(datetime!(2025-04-01 0:00:01 UTC));
    engine.credit_grants().process_due(clock.now(), tz).await.unwrap();

    let cgas = store
        .list_credit_grant_applications(&Default::default())
        .await
        .unwrap();
    let deferred = cgas
        .iter()
        .find(|c| c.period_start == datetime!(2025-04-01 0:00 UTC))
        .unwrap();
    assert_eq!(deferred.application_status, ApplicationStatus::Pending);
    assert_eq!(deferred.retry_count, 1);
    let expected_retry = datetime!(2025-04-01 0:00:01 UTC) + time::Duration::minutes(30);
    assert_eq!(deferred.next_retry_at, Some(expected_retry));
    assert_eq!(deferred.scheduled_for, expected_retry);

    let tx_count_after = store.list_wallet_transactions(&wallet_before.id).await.unwrap().len();
    assert_eq!(tx_count_after, tx_count_before, "deferred application must not write a ledger row");
}

#[tokio::test]
async fn s5_plan_change_at_period_end_binds_new_subscription() {
    let store = MemStore::new();
    let period_end = datetime!(2025-04-01 0:00 UTC);
    let mut sub = monthly_subscription("sub_1", "plan_a", datetime!(2025-03-01 0:00 UTC));
    sub.current_period_end = period_end;
    store.create_subscription(sub.clone()).await.unwrap();

    let clock = TestClock::new(datetime!(2025-03-15 0:00 UTC));
    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(clock.clone()),
        timezone: "UTC".into(),
    });

    let outcome = engine
        .change_plan(&ctx(), "sub_1", "plan_b", true)
        .await
        .unwrap();
    let schedule_id = match outcome {
        ChangeOutcome::Scheduled { schedule_id, .. } => schedule_id,
        ChangeOutcome::Applied(_) => panic!("expected a deferred schedule"),
    };

    let conflict = engine.change_plan(&ctx(), "sub_1", "plan_c", true).await.unwrap_err();
    assert!(matches!(conflict, Error::ScheduleConflict { .. }));

    clock.set(period_end);
    let tz = flexcore::lookup_tz("UTC").unwrap();
    engine.schedules().run_due(clock.now(), tz).await.unwrap();

    let schedule = store.get_schedule(&schedule_id).await.unwrap();
    assert_eq!(
        schedule.status,
        flexcore::ScheduleStatus::Executed
    );

    let old = store.get_subscription("sub_1").await.unwrap();
    assert_eq!(old.status, SubscriptionStatus::Ended);

    let all = store
        .list_subscriptions(&Default::default())
        .await
        .unwrap();
    let new_sub = all
        .iter()
        .find(|s| s.id != "sub_1" && s.plan_id == "plan_b")
        .expect("executor should have bound a new subscription to plan_b");
    assert_ne!(new_sub.id, old.id);
    assert_ne!(new_sub.status, SubscriptionStatus::Ended);
}

#[tokio::test]
async fn s6_cancel_pending_schedule_is_reversible() {
    let store = MemStore::new();
    let sub = monthly_subscription("sub_1", "plan_a", datetime!(2025-03-01 0:00 UTC));
    assert!(!sub.cancel_at_period_end);
    store.create_subscription(sub.clone()).await.unwrap();

    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(TestClock::new(datetime!(2025-03-15 0:00 UTC))),
        timezone: "UTC".into(),
    });

    let outcome = engine.cancel(&ctx(), "sub_1", true).await.unwrap();
    let (armed, schedule_id) = match outcome {
        ChangeOutcome::Scheduled { subscription, schedule_id } => (subscription, schedule_id),
        ChangeOutcome::Applied(_) => panic!("expected a deferred cancellation"),
    };
    assert!(armed.cancel_at_period_end);
    assert_eq!(armed.cancel_at, Some(sub.current_period_end));

    let schedule = store.get_schedule(&schedule_id).await.unwrap();
    match &schedule.configuration {
        flexcore::ScheduleConfiguration::Cancellation { snapshot, .. } => {
            assert_eq!(
                snapshot,
                &CancellationSnapshot {
                    cancel_at_period_end: false,
                    cancel_at: None,
                    end_date: None,
                    cancelled_at: None,
                }
            );
        }
        other => panic!("expected a cancellation schedule, got {other:?}"),
    }

    engine.undo_scheduled_change(&ctx(), &schedule_id).await.unwrap();

    let restored = store.get_subscription("sub_1").await.unwrap();
    assert!(!restored.cancel_at_period_end);
    assert_eq!(restored.cancel_at, None);
    assert_eq!(restored.end_date, None);
    assert_eq!(restored.cancelled_at, None);

    let schedule = store.get_schedule(&schedule_id).await.unwrap();
    assert_eq!(schedule.status, flexcore::ScheduleStatus::Cancelled);
}

fn flat_fee_price(id: &str, plan_id: &str, amount: Decimal) -> Price {
    Price {
        id: id.into(),
        entity_id: plan_id.into(),
        entity_type: EntityType::Plan,
        price_type: PriceType::Fixed,
        billing_model: BillingModel::FlatFee,
        billing_cadence: BillingCadence::Recurring,
        billing_period: BillingPeriod::Monthly,
        billing_period_count: 1,
        invoice_cadence: InvoiceCadence::Advance,
        amount,
        currency: "USD".into(),
        tiers: None,
    }
}

fn flat_fee_line_item(id: &str, subscription_id: &str, price_id: &str) -> SubscriptionLineItem {
    SubscriptionLineItem {
        id: id.into(),
        subscription_id: subscription_id.into(),
        customer_id: "cus_1".into(),
        plan_id: Some("plan_a".into()),
        price_id: price_id.into(),
        price_type: PriceType::Fixed,
        meter_id: None,
        quantity: Decimal::ONE,
        currency: "USD".into(),
        billing_period: BillingPeriod::Monthly,
        invoice_cadence: InvoiceCadence::Advance,
        trial_period: None,
        start_date: None,
        end_date: None,
    }
}

#[tokio::test]
async fn immediate_cancel_prorates_unused_time_and_transitions_to_cancelled() {
    let store = MemStore::new();
    let anchor = datetime!(2025-03-01 0:00 UTC);
    let sub = monthly_subscription("sub_1", "plan_a", anchor);
    store.create_subscription(sub.clone()).await.unwrap();
    store.seed_price(flat_fee_price("price_1", "plan_a", Decimal::from(100)));
    store
        .create_line_item(flat_fee_line_item("li_1", "sub_1", "price_1"))
        .await
        .unwrap();

    let now = anchor + time::Duration::days(10);
    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(TestClock::new(now)),
        timezone: "UTC".into(),
    });

    let outcome = engine.cancel(&ctx(), "sub_1", false).await.unwrap();
    let cancelled = match outcome {
        ChangeOutcome::Applied(subscription) => subscription,
        ChangeOutcome::Scheduled { .. } => panic!("expected an immediate cancellation"),
    };
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(now));
    assert_eq!(cancelled.end_date, Some(now));
}

#[tokio::test]
async fn deferred_cancellation_executes_with_configured_proration_behavior() {
    let store = MemStore::new();
    let anchor = datetime!(2025-03-01 0:00 UTC);
    let period_end = anchor + time::Duration::days(31);
    let mut sub = monthly_subscription("sub_1", "plan_a", anchor);
    sub.proration_behavior = ProrationBehavior::AlwaysInvoice;
    store.create_subscription(sub.clone()).await.unwrap();
    store.seed_price(flat_fee_price("price_1", "plan_a", Decimal::from(100)));
    store
        .create_line_item(flat_fee_line_item("li_1", "sub_1", "price_1"))
        .await
        .unwrap();

    let clock = TestClock::new(anchor + time::Duration::days(5));
    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(clock.clone()),
        timezone: "UTC".into(),
    });

    let outcome = engine.cancel(&ctx(), "sub_1", true).await.unwrap();
    let schedule_id = match outcome {
        ChangeOutcome::Scheduled { schedule_id, .. } => schedule_id,
        ChangeOutcome::Applied(_) => panic!("expected a deferred cancellation"),
    };

    match &store.get_schedule(&schedule_id).await.unwrap().configuration {
        flexcore::ScheduleConfiguration::Cancellation { proration_behavior, .. } => {
            assert_eq!(*proration_behavior, ProrationBehavior::AlwaysInvoice);
        }
        other => panic!("expected a cancellation schedule, got {other:?}"),
    }

    clock.set(period_end);
    let tz = flexcore::lookup_tz("UTC").unwrap();
    engine.schedules().run_due(clock.now(), tz).await.unwrap();

    let schedule = store.get_schedule(&schedule_id).await.unwrap();
    assert_eq!(schedule.status, flexcore::ScheduleStatus::Executed);

    let cancelled = store.get_subscription("sub_1").await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(period_end));
    assert_eq!(cancelled.end_date, Some(period_end));
}

#[tokio::test]
async fn pause_at_period_end_schedules_and_executes_at_boundary() {
    let store = MemStore::new();
    let anchor = datetime!(2025-03-01 0:00 UTC);
    let period_end = anchor + time::Duration::days(31);
    let sub = monthly_subscription("sub_1", "plan_a", anchor);
    store.create_subscription(sub.clone()).await.unwrap();

    let clock = TestClock::new(anchor + time::Duration::days(5));
    let engine = EngineBuilder::default().build(EngineConfig {
        store: std::sync::Arc::new(store.clone()),
        lock: std::sync::Arc::new(MemLock::new()),
        clock: std::sync::Arc::new(clock.clone()),
        timezone: "UTC".into(),
    });

    let outcome = engine.pause_at_period_end(&ctx(), "sub_1").await.unwrap();
    let schedule_id = match outcome {
        ChangeOutcome::Scheduled { schedule_id, .. } => schedule_id,
        ChangeOutcome::Applied(_) => panic!("expected a deferred pause"),
    };

    let conflict = engine.pause_at_period_end(&ctx(), "sub_1").await.unwrap_err();
    assert!(matches!(conflict, Error::ScheduleConflict { .. }));

    clock.set(period_end);
    let tz = flexcore::lookup_tz("UTC").unwrap();
    engine.schedules().run_due(clock.now(), tz).await.unwrap();

    let schedule = store.get_schedule(&schedule_id).await.unwrap();
    assert_eq!(schedule.status, flexcore::ScheduleStatus::Executed);

    let paused = store.get_subscription("sub_1").await.unwrap();
    assert_eq!(paused.status, SubscriptionStatus::Paused);
    assert!(paused.active_pause_id.is_some());

    let active_pause = store.get_active_pause("sub_1").await.unwrap().unwrap();
    assert_eq!(active_pause.mode, PauseMode::AtPeriodEnd);
}
