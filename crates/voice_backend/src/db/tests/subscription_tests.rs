use super::*;
use crate::test_both_dbs;
use pretty_assertions::assert_eq;
use crate::db::user_subscription::SubscriptionStatus;

async fn active_subscription_count(db: &Database, user_id: UserId) -> u64 {
    user_subscription::Entity::find()
        .filter(user_subscription::Column::UserId.eq(user_id))
        .filter(user_subscription::Column::Status.eq(SubscriptionStatus::Active))
        .count(&db.pool)
        .await
        .unwrap()
}

test_both_dbs!(
    test_open_subscription_supersedes_active,
    test_open_subscription_supersedes_active_postgres,
    test_open_subscription_supersedes_active_sqlite
);

async fn test_open_subscription_supersedes_active(db: &Arc<Database>) {
    let user_id = new_test_user(db, "200").await;
    let premium = new_test_plan(db, "Premium", 2, 5000).await;
    let pro = new_test_plan(db, "Pro", 3, 20000).await;

    let (first_id, balance) = db
        .open_subscription(user_id, premium, Some("payment-1".into()))
        .await
        .unwrap();
    assert_eq!(balance, 5000);
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 5000);
    assert_eq!(
        db.resolve_plan_level(user_id).await.unwrap(),
        PlanLevel {
            plan_name: "Premium".into(),
            plan_level: 2,
        }
    );

    db.deduct_tokens(user_id, &usage(1200), "session", false)
        .await
        .unwrap();

    let (second_id, balance) = db.open_subscription(user_id, pro, None).await.unwrap();
    assert_ne!(first_id, second_id);
    // Reset, not additive: the unused premium tokens are gone.
    assert_eq!(balance, 20000);
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 20000);
    assert_eq!(active_subscription_count(db, user_id).await, 1);

    let first = user_subscription::Entity::find_by_id(first_id)
        .one(&db.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, SubscriptionStatus::Expired);
    assert_eq!(first.payment_id.as_deref(), Some("payment-1"));
    let second = user_subscription::Entity::find_by_id(second_id)
        .one(&db.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.status, SubscriptionStatus::Active);
    assert_eq!(second.end_date, None);
    assert_eq!(first.end_date, Some(second.start_date));

    assert_eq!(
        db.resolve_plan_level(user_id).await.unwrap(),
        PlanLevel {
            plan_name: "Pro".into(),
            plan_level: 3,
        }
    );

    for _ in 0..3 {
        db.open_subscription(user_id, premium, None).await.unwrap();
    }
    assert_eq!(active_subscription_count(db, user_id).await, 1);
}

test_both_dbs!(
    test_open_subscription_not_found,
    test_open_subscription_not_found_postgres,
    test_open_subscription_not_found_sqlite
);

async fn test_open_subscription_not_found(db: &Arc<Database>) {
    let user_id = new_test_user(db, "201").await;
    let plan_id = new_test_plan(db, "Premium", 2, 5000).await;

    let error = db
        .open_subscription(user_id, SubscriptionPlanId(plan_id.0 + 100), None)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));

    let error = db
        .open_subscription(UserId(user_id.0 + 100), plan_id, None)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));

    // Nothing was written by the failed attempts.
    assert_eq!(active_subscription_count(db, user_id).await, 0);
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 1000);
}

test_both_dbs!(
    test_expire_subscription_is_idempotent,
    test_expire_subscription_is_idempotent_postgres,
    test_expire_subscription_is_idempotent_sqlite
);

async fn test_expire_subscription_is_idempotent(db: &Arc<Database>) {
    let user_id = new_test_user(db, "202").await;
    let plan_id = new_test_plan(db, "Premium", 2, 5000).await;
    let (subscription_id, _) = db.open_subscription(user_id, plan_id, None).await.unwrap();

    let expired = db.expire_subscription(subscription_id).await.unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    assert!(expired.end_date.is_some());

    advance_clock().await;
    let expired_again = db.expire_subscription(subscription_id).await.unwrap();
    assert_eq!(expired_again, expired);

    // Terminal states never transition.
    let cancelled = db.cancel_subscription(subscription_id).await.unwrap();
    assert_eq!(cancelled, expired);

    assert_eq!(
        db.resolve_plan_level(user_id).await.unwrap(),
        PlanLevel::free()
    );

    assert!(matches!(
        db.expire_subscription(UserSubscriptionId(subscription_id.0 + 100))
            .await
            .unwrap_err(),
        Error::NotFound(_)
    ));
}

test_both_dbs!(
    test_cancel_subscription,
    test_cancel_subscription_postgres,
    test_cancel_subscription_sqlite
);

async fn test_cancel_subscription(db: &Arc<Database>) {
    let user_id = new_test_user(db, "203").await;
    let plan_id = new_test_plan(db, "Premium", 2, 5000).await;
    let (subscription_id, _) = db.open_subscription(user_id, plan_id, None).await.unwrap();

    let cancelled = db.cancel_subscription(subscription_id).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert!(cancelled.end_date.is_some());

    let expired = db.expire_subscription(subscription_id).await.unwrap();
    assert_eq!(expired, cancelled);

    let plans = db.get_user_plans(user_id).await.unwrap();
    assert!(plans.active_plans.is_empty());
    assert_eq!(plans.closed_plans.len(), 1);
    assert_eq!(plans.closed_plans[0].status, SubscriptionStatus::Cancelled);
}

test_both_dbs!(
    test_concurrent_open_subscription,
    test_concurrent_open_subscription_postgres,
    test_concurrent_open_subscription_sqlite
);

async fn test_concurrent_open_subscription(db: &Arc<Database>) {
    let user_id = new_test_user(db, "204").await;
    let plan_id = new_test_plan(db, "Premium", 2, 5000).await;

    let opens = (0..5)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.open_subscription(user_id, plan_id, None).await })
        })
        .collect::<Vec<_>>();
    for open in opens {
        match open.await.unwrap() {
            Ok(_) | Err(Error::TransactionConflict) => {}
            Err(error) => panic!("unexpected error {error:?}"),
        }
    }

    assert_eq!(active_subscription_count(db, user_id).await, 1);
}
