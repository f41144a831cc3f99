use super::*;
use crate::db::user_subscription::SubscriptionStatus;
use crate::test_both_dbs;
use pretty_assertions::assert_eq;

test_both_dbs!(
    test_allotment_exhaustion,
    test_allotment_exhaustion_postgres,
    test_allotment_exhaustion_sqlite
);

async fn test_allotment_exhaustion(db: &Arc<Database>) {
    let user_id = new_test_user(db, "300").await;
    let plan_id = new_test_plan(db, "Starter", 2, 100).await;
    let (subscription_id, balance) = db.open_subscription(user_id, plan_id, None).await.unwrap();
    assert_eq!(balance, 100);

    db.deduct_tokens(user_id, &usage(60), "session", false)
        .await
        .unwrap();
    let detail = db.get_current_plan_detail(user_id).await.unwrap();
    assert_eq!(detail.has_active_subscription, true);
    assert_eq!(detail.exhausted, false);
    assert_eq!(detail.current_plan_name, "Starter");
    assert_eq!(detail.plan_level, 2);
    assert_eq!(detail.subscription_id, Some(subscription_id));
    assert_eq!(detail.plan_token_amount, Some(100));
    assert_eq!(detail.tokens_used_in_plan, Some(60));
    assert_eq!(detail.tokens_remaining_in_plan, Some(40));
    assert_eq!(detail.token_balance, 40);
    assert_eq!(detail.features, vec!["Starter feature".to_string()]);

    db.deduct_tokens(user_id, &usage(40), "session", false)
        .await
        .unwrap();
    let detail = db.get_current_plan_detail(user_id).await.unwrap();
    assert_eq!(detail.has_active_subscription, false);
    assert_eq!(detail.exhausted, true);
    assert_eq!(detail.current_plan_name, FREE_PLAN_NAME);
    assert_eq!(detail.plan_level, FREE_PLAN_LEVEL);
    assert_eq!(detail.subscription_id, Some(subscription_id));
    assert_eq!(detail.tokens_used_in_plan, Some(100));
    assert_eq!(detail.tokens_remaining_in_plan, Some(0));
    assert!(detail.end_date.is_some());

    let subscription = user_subscription::Entity::find_by_id(subscription_id)
        .one(&db.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Expired);
    assert_eq!(subscription.end_date, detail.end_date);

    // A later call sees the free tier and writes nothing.
    let detail = db.get_current_plan_detail(user_id).await.unwrap();
    assert_eq!(detail.has_active_subscription, false);
    assert_eq!(detail.exhausted, false);
    assert_eq!(detail.current_plan_name, FREE_PLAN_NAME);
    assert_eq!(detail.subscription_id, None);
    assert_eq!(
        db.resolve_plan_level(user_id).await.unwrap(),
        PlanLevel::free()
    );
}

test_both_dbs!(
    test_plan_usage_is_a_pure_read,
    test_plan_usage_is_a_pure_read_postgres,
    test_plan_usage_is_a_pure_read_sqlite
);

async fn test_plan_usage_is_a_pure_read(db: &Arc<Database>) {
    let user_id = new_test_user(db, "301").await;
    assert_eq!(db.get_plan_usage(user_id).await.unwrap(), None);
    assert_eq!(db.enforce_plan_exhaustion(user_id).await.unwrap(), None);

    let plan_id = new_test_plan(db, "Starter", 2, 100).await;
    let (subscription_id, _) = db.open_subscription(user_id, plan_id, None).await.unwrap();
    db.deduct_tokens(user_id, &usage(100), "session", false)
        .await
        .unwrap();

    let usage = db.get_plan_usage(user_id).await.unwrap().unwrap();
    assert_eq!(usage.subscription.id, subscription_id);
    assert_eq!(usage.tokens_used, 100);
    assert_eq!(usage.tokens_remaining, 0);
    assert!(usage.is_exhausted());

    // Reading twice leaves the subscription active.
    let usage = db.get_plan_usage(user_id).await.unwrap().unwrap();
    assert_eq!(usage.subscription.status, SubscriptionStatus::Active);

    let expired = db.enforce_plan_exhaustion(user_id).await.unwrap().unwrap();
    assert_eq!(expired.subscription.id, subscription_id);
    assert_eq!(expired.subscription.status, SubscriptionStatus::Expired);
    assert_eq!(db.get_plan_usage(user_id).await.unwrap(), None);
    assert_eq!(db.enforce_plan_exhaustion(user_id).await.unwrap(), None);

    assert!(matches!(
        db.get_plan_usage(UserId(user_id.0 + 100)).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

test_both_dbs!(
    test_usage_window,
    test_usage_window_postgres,
    test_usage_window_sqlite
);

async fn test_usage_window(db: &Arc<Database>) {
    let user_id = new_test_user(db, "302").await;
    let starter = new_test_plan(db, "Starter", 2, 1000).await;
    let pro = new_test_plan(db, "Pro", 3, 2000).await;

    // Usage before any subscription counts against no period.
    db.deduct_tokens(user_id, &usage(300), "session", false)
        .await
        .unwrap();
    advance_clock().await;

    db.open_subscription(user_id, starter, None).await.unwrap();
    db.deduct_tokens(user_id, &usage(250), "session", false)
        .await
        .unwrap();
    advance_clock().await;

    db.open_subscription(user_id, pro, None).await.unwrap();
    db.deduct_tokens(user_id, &usage(400), "session", false)
        .await
        .unwrap();

    let detail = db.get_current_plan_detail(user_id).await.unwrap();
    assert_eq!(detail.current_plan_name, "Pro");
    assert_eq!(detail.tokens_used_in_plan, Some(400));
    assert_eq!(detail.tokens_remaining_in_plan, Some(1600));
    assert_eq!(detail.token_balance, 1600);

    let plans = db.get_user_plans(user_id).await.unwrap();
    assert_eq!(plans.active_plans.len(), 1);
    assert_eq!(plans.active_plans[0].plan_name, "Pro");
    assert_eq!(plans.active_plans[0].tokens_used, 400);
    assert_eq!(plans.active_plans[0].tokens_remaining, 1600);

    assert_eq!(plans.closed_plans.len(), 1);
    assert_eq!(plans.closed_plans[0].plan_name, "Starter");
    assert_eq!(plans.closed_plans[0].status, SubscriptionStatus::Expired);
    assert_eq!(plans.closed_plans[0].tokens_used, 250);
    assert_eq!(plans.closed_plans[0].tokens_remaining, 750);
    assert_eq!(plans.closed_plans[0].features, vec!["Starter feature".to_string()]);
}

test_both_dbs!(
    test_plan_catalog,
    test_plan_catalog_postgres,
    test_plan_catalog_sqlite
);

async fn test_plan_catalog(db: &Arc<Database>) {
    let pro = new_test_plan(db, "Pro", 3, 20000).await;
    let basic = new_test_plan(db, "Basic", 1, 1000).await;
    let premium = new_test_plan(db, "Premium", 2, 5000).await;

    let active = db.get_active_plans().await.unwrap();
    assert_eq!(
        active.iter().map(|plan| plan.id).collect::<Vec<_>>(),
        vec![basic, premium, pro]
    );

    let mut params = PlanParams {
        name: "Premium".into(),
        description: Some("Retired".into()),
        price_cents: 49900,
        currency: "RUB".into(),
        token_amount: 6000,
        level: 2,
        features: vec!["More tokens".into()],
        is_active: false,
    };
    let updated = db.update_plan(premium, &params).await.unwrap();
    assert_eq!(updated.token_amount, 6000);
    assert_eq!(updated.description.as_deref(), Some("Retired"));
    assert_eq!(updated.features.0, vec!["More tokens".to_string()]);
    assert_eq!(
        db.get_active_plans()
            .await
            .unwrap()
            .iter()
            .map(|plan| plan.id)
            .collect::<Vec<_>>(),
        vec![basic, pro]
    );
    assert_eq!(db.get_all_plans().await.unwrap().len(), 3);

    assert!(matches!(
        db.update_plan(SubscriptionPlanId(pro.0 + 100), &params)
            .await
            .unwrap_err(),
        Error::NotFound(_)
    ));

    params.level = 0;
    assert!(matches!(
        db.create_plan(&params).await.unwrap_err(),
        Error::InvalidArgument(_)
    ));
    params.level = 2;
    params.token_amount = -1;
    assert!(matches!(
        db.update_plan(premium, &params).await.unwrap_err(),
        Error::InvalidArgument(_)
    ));
}

test_both_dbs!(
    test_delete_plan,
    test_delete_plan_postgres,
    test_delete_plan_sqlite
);

async fn test_delete_plan(db: &Arc<Database>) {
    let user_id = new_test_user(db, "303").await;
    let unused = new_test_plan(db, "Unused", 1, 100).await;
    let referenced = new_test_plan(db, "Referenced", 2, 100).await;
    let (subscription_id, _) = db.open_subscription(user_id, referenced, None).await.unwrap();
    db.expire_subscription(subscription_id).await.unwrap();

    db.delete_plan(unused).await.unwrap();
    assert!(matches!(
        db.delete_plan(unused).await.unwrap_err(),
        Error::NotFound(_)
    ));

    // History keeps its plan even after the subscription closed.
    assert!(matches!(
        db.delete_plan(referenced).await.unwrap_err(),
        Error::InvalidArgument(_)
    ));
    assert_eq!(db.get_all_plans().await.unwrap().len(), 1);
}
