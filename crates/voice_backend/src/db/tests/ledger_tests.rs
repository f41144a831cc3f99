use super::*;
use crate::test_both_dbs;
use pretty_assertions::assert_eq;

test_both_dbs!(
    test_deduct_tokens,
    test_deduct_tokens_postgres,
    test_deduct_tokens_sqlite
);

async fn test_deduct_tokens(db: &Arc<Database>) {
    let user_id = new_test_user(db, "100").await;
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 1000);

    let reported = TokenUsage {
        total_tokens: 300,
        input_tokens: 120,
        output_tokens: 180,
        input_token_details: Some(TokenUsageDetails {
            text_tokens: 20,
            audio_tokens: 90,
            image_tokens: 0,
            cached_tokens: 10,
        }),
        output_token_details: Some(TokenUsageDetails {
            text_tokens: 30,
            audio_tokens: 150,
            ..Default::default()
        }),
    };
    let response = db
        .deduct_tokens(user_id, &reported, "session-1", false)
        .await
        .unwrap();
    assert_eq!(
        response,
        TokenUsageResponse {
            tokens_used: 300,
            new_balance: 700,
            usage_breakdown: Some(UsageBreakdown {
                input: TokenBreakdown {
                    total: 120,
                    text: 20,
                    audio: 90,
                    image: 0,
                    cached: 10,
                },
                output: TokenBreakdown {
                    total: 180,
                    text: 30,
                    audio: 150,
                    image: 0,
                    cached: 0,
                },
                total: 300,
            }),
        }
    );
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 700);

    let records = token_usage::Entity::find()
        .filter(token_usage::Column::UserId.eq(user_id))
        .all(&db.pool)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, "session-1");
    assert_eq!(records[0].cost_tokens, 300);
    assert_eq!(records[0].input_audio_tokens, 90);
    assert_eq!(records[0].output_audio_tokens, 150);

    // Spending the exact balance is allowed.
    let response = db
        .deduct_tokens(user_id, &usage(700), "session-1", false)
        .await
        .unwrap();
    assert_eq!(response.new_balance, 0);

    // A zero-token response is recorded without changing the balance.
    let response = db
        .deduct_tokens(user_id, &usage(0), "session-1", false)
        .await
        .unwrap();
    assert_eq!(response.tokens_used, 0);
    assert_eq!(response.new_balance, 0);
}

test_both_dbs!(
    test_insufficient_balance_writes_nothing,
    test_insufficient_balance_writes_nothing_postgres,
    test_insufficient_balance_writes_nothing_sqlite
);

async fn test_insufficient_balance_writes_nothing(db: &Arc<Database>) {
    let user_id = new_test_user(db, "101").await;
    db.deduct_tokens(user_id, &usage(900), "session", false)
        .await
        .unwrap();

    let error = db
        .deduct_tokens(user_id, &usage(150), "session", false)
        .await
        .unwrap_err();
    assert!(
        matches!(
            error,
            Error::InsufficientBalance {
                balance: 100,
                required: 150
            }
        ),
        "unexpected error {error:?}"
    );
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 100);

    let record_count = token_usage::Entity::find()
        .filter(token_usage::Column::UserId.eq(user_id))
        .count(&db.pool)
        .await
        .unwrap();
    assert_eq!(record_count, 1);
}

test_both_dbs!(
    test_check_only_is_pure,
    test_check_only_is_pure_postgres,
    test_check_only_is_pure_sqlite
);

async fn test_check_only_is_pure(db: &Arc<Database>) {
    let user_id = new_test_user(db, "102").await;

    let response = db
        .deduct_tokens(user_id, &usage(400), "session", true)
        .await
        .unwrap();
    assert_eq!(
        response,
        TokenUsageResponse {
            tokens_used: 0,
            new_balance: 1000,
            usage_breakdown: None,
        }
    );
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 1000);
    assert_eq!(
        token_usage::Entity::find().count(&db.pool).await.unwrap(),
        0
    );

    // The sufficiency check still applies.
    let error = db
        .deduct_tokens(user_id, &usage(1001), "session", true)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InsufficientBalance { .. }));
}

test_both_dbs!(
    test_concurrent_deductions,
    test_concurrent_deductions_postgres,
    test_concurrent_deductions_sqlite
);

async fn test_concurrent_deductions(db: &Arc<Database>) {
    let user_id = new_test_user(db, "103").await;

    let deductions = (0..10)
        .map(|i| {
            let db = db.clone();
            tokio::spawn(async move {
                db.deduct_tokens(user_id, &usage(150), &format!("session-{i}"), false)
                    .await
            })
        })
        .collect::<Vec<_>>();

    let mut succeeded = 0;
    for deduction in deductions {
        match deduction.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::InsufficientBalance { required: 150, .. }) => {}
            Err(error) => panic!("unexpected error {error:?}"),
        }
    }

    // 1000 tokens cover six deductions of 150 and leave 100.
    assert_eq!(succeeded, 6);
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 100);
    assert_eq!(
        token_usage::Entity::find()
            .filter(token_usage::Column::UserId.eq(user_id))
            .count(&db.pool)
            .await
            .unwrap(),
        6
    );
}

test_both_dbs!(
    test_ledger_rejects_invalid_input,
    test_ledger_rejects_invalid_input_postgres,
    test_ledger_rejects_invalid_input_sqlite
);

async fn test_ledger_rejects_invalid_input(db: &Arc<Database>) {
    let user_id = new_test_user(db, "104").await;

    let error = db
        .deduct_tokens(user_id, &usage(-5), "session", false)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));

    let error = db.add_tokens(user_id, -1).await.unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));

    let error = db.add_tokens(user_id, i32::MAX).await.unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 1000);

    let missing = UserId(user_id.0 + 1000);
    assert!(matches!(
        db.get_token_balance(missing).await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        db.deduct_tokens(missing, &usage(1), "session", false)
            .await
            .unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        db.add_tokens(missing, 1).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

test_both_dbs!(
    test_add_tokens,
    test_add_tokens_postgres,
    test_add_tokens_sqlite
);

async fn test_add_tokens(db: &Arc<Database>) {
    let user_id = new_test_user(db, "105").await;
    assert_eq!(db.add_tokens(user_id, 250).await.unwrap(), 1250);
    assert_eq!(db.add_tokens(user_id, 0).await.unwrap(), 1250);
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 1250);

    // Credits are not usage.
    assert_eq!(
        token_usage::Entity::find().count(&db.pool).await.unwrap(),
        0
    );
}

test_both_dbs!(
    test_deduction_scenario,
    test_deduction_scenario_postgres,
    test_deduction_scenario_sqlite
);

async fn test_deduction_scenario(db: &Arc<Database>) {
    let user_id = new_test_user(db, "106").await;
    assert_eq!(
        db.resolve_plan_level(user_id).await.unwrap(),
        PlanLevel::free()
    );

    let response = db
        .deduct_tokens(user_id, &usage(200), "session", false)
        .await
        .unwrap();
    assert_eq!(response.tokens_used, 200);
    assert_eq!(response.new_balance, 800);

    let records = token_usage::Entity::find()
        .filter(token_usage::Column::UserId.eq(user_id))
        .all(&db.pool)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cost_tokens, 200);

    let error = db
        .deduct_tokens(user_id, &usage(900), "session", false)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::InsufficientBalance {
            balance: 800,
            required: 900
        }
    ));
    assert_eq!(db.get_token_balance(user_id).await.unwrap(), 800);
}
