use super::*;
use crate::db::user_subscription::SubscriptionStatus;

impl Database {
    /// Starts a subscription to `plan_id` for the user.
    ///
    /// Any subscription that is still active is expired first, and the user's
    /// balance is reset to the plan's allotment. Returns the new subscription
    /// and the new balance.
    pub async fn open_subscription(
        &self,
        user_id: UserId,
        plan_id: SubscriptionPlanId,
        payment_id: Option<String>,
    ) -> Result<(UserSubscriptionId, i32)> {
        let (subscription_id, new_balance) = self
            .transaction(|tx| async move {
                self.get_user_in_tx(user_id, true, &tx).await?;
                let plan = subscription_plan::Entity::find_by_id(plan_id)
                    .one(&*tx)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("plan {plan_id}")))?;

                let now = now();
                user_subscription::Entity::update_many()
                    .col_expr(
                        user_subscription::Column::Status,
                        Expr::value(SubscriptionStatus::Expired),
                    )
                    .col_expr(user_subscription::Column::EndDate, Expr::value(now))
                    .col_expr(user_subscription::Column::UpdatedAt, Expr::value(now))
                    .filter(user_subscription::Column::UserId.eq(user_id))
                    .filter(user_subscription::Column::Status.eq(SubscriptionStatus::Active))
                    .exec(&*tx)
                    .await?;

                let subscription = user_subscription::Entity::insert(user_subscription::ActiveModel {
                    id: ActiveValue::not_set(),
                    user_id: ActiveValue::set(user_id),
                    plan_id: ActiveValue::set(plan.id),
                    start_date: ActiveValue::set(now),
                    end_date: ActiveValue::set(None),
                    status: ActiveValue::set(SubscriptionStatus::Active),
                    payment_id: ActiveValue::set(payment_id),
                    created_at: ActiveValue::set(now),
                    updated_at: ActiveValue::set(now),
                })
                .exec_with_returning(&*tx)
                .await?;

                user::Entity::update_many()
                    .col_expr(user::Column::TokenBalance, Expr::value(plan.token_amount))
                    .col_expr(user::Column::UpdatedAt, Expr::value(now))
                    .filter(user::Column::Id.eq(user_id))
                    .exec(&*tx)
                    .await?;

                Ok((subscription.id, plan.token_amount))
            })
            .await?;

        tracing::info!(
            %user_id,
            %plan_id,
            %subscription_id,
            new_balance,
            "opened subscription"
        );
        Ok((subscription_id, new_balance))
    }

    /// Marks an active subscription as expired, closing its usage window.
    /// A subscription that is already expired or cancelled is returned as is.
    pub async fn expire_subscription(
        &self,
        subscription_id: UserSubscriptionId,
    ) -> Result<user_subscription::Model> {
        self.transaction(|tx| async move {
            self.transition_subscription_in_tx(subscription_id, SubscriptionStatus::Expired, &tx)
                .await
        })
        .await
    }

    /// Marks an active subscription as cancelled. Terminal subscriptions are
    /// left untouched.
    pub async fn cancel_subscription(
        &self,
        subscription_id: UserSubscriptionId,
    ) -> Result<user_subscription::Model> {
        self.transaction(|tx| async move {
            self.transition_subscription_in_tx(
                subscription_id,
                SubscriptionStatus::Cancelled,
                &tx,
            )
            .await
        })
        .await
    }

    pub(crate) async fn transition_subscription_in_tx(
        &self,
        subscription_id: UserSubscriptionId,
        status: SubscriptionStatus,
        tx: &DatabaseTransaction,
    ) -> Result<user_subscription::Model> {
        let subscription = user_subscription::Entity::find_by_id(subscription_id)
            .lock_exclusive()
            .one(tx)
            .await?
            .ok_or_else(|| Error::not_found(format!("subscription {subscription_id}")))?;
        if subscription.status.is_terminal() || status == SubscriptionStatus::Active {
            return Ok(subscription);
        }

        let now = now();
        Ok(user_subscription::ActiveModel {
            id: ActiveValue::unchanged(subscription_id),
            status: ActiveValue::set(status),
            end_date: ActiveValue::set(Some(now)),
            updated_at: ActiveValue::set(now),
            ..Default::default()
        }
        .update(tx)
        .await?)
    }
}
