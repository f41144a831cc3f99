use super::*;

/// Name reported for users without an active subscription.
pub const FREE_PLAN_NAME: &str = "Free";

/// Entitlement level of users without an active subscription.
pub const FREE_PLAN_LEVEL: i32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlanLevel {
    pub plan_name: String,
    pub plan_level: i32,
}

impl PlanLevel {
    pub fn free() -> Self {
        Self {
            plan_name: FREE_PLAN_NAME.to_string(),
            plan_level: FREE_PLAN_LEVEL,
        }
    }
}

/// Consumption of a user's active subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanUsage {
    pub subscription: user_subscription::Model,
    pub plan: subscription_plan::Model,
    pub tokens_used: i32,
    pub tokens_remaining: i32,
}

impl PlanUsage {
    fn new(
        subscription: user_subscription::Model,
        plan: subscription_plan::Model,
        tokens_used: i32,
    ) -> Self {
        let tokens_remaining = plan.token_amount.saturating_sub(tokens_used).max(0);
        Self {
            subscription,
            plan,
            tokens_used,
            tokens_remaining,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.tokens_remaining == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CurrentPlanDetail {
    pub has_active_subscription: bool,
    pub current_plan_name: String,
    pub plan_level: i32,
    pub token_balance: i32,
    /// Set when the subscription that was active ran out of tokens and was
    /// expired while building this detail.
    pub exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<UserSubscriptionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_token_amount: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used_in_plan: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_remaining_in_plan: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTimeUtc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTimeUtc>,
    pub features: Vec<String>,
}

impl CurrentPlanDetail {
    fn free(token_balance: i32) -> Self {
        Self {
            has_active_subscription: false,
            current_plan_name: FREE_PLAN_NAME.to_string(),
            plan_level: FREE_PLAN_LEVEL,
            token_balance,
            exhausted: false,
            subscription_id: None,
            plan_token_amount: None,
            tokens_used_in_plan: None,
            tokens_remaining_in_plan: None,
            start_date: None,
            end_date: None,
            features: Vec::new(),
        }
    }

    /// The free tier, still carrying the figures of the subscription that
    /// was just expired.
    fn exhausted(token_balance: i32, usage: PlanUsage) -> Self {
        Self {
            exhausted: true,
            subscription_id: Some(usage.subscription.id),
            plan_token_amount: Some(usage.plan.token_amount),
            tokens_used_in_plan: Some(usage.tokens_used),
            tokens_remaining_in_plan: Some(usage.tokens_remaining),
            start_date: Some(usage.subscription.start_date),
            end_date: usage.subscription.end_date,
            ..Self::free(token_balance)
        }
    }

    fn active(token_balance: i32, usage: PlanUsage) -> Self {
        Self {
            has_active_subscription: true,
            current_plan_name: usage.plan.name,
            plan_level: usage.plan.level,
            token_balance,
            exhausted: false,
            subscription_id: Some(usage.subscription.id),
            plan_token_amount: Some(usage.plan.token_amount),
            tokens_used_in_plan: Some(usage.tokens_used),
            tokens_remaining_in_plan: Some(usage.tokens_remaining),
            start_date: Some(usage.subscription.start_date),
            end_date: usage.subscription.end_date,
            features: usage.plan.features.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserPlanDetails {
    pub id: UserSubscriptionId,
    pub plan_id: SubscriptionPlanId,
    pub plan_name: String,
    pub plan_level: i32,
    pub token_amount: i32,
    pub tokens_used: i32,
    pub tokens_remaining: i32,
    pub start_date: DateTimeUtc,
    pub end_date: Option<DateTimeUtc>,
    pub status: user_subscription::SubscriptionStatus,
    pub features: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UserPlans {
    pub active_plans: Vec<UserPlanDetails>,
    pub closed_plans: Vec<UserPlanDetails>,
}

/// The editable fields of a catalog plan.
#[derive(Clone, Debug, Deserialize)]
pub struct PlanParams {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i32,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub token_amount: i32,
    pub level: i32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

fn default_currency() -> String {
    "RUB".into()
}

fn default_is_active() -> bool {
    true
}

impl PlanParams {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidArgument("plan name is required".into()));
        }
        if self.currency.trim().is_empty() {
            return Err(Error::InvalidArgument("plan currency is required".into()));
        }
        if self.price_cents < 0 {
            return Err(Error::InvalidArgument(format!(
                "plan price must not be negative, got {}",
                self.price_cents
            )));
        }
        if self.token_amount < 0 {
            return Err(Error::InvalidArgument(format!(
                "plan token amount must not be negative, got {}",
                self.token_amount
            )));
        }
        if self.level < FREE_PLAN_LEVEL {
            return Err(Error::InvalidArgument(format!(
                "plan level must be at least {FREE_PLAN_LEVEL}, got {}",
                self.level
            )));
        }
        Ok(())
    }
}

impl Database {
    /// Returns the name and entitlement level of the user's active plan, or
    /// the free tier when there is none.
    pub async fn resolve_plan_level(&self, user_id: UserId) -> Result<PlanLevel> {
        self.transaction(|tx| async move {
            self.get_user_in_tx(user_id, false, &tx).await?;
            self.plan_level_in_tx(user_id, &tx).await
        })
        .await
    }

    pub(crate) async fn plan_level_in_tx(
        &self,
        user_id: UserId,
        tx: &DatabaseTransaction,
    ) -> Result<PlanLevel> {
        Ok(match self.active_subscription_in_tx(user_id, false, tx).await? {
            Some((_, plan)) => PlanLevel {
                plan_name: plan.name,
                plan_level: plan.level,
            },
            None => PlanLevel::free(),
        })
    }

    /// Reads how much of the active subscription's allotment has been used.
    /// Never writes; an exhausted subscription is reported as such but left
    /// active. Returns `None` when the user has no active subscription.
    pub async fn get_plan_usage(&self, user_id: UserId) -> Result<Option<PlanUsage>> {
        self.transaction(|tx| async move {
            self.get_user_in_tx(user_id, false, &tx).await?;
            self.plan_usage_in_tx(user_id, false, &tx).await
        })
        .await
    }

    /// Expires the user's active subscription if its allotment is used up.
    /// Returns the final usage of the subscription that was expired, if any.
    pub async fn enforce_plan_exhaustion(&self, user_id: UserId) -> Result<Option<PlanUsage>> {
        self.transaction(|tx| async move {
            self.get_user_in_tx(user_id, false, &tx).await?;
            self.enforce_plan_exhaustion_in_tx(user_id, &tx).await
        })
        .await
    }

    async fn enforce_plan_exhaustion_in_tx(
        &self,
        user_id: UserId,
        tx: &DatabaseTransaction,
    ) -> Result<Option<PlanUsage>> {
        let Some(mut usage) = self.plan_usage_in_tx(user_id, true, tx).await? else {
            return Ok(None);
        };
        if !usage.is_exhausted() {
            return Ok(None);
        }

        usage.subscription = self
            .transition_subscription_in_tx(
                usage.subscription.id,
                user_subscription::SubscriptionStatus::Expired,
                tx,
            )
            .await?;
        tracing::info!(
            %user_id,
            subscription_id = %usage.subscription.id,
            tokens_used = usage.tokens_used,
            "expired exhausted subscription"
        );
        Ok(Some(usage))
    }

    /// Describes the user's current plan and its consumption.
    ///
    /// This is not a pure read: when the active subscription's allotment is
    /// used up it is expired in the same transaction, and the result reports
    /// the free tier with `exhausted` set.
    pub async fn get_current_plan_detail(&self, user_id: UserId) -> Result<CurrentPlanDetail> {
        self.transaction(|tx| async move {
            let user = self.get_user_in_tx(user_id, false, &tx).await?;
            if let Some(usage) = self.enforce_plan_exhaustion_in_tx(user_id, &tx).await? {
                return Ok(CurrentPlanDetail::exhausted(user.token_balance, usage));
            }

            Ok(match self.plan_usage_in_tx(user_id, false, &tx).await? {
                Some(usage) => CurrentPlanDetail::active(user.token_balance, usage),
                None => CurrentPlanDetail::free(user.token_balance),
            })
        })
        .await
    }

    async fn plan_usage_in_tx(
        &self,
        user_id: UserId,
        lock: bool,
        tx: &DatabaseTransaction,
    ) -> Result<Option<PlanUsage>> {
        let Some((subscription, plan)) = self.active_subscription_in_tx(user_id, lock, tx).await?
        else {
            return Ok(None);
        };
        let tokens_used = self
            .tokens_used_in_window_in_tx(user_id, subscription.start_date, subscription.end_date, tx)
            .await?;
        Ok(Some(PlanUsage::new(subscription, plan, tokens_used)))
    }

    /// Loads the user's most recent active subscription together with its plan.
    pub(crate) async fn active_subscription_in_tx(
        &self,
        user_id: UserId,
        lock: bool,
        tx: &DatabaseTransaction,
    ) -> Result<Option<(user_subscription::Model, subscription_plan::Model)>> {
        let mut query = user_subscription::Entity::find()
            .filter(user_subscription::Column::UserId.eq(user_id))
            .filter(
                user_subscription::Column::Status.eq(user_subscription::SubscriptionStatus::Active),
            )
            .order_by_desc(user_subscription::Column::StartDate)
            .order_by_desc(user_subscription::Column::Id);
        if lock {
            query = query.lock_exclusive();
        }

        let Some(subscription) = query.one(tx).await? else {
            return Ok(None);
        };
        let plan = subscription_plan::Entity::find_by_id(subscription.plan_id)
            .one(tx)
            .await?
            .ok_or_else(|| Error::not_found(format!("plan {}", subscription.plan_id)))?;
        Ok(Some((subscription, plan)))
    }

    /// Returns every active plan in the catalog, cheapest first.
    pub async fn get_active_plans(&self) -> Result<Vec<subscription_plan::Model>> {
        self.transaction(|tx| async move {
            Ok(subscription_plan::Entity::find()
                .filter(subscription_plan::Column::IsActive.eq(true))
                .order_by_asc(subscription_plan::Column::PriceCents)
                .order_by_asc(subscription_plan::Column::Id)
                .all(&*tx)
                .await?)
        })
        .await
    }

    pub async fn get_all_plans(&self) -> Result<Vec<subscription_plan::Model>> {
        self.transaction(|tx| async move {
            Ok(subscription_plan::Entity::find()
                .order_by_asc(subscription_plan::Column::Id)
                .all(&*tx)
                .await?)
        })
        .await
    }

    pub async fn create_plan(&self, params: &PlanParams) -> Result<subscription_plan::Model> {
        params.validate()?;
        self.transaction(|tx| async move {
            let plan = subscription_plan::Entity::insert(subscription_plan::ActiveModel {
                id: ActiveValue::not_set(),
                name: ActiveValue::set(params.name.clone()),
                description: ActiveValue::set(params.description.clone()),
                price_cents: ActiveValue::set(params.price_cents),
                currency: ActiveValue::set(params.currency.clone()),
                token_amount: ActiveValue::set(params.token_amount),
                level: ActiveValue::set(params.level),
                features: ActiveValue::set(params.features.clone().into()),
                is_active: ActiveValue::set(params.is_active),
                created_at: ActiveValue::set(now()),
            })
            .exec_with_returning(&*tx)
            .await?;
            tracing::info!(plan_id = %plan.id, name = %plan.name, "created plan");
            Ok(plan)
        })
        .await
    }

    pub async fn update_plan(
        &self,
        plan_id: SubscriptionPlanId,
        params: &PlanParams,
    ) -> Result<subscription_plan::Model> {
        params.validate()?;
        self.transaction(|tx| async move {
            subscription_plan::Entity::find_by_id(plan_id)
                .one(&*tx)
                .await?
                .ok_or_else(|| Error::not_found(format!("plan {plan_id}")))?;

            let plan = subscription_plan::ActiveModel {
                id: ActiveValue::unchanged(plan_id),
                name: ActiveValue::set(params.name.clone()),
                description: ActiveValue::set(params.description.clone()),
                price_cents: ActiveValue::set(params.price_cents),
                currency: ActiveValue::set(params.currency.clone()),
                token_amount: ActiveValue::set(params.token_amount),
                level: ActiveValue::set(params.level),
                features: ActiveValue::set(params.features.clone().into()),
                is_active: ActiveValue::set(params.is_active),
                created_at: ActiveValue::not_set(),
            }
            .update(&*tx)
            .await?;
            tracing::info!(%plan_id, "updated plan");
            Ok(plan)
        })
        .await
    }

    /// Deletes a plan that no subscription has ever referenced.
    pub async fn delete_plan(&self, plan_id: SubscriptionPlanId) -> Result<()> {
        self.transaction(|tx| async move {
            subscription_plan::Entity::find_by_id(plan_id)
                .one(&*tx)
                .await?
                .ok_or_else(|| Error::not_found(format!("plan {plan_id}")))?;

            let references = user_subscription::Entity::find()
                .filter(user_subscription::Column::PlanId.eq(plan_id))
                .count(&*tx)
                .await?;
            if references > 0 {
                return Err(Error::InvalidArgument(format!(
                    "plan {plan_id} is referenced by {references} subscriptions, deactivate it instead"
                )));
            }

            subscription_plan::Entity::delete_by_id(plan_id)
                .exec(&*tx)
                .await?;
            tracing::info!(%plan_id, "deleted plan");
            Ok(())
        })
        .await
    }

    /// Returns the user's subscription history, newest first, split into
    /// the active period and the closed ones.
    pub async fn get_user_plans(&self, user_id: UserId) -> Result<UserPlans> {
        self.transaction(|tx| async move {
            self.get_user_in_tx(user_id, false, &tx).await?;

            let subscriptions = user_subscription::Entity::find()
                .filter(user_subscription::Column::UserId.eq(user_id))
                .find_also_related(subscription_plan::Entity)
                .order_by_desc(user_subscription::Column::StartDate)
                .order_by_desc(user_subscription::Column::Id)
                .all(&*tx)
                .await?;

            let mut plans = UserPlans::default();
            for (subscription, plan) in subscriptions {
                let plan = plan
                    .ok_or_else(|| Error::not_found(format!("plan {}", subscription.plan_id)))?;
                let tokens_used = self
                    .tokens_used_in_window_in_tx(
                        user_id,
                        subscription.start_date,
                        subscription.end_date,
                        &tx,
                    )
                    .await?;

                let details = UserPlanDetails {
                    id: subscription.id,
                    plan_id: plan.id,
                    plan_name: plan.name,
                    plan_level: plan.level,
                    token_amount: plan.token_amount,
                    tokens_used,
                    tokens_remaining: plan.token_amount.saturating_sub(tokens_used).max(0),
                    start_date: subscription.start_date,
                    end_date: subscription.end_date,
                    status: subscription.status,
                    features: plan.features.0,
                };
                if subscription.status.is_terminal() {
                    plans.closed_plans.push(details);
                } else {
                    plans.active_plans.push(details);
                }
            }
            Ok(plans)
        })
        .await
    }
}
