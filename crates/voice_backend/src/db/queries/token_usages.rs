use super::*;

/// Usage reported by the realtime API for a single response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub total_tokens: i32,
    #[serde(default)]
    pub input_tokens: i32,
    #[serde(default)]
    pub output_tokens: i32,
    #[serde(default)]
    pub input_token_details: Option<TokenUsageDetails>,
    #[serde(default)]
    pub output_token_details: Option<TokenUsageDetails>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageDetails {
    #[serde(default)]
    pub text_tokens: i32,
    #[serde(default)]
    pub audio_tokens: i32,
    #[serde(default)]
    pub image_tokens: i32,
    #[serde(default)]
    pub cached_tokens: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TokenUsageResponse {
    pub tokens_used: i32,
    pub new_balance: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_breakdown: Option<UsageBreakdown>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UsageBreakdown {
    pub input: TokenBreakdown,
    pub output: TokenBreakdown,
    pub total: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenBreakdown {
    pub total: i32,
    pub text: i32,
    pub audio: i32,
    pub image: i32,
    pub cached: i32,
}

impl TokenUsage {
    pub fn breakdown(&self) -> UsageBreakdown {
        let input = self.input_token_details.clone().unwrap_or_default();
        let output = self.output_token_details.clone().unwrap_or_default();
        UsageBreakdown {
            input: TokenBreakdown {
                total: self.input_tokens,
                text: input.text_tokens,
                audio: input.audio_tokens,
                image: input.image_tokens,
                cached: input.cached_tokens,
            },
            output: TokenBreakdown {
                total: self.output_tokens,
                text: output.text_tokens,
                audio: output.audio_tokens,
                image: 0,
                cached: 0,
            },
            total: self.total_tokens,
        }
    }
}

impl Database {
    /// Returns the user's current token balance.
    pub async fn get_token_balance(&self, user_id: UserId) -> Result<i32> {
        self.transaction(|tx| async move {
            let user = self.get_user_in_tx(user_id, false, &tx).await?;
            Ok(user.token_balance)
        })
        .await
    }

    /// Charges `usage.total_tokens` against the user's balance and records the
    /// usage, or fails without writing anything.
    ///
    /// The balance row is locked for the duration of the transaction, so
    /// concurrent deductions for the same user are applied one after another
    /// and can never drive the balance below zero. With `check_only` the
    /// sufficiency check runs but nothing is written.
    pub async fn deduct_tokens(
        &self,
        user_id: UserId,
        usage: &TokenUsage,
        session_id: &str,
        check_only: bool,
    ) -> Result<TokenUsageResponse> {
        let total = usage.total_tokens;
        if total < 0 {
            return Err(Error::InvalidArgument(format!(
                "total_tokens must not be negative, got {total}"
            )));
        }

        let response = self
            .transaction(|tx| async move {
                let user = self.get_user_in_tx(user_id, true, &tx).await?;
                if user.token_balance < total {
                    return Err(Error::InsufficientBalance {
                        balance: user.token_balance,
                        required: total,
                    });
                }

                if check_only {
                    return Ok(TokenUsageResponse {
                        tokens_used: 0,
                        new_balance: user.token_balance,
                        usage_breakdown: None,
                    });
                }

                let now = now();
                let result = user::Entity::update_many()
                    .col_expr(
                        user::Column::TokenBalance,
                        Expr::col(user::Column::TokenBalance).sub(total),
                    )
                    .col_expr(user::Column::UpdatedAt, Expr::value(now))
                    .filter(user::Column::Id.eq(user_id))
                    .filter(user::Column::TokenBalance.gte(total))
                    .exec(&*tx)
                    .await?;
                if result.rows_affected != 1 {
                    // The balance moved after it was read.
                    return Err(Error::TransactionConflict);
                }

                self.insert_token_usage_in_tx(user_id, usage, session_id, now, &tx)
                    .await?;

                Ok(TokenUsageResponse {
                    tokens_used: total,
                    new_balance: user.token_balance - total,
                    usage_breakdown: Some(usage.breakdown()),
                })
            })
            .await?;

        if !check_only {
            tracing::info!(
                %user_id,
                session_id,
                tokens_used = response.tokens_used,
                new_balance = response.new_balance,
                "deducted tokens"
            );
        }
        Ok(response)
    }

    async fn insert_token_usage_in_tx(
        &self,
        user_id: UserId,
        usage: &TokenUsage,
        session_id: &str,
        created_at: DateTimeUtc,
        tx: &DatabaseTransaction,
    ) -> Result<token_usage::Model> {
        let input = usage.input_token_details.clone().unwrap_or_default();
        let output = usage.output_token_details.clone().unwrap_or_default();

        Ok(token_usage::Entity::insert(token_usage::ActiveModel {
            id: ActiveValue::not_set(),
            user_id: ActiveValue::set(user_id),
            session_id: ActiveValue::set(session_id.to_string()),
            input_tokens: ActiveValue::set(usage.input_tokens),
            output_tokens: ActiveValue::set(usage.output_tokens),
            total_tokens: ActiveValue::set(usage.total_tokens),
            cost_tokens: ActiveValue::set(usage.total_tokens),
            input_text_tokens: ActiveValue::set(input.text_tokens),
            input_audio_tokens: ActiveValue::set(input.audio_tokens),
            input_image_tokens: ActiveValue::set(input.image_tokens),
            cached_tokens: ActiveValue::set(input.cached_tokens),
            output_text_tokens: ActiveValue::set(output.text_tokens),
            output_audio_tokens: ActiveValue::set(output.audio_tokens),
            created_at: ActiveValue::set(created_at),
        })
        .exec_with_returning(tx)
        .await?)
    }

    /// Credits `amount` tokens to the user and returns the new balance.
    pub async fn add_tokens(&self, user_id: UserId, amount: i32) -> Result<i32> {
        if amount < 0 {
            return Err(Error::InvalidArgument(format!(
                "token amount must not be negative, got {amount}"
            )));
        }

        let new_balance = self
            .transaction(|tx| async move {
                let user = self.get_user_in_tx(user_id, true, &tx).await?;
                let new_balance = user.token_balance.checked_add(amount).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "adding {amount} tokens would overflow the balance of user {user_id}"
                    ))
                })?;

                user::Entity::update_many()
                    .col_expr(user::Column::TokenBalance, Expr::value(new_balance))
                    .col_expr(user::Column::UpdatedAt, Expr::value(now()))
                    .filter(user::Column::Id.eq(user_id))
                    .exec(&*tx)
                    .await?;

                Ok(new_balance)
            })
            .await?;

        tracing::info!(%user_id, amount, new_balance, "added tokens");
        Ok(new_balance)
    }

    /// Sums the tokens charged to `user_id` inside `[start, end)`. An open
    /// end means the window is still running.
    pub(crate) async fn tokens_used_in_window_in_tx(
        &self,
        user_id: UserId,
        start: DateTimeUtc,
        end: Option<DateTimeUtc>,
        tx: &DatabaseTransaction,
    ) -> Result<i32> {
        let mut query = token_usage::Entity::find()
            .select_only()
            .column_as(Expr::col(token_usage::Column::CostTokens).sum(), "tokens_used")
            .filter(token_usage::Column::UserId.eq(user_id))
            .filter(token_usage::Column::CreatedAt.gte(start));
        if let Some(end) = end {
            query = query.filter(token_usage::Column::CreatedAt.lt(end));
        }

        let used = query
            .into_tuple::<Option<i64>>()
            .one(tx)
            .await?
            .flatten()
            .unwrap_or(0);
        Ok(i32::try_from(used).unwrap_or(i32::MAX))
    }
}
