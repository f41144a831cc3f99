use super::*;

pub const SUPPORTED_MODELS: &[&str] = &["gpt-realtime", "gpt-realtime-mini"];

pub const SUPPORTED_VOICES: &[&str] = &[
    "alloy", "ash", "ballad", "cedar", "coral", "echo", "marin", "sage", "shimmer", "verse",
];

pub const DEFAULT_VOICE: &str = "ash";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewUserParams {
    pub telegram_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserWithPlan {
    pub user: user::Model,
    pub has_active_subscription: bool,
    pub current_plan_name: Option<String>,
}

impl Database {
    /// Creates the user identified by `params.telegram_id`, or refreshes the
    /// profile of an existing one.
    ///
    /// New users start with `default_balance` tokens. An existing user's
    /// balance is never touched here.
    pub async fn create_or_update_user(
        &self,
        params: &NewUserParams,
        default_balance: i32,
    ) -> Result<UserWithPlan> {
        if params.telegram_id.trim().is_empty() {
            return Err(Error::InvalidArgument("telegram_id is required".into()));
        }
        if params.first_name.trim().is_empty() {
            return Err(Error::InvalidArgument("first_name is required".into()));
        }
        if default_balance < 0 {
            return Err(Error::InvalidArgument(format!(
                "default token balance must not be negative, got {default_balance}"
            )));
        }

        self.transaction(|tx| async move {
            let now = now();
            let user = user::Entity::insert(user::ActiveModel {
                telegram_id: ActiveValue::set(params.telegram_id.clone()),
                username: ActiveValue::set(params.username.clone()),
                first_name: ActiveValue::set(params.first_name.clone()),
                last_name: ActiveValue::set(params.last_name.clone()),
                language_code: ActiveValue::set(params.language_code.clone()),
                is_premium: ActiveValue::set(params.is_premium),
                token_balance: ActiveValue::set(default_balance),
                created_at: ActiveValue::set(now),
                updated_at: ActiveValue::set(now),
                last_active: ActiveValue::set(now),
                ..Default::default()
            })
            .on_conflict(
                OnConflict::column(user::Column::TelegramId)
                    .update_columns([
                        user::Column::Username,
                        user::Column::FirstName,
                        user::Column::LastName,
                        user::Column::LanguageCode,
                        user::Column::IsPremium,
                        user::Column::UpdatedAt,
                        user::Column::LastActive,
                    ])
                    .to_owned(),
            )
            .exec_with_returning(&*tx)
            .await?;

            tracing::info!(user_id = %user.id, telegram_id = %user.telegram_id, "upserted user");
            self.user_with_plan_in_tx(user, &tx).await
        })
        .await
    }

    pub async fn get_user_by_id(&self, user_id: UserId) -> Result<UserWithPlan> {
        self.transaction(|tx| async move {
            let user = self.get_user_in_tx(user_id, false, &tx).await?;
            self.user_with_plan_in_tx(user, &tx).await
        })
        .await
    }

    pub async fn get_user_by_telegram_id(&self, telegram_id: &str) -> Result<UserWithPlan> {
        self.transaction(|tx| async move {
            let user = user::Entity::find()
                .filter(user::Column::TelegramId.eq(telegram_id))
                .one(&*tx)
                .await?
                .ok_or_else(|| Error::not_found(format!("user with telegram id {telegram_id}")))?;
            self.user_with_plan_in_tx(user, &tx).await
        })
        .await
    }

    pub async fn update_selected_model(&self, user_id: UserId, model: &str) -> Result<user::Model> {
        if !SUPPORTED_MODELS.contains(&model) {
            return Err(Error::InvalidArgument(format!(
                "invalid model {model:?}, expected one of {SUPPORTED_MODELS:?}"
            )));
        }

        self.transaction(|tx| async move {
            let user = self.get_user_in_tx(user_id, false, &tx).await?;
            let user = user::ActiveModel {
                id: ActiveValue::unchanged(user.id),
                selected_model: ActiveValue::set(Some(model.to_string())),
                updated_at: ActiveValue::set(now()),
                ..Default::default()
            }
            .update(&*tx)
            .await?;
            Ok(user)
        })
        .await
    }

    pub async fn update_selected_voice(&self, user_id: UserId, voice: &str) -> Result<()> {
        if !SUPPORTED_VOICES.contains(&voice) {
            return Err(Error::InvalidArgument(format!(
                "invalid voice {voice:?}, expected one of {SUPPORTED_VOICES:?}"
            )));
        }

        self.transaction(|tx| async move {
            let result = user::Entity::update_many()
                .col_expr(user::Column::SelectedVoice, Expr::value(voice))
                .col_expr(user::Column::UpdatedAt, Expr::value(now()))
                .filter(user::Column::Id.eq(user_id))
                .exec(&*tx)
                .await?;
            if result.rows_affected == 0 {
                return Err(Error::not_found(format!("user {user_id}")));
            }
            Ok(())
        })
        .await?;

        tracing::info!(%user_id, voice, "selected voice");
        Ok(())
    }

    /// Returns the user's voice, falling back to [`DEFAULT_VOICE`].
    pub async fn get_selected_voice(&self, user_id: UserId) -> Result<String> {
        self.transaction(|tx| async move {
            let user = self.get_user_in_tx(user_id, false, &tx).await?;
            Ok(user
                .selected_voice
                .filter(|voice| !voice.is_empty())
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()))
        })
        .await
    }

    /// Loads a user, taking a row lock when `lock` is set.
    pub(crate) async fn get_user_in_tx(
        &self,
        user_id: UserId,
        lock: bool,
        tx: &DatabaseTransaction,
    ) -> Result<user::Model> {
        let mut query = user::Entity::find_by_id(user_id);
        if lock {
            query = query.lock_exclusive();
        }
        query
            .one(tx)
            .await?
            .ok_or_else(|| Error::not_found(format!("user {user_id}")))
    }

    async fn user_with_plan_in_tx(
        &self,
        user: user::Model,
        tx: &DatabaseTransaction,
    ) -> Result<UserWithPlan> {
        let active = self.active_subscription_in_tx(user.id, false, tx).await?;
        Ok(UserWithPlan {
            user,
            has_active_subscription: active.is_some(),
            current_plan_name: active.map(|(_, plan)| plan.name),
        })
    }
}
