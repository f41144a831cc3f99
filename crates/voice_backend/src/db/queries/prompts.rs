use super::*;

/// How many custom prompts a plan level may keep. `None` means unlimited.
pub fn prompt_quota(plan_level: i32) -> Option<usize> {
    match plan_level {
        i32::MIN..=1 => Some(0),
        2 => Some(3),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PromptLimits {
    pub current: usize,
    pub max: Option<usize>,
    pub can_create_more: bool,
}

impl PromptLimits {
    fn new(plan_level: i32, current: usize) -> Self {
        let max = prompt_quota(plan_level);
        Self {
            current,
            max,
            can_create_more: max.map_or(true, |max| current < max),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPrompts {
    pub user_plan: PlanLevel,
    pub base_prompts: Vec<voice_prompt::Model>,
    pub user_prompts: Vec<voice_prompt::Model>,
    pub selected_prompt_id: Option<VoicePromptId>,
    pub prompt_limits: PromptLimits,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewPromptParams {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub voice_gender: Option<String>,
}

impl Database {
    /// Returns the prompts available to the user: the base prompts their plan
    /// unlocks and their own active custom prompts.
    pub async fn get_user_prompts(&self, user_id: UserId) -> Result<UserPrompts> {
        self.transaction(|tx| async move {
            let user = self.get_user_in_tx(user_id, false, &tx).await?;
            let user_plan = self.plan_level_in_tx(user_id, &tx).await?;

            let base_prompts = voice_prompt::Entity::find()
                .filter(voice_prompt::Column::IsBase.eq(true))
                .filter(voice_prompt::Column::IsActive.eq(true))
                .filter(voice_prompt::Column::PlanRequired.lte(user_plan.plan_level))
                .order_by_asc(voice_prompt::Column::PlanRequired)
                .order_by_asc(voice_prompt::Column::Title)
                .all(&*tx)
                .await?;

            let user_prompts = self.custom_prompts_in_tx(user_id, &tx).await?;
            let prompt_limits = PromptLimits::new(user_plan.plan_level, user_prompts.len());

            Ok(UserPrompts {
                user_plan,
                base_prompts,
                user_prompts,
                selected_prompt_id: user.selected_prompt_id,
                prompt_limits,
            })
        })
        .await
    }

    /// Stores a custom prompt, refusing when the user's plan quota is used up.
    pub async fn create_prompt(
        &self,
        user_id: UserId,
        params: &NewPromptParams,
    ) -> Result<voice_prompt::Model> {
        if params.title.trim().is_empty() {
            return Err(Error::InvalidArgument("prompt title is required".into()));
        }
        if params.content.trim().is_empty() {
            return Err(Error::InvalidArgument("prompt content is required".into()));
        }

        self.transaction(|tx| async move {
            // Locking the user serializes concurrent creations against the quota.
            self.get_user_in_tx(user_id, true, &tx).await?;
            let plan = self.plan_level_in_tx(user_id, &tx).await?;
            let current = voice_prompt::Entity::find()
                .filter(voice_prompt::Column::UserId.eq(user_id))
                .filter(voice_prompt::Column::IsBase.eq(false))
                .filter(voice_prompt::Column::IsActive.eq(true))
                .count(&*tx)
                .await? as usize;

            let limits = PromptLimits::new(plan.plan_level, current);
            if !limits.can_create_more {
                return Err(Error::PromptLimitReached {
                    current,
                    max: limits.max.unwrap_or_default(),
                });
            }

            let now = now();
            let prompt = voice_prompt::Entity::insert(voice_prompt::ActiveModel {
                id: ActiveValue::not_set(),
                user_id: ActiveValue::set(Some(user_id)),
                title: ActiveValue::set(params.title.clone()),
                description: ActiveValue::set(params.description.clone()),
                content: ActiveValue::set(params.content.clone()),
                is_base: ActiveValue::set(false),
                plan_required: ActiveValue::set(FREE_PLAN_LEVEL),
                category: ActiveValue::set(params.category.clone()),
                voice_gender: ActiveValue::set(params.voice_gender.clone()),
                is_active: ActiveValue::set(true),
                created_at: ActiveValue::set(now),
                updated_at: ActiveValue::set(now),
            })
            .exec_with_returning(&*tx)
            .await?;

            tracing::info!(%user_id, prompt_id = %prompt.id, "created prompt");
            Ok(prompt)
        })
        .await
    }

    /// Makes `prompt_id` the user's active prompt. The prompt must be active
    /// and either belong to the user or be a base prompt their plan unlocks.
    pub async fn select_prompt(&self, user_id: UserId, prompt_id: VoicePromptId) -> Result<()> {
        self.transaction(|tx| async move {
            self.get_user_in_tx(user_id, false, &tx).await?;
            let plan = self.plan_level_in_tx(user_id, &tx).await?;

            let prompt = voice_prompt::Entity::find_by_id(prompt_id)
                .filter(voice_prompt::Column::IsActive.eq(true))
                .one(&*tx)
                .await?
                .filter(|prompt| {
                    prompt.user_id == Some(user_id)
                        || (prompt.is_base && prompt.plan_required <= plan.plan_level)
                })
                .ok_or_else(|| Error::not_found(format!("prompt {prompt_id}")))?;

            user::ActiveModel {
                id: ActiveValue::unchanged(user_id),
                selected_prompt_id: ActiveValue::set(Some(prompt.id)),
                updated_at: ActiveValue::set(now()),
                ..Default::default()
            }
            .update(&*tx)
            .await?;
            Ok(())
        })
        .await?;

        tracing::info!(%user_id, %prompt_id, "selected prompt");
        Ok(())
    }

    /// Soft-deletes one of the user's custom prompts. When it was the selected
    /// prompt, the selection falls back to the first free base prompt.
    /// Returns whether the deleted prompt was selected.
    pub async fn delete_prompt(&self, user_id: UserId, prompt_id: VoicePromptId) -> Result<bool> {
        let was_selected = self
            .transaction(|tx| async move {
                let user = self.get_user_in_tx(user_id, true, &tx).await?;
                voice_prompt::Entity::find_by_id(prompt_id)
                    .filter(voice_prompt::Column::UserId.eq(user_id))
                    .filter(voice_prompt::Column::IsBase.eq(false))
                    .filter(voice_prompt::Column::IsActive.eq(true))
                    .one(&*tx)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("prompt {prompt_id}")))?;

                let now = now();
                let was_selected = user.selected_prompt_id == Some(prompt_id);
                if was_selected {
                    let fallback = voice_prompt::Entity::find()
                        .filter(voice_prompt::Column::IsBase.eq(true))
                        .filter(voice_prompt::Column::IsActive.eq(true))
                        .filter(voice_prompt::Column::PlanRequired.eq(FREE_PLAN_LEVEL))
                        .order_by_asc(voice_prompt::Column::Id)
                        .one(&*tx)
                        .await?;

                    user::ActiveModel {
                        id: ActiveValue::unchanged(user_id),
                        selected_prompt_id: ActiveValue::set(fallback.map(|prompt| prompt.id)),
                        updated_at: ActiveValue::set(now),
                        ..Default::default()
                    }
                    .update(&*tx)
                    .await?;
                }

                voice_prompt::ActiveModel {
                    id: ActiveValue::unchanged(prompt_id),
                    is_active: ActiveValue::set(false),
                    updated_at: ActiveValue::set(now),
                    ..Default::default()
                }
                .update(&*tx)
                .await?;

                Ok(was_selected)
            })
            .await?;

        tracing::info!(%user_id, %prompt_id, was_selected, "deleted prompt");
        Ok(was_selected)
    }

    /// Returns the user's selected prompt if it is still active.
    pub async fn get_selected_prompt(&self, user_id: UserId) -> Result<Option<voice_prompt::Model>> {
        self.transaction(|tx| async move {
            let user = self.get_user_in_tx(user_id, false, &tx).await?;
            let Some(prompt_id) = user.selected_prompt_id else {
                return Ok(None);
            };
            Ok(voice_prompt::Entity::find_by_id(prompt_id)
                .filter(voice_prompt::Column::IsActive.eq(true))
                .one(&*tx)
                .await?)
        })
        .await
    }

    async fn custom_prompts_in_tx(
        &self,
        user_id: UserId,
        tx: &DatabaseTransaction,
    ) -> Result<Vec<voice_prompt::Model>> {
        Ok(voice_prompt::Entity::find()
            .filter(voice_prompt::Column::UserId.eq(user_id))
            .filter(voice_prompt::Column::IsBase.eq(false))
            .filter(voice_prompt::Column::IsActive.eq(true))
            .order_by_desc(voice_prompt::Column::CreatedAt)
            .order_by_desc(voice_prompt::Column::Id)
            .all(tx)
            .await?)
    }
}
