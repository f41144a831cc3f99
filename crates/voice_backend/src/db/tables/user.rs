use crate::db::{UserId, VoicePromptId};
use sea_orm::entity::prelude::*;
use serde::Serialize;

/// A user of the voice assistant, keyed by their Telegram identity.
///
/// `token_balance` is only written by the ledger queries and by initial
/// provisioning.
#[derive(Clone, Debug, Default, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: UserId,
    #[sea_orm(unique)]
    pub telegram_id: String,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_premium: bool,
    pub token_balance: i32,
    pub selected_model: Option<String>,
    pub selected_voice: Option<String>,
    pub selected_prompt_id: Option<VoicePromptId>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub last_active: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user_subscription::Entity")]
    UserSubscription,
    #[sea_orm(has_many = "super::token_usage::Entity")]
    TokenUsage,
}

impl Related<super::user_subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserSubscription.def()
    }
}

impl Related<super::token_usage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TokenUsage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
