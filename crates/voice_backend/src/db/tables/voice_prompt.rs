use crate::db::{UserId, VoicePromptId};
use sea_orm::entity::prelude::*;
use serde::Serialize;

/// A system prompt for the voice assistant. Base prompts ship with the
/// service and are gated by `plan_required`; custom prompts belong to a user.
#[derive(Clone, Debug, Default, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "voice_prompts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: VoicePromptId,
    pub user_id: Option<UserId>,
    pub title: String,
    pub description: Option<String>,
    pub content: String,
    pub is_base: bool,
    pub plan_required: i32,
    pub category: Option<String>,
    pub voice_gender: Option<String>,
    pub is_active: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
