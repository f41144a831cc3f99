use crate::db::{TokenUsageId, UserId};
use sea_orm::entity::prelude::*;
use serde::Serialize;

/// An entry in the append-only usage log. Rows are written once, together
/// with the balance decrement they account for, and never updated.
#[derive(Clone, Debug, Default, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "token_usages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: TokenUsageId,
    pub user_id: UserId,
    pub session_id: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub cost_tokens: i32,
    pub input_text_tokens: i32,
    pub input_audio_tokens: i32,
    pub input_image_tokens: i32,
    pub cached_tokens: i32,
    pub output_text_tokens: i32,
    pub output_audio_tokens: i32,
    pub created_at: DateTimeUtc,
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
