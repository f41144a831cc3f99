use crate::db::SubscriptionPlanId;
use sea_orm::{entity::prelude::*, FromJsonQueryResult};
use serde::{Deserialize, Serialize};

/// A plan in the subscription catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "subscription_plans")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: SubscriptionPlanId,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i32,
    pub currency: String,
    /// The number of tokens granted for one subscription period.
    pub token_amount: i32,
    /// Entitlement level. Feature gating keys off this, never off `name`.
    pub level: i32,
    pub features: PlanFeatures,
    pub is_active: bool,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user_subscription::Entity")]
    UserSubscription,
}

impl Related<super::user_subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserSubscription.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct PlanFeatures(pub Vec<String>);

impl From<Vec<String>> for PlanFeatures {
    fn from(features: Vec<String>) -> Self {
        Self(features)
    }
}
