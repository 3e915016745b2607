use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
    pub email: String,
    /// Raw subscription tier; parse with `Tier::from_account_field`.
    pub tier: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
