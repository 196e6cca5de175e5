//! Cloud account model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A registered AWS account.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: Option<String>,
    pub aws_account_id: String,
    pub account_arn: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn cloud_type(&self) -> &'static str {
        "aws"
    }

    pub fn cloud_account_id(&self) -> &str {
        &self.aws_account_id
    }
}
