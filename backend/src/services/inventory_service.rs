//! Read access to accounts, instances, images, events and users.
//!
//! Every query takes an owner filter: `Some(user_id)` restricts results to
//! objects belonging to that user's accounts, `None` sees everything.

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::account::Account;
use crate::models::instance::{Instance, InstanceEvent};
use crate::models::machine_image::MachineImage;

pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 1000;

/// Limit/offset window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListParams {
    pub limit: i64,
    pub offset: i64,
}

impl ListParams {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit
                .filter(|l| *l > 0)
                .unwrap_or(DEFAULT_LIMIT)
                .min(MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for ListParams {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of results plus the total number of matching rows.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub count: i64,
    pub results: Vec<T>,
    pub params: ListParams,
}

impl<T> Page<T> {
    /// Offset of the following page, if there is one.
    pub fn next_offset(&self) -> Option<i64> {
        let next = self.params.offset.checked_add(self.params.limit)?;
        (next < self.count).then_some(next)
    }

    /// Offset of the preceding page, if there is one.
    pub fn previous_offset(&self) -> Option<i64> {
        (self.params.offset > 0).then(|| (self.params.offset - self.params.limit).max(0))
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            count: self.count,
            results: self.results.into_iter().map(f).collect(),
            params: self.params,
        }
    }
}

/// A user with the number of accounts they registered.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub is_superuser: bool,
    pub accounts: i64,
}

const ACCOUNT_COLUMNS: &str =
    "a.id, a.user_id, a.name, a.aws_account_id, a.account_arn, a.created_at, a.updated_at";

const IMAGE_COLUMNS: &str = r#"
    mi.id, mi.account_id, mi.ec2_ami_id, mi.status, mi.is_encrypted, mi.platform,
    mi.inspection_json, mi.reference_image_id,
    EXISTS(
        SELECT 1 FROM machine_image_tags mit JOIN image_tags t ON t.id = mit.imagetag_id
        WHERE mit.machineimage_id = mi.id AND t.description = 'rhel'
    ) AS rhel,
    EXISTS(
        SELECT 1 FROM machine_image_tags mit JOIN image_tags t ON t.id = mit.imagetag_id
        WHERE mit.machineimage_id = mi.id AND t.description = 'openshift'
    ) AS openshift,
    mi.created_at, mi.updated_at
"#;

/// Inventory query service
pub struct InventoryService {
    db: PgPool,
}

impl InventoryService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn list_accounts(
        &self,
        owner: Option<Uuid>,
        params: ListParams,
    ) -> Result<Page<Account>> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM accounts a WHERE ($1::uuid IS NULL OR a.user_id = $1)",
        )
        .bind(owner)
        .fetch_one(&self.db)
        .await?;

        let results = sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS} FROM accounts a
            WHERE ($1::uuid IS NULL OR a.user_id = $1)
            ORDER BY a.created_at, a.id
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.db)
        .await?;

        Ok(Page {
            count,
            results,
            params,
        })
    }

    pub async fn get_account(&self, owner: Option<Uuid>, id: Uuid) -> Result<Account> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.id = $1 AND ($2::uuid IS NULL OR a.user_id = $2)"
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Account not found".to_string()))
    }

    /// Rename an account. Only the name is editable.
    pub async fn update_account_name(
        &self,
        owner: Option<Uuid>,
        id: Uuid,
        name: Option<String>,
    ) -> Result<Account> {
        if name.as_ref().is_some_and(|n| n.chars().count() > 256) {
            return Err(AppError::Validation(
                "name: must be at most 256 characters".to_string(),
            ));
        }

        sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts a SET name = $3, updated_at = NOW()
            WHERE a.id = $1 AND ($2::uuid IS NULL OR a.user_id = $2)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Account not found".to_string()))
    }

    pub async fn list_instances(
        &self,
        owner: Option<Uuid>,
        params: ListParams,
    ) -> Result<Page<Instance>> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM instances i JOIN accounts a ON a.id = i.account_id
            WHERE ($1::uuid IS NULL OR a.user_id = $1)
            "#,
        )
        .bind(owner)
        .fetch_one(&self.db)
        .await?;

        let results = sqlx::query_as::<_, Instance>(
            r#"
            SELECT i.id, i.account_id, i.ec2_instance_id, i.region, i.created_at, i.updated_at
            FROM instances i JOIN accounts a ON a.id = i.account_id
            WHERE ($1::uuid IS NULL OR a.user_id = $1)
            ORDER BY i.created_at, i.id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.db)
        .await?;

        Ok(Page {
            count,
            results,
            params,
        })
    }

    pub async fn get_instance(&self, owner: Option<Uuid>, id: Uuid) -> Result<Instance> {
        sqlx::query_as::<_, Instance>(
            r#"
            SELECT i.id, i.account_id, i.ec2_instance_id, i.region, i.created_at, i.updated_at
            FROM instances i JOIN accounts a ON a.id = i.account_id
            WHERE i.id = $1 AND ($2::uuid IS NULL OR a.user_id = $2)
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Instance not found".to_string()))
    }

    pub async fn list_images(
        &self,
        owner: Option<Uuid>,
        params: ListParams,
    ) -> Result<Page<MachineImage>> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM machine_images mi JOIN accounts a ON a.id = mi.account_id
            WHERE ($1::uuid IS NULL OR a.user_id = $1)
            "#,
        )
        .bind(owner)
        .fetch_one(&self.db)
        .await?;

        let results = sqlx::query_as::<_, MachineImage>(&format!(
            r#"
            SELECT {IMAGE_COLUMNS}
            FROM machine_images mi JOIN accounts a ON a.id = mi.account_id
            WHERE ($1::uuid IS NULL OR a.user_id = $1)
            ORDER BY mi.created_at, mi.id
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.db)
        .await?;

        Ok(Page {
            count,
            results,
            params,
        })
    }

    pub async fn get_image(&self, owner: Option<Uuid>, id: Uuid) -> Result<MachineImage> {
        sqlx::query_as::<_, MachineImage>(&format!(
            r#"
            SELECT {IMAGE_COLUMNS}
            FROM machine_images mi JOIN accounts a ON a.id = mi.account_id
            WHERE mi.id = $1 AND ($2::uuid IS NULL OR a.user_id = $2)
            "#
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Image not found".to_string()))
    }

    pub async fn list_events(
        &self,
        owner: Option<Uuid>,
        params: ListParams,
    ) -> Result<Page<InstanceEvent>> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM instance_events e
            JOIN instances i ON i.id = e.instance_id
            JOIN accounts a ON a.id = i.account_id
            WHERE ($1::uuid IS NULL OR a.user_id = $1)
            "#,
        )
        .bind(owner)
        .fetch_one(&self.db)
        .await?;

        let results = sqlx::query_as::<_, InstanceEvent>(
            r#"
            SELECT e.id, e.instance_id, e.machineimage_id, e.event_type, e.occurred_at,
                   e.subnet, e.instance_type, e.created_at
            FROM instance_events e
            JOIN instances i ON i.id = e.instance_id
            JOIN accounts a ON a.id = i.account_id
            WHERE ($1::uuid IS NULL OR a.user_id = $1)
            ORDER BY e.occurred_at, e.id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.db)
        .await?;

        Ok(Page {
            count,
            results,
            params,
        })
    }

    pub async fn get_event(&self, owner: Option<Uuid>, id: Uuid) -> Result<InstanceEvent> {
        sqlx::query_as::<_, InstanceEvent>(
            r#"
            SELECT e.id, e.instance_id, e.machineimage_id, e.event_type, e.occurred_at,
                   e.subnet, e.instance_type, e.created_at
            FROM instance_events e
            JOIN instances i ON i.id = e.instance_id
            JOIN accounts a ON a.id = i.account_id
            WHERE e.id = $1 AND ($2::uuid IS NULL OR a.user_id = $2)
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Event not found".to_string()))
    }

    pub async fn list_users(&self, params: ListParams) -> Result<Page<UserSummary>> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.db)
            .await?;

        let results = sqlx::query_as::<_, UserSummary>(
            r#"
            SELECT u.id, u.username, u.is_superuser, COUNT(a.id) AS accounts
            FROM users u LEFT JOIN accounts a ON a.user_id = u.id
            GROUP BY u.id
            ORDER BY u.created_at, u.id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.db)
        .await?;

        Ok(Page {
            count,
            results,
            params,
        })
    }

    pub async fn get_user(&self, id: Uuid) -> Result<UserSummary> {
        sqlx::query_as::<_, UserSummary>(
            r#"
            SELECT u.id, u.username, u.is_superuser, COUNT(a.id) AS accounts
            FROM users u LEFT JOIN accounts a ON a.user_id = u.id
            WHERE u.id = $1
            GROUP BY u.id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))
    }
}
