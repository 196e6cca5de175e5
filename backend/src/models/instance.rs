//! Instance and instance event models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub account_id: Uuid,
    pub ec2_instance_id: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Power event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "instance_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceEventType {
    PowerOn,
    PowerOff,
}

/// A power on/off event for an instance.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InstanceEvent {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub machineimage_id: Uuid,
    pub event_type: InstanceEventType,
    pub occurred_at: DateTime<Utc>,
    /// Absent for instances outside a VPC
    pub subnet: Option<String>,
    pub instance_type: String,
    pub created_at: DateTime<Utc>,
}
