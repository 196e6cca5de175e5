//! Machine image and image tag models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Inspection status of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "image_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Preparing,
    Inspecting,
    Inspected,
}

impl ImageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Preparing => "preparing",
            ImageStatus::Inspecting => "inspecting",
            ImageStatus::Inspected => "inspected",
        }
    }
}

pub const TAG_RHEL: &str = "rhel";
pub const TAG_OPENSHIFT: &str = "openshift";

/// An AMI discovered in (or copied into) a customer account.
///
/// `rhel` and `openshift` are derived from the image's tags by the query
/// that loads the row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MachineImage {
    pub id: Uuid,
    pub account_id: Uuid,
    pub ec2_ami_id: String,
    pub status: ImageStatus,
    pub is_encrypted: Option<bool>,
    pub platform: Option<String>,
    pub inspection_json: Option<String>,
    pub reference_image_id: Option<Uuid>,
    pub rhel: bool,
    pub openshift: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MachineImage {
    pub fn is_windows(&self) -> bool {
        self.platform
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("windows"))
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ImageTag {
    pub id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
}
