//! Cloud provider abstraction.
//!
//! Everything the account registration flow and the inspection pipeline need
//! from AWS goes through [`CloudProvider`], so services can be exercised
//! against a hand-written mock.

pub mod arn;
pub mod aws;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

pub use arn::AwsArn;
pub use aws::AwsCloud;

/// AWS tag marking an image as carrying OpenShift.
pub const OPENSHIFT_TAG: &str = "cloudigrade-ocp-present";

/// Failures reported by a cloud provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("snapshot {0} is not shared with our account")]
    SnapshotNotOwned(String),

    #[error("snapshot {0} is encrypted")]
    SnapshotEncrypted(String),

    #[error("snapshot copy limit reached while copying {0}")]
    SnapshotCopyLimit(String),

    #[error("snapshot {0} is not ready")]
    SnapshotNotReady(String),

    #[error("snapshot {0} is in a bad state")]
    SnapshotError(String),

    #[error("volume {0} is not ready")]
    VolumeNotReady(String),

    #[error("volume {0} is in a bad state")]
    VolumeError(String),

    #[error("image {0} carries billing product codes and cannot be copied")]
    MarketplaceImage(String),

    #[error("no ECS container instance is ready in cluster {0}")]
    EcsInstanceNotReady(String),

    #[error("too many ECS container instances in cluster {0}")]
    TooManyEcsInstances(String),

    #[error("ClientError: {code}: {message}")]
    Api { code: String, message: String },
}

impl CloudError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError::Api {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// EC2 instance lifecycle states and their numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn code(self) -> i32 {
        match self {
            InstanceState::Pending => 0,
            InstanceState::Running => 16,
            InstanceState::ShuttingDown => 32,
            InstanceState::Terminated => 48,
            InstanceState::Stopping => 64,
            InstanceState::Stopped => 80,
        }
    }

    /// Map an EC2 state code. Only the low byte is significant.
    pub fn from_code(code: i32) -> Option<Self> {
        match code & 0xff {
            0 => Some(InstanceState::Pending),
            16 => Some(InstanceState::Running),
            32 => Some(InstanceState::ShuttingDown),
            48 => Some(InstanceState::Terminated),
            64 => Some(InstanceState::Stopping),
            80 => Some(InstanceState::Stopped),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }

    /// Whether an instance in this state counts as powered on.
    pub fn is_on(self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Running)
    }
}

/// A running EC2 instance as seen in a customer account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ec2Instance {
    pub instance_id: String,
    pub image_id: String,
    pub subnet_id: Option<String>,
    pub instance_type: String,
    pub platform: Option<String>,
    pub state: InstanceState,
}

impl Ec2Instance {
    pub fn is_windows(&self) -> bool {
        self.platform
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("windows"))
    }
}

/// An AMI with the attributes the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ec2Image {
    pub image_id: String,
    pub owner_id: Option<String>,
    pub platform: Option<String>,
    pub root_snapshot_id: Option<String>,
    pub tags: HashMap<String, String>,
}

impl Ec2Image {
    pub fn is_windows(&self) -> bool {
        self.platform
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("windows"))
    }

    pub fn is_openshift(&self) -> bool {
        self.tags.contains_key(OPENSHIFT_TAG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub owner_id: String,
    pub encrypted: bool,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: String,
    pub state: String,
    pub availability_zone: String,
}

/// An ECS container instance and the EC2 instance backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInstance {
    pub container_instance_arn: String,
    pub ec2_instance_id: String,
}

/// Everything needed to register and launch one houndigrade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionTaskSpec {
    pub cluster: String,
    pub family: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
}

/// Operations against the cloud provider.
///
/// Methods taking an [`AwsArn`] act inside the customer account by assuming
/// that role; the others act inside our own account.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Account id of the credentials the service itself runs with.
    async fn own_account_id(&self) -> Result<String, CloudError>;

    /// Assume the role and check that every permission we need is granted.
    ///
    /// Fails with [`CloudError::AccessDenied`] naming what is missing.
    async fn verify_account_access(&self, arn: &AwsArn) -> Result<(), CloudError>;

    /// Running instances in every region, keyed by region.
    async fn get_running_instances(
        &self,
        arn: &AwsArn,
    ) -> Result<HashMap<String, Vec<Ec2Instance>>, CloudError>;

    async fn describe_images(
        &self,
        arn: &AwsArn,
        region: &str,
        image_ids: &[String],
    ) -> Result<Vec<Ec2Image>, CloudError>;

    async fn get_image(
        &self,
        arn: &AwsArn,
        region: &str,
        image_id: &str,
    ) -> Result<Ec2Image, CloudError>;

    async fn get_snapshot(
        &self,
        arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<Snapshot, CloudError>;

    /// Grant our account create-volume permission on a customer snapshot.
    async fn add_snapshot_ownership(
        &self,
        arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<(), CloudError>;

    async fn remove_snapshot_ownership(
        &self,
        arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<(), CloudError>;

    /// Copy a shared snapshot into our account in the inspection region.
    async fn copy_snapshot(&self, snapshot_id: &str, source_region: &str)
        -> Result<String, CloudError>;

    /// Look up a snapshot owned by our account.
    async fn get_own_snapshot(&self, region: &str, snapshot_id: &str)
        -> Result<Snapshot, CloudError>;

    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<(), CloudError>;

    /// Copy an image inside the customer account, returning the new AMI id.
    async fn copy_image(
        &self,
        arn: &AwsArn,
        region: &str,
        image_id: &str,
    ) -> Result<String, CloudError>;

    /// Create a volume from one of our snapshots, returning the volume id.
    async fn create_volume(&self, snapshot_id: &str, zone: &str) -> Result<String, CloudError>;

    async fn get_volume(&self, region: &str, volume_id: &str) -> Result<Volume, CloudError>;

    async fn is_scaled_down(&self, group_name: &str) -> Result<bool, CloudError>;

    async fn scale_up(&self, group_name: &str) -> Result<(), CloudError>;

    async fn scale_down(&self, group_name: &str) -> Result<(), CloudError>;

    async fn list_container_instances(
        &self,
        cluster: &str,
    ) -> Result<Vec<ContainerInstance>, CloudError>;

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError>;

    /// Register the task definition and start it on the cluster.
    async fn run_inspection_task(&self, spec: &InspectionTaskSpec) -> Result<(), CloudError>;
}

/// Classify a snapshot state.
pub fn check_snapshot_state(snapshot_id: &str, state: &str) -> Result<(), CloudError> {
    match state {
        "completed" => Ok(()),
        "pending" => Err(CloudError::SnapshotNotReady(snapshot_id.to_string())),
        _ => Err(CloudError::SnapshotError(snapshot_id.to_string())),
    }
}

/// Classify a volume state.
pub fn check_volume_state(volume_id: &str, state: &str) -> Result<(), CloudError> {
    match state {
        "available" => Ok(()),
        "creating" => Err(CloudError::VolumeNotReady(volume_id.to_string())),
        _ => Err(CloudError::VolumeError(volume_id.to_string())),
    }
}

/// Region of an availability zone, e.g. `us-east-1b` -> `us-east-1`.
pub fn get_region_from_availability_zone(zone: &str) -> &str {
    match zone.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => &zone[..idx],
        _ => zone,
    }
}

/// EC2 actions the customer role must allow.
pub const REQUIRED_EC2_ACTIONS: &[&str] = &[
    "ec2:DescribeImages",
    "ec2:DescribeInstances",
    "ec2:ModifySnapshotAttribute",
    "ec2:DescribeSnapshotAttribute",
    "ec2:DescribeSnapshots",
    "ec2:CopyImage",
    "ec2:CreateTags",
];

/// IAM policy document customers attach to the role they register.
pub fn traditional_inspection_policy() -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "CloudigradePolicy",
                "Effect": "Allow",
                "Action": REQUIRED_EC2_ACTIONS,
                "Resource": "*"
            }
        ]
    })
}

/// Number of distinct names [`inspection_device_names`] can produce (`sdba` through `sdzz`).
pub const MAX_INSPECTION_DEVICES: usize = 25 * 26;

/// Device names handed to houndigrade: `/dev/sdba`, `/dev/sdbb`, ... `/dev/sdbz`, `/dev/sdca`, ...
///
/// At most [`MAX_INSPECTION_DEVICES`] names are returned.
pub fn inspection_device_names(count: usize) -> Vec<String> {
    let letters = b'a'..=b'z';
    letters
        .clone()
        .skip(1)
        .flat_map(|first| letters.clone().map(move |second| (first, second)))
        .take(count)
        .map(|(first, second)| format!("/dev/sd{}{}", first as char, second as char))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_state_codes() {
        assert_eq!(InstanceState::Running.code(), 16);
        assert_eq!(InstanceState::from_code(80), Some(InstanceState::Stopped));
        // High byte is internal to EC2 and ignored.
        assert_eq!(InstanceState::from_code(16 + 256), Some(InstanceState::Running));
        assert_eq!(InstanceState::from_code(7), None);
    }

    #[test]
    fn test_instance_state_is_on() {
        assert!(InstanceState::Pending.is_on());
        assert!(InstanceState::Running.is_on());
        for state in [
            InstanceState::ShuttingDown,
            InstanceState::Terminated,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ] {
            assert!(!state.is_on(), "{} should be off", state.name());
        }
    }

    #[test]
    fn test_check_snapshot_state() {
        assert!(check_snapshot_state("snap-1", "completed").is_ok());
        assert_eq!(
            check_snapshot_state("snap-1", "pending"),
            Err(CloudError::SnapshotNotReady("snap-1".into()))
        );
        assert_eq!(
            check_snapshot_state("snap-1", "error"),
            Err(CloudError::SnapshotError("snap-1".into()))
        );
    }

    #[test]
    fn test_check_volume_state() {
        assert!(check_volume_state("vol-1", "available").is_ok());
        assert_eq!(
            check_volume_state("vol-1", "creating"),
            Err(CloudError::VolumeNotReady("vol-1".into()))
        );
        for state in ["in-use", "deleting", "deleted", "error"] {
            assert_eq!(
                check_volume_state("vol-1", state),
                Err(CloudError::VolumeError("vol-1".into()))
            );
        }
    }

    #[test]
    fn test_region_from_availability_zone() {
        assert_eq!(get_region_from_availability_zone("us-east-1b"), "us-east-1");
        assert_eq!(get_region_from_availability_zone("eu-west-2a"), "eu-west-2");
        assert_eq!(get_region_from_availability_zone("us-east-1"), "us-east-1");
    }

    #[test]
    fn test_api_error_message_includes_code_and_message() {
        let err = CloudError::api("ItIsAMystery", "Mystery Error");
        let text = err.to_string();
        assert!(text.contains("ClientError"));
        assert!(text.contains("ItIsAMystery"));
        assert!(text.contains("Mystery Error"));
    }

    #[test]
    fn test_image_flags() {
        let mut image = Ec2Image {
            image_id: "ami-1".into(),
            platform: Some("Windows".into()),
            ..Default::default()
        };
        assert!(image.is_windows());
        assert!(!image.is_openshift());
        image.tags.insert(OPENSHIFT_TAG.into(), String::new());
        assert!(image.is_openshift());
    }

    #[test]
    fn test_inspection_device_names() {
        let names = inspection_device_names(28);
        assert_eq!(names[0], "/dev/sdba");
        assert_eq!(names[25], "/dev/sdbz");
        assert_eq!(names[26], "/dev/sdca");
        assert_eq!(names.len(), 28);

        let all = inspection_device_names(MAX_INSPECTION_DEVICES + 100);
        assert_eq!(all.len(), MAX_INSPECTION_DEVICES);
        assert_eq!(all[MAX_INSPECTION_DEVICES - 1], "/dev/sdzz");
    }

    #[test]
    fn test_policy_lists_required_actions() {
        let policy = traditional_inspection_policy();
        let actions = policy["Statement"][0]["Action"].as_array().unwrap();
        assert_eq!(actions.len(), REQUIRED_EC2_ACTIONS.len());
    }
}
