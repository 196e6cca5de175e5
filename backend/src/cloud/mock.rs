//! Scriptable [`CloudProvider`] for tests. Integration tests enable it with
//! the `test-util` feature.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    check_snapshot_state, AwsArn, CloudError, CloudProvider, ContainerInstance, Ec2Image,
    Ec2Instance, InspectionTaskSpec, Snapshot, Volume,
};

pub const CUSTOMER_ACCOUNT_ID: &str = "123456789012";
pub const OWN_ACCOUNT_ID: &str = "999999999999";
pub const CUSTOMER_ARN: &str = "arn:aws:iam::123456789012:role/cloudigrade";

/// Each field is the canned answer for the matching trait method; every
/// call is appended to `calls`.
pub struct MockCloud {
    pub access: Result<(), CloudError>,
    pub instances: HashMap<String, Vec<Ec2Instance>>,
    pub images: Vec<Ec2Image>,
    pub snapshot: Result<Snapshot, CloudError>,
    pub add_ownership: Result<(), CloudError>,
    pub copy_snapshot: Result<String, CloudError>,
    pub own_snapshot: Result<Snapshot, CloudError>,
    pub copy_image: Result<String, CloudError>,
    pub create_volume: Result<String, CloudError>,
    pub volume: Result<Volume, CloudError>,
    pub scaled_down: bool,
    pub scale_up: Result<(), CloudError>,
    pub container_instances: Vec<ContainerInstance>,
    pub calls: Mutex<Vec<String>>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self {
            access: Ok(()),
            instances: HashMap::new(),
            images: vec![Ec2Image {
                image_id: "ami-1".into(),
                owner_id: Some(CUSTOMER_ACCOUNT_ID.into()),
                root_snapshot_id: Some("snap-customer".into()),
                ..Default::default()
            }],
            snapshot: Ok(Snapshot {
                snapshot_id: "snap-customer".into(),
                owner_id: CUSTOMER_ACCOUNT_ID.into(),
                encrypted: false,
                state: "completed".into(),
            }),
            add_ownership: Ok(()),
            copy_snapshot: Ok("snap-copy".into()),
            own_snapshot: Ok(Snapshot {
                snapshot_id: "snap-copy".into(),
                owner_id: OWN_ACCOUNT_ID.into(),
                encrypted: false,
                state: "completed".into(),
            }),
            copy_image: Ok("ami-copy".into()),
            create_volume: Ok("vol-1".into()),
            volume: Ok(Volume {
                volume_id: "vol-1".into(),
                state: "available".into(),
                availability_zone: "us-east-1b".into(),
            }),
            scaled_down: true,
            scale_up: Ok(()),
            container_instances: vec![ContainerInstance {
                container_instance_arn: "arn:aws:ecs:us-east-1:999999999999:container-instance/1"
                    .into(),
                ec2_instance_id: "i-houndigrade".into(),
            }],
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockCloud {
    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn own_account_id(&self) -> Result<String, CloudError> {
        Ok(OWN_ACCOUNT_ID.into())
    }

    async fn verify_account_access(&self, arn: &AwsArn) -> Result<(), CloudError> {
        self.record(format!("verify_account_access {}", arn));
        self.access.clone()
    }

    async fn get_running_instances(
        &self,
        arn: &AwsArn,
    ) -> Result<HashMap<String, Vec<Ec2Instance>>, CloudError> {
        self.record(format!("get_running_instances {}", arn));
        Ok(self.instances.clone())
    }

    async fn describe_images(
        &self,
        _arn: &AwsArn,
        region: &str,
        image_ids: &[String],
    ) -> Result<Vec<Ec2Image>, CloudError> {
        self.record(format!("describe_images {} {}", region, image_ids.join(",")));
        Ok(self
            .images
            .iter()
            .filter(|i| image_ids.contains(&i.image_id))
            .cloned()
            .collect())
    }

    async fn get_image(
        &self,
        _arn: &AwsArn,
        region: &str,
        image_id: &str,
    ) -> Result<Ec2Image, CloudError> {
        self.record(format!("get_image {} {}", region, image_id));
        self.images
            .iter()
            .find(|i| i.image_id == image_id)
            .cloned()
            .ok_or_else(|| CloudError::api("InvalidAMIID.NotFound", image_id))
    }

    async fn get_snapshot(
        &self,
        _arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<Snapshot, CloudError> {
        self.record(format!("get_snapshot {} {}", region, snapshot_id));
        self.snapshot.clone()
    }

    async fn add_snapshot_ownership(
        &self,
        _arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<(), CloudError> {
        self.record(format!("add_snapshot_ownership {} {}", region, snapshot_id));
        self.add_ownership.clone()
    }

    async fn remove_snapshot_ownership(
        &self,
        _arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<(), CloudError> {
        self.record(format!("remove_snapshot_ownership {} {}", region, snapshot_id));
        Ok(())
    }

    async fn copy_snapshot(
        &self,
        snapshot_id: &str,
        source_region: &str,
    ) -> Result<String, CloudError> {
        self.record(format!("copy_snapshot {} {}", snapshot_id, source_region));
        self.copy_snapshot.clone()
    }

    async fn get_own_snapshot(
        &self,
        region: &str,
        snapshot_id: &str,
    ) -> Result<Snapshot, CloudError> {
        self.record(format!("get_own_snapshot {} {}", region, snapshot_id));
        self.own_snapshot.clone()
    }

    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<(), CloudError> {
        self.record(format!("delete_snapshot {} {}", region, snapshot_id));
        Ok(())
    }

    async fn copy_image(
        &self,
        _arn: &AwsArn,
        region: &str,
        image_id: &str,
    ) -> Result<String, CloudError> {
        self.record(format!("copy_image {} {}", region, image_id));
        self.copy_image.clone()
    }

    async fn create_volume(&self, snapshot_id: &str, zone: &str) -> Result<String, CloudError> {
        self.record(format!("create_volume {} {}", snapshot_id, zone));
        if let Ok(snapshot) = &self.own_snapshot {
            check_snapshot_state(snapshot_id, &snapshot.state)?;
        }
        self.create_volume.clone()
    }

    async fn get_volume(&self, region: &str, volume_id: &str) -> Result<Volume, CloudError> {
        self.record(format!("get_volume {} {}", region, volume_id));
        self.volume.clone()
    }

    async fn is_scaled_down(&self, group_name: &str) -> Result<bool, CloudError> {
        self.record(format!("is_scaled_down {}", group_name));
        Ok(self.scaled_down)
    }

    async fn scale_up(&self, group_name: &str) -> Result<(), CloudError> {
        self.record(format!("scale_up {}", group_name));
        self.scale_up.clone()
    }

    async fn scale_down(&self, group_name: &str) -> Result<(), CloudError> {
        self.record(format!("scale_down {}", group_name));
        Ok(())
    }

    async fn list_container_instances(
        &self,
        cluster: &str,
    ) -> Result<Vec<ContainerInstance>, CloudError> {
        self.record(format!("list_container_instances {}", cluster));
        Ok(self.container_instances.clone())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError> {
        self.record(format!("attach_volume {} {} {}", volume_id, instance_id, device));
        Ok(())
    }

    async fn run_inspection_task(&self, spec: &InspectionTaskSpec) -> Result<(), CloudError> {
        self.record(format!("run_inspection_task {}", spec.command.join(" ")));
        Ok(())
    }
}
