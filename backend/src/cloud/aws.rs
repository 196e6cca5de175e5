//! [`CloudProvider`] over the AWS SDK.
//!
//! Our own account is reached with the default credential chain. Customer
//! accounts are reached by assuming the registered role through STS; the
//! temporary credentials are scoped to a single call.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{Filter, OperationType, SnapshotAttributeName, Tag};
use aws_sdk_ecs::types::{ContainerDefinition, HostVolumeProperties, KeyValuePair, MountPoint};
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::OnceCell;

use super::{
    check_snapshot_state, get_region_from_availability_zone, AwsArn, CloudError, CloudProvider,
    ContainerInstance, Ec2Image, Ec2Instance, InspectionTaskSpec, InstanceState, Snapshot, Volume,
};

const DRY_RUN_IMAGE_ID: &str = "ami-00000000";
const DRY_RUN_SNAPSHOT_ID: &str = "snap-00000000000000000";

/// AWS implementation of [`CloudProvider`].
pub struct AwsCloud {
    sdk_config: SdkConfig,
    sts: aws_sdk_sts::Client,
    default_region: String,
    inspection_region: String,
    account_id: OnceCell<String>,
}

fn api_error<E: ProvideErrorMetadata + Debug>(err: E) -> CloudError {
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", err));
    CloudError::Api { code, message }
}

/// True when a dry-run call was rejected for lack of permission.
fn dry_run_denied<T, E: ProvideErrorMetadata>(result: &Result<T, E>) -> bool {
    matches!(result, Err(e) if e.code() == Some("UnauthorizedOperation"))
}

fn image_from_sdk(image: &aws_sdk_ec2::types::Image) -> Ec2Image {
    let mappings = image.block_device_mappings();
    let root_mapping = image
        .root_device_name()
        .and_then(|root| mappings.iter().find(|m| m.device_name() == Some(root)))
        .or_else(|| mappings.iter().find(|m| m.ebs().is_some()));

    Ec2Image {
        image_id: image.image_id().unwrap_or_default().to_string(),
        owner_id: image.owner_id().map(str::to_string),
        platform: image.platform().map(|p| p.as_str().to_string()),
        root_snapshot_id: root_mapping
            .and_then(|m| m.ebs())
            .and_then(|ebs| ebs.snapshot_id())
            .map(str::to_string),
        tags: image
            .tags()
            .iter()
            .filter_map(|t| {
                t.key()
                    .map(|k| (k.to_string(), t.value().unwrap_or_default().to_string()))
            })
            .collect(),
    }
}

fn snapshot_from_sdk(snapshot: &aws_sdk_ec2::types::Snapshot) -> Snapshot {
    Snapshot {
        snapshot_id: snapshot.snapshot_id().unwrap_or_default().to_string(),
        owner_id: snapshot.owner_id().unwrap_or_default().to_string(),
        encrypted: snapshot.encrypted().unwrap_or(false),
        state: snapshot
            .state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
    }
}

impl AwsCloud {
    /// Load the default AWS configuration from the environment.
    pub async fn new(inspection_region: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let default_region = sdk_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "us-east-1".to_string());
        let sts = aws_sdk_sts::Client::new(&sdk_config);

        Self {
            sdk_config,
            sts,
            default_region,
            inspection_region: inspection_region.to_string(),
            account_id: OnceCell::new(),
        }
    }

    /// The shared SDK configuration, for building other clients (e.g. SQS).
    pub fn sdk_config(&self) -> &SdkConfig {
        &self.sdk_config
    }

    async fn assume_role(&self, arn: &AwsArn) -> Result<Credentials, CloudError> {
        let output = self
            .sts
            .assume_role()
            .role_arn(arn.as_str())
            .role_session_name(format!("cloudigrade-{}", arn.account_id))
            .send()
            .await
            .map_err(|e| {
                tracing::info!(arn = %arn, error = ?e.code(), "Could not assume role");
                CloudError::AccessDenied(format!("Could not assume role {}", arn))
            })?;

        let creds = output.credentials().ok_or_else(|| {
            CloudError::AccessDenied(format!("No credentials returned for {}", arn))
        })?;

        Ok(Credentials::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            Some(creds.session_token().to_string()),
            None,
            "cloudigrade-assume-role",
        ))
    }

    fn customer_ec2(&self, creds: Credentials, region: &str) -> aws_sdk_ec2::Client {
        let conf = aws_sdk_ec2::config::Builder::from(&self.sdk_config)
            .region(Region::new(region.to_string()))
            .credentials_provider(creds)
            .build();
        aws_sdk_ec2::Client::from_conf(conf)
    }

    fn own_ec2(&self, region: &str) -> aws_sdk_ec2::Client {
        let conf = aws_sdk_ec2::config::Builder::from(&self.sdk_config)
            .region(Region::new(region.to_string()))
            .build();
        aws_sdk_ec2::Client::from_conf(conf)
    }

    fn autoscaling(&self) -> aws_sdk_autoscaling::Client {
        let conf = aws_sdk_autoscaling::config::Builder::from(&self.sdk_config)
            .region(Region::new(self.inspection_region.clone()))
            .build();
        aws_sdk_autoscaling::Client::from_conf(conf)
    }

    fn ecs(&self) -> aws_sdk_ecs::Client {
        let conf = aws_sdk_ecs::config::Builder::from(&self.sdk_config)
            .region(Region::new(self.inspection_region.clone()))
            .build();
        aws_sdk_ecs::Client::from_conf(conf)
    }

    async fn running_instances_in_region(
        ec2: &aws_sdk_ec2::Client,
    ) -> Result<Vec<Ec2Instance>, CloudError> {
        let mut found = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = ec2
                .describe_instances()
                .filters(
                    Filter::builder()
                        .name("instance-state-name")
                        .values("running")
                        .build(),
                )
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(api_error)?;

            for reservation in output.reservations() {
                for instance in reservation.instances() {
                    let (Some(instance_id), Some(image_id)) =
                        (instance.instance_id(), instance.image_id())
                    else {
                        continue;
                    };
                    let state = instance
                        .state()
                        .and_then(|s| s.code())
                        .and_then(InstanceState::from_code)
                        .unwrap_or(InstanceState::Running);

                    found.push(Ec2Instance {
                        instance_id: instance_id.to_string(),
                        image_id: image_id.to_string(),
                        subnet_id: instance.subnet_id().map(str::to_string),
                        instance_type: instance
                            .instance_type()
                            .map(|t| t.as_str().to_string())
                            .unwrap_or_default(),
                        platform: instance.platform().map(|p| p.as_str().to_string()),
                        state,
                    });
                }
            }

            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(found)
    }

    async fn describe_snapshot(
        ec2: &aws_sdk_ec2::Client,
        snapshot_id: &str,
    ) -> Result<Snapshot, CloudError> {
        let output = ec2
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await
            .map_err(|e| {
                if e.code() == Some("InvalidSnapshot.NotFound") {
                    CloudError::SnapshotNotFound(snapshot_id.to_string())
                } else {
                    api_error(e)
                }
            })?;

        output
            .snapshots()
            .first()
            .map(snapshot_from_sdk)
            .ok_or_else(|| CloudError::SnapshotNotFound(snapshot_id.to_string()))
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    async fn own_account_id(&self) -> Result<String, CloudError> {
        self.account_id
            .get_or_try_init(|| async {
                let identity = self
                    .sts
                    .get_caller_identity()
                    .send()
                    .await
                    .map_err(api_error)?;
                identity
                    .account()
                    .map(str::to_string)
                    .ok_or_else(|| CloudError::api("MissingAccount", "no account in caller identity"))
            })
            .await
            .cloned()
    }

    async fn verify_account_access(&self, arn: &AwsArn) -> Result<(), CloudError> {
        let creds = self.assume_role(arn).await?;

        let sts_conf = aws_sdk_sts::config::Builder::from(&self.sdk_config)
            .credentials_provider(creds.clone())
            .build();
        let identity = aws_sdk_sts::Client::from_conf(sts_conf)
            .get_caller_identity()
            .send()
            .await
            .map_err(api_error)?;
        if identity.account() != Some(arn.account_id.as_str()) {
            return Err(CloudError::AccessDenied(format!(
                "Role {} does not belong to account {}",
                arn, arn.account_id
            )));
        }

        let own_account = self.own_account_id().await?;
        let ec2 = self.customer_ec2(creds, &self.default_region);
        let mut failed = Vec::new();

        let result = ec2.describe_images().dry_run(true).owners("self").send().await;
        if dry_run_denied(&result) {
            failed.push("ec2:DescribeImages");
        }
        let result = ec2.describe_instances().dry_run(true).send().await;
        if dry_run_denied(&result) {
            failed.push("ec2:DescribeInstances");
        }
        let result = ec2
            .modify_snapshot_attribute()
            .dry_run(true)
            .snapshot_id(DRY_RUN_SNAPSHOT_ID)
            .attribute(SnapshotAttributeName::CreateVolumePermission)
            .operation_type(OperationType::Add)
            .user_ids(&own_account)
            .send()
            .await;
        if dry_run_denied(&result) {
            failed.push("ec2:ModifySnapshotAttribute");
        }
        let result = ec2
            .describe_snapshot_attribute()
            .dry_run(true)
            .snapshot_id(DRY_RUN_SNAPSHOT_ID)
            .attribute(SnapshotAttributeName::ProductCodes)
            .send()
            .await;
        if dry_run_denied(&result) {
            failed.push("ec2:DescribeSnapshotAttribute");
        }
        let result = ec2.describe_snapshots().dry_run(true).send().await;
        if dry_run_denied(&result) {
            failed.push("ec2:DescribeSnapshots");
        }
        let result = ec2
            .copy_image()
            .dry_run(true)
            .name("cloudigrade-dry-run")
            .source_image_id(DRY_RUN_IMAGE_ID)
            .source_region(&self.default_region)
            .send()
            .await;
        if dry_run_denied(&result) {
            failed.push("ec2:CopyImage");
        }
        let result = ec2
            .create_tags()
            .dry_run(true)
            .resources(DRY_RUN_IMAGE_ID)
            .tags(Tag::builder().key("cloudigrade-dry-run").value("true").build())
            .send()
            .await;
        if dry_run_denied(&result) {
            failed.push("ec2:CreateTags");
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(CloudError::AccessDenied(format!(
                "Role {} is missing permissions: {}",
                arn,
                failed.join(", ")
            )))
        }
    }

    async fn get_running_instances(
        &self,
        arn: &AwsArn,
    ) -> Result<HashMap<String, Vec<Ec2Instance>>, CloudError> {
        let creds = self.assume_role(arn).await?;
        let regions: Vec<String> = self
            .customer_ec2(creds.clone(), &self.default_region)
            .describe_regions()
            .send()
            .await
            .map_err(api_error)?
            .regions()
            .iter()
            .filter_map(|r| r.region_name().map(str::to_string))
            .collect();

        let mut by_region = HashMap::new();
        for region in regions {
            let ec2 = self.customer_ec2(creds.clone(), &region);
            let instances = Self::running_instances_in_region(&ec2).await?;
            tracing::debug!(
                account_id = %arn.account_id,
                region = %region,
                count = instances.len(),
                "Found running instances"
            );
            by_region.insert(region, instances);
        }
        Ok(by_region)
    }

    async fn describe_images(
        &self,
        arn: &AwsArn,
        region: &str,
        image_ids: &[String],
    ) -> Result<Vec<Ec2Image>, CloudError> {
        if image_ids.is_empty() {
            return Ok(Vec::new());
        }
        let creds = self.assume_role(arn).await?;
        let output = self
            .customer_ec2(creds, region)
            .describe_images()
            .set_image_ids(Some(image_ids.to_vec()))
            .send()
            .await
            .map_err(api_error)?;
        Ok(output.images().iter().map(image_from_sdk).collect())
    }

    async fn get_image(
        &self,
        arn: &AwsArn,
        region: &str,
        image_id: &str,
    ) -> Result<Ec2Image, CloudError> {
        self.describe_images(arn, region, &[image_id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CloudError::api("InvalidAMIID.NotFound", format!("image {} not found", image_id))
            })
    }

    async fn get_snapshot(
        &self,
        arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<Snapshot, CloudError> {
        let creds = self.assume_role(arn).await?;
        Self::describe_snapshot(&self.customer_ec2(creds, region), snapshot_id).await
    }

    async fn add_snapshot_ownership(
        &self,
        arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<(), CloudError> {
        let own_account = self.own_account_id().await?;
        let creds = self.assume_role(arn).await?;
        let ec2 = self.customer_ec2(creds, region);

        ec2.modify_snapshot_attribute()
            .snapshot_id(snapshot_id)
            .attribute(SnapshotAttributeName::CreateVolumePermission)
            .operation_type(OperationType::Add)
            .user_ids(&own_account)
            .send()
            .await
            .map_err(api_error)?;

        let attribute = ec2
            .describe_snapshot_attribute()
            .snapshot_id(snapshot_id)
            .attribute(SnapshotAttributeName::CreateVolumePermission)
            .send()
            .await
            .map_err(api_error)?;

        let granted = attribute
            .create_volume_permissions()
            .iter()
            .any(|p| p.user_id() == Some(own_account.as_str()));
        if !granted {
            return Err(CloudError::SnapshotNotOwned(snapshot_id.to_string()));
        }
        Ok(())
    }

    async fn remove_snapshot_ownership(
        &self,
        arn: &AwsArn,
        region: &str,
        snapshot_id: &str,
    ) -> Result<(), CloudError> {
        let own_account = self.own_account_id().await?;
        let creds = self.assume_role(arn).await?;
        self.customer_ec2(creds, region)
            .modify_snapshot_attribute()
            .snapshot_id(snapshot_id)
            .attribute(SnapshotAttributeName::CreateVolumePermission)
            .operation_type(OperationType::Remove)
            .user_ids(&own_account)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn copy_snapshot(
        &self,
        snapshot_id: &str,
        source_region: &str,
    ) -> Result<String, CloudError> {
        let output = self
            .own_ec2(&self.inspection_region)
            .copy_snapshot()
            .source_region(source_region)
            .source_snapshot_id(snapshot_id)
            .description(format!("cloudigrade copy of {}", snapshot_id))
            .send()
            .await
            .map_err(|e| {
                if e.code() == Some("ResourceLimitExceeded") {
                    CloudError::SnapshotCopyLimit(snapshot_id.to_string())
                } else {
                    api_error(e)
                }
            })?;

        output
            .snapshot_id()
            .map(str::to_string)
            .ok_or_else(|| CloudError::api("MissingSnapshotId", "copy returned no snapshot id"))
    }

    async fn get_own_snapshot(
        &self,
        region: &str,
        snapshot_id: &str,
    ) -> Result<Snapshot, CloudError> {
        Self::describe_snapshot(&self.own_ec2(region), snapshot_id).await
    }

    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<(), CloudError> {
        self.own_ec2(region)
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn copy_image(
        &self,
        arn: &AwsArn,
        region: &str,
        image_id: &str,
    ) -> Result<String, CloudError> {
        let creds = self.assume_role(arn).await?;
        let output = self
            .customer_ec2(creds, region)
            .copy_image()
            .name(format!("cloudigrade reference copy ({})", image_id))
            .source_image_id(image_id)
            .source_region(region)
            .send()
            .await
            .map_err(|e| {
                let billing = e.code() == Some("InvalidRequest")
                    && e.message().is_some_and(|m| m.contains("BillingProduct"));
                if billing {
                    CloudError::MarketplaceImage(image_id.to_string())
                } else {
                    api_error(e)
                }
            })?;

        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| CloudError::api("MissingImageId", "copy returned no image id"))
    }

    async fn create_volume(&self, snapshot_id: &str, zone: &str) -> Result<String, CloudError> {
        let ec2 = self.own_ec2(get_region_from_availability_zone(zone));
        let snapshot = Self::describe_snapshot(&ec2, snapshot_id).await?;
        check_snapshot_state(snapshot_id, &snapshot.state)?;

        let output = ec2
            .create_volume()
            .snapshot_id(snapshot_id)
            .availability_zone(zone)
            .send()
            .await
            .map_err(api_error)?;

        output
            .volume_id()
            .map(str::to_string)
            .ok_or_else(|| CloudError::api("MissingVolumeId", "create returned no volume id"))
    }

    async fn get_volume(&self, region: &str, volume_id: &str) -> Result<Volume, CloudError> {
        let output = self
            .own_ec2(region)
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(api_error)?;

        output
            .volumes()
            .first()
            .map(|v| Volume {
                volume_id: v.volume_id().unwrap_or(volume_id).to_string(),
                state: v.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
                availability_zone: v.availability_zone().unwrap_or_default().to_string(),
            })
            .ok_or_else(|| CloudError::VolumeError(volume_id.to_string()))
    }

    async fn is_scaled_down(&self, group_name: &str) -> Result<bool, CloudError> {
        let output = self
            .autoscaling()
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(group_name)
            .send()
            .await
            .map_err(api_error)?;

        let Some(group) = output.auto_scaling_groups().first() else {
            return Err(CloudError::api(
                "AutoScalingGroupNotFound",
                format!("autoscaling group {} not found", group_name),
            ));
        };

        let min_size: Option<i32> = group.min_size().into();
        let max_size: Option<i32> = group.max_size().into();
        let desired: Option<i32> = group.desired_capacity().into();
        let scaled_down = min_size.unwrap_or(0) == 0
            && max_size.unwrap_or(0) == 0
            && desired.unwrap_or(0) == 0
            && group.instances().is_empty();

        tracing::debug!(group = group_name, scaled_down, "Checked autoscaling group");
        Ok(scaled_down)
    }

    async fn scale_up(&self, group_name: &str) -> Result<(), CloudError> {
        self.autoscaling()
            .update_auto_scaling_group()
            .auto_scaling_group_name(group_name)
            .min_size(1)
            .max_size(1)
            .desired_capacity(1)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn scale_down(&self, group_name: &str) -> Result<(), CloudError> {
        self.autoscaling()
            .update_auto_scaling_group()
            .auto_scaling_group_name(group_name)
            .min_size(0)
            .max_size(0)
            .desired_capacity(0)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn list_container_instances(
        &self,
        cluster: &str,
    ) -> Result<Vec<ContainerInstance>, CloudError> {
        let ecs = self.ecs();
        let arns = ecs
            .list_container_instances()
            .cluster(cluster)
            .send()
            .await
            .map_err(api_error)?
            .container_instance_arns()
            .to_vec();
        if arns.is_empty() {
            return Ok(Vec::new());
        }

        let described = ecs
            .describe_container_instances()
            .cluster(cluster)
            .set_container_instances(Some(arns))
            .send()
            .await
            .map_err(api_error)?;

        Ok(described
            .container_instances()
            .iter()
            .filter_map(|ci| {
                Some(ContainerInstance {
                    container_instance_arn: ci.container_instance_arn()?.to_string(),
                    ec2_instance_id: ci.ec2_instance_id()?.to_string(),
                })
            })
            .collect())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError> {
        self.own_ec2(&self.inspection_region)
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn run_inspection_task(&self, spec: &InspectionTaskSpec) -> Result<(), CloudError> {
        let ecs = self.ecs();

        let mut container = ContainerDefinition::builder()
            .name("Houndigrade")
            .image(&spec.image)
            .cpu(0)
            .memory(256)
            .essential(true)
            .privileged(true)
            .set_command(Some(spec.command.clone()))
            .mount_points(
                MountPoint::builder()
                    .container_path("/dev")
                    .source_volume("dev")
                    .read_only(true)
                    .build(),
            );
        for (name, value) in &spec.environment {
            container = container.environment(KeyValuePair::builder().name(name).value(value).build());
        }

        let registered = ecs
            .register_task_definition()
            .family(&spec.family)
            .container_definitions(container.build())
            .volumes(
                aws_sdk_ecs::types::Volume::builder()
                    .name("dev")
                    .host(HostVolumeProperties::builder().source_path("/dev").build())
                    .build(),
            )
            .send()
            .await
            .map_err(api_error)?;

        let task_definition_arn = registered
            .task_definition()
            .and_then(|td| td.task_definition_arn())
            .ok_or_else(|| CloudError::api("MissingTaskDefinition", "no task definition arn"))?;

        ecs.run_task()
            .cluster(&spec.cluster)
            .task_definition(task_definition_arn)
            .send()
            .await
            .map_err(api_error)?;

        tracing::info!(
            cluster = %spec.cluster,
            task_definition = task_definition_arn,
            "Started houndigrade task"
        );
        Ok(())
    }
}
