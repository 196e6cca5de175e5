//! Image inspection pipeline.
//!
//! An image moves through these steps, each a separate [`Task`]:
//!
//! 1. copy the root snapshot out of the customer account (copying the image
//!    inside the customer account first when the snapshot is not directly
//!    shareable),
//! 2. create a volume from the copy in the inspection availability zone,
//! 3. queue the volume once it is available,
//! 4. attach a batch of volumes to the inspection cluster and run houndigrade,
//! 5. persist the results houndigrade publishes and scale the cluster down.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;

use crate::cloud::{
    check_snapshot_state, check_volume_state, get_region_from_availability_zone,
    inspection_device_names, AwsArn, CloudError, CloudProvider, InspectionTaskSpec,
};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::machine_image::{ImageStatus, TAG_RHEL};
use crate::queue::MessageQueue;
use crate::services::metrics_service;
use crate::services::task_worker::{ReadyVolume, Task, TaskDispatcher, TaskError};

/// Messages read from the houndigrade results queue per run.
pub const HOUNDIGRADE_MESSAGE_READ_LEN: usize = 10;

/// Image persistence needed by the pipeline.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn mark_encrypted(&self, ami_id: &str) -> Result<()>;

    /// Returns false when no image has that AMI id.
    async fn set_status(&self, ami_id: &str, status: ImageStatus) -> Result<bool>;

    /// Record `copy_ami_id` as a copy of the image `reference_ami_id`.
    async fn record_copy(&self, copy_ami_id: &str, reference_ami_id: &str) -> Result<()>;

    /// Store inspection output and mark the image inspected.
    /// Returns false when no image has that AMI id.
    async fn save_inspection(&self, ami_id: &str, inspection_json: &str, rhel: bool)
        -> Result<bool>;
}

/// [`ImageStore`] over PostgreSQL.
pub struct PgImageStore {
    db: PgPool,
}

impl PgImageStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ImageStore for PgImageStore {
    async fn mark_encrypted(&self, ami_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE machine_images SET is_encrypted = true, updated_at = NOW() WHERE ec2_ami_id = $1",
        )
        .bind(ami_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_status(&self, ami_id: &str, status: ImageStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE machine_images SET status = $2, updated_at = NOW() WHERE ec2_ami_id = $1",
        )
        .bind(ami_id)
        .bind(status)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_copy(&self, copy_ami_id: &str, reference_ami_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO machine_images (account_id, ec2_ami_id, reference_image_id)
            SELECT account_id, $1, id FROM machine_images WHERE ec2_ami_id = $2
            ON CONFLICT (ec2_ami_id) DO NOTHING
            "#,
        )
        .bind(copy_ami_id)
        .bind(reference_ami_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn save_inspection(
        &self,
        ami_id: &str,
        inspection_json: &str,
        rhel: bool,
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let image_id: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE machine_images
            SET inspection_json = $2, status = 'inspected', updated_at = NOW()
            WHERE ec2_ami_id = $1
            RETURNING id
            "#,
        )
        .bind(ami_id)
        .bind(inspection_json)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(image_id) = image_id else {
            return Ok(false);
        };

        if rhel {
            sqlx::query(
                r#"
                INSERT INTO machine_image_tags (machineimage_id, imagetag_id)
                SELECT $1, id FROM image_tags WHERE description = $2
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(image_id)
            .bind(TAG_RHEL)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

/// Whether any partition of any drive in one image's results found RHEL.
pub fn inspection_found_rhel(image_results: &Value) -> bool {
    image_results
        .as_object()
        .into_iter()
        .flat_map(|drives| drives.values())
        .filter_map(Value::as_object)
        .flat_map(|partitions| partitions.values())
        .any(|partition| partition.get("rhel_found").and_then(Value::as_bool) == Some(true))
}

/// Parse a results message. Houndigrade may publish either a JSON object or
/// a JSON string containing the object.
fn parse_results_message(body: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(body).ok()? {
        Value::String(inner) => serde_json::from_str(&inner).ok(),
        value => Some(value),
    }
}

/// Retry on transient cloud conditions, fail on anything else.
fn retry_if(err: CloudError, transient: impl Fn(&CloudError) -> bool) -> TaskError {
    if transient(&err) {
        TaskError::Retry(err.to_string())
    } else {
        TaskError::Fail(err.to_string())
    }
}

/// Runs the inspection pipeline's tasks.
pub struct InspectionService {
    cloud: Arc<dyn CloudProvider>,
    queue: Arc<dyn MessageQueue>,
    images: Arc<dyn ImageStore>,
    dispatcher: TaskDispatcher,
    config: Config,
}

impl InspectionService {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        queue: Arc<dyn MessageQueue>,
        images: Arc<dyn ImageStore>,
        config: Config,
    ) -> Self {
        Self {
            dispatcher: TaskDispatcher::new(queue.clone(), &config.aws_name_prefix),
            cloud,
            queue,
            images,
            config,
        }
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Run one task.
    pub async fn execute(&self, task: &Task) -> std::result::Result<(), TaskError> {
        tracing::debug!(task = task.name(), "Executing task");
        match task {
            Task::CopyAmiSnapshot {
                arn,
                ami_id,
                region,
                reference_ami_id,
            } => {
                self.copy_ami_snapshot(arn, ami_id, region, reference_ami_id.as_deref())
                    .await
            }
            Task::CopyAmiToCustomerAccount {
                arn,
                reference_ami_id,
                region,
                maybe_marketplace,
            } => {
                self.copy_ami_to_customer_account(arn, reference_ami_id, region, *maybe_marketplace)
                    .await
            }
            Task::RemoveSnapshotOwnership {
                arn,
                customer_snapshot_id,
                region,
                snapshot_copy_id,
            } => {
                self.remove_snapshot_ownership(arn, customer_snapshot_id, region, snapshot_copy_id)
                    .await
            }
            Task::CreateVolume {
                ami_id,
                snapshot_id,
            } => self.create_volume(ami_id, snapshot_id).await,
            Task::EnqueueReadyVolume {
                ami_id,
                volume_id,
                region,
            } => self.enqueue_ready_volume(ami_id, volume_id, region).await,
            Task::DeleteSnapshot {
                snapshot_copy_id,
                volume_id,
                volume_region,
            } => {
                self.delete_snapshot(snapshot_copy_id, volume_id, volume_region)
                    .await
            }
            Task::ScaleUpInspectionCluster => self.scale_up_inspection_cluster().await,
            Task::RunInspectionCluster { messages } => self.run_inspection_cluster(messages).await,
            Task::PersistInspectionClusterResults => {
                self.persist_inspection_cluster_results_task().await
            }
            Task::ScaleDownCluster => self.scale_down_cluster().await,
        }
    }

    /// Copy an image's root snapshot into our account and start volume creation.
    pub async fn copy_ami_snapshot(
        &self,
        arn: &str,
        ami_id: &str,
        region: &str,
        reference_ami_id: Option<&str>,
    ) -> std::result::Result<(), TaskError> {
        let parsed = AwsArn::parse(arn)?;
        let image = self.cloud.get_image(&parsed, region, ami_id).await?;
        let snapshot_id = image.root_snapshot_id.ok_or_else(|| {
            TaskError::Fail(format!("image {} has no root snapshot", ami_id))
        })?;

        let snapshot = match self.cloud.get_snapshot(&parsed, region, &snapshot_id).await {
            Ok(snapshot) => snapshot,
            Err(CloudError::SnapshotNotFound(_)) => {
                tracing::info!(
                    ami_id = ami_id,
                    snapshot_id = %snapshot_id,
                    "Snapshot not visible, image may be from the marketplace"
                );
                self.dispatcher
                    .dispatch(&Task::CopyAmiToCustomerAccount {
                        arn: arn.to_string(),
                        reference_ami_id: ami_id.to_string(),
                        region: region.to_string(),
                        maybe_marketplace: true,
                    })
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(TaskError::Fail(e.to_string())),
        };

        if snapshot.encrypted {
            self.images
                .mark_encrypted(reference_ami_id.unwrap_or(ami_id))
                .await?;
            return Err(CloudError::SnapshotEncrypted(snapshot_id).into());
        }

        if snapshot.owner_id != parsed.account_id {
            tracing::info!(
                ami_id = ami_id,
                owner_id = %snapshot.owner_id,
                "Snapshot belongs to another account, copying image into customer account"
            );
            self.dispatcher
                .dispatch(&Task::CopyAmiToCustomerAccount {
                    arn: arn.to_string(),
                    reference_ami_id: ami_id.to_string(),
                    region: region.to_string(),
                    maybe_marketplace: false,
                })
                .await?;
            return Ok(());
        }

        self.cloud
            .add_snapshot_ownership(&parsed, region, &snapshot_id)
            .await
            .map_err(|e| retry_if(e, |e| matches!(e, CloudError::SnapshotNotOwned(_))))?;

        let new_snapshot_id = self
            .cloud
            .copy_snapshot(&snapshot_id, region)
            .await
            .map_err(|e| retry_if(e, |e| matches!(e, CloudError::SnapshotCopyLimit(_))))?;

        if let Some(reference) = reference_ami_id {
            self.images.record_copy(ami_id, reference).await?;
        }

        tracing::info!(
            ami_id = ami_id,
            snapshot_id = %snapshot_id,
            snapshot_copy_id = %new_snapshot_id,
            "Copied snapshot"
        );

        self.dispatcher
            .dispatch(&Task::RemoveSnapshotOwnership {
                arn: arn.to_string(),
                customer_snapshot_id: snapshot_id,
                region: region.to_string(),
                snapshot_copy_id: new_snapshot_id.clone(),
            })
            .await?;
        self.dispatcher
            .dispatch(&Task::CreateVolume {
                ami_id: reference_ami_id.unwrap_or(ami_id).to_string(),
                snapshot_id: new_snapshot_id,
            })
            .await?;
        Ok(())
    }

    /// Copy an image inside the customer account so its snapshot becomes ours to share.
    pub async fn copy_ami_to_customer_account(
        &self,
        arn: &str,
        reference_ami_id: &str,
        region: &str,
        maybe_marketplace: bool,
    ) -> std::result::Result<(), TaskError> {
        let parsed = AwsArn::parse(arn)?;
        let reference = self.cloud.get_image(&parsed, region, reference_ami_id).await?;

        match self.cloud.copy_image(&parsed, region, &reference.image_id).await {
            Ok(new_ami_id) => {
                tracing::info!(
                    reference_ami_id = reference_ami_id,
                    new_ami_id = %new_ami_id,
                    "Copied image into customer account"
                );
                self.dispatcher
                    .dispatch(&Task::CopyAmiSnapshot {
                        arn: arn.to_string(),
                        ami_id: new_ami_id,
                        region: region.to_string(),
                        reference_ami_id: Some(reference_ami_id.to_string()),
                    })
                    .await?;
                Ok(())
            }
            Err(CloudError::MarketplaceImage(_)) if maybe_marketplace => {
                tracing::info!(
                    ami_id = reference_ami_id,
                    "Marketplace image cannot be copied, marking inspected"
                );
                self.images
                    .set_status(reference_ami_id, ImageStatus::Inspected)
                    .await?;
                Ok(())
            }
            Err(e) => Err(TaskError::Fail(e.to_string())),
        }
    }

    /// Revoke our access to the customer snapshot once the copy is done.
    pub async fn remove_snapshot_ownership(
        &self,
        arn: &str,
        customer_snapshot_id: &str,
        region: &str,
        snapshot_copy_id: &str,
    ) -> std::result::Result<(), TaskError> {
        let parsed = AwsArn::parse(arn)?;

        match self
            .cloud
            .get_own_snapshot(self.config.houndigrade_region(), snapshot_copy_id)
            .await
        {
            Ok(copy) => match check_snapshot_state(snapshot_copy_id, &copy.state) {
                Ok(()) => {}
                Err(e @ CloudError::SnapshotNotReady(_)) => {
                    return Err(TaskError::Retry(e.to_string()))
                }
                Err(e) => tracing::warn!(error = %e, "Snapshot copy failed"),
            },
            Err(CloudError::SnapshotNotFound(_)) => {
                tracing::warn!(
                    snapshot_copy_id = snapshot_copy_id,
                    "Snapshot copy not found, removing ownership anyway"
                );
            }
            Err(e) => return Err(TaskError::Fail(e.to_string())),
        }

        self.cloud
            .remove_snapshot_ownership(&parsed, region, customer_snapshot_id)
            .await?;
        Ok(())
    }

    /// Create a volume from our snapshot copy in the inspection zone.
    pub async fn create_volume(
        &self,
        ami_id: &str,
        snapshot_id: &str,
    ) -> std::result::Result<(), TaskError> {
        let zone = &self.config.houndigrade_availability_zone;
        let volume_id = self
            .cloud
            .create_volume(snapshot_id, zone)
            .await
            .map_err(|e| retry_if(e, |e| matches!(e, CloudError::SnapshotNotReady(_))))?;
        let region = get_region_from_availability_zone(zone);

        self.images.set_status(ami_id, ImageStatus::Preparing).await?;

        self.dispatcher
            .dispatch(&Task::EnqueueReadyVolume {
                ami_id: ami_id.to_string(),
                volume_id: volume_id.clone(),
                region: region.to_string(),
            })
            .await?;
        self.dispatcher
            .dispatch(&Task::DeleteSnapshot {
                snapshot_copy_id: snapshot_id.to_string(),
                volume_id,
                volume_region: region.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Put an available volume on the ready-volumes queue.
    pub async fn enqueue_ready_volume(
        &self,
        ami_id: &str,
        volume_id: &str,
        region: &str,
    ) -> std::result::Result<(), TaskError> {
        let volume = self.cloud.get_volume(region, volume_id).await?;
        check_volume_state(volume_id, &volume.state)
            .map_err(|e| retry_if(e, |e| matches!(e, CloudError::VolumeNotReady(_))))?;

        let body = serde_json::to_string(&ReadyVolume {
            ami_id: ami_id.to_string(),
            volume_id: volume_id.to_string(),
        })
        .map_err(AppError::from)?;
        self.queue
            .send_batch(&self.config.ready_volumes_queue_name(), &[body])
            .await?;

        tracing::info!(ami_id = ami_id, volume_id = volume_id, "Volume ready for inspection");
        Ok(())
    }

    /// Delete the intermediate snapshot copy once its volume exists.
    pub async fn delete_snapshot(
        &self,
        snapshot_copy_id: &str,
        volume_id: &str,
        volume_region: &str,
    ) -> std::result::Result<(), TaskError> {
        let volume = self.cloud.get_volume(volume_region, volume_id).await?;
        check_volume_state(volume_id, &volume.state)
            .map_err(|e| retry_if(e, |e| matches!(e, CloudError::VolumeNotReady(_))))?;

        self.cloud
            .delete_snapshot(volume_region, snapshot_copy_id)
            .await?;
        Ok(())
    }

    /// Scale the inspection cluster up when volumes are waiting and it is idle.
    pub async fn scale_up_inspection_cluster(&self) -> std::result::Result<(), TaskError> {
        let group = &self.config.houndigrade_autoscaling_group_name;
        if !self.cloud.is_scaled_down(group).await? {
            tracing::info!(group = %group, "Inspection cluster is busy, not scaling up");
            return Ok(());
        }

        let queue_name = self.config.ready_volumes_queue_name();
        let bodies = self
            .queue
            .receive(&queue_name, self.config.houndigrade_volume_batch_size)
            .await?;
        if bodies.is_empty() {
            tracing::debug!("No volumes waiting for inspection");
            return Ok(());
        }

        let messages: Vec<ReadyVolume> = bodies
            .iter()
            .filter_map(|body| match serde_json::from_str(body) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(error = %e, body = %body, "Skipping malformed ready-volume message");
                    None
                }
            })
            .collect();
        if messages.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.cloud.scale_up(group).await {
            tracing::error!(group = %group, error = %e, "Scale up failed, requeueing volumes");
            self.queue.send_batch(&queue_name, &bodies).await?;
            return Err(TaskError::Fail(e.to_string()));
        }

        tracing::info!(group = %group, volumes = messages.len(), "Scaled up inspection cluster");
        self.dispatcher
            .dispatch(&Task::RunInspectionCluster { messages })
            .await?;
        Ok(())
    }

    /// Attach volumes to the cluster instance and start houndigrade.
    pub async fn run_inspection_cluster(
        &self,
        messages: &[ReadyVolume],
    ) -> std::result::Result<(), TaskError> {
        if messages.is_empty() {
            return Ok(());
        }

        for message in messages {
            if !self
                .images
                .set_status(&message.ami_id, ImageStatus::Inspecting)
                .await?
            {
                tracing::warn!(ami_id = %message.ami_id, "Inspecting an image we do not know");
            }
        }

        let cluster = &self.config.houndigrade_ecs_cluster_name;
        let instances = self.cloud.list_container_instances(cluster).await?;
        let instance = match instances.as_slice() {
            [] => {
                return Err(TaskError::Retry(
                    CloudError::EcsInstanceNotReady(cluster.clone()).to_string(),
                ))
            }
            [only] => only,
            _ => {
                return Err(CloudError::TooManyEcsInstances(cluster.clone()).into());
            }
        };

        let mut command = vec!["-c".to_string(), "aws".to_string()];
        for (message, device) in messages
            .iter()
            .zip(inspection_device_names(messages.len()))
        {
            self.cloud
                .attach_volume(&message.volume_id, &instance.ec2_instance_id, &device)
                .await?;
            command.extend(["-t".to_string(), message.ami_id.clone(), device]);
        }

        let spec = InspectionTaskSpec {
            cluster: cluster.clone(),
            family: self.config.houndigrade_ecs_family_name.clone(),
            image: format!(
                "{}:{}",
                self.config.houndigrade_ecs_image_name, self.config.houndigrade_ecs_image_tag
            ),
            command,
            environment: vec![
                (
                    "AWS_DEFAULT_REGION".to_string(),
                    self.config.houndigrade_region().to_string(),
                ),
                (
                    "RESULTS_QUEUE_NAME".to_string(),
                    self.config.houndigrade_results_queue_name.clone(),
                ),
                (
                    "EXCHANGE_NAME".to_string(),
                    self.config.houndigrade_exchange_name.clone(),
                ),
                (
                    "HOUNDIGRADE_DEBUG".to_string(),
                    self.config.houndigrade_debug.to_string(),
                ),
            ],
        };
        self.cloud.run_inspection_task(&spec).await?;
        Ok(())
    }

    /// Collect houndigrade results and scale the cluster down afterwards.
    pub async fn persist_inspection_cluster_results_task(
        &self,
    ) -> std::result::Result<(), TaskError> {
        let bodies = self
            .queue
            .receive(
                &self.config.houndigrade_results_queue_name,
                HOUNDIGRADE_MESSAGE_READ_LEN,
            )
            .await?;
        if bodies.is_empty() {
            tracing::debug!("No inspection results waiting");
            return Ok(());
        }

        for body in &bodies {
            let Some(message) = parse_results_message(body) else {
                tracing::warn!(body = %body, "Skipping unparseable inspection result");
                continue;
            };
            match message.get("cloud").and_then(Value::as_str) {
                Some("aws") => {
                    if let Err(e) = self.persist_aws_inspection_cluster_results(&message).await {
                        tracing::error!(error = %e, "Failed to persist inspection results");
                    }
                }
                other => {
                    tracing::warn!(cloud = ?other, "Inspection results for unsupported cloud");
                }
            }
        }

        self.dispatcher.dispatch(&Task::ScaleDownCluster).await?;
        Ok(())
    }

    /// Store AWS results; returns how many known images were updated.
    pub async fn persist_aws_inspection_cluster_results(&self, message: &Value) -> Result<usize> {
        let Some(results) = message.get("results").and_then(Value::as_object) else {
            return Ok(0);
        };

        let mut inspected = 0;
        let mut rhel_count = 0;
        for (ami_id, image_results) in results {
            let rhel = inspection_found_rhel(image_results);
            if !self
                .images
                .save_inspection(ami_id, &image_results.to_string(), rhel)
                .await?
            {
                tracing::warn!(ami_id = %ami_id, "Inspection results for unknown image");
                continue;
            }
            tracing::info!(ami_id = %ami_id, rhel, "Image inspected");
            inspected += 1;
            if rhel {
                rhel_count += 1;
            }
        }

        metrics_service::record_images_inspected(inspected, rhel_count);
        Ok(inspected)
    }

    pub async fn scale_down_cluster(&self) -> std::result::Result<(), TaskError> {
        let group = &self.config.houndigrade_autoscaling_group_name;
        self.cloud.scale_down(group).await?;
        tracing::info!(group = %group, "Scaled down inspection cluster");
        Ok(())
    }
}
