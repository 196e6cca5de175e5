//! Account registration.
//!
//! Registering an account checks that the ARN is new, verifies we can act in
//! the customer account, records every running instance with the image behind
//! it and a `power_on` event, and finally queues inspection of the images we
//! have not seen before.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::cloud::{AwsArn, CloudError, CloudProvider, Ec2Image, Ec2Instance};
use crate::error::{AppError, Result};
use crate::models::account::Account;
use crate::models::instance::InstanceEventType;
use crate::models::machine_image::{ImageStatus, TAG_OPENSHIFT};
use crate::services::metrics_service;
use crate::services::task_worker::{Task, TaskDispatcher};

/// Only resource type accepted for registration.
pub const AWS_ACCOUNT_RESOURCE_TYPE: &str = "AwsAccount";

const MAX_NAME_LEN: usize = 256;

/// Input for registering an account.
#[derive(Debug, Clone)]
pub struct RegisterAccountRequest {
    pub account_arn: String,
    pub name: Option<String>,
    pub resourcetype: Option<String>,
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub account: Account,
    pub instances: usize,
    pub images_queued: usize,
}

/// What we learned about one image while discovering instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredImage {
    pub ami_id: String,
    pub region: String,
    pub windows: bool,
    pub openshift: bool,
}

/// Instances and images found in a customer account, ready to persist.
#[derive(Debug, Default)]
pub struct Discovery {
    pub instances: Vec<(String, Ec2Instance)>,
    /// Keyed by AMI id so an image shared by several instances appears once.
    pub images: BTreeMap<String, DiscoveredImage>,
}

impl Discovery {
    /// Combine running instances with the image descriptions for their region.
    pub fn build(
        instances: &HashMap<String, Vec<Ec2Instance>>,
        described: &HashMap<String, Vec<Ec2Image>>,
    ) -> Self {
        let mut discovery = Discovery::default();
        let mut regions: Vec<&String> = instances.keys().collect();
        regions.sort();

        for region in regions {
            let region_images: HashMap<&str, &Ec2Image> = described
                .get(region)
                .map(|images| images.iter().map(|i| (i.image_id.as_str(), i)).collect())
                .unwrap_or_default();

            for instance in &instances[region] {
                let image = region_images.get(instance.image_id.as_str());
                let entry = discovery
                    .images
                    .entry(instance.image_id.clone())
                    .or_insert_with(|| DiscoveredImage {
                        ami_id: instance.image_id.clone(),
                        region: region.clone(),
                        windows: false,
                        openshift: false,
                    });
                entry.windows |= instance.is_windows() || image.is_some_and(|i| i.is_windows());
                entry.openshift |= image.is_some_and(|i| i.is_openshift());
                discovery.instances.push((region.clone(), instance.clone()));
            }
        }
        discovery
    }
}

fn validate_request(req: &RegisterAccountRequest) -> Result<AwsArn> {
    if let Some(resourcetype) = &req.resourcetype {
        if resourcetype != AWS_ACCOUNT_RESOURCE_TYPE {
            return Err(AppError::Validation(format!(
                "resourcetype: '{}' is not a supported account type",
                resourcetype
            )));
        }
    }
    if let Some(name) = &req.name {
        if name.chars().count() > MAX_NAME_LEN {
            return Err(AppError::Validation(format!(
                "name: must be at most {} characters",
                MAX_NAME_LEN
            )));
        }
    }
    AwsArn::parse(req.account_arn.trim()).map_err(|e| match e {
        AppError::Validation(msg) => AppError::Validation(format!("account_arn: {}", msg)),
        other => other,
    })
}

/// Account registration service
pub struct AccountService {
    db: PgPool,
    cloud: Arc<dyn CloudProvider>,
    dispatcher: TaskDispatcher,
}

impl AccountService {
    pub fn new(db: PgPool, cloud: Arc<dyn CloudProvider>, dispatcher: TaskDispatcher) -> Self {
        Self {
            db,
            cloud,
            dispatcher,
        }
    }

    /// Register an AWS account for `user_id`.
    pub async fn register(
        &self,
        user_id: Uuid,
        req: RegisterAccountRequest,
    ) -> Result<Registration> {
        let arn = validate_request(&req)?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE account_arn = $1)")
                .bind(arn.as_str())
                .fetch_one(&self.db)
                .await?;
        if exists {
            return Err(AppError::Conflict(format!(
                "account_arn: '{}' is already registered",
                arn
            )));
        }

        self.cloud.verify_account_access(&arn).await.map_err(|e| match e {
            CloudError::AccessDenied(_) => AppError::Cloud(e),
            other => AppError::Cloud(CloudError::AccessDenied(format!(
                "account_arn: could not access account: {}",
                other
            ))),
        })?;

        let instances = self.cloud.get_running_instances(&arn).await?;
        let mut described = HashMap::new();
        for (region, region_instances) in &instances {
            let mut ami_ids: Vec<String> =
                region_instances.iter().map(|i| i.image_id.clone()).collect();
            ami_ids.sort();
            ami_ids.dedup();
            if ami_ids.is_empty() {
                continue;
            }
            let images = self.cloud.describe_images(&arn, region, &ami_ids).await?;
            described.insert(region.clone(), images);
        }
        let discovery = Discovery::build(&instances, &described);

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let account = insert_account(&mut tx, user_id, &arn, req.name.as_deref()).await?;
        let new_images = persist_discovery(&mut tx, &account, &discovery, now).await?;
        tx.commit().await?;

        tracing::info!(
            account_id = %account.id,
            aws_account_id = %account.aws_account_id,
            instances = discovery.instances.len(),
            images = discovery.images.len(),
            "Registered account"
        );

        let queued = self.queue_inspections(&arn, &discovery, &new_images).await;

        metrics_service::record_account_registered(discovery.instances.len(), queued);

        Ok(Registration {
            account,
            instances: discovery.instances.len(),
            images_queued: queued,
        })
    }

    /// Queue `copy_ami_snapshot` for each new non-Windows image. The account
    /// is already committed, so a failed send is logged and counted but does
    /// not fail the registration. Returns how many tasks were queued.
    async fn queue_inspections(
        &self,
        arn: &AwsArn,
        discovery: &Discovery,
        new_images: &HashSet<String>,
    ) -> usize {
        let mut queued = 0;
        for image in discovery
            .images
            .values()
            .filter(|image| new_images.contains(&image.ami_id) && !image.windows)
        {
            let task = Task::CopyAmiSnapshot {
                arn: arn.to_string(),
                ami_id: image.ami_id.clone(),
                region: image.region.clone(),
                reference_ami_id: None,
            };
            match self.dispatcher.dispatch(&task).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    tracing::error!(
                        ami_id = %image.ami_id,
                        region = %image.region,
                        error = %e,
                        "Failed to queue image inspection"
                    );
                    metrics_service::record_dispatch_failure(task.name());
                }
            }
        }
        queued
    }
}

async fn insert_account(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    arn: &AwsArn,
    name: Option<&str>,
) -> Result<Account> {
    sqlx::query_as::<_, Account>(
        r#"
        INSERT INTO accounts (user_id, name, aws_account_id, account_arn)
        VALUES ($1, $2, $3, $4)
        RETURNING id, user_id, name, aws_account_id, account_arn, created_at, updated_at
        "#,
    )
    .bind(user_id)
    .bind(name)
    .bind(&arn.account_id)
    .bind(arn.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| {
        if e.to_string().contains("duplicate key") {
            AppError::Conflict(format!("account_arn: '{}' is already registered", arn))
        } else {
            AppError::Database(e.to_string())
        }
    })
}

/// Write images, instances and power-on events. Returns the AMI ids of
/// images created by this call.
async fn persist_discovery(
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    discovery: &Discovery,
    now: DateTime<Utc>,
) -> Result<HashSet<String>> {
    let mut image_ids: HashMap<&str, Uuid> = HashMap::new();
    let mut new_images = HashSet::new();

    for image in discovery.images.values() {
        let (status, platform) = if image.windows {
            (ImageStatus::Inspected, Some("windows"))
        } else {
            (ImageStatus::Pending, None)
        };

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO machine_images (account_id, ec2_ami_id, status, platform)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ec2_ami_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(account.id)
        .bind(&image.ami_id)
        .bind(status)
        .bind(platform)
        .fetch_optional(&mut **tx)
        .await?;

        let id = match inserted {
            Some(id) => {
                new_images.insert(image.ami_id.clone());
                if image.openshift {
                    sqlx::query(
                        r#"
                        INSERT INTO machine_image_tags (machineimage_id, imagetag_id)
                        SELECT $1, id FROM image_tags WHERE description = $2
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(id)
                    .bind(TAG_OPENSHIFT)
                    .execute(&mut **tx)
                    .await?;
                }
                id
            }
            None => {
                sqlx::query_scalar("SELECT id FROM machine_images WHERE ec2_ami_id = $1")
                    .bind(&image.ami_id)
                    .fetch_one(&mut **tx)
                    .await?
            }
        };
        image_ids.insert(image.ami_id.as_str(), id);
    }

    for (region, instance) in &discovery.instances {
        let instance_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO instances (account_id, ec2_instance_id, region)
            VALUES ($1, $2, $3)
            ON CONFLICT (ec2_instance_id) DO UPDATE SET updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(account.id)
        .bind(&instance.instance_id)
        .bind(region)
        .fetch_one(&mut **tx)
        .await?;

        let image_id = image_ids
            .get(instance.image_id.as_str())
            .copied()
            .ok_or_else(|| {
                AppError::Internal(format!("no image recorded for {}", instance.image_id))
            })?;

        sqlx::query(
            r#"
            INSERT INTO instance_events
                (instance_id, machineimage_id, event_type, occurred_at, subnet, instance_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(instance_id)
        .bind(image_id)
        .bind(InstanceEventType::PowerOn)
        .bind(now)
        .bind(instance.subnet_id.as_deref())
        .bind(&instance.instance_type)
        .execute(&mut **tx)
        .await?;
    }

    Ok(new_images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::{MockCloud, CUSTOMER_ARN};
    use crate::cloud::{InstanceState, OPENSHIFT_TAG};
    use crate::queue::{MemoryQueue, MessageQueue};
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    fn instance(id: &str, image_id: &str, platform: Option<&str>) -> Ec2Instance {
        Ec2Instance {
            instance_id: id.into(),
            image_id: image_id.into(),
            subnet_id: Some("subnet-1".into()),
            instance_type: "t2.micro".into(),
            platform: platform.map(str::to_string),
            state: InstanceState::Running,
        }
    }

    fn image(id: &str, tags: &[(&str, &str)]) -> Ec2Image {
        Ec2Image {
            image_id: id.into(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    /// Memory queue that refuses messages mentioning `reject`.
    struct RejectingQueue {
        inner: MemoryQueue,
        reject: &'static str,
    }

    #[async_trait::async_trait]
    impl MessageQueue for RejectingQueue {
        async fn send(&self, queue: &str, body: &str, delay: Duration) -> Result<()> {
            if body.contains(self.reject) {
                return Err(AppError::Queue("queue unavailable".into()));
            }
            self.inner.send(queue, body, delay).await
        }

        async fn send_batch(&self, queue: &str, bodies: &[String]) -> Result<()> {
            self.inner.send_batch(queue, bodies).await
        }

        async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>> {
            self.inner.receive(queue, max).await
        }
    }

    fn discovered(ami_id: &str, windows: bool) -> (String, DiscoveredImage) {
        (
            ami_id.to_string(),
            DiscoveredImage {
                ami_id: ami_id.into(),
                region: "us-east-1".into(),
                windows,
                openshift: false,
            },
        )
    }

    fn service() -> (AccountService, Arc<MockCloud>) {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/cloudigrade_test")
            .unwrap();
        let cloud = Arc::new(MockCloud::default());
        let dispatcher = TaskDispatcher::new(Arc::new(MemoryQueue::new()), "test-");
        (AccountService::new(pool, cloud.clone(), dispatcher), cloud)
    }

    #[test]
    fn test_discovery_deduplicates_images_across_instances() {
        let mut instances = HashMap::new();
        instances.insert(
            "us-east-1".to_string(),
            vec![
                instance("i-1", "ami-1", None),
                instance("i-2", "ami-1", None),
            ],
        );
        instances.insert(
            "us-west-2".to_string(),
            vec![instance("i-3", "ami-2", None)],
        );
        let mut described = HashMap::new();
        described.insert("us-east-1".to_string(), vec![image("ami-1", &[])]);

        let discovery = Discovery::build(&instances, &described);

        assert_eq!(discovery.instances.len(), 3);
        assert_eq!(discovery.images.len(), 2);
        assert_eq!(discovery.images["ami-1"].region, "us-east-1");
        assert_eq!(discovery.images["ami-2"].region, "us-west-2");
        assert!(!discovery.images["ami-2"].windows);
    }

    #[test]
    fn test_discovery_flags_windows_and_openshift() {
        let mut instances = HashMap::new();
        instances.insert(
            "us-east-1".to_string(),
            vec![
                instance("i-1", "ami-win", Some("windows")),
                instance("i-2", "ami-ocp", None),
            ],
        );
        let mut described = HashMap::new();
        described.insert(
            "us-east-1".to_string(),
            vec![
                image("ami-win", &[]),
                image("ami-ocp", &[(OPENSHIFT_TAG, "")]),
            ],
        );

        let discovery = Discovery::build(&instances, &described);

        assert!(discovery.images["ami-win"].windows);
        assert!(!discovery.images["ami-win"].openshift);
        assert!(discovery.images["ami-ocp"].openshift);
        assert!(!discovery.images["ami-ocp"].windows);
    }

    #[test]
    fn test_validate_request() {
        let ok = RegisterAccountRequest {
            account_arn: format!(" {} ", CUSTOMER_ARN),
            name: Some("My Account".into()),
            resourcetype: Some(AWS_ACCOUNT_RESOURCE_TYPE.into()),
        };
        assert_eq!(validate_request(&ok).unwrap().account_id, "123456789012");

        let wrong_type = RegisterAccountRequest {
            resourcetype: Some("AzureAccount".into()),
            ..ok.clone()
        };
        assert!(matches!(
            validate_request(&wrong_type),
            Err(AppError::Validation(_))
        ));

        let long_name = RegisterAccountRequest {
            name: Some("x".repeat(MAX_NAME_LEN + 1)),
            ..ok.clone()
        };
        assert!(validate_request(&long_name).is_err());

        let bad_arn = RegisterAccountRequest {
            account_arn: "arn:aws:iam::12345:role/foo".into(),
            ..ok
        };
        let err = validate_request(&bad_arn).unwrap_err();
        assert!(err.to_string().contains("account_arn"));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_arn_before_any_lookup() {
        let (service, cloud) = service();
        let err = service
            .register(
                Uuid::new_v4(),
                RegisterAccountRequest {
                    account_arn: "not-an-arn".into(),
                    name: None,
                    resourcetype: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_queue_failure_skips_only_that_image() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/cloudigrade_test")
            .unwrap();
        let queue = Arc::new(RejectingQueue {
            inner: MemoryQueue::new(),
            reject: "ami-bad",
        });
        let service = AccountService::new(
            pool,
            Arc::new(MockCloud::default()),
            TaskDispatcher::new(queue.clone(), "test-"),
        );
        let discovery = Discovery {
            instances: Vec::new(),
            images: [
                discovered("ami-bad", false),
                discovered("ami-good", false),
                discovered("ami-win", true),
                discovered("ami-known", false),
            ]
            .into_iter()
            .collect(),
        };
        let new_images: HashSet<String> = ["ami-bad", "ami-good", "ami-win"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let arn = AwsArn::parse(CUSTOMER_ARN).unwrap();

        let queued = service
            .queue_inspections(&arn, &discovery, &new_images)
            .await;

        assert_eq!(queued, 1);
        let bodies = queue
            .receive("test-copy_ami_snapshot", 10)
            .await
            .unwrap();
        assert_eq!(bodies.len(), 1);
        let (task, _) = Task::decode(&bodies[0]).unwrap();
        assert_eq!(
            task,
            Task::CopyAmiSnapshot {
                arn: CUSTOMER_ARN.into(),
                ami_id: "ami-good".into(),
                region: "us-east-1".into(),
                reference_ami_id: None,
            }
        );
    }
}
