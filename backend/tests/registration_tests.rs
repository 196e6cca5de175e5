//! Account registration against a real database and a mock cloud.
//!
//! These tests need PostgreSQL. Set DATABASE_URL and run:
//! ```sh
//! cargo test --test registration_tests -- --ignored
//! ```

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{test_arn, test_id, TestContext};
use sqlx::PgPool;
use uuid::Uuid;

use cloudigrade_backend::cloud::mock::MockCloud;
use cloudigrade_backend::cloud::{Ec2Image, Ec2Instance, InstanceState, OPENSHIFT_TAG};
use cloudigrade_backend::error::AppError;
use cloudigrade_backend::queue::{MemoryQueue, MessageQueue};
use cloudigrade_backend::services::account_service::{
    AccountService, RegisterAccountRequest, AWS_ACCOUNT_RESOURCE_TYPE,
};
use cloudigrade_backend::services::task_worker::{Task, TaskDispatcher};

const COPY_QUEUE: &str = "test-copy_ami_snapshot";

fn running(image_id: &str, platform: Option<&str>, subnet: Option<&str>) -> Ec2Instance {
    Ec2Instance {
        instance_id: format!("i-{}", test_id()),
        image_id: image_id.to_string(),
        subnet_id: subnet.map(str::to_string),
        instance_type: "t2.micro".into(),
        platform: platform.map(str::to_string),
        state: InstanceState::Running,
    }
}

fn ami() -> String {
    format!("ami-{}", test_id())
}

fn request(arn: &str) -> RegisterAccountRequest {
    RegisterAccountRequest {
        account_arn: arn.to_string(),
        name: Some("production".into()),
        resourcetype: Some(AWS_ACCOUNT_RESOURCE_TYPE.into()),
    }
}

fn service(pool: &PgPool, cloud: MockCloud, queue: &Arc<MemoryQueue>) -> AccountService {
    AccountService::new(
        pool.clone(),
        Arc::new(cloud),
        TaskDispatcher::new(queue.clone(), "test-"),
    )
}

/// AMI id and region of every queued `copy_ami_snapshot`.
async fn queued_copies(queue: &MemoryQueue) -> HashMap<String, String> {
    queue
        .receive(COPY_QUEUE, 100)
        .await
        .unwrap()
        .iter()
        .map(|body| match Task::decode(body).unwrap().0 {
            Task::CopyAmiSnapshot { ami_id, region, .. } => (ami_id, region),
            other => panic!("unexpected task {:?}", other),
        })
        .collect()
}

async fn image_row(pool: &PgPool, ami_id: &str) -> (Uuid, String, Option<String>) {
    sqlx::query_as("SELECT id, status::text, platform FROM machine_images WHERE ec2_ami_id = $1")
        .bind(ami_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn has_tag(pool: &PgPool, ami_id: &str, tag: &str) -> bool {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM machine_image_tags mt
            JOIN image_tags t ON t.id = mt.imagetag_id
            JOIN machine_images m ON m.id = mt.machineimage_id
            WHERE m.ec2_ami_id = $1 AND t.description = $2
        )
        "#,
    )
    .bind(ami_id)
    .bind(tag)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
#[ignore = "requires database"]
async fn test_register_records_inventory_and_queues_new_images() {
    let ctx = TestContext::new().await;
    let user_id = ctx.user(false).await;
    let (rhel, windows, openshift) = (ami(), ami(), ami());

    let east = vec![
        running(&rhel, None, Some("subnet-1")),
        running(&rhel, None, Some("subnet-1")),
        running(&windows, Some("windows"), Some("subnet-2")),
    ];
    let west = vec![running(&openshift, None, None)];
    let classic_instance = west[0].instance_id.clone();

    let cloud = MockCloud {
        instances: HashMap::from([
            ("us-east-1".to_string(), east),
            ("us-west-2".to_string(), west),
        ]),
        images: vec![
            Ec2Image {
                image_id: rhel.clone(),
                ..Default::default()
            },
            Ec2Image {
                image_id: windows.clone(),
                platform: Some("windows".into()),
                ..Default::default()
            },
            Ec2Image {
                image_id: openshift.clone(),
                tags: HashMap::from([(OPENSHIFT_TAG.to_string(), String::new())]),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let queue = Arc::new(MemoryQueue::new());
    let arn = test_arn();

    let registration = service(ctx.pool(), cloud, &queue)
        .register(user_id, request(&arn))
        .await
        .unwrap();

    assert_eq!(registration.account.user_id, user_id);
    assert_eq!(registration.account.account_arn, arn);
    assert_eq!(registration.account.name.as_deref(), Some("production"));
    assert_eq!(registration.instances, 4);
    assert_eq!(registration.images_queued, 2);

    let instances: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE account_id = $1")
        .bind(registration.account.id)
        .fetch_one(ctx.pool())
        .await
        .unwrap();
    assert_eq!(instances, 4);

    let power_ons: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM instance_events e
        JOIN instances i ON i.id = e.instance_id
        WHERE i.account_id = $1 AND e.event_type = 'power_on'
        "#,
    )
    .bind(registration.account.id)
    .fetch_one(ctx.pool())
    .await
    .unwrap();
    assert_eq!(power_ons, 4);

    let classic_subnet: Option<String> = sqlx::query_scalar(
        r#"
        SELECT e.subnet FROM instance_events e
        JOIN instances i ON i.id = e.instance_id
        WHERE i.ec2_instance_id = $1
        "#,
    )
    .bind(&classic_instance)
    .fetch_one(ctx.pool())
    .await
    .unwrap();
    assert_eq!(classic_subnet, None);

    let (_, status, _) = image_row(ctx.pool(), &rhel).await;
    assert_eq!(status, "pending");
    let (_, status, platform) = image_row(ctx.pool(), &windows).await;
    assert_eq!(status, "inspected");
    assert_eq!(platform.as_deref(), Some("windows"));

    assert!(has_tag(ctx.pool(), &openshift, "openshift").await);
    assert!(!has_tag(ctx.pool(), &rhel, "openshift").await);

    let copies = queued_copies(&queue).await;
    assert_eq!(copies.len(), 2);
    assert_eq!(copies[&rhel], "us-east-1");
    assert_eq!(copies[&openshift], "us-west-2");
    assert!(!copies.contains_key(&windows));
}

#[tokio::test]
#[ignore = "requires database"]
async fn test_register_reuses_known_images() {
    let ctx = TestContext::new().await;
    let user_id = ctx.user(false).await;
    let queue = Arc::new(MemoryQueue::new());
    let (shared, fresh) = (ami(), ami());

    let first = MockCloud {
        instances: HashMap::from([(
            "us-east-1".to_string(),
            vec![running(&shared, None, Some("subnet-1"))],
        )]),
        images: Vec::new(),
        ..Default::default()
    };
    let registration = service(ctx.pool(), first, &queue)
        .register(user_id, request(&test_arn()))
        .await
        .unwrap();
    assert_eq!(registration.images_queued, 1);
    assert_eq!(
        queued_copies(&queue).await.into_keys().collect::<HashSet<_>>(),
        HashSet::from([shared.clone()])
    );
    let (shared_id, _, _) = image_row(ctx.pool(), &shared).await;

    let second = MockCloud {
        instances: HashMap::from([(
            "us-east-1".to_string(),
            vec![
                running(&shared, None, Some("subnet-1")),
                running(&fresh, None, Some("subnet-1")),
            ],
        )]),
        images: Vec::new(),
        ..Default::default()
    };
    let registration = service(ctx.pool(), second, &queue)
        .register(user_id, request(&test_arn()))
        .await
        .unwrap();

    assert_eq!(registration.images_queued, 1);
    assert_eq!(
        queued_copies(&queue).await.into_keys().collect::<HashSet<_>>(),
        HashSet::from([fresh.clone()])
    );

    let shared_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM machine_images WHERE ec2_ami_id = $1")
            .bind(&shared)
            .fetch_one(ctx.pool())
            .await
            .unwrap();
    assert_eq!(shared_rows, 1);

    let events_on_shared: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM instance_events e
        JOIN instances i ON i.id = e.instance_id
        WHERE i.account_id = $1 AND e.machineimage_id = $2
        "#,
    )
    .bind(registration.account.id)
    .bind(shared_id)
    .fetch_one(ctx.pool())
    .await
    .unwrap();
    assert_eq!(events_on_shared, 1);
}

#[tokio::test]
#[ignore = "requires database"]
async fn test_register_same_arn_twice() {
    let ctx = TestContext::new().await;
    let user_id = ctx.user(false).await;
    let queue = Arc::new(MemoryQueue::new());
    let arn = test_arn();

    service(ctx.pool(), MockCloud::default(), &queue)
        .register(user_id, request(&arn))
        .await
        .unwrap();

    let cloud = Arc::new(MockCloud::default());
    let err = AccountService::new(
        ctx.pool().clone(),
        cloud.clone(),
        TaskDispatcher::new(queue.clone(), "test-"),
    )
    .register(user_id, request(&arn))
    .await
    .unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)));
    assert!(cloud.calls().is_empty());
}
