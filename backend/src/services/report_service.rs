//! Usage reports built from instance power events.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::collections::{BTreeMap, HashSet};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::account::Account;
use crate::models::instance::InstanceEventType;

/// Which accounts a report covers.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub user_id: Uuid,
    pub name_pattern: Option<String>,
    pub account_id: Option<Uuid>,
}

/// An event joined with what the report needs to know about its instance and image.
#[derive(Debug, Clone, FromRow)]
pub struct UsageEvent {
    pub instance_id: Uuid,
    pub account_id: Uuid,
    pub machineimage_id: Uuid,
    pub event_type: InstanceEventType,
    pub occurred_at: DateTime<Utc>,
    pub rhel: bool,
    pub openshift: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DailyUsage {
    pub date: DateTime<Utc>,
    pub rhel_instances: usize,
    pub openshift_instances: usize,
    pub rhel_runtime_seconds: f64,
    pub openshift_runtime_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct UsageReport {
    pub instances_seen_with_rhel: usize,
    pub instances_seen_with_openshift: usize,
    pub daily_usage: Vec<DailyUsage>,
}

/// Counts for one account. The counts are `None` when the account did not
/// exist yet during the period.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AccountOverview {
    pub id: Uuid,
    pub cloud_account_id: String,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub cloud_type: String,
    pub arn: String,
    pub creation_date: DateTime<Utc>,
    pub name: Option<String>,
    pub images: Option<usize>,
    pub instances: Option<usize>,
    pub rhel_instances: Option<usize>,
    pub openshift_instances: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AccountOverviews {
    pub cloud_account_overviews: Vec<AccountOverview>,
}

/// Lowercased, de-duplicated words of a name filter. Empty patterns give `None`.
pub fn name_pattern_words(pattern: Option<&str>) -> Option<Vec<String>> {
    let mut words: Vec<String> = pattern?
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    words.sort();
    words.dedup();
    (!words.is_empty()).then_some(words)
}

/// Seconds an instance was running within `[start, end)`.
///
/// Only the latest event before `start` and the events inside the window
/// matter. A run still open at `end` counts until `end`.
pub fn calculate_instance_usage(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &[(DateTime<Utc>, InstanceEventType)],
) -> f64 {
    let mut sorted: Vec<_> = events.to_vec();
    sorted.sort_by_key(|(at, _)| *at);

    let before = sorted.iter().filter(|(at, _)| *at < start).last();
    let during = sorted.iter().filter(|(at, _)| start <= *at && *at < end);

    let mut last_started: Option<DateTime<Utc>> = None;
    let mut running = 0.0;
    for (at, event_type) in before.into_iter().chain(during) {
        let at = (*at).max(start);
        match (last_started, event_type) {
            (None, InstanceEventType::PowerOn) => last_started = Some(at),
            (Some(started), InstanceEventType::PowerOff) => {
                running += seconds(at - started);
                last_started = None;
            }
            _ => {}
        }
    }
    if let Some(started) = last_started {
        running += seconds(end - started);
    }
    running
}

fn seconds(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Split `[start, end)` into whole days and total RHEL/OpenShift runtime per day.
pub fn calculate_daily_usage(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &[UsageEvent],
) -> UsageReport {
    let mut by_instance: BTreeMap<Uuid, Vec<&UsageEvent>> = BTreeMap::new();
    for event in events {
        by_instance.entry(event.instance_id).or_default().push(event);
    }

    let mut rhel_seen = HashSet::new();
    let mut openshift_seen = HashSet::new();
    let mut daily_usage = Vec::new();

    for day in 0..(end - start).num_days() {
        let day_start = start + Duration::days(day);
        let day_end = day_start + Duration::days(1);
        let mut usage = DailyUsage {
            date: day_start,
            rhel_instances: 0,
            openshift_instances: 0,
            rhel_runtime_seconds: 0.0,
            openshift_runtime_seconds: 0.0,
        };

        for (instance_id, instance_events) in &by_instance {
            let points: Vec<_> = instance_events
                .iter()
                .map(|e| (e.occurred_at, e.event_type))
                .collect();
            let runtime = calculate_instance_usage(day_start, day_end, &points);
            if runtime == 0.0 {
                continue;
            }

            // AWS instances never change image, so any event describes it.
            let image = instance_events[0];
            if image.rhel {
                usage.rhel_instances += 1;
                usage.rhel_runtime_seconds += runtime;
                rhel_seen.insert(*instance_id);
            }
            if image.openshift {
                usage.openshift_instances += 1;
                usage.openshift_runtime_seconds += runtime;
                openshift_seen.insert(*instance_id);
            }
        }
        daily_usage.push(usage);
    }

    UsageReport {
        instances_seen_with_rhel: rhel_seen.len(),
        instances_seen_with_openshift: openshift_seen.len(),
        daily_usage,
    }
}

/// Summarize one account's relevant events.
pub fn account_overview(
    account: &Account,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &[UsageEvent],
) -> AccountOverview {
    let counts = if end <= account.created_at {
        tracing::info!(
            account_id = %account.id,
            end = %end,
            "Account created after the report period, no counts available"
        );
        None
    } else {
        let mut instances = HashSet::new();
        let mut images = HashSet::new();
        let mut rhel = HashSet::new();
        let mut openshift = HashSet::new();
        for event in events.iter().filter(|e| e.account_id == account.id) {
            // Before the window only a power-on says anything about the period.
            if event.occurred_at < start && event.event_type == InstanceEventType::PowerOff {
                continue;
            }
            instances.insert(event.instance_id);
            images.insert(event.machineimage_id);
            if event.rhel {
                rhel.insert(event.machineimage_id);
            }
            if event.openshift {
                openshift.insert(event.machineimage_id);
            }
        }
        Some((images.len(), instances.len(), rhel.len(), openshift.len()))
    };

    AccountOverview {
        id: account.id,
        cloud_account_id: account.cloud_account_id().to_string(),
        user_id: account.user_id,
        cloud_type: account.cloud_type().to_string(),
        arn: account.account_arn.clone(),
        creation_date: account.created_at,
        name: account.name.clone(),
        images: counts.map(|c| c.0),
        instances: counts.map(|c| c.1),
        rhel_instances: counts.map(|c| c.2),
        openshift_instances: counts.map(|c| c.3),
    }
}

fn validate_period(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if start >= end {
        return Err(AppError::Validation(
            "start: must be earlier than end".to_string(),
        ));
    }
    Ok(())
}

/// Report service
pub struct ReportService {
    db: PgPool,
}

impl ReportService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn get_daily_usage(
        &self,
        filter: &ReportFilter,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageReport> {
        validate_period(start, end)?;
        let accounts = self.filter_accounts(filter).await?;
        let ids: Vec<Uuid> = accounts.iter().map(|a| a.id).collect();
        let events = self.relevant_events(&ids, start, end).await?;
        Ok(calculate_daily_usage(start, end, &events))
    }

    pub async fn get_account_overviews(
        &self,
        filter: &ReportFilter,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AccountOverviews> {
        validate_period(start, end)?;
        let accounts = self.filter_accounts(filter).await?;
        let ids: Vec<Uuid> = accounts.iter().map(|a| a.id).collect();
        let events = self.relevant_events(&ids, start, end).await?;
        Ok(AccountOverviews {
            cloud_account_overviews: accounts
                .iter()
                .map(|account| account_overview(account, start, end, &events))
                .collect(),
        })
    }

    async fn filter_accounts(&self, filter: &ReportFilter) -> Result<Vec<Account>> {
        let words = name_pattern_words(filter.name_pattern.as_deref());
        let accounts = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, user_id, name, aws_account_id, account_arn, created_at, updated_at
            FROM accounts
            WHERE user_id = $1
              AND ($2::uuid IS NULL OR id = $2)
              AND ($3::text[] IS NULL OR EXISTS (
                  SELECT 1 FROM unnest($3::text[]) AS w(word)
                  WHERE name ILIKE '%' || w.word || '%'
              ))
            ORDER BY created_at, id
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.account_id)
        .bind(words)
        .fetch_all(&self.db)
        .await?;
        Ok(accounts)
    }

    /// The latest event before `start` for each instance plus every event
    /// inside `[start, end)`.
    async fn relevant_events(
        &self,
        account_ids: &[Uuid],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>> {
        if account_ids.is_empty() {
            return Ok(Vec::new());
        }

        let events = sqlx::query_as::<_, UsageEvent>(
            r#"
            WITH last_before AS (
                SELECT e.instance_id, MAX(e.occurred_at) AS occurred_at
                FROM instance_events e JOIN instances i ON i.id = e.instance_id
                WHERE i.account_id = ANY($1) AND e.occurred_at < $2
                GROUP BY e.instance_id
            )
            SELECT e.instance_id, i.account_id, e.machineimage_id, e.event_type, e.occurred_at,
                EXISTS(
                    SELECT 1 FROM machine_image_tags mit JOIN image_tags t ON t.id = mit.imagetag_id
                    WHERE mit.machineimage_id = e.machineimage_id AND t.description = 'rhel'
                ) AS rhel,
                EXISTS(
                    SELECT 1 FROM machine_image_tags mit JOIN image_tags t ON t.id = mit.imagetag_id
                    WHERE mit.machineimage_id = e.machineimage_id AND t.description = 'openshift'
                ) AS openshift
            FROM instance_events e
            JOIN instances i ON i.id = e.instance_id
            LEFT JOIN last_before lb
                ON lb.instance_id = e.instance_id AND lb.occurred_at = e.occurred_at
            WHERE i.account_id = ANY($1)
              AND ((e.occurred_at >= $2 AND e.occurred_at < $3) OR lb.instance_id IS NOT NULL)
            ORDER BY e.instance_id, e.occurred_at
            "#,
        )
        .bind(account_ids)
        .bind(start)
        .bind(end)
        .fetch_all(&self.db)
        .await?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use InstanceEventType::{PowerOff, PowerOn};

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 1, d, h, 0, 0).unwrap()
    }

    const HOUR: f64 = 3600.0;

    #[test]
    fn test_usage_on_and_off_inside_window() {
        let events = [(day(1, 2), PowerOn), (day(1, 5), PowerOff)];
        assert_eq!(calculate_instance_usage(day(1, 0), day(2, 0), &events), 3.0 * HOUR);
    }

    #[test]
    fn test_usage_on_before_off_inside() {
        let events = [(day(1, 0), PowerOn), (day(3, 6), PowerOff)];
        assert_eq!(calculate_instance_usage(day(3, 0), day(4, 0), &events), 6.0 * HOUR);
    }

    #[test]
    fn test_usage_on_only() {
        let events = [(day(1, 12), PowerOn)];
        assert_eq!(calculate_instance_usage(day(1, 0), day(2, 0), &events), 12.0 * HOUR);
    }

    #[test]
    fn test_usage_repeated_on_counts_once() {
        let events = [(day(1, 2), PowerOn), (day(1, 4), PowerOn), (day(1, 6), PowerOff)];
        assert_eq!(calculate_instance_usage(day(1, 0), day(2, 0), &events), 4.0 * HOUR);
    }

    #[test]
    fn test_usage_off_only() {
        let events = [(day(1, 6), PowerOff)];
        assert_eq!(calculate_instance_usage(day(1, 0), day(2, 0), &events), 0.0);
    }

    #[test]
    fn test_usage_on_before_never_off() {
        let events = [(day(1, 0), PowerOn)];
        assert_eq!(calculate_instance_usage(day(5, 0), day(6, 0), &events), 24.0 * HOUR);
    }

    #[test]
    fn test_usage_on_before_off_after() {
        let events = [(day(1, 0), PowerOn), (day(9, 0), PowerOff)];
        assert_eq!(calculate_instance_usage(day(5, 0), day(6, 0), &events), 24.0 * HOUR);
    }

    #[test]
    fn test_usage_multiple_runs_unsorted() {
        let events = [
            (day(1, 10), PowerOn),
            (day(1, 1), PowerOn),
            (day(1, 12), PowerOff),
            (day(1, 3), PowerOff),
        ];
        assert_eq!(calculate_instance_usage(day(1, 0), day(2, 0), &events), 4.0 * HOUR);
    }

    #[test]
    fn test_usage_only_latest_event_before_window_counts() {
        // Stopped before the window despite an earlier start.
        let events = [(day(1, 0), PowerOn), (day(2, 0), PowerOff)];
        assert_eq!(calculate_instance_usage(day(3, 0), day(4, 0), &events), 0.0);
    }

    fn event(
        instance: Uuid,
        account: Uuid,
        image: Uuid,
        event_type: InstanceEventType,
        at: DateTime<Utc>,
        rhel: bool,
        openshift: bool,
    ) -> UsageEvent {
        UsageEvent {
            instance_id: instance,
            account_id: account,
            machineimage_id: image,
            event_type,
            occurred_at: at,
            rhel,
            openshift,
        }
    }

    #[test]
    fn test_daily_usage_splits_by_day() {
        let account = Uuid::new_v4();
        let rhel_image = Uuid::new_v4();
        let ocp_image = Uuid::new_v4();
        let plain_image = Uuid::new_v4();
        let (i1, i2, i3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let events = vec![
            // RHEL instance running from day 1 noon to day 2 06:00.
            event(i1, account, rhel_image, PowerOn, day(1, 12), true, false),
            event(i1, account, rhel_image, PowerOff, day(2, 6), true, false),
            // RHEL + OpenShift instance running all of day 2 and beyond.
            event(i2, account, ocp_image, PowerOn, day(2, 0), true, true),
            // Untagged image.
            event(i3, account, plain_image, PowerOn, day(1, 0), false, false),
        ];

        let report = calculate_daily_usage(day(1, 0), day(4, 0), &events);

        assert_eq!(report.daily_usage.len(), 3);
        assert_eq!(report.instances_seen_with_rhel, 2);
        assert_eq!(report.instances_seen_with_openshift, 1);

        let d1 = &report.daily_usage[0];
        assert_eq!(d1.date, day(1, 0));
        assert_eq!(d1.rhel_instances, 1);
        assert_eq!(d1.rhel_runtime_seconds, 12.0 * HOUR);
        assert_eq!(d1.openshift_instances, 0);

        let d2 = &report.daily_usage[1];
        assert_eq!(d2.rhel_instances, 2);
        assert_eq!(d2.rhel_runtime_seconds, 30.0 * HOUR);
        assert_eq!(d2.openshift_instances, 1);
        assert_eq!(d2.openshift_runtime_seconds, 24.0 * HOUR);

        let d3 = &report.daily_usage[2];
        assert_eq!(d3.rhel_instances, 1);
        assert_eq!(d3.openshift_runtime_seconds, 24.0 * HOUR);
    }

    #[test]
    fn test_daily_usage_without_events() {
        let report = calculate_daily_usage(day(1, 0), day(3, 0), &[]);
        assert_eq!(report.daily_usage.len(), 2);
        assert!(report
            .daily_usage
            .iter()
            .all(|d| d.rhel_instances == 0 && d.rhel_runtime_seconds == 0.0));
        assert_eq!(report.instances_seen_with_rhel, 0);
    }

    fn account(created_at: DateTime<Utc>) -> Account {
        Account {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: Some("greatest account ever".into()),
            aws_account_id: "123456789012".into(),
            account_arn: "arn:aws:iam::123456789012:role/cloudigrade".into(),
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn test_account_overview_counts_distinct() {
        let acct = account(day(1, 0));
        let rhel_image = Uuid::new_v4();
        let plain_image = Uuid::new_v4();
        let (i1, i2, i3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let other_account = Uuid::new_v4();

        let events = vec![
            event(i1, acct.id, rhel_image, PowerOn, day(5, 1), true, false),
            event(i1, acct.id, rhel_image, PowerOff, day(5, 2), true, false),
            event(i2, acct.id, rhel_image, PowerOn, day(5, 3), true, false),
            // Powered off before the window: ignored.
            event(i3, acct.id, plain_image, PowerOff, day(4, 0), false, false),
            event(Uuid::new_v4(), other_account, plain_image, PowerOn, day(5, 1), false, false),
        ];

        let overview = account_overview(&acct, day(5, 0), day(6, 0), &events);

        assert_eq!(overview.instances, Some(2));
        assert_eq!(overview.images, Some(1));
        assert_eq!(overview.rhel_instances, Some(1));
        assert_eq!(overview.openshift_instances, Some(0));
        assert_eq!(overview.cloud_type, "aws");
        assert_eq!(overview.cloud_account_id, "123456789012");
    }

    #[test]
    fn test_account_overview_counts_power_on_before_window() {
        let acct = account(day(1, 0));
        let image = Uuid::new_v4();
        let events = vec![event(Uuid::new_v4(), acct.id, image, PowerOn, day(2, 0), false, true)];

        let overview = account_overview(&acct, day(5, 0), day(6, 0), &events);

        assert_eq!(overview.instances, Some(1));
        assert_eq!(overview.openshift_instances, Some(1));
    }

    #[test]
    fn test_account_overview_created_after_period() {
        let acct = account(day(10, 0));
        let overview = account_overview(&acct, day(5, 0), day(6, 0), &[]);
        assert_eq!(overview.images, None);
        assert_eq!(overview.instances, None);

        let json = serde_json::to_value(&overview).unwrap();
        assert!(json["rhel_instances"].is_null());
        assert_eq!(json["type"], "aws");
    }

    #[test]
    fn test_name_pattern_words() {
        assert_eq!(name_pattern_words(None), None);
        assert_eq!(name_pattern_words(Some("   ")), None);
        assert_eq!(
            name_pattern_words(Some("Greatest  account greatest")),
            Some(vec!["account".to_string(), "greatest".to_string()])
        );
    }

    #[test]
    fn test_validate_period() {
        assert!(validate_period(day(1, 0), day(2, 0)).is_ok());
        assert!(validate_period(day(2, 0), day(2, 0)).is_err());
        assert!(validate_period(day(3, 0), day(2, 0)).is_err());
    }
}
