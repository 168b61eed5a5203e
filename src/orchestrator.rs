//! Orchestrator: fans the preset catalog into queue tasks on a schedule,
//! under quiet-hours and daily-budget gates.
//!
//! Two jobs are registered on start: the digest cron (09:00/19:00 UTC, with
//! notifications) and a silent hourly pass. Per-user crontabs filter which
//! users contribute `(category, geoid)` pairs to a given run; the default
//! geoid always keeps a baseline pass per category.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use metrics::counter;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::config::{Presets, Settings};
use crate::models::{Site, TaskPayload};
use crate::queue::{PublishOutcome, TaskQueue};
use crate::storage::Store;

/// Six-field form of the digest schedule (tokio-cron-scheduler wants seconds).
const DIGEST_CRON: &str = "0 0 9,19 * * *";
const SILENT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub published: u32,
    pub skipped: u32,
}

pub struct Orchestrator {
    queue: Arc<dyn TaskQueue>,
    store: Store,
    presets: Presets,
    max_pages: u32,
    max_tasks: u32,
    quiet_hours: Option<(u32, u32)>,
    min_discount: i64,
    min_score: i64,
    default_geoid: String,
    publish_pause: Duration,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Store,
        presets: Presets,
        settings: &Settings,
    ) -> Self {
        let default_geoid = if presets.geoid_default.is_empty() {
            settings.default_geoid.clone()
        } else {
            presets.geoid_default.clone()
        };
        Self {
            queue,
            store,
            presets,
            max_pages: settings.budget_max_pages,
            max_tasks: settings.budget_max_tasks,
            quiet_hours: settings.quiet_hours,
            min_discount: settings.min_discount,
            min_score: settings.min_score,
            default_geoid,
            publish_pause: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn without_pause(mut self) -> Self {
        self.publish_pause = Duration::ZERO;
        self
    }

    /// Registers the digest cron and the silent hourly job, and starts the
    /// scheduler. The returned handle owns both jobs.
    pub async fn start(self: Arc<Self>) -> Result<JobScheduler> {
        let mut scheduler = JobScheduler::new().await.context("create scheduler")?;

        let digest = {
            let orchestrator = self.clone();
            Job::new_async(DIGEST_CRON, move |_id, _sched| {
                let orchestrator = orchestrator.clone();
                Box::pin(async move {
                    if let Err(err) = orchestrator.run_presets(true).await {
                        warn!(%err, "digest run failed");
                    }
                })
            })
            .context("build digest job")?
        };
        scheduler.add(digest).await.context("add digest job")?;

        let silent = {
            let orchestrator = self.clone();
            Job::new_repeated_async(SILENT_INTERVAL, move |_id, _sched| {
                let orchestrator = orchestrator.clone();
                Box::pin(async move {
                    if let Err(err) = orchestrator.run_presets(false).await {
                        warn!(%err, "silent run failed");
                    }
                })
            })
            .context("build hourly job")?
        };
        scheduler.add(silent).await.context("add hourly job")?;

        scheduler.start().await.context("start scheduler")?;
        info!("orchestrator scheduled: digest 09:00/19:00 UTC, silent hourly");
        Ok(scheduler)
    }

    /// One fan-out pass. Budget counters reset at the beginning of each run.
    pub async fn run_presets(&self, notify: bool) -> Result<RunStats> {
        let mut pages_sent: u32 = 0;
        let mut tasks_sent: u32 = 0;
        let mut stats = RunStats::default();
        let now = Utc::now();

        let users = self.store.active_users().await?;
        let all_categories = self.presets.categories();

        let mut pairs: BTreeSet<(String, String)> = BTreeSet::new();
        for user in &users {
            if let Some(cron) = &user.schedule_cron {
                match cron_matches(cron, now) {
                    Some(true) => {}
                    Some(false) => {
                        debug!(geoid = %user.geoid, cron, "schedule does not match; skipping user");
                        continue;
                    }
                    None => {
                        warn!(geoid = %user.geoid, cron, "invalid user crontab; skipping user");
                        continue;
                    }
                }
            }
            let categories = match &user.categories {
                Some(cats) if !cats.is_empty() => cats.clone(),
                _ => all_categories.clone(),
            };
            for category in categories {
                pairs.insert((category, user.geoid.clone()));
            }
        }
        // Baseline pass: every category for the default region.
        for category in &all_categories {
            pairs.insert((category.clone(), self.default_geoid.clone()));
        }

        for (category, geoid) in pairs {
            for (site_name, items) in &self.presets.sites {
                let Ok(site) = Site::from_str(site_name) else {
                    warn!(site = %site_name, "unknown site in presets; skipping");
                    continue;
                };
                for item in items.iter().filter(|i| i.category() == category) {
                    let mut task = TaskPayload::new(site, item.url.clone());
                    task.geoid = Some(geoid.clone());
                    task.category = Some(category.clone());
                    task.min_discount = self.min_discount;
                    task.min_score = self.min_score;
                    task.notify = notify;

                    if !self.admit(&task, &mut pages_sent, &mut tasks_sent) {
                        stats.skipped += 1;
                        continue;
                    }
                    match self.queue.publish(&task).await {
                        Ok(PublishOutcome::Published) => {
                            stats.published += 1;
                            tokio::time::sleep(self.publish_pause).await;
                        }
                        Ok(PublishOutcome::Duplicate) => {
                            debug!(url = %task.url, "duplicate task suppressed at publish");
                        }
                        Err(err) => {
                            warn!(%err, url = %task.url, "publish failed");
                        }
                    }
                }
            }
        }
        info!(
            notify,
            published = stats.published,
            skipped = stats.skipped,
            "preset run finished"
        );
        Ok(stats)
    }

    /// Admission gate: quiet hours, then page and task budgets. Admitted
    /// tasks consume one unit of each budget.
    fn admit(&self, task: &TaskPayload, pages_sent: &mut u32, tasks_sent: &mut u32) -> bool {
        if self.in_quiet_hours(Utc::now().hour()) {
            debug!(url = %task.url, "quiet hours; task skipped");
            counter!("tasks_skipped_total", 1, "reason" => "quiet_hours");
            return false;
        }
        if *pages_sent >= self.max_pages {
            warn!(limit = self.max_pages, url = %task.url, "page budget exceeded");
            counter!("budget_exceeded_total", 1, "type" => "pages");
            counter!("tasks_skipped_total", 1, "reason" => "max_pages");
            return false;
        }
        if *tasks_sent >= self.max_tasks {
            warn!(limit = self.max_tasks, url = %task.url, "task budget exceeded");
            counter!("budget_exceeded_total", 1, "type" => "tasks");
            counter!("tasks_skipped_total", 1, "reason" => "max_tasks");
            return false;
        }
        *pages_sent += 1;
        *tasks_sent += 1;
        true
    }

    fn in_quiet_hours(&self, hour: u32) -> bool {
        match self.quiet_hours {
            Some((start, end)) if start <= end => start <= hour && hour < end,
            Some((start, end)) => hour >= start || hour < end,
            None => false,
        }
    }
}

/// Matches a standard five-field crontab against `now` at minute resolution.
/// `None` when the expression does not parse.
pub fn cron_matches(expr: &str, now: DateTime<Utc>) -> Option<bool> {
    let schedule = cron::Schedule::from_str(&format!("0 {}", expr.trim())).ok()?;
    let minute = now.with_second(0).and_then(|t| t.with_nanosecond(0))?;
    Some(schedule.includes(minute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresetItem;
    use crate::models::User;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockQueue {
        published: Mutex<Vec<TaskPayload>>,
    }

    #[async_trait]
    impl TaskQueue for MockQueue {
        async fn publish(&self, task: &TaskPayload) -> Result<PublishOutcome> {
            self.published.lock().push(task.clone());
            Ok(PublishOutcome::Published)
        }
    }

    fn presets_two_sites() -> Presets {
        let mut sites = HashMap::new();
        sites.insert(
            "ozon".to_string(),
            vec![PresetItem {
                name: "phones:top".into(),
                url: "https://www.ozon.ru/category/smartfony/".into(),
            }],
        );
        sites.insert(
            "market".to_string(),
            vec![PresetItem {
                name: "phones:top".into(),
                url: "https://market.yandex.ru/catalog--smartfony/1/list".into(),
            }],
        );
        Presets {
            geoid_default: "213".into(),
            sites,
        }
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::from_env();
        settings.quiet_hours = None;
        settings.budget_max_pages = 100;
        settings.budget_max_tasks = 20;
        settings
    }

    fn orchestrator(queue: Arc<MockQueue>, settings: Settings) -> Orchestrator {
        let store = Store::open_in_memory(None).unwrap();
        Orchestrator::new(queue, store, presets_two_sites(), &settings).without_pause()
    }

    #[tokio::test]
    async fn page_budget_admits_exactly_one_of_two() {
        let queue = Arc::new(MockQueue::default());
        let mut settings = test_settings();
        settings.budget_max_pages = 1;
        settings.budget_max_tasks = 2;
        let orch = orchestrator(queue.clone(), settings);

        let stats = orch.run_presets(false).await.unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(queue.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn baseline_pass_covers_every_category() {
        let queue = Arc::new(MockQueue::default());
        let orch = orchestrator(queue.clone(), test_settings());
        let stats = orch.run_presets(true).await.unwrap();
        // One category, two sites, default geoid only.
        assert_eq!(stats.published, 2);
        let published = queue.published.lock();
        assert!(published.iter().all(|t| t.notify));
        assert!(published.iter().all(|t| t.geoid.as_deref() == Some("213")));
        assert!(published.iter().all(|t| t.category.as_deref() == Some("phones")));
    }

    #[tokio::test]
    async fn user_geoids_fan_out_additional_pairs() {
        let queue = Arc::new(MockQueue::default());
        let settings = test_settings();
        let store = Store::open_in_memory(None).unwrap();
        store
            .upsert_user(&User {
                id: 0,
                chat_id: 1,
                geoid: "2".into(),
                min_discount: 25,
                min_score: 70,
                categories: Some(vec!["phones".into()]),
                score_weights: None,
                schedule_cron: None,
            })
            .await
            .unwrap();
        let orch = Orchestrator::new(queue.clone(), store, presets_two_sites(), &settings)
            .without_pause();
        let stats = orch.run_presets(false).await.unwrap();
        // (phones, 2) from the user plus (phones, 213) baseline, two sites each.
        assert_eq!(stats.published, 4);
    }

    #[tokio::test]
    async fn quiet_hours_skip_everything() {
        let queue = Arc::new(MockQueue::default());
        let mut settings = test_settings();
        // A window that always contains "now".
        settings.quiet_hours = Some((0, 23));
        if Utc::now().hour() >= 23 {
            settings.quiet_hours = Some((23, 22));
        }
        let orch = orchestrator(queue.clone(), settings);
        let stats = orch.run_presets(false).await.unwrap();
        assert_eq!(stats.published, 0);
        assert!(stats.skipped >= 2);
    }

    #[test]
    fn quiet_window_spans_midnight() {
        let queue = Arc::new(MockQueue::default());
        let mut settings = test_settings();
        settings.quiet_hours = Some((23, 6));
        let orch = orchestrator(queue, settings);
        assert!(orch.in_quiet_hours(23));
        assert!(orch.in_quiet_hours(2));
        assert!(!orch.in_quiet_hours(6));
        assert!(!orch.in_quiet_hours(12));
    }

    #[test]
    fn five_field_crontabs_match_at_minute_resolution() {
        let at_nine = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 30).unwrap();
        assert_eq!(cron_matches("0 9,19 * * *", at_nine), Some(true));
        assert_eq!(cron_matches("0 10 * * *", at_nine), Some(false));
        assert_eq!(cron_matches("not a cron", at_nine), None);
    }
}
