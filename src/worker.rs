//! Shard worker: consumes preset tasks, runs the pipeline and hands admitted
//! deals to the notifier.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::models::{DealItem, ScoreWeightOverrides, TaskPayload, User};
use crate::notifier::{Notifier, DEFAULT_CHUNK_SIZE};
use crate::processing::{Pipeline, ScoreContext};
use crate::queue::{RedisQueue, Shard};
use crate::storage::Store;

/// How many top-scored deals one task may push to the chat.
const NOTIFY_TOP_N: usize = 20;

/// Effective per-task parameters after the optional user-profile overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProfile {
    pub geoid: Option<String>,
    pub min_discount: i64,
    pub min_score: i64,
    pub weights: Option<ScoreWeightOverrides>,
}

/// Overlays a user profile onto the task's own parameters: the task keeps its
/// geoid when it has one, user thresholds win when set, user weights win.
pub fn overlay_profile(task: &TaskPayload, user: Option<&User>) -> TaskProfile {
    let mut profile = TaskProfile {
        geoid: task.geoid.clone(),
        min_discount: task.min_discount,
        min_score: task.min_score,
        weights: task.weights,
    };
    if let Some(user) = user {
        if profile.geoid.is_none() {
            profile.geoid = Some(user.geoid.clone());
        }
        if user.min_discount > 0 {
            profile.min_discount = user.min_discount;
        }
        if user.min_score > 0 {
            profile.min_score = user.min_score;
        }
        if user.score_weights.is_some() {
            profile.weights = user.score_weights;
        }
    }
    profile
}

pub struct Worker {
    queue: RedisQueue,
    pipeline: Arc<Pipeline>,
    store: Store,
    notifier: Option<Arc<Notifier>>,
    fixed_chat_id: Option<i64>,
    shard: Shard,
    consumer_name: String,
}

impl Worker {
    pub fn new(
        queue: RedisQueue,
        pipeline: Arc<Pipeline>,
        store: Store,
        notifier: Option<Arc<Notifier>>,
        fixed_chat_id: Option<i64>,
        shard: Shard,
        consumer_name: String,
    ) -> Self {
        Self {
            queue,
            pipeline,
            store,
            notifier,
            fixed_chat_id,
            shard,
            consumer_name,
        }
    }

    /// Blocks forever consuming the pinned shard.
    pub async fn run(&self) -> Result<()> {
        info!(
            shard = ?self.shard,
            pinned = self.shard.is_pinned(),
            consumer = %self.consumer_name,
            "worker starting"
        );
        self.queue
            .consume(&self.shard, &self.consumer_name, |task| self.handle(task))
            .await
    }

    async fn handle(&self, task: TaskPayload) -> Result<(), TaskError> {
        let user = match task.chat_id {
            Some(chat_id) => self
                .store
                .user_by_chat(chat_id)
                .await
                .map_err(TaskError::Other)?,
            None => None,
        };
        let profile = overlay_profile(&task, user.as_ref());
        let ctx = ScoreContext::new(
            profile.min_discount,
            profile.min_score,
            profile.weights.as_ref(),
        );

        let results = self
            .pipeline
            .process_preset(
                task.site,
                &task.url,
                profile.geoid.as_deref(),
                task.category.as_deref(),
                &ctx,
            )
            .await?;

        if task.notify && !results.is_empty() {
            if let (Some(notifier), Some(chat_id)) = (&self.notifier, self.fixed_chat_id) {
                let top: Vec<DealItem> = results.into_iter().take(NOTIFY_TOP_N).collect();
                notifier
                    .send_batch(chat_id, &top, DEFAULT_CHUNK_SIZE)
                    .await
                    .map_err(TaskError::Other)?;
            } else {
                debug!("notify requested but no notifier/chat configured");
            }
        }
        Ok(())
    }
}
