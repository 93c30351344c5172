use crate::item::{QueueItem, QueueName, QueueStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time statistics for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub queue_name: QueueName,
    pub pending_items: usize,
    pub processing_items: usize,
    /// Items archived after dead-lettering.
    pub failed_items: usize,
    pub completed_items: usize,
    pub cancelled_items: usize,
    pub dead_letter_items: usize,
    /// completed / (completed + failed) as a percentage; 100 with no history.
    pub success_rate: f64,
    /// Mean of `processed_at - scheduled_at` over items currently processing
    /// or completed.
    pub avg_wait_time_seconds: f64,
    pub oldest_pending_item: Option<DateTime<Utc>>,
}

impl QueueHealth {
    /// Aggregate health from a queue's items and its dead-letter count.
    pub fn from_items<'a>(
        queue_name: QueueName,
        items: impl IntoIterator<Item = &'a QueueItem>,
        dead_letter_items: usize,
    ) -> Self {
        let mut health = Self {
            queue_name,
            pending_items: 0,
            processing_items: 0,
            failed_items: 0,
            completed_items: 0,
            cancelled_items: 0,
            dead_letter_items,
            success_rate: 100.0,
            avg_wait_time_seconds: 0.0,
            oldest_pending_item: None,
        };
        let mut waited_ms: i64 = 0;
        let mut waited_count: i64 = 0;

        for item in items {
            match item.status {
                QueueStatus::Pending => {
                    health.pending_items += 1;
                    health.oldest_pending_item = Some(match health.oldest_pending_item {
                        Some(oldest) => oldest.min(item.created_at),
                        None => item.created_at,
                    });
                }
                QueueStatus::Processing => health.processing_items += 1,
                QueueStatus::Completed => health.completed_items += 1,
                QueueStatus::Failed => health.failed_items += 1,
                QueueStatus::Cancelled => health.cancelled_items += 1,
            }
            if let Some(processed_at) = item.processed_at {
                waited_ms += (processed_at - item.scheduled_at).num_milliseconds().max(0);
                waited_count += 1;
            }
        }

        let finished = health.completed_items + health.failed_items;
        if finished > 0 {
            health.success_rate = health.completed_items as f64 * 100.0 / finished as f64;
        }
        if waited_count > 0 {
            health.avg_wait_time_seconds = waited_ms as f64 / waited_count as f64 / 1_000.0;
        }
        health
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::item::EnqueueOptions;
    use chrono::Duration;
    use serde_json::json;

    fn item(now: DateTime<Utc>) -> QueueItem {
        QueueItem::new(
            QueueName::Search,
            json!({}),
            EnqueueOptions::default(),
            3,
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_queue() {
        let health = QueueHealth::from_items(QueueName::Search, [], 0);
        assert_eq!(health.pending_items, 0);
        assert_eq!(health.success_rate, 100.0);
        assert!(health.oldest_pending_item.is_none());
    }

    #[test]
    fn test_counts_and_wait_time() {
        let t0 = Utc::now();
        let old = item(t0 - Duration::minutes(5));
        let young = item(t0);

        let mut done = item(t0);
        done.claim("p", t0 + Duration::seconds(4), Duration::seconds(30));
        done.mark_completed(json!(null), t0 + Duration::seconds(5))
            .unwrap();

        let mut running = item(t0);
        running.claim("p", t0 + Duration::seconds(2), Duration::seconds(30));

        let mut dead = item(t0);
        dead.status = QueueStatus::Failed;

        let items = [old.clone(), young, done, running, dead];
        let health = QueueHealth::from_items(QueueName::Search, items.iter(), 1);
        assert_eq!(health.pending_items, 2);
        assert_eq!(health.processing_items, 1);
        assert_eq!(health.completed_items, 1);
        assert_eq!(health.failed_items, 1);
        assert_eq!(health.dead_letter_items, 1);
        assert_eq!(health.success_rate, 50.0);
        assert!((health.avg_wait_time_seconds - 3.0).abs() < 1e-9);
        assert_eq!(health.oldest_pending_item, Some(old.created_at));
    }
}
