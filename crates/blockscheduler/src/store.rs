use crate::{ScheduleEntry, ScheduleError, ScheduleId, ScheduleStatus, MAX_CONSECUTIVE_FAILURES};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence for schedule rows; every mutation of one row is atomic
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Active entries with `next_run_at <= now`
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, ScheduleError>;

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleEntry>, ScheduleError>;

    async fn list(&self) -> Result<Vec<ScheduleEntry>, ScheduleError>;

    async fn upsert(&self, entry: ScheduleEntry) -> Result<(), ScheduleError>;

    /// Set `last_ran_at = ran_at`; move to `next_run_at`, or disable when `None`
    async fn mark_dispatched(
        &self,
        id: ScheduleId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<ScheduleEntry, ScheduleError>;

    /// Reset the failure streak on success, extend it on failure, and disable
    /// after `MAX_CONSECUTIVE_FAILURES`
    async fn record_outcome(&self, id: ScheduleId, success: bool) -> Result<ScheduleEntry, ScheduleError>;
}

/// Single-lock in-memory store
#[derive(Default)]
pub struct InMemoryScheduleStore {
    entries: RwLock<HashMap<ScheduleId, ScheduleEntry>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = ScheduleEntry>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(|e| (e.schedule_id, e)).collect()),
        }
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let mut due: Vec<ScheduleEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_run_at);
        Ok(due)
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleEntry>, ScheduleError> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let mut entries: Vec<ScheduleEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.next_run_at);
        Ok(entries)
    }

    async fn upsert(&self, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        self.entries.write().await.insert(entry.schedule_id, entry);
        Ok(())
    }

    async fn mark_dispatched(
        &self,
        id: ScheduleId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<ScheduleEntry, ScheduleError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(ScheduleError::NotFound(id))?;
        entry.last_ran_at = Some(ran_at);
        match next_run_at {
            Some(next) => entry.next_run_at = next,
            None => entry.status = ScheduleStatus::Disabled,
        }
        Ok(entry.clone())
    }

    async fn record_outcome(&self, id: ScheduleId, success: bool) -> Result<ScheduleEntry, ScheduleError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(ScheduleError::NotFound(id))?;
        if success {
            entry.failed_count = 0;
        } else {
            entry.failed_count += 1;
            if entry.failed_count >= MAX_CONSECUTIVE_FAILURES {
                entry.status = ScheduleStatus::Disabled;
            }
        }
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn tenth_failure_disables() {
        let now = Utc::now();
        let entry = ScheduleEntry::once(Uuid::new_v4(), now);
        let id = entry.schedule_id;
        let store = InMemoryScheduleStore::with_entries([entry]);

        for _ in 0..9 {
            store.record_outcome(id, false).await.unwrap();
        }
        assert_eq!(store.record_outcome(id, true).await.unwrap().failed_count, 0);

        for _ in 0..9 {
            assert!(!store.record_outcome(id, false).await.unwrap().is_disabled());
        }
        let entry = store.record_outcome(id, false).await.unwrap();
        assert_eq!(entry.failed_count, 10);
        assert!(entry.is_disabled());
        assert!(store.due(now + Duration::hours(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_schedule_is_not_found() {
        let store = InMemoryScheduleStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.record_outcome(id, true).await, Err(ScheduleError::NotFound(id)));
    }
}
