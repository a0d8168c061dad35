use crate::ScheduleError;
use blockcore::{BlockConfig, BlockId, Workflow, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

pub type ScheduleId = Uuid;

/// Consecutive failed runs after which a schedule is disabled
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    #[default]
    Active,
    Disabled,
}

/// A workflow trigger firing at `next_run_at`, repeating when it has a cron expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub schedule_id: ScheduleId,
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub block_id: Option<BlockId>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub last_ran_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub status: ScheduleStatus,
}

impl ScheduleEntry {
    /// One-shot entry firing at `next_run_at`
    pub fn once(workflow_id: WorkflowId, next_run_at: DateTime<Utc>) -> Self {
        Self {
            schedule_id: Uuid::new_v4(),
            workflow_id,
            block_id: None,
            cron_expression: None,
            next_run_at,
            last_ran_at: None,
            failed_count: 0,
            status: ScheduleStatus::Active,
        }
    }

    /// Repeating entry whose first run is the next fire after `now`
    pub fn cron(workflow_id: WorkflowId, expression: impl Into<String>, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let next_run_at = next_fire_after(&expression, now)?;
        Ok(Self {
            cron_expression: Some(expression),
            ..Self::once(workflow_id, next_run_at)
        })
    }

    pub fn with_block(mut self, block_id: impl Into<BlockId>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }

    /// Due means active and `next_run_at <= now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status != ScheduleStatus::Disabled && self.next_run_at <= now
    }

    pub fn is_disabled(&self) -> bool {
        self.status == ScheduleStatus::Disabled
    }
}

/// Parse a cron expression; 5-field (minute-first) forms get a seconds field of `0`
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// First fire time strictly after `after`
pub fn next_fire_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    parse_cron(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: "never fires again".to_string(),
        })
}

/// Entries for every enabled trigger block of `workflow` that carries a schedule
pub fn entries_for_workflow(workflow: &Workflow, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, ScheduleError> {
    workflow
        .blocks
        .iter()
        .filter(|block| block.enabled)
        .filter_map(|block| match &block.config {
            BlockConfig::Trigger(trigger) => trigger.schedule.as_ref().map(|s| (block, s)),
            _ => None,
        })
        .map(|(block, schedule)| {
            ScheduleEntry::cron(workflow.id, schedule.as_str(), now).map(|entry| entry.with_block(block.id.clone()))
        })
        .collect()
}

/// Message handed to a queue or worker when a schedule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPayload {
    pub schedule_id: ScheduleId,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ran_at: Option<DateTime<Utc>>,
    pub failed_count: u32,
    pub now: DateTime<Utc>,
}

impl TriggerPayload {
    pub fn new(entry: &ScheduleEntry, now: DateTime<Utc>) -> Self {
        Self {
            schedule_id: entry.schedule_id,
            workflow_id: entry.workflow_id,
            block_id: entry.block_id.clone(),
            cron_expression: entry.cron_expression.clone(),
            last_ran_at: entry.last_ran_at,
            failed_count: entry.failed_count,
            now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    #[test]
    fn due_boundary_is_inclusive() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut entry = ScheduleEntry::once(Uuid::new_v4(), now);
        assert!(entry.is_due(now));

        entry.next_run_at = now + Duration::milliseconds(1);
        assert!(!entry.is_due(now));

        entry.next_run_at = now;
        entry.status = ScheduleStatus::Disabled;
        assert!(!entry.is_due(now));
    }

    #[test]
    fn five_field_cron_gets_seconds() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 7, 30).unwrap();
        let next = next_fire_after("*/15 * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 12, 15, 0).unwrap());

        let next = next_fire_after("30 0 * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 13, 0, 30).unwrap());

        assert!(matches!(parse_cron("every tuesday"), Err(ScheduleError::InvalidCron { .. })));
    }

    #[test]
    fn payload_is_camel_case_rfc3339() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let entry = ScheduleEntry::once(Uuid::nil(), now).with_block("start");
        let payload = serde_json::to_value(TriggerPayload::new(&entry, now)).unwrap();

        assert_eq!(payload["workflowId"], json!(Uuid::nil()));
        assert_eq!(payload["blockId"], json!("start"));
        assert_eq!(payload["failedCount"], json!(0));
        assert_eq!(payload["now"], json!("2025-03-01T12:00:00Z"));
        assert!(payload.get("lastRanAt").is_none());
    }
}
