//! chronai-types: task and execution-log data model.
//!
//! Shared by the store, scheduler, and gateway. Validation lives here so
//! every entry point (REST create, REST update) enforces the same rules
//! before a task ever reaches the store or the scheduler.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_ENDPOINT_LEN: usize = 500;
pub const MAX_API_KEY_LEN: usize = 500;
pub const MAX_MODEL_LEN: usize = 100;

static FIXED_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").expect("valid regex"));

/// Validation failures for task drafts and patched tasks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be at most {1} characters")]
    TooLong(&'static str, usize),
    #[error("interval schedules need interval_minutes and/or interval_seconds")]
    MissingInterval,
    #[error("interval must be longer than zero seconds")]
    ZeroInterval,
    #[error("fixed_time schedules need a fixed_time")]
    MissingFixedTime,
    #[error("fixed_time must be HH:MM (00:00-23:59)")]
    BadFixedTime,
}

// ──────────────────── Schedule ────────────────────

/// How a task's trigger fires: every N seconds, or once daily at HH:MM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    FixedTime,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Interval => "interval",
            ScheduleType::FixedTime => "fixed_time",
        }
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(ScheduleType::Interval),
            "fixed_time" => Ok(ScheduleType::FixedTime),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// Validate that exactly the schedule group matching the discriminator is
/// populated and well-formed.
pub fn validate_schedule(
    schedule_type: ScheduleType,
    interval_minutes: Option<u32>,
    interval_seconds: Option<u32>,
    fixed_time: Option<&str>,
) -> Result<(), ValidationError> {
    match schedule_type {
        ScheduleType::Interval => {
            if interval_minutes.is_none() && interval_seconds.is_none() {
                return Err(ValidationError::MissingInterval);
            }
            let total =
                u64::from(interval_minutes.unwrap_or(0)) * 60 + u64::from(interval_seconds.unwrap_or(0));
            if total == 0 {
                return Err(ValidationError::ZeroInterval);
            }
        }
        ScheduleType::FixedTime => {
            let Some(time) = fixed_time else {
                return Err(ValidationError::MissingFixedTime);
            };
            if !FIXED_TIME_RE.is_match(time) {
                return Err(ValidationError::BadFixedTime);
            }
        }
    }
    Ok(())
}

fn validate_len(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong(field, max));
    }
    Ok(())
}

// ──────────────────── Task ────────────────────

/// A scheduled task definition as persisted in the store.
///
/// `api_key` always holds ciphertext; only the execution runner decrypts it,
/// and only a masked form ever appears in logs or API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub api_endpoint: String,
    pub api_key: String,
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_time: Option<String>,
    pub message_content: String,
    pub model: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Total interval length in seconds, when this is an interval task.
    pub fn interval_period_secs(&self) -> Option<u64> {
        match self.schedule_type {
            ScheduleType::Interval => Some(
                u64::from(self.interval_minutes.unwrap_or(0)) * 60
                    + u64::from(self.interval_seconds.unwrap_or(0)),
            ),
            ScheduleType::FixedTime => None,
        }
    }

    /// Parsed (hour, minute), when this is a fixed-time task.
    pub fn fixed_time_parts(&self) -> Option<(u32, u32)> {
        match self.schedule_type {
            ScheduleType::FixedTime => {
                let time = self.fixed_time.as_deref()?;
                let (h, m) = time.split_once(':')?;
                Some((h.parse().ok()?, m.parse().ok()?))
            }
            ScheduleType::Interval => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_len("name", &self.name, MAX_NAME_LEN)?;
        validate_len("api_endpoint", &self.api_endpoint, MAX_ENDPOINT_LEN)?;
        validate_len("model", &self.model, MAX_MODEL_LEN)?;
        if self.message_content.is_empty() {
            return Err(ValidationError::Empty("message_content"));
        }
        validate_schedule(
            self.schedule_type,
            self.interval_minutes,
            self.interval_seconds,
            self.fixed_time.as_deref(),
        )
    }
}

/// Create payload for a task. `api_key` is plain text here; the gateway
/// encrypts it before anything is persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    pub api_endpoint: String,
    pub api_key: String,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub interval_seconds: Option<u32>,
    #[serde(default)]
    pub fixed_time: Option<String>,
    pub message_content: String,
    pub model: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl TaskDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_len("name", &self.name, MAX_NAME_LEN)?;
        validate_len("api_endpoint", &self.api_endpoint, MAX_ENDPOINT_LEN)?;
        validate_len("api_key", &self.api_key, MAX_API_KEY_LEN)?;
        validate_len("model", &self.model, MAX_MODEL_LEN)?;
        if self.message_content.is_empty() {
            return Err(ValidationError::Empty("message_content"));
        }
        validate_schedule(
            self.schedule_type,
            self.interval_minutes,
            self.interval_seconds,
            self.fixed_time.as_deref(),
        )
    }

    /// Convert into an insertable row, swapping the plain credential for
    /// its ciphertext.
    pub fn into_new_task(self, encrypted_api_key: String) -> NewTask {
        NewTask {
            name: self.name,
            api_endpoint: self.api_endpoint,
            api_key: encrypted_api_key,
            schedule_type: self.schedule_type,
            interval_minutes: self.interval_minutes,
            interval_seconds: self.interval_seconds,
            fixed_time: self.fixed_time,
            message_content: self.message_content,
            model: self.model,
            enabled: self.enabled,
        }
    }
}

/// Insertable task row (credential already encrypted).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub api_endpoint: String,
    pub api_key: String,
    pub schedule_type: ScheduleType,
    pub interval_minutes: Option<u32>,
    pub interval_seconds: Option<u32>,
    pub fixed_time: Option<String>,
    pub message_content: String,
    pub model: String,
    pub enabled: bool,
}

// ──────────────────── Partial update ────────────────────

/// Deserializes `null` as `Some(None)` while a missing field stays `None`,
/// so patches can tell "clear this field" apart from "leave it alone".
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

/// Update intent for a task: every field optional, nullable fields carry
/// the provided-null vs omitted distinction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    /// Replacement credential. Plain text on the wire; callers must swap in
    /// the ciphertext before `apply`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default, deserialize_with = "double_option")]
    pub interval_minutes: Option<Option<u32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub interval_seconds: Option<Option<u32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub fixed_time: Option<Option<String>>,
    #[serde(default)]
    pub message_content: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl TaskPatch {
    /// Merge the provided fields onto `task`, then re-null whichever
    /// schedule group no longer matches the discriminator and refresh
    /// `updated_at`. Callers re-validate the merged task before persisting.
    pub fn apply(&self, task: &mut Task) {
        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(endpoint) = &self.api_endpoint {
            task.api_endpoint = endpoint.clone();
        }
        if let Some(key) = &self.api_key {
            task.api_key = key.clone();
        }
        if let Some(schedule_type) = self.schedule_type {
            task.schedule_type = schedule_type;
        }
        if let Some(minutes) = self.interval_minutes {
            task.interval_minutes = minutes;
        }
        if let Some(seconds) = self.interval_seconds {
            task.interval_seconds = seconds;
        }
        if let Some(time) = &self.fixed_time {
            task.fixed_time = time.clone();
        }
        if let Some(message) = &self.message_content {
            task.message_content = message.clone();
        }
        if let Some(model) = &self.model {
            task.model = model.clone();
        }
        if let Some(enabled) = self.enabled {
            task.enabled = enabled;
        }

        match task.schedule_type {
            ScheduleType::Interval => task.fixed_time = None,
            ScheduleType::FixedTime => {
                task.interval_minutes = None;
                task.interval_seconds = None;
            }
        }
        task.updated_at = Utc::now();
    }
}

// ──────────────────── Execution log ────────────────────

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One persisted outcome record. Immutable after insert; deleted only when
/// the owning task is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub task_id: i64,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Insertable outcome record. The constructors keep the content fields
/// mutually exclusive.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub task_id: i64,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub response_summary: Option<String>,
    pub error_message: Option<String>,
}

impl NewExecutionLog {
    pub fn success(task_id: i64, executed_at: DateTime<Utc>, summary: String) -> Self {
        Self {
            task_id,
            executed_at,
            status: ExecutionStatus::Success,
            response_summary: Some(summary),
            error_message: None,
        }
    }

    pub fn failed(task_id: i64, executed_at: DateTime<Utc>, error: String) -> Self {
        Self {
            task_id,
            executed_at,
            status: ExecutionStatus::Failed,
            response_summary: None,
            error_message: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval_task() -> Task {
        Task {
            id: 1,
            name: "morning briefing".into(),
            api_endpoint: "https://api.openai.com/v1/chat/completions".into(),
            api_key: "ciphertext".into(),
            schedule_type: ScheduleType::Interval,
            interval_minutes: Some(60),
            interval_seconds: None,
            fixed_time: None,
            message_content: "Summarize the news".into(),
            model: "gpt-3.5-turbo".into(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_schedule_type_serde() {
        assert_eq!(
            serde_json::to_string(&ScheduleType::FixedTime).unwrap(),
            "\"fixed_time\""
        );
        let parsed: ScheduleType = serde_json::from_str("\"interval\"").unwrap();
        assert_eq!(parsed, ScheduleType::Interval);
    }

    #[test]
    fn test_validate_schedule_interval() {
        assert!(validate_schedule(ScheduleType::Interval, Some(1), None, None).is_ok());
        assert!(validate_schedule(ScheduleType::Interval, None, Some(30), None).is_ok());
        assert_eq!(
            validate_schedule(ScheduleType::Interval, None, None, None),
            Err(ValidationError::MissingInterval)
        );
        assert_eq!(
            validate_schedule(ScheduleType::Interval, Some(0), Some(0), None),
            Err(ValidationError::ZeroInterval)
        );
    }

    #[test]
    fn test_validate_schedule_fixed_time() {
        assert!(validate_schedule(ScheduleType::FixedTime, None, None, Some("14:30")).is_ok());
        assert!(validate_schedule(ScheduleType::FixedTime, None, None, Some("00:00")).is_ok());
        assert!(validate_schedule(ScheduleType::FixedTime, None, None, Some("23:59")).is_ok());
        assert_eq!(
            validate_schedule(ScheduleType::FixedTime, None, None, None),
            Err(ValidationError::MissingFixedTime)
        );
        for bad in ["24:00", "7:30", "12:60", "noon", "12:3"] {
            assert_eq!(
                validate_schedule(ScheduleType::FixedTime, None, None, Some(bad)),
                Err(ValidationError::BadFixedTime),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_draft_validation() {
        let json = r#"{
            "name": "ping",
            "api_endpoint": "https://example.com/v1/chat/completions",
            "api_key": "sk-test",
            "schedule_type": "interval",
            "interval_seconds": 30,
            "message_content": "hello",
            "model": "gpt-4"
        }"#;
        let draft: TaskDraft = serde_json::from_str(json).unwrap();
        assert!(draft.enabled, "enabled defaults to true");
        assert!(draft.validate().is_ok());

        let mut empty_name = draft.clone();
        empty_name.name.clear();
        assert_eq!(empty_name.validate(), Err(ValidationError::Empty("name")));

        let mut long_model = draft.clone();
        long_model.model = "m".repeat(MAX_MODEL_LEN + 1);
        assert_eq!(
            long_model.validate(),
            Err(ValidationError::TooLong("model", MAX_MODEL_LEN))
        );
    }

    #[test]
    fn test_interval_period_secs() {
        let mut task = interval_task();
        task.interval_minutes = Some(1);
        task.interval_seconds = Some(30);
        assert_eq!(task.interval_period_secs(), Some(90));

        task.schedule_type = ScheduleType::FixedTime;
        assert_eq!(task.interval_period_secs(), None);
    }

    #[test]
    fn test_fixed_time_parts() {
        let mut task = interval_task();
        task.schedule_type = ScheduleType::FixedTime;
        task.interval_minutes = None;
        task.fixed_time = Some("09:05".into());
        assert_eq!(task.fixed_time_parts(), Some((9, 5)));
    }

    #[test]
    fn test_patch_switch_to_fixed_time_nulls_interval() {
        let mut task = interval_task();
        let patch: TaskPatch = serde_json::from_str(
            r#"{"schedule_type": "fixed_time", "fixed_time": "14:00"}"#,
        )
        .unwrap();
        patch.apply(&mut task);
        assert_eq!(task.schedule_type, ScheduleType::FixedTime);
        assert_eq!(task.fixed_time.as_deref(), Some("14:00"));
        assert_eq!(task.interval_minutes, None);
        assert_eq!(task.interval_seconds, None);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_patch_switch_to_interval_nulls_fixed_time() {
        let mut task = interval_task();
        task.schedule_type = ScheduleType::FixedTime;
        task.interval_minutes = None;
        task.fixed_time = Some("08:00".into());

        let patch: TaskPatch = serde_json::from_str(
            r#"{"schedule_type": "interval", "interval_minutes": 15}"#,
        )
        .unwrap();
        patch.apply(&mut task);
        assert_eq!(task.schedule_type, ScheduleType::Interval);
        assert_eq!(task.interval_minutes, Some(15));
        assert_eq!(task.fixed_time, None);
    }

    #[test]
    fn test_patch_null_vs_omitted() {
        let omitted: TaskPatch = serde_json::from_str(r#"{"name": "renamed"}"#).unwrap();
        assert_eq!(omitted.interval_seconds, None, "omitted stays unset");

        let provided_null: TaskPatch =
            serde_json::from_str(r#"{"interval_seconds": null}"#).unwrap();
        assert_eq!(
            provided_null.interval_seconds,
            Some(None),
            "explicit null clears the field"
        );

        let mut task = interval_task();
        task.interval_seconds = Some(30);
        provided_null.apply(&mut task);
        assert_eq!(task.interval_seconds, None);
    }

    #[test]
    fn test_patch_does_not_touch_unrelated_fields() {
        let mut task = interval_task();
        let before_key = task.api_key.clone();
        let patch: TaskPatch = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        patch.apply(&mut task);
        assert!(!task.enabled);
        assert_eq!(task.api_key, before_key);
        assert_eq!(task.name, "morning briefing");
    }

    #[test]
    fn test_new_execution_log_constructors() {
        let now = Utc::now();
        let ok = NewExecutionLog::success(7, now, "done".into());
        assert_eq!(ok.status, ExecutionStatus::Success);
        assert!(ok.error_message.is_none());

        let failed = NewExecutionLog::failed(7, now, "boom".into());
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.response_summary.is_none());
    }
}
