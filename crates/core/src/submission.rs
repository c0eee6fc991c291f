//! Job submission payload and its validation.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use crate::job::NewJob;

/// Payload accepted by `enqueue`: `{id?, command, max_retries?, priority?, run_at?}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobSubmission {
    pub id: Option<String>,
    pub command: Option<String>,
    pub max_retries: Option<u32>,
    pub priority: Option<i64>,
    /// RFC 3339 timestamp.
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSubmission {
    /// Parse a JSON payload. Malformed JSON or ill-typed fields are validation errors.
    pub fn from_json(raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw).map_err(|e| QueueError::validation(format!("invalid job payload: {e}")))
    }

    /// Validate and fill defaults. `default_max_retries` comes from the config
    /// store at enqueue time and is fixed on the job from then on.
    pub fn validate(self, default_max_retries: u32) -> QueueResult<NewJob> {
        let command = match self.command {
            Some(c) if !c.trim().is_empty() => c,
            Some(_) => return Err(QueueError::validation("command must not be empty")),
            None => return Err(QueueError::validation("missing required field: command")),
        };

        let id = match self.id {
            Some(raw) => JobId::parse(raw)?,
            None => JobId::generate(),
        };

        Ok(NewJob {
            id,
            command,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            priority: self.priority.unwrap_or(0),
            run_at: self.run_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_payload_gets_defaults() {
        let job = JobSubmission::from_json(r#"{"command": "echo hi"}"#)
            .unwrap()
            .validate(3)
            .unwrap();
        assert_eq!(job.command, "echo hi");
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.priority, 0);
        assert!(job.run_at.is_none());
        assert!(!job.id.as_str().is_empty());
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let job = JobSubmission::from_json(
            r#"{"id": "job1", "command": "sleep 1", "max_retries": 5, "priority": 9, "run_at": "2030-01-01T00:00:00Z"}"#,
        )
        .unwrap()
        .validate(3)
        .unwrap();
        assert_eq!(job.id.as_str(), "job1");
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.priority, 9);
        assert_eq!(job.run_at.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = JobSubmission::from_json(r#"{"id": "x"}"#)
            .unwrap()
            .validate(3)
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let blank = JobSubmission {
            command: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(blank.validate(3), Err(QueueError::Validation(_))));
    }

    #[test]
    fn ill_typed_payload_is_rejected() {
        assert!(matches!(
            JobSubmission::from_json(r#"{"command": "true", "max_retries": -1}"#),
            Err(QueueError::Validation(_))
        ));
        assert!(matches!(
            JobSubmission::from_json("not json"),
            Err(QueueError::Validation(_))
        ));
    }
}
