//! Job lifecycle events for the notify path.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::{Job, JobId, JobState};

/// Emitted on every persisted state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobEvent {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            error: None,
            at: Utc::now(),
        }
    }

    /// Snapshot of a job's current state. Carries the last error only for
    /// Failed and DeadLettered.
    pub fn from_job(job: &Job) -> Self {
        let error = match job.state {
            JobState::Failed | JobState::DeadLettered => job.last_error.clone(),
            _ => None,
        };
        Self {
            job_id: job.id.clone(),
            state: job.state,
            error,
            at: job.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::job::{PayloadRef, Priority};
    use crate::operation::OperationSpec;

    #[test]
    fn test_event_from_job() {
        let mut job = Job::new(
            PayloadRef::new("uploads/a.wav"),
            OperationSpec::normalize(),
            None,
            Priority::Normal,
        );
        let queued = JobEvent::from_job(&job);
        assert_eq!(queued.state, JobState::Queued);
        assert!(queued.error.is_none());

        job.lease().unwrap();
        job.start_processing().unwrap();
        job.fail(JobError::new(ErrorKind::TransientIo, "reset")).unwrap();
        let failed = JobEvent::from_job(&job);
        assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::TransientIo);
        assert!(!failed.is_terminal());
    }

    #[test]
    fn test_event_json_shape() {
        let event = JobEvent::new(JobId::from_string("j1"), JobState::Succeeded);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["job_id"], "j1");
        assert_eq!(value["state"], "succeeded");
        assert!(value.get("error").is_none());
    }
}
