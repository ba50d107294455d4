//! Typed job payloads.
//!
//! The `jobs` table stores `job_type` and `payload_json` separately. A job is
//! decoded exactly once, at dispatch, into a [`JobPayload`]; every pipeline
//! receives typed fields and never looks keys up in a map.

use crate::jobs::model::{NewJob, DEFAULT_MAX_ATTEMPTS};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Build {
        deployment_id: Uuid,
    },
    Deploy {
        deployment_id: Uuid,
    },
    BuildAndDeploy {
        deployment_id: Uuid,
    },
    Rollback {
        deployment_id: Uuid,
        target_image_tag: String,
        rollback_to_deployment_id: Uuid,
    },
    CleanupService {
        service_id: Uuid,
    },
    CleanupProject {
        project_id: Uuid,
    },
    ProvisionDatabase {
        database_id: Uuid,
    },
    ProvisionVolume {
        volume_id: Uuid,
    },
    DeleteVolume {
        volume_id: Uuid,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown job type `{0}`")]
    UnknownType(String),
    #[error("invalid payload for `{job_type}`: {reason}")]
    Invalid { job_type: String, reason: String },
}

impl JobPayload {
    pub const JOB_TYPES: &'static [&'static str] = &[
        "build",
        "deploy",
        "build_and_deploy",
        "rollback",
        "cleanup_service",
        "cleanup_project",
        "provision_database",
        "provision_volume",
        "delete_volume",
    ];

    pub fn job_type(&self) -> &'static str {
        match self {
            JobPayload::Build { .. } => "build",
            JobPayload::Deploy { .. } => "deploy",
            JobPayload::BuildAndDeploy { .. } => "build_and_deploy",
            JobPayload::Rollback { .. } => "rollback",
            JobPayload::CleanupService { .. } => "cleanup_service",
            JobPayload::CleanupProject { .. } => "cleanup_project",
            JobPayload::ProvisionDatabase { .. } => "provision_database",
            JobPayload::ProvisionVolume { .. } => "provision_volume",
            JobPayload::DeleteVolume { .. } => "delete_volume",
        }
    }

    /// Rebuilds the payload from the two columns it is stored in.
    pub fn decode(job_type: &str, payload_json: &Value) -> Result<Self, DecodeError> {
        if !Self::JOB_TYPES.contains(&job_type) {
            return Err(DecodeError::UnknownType(job_type.to_string()));
        }

        let mut fields = match payload_json {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(DecodeError::Invalid {
                    job_type: job_type.to_string(),
                    reason: format!("expected an object, got {other}"),
                })
            }
        };
        fields.insert("type".to_string(), Value::String(job_type.to_string()));

        serde_json::from_value(Value::Object(fields)).map_err(|e| DecodeError::Invalid {
            job_type: job_type.to_string(),
            reason: e.to_string(),
        })
    }

    /// Payload body without the type tag, as stored in `payload_json`.
    pub fn body(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("type");
        }
        value
    }

    /// The deployment this job drives, if any. Used for log spans.
    pub fn deployment_id(&self) -> Option<Uuid> {
        match self {
            JobPayload::Build { deployment_id }
            | JobPayload::Deploy { deployment_id }
            | JobPayload::BuildAndDeploy { deployment_id }
            | JobPayload::Rollback { deployment_id, .. } => Some(*deployment_id),
            _ => None,
        }
    }

    pub fn into_new_job(self) -> NewJob {
        NewJob {
            job_type: self.job_type().to_string(),
            payload_json: self.body(),
            run_at: Utc::now(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_from_columns() {
        let id = Uuid::new_v4();
        let payload = JobPayload::decode("build", &json!({ "deployment_id": id })).unwrap();
        assert_eq!(payload, JobPayload::Build { deployment_id: id });
    }

    #[test]
    fn body_drops_the_tag_and_round_trips() {
        let payload = JobPayload::Rollback {
            deployment_id: Uuid::new_v4(),
            target_image_tag: "registry/api:api-abc".into(),
            rollback_to_deployment_id: Uuid::new_v4(),
        };
        let body = payload.body();
        assert!(body.get("type").is_none());
        assert_eq!(JobPayload::decode(payload.job_type(), &body).unwrap(), payload);
    }

    #[test]
    fn unknown_type_is_reported_separately_from_missing_keys() {
        assert_eq!(
            JobPayload::decode("send_email", &json!({})),
            Err(DecodeError::UnknownType("send_email".into()))
        );

        let err = JobPayload::decode("rollback", &json!({ "deployment_id": Uuid::new_v4() }))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Invalid { .. }));
    }

    #[test]
    fn job_type_list_matches_variants() {
        for job_type in JobPayload::JOB_TYPES {
            let err = JobPayload::decode(job_type, &json!({})).unwrap_err();
            assert!(matches!(err, DecodeError::Invalid { .. }), "{job_type}");
        }
    }
}
