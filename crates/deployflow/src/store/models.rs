use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(DeploymentStatus {
    Queued => "queued",
    Building => "building",
    Pushing => "pushing",
    Deploying => "deploying",
    Success => "success",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transition table.
    ///
    /// `queued -> deploying` covers rollbacks and redeploys of an image that
    /// is already built; `pushing -> success` ends a standalone build.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (*self, next),
            (Queued, Building)
                | (Building, Pushing)
                | (Pushing, Deploying)
                | (Pushing, Success)
                | (Queued, Deploying)
                | (Deploying, Success)
                | (Queued | Building | Pushing | Deploying, Failed)
                | (Queued | Building | Pushing, Cancelled)
        )
    }
}

text_enum!(TriggeredBy {
    Manual => "manual",
    Webhook => "webhook",
    Rollback => "rollback",
    PendingChanges => "pending_changes",
});

text_enum!(ServiceStatus {
    Created => "created",
    Building => "building",
    Deploying => "deploying",
    Running => "running",
    Failed => "failed",
    Stopped => "stopped",
});

text_enum!(ResourceStatus {
    Pending => "pending",
    Provisioning => "provisioning",
    Available => "available",
    Active => "active",
    Attached => "attached",
    Error => "error",
    Deleted => "deleted",
});

text_enum!(DatabaseEngine {
    Postgres => "postgres",
    Mysql => "mysql",
    Redis => "redis",
    Mongodb => "mongodb",
});

impl DatabaseEngine {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
            Self::Redis => 6379,
            Self::Mongodb => 27017,
        }
    }

    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Postgres => "postgresql",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
            Self::Mongodb => "mongodb",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: Uuid,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub branch: Option<String>,
    pub status: DeploymentStatus,
    pub image_tag: Option<String>,
    pub build_duration_ms: Option<i64>,
    pub deploy_duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub triggered_by: TriggeredBy,
    pub rollback_of: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub service_id: Uuid,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub branch: Option<String>,
    pub triggered_by: TriggeredBy,
    /// Preset only for rollbacks, which reuse an existing image.
    pub image_tag: Option<String>,
    pub rollback_of: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub namespace: String,
    pub port: i32,
    pub replicas: i32,
    pub build_context: String,
    pub dockerfile_path: Option<String>,
    pub current_image_tag: Option<String>,
    pub generated_url: Option<String>,
    pub status: ServiceStatus,
    pub compute_instance_id: Option<String>,
    pub security_policy_id: Option<String>,
    pub dns_record_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitSource {
    pub service_id: Uuid,
    pub connection_id: Uuid,
    pub repo_url: String,
    pub branch: String,
    pub root_dir: Option<String>,
    pub webhook_id: Option<String>,
}

#[derive(Clone)]
pub struct GitConnection {
    pub id: Uuid,
    pub provider: String,
    pub access_token: String,
}

impl fmt::Debug for GitConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitConnection")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Database {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub engine: DatabaseEngine,
    pub version: String,
    pub size_gb: i32,
    pub region: String,
    pub status: ResourceStatus,
    pub instance_id: Option<String>,
    pub security_policy_id: Option<String>,
    pub storage_volume_id: Option<String>,
    /// Our `volumes` row for the storage volume.
    pub volume_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub dns_record_id: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database_name: Option<String>,
    #[serde(skip_serializing)]
    pub connection_string: Option<String>,
    pub error_message: Option<String>,
}

/// Provider identifiers gathered while provisioning a database. `None` fields
/// leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseInfra {
    pub instance_id: Option<String>,
    pub security_policy_id: Option<String>,
    pub storage_volume_id: Option<String>,
    pub volume_id: Option<Uuid>,
    pub dns_record_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConnection {
    pub hostname: String,
    pub dns_record_id: Option<String>,
    pub username: String,
    pub password: String,
    pub database_name: String,
    pub connection_string: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Volume {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub size_gb: i32,
    pub region: String,
    pub status: ResourceStatus,
    pub provider_volume_id: Option<String>,
    pub service_id: Option<Uuid>,
    pub database_id: Option<Uuid>,
    pub mount_path: Option<String>,
    pub error_message: Option<String>,
}

/// A volume row for storage the platform allocates on its own behalf.
#[derive(Debug, Clone)]
pub struct NewVolume {
    pub project_id: Uuid,
    pub name: String,
    pub size_gb: i32,
    pub region: String,
    pub status: ResourceStatus,
    pub provider_volume_id: Option<String>,
}

/// Exclusive volume attachment target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOwner {
    Service(Uuid),
    Database(Uuid),
}

impl Volume {
    pub fn owner(&self) -> Option<VolumeOwner> {
        match (self.service_id, self.database_id) {
            (Some(id), _) => Some(VolumeOwner::Service(id)),
            (None, Some(id)) => Some(VolumeOwner::Database(id)),
            (None, None) => None,
        }
    }
}
