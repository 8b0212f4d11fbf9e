//! Compute target records for remote execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ComputeTargetId = Uuid;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_REMOTE_WORK_DIR: &str = "~/autotune";

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_remote_work_dir() -> String {
    DEFAULT_REMOTE_WORK_DIR.to_string()
}

/// How the remote host authenticates us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum AuthMethod {
    Key {
        #[serde(default)]
        key_path: Option<String>,
    },
    Password { password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    #[default]
    Unknown,
    Connected,
    Failed,
    Provisioned,
}

/// A machine that can run training and evaluation on our behalf.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeTarget {
    pub id: ComputeTargetId,
    pub name: String,
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(flatten)]
    pub auth: AuthMethod,
    #[serde(default = "default_remote_work_dir")]
    pub remote_work_dir: String,
    #[serde(default)]
    pub status: TargetStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub last_tested_at: Option<DateTime<Utc>>,
}

impl ComputeTarget {
    pub fn new(
        name: impl Into<String>,
        ssh_host: impl Into<String>,
        ssh_user: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ssh_host: ssh_host.into(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_user: ssh_user.into(),
            auth,
            remote_work_dir: default_remote_work_dir(),
            status: TargetStatus::Unknown,
            status_message: None,
            last_tested_at: None,
        }
    }

    /// `user@host` destination as understood by ssh and scp.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.ssh_user, self.ssh_host)
    }

    pub fn record_test(&mut self, success: bool, message: impl Into<String>) {
        self.status = if success {
            TargetStatus::Connected
        } else {
            TargetStatus::Failed
        };
        self.status_message = Some(message.into());
        self.last_tested_at = Some(Utc::now());
    }
}

// Passwords stay out of logs.
impl std::fmt::Debug for ComputeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match &self.auth {
            AuthMethod::Key { .. } => "key",
            AuthMethod::Password { .. } => "password",
        };
        f.debug_struct("ComputeTarget")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("destination", &self.destination())
            .field("ssh_port", &self.ssh_port)
            .field("auth", &auth)
            .field("remote_work_dir", &self.remote_work_dir)
            .field("status", &self.status)
            .finish()
    }
}
