//! Playground session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Login user assumed when a machine does not flag one as default
pub const DEFAULT_SSH_USER: &str = "root";

/// Lifecycle state of a play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayState {
    Created,
    WarmingUp,
    WarmedUp,
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Failed,
}

impl PlayState {
    /// States a play never leaves
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlayState::Stopped | PlayState::Destroying | PlayState::Destroyed | PlayState::Failed
        )
    }
}

/// One entry of the append-only state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub state: PlayState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Status of a provisioning task.
///
/// The wire carries the numeric code; the ordering of codes is informative
/// only, an update may report any status regardless of the previous one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TaskStatus {
    #[default]
    None,
    Created,
    Blocked,
    Running,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn code(&self) -> i32 {
        match self {
            TaskStatus::None => 0,
            TaskStatus::Created => 10,
            TaskStatus::Blocked => 20,
            TaskStatus::Running => 30,
            TaskStatus::Failed => 35,
            TaskStatus::Completed => 40,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown task status code {0}")]
pub struct UnknownTaskStatus(pub i32);

impl TryFrom<i32> for TaskStatus {
    type Error = UnknownTaskStatus;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(TaskStatus::None),
            10 => Ok(TaskStatus::Created),
            20 => Ok(TaskStatus::Blocked),
            30 => Ok(TaskStatus::Running),
            35 => Ok(TaskStatus::Failed),
            40 => Ok(TaskStatus::Completed),
            other => Err(UnknownTaskStatus(other)),
        }
    }
}

impl From<TaskStatus> for i32 {
    fn from(status: TaskStatus) -> Self {
        status.code()
    }
}

/// A unit of provisioning or health work on a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayTask {
    pub name: String,
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub helper: bool,
    #[serde(default)]
    pub status: TaskStatus,
    /// Carried as received. Updates are applied without comparing versions.
    #[serde(default)]
    pub version: i64,
}

impl PlayTask {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineUser {
    pub name: String,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineResources {
    #[serde(default)]
    pub cpu_count: u32,
    #[serde(default)]
    pub ram_size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    #[serde(default)]
    pub users: Vec<MachineUser>,
    #[serde(default)]
    pub resources: MachineResources,
}

impl Machine {
    /// The user flagged as default, falling back to `root`
    pub fn default_user(&self) -> &str {
        self.users
            .iter()
            .find(|u| u.default)
            .map(|u| u.name.as_str())
            .unwrap_or(DEFAULT_SSH_USER)
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.users.iter().any(|u| u.name == name)
    }
}

/// Completed vs. total init tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitProgress {
    pub completed: usize,
    pub total: usize,
}

impl fmt::Display for InitProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.completed, self.total)
    }
}

/// A running playground session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Play {
    pub id: String,
    #[serde(default)]
    pub state_events: Vec<StateEvent>,
    #[serde(default)]
    pub machines: Vec<Machine>,
    #[serde(default)]
    pub tasks: HashMap<String, PlayTask>,
}

impl Play {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state_events: Vec::new(),
            machines: Vec::new(),
            tasks: HashMap::new(),
        }
    }

    /// Current lifecycle state (the last recorded event)
    pub fn state(&self) -> Option<PlayState> {
        self.state_events.last().map(|e| e.state)
    }

    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn default_machine(&self) -> Option<&Machine> {
        self.machines.first()
    }

    /// Replace the task with the same name wholesale
    pub fn apply_task(&mut self, task: PlayTask) {
        self.tasks.insert(task.name.clone(), task);
    }

    /// Every init task is completed
    pub fn is_initialized(&self) -> bool {
        self.tasks
            .values()
            .filter(|t| t.init)
            .all(PlayTask::is_completed)
    }

    /// Every non-helper task is completed
    pub fn is_completable(&self) -> bool {
        self.tasks
            .values()
            .filter(|t| !t.helper)
            .all(PlayTask::is_completed)
    }

    /// At least one task failed
    pub fn is_failed(&self) -> bool {
        self.tasks.values().any(PlayTask::is_failed)
    }

    pub fn init_progress(&self) -> InitProgress {
        let init = self.tasks.values().filter(|t| t.init);
        let (completed, total) = init.fold((0, 0), |(done, total), t| {
            (done + usize::from(t.is_completed()), total + 1)
        });
        InitProgress { completed, total }
    }
}
