//! Event-stream wire messages
//!
//! Every message on a play connection is a JSON object with a `kind`
//! discriminator. Only `task` messages are consumed; other kinds are
//! accepted and ignored.

use crate::play::PlayTask;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MESSAGE_KIND_TASK: &str = "task";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("task message without a task body")]
    MissingTask,
}

/// A message received on the play event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnMessage {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<PlayTask>,
}

impl ConnMessage {
    pub fn task(task: PlayTask) -> Self {
        Self {
            kind: MESSAGE_KIND_TASK.to_string(),
            machine: None,
            task: Some(task),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The task update carried by this message, if it is one.
    ///
    /// Returns `Ok(None)` for kinds other than `task`.
    pub fn into_task(self) -> Result<Option<PlayTask>, MessageError> {
        if self.kind != MESSAGE_KIND_TASK {
            return Ok(None);
        }
        self.task.map(Some).ok_or(MessageError::MissingTask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::TaskStatus;

    #[test]
    fn test_decode_task_message() {
        let raw = br#"{"kind":"task","machine":"dev","task":{"name":"init_setup","init":true,"helper":false,"status":40,"version":7}}"#;
        let msg = ConnMessage::decode(raw).unwrap();
        assert_eq!(msg.machine.as_deref(), Some("dev"));

        let task = msg.into_task().unwrap().unwrap();
        assert_eq!(task.name, "init_setup");
        assert!(task.init);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.version, 7);
    }

    #[test]
    fn test_other_kinds_ignored() {
        let msg = ConnMessage::decode(br#"{"kind":"ping"}"#).unwrap();
        assert!(msg.into_task().unwrap().is_none());
    }

    #[test]
    fn test_task_kind_without_body() {
        let msg = ConnMessage::decode(br#"{"kind":"task"}"#).unwrap();
        assert!(matches!(msg.into_task(), Err(MessageError::MissingTask)));
    }

    #[test]
    fn test_unknown_status_is_malformed() {
        let raw = br#"{"kind":"task","task":{"name":"x","status":99}}"#;
        assert!(matches!(
            ConnMessage::decode(raw),
            Err(MessageError::Malformed(_))
        ));
    }
}
