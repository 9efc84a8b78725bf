//! Session data model shared with the benchmark harness.
//!
//! The harness owns sessions and drives their status; lorarl only reads them.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a session, set by the harness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Initial,
    Running,
    Completed,
    AgentContextLimit,
    AgentValidationFailed,
    AgentInvalidAction,
    AgentOutOfMemory,
    AgentUnknownError,
    TaskLimitReached,
    TaskEnvironmentError,
    TaskUnknownError,
}

impl SampleStatus {
    /// Every status, in declaration order.
    pub const ALL: [SampleStatus; 11] = [
        SampleStatus::Initial,
        SampleStatus::Running,
        SampleStatus::Completed,
        SampleStatus::AgentContextLimit,
        SampleStatus::AgentValidationFailed,
        SampleStatus::AgentInvalidAction,
        SampleStatus::AgentOutOfMemory,
        SampleStatus::AgentUnknownError,
        SampleStatus::TaskLimitReached,
        SampleStatus::TaskEnvironmentError,
        SampleStatus::TaskUnknownError,
    ];

    /// Whether the session ended because of an agent or environment failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SampleStatus::AgentContextLimit
                | SampleStatus::AgentValidationFailed
                | SampleStatus::AgentInvalidAction
                | SampleStatus::AgentOutOfMemory
                | SampleStatus::AgentUnknownError
                | SampleStatus::TaskEnvironmentError
                | SampleStatus::TaskUnknownError
        )
    }
}

/// Outcome assigned once the environment scores the episode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvaluationOutcome {
    #[default]
    Unset,
    Correct,
    Incorrect,
}

impl SessionEvaluationOutcome {
    pub const ALL: [SessionEvaluationOutcome; 3] = [
        SessionEvaluationOutcome::Unset,
        SessionEvaluationOutcome::Correct,
        SessionEvaluationOutcome::Incorrect,
    ];
}

/// Evaluation result attached to a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub outcome: SessionEvaluationOutcome,
}

/// Speaker of a chat history item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

/// One message of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistoryItem {
    pub role: Role,
    pub content: String,
}

impl ChatHistoryItem {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered conversation between user and agent.
pub type ChatHistory = Vec<ChatHistoryItem>;

/// One benchmark episode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sample_index: String,
    pub sample_status: SampleStatus,
    pub evaluation_record: EvaluationRecord,
    pub chat_history: ChatHistory,
}

impl Session {
    pub fn new(sample_index: impl Into<String>) -> Self {
        Self {
            sample_index: sample_index.into(),
            sample_status: SampleStatus::Initial,
            evaluation_record: EvaluationRecord::default(),
            chat_history: Vec::new(),
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: SampleStatus) -> Self {
        self.sample_status = status;
        self
    }

    /// Set the evaluation outcome.
    pub fn with_outcome(mut self, outcome: SessionEvaluationOutcome) -> Self {
        self.evaluation_record.outcome = outcome;
        self
    }
}
