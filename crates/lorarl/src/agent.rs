//! Agent that answers one turn at a time and hands its logprob to the training engine.

use crate::model::{GenerationOptions, PolicyModel, RoleDict};
use crate::session::{ChatHistory, ChatHistoryItem, SampleStatus};
use crate::LoraRlError;
use tch::Tensor;

/// Default system prompt of [`LoraRlAgent`].
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Receiver of the differentiable logprob of each generated turn.
pub trait LogprobSink {
    fn record_logprob(&mut self, logprob: Tensor);
}

/// Agent-level failures, as recorded by the session harness.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent context limit: {0}")]
    ContextLimit(String),

    #[error("Agent out of memory: {0}")]
    OutOfMemory(String),

    #[error("Agent unknown error: {0}")]
    Unknown(String),
}

impl AgentError {
    /// Status the harness assigns to a session that failed with this error.
    pub fn sample_status(&self) -> SampleStatus {
        match self {
            AgentError::ContextLimit(_) => SampleStatus::AgentContextLimit,
            AgentError::OutOfMemory(_) => SampleStatus::AgentOutOfMemory,
            AgentError::Unknown(_) => SampleStatus::AgentUnknownError,
        }
    }
}

impl From<LoraRlError> for AgentError {
    fn from(err: LoraRlError) -> Self {
        match err {
            LoraRlError::ContextLimit { .. } => AgentError::ContextLimit(err.to_string()),
            LoraRlError::MemoryExhaustion(_) => AgentError::OutOfMemory(err.to_string()),
            other => AgentError::Unknown(other.to_string()),
        }
    }
}

/// Single-conversation agent over a trainable model.
pub struct LoraRlAgent<M: PolicyModel> {
    model: M,
    system_prompt: String,
    options: GenerationOptions,
}

impl<M: PolicyModel> LoraRlAgent<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            options: GenerationOptions::default(),
        }
    }

    /// Set system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Set generation options.
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn role_dict(&self) -> &RoleDict {
        self.model.role_dict()
    }

    /// Answer the next turn of `history`.
    ///
    /// With a sink, the response is generated with its logprob and the logprob is recorded;
    /// without one, plain inference is used.
    pub fn inference(
        &mut self,
        history: &ChatHistory,
        sink: Option<&mut dyn LogprobSink>,
    ) -> Result<ChatHistoryItem, AgentError> {
        let batch = std::slice::from_ref(history);
        match sink {
            Some(sink) => {
                let output =
                    self.model
                        .generate_with_logprob(batch, &self.options, &self.system_prompt)?;
                if let Some(logprob) = output.logprobs.into_iter().next() {
                    sink.record_logprob(logprob);
                }
                output
                    .responses
                    .into_iter()
                    .next()
                    .ok_or_else(|| AgentError::Unknown("model returned no response".to_string()))
            }
            None => self
                .model
                .inference(batch, &self.options, &self.system_prompt)?
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::Unknown("model returned no response".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoraConfig, ModelMode};
    use crate::session::Role;
    use crate::testing::tiny_lora_model;

    #[derive(Default)]
    struct RecordingSink {
        logprobs: Vec<Tensor>,
    }

    impl LogprobSink for RecordingSink {
        fn record_logprob(&mut self, logprob: Tensor) {
            self.logprobs.push(logprob);
        }
    }

    fn history(content: &str) -> ChatHistory {
        vec![ChatHistoryItem::new(Role::User, content)]
    }

    #[test]
    fn test_inference_records_logprob() {
        let model = tiny_lora_model(0, LoraConfig::default()).unwrap();
        let mut agent = LoraRlAgent::new(model)
            .with_system_prompt("")
            .with_options(GenerationOptions::default().with_max_new_tokens(4));
        agent.model_mut().set_mode(ModelMode::Train);

        let mut sink = RecordingSink::default();
        let response = agent
            .inference(&history("count the rows ?"), Some(&mut sink))
            .unwrap();

        assert_eq!(response.role, Role::Agent);
        assert_eq!(sink.logprobs.len(), 1);
        assert!(sink.logprobs[0].requires_grad());
        assert!(sink.logprobs[0].double_value(&[]) <= 0.0);
    }

    #[test]
    fn test_plain_inference_without_sink() {
        let model = tiny_lora_model(0, LoraConfig::default()).unwrap();
        let mut agent =
            LoraRlAgent::new(model).with_options(GenerationOptions::default().with_max_new_tokens(2));
        let response = agent.inference(&history("hello"), None).unwrap();
        assert_eq!(response.role, Role::Agent);
    }

    #[test]
    fn test_context_limit_maps_to_agent_error() {
        let model = tiny_lora_model(0, LoraConfig::default()).unwrap();
        let mut agent = LoraRlAgent::new(model);
        let mut sink = RecordingSink::default();

        let err = agent
            .inference(&history(&"hello ".repeat(64)), Some(&mut sink))
            .unwrap_err();
        assert!(matches!(err, AgentError::ContextLimit(_)));
        assert_eq!(err.sample_status(), SampleStatus::AgentContextLimit);
        assert!(sink.logprobs.is_empty());
    }

    #[test]
    fn test_error_status_mapping() {
        let oom: AgentError = LoraRlError::MemoryExhaustion("cuda".to_string()).into();
        assert_eq!(oom.sample_status(), SampleStatus::AgentOutOfMemory);

        let unknown: AgentError = LoraRlError::Tokenizer("bad".to_string()).into();
        assert_eq!(unknown.sample_status(), SampleStatus::AgentUnknownError);
    }
}
