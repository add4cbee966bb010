//! The remote generation capability as the orchestrator sees it.

use crate::error::{MentoraError, Result};
use crate::llm::{LlmService, Prompt};
use crate::model::{ProgressSnapshot, Turn};

/// Opaque, fallible text generation. Implementations may be slow; callers
/// apply their own timeout.
pub trait Generator: Send + Sync {
    fn generate_welcome(
        &self,
        progress: &ProgressSnapshot,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    fn generate_chat_reply(
        &self,
        text: &str,
        progress: &ProgressSnapshot,
        history: &[Turn],
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    fn generate_recommendation(
        &self,
        progress: &ProgressSnapshot,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

const COACH_PERSONA: &str = "You are a concise, encouraging learning coach inside a \
hands-on programming course. Keep answers under 150 words, be specific, and never \
invent course content you were not told about.";

/// [`Generator`] backed by the configured LLM. With no LLM configured every
/// call fails, which routes callers onto their fallback paths.
#[derive(Debug)]
pub struct LlmGenerator {
    llm: Option<LlmService>,
}

impl LlmGenerator {
    pub fn new(llm: Option<LlmService>) -> Self {
        Self { llm }
    }

    pub fn disabled() -> Self {
        Self { llm: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.llm.is_some()
    }

    pub fn describe(&self) -> String {
        match &self.llm {
            Some(llm) => format!("{} / {}", llm.provider_name(), llm.model()),
            None => "disabled".to_string(),
        }
    }

    async fn run(&self, prompt: Prompt) -> Result<String> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| MentoraError::Generation("LLM is not configured".into()))?;
        llm.generate(&prompt).await
    }
}

fn system_with_progress(progress: &ProgressSnapshot) -> String {
    format!("{COACH_PERSONA}\n\nLearner progress: {}", progress.digest())
}

pub fn welcome_prompt(progress: &ProgressSnapshot) -> Prompt {
    Prompt::new(system_with_progress(progress)).user(
        "Greet the learner as they open the coaching panel. One or two sentences, \
         referencing their progress.",
    )
}

pub fn chat_prompt(text: &str, progress: &ProgressSnapshot, history: &[Turn]) -> Prompt {
    Prompt::new(system_with_progress(progress))
        .with_history(history)
        .user(text)
}

pub fn recommendation_prompt(progress: &ProgressSnapshot) -> Prompt {
    Prompt::new(system_with_progress(progress)).user(
        "Recommend the single most useful next step for this learner, with one \
         sentence on why. Prefer their weak areas and stated next goals.",
    )
}

impl Generator for LlmGenerator {
    async fn generate_welcome(&self, progress: &ProgressSnapshot) -> Result<String> {
        self.run(welcome_prompt(progress)).await
    }

    async fn generate_chat_reply(
        &self,
        text: &str,
        progress: &ProgressSnapshot,
        history: &[Turn],
    ) -> Result<String> {
        self.run(chat_prompt(text, progress, history)).await
    }

    async fn generate_recommendation(&self, progress: &ProgressSnapshot) -> Result<String> {
        self.run(recommendation_prompt(progress)).await
    }
}
