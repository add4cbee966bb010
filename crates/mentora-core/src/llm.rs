use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::{MentoraError, Result};
use crate::model::{Role, Turn};

/// A chat-style prompt: optional system text plus alternating messages,
/// oldest first, ending with the one to answer.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            messages: Vec::new(),
        }
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(PromptMessage {
            role: Role::User,
            content: content.into(),
        });
        self
    }

    /// Replay prior turns as context. A conversation must open on a user
    /// message, so leading coach turns left over from truncation are skipped.
    pub fn with_history(mut self, turns: &[Turn]) -> Self {
        let skip = if self.messages.is_empty() {
            turns.iter().take_while(|t| t.role == Role::Assistant).count()
        } else {
            0
        };
        self.messages.extend(turns[skip..].iter().map(|t| PromptMessage {
            role: t.role,
            content: t.content.clone(),
        }));
        self
    }

    fn messages_json(&self) -> Vec<Value> {
        self.messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect()
    }

    /// Flattened transcript for completion-style endpoints.
    fn transcript(&self) -> String {
        let mut out = String::new();
        for m in &self.messages {
            let speaker = match m.role {
                Role::User => "Learner",
                Role::Assistant => "Coach",
            };
            out.push_str(&format!("{speaker}: {}\n", m.content));
        }
        out.push_str("Coach:");
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LlmProvider {
    Ollama,
    OpenAI,
    Gemini,
    Anthropic,
}

impl LlmProvider {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            other => Err(MentoraError::Config(format!(
                "unknown LLM provider: '{other}' (expected 'ollama', 'openai', 'gemini', or 'anthropic')"
            ))),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ollama => "Ollama",
            Self::OpenAI => "OpenAI",
            Self::Gemini => "Gemini",
            Self::Anthropic => "Anthropic",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::OpenAI => "https://api.openai.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Anthropic => "https://api.anthropic.com",
        }
    }

    fn key_env_var(self) -> Option<&'static str> {
        match self {
            Self::Ollama => None,
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
        }
    }
}

/// Remote text generation over one of the supported chat APIs.
pub struct LlmService {
    provider: LlmProvider,
    config: LlmConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for LlmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmService")
            .field("provider", &self.provider)
            .field("model", &self.config.model)
            .finish()
    }
}

impl LlmService {
    /// Create an LLM service from configuration. Fails fast on an unknown
    /// provider or a missing API key.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let provider = LlmProvider::parse(&config.provider)?;
        let api_key = match provider.key_env_var() {
            Some(env_var) => Some(resolve_api_key(config, env_var)?),
            None => None,
        };

        Ok(Self {
            provider,
            config: config.clone(),
            api_key,
            client: reqwest::Client::new(),
        })
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.label()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send the prompt and return the generated text, trimmed.
    pub async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let label = self.provider.label();
        let (url, body) = self.request_body(prompt);

        let mut req = self.client.post(&url).json(&body);
        req = match (self.provider, self.api_key.as_deref()) {
            (LlmProvider::OpenAI, Some(key)) => req.bearer_auth(key),
            (LlmProvider::Anthropic, Some(key)) => req
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01"),
            _ => req,
        };

        let resp = req
            .send()
            .await
            .map_err(|e| MentoraError::Generation(format!("{label} request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(MentoraError::Generation(format!(
                "{label} error {status}: {text}"
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| MentoraError::Generation(format!("{label} response parse error: {e}")))?;

        extract_text(self.provider, &json)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| MentoraError::Generation(format!("{label} response missing text")))
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(self.provider.default_base_url())
            .trim_end_matches('/')
    }

    fn request_body(&self, prompt: &Prompt) -> (String, Value) {
        let base = self.base_url();
        let model = &self.config.model;
        let max_tokens = self.config.max_tokens;

        match self.provider {
            LlmProvider::Ollama => {
                let mut body = json!({
                    "model": model,
                    "prompt": prompt.transcript(),
                    "stream": false,
                    "options": { "num_predict": max_tokens },
                });
                if let Some(ref sys) = prompt.system {
                    body["system"] = Value::String(sys.clone());
                }
                (format!("{base}/api/generate"), body)
            }
            LlmProvider::OpenAI => {
                let mut messages = Vec::new();
                if let Some(ref sys) = prompt.system {
                    messages.push(json!({"role": "system", "content": sys}));
                }
                messages.extend(prompt.messages_json());
                (
                    format!("{base}/v1/chat/completions"),
                    json!({ "model": model, "messages": messages, "max_tokens": max_tokens }),
                )
            }
            LlmProvider::Anthropic => {
                let mut body = json!({
                    "model": model,
                    "max_tokens": max_tokens,
                    "messages": prompt.messages_json(),
                });
                if let Some(ref sys) = prompt.system {
                    body["system"] = Value::String(sys.clone());
                }
                (format!("{base}/v1/messages"), body)
            }
            LlmProvider::Gemini => {
                let contents: Vec<Value> = prompt
                    .messages
                    .iter()
                    .map(|m| {
                        let role = match m.role {
                            Role::User => "user",
                            Role::Assistant => "model",
                        };
                        json!({"role": role, "parts": [{"text": m.content}]})
                    })
                    .collect();
                let mut body = json!({
                    "contents": contents,
                    "generationConfig": { "maxOutputTokens": max_tokens },
                });
                if let Some(ref sys) = prompt.system {
                    body["systemInstruction"] = json!({"parts": [{"text": sys}]});
                }
                let key = self.api_key.as_deref().unwrap_or_default();
                (
                    format!("{base}/v1beta/models/{model}:generateContent?key={key}"),
                    body,
                )
            }
        }
    }
}

fn extract_text(provider: LlmProvider, json: &Value) -> Option<&str> {
    match provider {
        LlmProvider::Ollama => json["response"].as_str(),
        LlmProvider::OpenAI => json["choices"][0]["message"]["content"].as_str(),
        LlmProvider::Anthropic => json["content"][0]["text"].as_str(),
        LlmProvider::Gemini => json["candidates"][0]["content"]["parts"][0]["text"].as_str(),
    }
}

/// Resolve an API key from config, a custom env var, or a default env var.
fn resolve_api_key(config: &LlmConfig, default_env_var: &str) -> Result<String> {
    if let Some(ref key) = config.api_key {
        if !key.is_empty() {
            return Ok(key.clone());
        }
    }

    let env_var_name = config.env_var.as_deref().unwrap_or(default_env_var);

    std::env::var(env_var_name).map_err(|_| {
        MentoraError::Config(format!(
            "{} LLM provider requires an API key (set llm.api_key or {})",
            config.provider, env_var_name
        ))
    })
}
