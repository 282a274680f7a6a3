use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 3000,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// 后端调用失败。后端适配器自带瞬时错误重试，这里出现的错误意味着
/// 重试额度已经耗尽，对工作流来说是致命的。
#[derive(Debug)]
pub struct ChatModelError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl ChatModelError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }

    pub fn as_inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl fmt::Display for ChatModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for ChatModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// 文本生成后端的统一契约：一次阻塞的 chat-completion 往返。
pub trait ChatModel: Send + Sync + fmt::Debug {
    fn generate(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String, ChatModelError>;
}

impl ChatModel for Box<dyn ChatModel> {
    fn generate(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String, ChatModelError> {
        (**self).generate(messages, sampling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let message = ChatMessage::system("hi");
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"system\""));
    }
}
