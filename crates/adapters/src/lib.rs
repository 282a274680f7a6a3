mod base_url;
mod chat;
mod error;
mod retry;

pub use base_url::check_base_url;
pub use chat::{create_chat_adapter, create_chat_adapter_from_profile};
pub use error::AdapterError;
pub use retry::{call_with_retry, RetryConfig};

pub use storyloom_core::config::{Config, ConfigStore, LlmConfig};
pub use storyloom_core::llm::{ChatMessage, ChatModel, ChatModelError, Role, SamplingConfig};
