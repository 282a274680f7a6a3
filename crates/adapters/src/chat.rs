use std::thread;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use storyloom_core::config::{Config, LlmConfig};
use storyloom_core::llm::{ChatMessage, ChatModel, ChatModelError, Role, SamplingConfig};

use crate::base_url::check_base_url;
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

/// 按配置档案的 `interface_format` 分发到具体后端适配器。
pub fn create_chat_adapter(
    config: &Config,
    profile_name: &str,
) -> Result<Box<dyn ChatModel>, AdapterError> {
    let profile = config.get_llm_profile(profile_name).ok_or_else(|| {
        AdapterError::InvalidConfig(format!("unknown LLM profile `{}`", profile_name))
    })?;
    create_chat_adapter_from_profile(profile)
}

pub fn create_chat_adapter_from_profile(
    profile: &LlmConfig,
) -> Result<Box<dyn ChatModel>, AdapterError> {
    let fmt = profile.interface_format.trim().to_lowercase();
    let retry = RetryConfig::from_profile(profile.max_retries, profile.retry_delay);

    match fmt.as_str() {
        "openai" => Ok(Box::new(OpenAiCompatAdapter::new(
            resolve_base_url(&profile.base_url, "https://api.openai.com/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.timeout,
            retry,
        )?)),
        "deepseek" => Ok(Box::new(OpenAiCompatAdapter::new(
            resolve_base_url(&profile.base_url, "https://api.deepseek.com/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.timeout,
            retry,
        )?)),
        // 本地推理服务走同一套 OpenAI 兼容协议
        "ollama" => Ok(Box::new(OpenAiCompatAdapter::new(
            resolve_base_url(&profile.base_url, "http://localhost:11434/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.timeout,
            retry,
        )?)),
        "lm studio" => Ok(Box::new(OpenAiCompatAdapter::new(
            resolve_base_url(&profile.base_url, "http://localhost:1234/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.timeout,
            retry,
        )?)),
        "gemini" => Ok(Box::new(GeminiAdapter::new(
            profile.api_key.clone(),
            &profile.base_url,
            &profile.model_name,
            profile.timeout,
            retry,
        )?)),
        other => Err(AdapterError::InvalidConfig(format!(
            "unknown interface_format: {}",
            other
        ))),
    }
}

fn optional_string(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn resolve_base_url(base_url: &str, default: &str) -> String {
    let raw = if base_url.trim().is_empty() {
        default.to_string()
    } else {
        base_url.to_string()
    };
    check_base_url(&raw)
}

#[derive(Debug)]
struct OpenAiCompatAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    retry: RetryConfig,
}

impl OpenAiCompatAdapter {
    fn new(
        base_url: String,
        api_key: Option<String>,
        model_name: String,
        timeout: u64,
        retry: RetryConfig,
    ) -> Result<Self, AdapterError> {
        if base_url.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout.max(1)))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model_name,
            retry,
        })
    }

    fn invoke_once(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String, AdapterError> {
        let wire_messages: Vec<WireMessage<'_>> = messages.iter().map(WireMessage::from).collect();
        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages: wire_messages,
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
        };

        let mut request = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        handle_chat_response(response)
    }
}

impl ChatModel for OpenAiCompatAdapter {
    fn generate(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String, ChatModelError> {
        call_with_retry(|| self.invoke_once(messages, sampling), &self.retry)
            .map_err(ChatModelError::new)
    }
}

#[derive(Debug)]
struct GeminiAdapter {
    client: Client,
    url: String,
    retry: RetryConfig,
    base_delay: Duration,
}

impl GeminiAdapter {
    fn new(
        api_key: String,
        base_url: &str,
        model_name: &str,
        timeout: u64,
        retry: RetryConfig,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini api_key must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini model_name must not be empty".to_string(),
            ));
        }

        let base = if base_url.trim().is_empty() {
            "https://generativelanguage.googleapis.com/v1beta".to_string()
        } else {
            base_url.trim().trim_end_matches('/').to_string()
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout.max(1)))
            .build()?;

        Ok(Self {
            client,
            url: format!(
                "{base}/models/{model}:generateContent?key={api}",
                model = model_name,
                api = api_key
            ),
            retry,
            base_delay: Duration::from_secs(5),
        })
    }

    fn invoke_once(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String, AdapterError> {
        let request = GeminiRequest {
            contents: build_gemini_contents(messages),
            generation_config: GeminiGenerationConfig {
                max_output_tokens: sampling.max_tokens,
                temperature: sampling.temperature,
                top_p: sampling.top_p,
            },
        };

        let response = self.client.post(&self.url).json(&request).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: GeminiResponse = response.json()?;
        parse_gemini_response(parsed)
    }

    fn rate_limit_delay(&self, err: &AdapterError, attempt: u32) -> Option<Duration> {
        match err {
            AdapterError::HttpStatus { status, body } => {
                let lower = body.to_ascii_lowercase();
                if *status == StatusCode::TOO_MANY_REQUESTS
                    || lower.contains("quota")
                    || lower.contains("rate limit")
                {
                    if let Some(secs) = parse_retry_delay(body) {
                        return Some(Duration::from_secs(secs + 5));
                    }
                    let multiplier = 1u32.checked_shl(attempt).unwrap_or(1);
                    return self
                        .base_delay
                        .checked_mul(multiplier)
                        .or(Some(self.base_delay));
                }
                None
            }
            _ => None,
        }
    }
}

impl ChatModel for GeminiAdapter {
    fn generate(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String, ChatModelError> {
        let mut last_error = None;

        for attempt in 0..self.retry.max_retries {
            match self.invoke_once(messages, sampling) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let should_retry = attempt + 1 < self.retry.max_retries;
                    if should_retry {
                        if let Some(delay) = self.rate_limit_delay(&err, attempt) {
                            warn!(
                                "Gemini rate limit encountered, retrying in {:?} (attempt {}/{})",
                                delay,
                                attempt + 1,
                                self.retry.max_retries
                            );
                            thread::sleep(delay);
                            last_error = Some(err);
                            continue;
                        }
                        if err.is_transient() {
                            warn!(
                                "transient Gemini failure, retrying in {:?} (attempt {}/{}): {}",
                                self.retry.delay,
                                attempt + 1,
                                self.retry.max_retries,
                                err
                            );
                            thread::sleep(self.retry.delay);
                            last_error = Some(err);
                            continue;
                        }
                    }
                    return Err(ChatModelError::new(err));
                }
            }
        }

        let err = last_error.unwrap_or(AdapterError::EmptyResponse);
        Err(ChatModelError::new(AdapterError::retry_exhausted(
            self.retry.max_retries,
            err,
        )))
    }
}

fn handle_chat_response(response: reqwest::blocking::Response) -> Result<String, AdapterError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        return Err(AdapterError::HttpStatus { status, body });
    }

    let parsed: ChatCompletionResponse = response.json()?;
    extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        Self {
            role: message.role.as_str(),
            content: &message.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    for choice in response.choices {
        if let Some(message) = choice.message {
            if let Some(content) = message.content {
                if !content.trim().is_empty() {
                    return Some(content);
                }
            }
        }
        if let Some(content) = choice.content {
            if !content.trim().is_empty() {
                return Some(content);
            }
        }
    }
    None
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPartText>,
}

#[derive(Serialize)]
struct GeminiPartText {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
}

/// Gemini 没有独立的 system 角色，system 文本并入第一条用户消息。
fn build_gemini_contents(messages: &[ChatMessage]) -> Vec<GeminiContent> {
    let mut system_text = String::new();
    let mut contents: Vec<GeminiContent> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {
                if !system_text.is_empty() {
                    system_text.push('\n');
                }
                system_text.push_str(&message.content);
            }
            Role::User | Role::Assistant => {
                let role = if message.role == Role::User {
                    "user"
                } else {
                    "model"
                };
                let mut text = message.content.clone();
                if role == "user" && !system_text.is_empty() {
                    text = format!("{system_text}\n\n{text}");
                    system_text.clear();
                }
                contents.push(GeminiContent {
                    role,
                    parts: vec![GeminiPartText { text }],
                });
            }
        }
    }

    if !system_text.is_empty() {
        contents.push(GeminiContent {
            role: "user",
            parts: vec![GeminiPartText { text: system_text }],
        });
    }

    contents
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
    #[serde(rename = "finishReason")]
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

fn parse_gemini_response(response: GeminiResponse) -> Result<String, AdapterError> {
    for candidate in response.candidates {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            match reason {
                "MAX_TOKENS" => warn!("Gemini response truncated due to max_tokens limit"),
                "SAFETY" => warn!("Gemini response blocked by safety filters"),
                "RECITATION" => warn!("Gemini response blocked due to recitation concerns"),
                _ => {}
            }
        }

        if let Some(content) = candidate.content {
            let mut text = String::new();
            for part in content.parts {
                if let GeminiPart::Text { text: part_text } = part {
                    text.push_str(&part_text);
                }
            }
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }
    }

    Err(AdapterError::EmptyResponse)
}

fn parse_retry_delay(body: &str) -> Option<u64> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(details) = value
            .get("error")
            .and_then(|v| v.get("details"))
            .and_then(|v| v.as_array())
        {
            for detail in details {
                if let Some(delay) = detail
                    .get("retryDelay")
                    .or_else(|| detail.get("retry_delay"))
                {
                    if let Some(parsed) = parse_delay_value(delay) {
                        return Some(parsed);
                    }
                }
            }
        }
    }

    static RETRY_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("valid regex for retry delay")
    });

    RETRY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|matched| matched.as_str().parse::<u64>().ok())
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    if let Some(text) = value.as_str() {
        if let Ok(number) = text.trim_end_matches('s').parse::<u64>() {
            return Some(number);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_carry_lowercase_roles() {
        let messages = vec![ChatMessage::system("守规矩"), ChatMessage::user("写大纲")];
        let wire: Vec<WireMessage<'_>> = messages.iter().map(WireMessage::from).collect();
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
    }

    #[test]
    fn gemini_contents_fold_system_into_first_user_turn() {
        let messages = vec![ChatMessage::system("守规矩"), ChatMessage::user("写大纲")];
        let contents = build_gemini_contents(&messages);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].role, "user");
        assert!(contents[0].parts[0].text.starts_with("守规矩"));
        assert!(contents[0].parts[0].text.ends_with("写大纲"));
    }

    #[test]
    fn retry_delay_is_parsed_from_error_details() {
        let body = r#"{"error": {"details": [{"retryDelay": "17s"}]}}"#;
        assert_eq!(parse_retry_delay(body), Some(17));
        assert_eq!(parse_retry_delay("retry_delay: 9"), Some(9));
        assert_eq!(parse_retry_delay("no hint"), None);
    }

    #[test]
    fn choice_content_prefers_message_body() {
        let response = ChatCompletionResponse {
            choices: vec![ChatChoice {
                message: Some(ChatChoiceMessage {
                    content: Some("正文".into()),
                }),
                content: None,
            }],
        };
        assert_eq!(extract_choice_content(response).as_deref(), Some("正文"));
    }

    #[test]
    fn unknown_interface_format_is_rejected() {
        let profile = LlmConfig {
            interface_format: "telepathy".into(),
            model_name: "x".into(),
            ..LlmConfig::default()
        };
        let err = create_chat_adapter_from_profile(&profile).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidConfig(_)));
    }
}
