use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::AdapterError;

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryConfig {
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn from_profile(max_retries: u32, retry_delay_secs: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delay: Duration::from_secs(retry_delay_secs),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// 固定间隔重试，只针对瞬时错误；非瞬时错误直接上抛，重试耗尽后
/// 包装为 `RetryExhausted`。
pub fn call_with_retry<F, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=config.max_retries {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_transient() {
                    return Err(err);
                }
                warn!(
                    "transient backend failure, attempt {}/{}: {}",
                    attempt, config.max_retries, err
                );
                if attempt < config.max_retries {
                    thread::sleep(config.delay);
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(config.max_retries, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn transient() -> AdapterError {
        AdapterError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        }
    }

    #[test]
    fn recovers_after_transient_failures() {
        let config = RetryConfig::new(3, Duration::from_millis(0));
        let mut calls = 0;
        let result = call_with_retry(
            || {
                calls += 1;
                if calls < 3 {
                    Err(transient())
                } else {
                    Ok("ok")
                }
            },
            &config,
        );
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_transient_errors_abort_immediately() {
        let config = RetryConfig::new(3, Duration::from_millis(0));
        let mut calls = 0;
        let result: Result<(), _> = call_with_retry(
            || {
                calls += 1;
                Err(AdapterError::InvalidConfig("bad".into()))
            },
            &config,
        );
        assert!(matches!(result, Err(AdapterError::InvalidConfig(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn exhaustion_is_reported_with_attempt_count() {
        let config = RetryConfig::new(2, Duration::from_millis(0));
        let result: Result<(), _> = call_with_retry(|| Err(transient()), &config);
        assert!(matches!(
            result,
            Err(AdapterError::RetryExhausted { attempts: 2, .. })
        ));
    }
}
