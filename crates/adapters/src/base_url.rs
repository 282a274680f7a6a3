use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());

/// OpenAI 兼容端点的 base_url 归一化：没有版本段时补 `/v1`；以 `#`
/// 结尾表示按原样使用（仅去掉井号）。
pub fn check_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed.ends_with('#') {
        return trimmed.trim_end_matches('#').to_string();
    }

    if VERSION_SUFFIX_RE.is_match(trimmed) || trimmed.contains("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed.trim_end_matches('/'))
    }
}
