use regex::Regex;
use std::sync::OnceLock;

/// 从模型返回的自由文本中提取 JSON 片段。
///
/// 提取顺序：```json 围栏块 → 顶层对象 → 顶层数组。每个候选都先经
/// serde_json 校验，无法提取时返回 None，由调用方原样透传让验证环节
/// 报告解析错误。
pub fn extract_json(text: &str) -> Option<String> {
    if let Some(caps) = fenced_regex().captures(text) {
        let candidate = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if is_valid_json(candidate) {
            return Some(candidate.to_string());
        }
    }

    if let Some(found) = object_regex().find(text) {
        let candidate = found.as_str().trim();
        if is_valid_json(candidate) {
            return Some(candidate.to_string());
        }
    }

    if let Some(found) = array_regex().find(text) {
        let candidate = found.as_str().trim();
        if is_valid_json(candidate) {
            return Some(candidate.to_string());
        }
    }

    None
}

fn is_valid_json(candidate: &str) -> bool {
    !candidate.is_empty() && serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}

/// 构造带定位与上下文的 JSON 解析错误诊断，用于写回状态并注入下一次
/// 生成提示词。
pub fn json_error_context(raw: &str, err: &serde_json::Error) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    let line = err.line();
    let error_line = if line == 0 {
        0
    } else {
        (line - 1).min(lines.len().saturating_sub(1))
    };
    let start = error_line.saturating_sub(2);
    let end = (error_line + 3).min(lines.len());
    let context = lines[start..end].join("\n");

    format!(
        "JSON解析错误: 在第{}行, 第{}列 - {}\n错误位置附近内容:\n{}\n请检查括号是否匹配、是否使用双引号、逗号是否正确。",
        err.line(),
        err.column(),
        err,
        context
    )
}

fn fenced_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"```json\s*([\s\S]*?)\s*```").expect("invalid fence regex"))
}

fn object_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"\{\s*"[\w"]+"\s*:[\s\S]*\}"#).expect("invalid object regex"))
}

fn array_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"\[\s*\{\s*"[\w"]+"\s*:[\s\S]*\}\s*\]"#).expect("invalid array regex")
    })
}
