use crate::extract::json_error_context;
use crate::schema::{
    Character, ChapterContent, ChapterOutline, EntityRecord, NovelOutline, QualityEvaluation,
    RangeError,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use thiserror::Error;

/// 结构性验证错误。`Display` 输出即写入状态 `*_error` 字段、并注入
/// 下一次生成提示词的纠错文本。
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Json(String),
    #[error("数据结构不符合要求: {0}")]
    Schema(String),
    #[error("章节'{chapter}'中出现的角色'{name}'不在角色列表{roster:?}中")]
    UnknownCharacter {
        chapter: String,
        name: String,
        roster: Vec<String>,
    },
    #[error("章节数不足，至少需要{required}个章节，实际生成了{actual}个章节")]
    TooFewChapters { required: u32, actual: u32 },
    #[error("总纲未包含任何卷册")]
    EmptyMasterOutline,
    #[error("卷{volume}章节范围应从第{expected}章开始，实际为第{actual}章（各卷必须从第1章起连续衔接）")]
    DiscontinuousVolume {
        volume: usize,
        expected: u32,
        actual: u32,
    },
    #[error("总章节数不足{required}（当前{actual}章）")]
    InsufficientVolumeSpan { required: u32, actual: u32 },
    #[error("卷{volume}章节数不符（应有{expected}章，实际{actual}章）")]
    VolumeChapterCount {
        volume: usize,
        expected: u32,
        actual: u32,
    },
    #[error("角色'{name}'验证失败: {message}")]
    CharacterRecord { name: String, message: String },
    #[error("以下角色未生成详细档案: {}", missing.join(", "))]
    MissingCharacters { missing: Vec<String> },
    #[error("{0}")]
    Range(#[from] RangeError),
}

fn parse_payload<T: DeserializeOwned>(raw: &str) -> Result<T, ValidationError> {
    serde_json::from_str(raw).map_err(|err| match err.classify() {
        serde_json::error::Category::Data => ValidationError::Schema(err.to_string()),
        _ => ValidationError::Json(json_error_context(raw, &err)),
    })
}

fn check_character_references(
    chapters: &[ChapterOutline],
    roster: &[String],
) -> Result<(), ValidationError> {
    let known: BTreeSet<&str> = roster.iter().map(String::as_str).collect();
    for chapter in chapters {
        for name in &chapter.characters_involved {
            if !known.contains(name.as_str()) {
                return Err(ValidationError::UnknownCharacter {
                    chapter: chapter.title.clone(),
                    name: name.clone(),
                    roster: roster.to_vec(),
                });
            }
        }
    }
    Ok(())
}

/// 单次生成的完整大纲：结构、角色一致性、最小章节数。
pub fn validate_outline(raw: &str, min_chapters: u32) -> Result<NovelOutline, ValidationError> {
    let outline: NovelOutline = parse_payload(raw)?;
    check_character_references(&outline.chapters, &outline.characters)?;
    let actual = outline.chapters.len() as u32;
    if actual < min_chapters {
        return Err(ValidationError::TooFewChapters {
            required: min_chapters,
            actual,
        });
    }
    Ok(outline)
}

/// 分卷总纲：只含卷册骨架，章节列表强制清空；卷册范围必须从第 1 章
/// 起连续衔接且总跨度不小于最小章节数。
pub fn validate_master_outline(
    raw: &str,
    min_chapters: u32,
) -> Result<NovelOutline, ValidationError> {
    let mut outline: NovelOutline = parse_payload(raw)?;
    outline.chapters.clear();

    if outline.master_outline.is_empty() {
        return Err(ValidationError::EmptyMasterOutline);
    }

    let mut expected_start = 1u32;
    let mut total_end = 0u32;
    for (index, volume) in outline.master_outline.iter().enumerate() {
        let (start, end) = volume.chapter_range()?;
        if start != expected_start {
            return Err(ValidationError::DiscontinuousVolume {
                volume: index + 1,
                expected: expected_start,
                actual: start,
            });
        }
        expected_start = end + 1;
        total_end = end;
    }

    if total_end < min_chapters {
        return Err(ValidationError::InsufficientVolumeSpan {
            required: min_chapters,
            actual: total_end,
        });
    }

    Ok(outline)
}

#[derive(Deserialize)]
struct VolumeChaptersPayload {
    chapters: Vec<ChapterOutline>,
}

/// 单卷章节大纲切片：数量必须与卷册声明的范围宽度一致，角色引用
/// 必须落在总纲角色列表内。
pub fn validate_volume_chapters(
    raw: &str,
    outline: &NovelOutline,
    volume_index: usize,
) -> Result<Vec<ChapterOutline>, ValidationError> {
    let payload: VolumeChaptersPayload = parse_payload(raw)?;
    let volume = outline
        .master_outline
        .get(volume_index)
        .ok_or(ValidationError::EmptyMasterOutline)?;
    let expected = volume.chapter_count()?;
    let actual = payload.chapters.len() as u32;
    if actual != expected {
        return Err(ValidationError::VolumeChapterCount {
            volume: volume_index + 1,
            expected,
            actual,
        });
    }
    check_character_references(&payload.chapters, &outline.characters)?;
    Ok(payload.chapters)
}

/// 角色档案：逐个构造（单个坏记录带名字整体失败），再与大纲角色
/// 列表做差集，缺一个都不行。
pub fn validate_characters(
    raw: &str,
    expected: &[String],
) -> Result<Vec<Character>, ValidationError> {
    let records: Vec<serde_json::Value> = parse_payload(raw)?;
    let mut characters = Vec::with_capacity(records.len());
    for record in records {
        let name = record
            .get("name")
            .and_then(|value| value.as_str())
            .unwrap_or("<未命名>")
            .to_string();
        let character: Character =
            serde_json::from_value(record).map_err(|err| ValidationError::CharacterRecord {
                name: name.clone(),
                message: err.to_string(),
            })?;
        characters.push(character);
    }

    let generated: BTreeSet<&str> = characters.iter().map(|c| c.name.as_str()).collect();
    let missing: Vec<String> = expected
        .iter()
        .filter(|name| !generated.contains(name.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingCharacters { missing });
    }

    Ok(characters)
}

/// 章节草稿。标题与大纲不一致时静默修正而不是判失败，返回值第二项
/// 标记是否发生过修正。
pub fn validate_chapter(
    raw: &str,
    outline_title: &str,
) -> Result<(ChapterContent, bool), ValidationError> {
    let mut chapter: ChapterContent = parse_payload(raw)?;
    let repaired = chapter.title != outline_title;
    if repaired {
        chapter.title = outline_title.to_string();
    }
    Ok((chapter, repaired))
}

pub fn validate_evaluation(raw: &str) -> Result<QualityEvaluation, ValidationError> {
    parse_payload(raw)
}

pub fn validate_entities(raw: &str) -> Result<EntityRecord, ValidationError> {
    parse_payload(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline_json(characters: &[&str], chapter_chars: &[&str], chapters: usize) -> String {
        let chapter_entries: Vec<String> = (1..=chapters)
            .map(|number| {
                format!(
                    r#"{{"title": "第{number}章", "summary": "摘要", "key_events": ["事件"], "characters_involved": [{}], "setting": "小城"}}"#,
                    chapter_chars
                        .iter()
                        .map(|name| format!("\"{name}\""))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
            .collect();
        format!(
            r#"{{"title": "雾港", "genre": "悬疑", "theme": "记忆", "setting": "海边", "plot_summary": "旧案", "chapters": [{}], "characters": [{}]}}"#,
            chapter_entries.join(", "),
            characters
                .iter()
                .map(|name| format!("\"{name}\""))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    #[test]
    fn outline_accepts_resolved_references() {
        let raw = outline_json(&["林昭", "沈未"], &["林昭"], 3);
        let outline = validate_outline(&raw, 3).unwrap();
        assert_eq!(outline.chapters.len(), 3);
    }

    #[test]
    fn outline_validation_is_idempotent() {
        let raw = outline_json(&["林昭"], &["林昭"], 2);
        let first = validate_outline(&raw, 2).unwrap();
        let second = validate_outline(&raw, 2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn outline_rejects_unknown_character() {
        let raw = outline_json(&["林昭"], &["林昭", "沈未"], 3);
        let err = validate_outline(&raw, 3).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("沈未"));
        assert!(message.contains("不在角色列表"));
    }

    #[test]
    fn outline_rejects_too_few_chapters() {
        let raw = outline_json(&["林昭"], &["林昭"], 2);
        let err = validate_outline(&raw, 5).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::TooFewChapters {
                required: 5,
                actual: 2
            }
        ));
    }

    #[test]
    fn outline_parse_error_carries_location() {
        let raw = "{\n  \"title\": \"雾港\",\n  \"genre\": 悬疑\n}";
        let err = validate_outline(raw, 1).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("JSON解析错误"));
        assert!(message.contains("在第3行"));
        assert!(message.contains("请检查括号是否匹配"));
    }

    fn master_json(ranges: &[&str]) -> String {
        let volumes: Vec<String> = ranges
            .iter()
            .enumerate()
            .map(|(index, range)| {
                format!(
                    r#"{{"title": "第{}卷", "chapters_range": "{range}", "theme": "主题", "key_turning_points": ["转折"]}}"#,
                    index + 1
                )
            })
            .collect();
        format!(
            r#"{{"title": "雾港", "genre": "悬疑", "theme": "记忆", "setting": "海边", "plot_summary": "旧案", "master_outline": [{}], "characters": ["林昭"]}}"#,
            volumes.join(", ")
        )
    }

    #[test]
    fn master_outline_accepts_contiguous_span() {
        let outline = validate_master_outline(&master_json(&["1-10", "11-20"]), 20).unwrap();
        assert!(outline.chapters.is_empty());
        assert_eq!(outline.master_outline.len(), 2);
    }

    #[test]
    fn master_outline_rejects_gap_overlap_and_bad_start() {
        assert!(matches!(
            validate_master_outline(&master_json(&["1-10", "12-20"]), 10).unwrap_err(),
            ValidationError::DiscontinuousVolume {
                volume: 2,
                expected: 11,
                actual: 12
            }
        ));
        assert!(matches!(
            validate_master_outline(&master_json(&["1-10", "8-20"]), 10).unwrap_err(),
            ValidationError::DiscontinuousVolume { volume: 2, .. }
        ));
        assert!(matches!(
            validate_master_outline(&master_json(&["2-10"]), 5).unwrap_err(),
            ValidationError::DiscontinuousVolume {
                volume: 1,
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn master_outline_rejects_insufficient_span() {
        assert!(matches!(
            validate_master_outline(&master_json(&["1-8"]), 10).unwrap_err(),
            ValidationError::InsufficientVolumeSpan {
                required: 10,
                actual: 8
            }
        ));
    }

    #[test]
    fn volume_chapters_require_exact_count() {
        let outline = validate_master_outline(&master_json(&["1-2", "3-4"]), 4).unwrap();
        let raw = r#"{"chapters": [{"title": "第1章", "summary": "摘要", "key_events": [], "characters_involved": ["林昭"], "setting": "小城"}]}"#;
        let err = validate_volume_chapters(raw, &outline, 0).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::VolumeChapterCount {
                volume: 1,
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn volume_chapters_check_roster() {
        let outline = validate_master_outline(&master_json(&["1-1"]), 1).unwrap();
        let raw = r#"{"chapters": [{"title": "第1章", "summary": "摘要", "key_events": [], "characters_involved": ["陌生人"], "setting": "小城"}]}"#;
        let err = validate_volume_chapters(raw, &outline, 0).unwrap_err();
        assert!(err.to_string().contains("陌生人"));
    }

    #[test]
    fn characters_report_missing_names() {
        let expected = vec!["Alice".to_string(), "Bob".to_string()];
        let raw = r#"[{"name": "Alice", "background": "侦探", "personality": "冷静", "goals": [], "conflicts": [], "arc": "成长"}]"#;
        let err = validate_characters(raw, &expected).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Bob"));
        assert!(!message.contains("Alice,"));
    }

    #[test]
    fn malformed_character_record_fails_whole_batch() {
        let expected = vec!["Alice".to_string()];
        let raw = r#"[{"name": "Alice", "background": "侦探"}]"#;
        let err = validate_characters(raw, &expected).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::CharacterRecord { ref name, .. } if name == "Alice"
        ));
    }

    #[test]
    fn chapter_title_is_silently_repaired() {
        let raw = r#"{"title": "错误标题", "content": "正文"}"#;
        let (chapter, repaired) = validate_chapter(raw, "第1章").unwrap();
        assert!(repaired);
        assert_eq!(chapter.title, "第1章");

        let raw = r#"{"title": "第1章", "content": "正文"}"#;
        let (_, repaired) = validate_chapter(raw, "第1章").unwrap();
        assert!(!repaired);
    }

    #[test]
    fn evaluation_and_entities_parse() {
        let evaluation =
            validate_evaluation(r#"{"score": 8, "passes": true, "length_check": true}"#).unwrap();
        assert!(evaluation.passes);

        let entities = validate_entities(r#"{"characters": ["林昭"], "facts": ["雨夜"]}"#).unwrap();
        assert_eq!(entities.characters, vec!["林昭".to_string()]);
    }
}
