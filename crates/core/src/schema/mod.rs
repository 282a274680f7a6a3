use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("章节范围 `{0}` 不是 `起始-结束` 格式")]
    Malformed(String),
    #[error("章节范围 `{0}` 的起始章节大于结束章节")]
    Inverted(String),
}

/// 解析卷册的章节范围字符串，例如 "1-30"。
pub fn parse_chapter_range(range: &str) -> Result<(u32, u32), RangeError> {
    let trimmed = range.trim();
    let (start, end) = trimmed
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(trimmed.to_string()))?;
    let start: u32 = start
        .trim()
        .parse()
        .map_err(|_| RangeError::Malformed(trimmed.to_string()))?;
    let end: u32 = end
        .trim()
        .parse()
        .map_err(|_| RangeError::Malformed(trimmed.to_string()))?;
    if start == 0 || start > end {
        return Err(RangeError::Inverted(trimmed.to_string()));
    }
    Ok((start, end))
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VolumeOutline {
    pub title: String,
    pub chapters_range: String,
    pub theme: String,
    #[serde(default)]
    pub key_turning_points: Vec<String>,
}

impl VolumeOutline {
    pub fn chapter_range(&self) -> Result<(u32, u32), RangeError> {
        parse_chapter_range(&self.chapters_range)
    }

    pub fn chapter_count(&self) -> Result<u32, RangeError> {
        let (start, end) = self.chapter_range()?;
        Ok(end - start + 1)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChapterOutline {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub characters_involved: Vec<String>,
    pub setting: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NovelOutline {
    pub title: String,
    pub genre: String,
    pub theme: String,
    pub setting: String,
    pub plot_summary: String,
    #[serde(default)]
    pub master_outline: Vec<VolumeOutline>,
    #[serde(default)]
    pub chapters: Vec<ChapterOutline>,
    pub characters: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub name: String,
    pub background: String,
    pub personality: String,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    pub arc: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChapterContent {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackCategory {
    Plot,
    Character,
    Style,
    Dialogue,
    Pacing,
    Description,
    Logic,
    Length,
    #[serde(other)]
    Other,
}

impl FeedbackCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Plot => "情节",
            Self::Character => "角色",
            Self::Style => "文笔",
            Self::Dialogue => "对话",
            Self::Pacing => "节奏",
            Self::Description => "描写",
            Self::Logic => "逻辑",
            Self::Length => "篇幅",
            Self::Other => "其他",
        }
    }
}

impl fmt::Display for FeedbackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackPriority {
    High,
    Medium,
    Low,
}

impl Default for FeedbackPriority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeedbackItem {
    pub category: FeedbackCategory,
    #[serde(default)]
    pub priority: FeedbackPriority,
    pub issue: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_length_check() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QualityEvaluation {
    pub score: i32,
    pub passes: bool,
    #[serde(default = "default_length_check")]
    pub length_check: bool,
    #[serde(default, alias = "feedback")]
    pub overall_feedback: String,
    #[serde(default)]
    pub feedback_items: Vec<FeedbackItem>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub facts: Vec<String>,
}

impl EntityRecord {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
            && self.locations.is_empty()
            && self.items.is_empty()
            && self.facts.is_empty()
    }

    /// 拼接为提示词中的续写上下文。
    pub fn context_block(&self) -> String {
        let mut lines = Vec::new();
        if !self.characters.is_empty() {
            lines.push(format!("登场角色：{}", self.characters.join("、")));
        }
        if !self.locations.is_empty() {
            lines.push(format!("出现地点：{}", self.locations.join("、")));
        }
        if !self.items.is_empty() {
            lines.push(format!("关键物品：{}", self.items.join("、")));
        }
        if !self.facts.is_empty() {
            lines.push(format!("既定事实：{}", self.facts.join("；")));
        }
        lines.join("\n")
    }
}
