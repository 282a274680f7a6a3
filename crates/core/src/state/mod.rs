use crate::schema::{Character, ChapterContent, ChapterOutline, NovelOutline, QualityEvaluation};
use crate::storage::NovelStorage;

/// 单个状态字段的补丁动作。节点返回补丁而不是直接改状态，引擎在
/// 每一步结束时统一合并，保证每个字段只有当前节点一个写者。
#[derive(Clone, Debug, PartialEq)]
pub enum Update<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for Update<T> {
    fn default() -> Self {
        Update::Keep
    }
}

impl<T> Update<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Update::Keep => {}
            Update::Set(value) => *slot = Some(value),
            Update::Clear => *slot = None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunResult {
    Complete,
    Failed,
}

impl RunResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Complete => "小说创作流程完成",
            Self::Failed => "生成失败",
        }
    }
}

/// 贯穿全部阶段的共享可变上下文。
#[derive(Clone, Debug)]
pub struct GenerationState {
    pub user_intent: String,
    pub interactive: bool,

    pub min_chapters: u32,
    pub volume_count: u32,
    pub use_master_outline: bool,

    pub attempt: u32,
    pub evaluate_attempt: u32,
    pub max_attempts: u32,

    pub raw_outline: Option<String>,
    pub validated_outline: Option<NovelOutline>,
    pub outline_error: Option<String>,

    pub raw_master_outline: Option<String>,
    pub current_volume_index: usize,
    pub raw_volume_chapters: Option<String>,
    pub validated_chapters: Vec<ChapterOutline>,

    pub raw_characters: Option<String>,
    pub validated_characters: Option<Vec<Character>>,
    pub characters_error: Option<String>,

    pub current_chapter_index: usize,
    pub raw_chapter: Option<String>,
    pub validated_chapter_draft: Option<ChapterContent>,
    pub chapter_error: Option<String>,

    pub raw_evaluation: Option<String>,
    pub validated_evaluation: Option<QualityEvaluation>,
    pub evaluation_error: Option<String>,

    pub raw_entities: Option<String>,
    pub entities_error: Option<String>,

    pub storage: Option<NovelStorage>,

    pub result: Option<RunResult>,
    pub final_outline: Option<NovelOutline>,
    pub final_characters: Option<Vec<Character>>,
    pub final_content: Vec<ChapterContent>,
    pub final_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct GenerationScope {
    pub min_chapters: u32,
    pub volume_count: u32,
    pub use_master_outline: bool,
    pub max_attempts: u32,
}

impl Default for GenerationScope {
    fn default() -> Self {
        Self {
            min_chapters: 10,
            volume_count: 1,
            use_master_outline: true,
            max_attempts: 10,
        }
    }
}

impl GenerationState {
    pub fn new(user_intent: impl Into<String>, interactive: bool, scope: &GenerationScope) -> Self {
        Self {
            user_intent: user_intent.into(),
            interactive,
            min_chapters: scope.min_chapters,
            volume_count: scope.volume_count,
            use_master_outline: scope.use_master_outline,
            attempt: 0,
            evaluate_attempt: 0,
            max_attempts: scope.max_attempts,
            raw_outline: None,
            validated_outline: None,
            outline_error: None,
            raw_master_outline: None,
            current_volume_index: 0,
            raw_volume_chapters: None,
            validated_chapters: Vec::new(),
            raw_characters: None,
            validated_characters: None,
            characters_error: None,
            current_chapter_index: 0,
            raw_chapter: None,
            validated_chapter_draft: None,
            chapter_error: None,
            raw_evaluation: None,
            validated_evaluation: None,
            evaluation_error: None,
            raw_entities: None,
            entities_error: None,
            storage: None,
            result: None,
            final_outline: None,
            final_characters: None,
            final_content: Vec::new(),
            final_error: None,
        }
    }

    /// 合并一个节点产生的补丁。
    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(value) = patch.attempt {
            self.attempt = value;
        }
        if let Some(value) = patch.evaluate_attempt {
            self.evaluate_attempt = value;
        }
        if let Some(value) = patch.current_volume_index {
            self.current_volume_index = value;
        }
        if let Some(value) = patch.current_chapter_index {
            self.current_chapter_index = value;
        }
        if let Some(value) = patch.validated_chapters {
            self.validated_chapters = value;
        }
        if let Some(value) = patch.final_content {
            self.final_content = value;
        }

        patch.raw_outline.apply(&mut self.raw_outline);
        patch.validated_outline.apply(&mut self.validated_outline);
        patch.outline_error.apply(&mut self.outline_error);
        patch
            .raw_master_outline
            .apply(&mut self.raw_master_outline);
        patch
            .raw_volume_chapters
            .apply(&mut self.raw_volume_chapters);
        patch.raw_characters.apply(&mut self.raw_characters);
        patch
            .validated_characters
            .apply(&mut self.validated_characters);
        patch.characters_error.apply(&mut self.characters_error);
        patch.raw_chapter.apply(&mut self.raw_chapter);
        patch
            .validated_chapter_draft
            .apply(&mut self.validated_chapter_draft);
        patch.chapter_error.apply(&mut self.chapter_error);
        patch.raw_evaluation.apply(&mut self.raw_evaluation);
        patch
            .validated_evaluation
            .apply(&mut self.validated_evaluation);
        patch.evaluation_error.apply(&mut self.evaluation_error);
        patch.raw_entities.apply(&mut self.raw_entities);
        patch.entities_error.apply(&mut self.entities_error);
        patch.storage.apply(&mut self.storage);
        patch.result.apply(&mut self.result);
        patch.final_outline.apply(&mut self.final_outline);
        patch.final_characters.apply(&mut self.final_characters);
        patch.final_error.apply(&mut self.final_error);
    }

    /// 失败汇聚节点的取错顺序：先到先得。
    pub fn first_error(&self) -> Option<&str> {
        self.outline_error
            .as_deref()
            .or(self.characters_error.as_deref())
            .or(self.chapter_error.as_deref())
            .or(self.evaluation_error.as_deref())
            .or(self.entities_error.as_deref())
    }
}

/// 一个节点对状态的增量修改。计数器与累加器用 `Option`（None 即保持），
/// 可清空字段用 [`Update`]。
#[derive(Clone, Debug, Default)]
pub struct StatePatch {
    pub attempt: Option<u32>,
    pub evaluate_attempt: Option<u32>,
    pub current_volume_index: Option<usize>,
    pub current_chapter_index: Option<usize>,
    pub validated_chapters: Option<Vec<ChapterOutline>>,
    pub final_content: Option<Vec<ChapterContent>>,

    pub raw_outline: Update<String>,
    pub validated_outline: Update<NovelOutline>,
    pub outline_error: Update<String>,
    pub raw_master_outline: Update<String>,
    pub raw_volume_chapters: Update<String>,
    pub raw_characters: Update<String>,
    pub validated_characters: Update<Vec<Character>>,
    pub characters_error: Update<String>,
    pub raw_chapter: Update<String>,
    pub validated_chapter_draft: Update<ChapterContent>,
    pub chapter_error: Update<String>,
    pub raw_evaluation: Update<String>,
    pub validated_evaluation: Update<QualityEvaluation>,
    pub evaluation_error: Update<String>,
    pub raw_entities: Update<String>,
    pub entities_error: Update<String>,
    pub storage: Update<NovelStorage>,
    pub result: Update<RunResult>,
    pub final_outline: Update<NovelOutline>,
    pub final_characters: Update<Vec<Character>>,
    pub final_error: Update<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> GenerationState {
        GenerationState::new("一部五章的悬疑小说", false, &GenerationScope::default())
    }

    #[test]
    fn keep_leaves_fields_untouched() {
        let mut state = state();
        state.raw_outline = Some("raw".into());
        state.apply(StatePatch::default());
        assert_eq!(state.raw_outline.as_deref(), Some("raw"));
        assert_eq!(state.attempt, 0);
    }

    #[test]
    fn set_and_clear_apply_in_one_patch() {
        let mut state = state();
        state.outline_error = Some("旧错误".into());
        state.apply(StatePatch {
            attempt: Some(3),
            raw_outline: Update::Set("新大纲".into()),
            outline_error: Update::Clear,
            ..StatePatch::default()
        });
        assert_eq!(state.attempt, 3);
        assert_eq!(state.raw_outline.as_deref(), Some("新大纲"));
        assert!(state.outline_error.is_none());
    }

    #[test]
    fn first_error_is_first_found() {
        let mut state = state();
        state.chapter_error = Some("章节坏了".into());
        state.evaluation_error = Some("评估坏了".into());
        assert_eq!(state.first_error(), Some("章节坏了"));

        state.outline_error = Some("大纲坏了".into());
        assert_eq!(state.first_error(), Some("大纲坏了"));
    }
}
