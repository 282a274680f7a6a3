use crate::feedback::ProcessedFeedback;
use crate::llm::{ChatMessage, ChatModel, ChatModelError, SamplingConfig};
use crate::prompts::{PromptArguments, PromptError, PromptRegistry};
use crate::schema::{Character, ChapterOutline, NovelOutline};
use crate::state::GenerationState;
use crate::storage::StorageError;
use thiserror::Error;

const KEY_EVENTS_PER_CHARACTER: usize = 3;
const PREVIOUS_EXCERPT_CHARS: usize = 100;
const ISSUES_IN_REVISION_PROMPT: usize = 5;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to render prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("language model invocation failed: {0}")]
    Model(#[source] ChatModelError),
    #[error("storage access failed: {0}")]
    Storage(#[from] StorageError),
    #[error("missing context: {0}")]
    MissingContext(&'static str),
}

/// 大纲已持久化后状态里不再保留副本，优先从存储取。
fn current_outline(state: &GenerationState) -> Result<NovelOutline, AgentError> {
    if let Some(storage) = &state.storage {
        if let Some(outline) = storage.load_outline()? {
            return Ok(outline);
        }
    }
    state
        .validated_outline
        .clone()
        .ok_or(AgentError::MissingContext("当前大纲"))
}

fn chapter_outline(outline: &NovelOutline, index: usize) -> Result<&ChapterOutline, AgentError> {
    outline
        .chapters
        .get(index)
        .ok_or(AgentError::MissingContext("当前章节大纲"))
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let mut count = 0usize;
    for (idx, _) in text.char_indices().rev() {
        count += 1;
        if count == max_chars {
            return &text[idx..];
        }
    }
    text
}

// -------------------- 大纲代理 --------------------

pub struct OutlineAgent<'a> {
    prompts: &'a PromptRegistry,
    sampling: SamplingConfig,
}

impl<'a> OutlineAgent<'a> {
    pub fn new(prompts: &'a PromptRegistry, sampling: SamplingConfig) -> Self {
        Self { prompts, sampling }
    }

    pub fn generate_outline<M: ChatModel>(
        &self,
        model: &M,
        state: &GenerationState,
    ) -> Result<String, AgentError> {
        let mut prompt = self.prompts.format_with(
            "outline",
            [
                ("user_intent", state.user_intent.clone()),
                ("min_chapters", state.min_chapters.to_string()),
            ],
        )?;
        prompt = with_error_preamble(prompt, state.outline_error.as_deref());

        self.invoke(model, prompt)
    }

    pub fn generate_master_outline<M: ChatModel>(
        &self,
        model: &M,
        state: &GenerationState,
    ) -> Result<String, AgentError> {
        let mut prompt = self.prompts.format_with(
            "master_outline",
            [
                ("user_intent", state.user_intent.clone()),
                ("min_chapters", state.min_chapters.to_string()),
                ("volume_count", state.volume_count.to_string()),
            ],
        )?;
        prompt = with_error_preamble(prompt, state.outline_error.as_deref());

        self.invoke(model, prompt)
    }

    pub fn generate_volume_chapters<M: ChatModel>(
        &self,
        model: &M,
        state: &GenerationState,
        volume_index: usize,
    ) -> Result<String, AgentError> {
        let outline = state
            .validated_outline
            .as_ref()
            .ok_or(AgentError::MissingContext("分卷总纲"))?;
        let volume = outline
            .master_outline
            .get(volume_index)
            .ok_or(AgentError::MissingContext("当前卷册"))?;
        let (start, end) = volume
            .chapter_range()
            .map_err(|_| AgentError::MissingContext("卷册章节范围"))?;

        // 前一卷的收束转折点作为续写上下文
        let prev_context = if volume_index > 0 {
            let prev = &outline.master_outline[volume_index - 1];
            prev.key_turning_points
                .last()
                .map(|point| format!("前卷《{}》结局：{}\n", prev.title, point))
                .unwrap_or_default()
        } else {
            String::new()
        };

        let mut prompt = self.prompts.format_with(
            "volume_outline",
            [
                ("prev_context", prev_context),
                ("volume_title", volume.title.clone()),
                ("volume_theme", volume.theme.clone()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("count", (end - start + 1).to_string()),
                (
                    "master_outline",
                    serde_json::to_string(outline).unwrap_or_default(),
                ),
            ],
        )?;
        prompt = with_error_preamble(prompt, state.outline_error.as_deref());

        self.invoke(model, prompt)
    }

    fn invoke<M: ChatModel>(&self, model: &M, prompt: String) -> Result<String, AgentError> {
        let system = self
            .prompts
            .format("outline_system", &PromptArguments::new())?;
        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
        model
            .generate(&messages, &self.sampling)
            .map_err(AgentError::Model)
    }
}

// -------------------- 角色代理 --------------------

pub struct CharacterAgent<'a> {
    prompts: &'a PromptRegistry,
    sampling: SamplingConfig,
}

impl<'a> CharacterAgent<'a> {
    pub fn new(prompts: &'a PromptRegistry, sampling: SamplingConfig) -> Self {
        Self { prompts, sampling }
    }

    pub fn generate_characters<M: ChatModel>(
        &self,
        model: &M,
        state: &GenerationState,
    ) -> Result<String, AgentError> {
        let outline = current_outline(state)?;

        // 每个角色在各章关键事件中的出场，控制在前几条以内约束提示词长度
        let mut context = String::from("角色列表及他们在故事中的关键事件:\n");
        for name in &outline.characters {
            let mut appearances: Vec<String> = Vec::new();
            for chapter in &outline.chapters {
                if chapter.characters_involved.iter().any(|c| c == name) {
                    appearances.push(format!(
                        "在《{}》中: {}",
                        chapter.title,
                        chapter.key_events.join("; ")
                    ));
                }
                if appearances.len() == KEY_EVENTS_PER_CHARACTER {
                    break;
                }
            }
            context.push_str(&format!("- {}: {}\n", name, appearances.join("; ")));
        }

        let mut prompt = self.prompts.format_with(
            "character",
            [
                ("title", outline.title.clone()),
                ("genre", outline.genre.clone()),
                ("setting", outline.setting.clone()),
                ("plot_summary", outline.plot_summary.clone()),
                ("character_list", outline.characters.join(", ")),
                ("context", context),
            ],
        )?;
        if let Some(error) = state.characters_error.as_deref() {
            prompt.push_str(&format!(
                "\n\n之前的尝试出现错误: {error}\n请修正错误并重新生成角色档案。"
            ));
        }

        let messages = [ChatMessage::user(prompt)];
        model
            .generate(&messages, &self.sampling)
            .map_err(AgentError::Model)
    }
}

// -------------------- 写作代理 --------------------

pub struct WriterAgent<'a> {
    prompts: &'a PromptRegistry,
    sampling: SamplingConfig,
    word_count: u32,
}

impl<'a> WriterAgent<'a> {
    pub fn new(prompts: &'a PromptRegistry, sampling: SamplingConfig, word_count: u32) -> Self {
        Self {
            prompts,
            sampling,
            word_count,
        }
    }

    pub fn write_chapter<M: ChatModel>(
        &self,
        model: &M,
        state: &GenerationState,
    ) -> Result<String, AgentError> {
        let outline = current_outline(state)?;
        let index = state.current_chapter_index;
        let chapter = chapter_outline(&outline, index)?;

        let involved = involved_characters(state.validated_characters.as_deref(), chapter);

        let pre_summary = if index > 0 {
            outline.chapters[index - 1].summary.clone()
        } else {
            "无".to_string()
        };
        let post_summary = outline
            .chapters
            .get(index + 1)
            .map(|next| next.summary.clone())
            .unwrap_or_else(|| "无".to_string());

        // 前章结尾与前章实体集都从存储取（章节序号 1 起始，前章即 index）
        let mut pre_context = "无".to_string();
        let mut entity_context = "（无）".to_string();
        if index > 0 {
            if let Some(storage) = &state.storage {
                if let Some(previous) = storage.load_chapter(index)? {
                    pre_context =
                        format!("...{}", tail_chars(&previous.content, PREVIOUS_EXCERPT_CHARS));
                }
                if let Some(record) = storage.load_entity(index)? {
                    if !record.is_empty() {
                        entity_context = record.context_block();
                    }
                }
            }
        }

        let mut prompt = self.prompts.format_with(
            "writer",
            [
                ("title", outline.title.clone()),
                ("genre", outline.genre.clone()),
                ("theme", outline.theme.clone()),
                ("setting", outline.setting.clone()),
                ("plot_summary", outline.plot_summary.clone()),
                ("character_list", outline.characters.join(", ")),
                ("chapter_number", (index + 1).to_string()),
                ("num_chapters", outline.chapters.len().to_string()),
                ("chapter_title", chapter.title.clone()),
                ("chapter_summary", chapter.summary.clone()),
                ("key_events", chapter.key_events.join(", ")),
                ("chapter_setting", chapter.setting.clone()),
                ("characters", involved),
                ("pre_summary", pre_summary),
                ("pre_context", pre_context),
                ("post_summary", post_summary),
                ("entity_context", entity_context),
                ("word_count", self.word_count.to_string()),
            ],
        )?;

        // 结构性错误与修改意见都放在提示词末尾
        if let Some(error) = state.chapter_error.as_deref() {
            prompt.push_str(&format!("\n\n之前的尝试出现错误: {error}\n请修正后重新输出。"));
        }
        if let Some(evaluation) = &state.validated_evaluation {
            let processed = ProcessedFeedback::process(evaluation, state.evaluate_attempt);
            let snippet = self.prompts.format_with(
                processed.strategy.prompt_key(),
                [
                    ("feedback_summary", processed.summary.clone()),
                    (
                        "issues",
                        processed.issues_block(evaluation, ISSUES_IN_REVISION_PROMPT),
                    ),
                ],
            )?;
            prompt.push_str(&format!("\n\n修改意见:\n{snippet}"));
        }

        let messages = [ChatMessage::user(prompt)];
        model
            .generate(&messages, &self.sampling)
            .map_err(AgentError::Model)
    }
}

fn involved_characters(roster: Option<&[Character]>, chapter: &ChapterOutline) -> String {
    let Some(roster) = roster else {
        return "（无档案）".to_string();
    };
    let mut blocks: Vec<String> = Vec::new();
    for character in roster {
        if chapter
            .characters_involved
            .iter()
            .any(|name| name == &character.name)
        {
            blocks.push(format!(
                "角色：{}\n性格：{}\n目标：{}",
                character.name,
                character.personality,
                character.goals.join(", ")
            ));
        }
    }
    if blocks.is_empty() {
        "（无档案）".to_string()
    } else {
        blocks.join("\n")
    }
}

// -------------------- 反思代理 --------------------

pub struct ReflectAgent<'a> {
    prompts: &'a PromptRegistry,
    sampling: SamplingConfig,
}

impl<'a> ReflectAgent<'a> {
    pub fn new(prompts: &'a PromptRegistry, sampling: SamplingConfig) -> Self {
        Self { prompts, sampling }
    }

    pub fn evaluate_chapter<M: ChatModel>(
        &self,
        model: &M,
        state: &GenerationState,
    ) -> Result<String, AgentError> {
        let outline = current_outline(state)?;
        let chapter = chapter_outline(&outline, state.current_chapter_index)?;
        let draft = state
            .validated_chapter_draft
            .as_ref()
            .ok_or(AgentError::MissingContext("待评估章节草稿"))?;

        let mut context = format!(
            "章节标题: {}\n章节大纲摘要: {}\n关键事件要求: {}\n\n",
            draft.title,
            chapter.summary,
            chapter.key_events.join(", ")
        );
        context.push_str("本章涉及角色及其性格:\n");
        if let Some(roster) = state.validated_characters.as_deref() {
            for character in roster {
                if chapter
                    .characters_involved
                    .iter()
                    .any(|name| name == &character.name)
                {
                    context.push_str(&format!("- {}: {}\n", character.name, character.personality));
                }
            }
        }
        context.push_str(&format!("实际长度: {}字符\n\n", draft.content.chars().count()));
        context.push_str("章节内容:\n");
        context.push_str(&draft.content);
        if let Some(error) = state.evaluation_error.as_deref() {
            context.push_str(&format!("\n\n之前的评估输出有误: {error}\n请重新生成合法的评估JSON。"));
        }

        let system = self
            .prompts
            .format("reflect_system", &PromptArguments::new())?;
        let user = self.prompts.format_with("reflect", [("context", context)])?;
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        model
            .generate(&messages, &self.sampling)
            .map_err(AgentError::Model)
    }
}

// -------------------- 实体识别代理 --------------------

pub struct EntityAgent<'a> {
    prompts: &'a PromptRegistry,
    sampling: SamplingConfig,
}

impl<'a> EntityAgent<'a> {
    pub fn new(prompts: &'a PromptRegistry, sampling: SamplingConfig) -> Self {
        Self { prompts, sampling }
    }

    pub fn generate_entities<M: ChatModel>(
        &self,
        model: &M,
        state: &GenerationState,
    ) -> Result<String, AgentError> {
        let draft = state
            .validated_chapter_draft
            .as_ref()
            .ok_or(AgentError::MissingContext("已接受的章节草稿"))?;

        let mut prompt = self.prompts.format_with(
            "entity",
            [
                ("chapter_title", draft.title.clone()),
                ("content", draft.content.clone()),
            ],
        )?;
        prompt = with_error_preamble(prompt, state.entities_error.as_deref());

        let messages = [ChatMessage::user(prompt)];
        model
            .generate(&messages, &self.sampling)
            .map_err(AgentError::Model)
    }
}

fn with_error_preamble(prompt: String, error: Option<&str>) -> String {
    match error {
        Some(error) => format!(
            "之前的尝试出现错误: {error}\n请修正错误并重新生成符合格式的内容。特别注意要用```json和```正确包裹JSON内容。\n{prompt}"
        ),
        None => prompt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FeedbackCategory, FeedbackItem, FeedbackPriority, QualityEvaluation};
    use crate::state::GenerationScope;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct CapturingModel {
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
        response: String,
    }

    impl CapturingModel {
        fn new(response: &str) -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
                response: response.to_string(),
            }
        }

        fn last_user_prompt(&self) -> String {
            let calls = self.prompts.lock().unwrap();
            calls
                .last()
                .and_then(|messages| messages.last())
                .map(|message| message.content.clone())
                .unwrap_or_default()
        }
    }

    impl ChatModel for CapturingModel {
        fn generate(
            &self,
            messages: &[ChatMessage],
            _sampling: &SamplingConfig,
        ) -> Result<String, ChatModelError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            Ok(self.response.clone())
        }
    }

    fn state_with_outline() -> GenerationState {
        let mut state =
            GenerationState::new("一部五章的悬疑小说", false, &GenerationScope::default());
        state.validated_outline = Some(NovelOutline {
            title: "雾港".into(),
            genre: "悬疑".into(),
            theme: "记忆".into(),
            setting: "海边".into(),
            plot_summary: "旧案".into(),
            master_outline: Vec::new(),
            chapters: vec![ChapterOutline {
                title: "第1章".into(),
                summary: "开端".into(),
                key_events: vec!["发现信件".into()],
                characters_involved: vec!["林昭".into()],
                setting: "旧书店".into(),
            }],
            characters: vec!["林昭".into()],
        });
        state
    }

    #[test]
    fn outline_error_is_injected_as_preamble() {
        let registry = PromptRegistry::new().unwrap();
        let agent = OutlineAgent::new(&registry, SamplingConfig::default());
        let model = CapturingModel::new("ok");

        let mut state = state_with_outline();
        state.outline_error = Some("JSON解析错误: 在第2行".into());
        agent.generate_outline(&model, &state).unwrap();

        let prompt = model.last_user_prompt();
        assert!(prompt.starts_with("之前的尝试出现错误: JSON解析错误"));
        assert!(prompt.contains("一部五章的悬疑小说"));
    }

    #[test]
    fn writer_appends_strategy_template_when_revising() {
        let registry = PromptRegistry::new().unwrap();
        let agent = WriterAgent::new(&registry, SamplingConfig::default(), 3000);
        let model = CapturingModel::new("ok");

        let mut state = state_with_outline();
        state.validated_evaluation = Some(QualityEvaluation {
            score: 5,
            passes: false,
            length_check: true,
            overall_feedback: "情节仓促".into(),
            feedback_items: vec![FeedbackItem {
                category: FeedbackCategory::Plot,
                priority: FeedbackPriority::High,
                issue: "转折缺少铺垫".into(),
                suggestion: "补一场对话".into(),
                location: None,
            }],
        });
        agent.write_chapter(&model, &state).unwrap();

        let prompt = model.last_user_prompt();
        assert!(prompt.contains("修改意见:"));
        assert!(prompt.contains("重点修复情节问题"));
        assert!(prompt.contains("转折缺少铺垫"));
    }

    #[test]
    fn character_agent_lists_required_names() {
        let registry = PromptRegistry::new().unwrap();
        let agent = CharacterAgent::new(&registry, SamplingConfig::default());
        let model = CapturingModel::new("ok");

        let state = state_with_outline();
        agent.generate_characters(&model, &state).unwrap();

        let prompt = model.last_user_prompt();
        assert!(prompt.contains("林昭"));
        assert!(prompt.contains("在《第1章》中: 发现信件"));
    }
}
