use crate::agents::{
    AgentError, CharacterAgent, EntityAgent, OutlineAgent, ReflectAgent, WriterAgent,
};
use crate::config::AgentProfiles;
use crate::extract::extract_json;
use crate::gate::{ApprovalGate, AutoApprove, Decision, ReviewArtifact};
use crate::llm::ChatModel;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::PromptRegistry;
use crate::schema::NovelOutline;
use crate::state::{GenerationScope, GenerationState, RunResult, StatePatch, Update};
use crate::storage::{NovelStorage, StorageError};
use crate::validate::{
    validate_chapter, validate_characters, validate_entities, validate_evaluation,
    validate_master_outline, validate_outline, validate_volume_chapters,
};
use std::path::PathBuf;
use thiserror::Error;

mod graph;

pub use graph::{triad_verdict, Stage, Topology, Verdict};

const DEFAULT_STEP_LIMIT: usize = 1000;
const DEFAULT_STORAGE_ROOT: &str = "result";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("stage {stage} failed: {source}")]
    Agent {
        stage: Stage,
        #[source]
        source: AgentError,
    },
    #[error("storage operation failed at stage {stage}: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },
    #[error("missing {what} at stage {stage}")]
    MissingArtifact { stage: Stage, what: &'static str },
    #[error("no transition from stage {stage} on verdict {verdict}")]
    InvalidTransition { stage: Stage, verdict: Verdict },
    #[error("workflow aborted by reviewer at stage {stage}")]
    Aborted { stage: Stage },
    #[error("step limit {limit} exceeded, aborting run")]
    StepLimit { limit: usize },
}

/// 工作流入口参数。
#[derive(Clone, Debug)]
pub struct WorkflowRequest {
    pub user_intent: String,
    pub interactive: bool,
}

impl WorkflowRequest {
    pub fn new(user_intent: impl Into<String>) -> Self {
        Self {
            user_intent: user_intent.into(),
            interactive: false,
        }
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }
}

/// 每执行完一个节点收到一次回调，用于向外流式播报进度。
pub trait StepObserver {
    fn on_step(&self, stage: Stage, state: &GenerationState);
}

struct NoopObserver;

impl StepObserver for NoopObserver {
    fn on_step(&self, _stage: Stage, _state: &GenerationState) {}
}

/// 五个内容代理的集合，按配置里的采样档案构建。
pub struct Agents<'a> {
    pub outline: OutlineAgent<'a>,
    pub character: CharacterAgent<'a>,
    pub writer: WriterAgent<'a>,
    pub reflect: ReflectAgent<'a>,
    pub entity: EntityAgent<'a>,
}

impl<'a> Agents<'a> {
    pub fn new(prompts: &'a PromptRegistry, profiles: &AgentProfiles, word_count: u32) -> Self {
        Self {
            outline: OutlineAgent::new(prompts, profiles.outline),
            character: CharacterAgent::new(prompts, profiles.character),
            writer: WriterAgent::new(prompts, profiles.writer, word_count),
            reflect: ReflectAgent::new(prompts, profiles.reflect),
            entity: EntityAgent::new(prompts, profiles.entity),
        }
    }
}

/// 生成状态机。节点一次执行一个，产出补丁由引擎合并进状态，再按
/// 静态转移表路由，全程受步数上限保护。
pub struct NovelWorkflow<'a, M: ChatModel> {
    model: &'a M,
    agents: Agents<'a>,
    gate: &'a dyn ApprovalGate,
    sink: &'a dyn LogSink,
    scope: GenerationScope,
    topology: Topology,
    step_limit: usize,
    storage_root: PathBuf,
}

static AUTO_APPROVE: AutoApprove = AutoApprove;

impl<'a, M: ChatModel> NovelWorkflow<'a, M> {
    pub fn new(model: &'a M, agents: Agents<'a>, sink: &'a dyn LogSink) -> Self {
        let scope = GenerationScope::default();
        Self {
            model,
            agents,
            gate: &AUTO_APPROVE,
            sink,
            topology: Topology::new(scope.use_master_outline),
            scope,
            step_limit: DEFAULT_STEP_LIMIT,
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
        }
    }

    pub fn with_scope(mut self, scope: GenerationScope) -> Self {
        self.topology = Topology::new(scope.use_master_outline);
        self.scope = scope;
        self
    }

    pub fn with_gate(mut self, gate: &'a dyn ApprovalGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit.max(1);
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn run(&self, request: WorkflowRequest) -> Result<GenerationState, WorkflowError> {
        self.run_with_observer(request, &NoopObserver)
    }

    pub fn run_with_observer(
        &self,
        request: WorkflowRequest,
        observer: &dyn StepObserver,
    ) -> Result<GenerationState, WorkflowError> {
        let mut state = GenerationState::new(request.user_intent, request.interactive, &self.scope);
        let mut stage = self.topology.entry();
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > self.step_limit {
                return Err(WorkflowError::StepLimit {
                    limit: self.step_limit,
                });
            }

            let (patch, verdict) = self.run_stage(stage, &state)?;
            state.apply(patch);
            observer.on_step(stage, &state);

            if stage.is_terminal() {
                return Ok(state);
            }

            stage = self
                .topology
                .next(stage, verdict)
                .ok_or(WorkflowError::InvalidTransition { stage, verdict })?;
        }
    }

    fn run_stage(
        &self,
        stage: Stage,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        match stage {
            Stage::GenerateOutline => self.generate_outline(state),
            Stage::ValidateOutline => self.validate_outline(state),
            Stage::GenerateMasterOutline => self.generate_master_outline(state),
            Stage::ValidateMasterOutline => self.validate_master_outline(state),
            Stage::GenerateVolumeOutline => self.generate_volume_outline(state),
            Stage::ValidateVolumeOutline => self.validate_volume_outline(state),
            Stage::AcceptOutline => self.accept_outline(state),
            Stage::ReviewOutline => self.review_outline(state),
            Stage::GenerateCharacters => self.generate_characters(state),
            Stage::ValidateCharacters => self.validate_characters(state),
            Stage::ReviewCharacters => self.review_characters(state),
            Stage::WriteChapter => self.write_chapter(state),
            Stage::ValidateChapter => self.validate_chapter(state),
            Stage::EvaluateChapter => self.evaluate_chapter(state),
            Stage::ValidateEvaluation => self.validate_evaluation(state),
            Stage::Decide => self.decide(state),
            Stage::ReviewChapter => self.review_chapter(state),
            Stage::GenerateEntities => self.generate_entities(state),
            Stage::ValidateEntities => self.validate_entities(state),
            Stage::AcceptChapter => self.accept_chapter(state),
            Stage::Success => self.success(state),
            Stage::Failure => Ok(self.failure(state)),
        }
    }

    // -------------------- 大纲（单次生成） --------------------

    fn generate_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::GenerateOutline;
        self.info(
            stage,
            format!("正在生成小说大纲（第{}次尝试）", state.attempt + 1),
        );

        let raw = self
            .agents
            .outline
            .generate_outline(self.model, state)
            .map_err(|source| WorkflowError::Agent { stage, source })?;
        let raw = self.take_json(stage, raw);

        Ok((
            StatePatch {
                attempt: Some(state.attempt + 1),
                raw_outline: Update::Set(raw),
                ..StatePatch::default()
            },
            Verdict::Advance,
        ))
    }

    fn validate_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ValidateOutline;
        let raw = state
            .raw_outline
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "raw_outline",
            })?;

        match validate_outline(raw, state.min_chapters) {
            Ok(outline) => {
                let storage = self.create_storage(stage, &outline.title)?;
                storage
                    .save_outline(&outline)
                    .map_err(|source| WorkflowError::Storage { stage, source })?;
                self.info(stage, "大纲检查成功，已写入存储");
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        storage: Update::Set(storage),
                        validated_outline: Update::Clear,
                        outline_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Success,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.warn(stage, format!("格式验证失败: {message}"));
                Ok((
                    StatePatch {
                        outline_error: Update::Set(message),
                        validated_outline: Update::Clear,
                        ..StatePatch::default()
                    },
                    triad_verdict(true, state.attempt, state.max_attempts),
                ))
            }
        }
    }

    // -------------------- 大纲（分卷 + 分章） --------------------

    fn generate_master_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::GenerateMasterOutline;
        self.info(
            stage,
            format!("开始分卷生成小说大纲（第{}次尝试）", state.attempt + 1),
        );

        let raw = self
            .agents
            .outline
            .generate_master_outline(self.model, state)
            .map_err(|source| WorkflowError::Agent { stage, source })?;
        let raw = self.take_json(stage, raw);

        Ok((
            StatePatch {
                attempt: Some(state.attempt + 1),
                raw_master_outline: Update::Set(raw),
                ..StatePatch::default()
            },
            Verdict::Advance,
        ))
    }

    fn validate_master_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ValidateMasterOutline;
        let raw = state
            .raw_master_outline
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "raw_master_outline",
            })?;

        match validate_master_outline(raw, state.min_chapters) {
            Ok(outline) => {
                self.info(
                    stage,
                    format!("总纲检查成功，共{}卷", outline.master_outline.len()),
                );
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        current_volume_index: Some(0),
                        validated_chapters: Some(Vec::new()),
                        validated_outline: Update::Set(outline),
                        outline_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Success,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.warn(stage, format!("格式验证失败: {message}"));
                Ok((
                    StatePatch {
                        outline_error: Update::Set(message),
                        ..StatePatch::default()
                    },
                    triad_verdict(true, state.attempt, state.max_attempts),
                ))
            }
        }
    }

    fn generate_volume_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::GenerateVolumeOutline;
        self.info(
            stage,
            format!(
                "开始分章生成卷{}大纲（第{}次尝试）",
                state.current_volume_index + 1,
                state.attempt + 1
            ),
        );

        let raw = self
            .agents
            .outline
            .generate_volume_chapters(self.model, state, state.current_volume_index)
            .map_err(|source| WorkflowError::Agent { stage, source })?;
        let raw = self.take_json(stage, raw);

        Ok((
            StatePatch {
                attempt: Some(state.attempt + 1),
                raw_volume_chapters: Update::Set(raw),
                ..StatePatch::default()
            },
            Verdict::Advance,
        ))
    }

    fn validate_volume_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ValidateVolumeOutline;
        let raw = state
            .raw_volume_chapters
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "raw_volume_chapters",
            })?;
        let outline = state
            .validated_outline
            .as_ref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "validated_outline",
            })?;

        match validate_volume_chapters(raw, outline, state.current_volume_index) {
            Ok(chapters) => {
                self.info(
                    stage,
                    format!(
                        "卷{}章节大纲检查成功，共{}章",
                        state.current_volume_index + 1,
                        chapters.len()
                    ),
                );
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        validated_chapters: Some(chapters),
                        outline_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Success,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.warn(
                    stage,
                    format!("卷{}验证失败: {message}", state.current_volume_index + 1),
                );
                Ok((
                    StatePatch {
                        outline_error: Update::Set(message),
                        ..StatePatch::default()
                    },
                    triad_verdict(true, state.attempt, state.max_attempts),
                ))
            }
        }
    }

    fn accept_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::AcceptOutline;
        let mut outline =
            state
                .validated_outline
                .clone()
                .ok_or(WorkflowError::MissingArtifact {
                    stage,
                    what: "validated_outline",
                })?;
        outline.chapters.extend(state.validated_chapters.clone());

        let next_index = state.current_volume_index + 1;
        let total_volumes = outline.master_outline.len();

        let mut patch = StatePatch {
            current_volume_index: Some(next_index),
            validated_chapters: Some(Vec::new()),
            raw_volume_chapters: Update::Clear,
            ..StatePatch::default()
        };

        // 最后一卷落定时标题才算最终，此时才建立存储并整体持久化
        if next_index >= total_volumes {
            let storage = self.create_storage(stage, &outline.title)?;
            storage
                .save_outline(&outline)
                .map_err(|source| WorkflowError::Storage { stage, source })?;
            self.info(
                stage,
                format!("已经完成所有卷册，共{}章，大纲写入存储", outline.chapters.len()),
            );
            patch.storage = Update::Set(storage);
            patch.validated_outline = Update::Clear;
            Ok((patch, Verdict::Complete))
        } else {
            self.info(stage, "接受此卷，准备生成下一卷");
            patch.validated_outline = Update::Set(outline);
            Ok((patch, Verdict::Continue))
        }
    }

    fn review_outline(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ReviewOutline;
        if !state.interactive {
            return Ok((StatePatch::default(), Verdict::Advance));
        }

        let outline = self.load_outline(stage, state)?;
        match self.gate.request_approval(ReviewArtifact::Outline(&outline)) {
            Decision::Approve => Ok((StatePatch::default(), Verdict::Advance)),
            Decision::Edit(content) => {
                match validate_outline(&content, state.min_chapters) {
                    Ok(edited) => {
                        let storage = self.storage_required(stage, state)?;
                        storage
                            .save_outline(&edited)
                            .map_err(|source| WorkflowError::Storage { stage, source })?;
                        self.info(stage, "已应用人工修改的大纲");
                    }
                    Err(err) => {
                        self.warn(stage, format!("人工修改的大纲未通过验证，保留原稿: {err}"));
                    }
                }
                Ok((StatePatch::default(), Verdict::Advance))
            }
            Decision::Regenerate => {
                self.info(stage, "人工要求重新生成大纲");
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        current_volume_index: Some(0),
                        validated_chapters: Some(Vec::new()),
                        raw_outline: Update::Clear,
                        raw_master_outline: Update::Clear,
                        raw_volume_chapters: Update::Clear,
                        validated_outline: Update::Clear,
                        outline_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Regenerate,
                ))
            }
            Decision::Abort => Err(WorkflowError::Aborted { stage }),
        }
    }

    // -------------------- 角色档案 --------------------

    fn generate_characters(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::GenerateCharacters;
        self.info(
            stage,
            format!("正在生成角色档案（第{}次尝试）", state.attempt + 1),
        );

        let raw = self
            .agents
            .character
            .generate_characters(self.model, state)
            .map_err(|source| WorkflowError::Agent { stage, source })?;
        let raw = self.take_json(stage, raw);

        Ok((
            StatePatch {
                attempt: Some(state.attempt + 1),
                raw_characters: Update::Set(raw),
                ..StatePatch::default()
            },
            Verdict::Advance,
        ))
    }

    fn validate_characters(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ValidateCharacters;
        let raw = state
            .raw_characters
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "raw_characters",
            })?;
        let outline = self.load_outline(stage, state)?;

        match validate_characters(raw, &outline.characters) {
            Ok(characters) => {
                let storage = self.storage_required(stage, state)?;
                storage
                    .save_characters(&characters)
                    .map_err(|source| WorkflowError::Storage { stage, source })?;
                self.info(stage, format!("角色档案检查成功，共{}人", characters.len()));
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        validated_characters: Update::Set(characters),
                        characters_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Success,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.warn(stage, format!("角色档案验证失败: {message}"));
                Ok((
                    StatePatch {
                        characters_error: Update::Set(message),
                        ..StatePatch::default()
                    },
                    triad_verdict(true, state.attempt, state.max_attempts),
                ))
            }
        }
    }

    fn review_characters(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ReviewCharacters;
        if !state.interactive {
            return Ok((StatePatch::default(), Verdict::Advance));
        }

        let roster = state
            .validated_characters
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "validated_characters",
            })?;
        match self.gate.request_approval(ReviewArtifact::Characters(roster)) {
            Decision::Approve => Ok((StatePatch::default(), Verdict::Advance)),
            Decision::Edit(content) => {
                let outline = self.load_outline(stage, state)?;
                match validate_characters(&content, &outline.characters) {
                    Ok(characters) => {
                        let storage = self.storage_required(stage, state)?;
                        storage
                            .save_characters(&characters)
                            .map_err(|source| WorkflowError::Storage { stage, source })?;
                        self.info(stage, "已应用人工修改的角色档案");
                        Ok((
                            StatePatch {
                                validated_characters: Update::Set(characters),
                                ..StatePatch::default()
                            },
                            Verdict::Advance,
                        ))
                    }
                    Err(err) => {
                        self.warn(stage, format!("人工修改的角色档案未通过验证，保留原稿: {err}"));
                        Ok((StatePatch::default(), Verdict::Advance))
                    }
                }
            }
            Decision::Regenerate => {
                self.info(stage, "人工要求重新生成角色档案");
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        raw_characters: Update::Clear,
                        validated_characters: Update::Clear,
                        characters_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Regenerate,
                ))
            }
            Decision::Abort => Err(WorkflowError::Aborted { stage }),
        }
    }

    // -------------------- 章节写作 --------------------

    fn write_chapter(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::WriteChapter;
        let outline = self.load_outline(stage, state)?;
        let number = state.current_chapter_index + 1;
        let title = outline
            .chapters
            .get(state.current_chapter_index)
            .map(|chapter| chapter.title.clone())
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "chapter_outline",
            })?;

        // 带着评估反馈且不是在修结构错误，才算一次质量修改
        let is_revision = state.validated_evaluation.is_some() && state.chapter_error.is_none();
        if is_revision {
            self.info(
                stage,
                format!(
                    "根据反馈修改第{number}章: {title}（第{}次修改）",
                    state.evaluate_attempt + 1
                ),
            );
        } else {
            self.info(
                stage,
                format!("正在撰写第{number}章: {title}（第{}次尝试）", state.attempt + 1),
            );
        }

        let raw = self
            .agents
            .writer
            .write_chapter(self.model, state)
            .map_err(|source| WorkflowError::Agent { stage, source })?;
        let raw = self.take_json(stage, raw);

        // 结构性重写只消耗 attempt，质量修改才消耗 evaluate_attempt
        Ok((
            StatePatch {
                attempt: Some(state.attempt + 1),
                evaluate_attempt: is_revision.then(|| state.evaluate_attempt + 1),
                raw_chapter: Update::Set(raw),
                ..StatePatch::default()
            },
            Verdict::Advance,
        ))
    }

    fn validate_chapter(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ValidateChapter;
        let raw = state
            .raw_chapter
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "raw_chapter",
            })?;
        let outline = self.load_outline(stage, state)?;
        let expected_title = outline
            .chapters
            .get(state.current_chapter_index)
            .map(|chapter| chapter.title.as_str())
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "chapter_outline",
            })?;

        match validate_chapter(raw, expected_title) {
            Ok((chapter, repaired)) => {
                if repaired {
                    self.warn(stage, "生成的章节标题与大纲不一致，已自动修正");
                }
                self.info(stage, "章节撰写成功，等待评估");
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        validated_chapter_draft: Update::Set(chapter),
                        chapter_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Success,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.warn(stage, format!("章节撰写失败: {message}"));
                Ok((
                    StatePatch {
                        chapter_error: Update::Set(message),
                        ..StatePatch::default()
                    },
                    triad_verdict(true, state.attempt, state.max_attempts),
                ))
            }
        }
    }

    // -------------------- 评估 --------------------

    fn evaluate_chapter(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::EvaluateChapter;
        self.info(
            stage,
            format!(
                "正在评估第{}章（第{}次生成评估，第{}次评估该章）",
                state.current_chapter_index + 1,
                state.attempt + 1,
                state.evaluate_attempt + 1
            ),
        );

        let raw = self
            .agents
            .reflect
            .evaluate_chapter(self.model, state)
            .map_err(|source| WorkflowError::Agent { stage, source })?;
        let raw = self.take_json(stage, raw);

        Ok((
            StatePatch {
                attempt: Some(state.attempt + 1),
                raw_evaluation: Update::Set(raw),
                ..StatePatch::default()
            },
            Verdict::Advance,
        ))
    }

    fn validate_evaluation(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ValidateEvaluation;
        let raw = state
            .raw_evaluation
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "raw_evaluation",
            })?;

        match validate_evaluation(raw) {
            Ok(evaluation) => {
                self.info(
                    stage,
                    format!(
                        "第{}章评估结果: 评分 {}/10, {}",
                        state.current_chapter_index + 1,
                        evaluation.score,
                        if evaluation.passes { "通过" } else { "未通过" }
                    ),
                );
                if !evaluation.passes && !evaluation.overall_feedback.is_empty() {
                    self.info(stage, format!("主要问题: {}", evaluation.overall_feedback));
                }
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        validated_evaluation: Update::Set(evaluation),
                        evaluation_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Success,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.warn(stage, format!("评估失败: {message}"));
                Ok((
                    StatePatch {
                        evaluation_error: Update::Set(message),
                        ..StatePatch::default()
                    },
                    triad_verdict(true, state.attempt, state.max_attempts),
                ))
            }
        }
    }

    fn decide(&self, state: &GenerationState) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::Decide;
        let evaluation =
            state
                .validated_evaluation
                .as_ref()
                .ok_or(WorkflowError::MissingArtifact {
                    stage,
                    what: "validated_evaluation",
                })?;
        let number = state.current_chapter_index + 1;

        if evaluation.passes {
            self.info(stage, format!("第{number}章通过评估"));
            Ok((StatePatch::default(), Verdict::Accept))
        } else if state.evaluate_attempt < state.max_attempts {
            self.info(stage, format!("第{number}章未达标，接受修改意见重写本章"));
            Ok((StatePatch::default(), Verdict::Revise))
        } else {
            self.warn(stage, format!("第{number}章达到修改次数上限，强制接受"));
            Ok((StatePatch::default(), Verdict::ForceAccept))
        }
    }

    fn review_chapter(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ReviewChapter;
        if !state.interactive {
            return Ok((StatePatch::default(), Verdict::Advance));
        }

        let draft = state
            .validated_chapter_draft
            .as_ref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "validated_chapter_draft",
            })?;
        let number = state.current_chapter_index + 1;
        match self.gate.request_approval(ReviewArtifact::Chapter {
            number,
            chapter: draft,
        }) {
            Decision::Approve => Ok((StatePatch::default(), Verdict::Advance)),
            Decision::Edit(content) => match validate_chapter(&content, &draft.title) {
                Ok((chapter, _)) => {
                    self.info(stage, format!("已应用人工修改的第{number}章"));
                    Ok((
                        StatePatch {
                            validated_chapter_draft: Update::Set(chapter),
                            ..StatePatch::default()
                        },
                        Verdict::Advance,
                    ))
                }
                Err(err) => {
                    self.warn(stage, format!("人工修改的章节未通过验证，保留原稿: {err}"));
                    Ok((StatePatch::default(), Verdict::Advance))
                }
            },
            Decision::Regenerate => {
                self.info(stage, format!("人工要求重写第{number}章"));
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        ..StatePatch::default()
                    },
                    Verdict::Regenerate,
                ))
            }
            Decision::Abort => Err(WorkflowError::Aborted { stage }),
        }
    }

    // -------------------- 实体识别 --------------------

    fn generate_entities(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::GenerateEntities;
        self.info(
            stage,
            format!("正在生成实体列表（第{}次尝试）", state.attempt + 1),
        );

        let raw = self
            .agents
            .entity
            .generate_entities(self.model, state)
            .map_err(|source| WorkflowError::Agent { stage, source })?;
        let raw = self.take_json(stage, raw);

        Ok((
            StatePatch {
                attempt: Some(state.attempt + 1),
                raw_entities: Update::Set(raw),
                ..StatePatch::default()
            },
            Verdict::Advance,
        ))
    }

    fn validate_entities(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::ValidateEntities;
        let raw = state
            .raw_entities
            .as_deref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "raw_entities",
            })?;
        let number = state.current_chapter_index + 1;

        match validate_entities(raw) {
            Ok(record) => {
                let storage = self.storage_required(stage, state)?;
                storage
                    .save_entity(number, &record)
                    .map_err(|source| WorkflowError::Storage { stage, source })?;
                self.info(stage, format!("第{number}章实体加载完成"));
                Ok((
                    StatePatch {
                        attempt: Some(0),
                        raw_entities: Update::Clear,
                        entities_error: Update::Clear,
                        ..StatePatch::default()
                    },
                    Verdict::Success,
                ))
            }
            Err(err) => {
                let message = err.to_string();
                self.warn(stage, format!("实体生成失败: {message}"));
                Ok((
                    StatePatch {
                        entities_error: Update::Set(message),
                        ..StatePatch::default()
                    },
                    triad_verdict(true, state.attempt, state.max_attempts),
                ))
            }
        }
    }

    // -------------------- 接受与收尾 --------------------

    fn accept_chapter(
        &self,
        state: &GenerationState,
    ) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::AcceptChapter;
        let draft = state
            .validated_chapter_draft
            .as_ref()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "validated_chapter_draft",
            })?;
        let storage = self.storage_required(stage, state)?;
        let number = state.current_chapter_index + 1;

        storage
            .save_chapter(number, draft)
            .map_err(|source| WorkflowError::Storage { stage, source })?;
        self.info(stage, format!("章节{number}已接受，已写入存储"));

        let total = self.load_outline(stage, state)?.chapters.len();
        let next_index = state.current_chapter_index + 1;

        let patch = StatePatch {
            attempt: Some(0),
            evaluate_attempt: Some(0),
            current_chapter_index: Some(next_index),
            raw_chapter: Update::Clear,
            raw_evaluation: Update::Clear,
            validated_chapter_draft: Update::Clear,
            validated_evaluation: Update::Clear,
            ..StatePatch::default()
        };

        if next_index < total {
            self.info(stage, "准备处理下一章节");
            Ok((patch, Verdict::Continue))
        } else {
            self.info(stage, "已经完成所有章节写作");
            Ok((patch, Verdict::Complete))
        }
    }

    fn success(&self, state: &GenerationState) -> Result<(StatePatch, Verdict), WorkflowError> {
        let stage = Stage::Success;
        let storage = self.storage_required(stage, state)?;

        let outline = storage
            .load_outline()
            .map_err(|source| WorkflowError::Storage { stage, source })?;
        let characters = storage
            .load_characters()
            .map_err(|source| WorkflowError::Storage { stage, source })?;
        let chapters = storage
            .load_all_chapters()
            .map_err(|source| WorkflowError::Storage { stage, source })?;

        self.info(stage, format!("小说创作流程完成，共{}章", chapters.len()));

        let mut patch = StatePatch {
            result: Update::Set(RunResult::Complete),
            final_content: Some(chapters),
            ..StatePatch::default()
        };
        if let Some(outline) = outline {
            patch.final_outline = Update::Set(outline);
        }
        if let Some(characters) = characters {
            patch.final_characters = Update::Set(characters);
        }
        Ok((patch, Verdict::Advance))
    }

    fn failure(&self, state: &GenerationState) -> (StatePatch, Verdict) {
        let stage = Stage::Failure;
        let message = state
            .first_error()
            .unwrap_or("未知错误")
            .to_string();
        self.warn(stage, format!("生成失败: {message}"));
        (
            StatePatch {
                result: Update::Set(RunResult::Failed),
                final_error: Update::Set(message),
                ..StatePatch::default()
            },
            Verdict::Advance,
        )
    }

    // -------------------- 杂项 --------------------

    fn take_json(&self, stage: Stage, raw: String) -> String {
        match extract_json(&raw) {
            Some(json) => {
                self.info(stage, "成功提取JSON内容");
                json
            }
            None => raw,
        }
    }

    fn create_storage(&self, stage: Stage, title: &str) -> Result<NovelStorage, WorkflowError> {
        NovelStorage::create(&self.storage_root, title)
            .map_err(|source| WorkflowError::Storage { stage, source })
    }

    fn storage_required<'s>(
        &self,
        stage: Stage,
        state: &'s GenerationState,
    ) -> Result<&'s NovelStorage, WorkflowError> {
        state.storage.as_ref().ok_or(WorkflowError::MissingArtifact {
            stage,
            what: "storage",
        })
    }

    fn load_outline(
        &self,
        stage: Stage,
        state: &GenerationState,
    ) -> Result<NovelOutline, WorkflowError> {
        if let Some(storage) = &state.storage {
            if let Some(outline) = storage
                .load_outline()
                .map_err(|source| WorkflowError::Storage { stage, source })?
            {
                return Ok(outline);
            }
        }
        state
            .validated_outline
            .clone()
            .ok_or(WorkflowError::MissingArtifact {
                stage,
                what: "outline",
            })
    }

    fn info(&self, stage: Stage, message: impl Into<String>) {
        self.sink
            .log(LogRecord::tagged(LogLevel::Info, stage.label(), message.into()));
    }

    fn warn(&self, stage: Stage, message: impl Into<String>) {
        self.sink
            .log(LogRecord::tagged(LogLevel::Warn, stage.label(), message.into()));
    }
}
