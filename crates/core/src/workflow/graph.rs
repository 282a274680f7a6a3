use std::fmt;

/// 生成图中的节点。扁平与分卷两条大纲路径都在同一张静态表里，
/// 入口由 [`Topology`] 决定。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    GenerateMasterOutline,
    ValidateMasterOutline,
    GenerateVolumeOutline,
    ValidateVolumeOutline,
    AcceptOutline,
    GenerateOutline,
    ValidateOutline,
    ReviewOutline,
    GenerateCharacters,
    ValidateCharacters,
    ReviewCharacters,
    WriteChapter,
    ValidateChapter,
    EvaluateChapter,
    ValidateEvaluation,
    Decide,
    ReviewChapter,
    GenerateEntities,
    ValidateEntities,
    AcceptChapter,
    Success,
    Failure,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GenerateMasterOutline => "generate_master_outline",
            Self::ValidateMasterOutline => "validate_master_outline",
            Self::GenerateVolumeOutline => "generate_volume_outline",
            Self::ValidateVolumeOutline => "validate_volume_outline",
            Self::AcceptOutline => "accept_outline",
            Self::GenerateOutline => "generate_outline",
            Self::ValidateOutline => "validate_outline",
            Self::ReviewOutline => "review_outline",
            Self::GenerateCharacters => "generate_characters",
            Self::ValidateCharacters => "validate_characters",
            Self::ReviewCharacters => "review_characters",
            Self::WriteChapter => "write_chapter",
            Self::ValidateChapter => "validate_chapter",
            Self::EvaluateChapter => "evaluate_chapter",
            Self::ValidateEvaluation => "validate_evaluation",
            Self::Decide => "decide",
            Self::ReviewChapter => "review_chapter",
            Self::GenerateEntities => "generate_entities",
            Self::ValidateEntities => "validate_entities",
            Self::AcceptChapter => "accept_chapter",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::GenerateMasterOutline | Self::ValidateMasterOutline => "分卷",
            Self::GenerateVolumeOutline | Self::ValidateVolumeOutline | Self::AcceptOutline => {
                "分章"
            }
            Self::GenerateOutline | Self::ValidateOutline | Self::ReviewOutline => "大纲",
            Self::GenerateCharacters | Self::ValidateCharacters | Self::ReviewCharacters => {
                "角色档案"
            }
            Self::WriteChapter | Self::ValidateChapter | Self::ReviewChapter => "单章撰写",
            Self::EvaluateChapter | Self::ValidateEvaluation | Self::Decide => "内容评估",
            Self::GenerateEntities | Self::ValidateEntities => "实体识别",
            Self::AcceptChapter => "接受章节",
            Self::Success => "完成",
            Self::Failure => "失败",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 条件边的裁决。结构性三岔口用 Success/Retry/Failure，质量闸口用
/// Accept/Revise/ForceAccept，循环推进用 Continue/Complete，线性边
/// 用 Advance，人工审查重做用 Regenerate。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Advance,
    Success,
    Retry,
    Failure,
    Accept,
    Revise,
    ForceAccept,
    Continue,
    Complete,
    Regenerate,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Advance => "advance",
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Failure => "failure",
            Self::Accept => "accept",
            Self::Revise => "revise",
            Self::ForceAccept => "force_accept",
            Self::Continue => "continue",
            Self::Complete => "complete",
            Self::Regenerate => "regenerate",
        };
        f.write_str(label)
    }
}

/// 生成-验证-检查三联的统一裁决逻辑。
pub fn triad_verdict(has_error: bool, attempt: u32, max_attempts: u32) -> Verdict {
    if !has_error {
        Verdict::Success
    } else if attempt < max_attempts {
        Verdict::Retry
    } else {
        Verdict::Failure
    }
}

/// 静态转移表。唯一依赖运行配置的地方是入口节点与大纲重做目标。
#[derive(Clone, Copy, Debug)]
pub struct Topology {
    use_master_outline: bool,
}

impl Topology {
    pub fn new(use_master_outline: bool) -> Self {
        Self { use_master_outline }
    }

    pub fn entry(&self) -> Stage {
        if self.use_master_outline {
            Stage::GenerateMasterOutline
        } else {
            Stage::GenerateOutline
        }
    }

    fn outline_entry(&self) -> Stage {
        self.entry()
    }

    pub fn next(&self, stage: Stage, verdict: Verdict) -> Option<Stage> {
        use Stage::*;

        let next = match (stage, verdict) {
            (GenerateMasterOutline, Verdict::Advance) => ValidateMasterOutline,
            (ValidateMasterOutline, Verdict::Success) => GenerateVolumeOutline,
            (ValidateMasterOutline, Verdict::Retry) => GenerateMasterOutline,
            (ValidateMasterOutline, Verdict::Failure) => Failure,

            (GenerateVolumeOutline, Verdict::Advance) => ValidateVolumeOutline,
            (ValidateVolumeOutline, Verdict::Success) => AcceptOutline,
            (ValidateVolumeOutline, Verdict::Retry) => GenerateVolumeOutline,
            (ValidateVolumeOutline, Verdict::Failure) => Failure,

            (AcceptOutline, Verdict::Continue) => GenerateVolumeOutline,
            (AcceptOutline, Verdict::Complete) => ReviewOutline,

            (GenerateOutline, Verdict::Advance) => ValidateOutline,
            (ValidateOutline, Verdict::Success) => ReviewOutline,
            (ValidateOutline, Verdict::Retry) => GenerateOutline,
            (ValidateOutline, Verdict::Failure) => Failure,

            (ReviewOutline, Verdict::Advance) => GenerateCharacters,
            (ReviewOutline, Verdict::Regenerate) => self.outline_entry(),

            (GenerateCharacters, Verdict::Advance) => ValidateCharacters,
            (ValidateCharacters, Verdict::Success) => ReviewCharacters,
            (ValidateCharacters, Verdict::Retry) => GenerateCharacters,
            (ValidateCharacters, Verdict::Failure) => Failure,

            (ReviewCharacters, Verdict::Advance) => WriteChapter,
            (ReviewCharacters, Verdict::Regenerate) => GenerateCharacters,

            (WriteChapter, Verdict::Advance) => ValidateChapter,
            (ValidateChapter, Verdict::Success) => EvaluateChapter,
            (ValidateChapter, Verdict::Retry) => WriteChapter,
            (ValidateChapter, Verdict::Failure) => Failure,

            (EvaluateChapter, Verdict::Advance) => ValidateEvaluation,
            (ValidateEvaluation, Verdict::Success) => Decide,
            (ValidateEvaluation, Verdict::Retry) => EvaluateChapter,
            (ValidateEvaluation, Verdict::Failure) => Failure,

            (Decide, Verdict::Accept) => ReviewChapter,
            (Decide, Verdict::Revise) => WriteChapter,
            (Decide, Verdict::ForceAccept) => AcceptChapter,

            (ReviewChapter, Verdict::Advance) => GenerateEntities,
            (ReviewChapter, Verdict::Regenerate) => WriteChapter,

            (GenerateEntities, Verdict::Advance) => ValidateEntities,
            (ValidateEntities, Verdict::Success) => AcceptChapter,
            (ValidateEntities, Verdict::Retry) => GenerateEntities,
            (ValidateEntities, Verdict::Failure) => Failure,

            (AcceptChapter, Verdict::Continue) => WriteChapter,
            (AcceptChapter, Verdict::Complete) => Success,

            _ => return None,
        };
        Some(next)
    }
}
