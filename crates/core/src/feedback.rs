use crate::schema::{FeedbackCategory, FeedbackItem, FeedbackPriority, QualityEvaluation};

/// 根据评估反馈的类别分布选出的修改策略，决定追加到重写提示词里的
/// 模板。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevisionStrategy {
    PlotFocused,
    CharacterFocused,
    StyleFocused,
    DialogueFocused,
    PacingFocused,
    DescriptionFocused,
    LogicFocused,
    Expansion,
    GeneralImprovement,
    ComprehensiveRewrite,
}

impl RevisionStrategy {
    pub fn prompt_key(&self) -> &'static str {
        match self {
            Self::PlotFocused => "revision_plot",
            Self::CharacterFocused => "revision_character",
            Self::StyleFocused => "revision_style",
            Self::DialogueFocused => "revision_dialogue",
            Self::PacingFocused => "revision_pacing",
            Self::DescriptionFocused => "revision_description",
            Self::LogicFocused => "revision_logic",
            Self::Expansion => "revision_expand",
            Self::GeneralImprovement => "revision_general",
            Self::ComprehensiveRewrite => "revision_full",
        }
    }

    fn from_category(category: FeedbackCategory) -> Self {
        match category {
            FeedbackCategory::Plot => Self::PlotFocused,
            FeedbackCategory::Character => Self::CharacterFocused,
            FeedbackCategory::Style => Self::StyleFocused,
            FeedbackCategory::Dialogue => Self::DialogueFocused,
            FeedbackCategory::Pacing => Self::PacingFocused,
            FeedbackCategory::Description => Self::DescriptionFocused,
            FeedbackCategory::Logic => Self::LogicFocused,
            FeedbackCategory::Length => Self::Expansion,
            FeedbackCategory::Other => Self::ComprehensiveRewrite,
        }
    }

    /// 策略选择。三次及以上修改后不再做局部修补，直接全面重写。
    pub fn classify(evaluation: &QualityEvaluation, revision_count: u32) -> Self {
        if revision_count >= 3 {
            return Self::ComprehensiveRewrite;
        }

        if evaluation.feedback_items.is_empty() {
            if !evaluation.length_check {
                return Self::Expansion;
            }
            return Self::GeneralImprovement;
        }

        Self::from_category(dominant_category(&evaluation.feedback_items))
    }
}

const CATEGORY_ORDER: [FeedbackCategory; 9] = [
    FeedbackCategory::Plot,
    FeedbackCategory::Character,
    FeedbackCategory::Style,
    FeedbackCategory::Dialogue,
    FeedbackCategory::Pacing,
    FeedbackCategory::Description,
    FeedbackCategory::Logic,
    FeedbackCategory::Length,
    FeedbackCategory::Other,
];

fn dominant_category(items: &[FeedbackItem]) -> FeedbackCategory {
    let mut best = FeedbackCategory::Other;
    let mut best_count = 0usize;
    for category in CATEGORY_ORDER {
        let count = items.iter().filter(|item| item.category == category).count();
        if count > best_count {
            best = category;
            best_count = count;
        }
    }
    best
}

/// 结构化评估结果的加工视图：摘要、高优先级问题与修改策略。
#[derive(Clone, Debug)]
pub struct ProcessedFeedback {
    pub summary: String,
    pub high_priority: Vec<FeedbackItem>,
    pub strategy: RevisionStrategy,
}

impl ProcessedFeedback {
    pub fn process(evaluation: &QualityEvaluation, revision_count: u32) -> Self {
        Self {
            summary: summarize(evaluation),
            high_priority: evaluation
                .feedback_items
                .iter()
                .filter(|item| item.priority == FeedbackPriority::High)
                .cloned()
                .collect(),
            strategy: RevisionStrategy::classify(evaluation, revision_count),
        }
    }

    /// 供重写提示词引用的问题清单，最多取前 `limit` 条，高优先级在前。
    pub fn issues_block(&self, evaluation: &QualityEvaluation, limit: usize) -> String {
        let mut items: Vec<&FeedbackItem> = evaluation.feedback_items.iter().collect();
        items.sort_by_key(|item| match item.priority {
            FeedbackPriority::High => 0,
            FeedbackPriority::Medium => 1,
            FeedbackPriority::Low => 2,
        });

        let mut lines: Vec<String> = items
            .iter()
            .take(limit)
            .map(|item| {
                if item.suggestion.is_empty() {
                    format!("- [{}] {}", item.category, item.issue)
                } else {
                    format!("- [{}] {}（建议：{}）", item.category, item.issue, item.suggestion)
                }
            })
            .collect();
        if lines.is_empty() && !evaluation.overall_feedback.is_empty() {
            lines.push(format!("- {}", evaluation.overall_feedback));
        }
        lines.join("\n")
    }
}

fn summarize(evaluation: &QualityEvaluation) -> String {
    if evaluation.passes {
        return format!("评分{}/10，质量达标，无需修改", evaluation.score);
    }

    if evaluation.feedback_items.is_empty() {
        return format!("评分{}/10，{}", evaluation.score, evaluation.overall_feedback);
    }

    let mut parts = vec![format!("评分{}/10", evaluation.score)];
    for category in CATEGORY_ORDER {
        let count = evaluation
            .feedback_items
            .iter()
            .filter(|item| item.category == category)
            .count();
        if count > 0 {
            parts.push(format!("{}问题{}项", category, count));
        }
    }
    parts.join("，")
}
