use crate::schema::{Character, ChapterContent, NovelOutline};

/// 提交人工审查的产物视图。
#[derive(Clone, Copy, Debug)]
pub enum ReviewArtifact<'a> {
    Outline(&'a NovelOutline),
    Characters(&'a [Character]),
    Chapter {
        number: usize,
        chapter: &'a ChapterContent,
    },
}

impl ReviewArtifact<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Outline(_) => "大纲",
            Self::Characters(_) => "角色档案",
            Self::Chapter { .. } => "章节",
        }
    }
}

/// 人工审查的裁决。`Edit` 携带替换后的 JSON 文本，会重新走对应的
/// 验证流程；`Abort` 终止整个流程且不再落盘。
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Approve,
    Edit(String),
    Regenerate,
    Abort,
}

/// 人工审查闸口。CLI 给出阻塞读 stdin 的实现，非交互部署用
/// [`AutoApprove`] 直接放行。
pub trait ApprovalGate: Send + Sync {
    fn request_approval(&self, artifact: ReviewArtifact<'_>) -> Decision;
}

#[derive(Default)]
pub struct AutoApprove;

impl ApprovalGate for AutoApprove {
    fn request_approval(&self, _artifact: ReviewArtifact<'_>) -> Decision {
        Decision::Approve
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_gate_always_approves() {
        let outline = NovelOutline {
            title: "雾港".into(),
            genre: "悬疑".into(),
            theme: "记忆".into(),
            setting: "海边".into(),
            plot_summary: "旧案".into(),
            master_outline: Vec::new(),
            chapters: Vec::new(),
            characters: Vec::new(),
        };
        let gate = AutoApprove;
        assert_eq!(
            gate.request_approval(ReviewArtifact::Outline(&outline)),
            Decision::Approve
        );
    }
}
