use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use storyloom_core::{
    AgentProfiles, Agents, ApprovalGate, ChatMessage, ChatModel, ChatModelError, Decision,
    GenerationScope, LogLevel, NovelWorkflow, PromptRegistry, ReviewArtifact, RunResult,
    SamplingConfig, VecLogSink, WorkflowError, WorkflowRequest,
};
use tempfile::tempdir;

#[derive(Debug)]
struct MockChatModel {
    responses: Mutex<VecDeque<String>>,
}

impl MockChatModel {
    fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    fn assert_empty(&self) {
        let guard = self.responses.lock().expect("mock mutex poisoned");
        assert!(
            guard.is_empty(),
            "expected all mock responses to be consumed, {} left",
            guard.len()
        );
    }
}

impl ChatModel for MockChatModel {
    fn generate(
        &self,
        _messages: &[ChatMessage],
        _sampling: &SamplingConfig,
    ) -> Result<String, ChatModelError> {
        let mut guard = self.responses.lock().expect("mock mutex poisoned");
        guard.pop_front().ok_or_else(|| {
            ChatModelError::new(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mock chat model has no remaining responses",
            ))
        })
    }
}

fn outline_json(chapters: usize) -> String {
    let entries: Vec<String> = (1..=chapters)
        .map(|number| {
            format!(
                r#"{{"title": "第{number}章", "summary": "第{number}章摘要", "key_events": ["事件{number}"], "characters_involved": ["林昭"], "setting": "雾港"}}"#
            )
        })
        .collect();
    format!(
        r#"```json
{{"title": "雾港十二时", "genre": "悬疑", "theme": "记忆", "setting": "海边小城", "plot_summary": "一桩旧案重新浮出水面", "chapters": [{}], "characters": ["林昭", "沈未"]}}
```"#,
        entries.join(", ")
    )
}

fn characters_json() -> &'static str {
    r#"[
        {"name": "林昭", "background": "退休刑警", "personality": "冷静", "goals": ["查明真相"], "conflicts": ["旧日愧疚"], "arc": "与过去和解"},
        {"name": "沈未", "background": "旧书店店主", "personality": "隐忍", "goals": ["守住秘密"], "conflicts": ["被迫摊牌"], "arc": "走向坦白"}
    ]"#
}

fn chapter_json(number: usize) -> String {
    format!(
        r#"{{"title": "第{number}章", "content": "第{number}章正文，今晚的雾比往常更重。", "notes": ""}}"#
    )
}

fn eval_pass() -> &'static str {
    r#"{"score": 8, "passes": true, "length_check": true, "overall_feedback": "", "feedback_items": []}"#
}

fn eval_fail() -> &'static str {
    r#"{"score": 5, "passes": false, "length_check": true, "overall_feedback": "情节仓促", "feedback_items": [{"category": "plot", "priority": "high", "issue": "转折突兀", "suggestion": "补足铺垫"}]}"#
}

fn entities_json() -> &'static str {
    r#"{"characters": ["林昭"], "locations": ["旧书店"], "items": [], "facts": ["信件已被烧毁"]}"#
}

fn flat_scope(min_chapters: u32, max_attempts: u32) -> GenerationScope {
    GenerationScope {
        min_chapters,
        volume_count: 1,
        use_master_outline: false,
        max_attempts,
    }
}

#[test]
fn happy_path_produces_five_persisted_chapters() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    let mut responses = vec![outline_json(5), characters_json().to_string()];
    for number in 1..=5 {
        responses.push(chapter_json(number));
        responses.push(eval_pass().to_string());
        responses.push(entities_json().to_string());
    }
    let mock = MockChatModel::new(responses);

    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(flat_scope(5, 3))
        .with_storage_root(temp.path());

    let state = workflow
        .run(WorkflowRequest::new("一部五章的悬疑小说"))
        .expect("workflow should complete");

    assert_eq!(state.result, Some(RunResult::Complete));
    assert!(state.final_error.is_none());
    assert_eq!(state.final_content.len(), 5);
    assert_eq!(state.final_outline.as_ref().unwrap().chapters.len(), 5);
    assert_eq!(state.final_characters.as_ref().unwrap().len(), 2);
    assert_eq!(state.attempt, 0);
    assert_eq!(state.evaluate_attempt, 0);

    let storage_dir = temp.path().join("雾港十二时_storage");
    for number in 1..=5 {
        assert!(storage_dir
            .join("chapters_json")
            .join(format!("{number:03}.json"))
            .exists());
        assert!(storage_dir
            .join("entities")
            .join(format!("{number:03}.json"))
            .exists());
    }

    mock.assert_empty();
}

#[test]
fn malformed_outline_is_repaired_on_retry() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    let broken = "{\n  \"title\": \"雾港十二时\",\n  \"genre\": 悬疑\n}";
    let mock = MockChatModel::new([
        broken.to_string(),
        outline_json(1),
        characters_json().to_string(),
        chapter_json(1),
        eval_pass().to_string(),
        entities_json().to_string(),
    ]);

    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(flat_scope(1, 3))
        .with_storage_root(temp.path());

    let state = workflow
        .run(WorkflowRequest::new("单章测试"))
        .expect("second attempt should repair the outline");

    assert_eq!(state.result, Some(RunResult::Complete));
    assert_eq!(state.attempt, 0);
    assert!(state.outline_error.is_none());

    // 第一次失败的诊断要带行列定位和检查清单
    let warned = sink
        .records()
        .into_iter()
        .find(|record| record.level == LogLevel::Warn && record.message.contains("JSON解析错误"))
        .expect("diagnostic logged for the first attempt");
    assert!(warned.message.contains("在第"));
    assert!(warned.message.contains("请检查括号是否匹配"));

    mock.assert_empty();
}

#[test]
fn missing_character_fails_run_and_names_the_gap() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    // 角色档案只给了林昭，缺沈未；max_attempts = 1 直接进失败汇聚
    let only_one = r#"[{"name": "林昭", "background": "退休刑警", "personality": "冷静", "goals": [], "conflicts": [], "arc": "与过去和解"}]"#;
    let mock = MockChatModel::new([outline_json(1), only_one.to_string()]);

    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(flat_scope(1, 1))
        .with_storage_root(temp.path());

    let state = workflow
        .run(WorkflowRequest::new("缺角色测试"))
        .expect("failure is a terminal state, not an engine error");

    assert_eq!(state.result, Some(RunResult::Failed));
    let error = state.final_error.expect("failure sink reports first error");
    assert!(error.contains("沈未"));
    assert!(error.contains("未生成详细档案"));

    mock.assert_empty();
}

#[test]
fn exhausted_quality_budget_forces_acceptance() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    // 评估永远不通过：第一次 revise（消耗 evaluate_attempt），第二次
    // 预算耗尽强制接受，实体识别被跳过
    let mock = MockChatModel::new([
        outline_json(1),
        characters_json().to_string(),
        chapter_json(1),
        eval_fail().to_string(),
        chapter_json(1),
        eval_fail().to_string(),
    ]);

    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(flat_scope(1, 1))
        .with_storage_root(temp.path());

    let state = workflow
        .run(WorkflowRequest::new("强制接受测试"))
        .expect("forced acceptance keeps the run alive");

    assert_eq!(state.result, Some(RunResult::Complete));
    assert_eq!(state.final_content.len(), 1);
    assert_eq!(state.evaluate_attempt, 0);

    let storage_dir = temp.path().join("雾港十二时_storage");
    assert!(storage_dir.join("chapters_json").join("001.json").exists());
    assert!(!storage_dir.join("entities").join("001.json").exists());

    mock.assert_empty();
}

#[test]
fn volumed_outline_is_assembled_across_volumes() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    let master = r#"```json
{"title": "雾港十二时", "genre": "悬疑", "theme": "记忆", "setting": "海边小城", "plot_summary": "一桩旧案重新浮出水面", "master_outline": [
  {"title": "上卷", "chapters_range": "1-1", "theme": "起", "key_turning_points": ["信件出现"]},
  {"title": "下卷", "chapters_range": "2-2", "theme": "合", "key_turning_points": ["真相大白"]}
], "chapters": [], "characters": ["林昭", "沈未"]}
```"#;
    let volume = |number: usize| {
        format!(
            r#"{{"chapters": [{{"title": "第{number}章", "summary": "第{number}章摘要", "key_events": ["事件{number}"], "characters_involved": ["林昭"], "setting": "雾港"}}]}}"#
        )
    };

    let mock = MockChatModel::new([
        master.to_string(),
        volume(1),
        volume(2),
        characters_json().to_string(),
        chapter_json(1),
        eval_pass().to_string(),
        entities_json().to_string(),
        chapter_json(2),
        eval_pass().to_string(),
        entities_json().to_string(),
    ]);

    let scope = GenerationScope {
        min_chapters: 2,
        volume_count: 2,
        use_master_outline: true,
        max_attempts: 3,
    };
    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(scope)
        .with_storage_root(temp.path());

    let state = workflow
        .run(WorkflowRequest::new("分卷测试"))
        .expect("volumed run should complete");

    assert_eq!(state.result, Some(RunResult::Complete));
    let outline = state.final_outline.unwrap();
    assert_eq!(outline.master_outline.len(), 2);
    assert_eq!(outline.chapters.len(), 2);
    assert_eq!(outline.chapters[0].title, "第1章");
    assert_eq!(outline.chapters[1].title, "第2章");
    assert_eq!(state.final_content.len(), 2);

    mock.assert_empty();
}

#[test]
fn step_limit_cuts_off_pathological_cycles() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    let mock = MockChatModel::new([outline_json(1), characters_json().to_string()]);
    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(flat_scope(1, 3))
        .with_storage_root(temp.path())
        .with_step_limit(2);

    let err = workflow
        .run(WorkflowRequest::new("步数上限测试"))
        .expect_err("step limit should abort the run");
    assert!(matches!(err, WorkflowError::StepLimit { limit: 2 }));
}

struct ScriptedGate {
    decisions: Mutex<VecDeque<Decision>>,
}

impl ScriptedGate {
    fn new<I: IntoIterator<Item = Decision>>(decisions: I) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
        }
    }
}

impl ApprovalGate for ScriptedGate {
    fn request_approval(&self, _artifact: ReviewArtifact<'_>) -> Decision {
        self.decisions
            .lock()
            .expect("gate mutex poisoned")
            .pop_front()
            .unwrap_or(Decision::Approve)
    }
}

#[test]
fn reviewer_can_force_outline_regeneration() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    let mock = MockChatModel::new([
        outline_json(1),
        outline_json(1),
        characters_json().to_string(),
        chapter_json(1),
        eval_pass().to_string(),
        entities_json().to_string(),
    ]);
    let gate = ScriptedGate::new([Decision::Regenerate]);

    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(flat_scope(1, 3))
        .with_storage_root(temp.path())
        .with_gate(&gate);

    let state = workflow
        .run(WorkflowRequest::new("人工重做测试").interactive())
        .expect("run completes after regeneration");

    assert_eq!(state.result, Some(RunResult::Complete));
    mock.assert_empty();
}

#[test]
fn reviewer_abort_halts_the_run() {
    let temp = tempdir().unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    let mock = MockChatModel::new([outline_json(1)]);
    let gate = ScriptedGate::new([Decision::Abort]);

    let agents = Agents::new(&prompts, &AgentProfiles::default(), 100);
    let workflow = NovelWorkflow::new(&mock, agents, &sink)
        .with_scope(flat_scope(1, 3))
        .with_storage_root(temp.path())
        .with_gate(&gate);

    let err = workflow
        .run(WorkflowRequest::new("人工终止测试").interactive())
        .expect_err("abort surfaces as an engine error");
    assert!(matches!(err, WorkflowError::Aborted { .. }));
}
