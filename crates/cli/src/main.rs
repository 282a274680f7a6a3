use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use storyloom_adapters::{create_chat_adapter, AdapterError};
use storyloom_core::{
    Agents, ApprovalGate, ChatMessage, ChatModel, ChatModelError, ConfigError, ConfigStore,
    Decision, GenerationScope, LogLevel, LogRecord, LogSink, NovelWorkflow, PromptError,
    PromptRegistry, ReviewArtifact, RunResult, SamplingConfig, StdoutLogSink, WorkflowError,
    WorkflowRequest,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let sink = StdoutLogSink::new();

    match cli.command {
        Command::Generate(args) => run_generate(&cli.config, args, &sink),
        Command::Config(command) => match command {
            ConfigCommand::TestLlm(args) => run_test_llm(&cli.config, args, &sink),
        },
    }
}

#[derive(Parser)]
#[command(name = "storyloom", about = "分阶段的长篇小说生成工作流", version)]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 从创作意图出发跑完整个生成流程
    Generate(GenerateArgs),
    /// 配置相关的辅助操作
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 用一条固定消息测试选定的 LLM 档案
    TestLlm(TestLlmArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// 创作意图（一句话的创作指令）
    intent: String,
    /// 使用的 LLM 档案名，缺省取最近使用的档案
    #[arg(long)]
    llm_interface: Option<String>,
    /// 最小章节数
    #[arg(long)]
    min_chapters: Option<u32>,
    /// 卷册数量（分卷模式下生效）
    #[arg(long)]
    volumes: Option<u32>,
    /// 是否先生成分卷总纲
    #[arg(long)]
    master_outline: Option<bool>,
    /// 单章目标字数
    #[arg(long)]
    word_count: Option<u32>,
    /// 每个环节的结构性重试上限
    #[arg(long)]
    max_attempts: Option<u32>,
    /// 整个图执行的步数上限
    #[arg(long)]
    step_limit: Option<usize>,
    /// 产物输出根目录
    #[arg(long)]
    storage_root: Option<PathBuf>,
    /// 在大纲、角色与章节节点暂停等待人工审查
    #[arg(long)]
    interactive: bool,
}

#[derive(Args)]
struct TestLlmArgs {
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    #[error("提示词模板错误: {0}")]
    Prompt(#[from] PromptError),
    #[error("后端适配器错误: {0}")]
    Adapter(#[from] AdapterError),
    #[error("后端调用失败: {0}")]
    Model(#[from] ChatModelError),
    #[error("工作流错误: {0}")]
    Workflow(#[from] WorkflowError),
    #[error("没有可用的 LLM 档案，请先在 {} 中配置 llm_profiles", .0.display())]
    NoLlmProfile(PathBuf),
    #[error("未找到 LLM 档案 `{0}`")]
    UnknownProfile(String),
    #[error("生成失败: {0}")]
    GenerationFailed(String),
}

fn select_llm_interface(
    store: &ConfigStore,
    requested: Option<String>,
) -> Result<String, CliError> {
    if let Some(name) = requested {
        if store.config().get_llm_profile(&name).is_none() {
            return Err(CliError::UnknownProfile(name));
        }
        return Ok(name);
    }
    if let Some(name) = store.last_llm_interface() {
        return Ok(name.to_string());
    }
    store
        .config()
        .primary_llm_profile()
        .map(|(name, _)| name.clone())
        .ok_or_else(|| CliError::NoLlmProfile(store.path().to_path_buf()))
}

fn run_generate(config_path: &Path, args: GenerateArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();

    let selected_llm = select_llm_interface(&store, args.llm_interface.clone())?;
    let prompts =
        PromptRegistry::with_custom_directories(&store.config().prompts.custom_directories)?;
    let adapter = create_chat_adapter(store.config(), &selected_llm)?;

    let generation = &store.config().generation;
    let scope = GenerationScope {
        min_chapters: args.min_chapters.unwrap_or(generation.min_chapters),
        volume_count: args.volumes.unwrap_or(generation.volume_count),
        use_master_outline: args.master_outline.unwrap_or(generation.use_master_outline),
        max_attempts: args.max_attempts.unwrap_or(generation.max_attempts),
    };
    let word_count = args.word_count.unwrap_or(generation.word_count);
    let step_limit = args.step_limit.unwrap_or(generation.step_limit);

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "开始生成：{}（最小章节数 {}，分卷 {}，LLM 接口 {}）",
            args.intent, scope.min_chapters, scope.use_master_outline, selected_llm
        ),
    ));

    let agents = Agents::new(&prompts, &store.config().agents, word_count);
    let gate = StdinApprovalGate;
    let mut workflow = NovelWorkflow::new(&adapter, agents, sink)
        .with_scope(scope)
        .with_step_limit(step_limit);
    if args.interactive {
        workflow = workflow.with_gate(&gate);
    }
    if let Some(root) = &args.storage_root {
        workflow = workflow.with_storage_root(root.clone());
    }

    let mut request = WorkflowRequest::new(args.intent);
    if args.interactive {
        request = request.interactive();
    }
    let state = workflow.run(request)?;

    store.touch_llm_interface(selected_llm);
    store.save()?;

    match state.result {
        Some(RunResult::Complete) => {
            let title = state
                .final_outline
                .as_ref()
                .map(|outline| outline.title.as_str())
                .unwrap_or("（未命名）");
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("《{title}》创作完成，共{}章。", state.final_content.len()),
            ));
            if let Some(storage) = &state.storage {
                sink.log(LogRecord::new(
                    LogLevel::Info,
                    format!("全部产物已保存到 {}", storage.base_dir().display()),
                ));
            }
            Ok(())
        }
        _ => Err(CliError::GenerationFailed(
            state.final_error.unwrap_or_else(|| "未知错误".to_string()),
        )),
    }
}

fn run_test_llm(config_path: &Path, args: TestLlmArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();

    let selected_llm = select_llm_interface(&store, args.llm_interface)?;
    let adapter = create_chat_adapter(store.config(), &selected_llm)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("正在测试 LLM 接口：{selected_llm}"),
    ));

    let messages = [ChatMessage::user("请回复“连接正常”。")];
    let response = adapter.generate(&messages, &SamplingConfig::default())?;
    sink.log(LogRecord::new(LogLevel::Info, format!("模型响应：{response}")));

    store.touch_llm_interface(selected_llm);
    store.save()?;
    Ok(())
}

/// 阻塞读 stdin 的人工审查闸口。修改内容以单独一行的 `.` 结束。
struct StdinApprovalGate;

impl StdinApprovalGate {
    fn read_edited_content(&self) -> Option<String> {
        println!("请粘贴修改后的JSON内容，以单独一行的 . 结束：");
        let stdin = io::stdin();
        let mut lines = Vec::new();
        for line in stdin.lock().lines() {
            let line = line.ok()?;
            if line.trim() == "." {
                break;
            }
            lines.push(line);
        }
        Some(lines.join("\n"))
    }
}

impl ApprovalGate for StdinApprovalGate {
    fn request_approval(&self, artifact: ReviewArtifact<'_>) -> Decision {
        match &artifact {
            ReviewArtifact::Outline(outline) => {
                println!(
                    "=== 待审查{}：《{}》，共{}章 ===",
                    artifact.label(),
                    outline.title,
                    outline.chapters.len()
                );
                println!("{}", outline.plot_summary);
            }
            ReviewArtifact::Characters(characters) => {
                println!("=== 待审查{}：共{}人 ===", artifact.label(), characters.len());
                for character in characters.iter() {
                    println!("- {}：{}", character.name, character.personality);
                }
            }
            ReviewArtifact::Chapter { number, chapter } => {
                println!("=== 待审查{}：第{}章《{}》 ===", artifact.label(), number, chapter.title);
                println!("{}", chapter.content);
            }
        }

        loop {
            print!("[y]通过 / [e]修改 / [r]重新生成 / [q]终止 > ");
            let _ = io::stdout().flush();
            let mut input = String::new();
            if io::stdin().read_line(&mut input).is_err() {
                return Decision::Approve;
            }
            match input.trim() {
                "y" | "Y" | "" => return Decision::Approve,
                "e" | "E" => {
                    if let Some(content) = self.read_edited_content() {
                        return Decision::Edit(content);
                    }
                    return Decision::Approve;
                }
                "r" | "R" => return Decision::Regenerate,
                "q" | "Q" => return Decision::Abort,
                other => println!("无法识别的输入：{other}"),
            }
        }
    }
}
