pub mod agents;
pub mod config;
pub mod extract;
pub mod feedback;
pub mod gate;
pub mod llm;
pub mod logging;
pub mod prompts;
pub mod schema;
pub mod state;
pub mod storage;
pub mod validate;
pub mod workflow;

pub use agents::{AgentError, CharacterAgent, EntityAgent, OutlineAgent, ReflectAgent, WriterAgent};
pub use config::{
    AgentProfiles, Config, ConfigError, ConfigStore, GenerationConfig, LlmConfig, PromptConfig,
    RecentUsage,
};
pub use extract::{extract_json, json_error_context};
pub use feedback::{ProcessedFeedback, RevisionStrategy};
pub use gate::{ApprovalGate, AutoApprove, Decision, ReviewArtifact};
pub use llm::{ChatMessage, ChatModel, ChatModelError, Role, SamplingConfig};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink, VecLogSink,
};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptTemplate};
pub use schema::{
    parse_chapter_range, ChapterContent, ChapterOutline, Character, EntityRecord, FeedbackCategory,
    FeedbackItem, FeedbackPriority, NovelOutline, QualityEvaluation, RangeError, VolumeOutline,
};
pub use state::{GenerationScope, GenerationState, RunResult, StatePatch, Update};
pub use storage::{sanitize_title, NovelStorage, StorageError};
pub use validate::{
    validate_chapter, validate_characters, validate_entities, validate_evaluation,
    validate_master_outline, validate_outline, validate_volume_chapters, ValidationError,
};
pub use workflow::{
    triad_verdict, Agents, NovelWorkflow, Stage, StepObserver, Topology, Verdict, WorkflowError,
    WorkflowRequest,
};
