pub mod github;
pub mod instruction;
pub mod llm;

pub use github::GitHubWorker;
pub use llm::{LlmAnalyst, LlmJudge, LlmReviewer, OllamaChat};
