use async_trait::async_trait;
use reorg_plugin::{CategorizeResult, ExtractedTask, ProjectContext};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AiError {
    #[error("no AI provider configured")]
    Unconfigured,

    #[error("AI request failed: {0}")]
    Failed(String),
}

/// The AI collaborator behind `categorizeWithContext` and `extractTasks`.
#[async_trait]
pub trait Categorizer: Send + Sync {
    /// Picks an area and an existing or new project for `content`.
    async fn categorize_with_context(
        &self,
        content: &str,
        existing_projects: &[ProjectContext],
    ) -> Result<CategorizeResult, AiError>;

    async fn extract_tasks(&self, content: &str) -> Result<Vec<ExtractedTask>, AiError>;
}

/// Stand-in used when no provider is configured: categorization is
/// unavailable and no tasks are ever extracted.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

#[async_trait]
impl Categorizer for Unconfigured {
    async fn categorize_with_context(
        &self,
        _content: &str,
        _existing_projects: &[ProjectContext],
    ) -> Result<CategorizeResult, AiError> {
        Err(AiError::Unconfigured)
    }

    async fn extract_tasks(&self, _content: &str) -> Result<Vec<ExtractedTask>, AiError> {
        Ok(Vec::new())
    }
}
