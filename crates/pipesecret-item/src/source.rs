use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("item {0:?} not found")]
    NotFound(String),
    /// The credential manager itself could not be run.
    #[error("item source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to get item: {0}")]
    Execution(String),
}

/// Resolves an item name to its raw JSON document.
pub trait ItemSource: Send + Sync {
    fn get_item(&self, name: &str) -> impl Future<Output = Result<String, ItemError>> + Send;
}
