//! Transport seam between the forum bindings and the server.

use async_trait::async_trait;
use thiserror::Error;

use super::model::{
    Article, ArticleSummary, Comment, CommentPage, Credentials, LikeState, PasswordUpdate,
    ProfileUpdate, UserProfile,
};

/// Failure reported by a transport call. Cloneable so every reader joined on
/// one fetch receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request never reached the server, or the server reported a fault.
    #[error("network failure: {0}")]
    Network(String),
    /// The server rejected the payload.
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ForumTransport: Send + Sync {
    async fn fetch_like(&self, article_id: &str) -> Result<LikeState, TransportError>;

    async fn create_like(&self, article_id: &str) -> Result<LikeState, TransportError>;

    async fn delete_like(&self, article_id: &str) -> Result<LikeState, TransportError>;

    async fn fetch_article(&self, article_id: &str) -> Result<Article, TransportError>;

    async fn fetch_articles(&self) -> Result<Vec<ArticleSummary>, TransportError>;

    /// One page of an article's comments, newest first. `page` is one-based.
    async fn fetch_comments(
        &self,
        article_id: &str,
        page: u32,
        size: u32,
    ) -> Result<CommentPage, TransportError>;

    async fn fetch_comment(
        &self,
        article_id: &str,
        comment_id: &str,
    ) -> Result<Comment, TransportError>;

    async fn create_comment(
        &self,
        article_id: &str,
        content: &str,
    ) -> Result<Comment, TransportError>;

    async fn update_comment(
        &self,
        article_id: &str,
        comment_id: &str,
        content: &str,
    ) -> Result<Comment, TransportError>;

    async fn delete_comment(&self, article_id: &str, comment_id: &str)
    -> Result<(), TransportError>;

    /// Start a session. Later account calls act as the signed-in user.
    async fn login(&self, credentials: &Credentials) -> Result<(), TransportError>;

    async fn logout(&self) -> Result<(), TransportError>;

    async fn fetch_user(&self) -> Result<UserProfile, TransportError>;

    async fn update_user(&self, update: &ProfileUpdate) -> Result<UserProfile, TransportError>;

    async fn update_password(&self, update: &PasswordUpdate) -> Result<(), TransportError>;

    async fn delete_user(&self) -> Result<(), TransportError>;
}
