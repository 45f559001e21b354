//! In-memory forum server.
//!
//! Backs the `simulate` command and the tests. Failures can be scripted per
//! operation and every call is counted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::debug;

use super::model::{
    Article, ArticleSummary, Author, Comment, CommentPage, Credentials, LikeState,
    PasswordUpdate, ProfileUpdate, UserProfile,
};
use super::transport::{ForumTransport, TransportError};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "forum::memory";
const MAX_NICKNAME_CHARS: usize = 10;
const MIN_PASSWORD_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForumOp {
    FetchLike,
    CreateLike,
    DeleteLike,
    FetchArticle,
    FetchArticles,
    FetchComments,
    FetchComment,
    CreateComment,
    UpdateComment,
    DeleteComment,
    Login,
    Logout,
    FetchUser,
    UpdateUser,
    UpdatePassword,
    DeleteUser,
}

struct ArticleRecord {
    article: Article,
    liked: bool,
    /// Newest first.
    comments: Vec<Comment>,
}

impl ArticleRecord {
    fn snapshot(&self) -> Article {
        Article {
            comment_count: self.comments.len() as u64,
            ..self.article.clone()
        }
    }

    fn like_state(&self) -> LikeState {
        LikeState {
            is_liked: self.liked,
            like_count: self.article.like_count,
        }
    }
}

struct ForumState {
    articles: BTreeMap<String, ArticleRecord>,
    account: Option<UserProfile>,
    password: String,
    signed_in: bool,
    next_comment: u64,
}

impl ForumState {
    fn record(&self, article_id: &str) -> Result<&ArticleRecord, TransportError> {
        self.articles
            .get(article_id)
            .ok_or_else(|| TransportError::network(format!("article `{article_id}` not found")))
    }

    fn record_mut(&mut self, article_id: &str) -> Result<&mut ArticleRecord, TransportError> {
        self.articles
            .get_mut(article_id)
            .ok_or_else(|| TransportError::network(format!("article `{article_id}` not found")))
    }

    fn session(&self) -> Result<&UserProfile, TransportError> {
        self.account
            .as_ref()
            .filter(|_| self.signed_in)
            .ok_or_else(|| TransportError::network("not signed in"))
    }

    fn session_mut(&mut self) -> Result<&mut UserProfile, TransportError> {
        if !self.signed_in {
            return Err(TransportError::network("not signed in"));
        }
        self.account
            .as_mut()
            .ok_or_else(|| TransportError::network("not signed in"))
    }

    fn viewer(&self) -> Result<Author, TransportError> {
        self.session().map(|user| Author {
            user_id: user.user_id.clone(),
            nickname: user.nickname.clone(),
            image: user.image.clone(),
        })
    }
}

pub struct InMemoryForum {
    state: Mutex<ForumState>,
    failures: Mutex<HashMap<ForumOp, VecDeque<TransportError>>>,
    calls: DashMap<ForumOp, usize>,
    latency: Duration,
}

impl Default for InMemoryForum {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryForum {
    /// A forum with one account, signed in, and no articles. The account
    /// logs in as `reader@example.com` / `correct-horse`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ForumState {
                articles: BTreeMap::new(),
                account: Some(UserProfile {
                    user_id: "u1".to_string(),
                    email: "reader@example.com".to_string(),
                    nickname: "reader".to_string(),
                    image: None,
                }),
                password: "correct-horse".to_string(),
                signed_in: true,
                next_comment: 1,
            }),
            failures: Mutex::new(HashMap::new()),
            calls: DashMap::new(),
            latency: Duration::ZERO,
        }
    }

    /// Article `a1` with three likes and nine comments, plus article `a2`.
    pub fn seeded() -> Self {
        let forum = Self::new();
        forum.add_article("a1", "Welcome to the forum", 3, false);
        forum.add_comments("a1", 9);
        forum.add_article("a2", "Posting guidelines", 12, true);
        forum
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn add_article(&self, id: &str, title: &str, like_count: u64, liked: bool) {
        let mut state = mutex_lock(&self.state, SOURCE, "add_article");
        let author = Author {
            user_id: "u0".to_string(),
            nickname: "admin".to_string(),
            image: None,
        };
        state.articles.insert(
            id.to_string(),
            ArticleRecord {
                article: Article {
                    id: id.to_string(),
                    title: title.to_string(),
                    content: format!("Body of {title}"),
                    author,
                    like_count,
                    comment_count: 0,
                    view_count: 0,
                    created_at: OffsetDateTime::now_utc(),
                },
                liked,
                comments: Vec::new(),
            },
        );
    }

    /// Append `count` older comments to an existing article.
    pub fn add_comments(&self, article_id: &str, count: usize) {
        let mut state = mutex_lock(&self.state, SOURCE, "add_comments");
        let first = state.next_comment;
        state.next_comment += count as u64;
        let Some(record) = state.articles.get_mut(article_id) else {
            return;
        };
        for n in first..first + count as u64 {
            record.comments.insert(
                0,
                Comment {
                    id: format!("c{n}"),
                    article_id: article_id.to_string(),
                    content: format!("Comment number {n}"),
                    author: Author {
                        user_id: "u2".to_string(),
                        nickname: "regular".to_string(),
                        image: None,
                    },
                    created_at: OffsetDateTime::now_utc(),
                },
            );
        }
    }

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: ForumOp, error: TransportError) {
        mutex_lock(&self.failures, SOURCE, "fail_next")
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self, op: ForumOp) -> usize {
        self.calls.get(&op).map_or(0, |count| *count)
    }

    /// Server-side article as the next fetch would return it.
    pub fn article(&self, article_id: &str) -> Option<Article> {
        let state = mutex_lock(&self.state, SOURCE, "article");
        state.articles.get(article_id).map(ArticleRecord::snapshot)
    }

    pub fn like_state(&self, article_id: &str) -> Option<LikeState> {
        let state = mutex_lock(&self.state, SOURCE, "like_state");
        state.articles.get(article_id).map(ArticleRecord::like_state)
    }

    async fn begin(&self, op: ForumOp) -> Result<(), TransportError> {
        *self.calls.entry(op).or_default() += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = mutex_lock(&self.failures, SOURCE, "begin")
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => {
                debug!(?op, %error, "Scripted transport failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ForumTransport for InMemoryForum {
    async fn fetch_like(&self, article_id: &str) -> Result<LikeState, TransportError> {
        self.begin(ForumOp::FetchLike).await?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_like");
        Ok(state.record(article_id)?.like_state())
    }

    async fn create_like(&self, article_id: &str) -> Result<LikeState, TransportError> {
        self.begin(ForumOp::CreateLike).await?;
        let mut state = mutex_lock(&self.state, SOURCE, "create_like");
        let record = state.record_mut(article_id)?;
        if record.liked {
            return Err(TransportError::validation("article_id", "already liked"));
        }
        record.liked = true;
        record.article.like_count += 1;
        Ok(record.like_state())
    }

    async fn delete_like(&self, article_id: &str) -> Result<LikeState, TransportError> {
        self.begin(ForumOp::DeleteLike).await?;
        let mut state = mutex_lock(&self.state, SOURCE, "delete_like");
        let record = state.record_mut(article_id)?;
        if !record.liked {
            return Err(TransportError::validation("article_id", "not liked"));
        }
        record.liked = false;
        record.article.like_count = record.article.like_count.saturating_sub(1);
        Ok(record.like_state())
    }

    async fn fetch_article(&self, article_id: &str) -> Result<Article, TransportError> {
        self.begin(ForumOp::FetchArticle).await?;
        let mut state = mutex_lock(&self.state, SOURCE, "fetch_article");
        let record = state.record_mut(article_id)?;
        record.article.view_count += 1;
        Ok(record.snapshot())
    }

    async fn fetch_articles(&self) -> Result<Vec<ArticleSummary>, TransportError> {
        self.begin(ForumOp::FetchArticles).await?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_articles");
        Ok(state
            .articles
            .values()
            .map(|record| ArticleSummary {
                id: record.article.id.clone(),
                title: record.article.title.clone(),
                author_nickname: record.article.author.nickname.clone(),
                like_count: record.article.like_count,
                comment_count: record.comments.len() as u64,
            })
            .collect())
    }

    async fn fetch_comments(
        &self,
        article_id: &str,
        page: u32,
        size: u32,
    ) -> Result<CommentPage, TransportError> {
        self.begin(ForumOp::FetchComments).await?;
        if page == 0 || size == 0 {
            return Err(TransportError::validation("page", "page and size start at 1"));
        }
        let state = mutex_lock(&self.state, SOURCE, "fetch_comments");
        let record = state.record(article_id)?;
        let size = size as usize;
        let start = (page as usize - 1) * size;
        Ok(CommentPage {
            page,
            comments: record.comments.iter().skip(start).take(size).cloned().collect(),
            has_next: record.comments.len() > start + size,
        })
    }

    async fn fetch_comment(
        &self,
        article_id: &str,
        comment_id: &str,
    ) -> Result<Comment, TransportError> {
        self.begin(ForumOp::FetchComment).await?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_comment");
        state
            .record(article_id)?
            .comments
            .iter()
            .find(|comment| comment.id == comment_id)
            .cloned()
            .ok_or_else(|| TransportError::network(format!("comment `{comment_id}` not found")))
    }

    async fn create_comment(
        &self,
        article_id: &str,
        content: &str,
    ) -> Result<Comment, TransportError> {
        self.begin(ForumOp::CreateComment).await?;
        if content.trim().is_empty() {
            return Err(TransportError::validation("content", "comment is empty"));
        }
        let mut state = mutex_lock(&self.state, SOURCE, "create_comment");
        let author = state.viewer()?;
        let id = format!("c{}", state.next_comment);
        state.next_comment += 1;
        let comment = Comment {
            id,
            article_id: article_id.to_string(),
            content: content.to_string(),
            author,
            created_at: OffsetDateTime::now_utc(),
        };
        state
            .record_mut(article_id)?
            .comments
            .insert(0, comment.clone());
        Ok(comment)
    }

    async fn update_comment(
        &self,
        article_id: &str,
        comment_id: &str,
        content: &str,
    ) -> Result<Comment, TransportError> {
        self.begin(ForumOp::UpdateComment).await?;
        if content.trim().is_empty() {
            return Err(TransportError::validation("content", "comment is empty"));
        }
        let mut state = mutex_lock(&self.state, SOURCE, "update_comment");
        let comment = state
            .record_mut(article_id)?
            .comments
            .iter_mut()
            .find(|comment| comment.id == comment_id)
            .ok_or_else(|| TransportError::network(format!("comment `{comment_id}` not found")))?;
        comment.content = content.to_string();
        Ok(comment.clone())
    }

    async fn delete_comment(
        &self,
        article_id: &str,
        comment_id: &str,
    ) -> Result<(), TransportError> {
        self.begin(ForumOp::DeleteComment).await?;
        let mut state = mutex_lock(&self.state, SOURCE, "delete_comment");
        let comments = &mut state.record_mut(article_id)?.comments;
        let before = comments.len();
        comments.retain(|comment| comment.id != comment_id);
        if comments.len() == before {
            return Err(TransportError::network(format!(
                "comment `{comment_id}` not found"
            )));
        }
        Ok(())
    }

    async fn login(&self, credentials: &Credentials) -> Result<(), TransportError> {
        self.begin(ForumOp::Login).await?;
        let mut state = mutex_lock(&self.state, SOURCE, "login");
        let known = state
            .account
            .as_ref()
            .is_some_and(|user| user.email == credentials.email);
        if !known || state.password != credentials.password {
            return Err(TransportError::validation(
                "email",
                "email or password does not match",
            ));
        }
        state.signed_in = true;
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.begin(ForumOp::Logout).await?;
        let mut state = mutex_lock(&self.state, SOURCE, "logout");
        state.session()?;
        state.signed_in = false;
        Ok(())
    }

    async fn fetch_user(&self) -> Result<UserProfile, TransportError> {
        self.begin(ForumOp::FetchUser).await?;
        let state = mutex_lock(&self.state, SOURCE, "fetch_user");
        state.session().cloned()
    }

    async fn update_user(&self, update: &ProfileUpdate) -> Result<UserProfile, TransportError> {
        self.begin(ForumOp::UpdateUser).await?;
        let nickname = update.nickname.trim();
        if nickname.is_empty() {
            return Err(TransportError::validation("nickname", "nickname is required"));
        }
        if nickname.chars().count() > MAX_NICKNAME_CHARS {
            return Err(TransportError::validation(
                "nickname",
                format!("nickname is longer than {MAX_NICKNAME_CHARS} characters"),
            ));
        }
        let mut state = mutex_lock(&self.state, SOURCE, "update_user");
        let user = state.session_mut()?;
        *user = user.with_update(update);
        Ok(user.clone())
    }

    async fn update_password(&self, update: &PasswordUpdate) -> Result<(), TransportError> {
        self.begin(ForumOp::UpdatePassword).await?;
        if update.password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(TransportError::validation(
                "password",
                format!("password needs at least {MIN_PASSWORD_CHARS} characters"),
            ));
        }
        if update.password != update.password_confirm {
            return Err(TransportError::validation(
                "password_confirm",
                "passwords do not match",
            ));
        }
        let mut state = mutex_lock(&self.state, SOURCE, "update_password");
        state.session()?;
        state.password = update.password.clone();
        Ok(())
    }

    async fn delete_user(&self) -> Result<(), TransportError> {
        self.begin(ForumOp::DeleteUser).await?;
        let mut state = mutex_lock(&self.state, SOURCE, "delete_user");
        state.session()?;
        state.account = None;
        state.signed_in = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_comments_newest_first() {
        let forum = InMemoryForum::seeded();

        let first = forum.fetch_comments("a1", 1, 7).await.expect("page 1");
        let second = forum.fetch_comments("a1", 2, 7).await.expect("page 2");

        assert_eq!(first.comments.len(), 7);
        assert!(first.has_next);
        assert_eq!(first.comments[0].id, "c9");
        assert_eq!(second.comments.len(), 2);
        assert!(!second.has_next);
        assert_eq!(forum.calls(ForumOp::FetchComments), 2);
    }

    #[tokio::test]
    async fn scripted_failures_apply_once_in_order() {
        let forum = InMemoryForum::seeded();
        forum.fail_next(ForumOp::CreateLike, TransportError::network("timeout"));

        let failed = forum.create_like("a1").await;
        assert_eq!(failed, Err(TransportError::network("timeout")));
        assert_eq!(forum.like_state("a1").map(|l| l.like_count), Some(3));

        let liked = forum.create_like("a1").await.expect("second attempt");
        assert_eq!(
            liked,
            LikeState {
                is_liked: true,
                like_count: 4
            }
        );
        assert_eq!(forum.calls(ForumOp::CreateLike), 2);
    }

    #[tokio::test]
    async fn rejects_invalid_payloads() {
        let forum = InMemoryForum::seeded();

        let empty = forum.create_comment("a1", "   ").await;
        assert!(matches!(
            empty,
            Err(TransportError::Validation { ref field, .. }) if field == "content"
        ));

        let mismatch = forum
            .update_password(&PasswordUpdate {
                password: "long-enough".to_string(),
                password_confirm: "different!".to_string(),
            })
            .await;
        assert!(matches!(
            mismatch,
            Err(TransportError::Validation { ref field, .. }) if field == "password_confirm"
        ));
    }

    #[tokio::test]
    async fn session_gates_account_calls() {
        let forum = InMemoryForum::new();
        forum.logout().await.expect("signed out");
        assert!(forum.fetch_user().await.is_err());
        assert!(forum.logout().await.is_err());

        let wrong = Credentials::new("reader@example.com", "battery-staple");
        assert!(matches!(
            forum.login(&wrong).await,
            Err(TransportError::Validation { .. })
        ));

        let right = Credentials::new("reader@example.com", "correct-horse");
        forum.login(&right).await.expect("signed in");
        let user = forum.fetch_user().await.expect("profile");
        assert_eq!(user.nickname, "reader");

        forum.delete_user().await.expect("deleted");
        assert!(forum.login(&right).await.is_err());
        assert_eq!(forum.calls(ForumOp::Login), 3);
    }

    #[tokio::test]
    async fn created_comments_count_toward_the_article() {
        let forum = InMemoryForum::seeded();
        let comment = forum.create_comment("a1", "hello").await.expect("created");

        assert_eq!(comment.author.nickname, "reader");
        assert_eq!(forum.article("a1").map(|a| a.comment_count), Some(10));

        forum
            .delete_comment("a1", &comment.id)
            .await
            .expect("deleted");
        assert_eq!(forum.article("a1").map(|a| a.comment_count), Some(9));
    }
}
