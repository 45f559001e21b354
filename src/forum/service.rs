//! Forum feature calls on top of the query client.
//!
//! Reads go through the fetcher so concurrent views of one key share a
//! request. Mutations carry their optimistic writes and resolve their
//! invalidation keys from the graph, then publish a notice on settlement.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use super::keys;
use super::model::{
    Article, ArticleSummary, Comment, CommentFeed, Credentials, ForumData, LikeState,
    PasswordUpdate, ProfileUpdate, UserProfile,
};
use super::transport::{ForumTransport, TransportError};
use crate::cache::{CacheKey, Mutation, QueryClient, TemplateError};

/// Comments per page, as the server pages them.
pub const COMMENT_PAGE_SIZE: u32 = 7;

pub type ForumClient = QueryClient<ForumData, TransportError>;

#[derive(Debug, Error)]
pub enum ForumError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("cached `{key}` holds {found} data, expected {expected}")]
    UnexpectedKind {
        key: CacheKey,
        expected: &'static str,
        found: &'static str,
    },
}

impl ForumError {
    /// The transport failure behind this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Forum {
    client: ForumClient,
    transport: Arc<dyn ForumTransport>,
}

impl Forum {
    pub fn new(client: ForumClient, transport: Arc<dyn ForumTransport>) -> Self {
        Self { client, transport }
    }

    pub fn client(&self) -> &ForumClient {
        &self.client
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn like(&self, article_id: &str) -> Result<LikeState, ForumError> {
        let transport = Arc::clone(&self.transport);
        let id = article_id.to_string();
        let data = self
            .read(keys::like(article_id), move || {
                let transport = Arc::clone(&transport);
                let id = id.clone();
                async move { transport.fetch_like(&id).await.map(ForumData::Like) }
            })
            .await?;
        expect_kind(keys::like(article_id), data, "like", |data| match data {
            ForumData::Like(like) => Ok(like),
            other => Err(other),
        })
    }

    pub async fn article(&self, article_id: &str) -> Result<Article, ForumError> {
        let transport = Arc::clone(&self.transport);
        let id = article_id.to_string();
        let data = self
            .read(keys::article(article_id), move || {
                let transport = Arc::clone(&transport);
                let id = id.clone();
                async move { transport.fetch_article(&id).await.map(ForumData::Article) }
            })
            .await?;
        expect_kind(keys::article(article_id), data, "article", |data| match data {
            ForumData::Article(article) => Ok(article),
            other => Err(other),
        })
    }

    pub async fn articles(&self) -> Result<Vec<ArticleSummary>, ForumError> {
        let transport = Arc::clone(&self.transport);
        let data = self
            .read(keys::articles(), move || {
                let transport = Arc::clone(&transport);
                async move { transport.fetch_articles().await.map(ForumData::Articles) }
            })
            .await?;
        expect_kind(keys::articles(), data, "articles", |data| match data {
            ForumData::Articles(list) => Ok(list),
            other => Err(other),
        })
    }

    /// Comment feed of an article. A reload fetches as many pages as are
    /// cached at that moment, so a refreshed feed keeps its depth.
    pub async fn comments(&self, article_id: &str) -> Result<CommentFeed, ForumError> {
        let key = keys::comments(article_id);
        let transport = Arc::clone(&self.transport);
        let store = self.client.store().clone();
        let id = article_id.to_string();
        let feed_key = key.clone();
        let data = self
            .read(key.clone(), move || {
                let transport = Arc::clone(&transport);
                let id = id.clone();
                let depth = store
                    .value(&feed_key)
                    .and_then(|data| data.as_comments().map(|feed| feed.pages.len()))
                    .unwrap_or(1)
                    .max(1);
                async move {
                    let mut feed = CommentFeed::default();
                    for page in 1..=depth as u32 {
                        let loaded = transport
                            .fetch_comments(&id, page, COMMENT_PAGE_SIZE)
                            .await?;
                        let has_next = loaded.has_next;
                        feed = feed.with_page(loaded);
                        if !has_next {
                            break;
                        }
                    }
                    Ok::<_, TransportError>(ForumData::Comments(feed))
                }
            })
            .await?;
        expect_kind(key, data, "comments", |data| match data {
            ForumData::Comments(feed) => Ok(feed),
            other => Err(other),
        })
    }

    /// Load the page after the last cached one and append it. Returns the
    /// feed unchanged when the server has nothing more.
    pub async fn next_comment_page(&self, article_id: &str) -> Result<CommentFeed, ForumError> {
        let key = keys::comments(article_id);
        let feed = self.comments(article_id).await?;
        let Some(page) = feed.next_page() else {
            return Ok(feed);
        };

        let loaded = self
            .transport
            .fetch_comments(article_id, page, COMMENT_PAGE_SIZE)
            .await?;
        let entry = self.client.store().update(key.clone(), move |current| {
            let feed = current
                .and_then(ForumData::as_comments)
                .cloned()
                .unwrap_or_default();
            ForumData::Comments(feed.with_page(loaded))
        });
        let data = entry.value.ok_or_else(|| ForumError::UnexpectedKind {
            key: key.clone(),
            expected: "comments",
            found: "nothing",
        })?;
        expect_kind(key, data, "comments", |data| match data {
            ForumData::Comments(feed) => Ok(feed),
            other => Err(other),
        })
    }

    pub async fn comment(
        &self,
        article_id: &str,
        comment_id: &str,
    ) -> Result<Comment, ForumError> {
        let transport = Arc::clone(&self.transport);
        let article = article_id.to_string();
        let comment = comment_id.to_string();
        let data = self
            .read(keys::comment(comment_id), move || {
                let transport = Arc::clone(&transport);
                let article = article.clone();
                let comment = comment.clone();
                async move {
                    transport
                        .fetch_comment(&article, &comment)
                        .await
                        .map(ForumData::Comment)
                }
            })
            .await?;
        expect_kind(keys::comment(comment_id), data, "comment", |data| match data {
            ForumData::Comment(comment) => Ok(comment),
            other => Err(other),
        })
    }

    pub async fn user(&self) -> Result<UserProfile, ForumError> {
        let transport = Arc::clone(&self.transport);
        let data = self
            .read(keys::user(), move || {
                let transport = Arc::clone(&transport);
                async move { transport.fetch_user().await.map(ForumData::User) }
            })
            .await?;
        expect_kind(keys::user(), data, "user", |data| match data {
            ForumData::User(user) => Ok(user),
            other => Err(other),
        })
    }

    async fn read<F, Fut>(&self, key: CacheKey, loader: F) -> Result<ForumData, ForumError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ForumData, TransportError>> + Send + 'static,
    {
        let result = self.client.read(key.clone(), loader).await;
        if let Err(err) = &result {
            self.client
                .notices()
                .error(format!("Could not load {key}: {err}"));
        }
        Ok(result?)
    }

    // ========================================================================
    // Likes
    // ========================================================================

    /// Like or unlike an article depending on the cached like state.
    ///
    /// The like flips at once; a failure puts it back unless a later toggle
    /// already replaced it.
    #[instrument(skip(self))]
    pub async fn toggle_like(&self, article_id: &str) -> Result<LikeState, ForumError> {
        let key = keys::like(article_id);
        let liked = self
            .client
            .value(&key)
            .and_then(|data| data.as_like().map(|like| like.is_liked))
            .unwrap_or(false);

        let transport = Arc::clone(&self.transport);
        let id = article_id.to_string();
        let operation = async move {
            if liked {
                transport.delete_like(&id).await
            } else {
                transport.create_like(&id).await
            }
        };

        let mutation = self
            .client
            .mutation(
                keys::TOGGLE_LIKE,
                key,
                &keys::article_args(article_id),
                operation,
            )?
            .optimistic(ForumData::Like(LikeState::default()), |data| {
                data.map_like(LikeState::toggled)
            });

        Ok(self.client.run(mutation).await?)
    }

    // ========================================================================
    // Comments
    // ========================================================================

    /// Post a comment. A pending copy heads the first cached page and the
    /// cached article's comment count goes up by one until the server answers.
    #[instrument(skip(self, content))]
    pub async fn create_comment(
        &self,
        article_id: &str,
        content: &str,
    ) -> Result<Comment, ForumError> {
        let pending = Comment::pending(article_id, content);
        let transport = Arc::clone(&self.transport);
        let id = article_id.to_string();
        let body = content.to_string();
        let operation = async move { transport.create_comment(&id, &body).await };

        let mutation = self
            .client
            .mutation(
                keys::CREATE_COMMENT,
                keys::comments(article_id),
                &keys::article_args(article_id),
                operation,
            )?
            .optimistic(ForumData::Comments(CommentFeed::default()), move |data| {
                data.map_comments(|feed| feed.with_prepended(pending))
            })
            .also_update(keys::article(article_id), |data| {
                data.map_article(|article| article.with_comment_delta(1))
            });

        self.settle(
            mutation,
            "Comment posted.",
            "Could not post the comment. Please try again shortly.",
        )
        .await
    }

    /// Edit a comment. Nothing is written ahead of the server.
    #[instrument(skip(self, content))]
    pub async fn update_comment(
        &self,
        article_id: &str,
        comment_id: &str,
        content: &str,
    ) -> Result<Comment, ForumError> {
        let transport = Arc::clone(&self.transport);
        let (id, comment, body) = (
            article_id.to_string(),
            comment_id.to_string(),
            content.to_string(),
        );
        let operation = async move { transport.update_comment(&id, &comment, &body).await };

        let mutation = self.client.mutation(
            keys::UPDATE_COMMENT,
            keys::comment(comment_id),
            &keys::comment_args(article_id, comment_id),
            operation,
        )?;

        self.settle(
            mutation,
            "Comment updated.",
            "Could not update the comment. Please try again shortly.",
        )
        .await
    }

    /// Delete a comment. It disappears from every cached page and the cached
    /// article's comment count drops by one, never below zero.
    #[instrument(skip(self))]
    pub async fn delete_comment(
        &self,
        article_id: &str,
        comment_id: &str,
    ) -> Result<(), ForumError> {
        let transport = Arc::clone(&self.transport);
        let (id, comment) = (article_id.to_string(), comment_id.to_string());
        let operation = async move { transport.delete_comment(&id, &comment).await };

        let removed = comment_id.to_string();
        let mutation = self
            .client
            .mutation(
                keys::DELETE_COMMENT,
                keys::comments(article_id),
                &keys::comment_args(article_id, comment_id),
                operation,
            )?
            .also_update(keys::comments(article_id), move |data| {
                data.map_comments(|feed| feed.without(&removed))
            })
            .also_update(keys::article(article_id), |data| {
                data.map_article(|article| article.with_comment_delta(-1))
            });

        self.settle(
            mutation,
            "Comment deleted.",
            "Could not delete the comment. Please try again shortly.",
        )
        .await
    }

    // ========================================================================
    // Account
    // ========================================================================

    /// Start a session, then load the signed-in profile into the cache.
    #[instrument(skip(self, credentials), fields(email = %credentials.email))]
    pub async fn login(&self, credentials: Credentials) -> Result<UserProfile, ForumError> {
        let transport = Arc::clone(&self.transport);
        let operation = async move { transport.login(&credentials).await };

        let mutation =
            self.client
                .mutation(keys::LOGIN, keys::user(), &Default::default(), operation)?;

        self.settle(
            mutation,
            "Signed in.",
            "Could not sign in. Please check your email and password.",
        )
        .await?;
        self.user().await
    }

    /// End the session. Success drops every cached entry and loader, since
    /// none of it belongs to the next user.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), ForumError> {
        let transport = Arc::clone(&self.transport);
        let operation = async move { transport.logout().await };

        let mutation = self
            .client
            .mutation(keys::LOGOUT, keys::user(), &Default::default(), operation)?
            .clear_on_success();

        self.settle(
            mutation,
            "Signed out.",
            "Could not sign out. Please try again shortly.",
        )
        .await
    }

    /// Change nickname and image. A cached profile shows the change at once.
    #[instrument(skip(self))]
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile, ForumError> {
        let transport = Arc::clone(&self.transport);
        let payload = update.clone();
        let operation = async move { transport.update_user(&payload).await };

        let mutation = self
            .client
            .mutation(
                keys::UPDATE_PROFILE,
                keys::user(),
                &Default::default(),
                operation,
            )?
            .also_update(keys::user(), move |data| {
                data.map_user(|user| user.with_update(&update))
            });

        self.settle(
            mutation,
            "Profile updated.",
            "Could not update the profile. Please try again shortly.",
        )
        .await
    }

    #[instrument(skip(self, update))]
    pub async fn update_password(&self, update: PasswordUpdate) -> Result<(), ForumError> {
        let transport = Arc::clone(&self.transport);
        let operation = async move { transport.update_password(&update).await };

        let mutation = self.client.mutation(
            keys::UPDATE_PASSWORD,
            keys::user(),
            &Default::default(),
            operation,
        )?;

        self.settle(
            mutation,
            "Password changed.",
            "Could not change the password. Please try again shortly.",
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_account(&self) -> Result<(), ForumError> {
        let transport = Arc::clone(&self.transport);
        let operation = async move { transport.delete_user().await };

        let mutation = self.client.mutation(
            keys::DELETE_ACCOUNT,
            keys::user(),
            &Default::default(),
            operation,
        )?;

        self.settle(
            mutation,
            "Account deleted.",
            "Could not delete the account. Please try again shortly.",
        )
        .await
    }

    async fn settle<R: Send + 'static>(
        &self,
        mutation: Mutation<ForumData, R, TransportError>,
        success: &str,
        failure: &str,
    ) -> Result<R, ForumError> {
        let result = self.client.run(mutation).await;
        let notices = self.client.notices();
        match &result {
            Ok(_) => notices.info(success),
            Err(_) => notices.error(failure),
        };
        Ok(result?)
    }
}

fn expect_kind<T>(
    key: CacheKey,
    data: ForumData,
    expected: &'static str,
    extract: impl FnOnce(ForumData) -> Result<T, ForumData>,
) -> Result<T, ForumError> {
    extract(data).map_err(|other| ForumError::UnexpectedKind {
        key,
        expected,
        found: other.kind(),
    })
}
