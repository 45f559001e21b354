//! Forum payloads as the cache holds them.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Prefix marking comments that exist only as an optimistic write.
pub const PENDING_COMMENT_PREFIX: &str = "temp-";
const PENDING_AUTHOR: &str = "Posting...";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub is_liked: bool,
    pub like_count: u64,
}

impl LikeState {
    /// Flip the viewer's like and move the count with it, never below zero.
    pub fn toggled(&self) -> Self {
        if self.is_liked {
            Self {
                is_liked: false,
                like_count: self.like_count.saturating_sub(1),
            }
        } else {
            Self {
                is_liked: true,
                like_count: self.like_count.saturating_add(1),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub user_id: String,
    pub nickname: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub article_id: String,
    pub content: String,
    pub author: Author,
    pub created_at: OffsetDateTime,
}

impl Comment {
    /// Stand-in shown while a new comment is being posted.
    pub fn pending(article_id: &str, content: &str) -> Self {
        Self {
            id: format!("{PENDING_COMMENT_PREFIX}{}", Uuid::new_v4()),
            article_id: article_id.to_string(),
            content: content.to_string(),
            author: Author {
                user_id: String::new(),
                nickname: PENDING_AUTHOR.to_string(),
                image: None,
            },
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.starts_with(PENDING_COMMENT_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentPage {
    /// One-based page number.
    pub page: u32,
    pub comments: Vec<Comment>,
    pub has_next: bool,
}

/// Pages of an article's comments loaded so far, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentFeed {
    pub pages: Vec<CommentPage>,
}

impl CommentFeed {
    /// Page to request next, if the server reported more.
    pub fn next_page(&self) -> Option<u32> {
        match self.pages.last() {
            Some(last) if last.has_next => Some(last.page + 1),
            Some(_) => None,
            None => Some(1),
        }
    }

    pub fn comments(&self) -> impl Iterator<Item = &Comment> {
        self.pages.iter().flat_map(|page| page.comments.iter())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|page| page.comments.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put `comment` at the head of the first page, creating that page when
    /// nothing is loaded.
    pub fn with_prepended(&self, comment: Comment) -> Self {
        let mut feed = self.clone();
        match feed.pages.first_mut() {
            Some(first) => first.comments.insert(0, comment),
            None => feed.pages.push(CommentPage {
                page: 1,
                comments: vec![comment],
                has_next: false,
            }),
        }
        feed
    }

    /// Drop the comment with `comment_id` from every page.
    pub fn without(&self, comment_id: &str) -> Self {
        let mut feed = self.clone();
        for page in &mut feed.pages {
            page.comments.retain(|comment| comment.id != comment_id);
        }
        feed
    }

    pub fn with_page(&self, page: CommentPage) -> Self {
        let mut feed = self.clone();
        feed.pages.retain(|existing| existing.page != page.page);
        feed.pages.push(page);
        feed.pages.sort_by_key(|page| page.page);
        feed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub content: String,
    pub author: Author,
    pub like_count: u64,
    pub comment_count: u64,
    pub view_count: u64,
    pub created_at: OffsetDateTime,
}

impl Article {
    /// Shift the comment count by `delta`, clamped at zero.
    pub fn with_comment_delta(&self, delta: i64) -> Self {
        let comment_count = if delta.is_negative() {
            self.comment_count.saturating_sub(delta.unsigned_abs())
        } else {
            self.comment_count.saturating_add(delta.unsigned_abs())
        };
        Self {
            comment_count,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSummary {
    pub id: String,
    pub title: String,
    pub author_nickname: String,
    pub like_count: u64,
    pub comment_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub nickname: String,
    pub image: Option<String>,
}

impl UserProfile {
    pub fn with_update(&self, update: &ProfileUpdate) -> Self {
        Self {
            nickname: update.nickname.clone(),
            image: update.image.clone().or_else(|| self.image.clone()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub nickname: String,
    /// New profile image reference; `None` keeps the current one.
    pub image: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordUpdate {
    pub password: String,
    pub password_confirm: String,
}

impl fmt::Debug for PasswordUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordUpdate")
            .field("password", &"<redacted>")
            .field("password_confirm", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Every value kind the forum caches, one per key family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ForumData {
    Like(LikeState),
    Article(Article),
    Articles(Vec<ArticleSummary>),
    Comments(CommentFeed),
    Comment(Comment),
    User(UserProfile),
}

impl ForumData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Like(_) => "like",
            Self::Article(_) => "article",
            Self::Articles(_) => "articles",
            Self::Comments(_) => "comments",
            Self::Comment(_) => "comment",
            Self::User(_) => "user",
        }
    }

    pub fn as_like(&self) -> Option<&LikeState> {
        match self {
            Self::Like(like) => Some(like),
            _ => None,
        }
    }

    pub fn as_article(&self) -> Option<&Article> {
        match self {
            Self::Article(article) => Some(article),
            _ => None,
        }
    }

    pub fn as_comments(&self) -> Option<&CommentFeed> {
        match self {
            Self::Comments(feed) => Some(feed),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserProfile> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    // Transforms below leave a value of another kind unchanged.

    pub fn map_like(&self, f: impl FnOnce(&LikeState) -> LikeState) -> Self {
        match self {
            Self::Like(like) => Self::Like(f(like)),
            other => other.clone(),
        }
    }

    pub fn map_article(&self, f: impl FnOnce(&Article) -> Article) -> Self {
        match self {
            Self::Article(article) => Self::Article(f(article)),
            other => other.clone(),
        }
    }

    pub fn map_comments(&self, f: impl FnOnce(&CommentFeed) -> CommentFeed) -> Self {
        match self {
            Self::Comments(feed) => Self::Comments(f(feed)),
            other => other.clone(),
        }
    }

    pub fn map_user(&self, f: impl FnOnce(&UserProfile) -> UserProfile) -> Self {
        match self {
            Self::User(user) => Self::User(f(user)),
            other => other.clone(),
        }
    }
}
