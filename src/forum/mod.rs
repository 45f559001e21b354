//! Forum features (likes, comments, account) bound to the optimistic cache.

pub mod keys;
mod memory;
mod model;
mod service;
mod transport;

pub use keys::default_graph;
pub use memory::{ForumOp, InMemoryForum};
pub use model::{
    Article, ArticleSummary, Author, Comment, CommentFeed, CommentPage, Credentials, ForumData,
    LikeState, PENDING_COMMENT_PREFIX, PasswordUpdate, ProfileUpdate, UserProfile,
};
pub use service::{COMMENT_PAGE_SIZE, Forum, ForumClient, ForumError};
pub use transport::{ForumTransport, TransportError};
