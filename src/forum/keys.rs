//! Forum cache keys, mutation categories, and the invalidation rules tying
//! them together.

use crate::cache::{CacheKey, InvalidationGraph, KeyTemplate, MutationArgs};

pub const TOGGLE_LIKE: &str = "toggle-like";
pub const CREATE_COMMENT: &str = "create-comment";
pub const UPDATE_COMMENT: &str = "update-comment";
pub const DELETE_COMMENT: &str = "delete-comment";
pub const UPDATE_PROFILE: &str = "update-profile";
pub const UPDATE_PASSWORD: &str = "update-password";
pub const DELETE_ACCOUNT: &str = "delete-account";
pub const LOGIN: &str = "login";
/// Settles by clearing the whole cache, so its rule only applies on failure.
pub const LOGOUT: &str = "logout";

pub const ARG_ARTICLE_ID: &str = "article_id";
pub const ARG_COMMENT_ID: &str = "comment_id";

pub fn like(article_id: &str) -> CacheKey {
    CacheKey::new(["like", article_id])
}

pub fn article(article_id: &str) -> CacheKey {
    CacheKey::new(["article", article_id])
}

pub fn articles() -> CacheKey {
    CacheKey::root("articles")
}

pub fn comments(article_id: &str) -> CacheKey {
    CacheKey::new(["comments", article_id])
}

pub fn comment(comment_id: &str) -> CacheKey {
    CacheKey::new(["comment", comment_id])
}

pub fn user() -> CacheKey {
    CacheKey::root("user")
}

pub fn article_args(article_id: &str) -> MutationArgs {
    MutationArgs::new().with(ARG_ARTICLE_ID, article_id)
}

pub fn comment_args(article_id: &str, comment_id: &str) -> MutationArgs {
    article_args(article_id).with(ARG_COMMENT_ID, comment_id)
}

/// Rules for every forum mutation category.
pub fn default_graph() -> InvalidationGraph {
    let like = || KeyTemplate::literal("like").param(ARG_ARTICLE_ID);
    let article = || KeyTemplate::literal("article").param(ARG_ARTICLE_ID);
    let comments = || KeyTemplate::literal("comments").param(ARG_ARTICLE_ID);
    let comment = || KeyTemplate::literal("comment").param(ARG_COMMENT_ID);
    let user = || KeyTemplate::literal("user");

    InvalidationGraph::new()
        .rule(
            TOGGLE_LIKE,
            [like(), article(), KeyTemplate::literal("articles")],
        )
        .rule(CREATE_COMMENT, [comments(), article()])
        .rule(UPDATE_COMMENT, [comments(), comment()])
        .rule(DELETE_COMMENT, [comments(), comment(), article()])
        .rule(UPDATE_PROFILE, [user()])
        .rule(UPDATE_PASSWORD, [user()])
        .rule(DELETE_ACCOUNT, [user()])
        .rule(LOGIN, [user()])
        .rule(LOGOUT, [user()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_compare_structurally() {
        assert_eq!(like("a1"), CacheKey::new(["like", "a1"]));
        assert_ne!(like("a1"), article("a1"));
        assert!(articles().is_prefix_of(&articles().with(2)));
    }

    #[test]
    fn toggle_like_invalidates_like_article_and_listing() {
        let keys = default_graph()
            .resolve(TOGGLE_LIKE, &article_args("a1"))
            .expect("resolved");
        assert_eq!(keys, vec![like("a1"), article("a1"), articles()]);
    }

    #[test]
    fn delete_comment_needs_both_ids() {
        let graph = default_graph();
        assert!(graph.resolve(DELETE_COMMENT, &article_args("a1")).is_err());

        let keys = graph
            .resolve(DELETE_COMMENT, &comment_args("a1", "c9"))
            .expect("resolved");
        assert_eq!(keys, vec![comments("a1"), comment("c9"), article("a1")]);
    }

    #[test]
    fn every_category_resolves_with_full_arguments() {
        let graph = default_graph();
        let args = comment_args("a1", "c1");
        for category in graph.categories() {
            let keys = graph.resolve(category, &args).expect("resolved");
            assert!(!keys.is_empty(), "{category} invalidates nothing");
        }
        assert_eq!(graph.categories().len(), 9);
    }
}
