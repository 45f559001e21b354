use std::{collections::BTreeMap, process, sync::Arc, time::Duration};

use optimist::{
    cache::{CacheConfig, InvalidationGraph, NoticeLevel, QueryClient},
    config::{self, Command, GraphArgs, SimulateArgs},
    error::AppError,
    forum::{Forum, ForumOp, InMemoryForum, ProfileUpdate, TransportError, default_graph, keys},
    telemetry,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Simulate(SimulateArgs::default()));

    telemetry::init(&settings.logging)?;

    let graph = settings.invalidation_graph(default_graph());
    match command {
        Command::Simulate(args) => run_simulate(&settings.cache, graph, args).await,
        Command::Graph(args) => run_graph(&graph, args),
    }
}

async fn run_simulate(
    cache: &CacheConfig,
    graph: InvalidationGraph,
    args: SimulateArgs,
) -> Result<(), AppError> {
    let latency = Duration::from_millis(args.latency_ms);
    let server = Arc::new(InMemoryForum::seeded().with_latency(latency));
    if args.fail_like {
        server.fail_next(
            ForumOp::CreateLike,
            TransportError::network("like service unavailable"),
        );
    }
    if args.fail_comment {
        server.fail_next(
            ForumOp::CreateComment,
            TransportError::network("comment service unavailable"),
        );
    }

    let client = QueryClient::new(cache, graph);
    let forum = Forum::new(client.clone(), server.clone());

    let article_id = "a1";
    let like = forum.like(article_id).await?;
    let article = forum.article(article_id).await?;
    let feed = forum.comments(article_id).await?;
    info!(
        liked = like.is_liked,
        like_count = like.like_count,
        comments = article.comment_count,
        cached_comments = feed.len(),
        "Loaded article"
    );

    match forum.toggle_like(article_id).await {
        Ok(like) => info!(like_count = like.like_count, "Like accepted"),
        Err(err) => warn!(error = %err, "Like rejected"),
    }
    log_like(&forum, article_id);

    match forum.create_comment(article_id, "Thanks for the welcome!").await {
        Ok(comment) => info!(comment_id = %comment.id, "Comment accepted"),
        Err(err) => warn!(error = %err, "Comment rejected"),
    }

    let refreshed = client.flush_refreshes().await;
    info!(refreshed, "Background refreshes settled");
    log_like(&forum, article_id);

    let feed = forum.comments(article_id).await?;
    let feed = if feed.next_page().is_some() {
        forum.next_comment_page(article_id).await?
    } else {
        feed
    };
    info!(cached_comments = feed.len(), pages = feed.pages.len(), "Comment feed");

    let profile = forum
        .update_profile(ProfileUpdate {
            nickname: "regular".to_string(),
            image: None,
        })
        .await?;
    info!(nickname = %profile.nickname, "Profile updated");
    client.flush_refreshes().await;

    for key in client.store().keys() {
        if let Some(entry) = client.get(&key) {
            info!(
                key = %key,
                status = ?entry.status,
                version = entry.version,
                "Cache entry"
            );
        }
    }

    forum.logout().await?;
    info!(
        cached = client.store().keys().len(),
        "Signed out; cache cleared"
    );

    let notices = client.notices().drain();
    for notice in &notices {
        match notice.level {
            NoticeLevel::Info => println!("[{}] {}", notice.sequence, notice.message),
            NoticeLevel::Error => println!("[{}] error: {}", notice.sequence, notice.message),
        }
    }
    info!(count = notices.len(), "Simulation finished");
    Ok(())
}

fn log_like(forum: &Forum, article_id: &str) {
    let cached = forum
        .client()
        .value(&keys::like(article_id))
        .and_then(|data| data.as_like().copied());
    match cached {
        Some(like) => info!(
            liked = like.is_liked,
            like_count = like.like_count,
            "Cached like"
        ),
        None => info!("No cached like"),
    }
}

fn run_graph(graph: &InvalidationGraph, args: GraphArgs) -> Result<(), AppError> {
    let mut rules: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for category in graph.categories() {
        let templates = graph
            .templates(category)
            .ok_or_else(|| AppError::unexpected(format!("category `{category}` vanished")))?;
        rules.insert(
            category,
            templates.iter().map(ToString::to_string).collect(),
        );
    }

    if args.json {
        let rendered = serde_json::to_string_pretty(&rules)
            .map_err(|err| AppError::unexpected(format!("failed to render graph: {err}")))?;
        println!("{rendered}");
        return Ok(());
    }

    for (category, templates) in &rules {
        println!("{category}: {}", templates.join(", "));
    }
    Ok(())
}
