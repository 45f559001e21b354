//! Transient user-facing notices.
//!
//! Feature code publishes short success/failure messages after a mutation
//! settles, and the coordinator publishes one when a background refresh fails.
//! The UI layer subscribes or drains; nothing here renders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::config::CacheConfig;
use super::lock::mutex_lock;
use super::subscription::Subscription;

const SOURCE: &str = "cache::notice";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub id: Uuid,
    /// Publication order within this board.
    pub sequence: u64,
    pub level: NoticeLevel,
    pub message: String,
    pub timestamp: OffsetDateTime,
}

type NoticeListener = Arc<dyn Fn(&Notice) + Send + Sync>;

struct BoardInner {
    capacity: usize,
    sequence: AtomicU64,
    queue: Mutex<VecDeque<Notice>>,
    listeners: Mutex<Vec<(u64, NoticeListener)>>,
    next_listener: AtomicU64,
}

/// Bounded backlog of notices plus live listeners.
#[derive(Clone)]
pub struct NoticeBoard {
    inner: Arc<BoardInner>,
}

impl NoticeBoard {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(BoardInner {
                capacity: config.notice_capacity_non_zero().get(),
                sequence: AtomicU64::new(0),
                queue: Mutex::new(VecDeque::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn info(&self, message: impl Into<String>) -> Notice {
        self.publish(NoticeLevel::Info, message)
    }

    pub fn error(&self, message: impl Into<String>) -> Notice {
        self.publish(NoticeLevel::Error, message)
    }

    /// Queue a notice and hand it to every listener. The oldest undrained
    /// notice is dropped when the backlog is full.
    pub fn publish(&self, level: NoticeLevel, message: impl Into<String>) -> Notice {
        let notice = Notice {
            id: Uuid::new_v4(),
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst),
            level,
            message: message.into(),
            timestamp: OffsetDateTime::now_utc(),
        };

        info!(
            notice_id = %notice.id,
            notice_level = ?notice.level,
            message = %notice.message,
            "Notice published"
        );

        {
            let mut queue = mutex_lock(&self.inner.queue, SOURCE, "publish");
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
            }
            queue.push_back(notice.clone());
        }

        let listeners: Vec<NoticeListener> = mutex_lock(&self.inner.listeners, SOURCE, "notify")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&notice);
        }

        notice
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notice) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.inner.listeners, SOURCE, "subscribe").push((id, Arc::new(listener)));

        let board = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = board.upgrade() {
                mutex_lock(&inner.listeners, SOURCE, "unsubscribe")
                    .retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    /// Take every queued notice, oldest first.
    pub fn drain(&self) -> Vec<Notice> {
        mutex_lock(&self.inner.queue, SOURCE, "drain").drain(..).collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
