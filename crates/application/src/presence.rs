//! 在线状态跟踪
//!
//! 在线状态按连接计数：同一用户可能同时在多个设备或标签页在线，
//! 只有第一条连接建立时转为在线，最后一条连接断开时才转为离线。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{UserId, UserRepository};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;

/// 一次连接变化引起的在线状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    CameOnline,
    WentOffline,
    Unchanged,
}

pub struct PresenceTracker {
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
    /// 每个用户一把锁，保证同一用户的状态迁移和持久化按顺序执行
    counters: Mutex<HashMap<UserId, Arc<Mutex<usize>>>>,
}

impl PresenceTracker {
    pub fn new(users: Arc<dyn UserRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            users,
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    async fn counter(&self, user: UserId) -> Arc<Mutex<usize>> {
        self.counters.lock().await.entry(user).or_default().clone()
    }

    pub async fn connected(&self, user: UserId) -> PresenceTransition {
        let counter = self.counter(user).await;
        let mut count = counter.lock().await;
        *count += 1;
        if *count > 1 {
            return PresenceTransition::Unchanged;
        }
        self.persist(user, true).await;
        info!(user_id = %user, "用户上线");
        PresenceTransition::CameOnline
    }

    pub async fn disconnected(&self, user: UserId) -> PresenceTransition {
        let Some(counter) = self.counters.lock().await.get(&user).cloned() else {
            warn!(user_id = %user, "断开的连接没有对应的在线计数");
            return PresenceTransition::Unchanged;
        };
        let mut count = counter.lock().await;
        match *count {
            0 => PresenceTransition::Unchanged,
            1 => {
                *count = 0;
                self.persist(user, false).await;
                self.release(user, &counter).await;
                info!(user_id = %user, "用户离线");
                PresenceTransition::WentOffline
            }
            _ => {
                *count -= 1;
                PresenceTransition::Unchanged
            }
        }
    }

    /// 计数归零后移除条目。外层锁内不会有新的克隆产生，
    /// 只剩映射和调用方两份引用时才能安全移除。
    async fn release(&self, user: UserId, counter: &Arc<Mutex<usize>>) {
        let mut counters = self.counters.lock().await;
        if Arc::strong_count(counter) == 2 {
            counters.remove(&user);
        }
    }

    #[cfg(test)]
    async fn tracked_users(&self) -> usize {
        self.counters.lock().await.len()
    }

    /// 持久化失败只记录日志，不影响连接生命周期
    async fn persist(&self, user: UserId, online: bool) {
        let at = self.clock.now();
        if let Err(err) = self.users.set_online(user, online, at).await {
            warn!(user_id = %user, online, error = %err, "在线状态持久化失败");
        }
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        let counter = self.counters.lock().await.get(&user).cloned();
        match counter {
            Some(counter) => *counter.lock().await > 0,
            None => false,
        }
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let entries: Vec<(UserId, Arc<Mutex<usize>>)> = self
            .counters
            .lock()
            .await
            .iter()
            .map(|(user, counter)| (*user, counter.clone()))
            .collect();

        let mut online = Vec::new();
        for (user, counter) in entries {
            if *counter.lock().await > 0 {
                online.push(user);
            }
        }
        online.sort();
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use domain::{MockUserRepository, RepositoryError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_users(writes: Arc<std::sync::Mutex<Vec<(UserId, bool)>>>) -> MockUserRepository {
        let mut users = MockUserRepository::new();
        users.expect_set_online().returning(move |user, online, _| {
            writes.lock().unwrap().push((user, online));
            Box::pin(async { Ok(()) })
        });
        users
    }

    #[tokio::test]
    async fn second_tab_closing_keeps_user_online() {
        let writes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tracker = PresenceTracker::new(
            Arc::new(recording_users(writes.clone())),
            Arc::new(SystemClock),
        );
        let user = UserId(3);

        assert_eq!(tracker.connected(user).await, PresenceTransition::CameOnline);
        assert_eq!(tracker.connected(user).await, PresenceTransition::Unchanged);
        assert_eq!(tracker.disconnected(user).await, PresenceTransition::Unchanged);
        assert!(tracker.is_online(user).await);
        assert_eq!(tracker.disconnected(user).await, PresenceTransition::WentOffline);
        assert!(!tracker.is_online(user).await);

        assert_eq!(*writes.lock().unwrap(), vec![(user, true), (user, false)]);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_break_lifecycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut users = MockUserRepository::new();
        users.expect_set_online().returning(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(RepositoryError::storage("database is down")) })
        });
        let tracker = PresenceTracker::new(Arc::new(users), Arc::new(SystemClock));

        assert_eq!(tracker.connected(UserId(5)).await, PresenceTransition::CameOnline);
        assert!(tracker.is_online(UserId(5)).await);
        assert_eq!(tracker.disconnected(UserId(5)).await, PresenceTransition::WentOffline);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unmatched_disconnect_is_ignored() {
        let mut users = MockUserRepository::new();
        users.expect_set_online().never();
        let tracker = PresenceTracker::new(Arc::new(users), Arc::new(SystemClock));
        assert_eq!(tracker.disconnected(UserId(8)).await, PresenceTransition::Unchanged);
        assert_eq!(tracker.tracked_users().await, 0);
    }

    #[tokio::test]
    async fn offline_users_are_not_retained() {
        let writes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tracker = PresenceTracker::new(
            Arc::new(recording_users(writes.clone())),
            Arc::new(SystemClock),
        );

        for id in 1..=200 {
            tracker.connected(UserId(id)).await;
            tracker.connected(UserId(id)).await;
        }
        assert_eq!(tracker.tracked_users().await, 200);
        for id in 1..=200 {
            tracker.disconnected(UserId(id)).await;
            tracker.disconnected(UserId(id)).await;
        }

        assert!(tracker.online_users().await.is_empty());
        assert_eq!(tracker.tracked_users().await, 0);

        // 条目被回收后重新上线仍然正常计数
        assert_eq!(tracker.connected(UserId(7)).await, PresenceTransition::CameOnline);
        assert!(tracker.is_online(UserId(7)).await);
        assert_eq!(writes.lock().unwrap().len(), 401);
    }

    #[tokio::test]
    async fn concurrent_connections_are_counted() {
        let writes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tracker = Arc::new(PresenceTracker::new(
            Arc::new(recording_users(writes.clone())),
            Arc::new(SystemClock),
        ));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.connected(UserId(4)).await })
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(tracker.online_users().await, vec![UserId(4)]);
        assert_eq!(writes.lock().unwrap().len(), 1);
    }
}
