use std::collections::HashMap;
use std::sync::Arc;

use teloxide::types::UserId;
use tokio::sync::{Mutex, RwLock};

use crate::models::UserSession;

/// Сессия одного пользователя. Все изменения сессии выполняются под этим
/// мьютексом, поэтому операции одного пользователя не перемежаются.
pub type SharedSession = Arc<Mutex<UserSession>>;

type SessionMap = Arc<RwLock<HashMap<UserId, SharedSession>>>;

/// Сессии всех пользователей, живут всё время работы процесса
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: SessionMap,
}

impl SessionRegistry {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sessions(sessions: HashMap<UserId, UserSession>) -> Self {
        let sessions = sessions
            .into_iter()
            .map(|(user_id, session)| (user_id, Arc::new(Mutex::new(session))))
            .collect();
        Self {
            sessions: Arc::new(RwLock::new(sessions)),
        }
    }

    pub async fn get(&self, user_id: UserId) -> Option<SharedSession> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    pub async fn get_or_create(&self, user_id: UserId) -> SharedSession {
        if let Some(session) = self.get(user_id).await {
            return session;
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id)
            .or_insert_with(|| {
                log::debug!("👤 New session for user {}", user_id);
                Arc::new(Mutex::new(UserSession::new(user_id.0)))
            })
            .clone()
    }

    pub async fn user_ids(&self) -> Vec<UserId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Копии всех сессий для сохранения
    pub async fn snapshot(&self) -> Vec<UserSession> {
        let sessions: Vec<SharedSession> = self.sessions.read().await.values().cloned().collect();

        let mut snapshot = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshot.push(session.lock().await.clone());
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_session() {
        let registry = SessionRegistry::new();
        assert!(registry.get(UserId(1)).await.is_none());

        let first = registry.get_or_create(UserId(1)).await;
        first.lock().await.smoked_count = 3;

        let second = registry.get_or_create(UserId(1)).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.smoked_count, 3);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_copies_loaded_sessions() {
        let mut loaded = HashMap::new();
        loaded.insert(UserId(1), UserSession::new(1));
        loaded.insert(UserId(2), UserSession::new(2));
        let registry = SessionRegistry::from_sessions(loaded);

        let mut ids: Vec<u64> = registry.snapshot().await.iter().map(|s| s.user_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
