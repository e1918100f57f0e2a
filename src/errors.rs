use std::time::Duration;

use teloxide::{ApiError, RequestError};

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("telegram request failed: {0}")]
    Request(#[from] RequestError),

    #[error("required context value is missing: {0}")]
    ContextMissing(&'static str),

    #[error("handler wiring error: {0}")]
    Wiring(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("wake-up task cancelled")]
    Cancelled,
}

/// Класс ошибки, определяющий способ восстановления
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    BlockedByPeer,
    RateLimited(Duration),
    Ignorable,
    ContextMissing,
    Cancelled,
    Generic,
}

impl BotError {
    pub fn failure(&self) -> Failure {
        match self {
            BotError::Request(RequestError::RetryAfter(seconds)) => {
                Failure::RateLimited(seconds.duration())
            }
            BotError::Request(RequestError::Api(api)) => match api {
                ApiError::BotBlocked | ApiError::UserDeactivated | ApiError::BotKicked => {
                    Failure::BlockedByPeer
                }
                ApiError::MessageNotModified | ApiError::MessageToDeleteNotFound => {
                    Failure::Ignorable
                }
                _ => Failure::Generic,
            },
            BotError::ContextMissing(_) | BotError::Wiring(_) => Failure::ContextMissing,
            BotError::Cancelled => Failure::Cancelled,
            _ => Failure::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::Seconds;

    #[test]
    fn telegram_errors_are_classified() {
        let retry = BotError::from(RequestError::RetryAfter(Seconds::from_seconds(7)));
        assert_eq!(retry.failure(), Failure::RateLimited(Duration::from_secs(7)));

        let blocked = BotError::from(RequestError::Api(ApiError::BotBlocked));
        assert_eq!(blocked.failure(), Failure::BlockedByPeer);

        let not_modified = BotError::from(RequestError::Api(ApiError::MessageNotModified));
        assert_eq!(not_modified.failure(), Failure::Ignorable);

        let other = BotError::from(RequestError::Api(ApiError::ChatNotFound));
        assert_eq!(other.failure(), Failure::Generic);
    }

    #[test]
    fn internal_errors_are_classified() {
        assert_eq!(BotError::ContextMissing("sender_id").failure(), Failure::ContextMissing);
        assert_eq!(BotError::Wiring("bad".into()).failure(), Failure::ContextMissing);
        assert_eq!(BotError::Cancelled.failure(), Failure::Cancelled);
        assert_eq!(BotError::Storage(sqlx::Error::RowNotFound).failure(), Failure::Generic);
    }
}
