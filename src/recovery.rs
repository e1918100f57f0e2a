//! Обработка ошибок вокруг каждой операции.
//!
//! | Класс ошибки      | Поведение                                              |
//! |-------------------|--------------------------------------------------------|
//! | `BlockedByPeer`   | вызов [`PeerBlockedHook`] обработчика                  |
//! | `RateLimited(d)`  | сон `d` в текущей задаче и повтор той же операции      |
//! | `Ignorable`       | только debug-лог                                       |
//! | `Generic`         | лог с трассой; проброс только при `propagate_exception`|
//! | `ContextMissing`  | лог и проброс всегда                                   |
//! | `Cancelled`       | проброс без перехвата                                  |

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::errors::{BotError, Failure};

pub type OpFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, BotError>> + Send + 'c>>;

/// Реакция конкретного обработчика на блокировку бота пользователем
#[async_trait]
pub trait PeerBlockedHook: Send + Sync {
    async fn on_blocked_by_peer(&self, ctx: &mut ExecutionContext) -> Result<(), BotError>;
}

/// Результат операции, прошедшей через [`Recovery::run`]
#[derive(Debug, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    /// Ошибка обработана на месте, значения нет
    Recovered(Failure),
}

impl<T> Outcome<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Recovered(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Recovery {
    hook: Arc<dyn PeerBlockedHook>,
}

impl Recovery {
    pub fn new(hook: Arc<dyn PeerBlockedHook>) -> Self {
        Self { hook }
    }

    /// Выполнить операцию в новой области `label` контекста.
    ///
    /// При `RateLimited` операция вызывается повторно с теми же аргументами,
    /// число повторов не ограничено.
    pub async fn run<T, F>(
        &self,
        ctx: &mut ExecutionContext,
        label: &str,
        mut op: F,
    ) -> Result<Outcome<T>, BotError>
    where
        F: for<'c> FnMut(&'c mut ExecutionContext) -> OpFuture<'c, T> + Send,
        T: Send,
    {
        loop {
            let mut scope = ctx.enter(label);

            let err = match op(&mut *scope).await {
                Ok(value) => return Ok(Outcome::Done(value)),
                Err(err) => err,
            };

            match err.failure() {
                Failure::RateLimited(delay) => {
                    log::info!(
                        "{} 🟡 got rate limited, sleeping for {} seconds",
                        *scope,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                    log::info!("{} is waking up after rate limit and re-calling itself", *scope);
                }
                Failure::BlockedByPeer => {
                    log::info!("{} blocked by peer: {}", *scope, err);
                    if let Err(hook_err) = self.hook.on_blocked_by_peer(&mut scope).await {
                        if hook_err.failure() == Failure::Cancelled {
                            return Err(hook_err);
                        }
                        log::error!("{} 🔸 blocked-by-peer hook failed: {}", *scope, hook_err);
                    }
                    return Ok(Outcome::Recovered(Failure::BlockedByPeer));
                }
                Failure::Ignorable => {
                    log::debug!("{} ignored: {}", *scope, err);
                    return Ok(Outcome::Recovered(Failure::Ignorable));
                }
                Failure::ContextMissing => {
                    log::error!(
                        "{} 🟥 {:?} trigger, task {}: {}",
                        *scope,
                        scope.trigger(),
                        scope.task_id(),
                        err
                    );
                    return Err(err);
                }
                Failure::Cancelled => {
                    log::debug!("{} cancelled", *scope);
                    return Err(err);
                }
                Failure::Generic => {
                    log::error!(
                        "{} 🔸 {:?} trigger, task {}: {}",
                        *scope,
                        scope.trigger(),
                        scope.task_id(),
                        err
                    );
                    if scope.propagate_exception() {
                        return Err(err);
                    }
                    return Ok(Outcome::Recovered(Failure::Generic));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use teloxide::types::Seconds;
    use teloxide::{ApiError, RequestError};
    use tokio::time::Instant;

    use super::*;
    use crate::context::TriggerKind;
    use crate::test_support::message_event;

    #[derive(Default)]
    struct CountingHook {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerBlockedHook for CountingHook {
        async fn on_blocked_by_peer(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
            assert_eq!(ctx.scope_trace().last().map(String::as_str), Some("send"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recovery() -> (Recovery, Arc<CountingHook>) {
        let hook = Arc::new(CountingHook::default());
        (Recovery::new(hook.clone()), hook)
    }

    fn event_ctx() -> ExecutionContext {
        ExecutionContext::for_event("on_message", &message_event(1, "/run")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_operation_is_retried_after_delay() {
        let (recovery, _) = recovery();
        let mut ctx = event_ctx();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let outcome = recovery
            .run(&mut ctx, "send", |_ctx| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    let mut attempts = attempts.lock().unwrap();
                    attempts.push(Instant::now());
                    if attempts.len() == 1 {
                        Err(BotError::from(RequestError::RetryAfter(Seconds::from_seconds(2))))
                    } else {
                        Ok(attempts.len())
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Done(2));
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(2));
        assert_eq!(ctx.scope_trace(), ["on_message"]);
    }

    #[tokio::test]
    async fn blocked_by_peer_invokes_hook_once() {
        let (recovery, hook) = recovery();
        let mut ctx = event_ctx();

        let outcome = recovery
            .run(&mut ctx, "send", |_ctx| {
                Box::pin(async { Err::<(), _>(BotError::from(RequestError::Api(ApiError::BotBlocked))) })
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Recovered(Failure::BlockedByPeer));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignorable_failure_is_swallowed() {
        let (recovery, hook) = recovery();
        let mut ctx = event_ctx();

        let outcome = recovery
            .run(&mut ctx, "edit", |_ctx| {
                Box::pin(async {
                    Err::<(), _>(BotError::from(RequestError::Api(ApiError::MessageNotModified)))
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Recovered(Failure::Ignorable));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generic_failure_propagates_only_during_init() {
        fn failing(_ctx: &mut ExecutionContext) -> OpFuture<'_, ()> {
            Box::pin(async { Err(BotError::from(RequestError::Api(ApiError::ChatNotFound))) })
        }

        let (recovery, _) = recovery();

        let mut ctx = event_ctx();
        let outcome = recovery.run(&mut ctx, "send", failing).await.unwrap();
        assert_eq!(outcome, Outcome::Recovered(Failure::Generic));

        let mut init = ExecutionContext::new_context("init", TriggerKind::Init, None, true).unwrap();
        let err = recovery.run(&mut init, "send", failing).await.unwrap_err();
        assert!(matches!(err, BotError::Request(_)));
        assert_eq!(init.scope_trace(), ["init"]);
    }

    #[tokio::test]
    async fn context_missing_and_cancellation_always_surface() {
        let (recovery, hook) = recovery();
        let mut ctx = ExecutionContext::new_context("periodic", TriggerKind::Periodic, None, false)
            .unwrap();

        let err = recovery
            .run(&mut ctx, "needs_sender", |ctx| {
                Box::pin(async move { ctx.sender_id().map(|_| ()) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::ContextMissing("sender_id")));

        let err = recovery
            .run(&mut ctx, "self_cancel", |_ctx| {
                Box::pin(async { Err::<(), _>(BotError::Cancelled) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Cancelled));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
    }
}
