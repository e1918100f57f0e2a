//! Отложенные задачи пробуждения: не более одной ожидающей задачи на
//! пользователя.
//!
//! Каждая новая задача получает следующее поколение пользователя. Задача,
//! проснувшись, сначала «забирает» свой слот через [`TimerScheduler::claim`];
//! если поколение успело смениться (отмена, замена), срабатывание игнорируется.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use teloxide::types::UserId;
use tokio::task::JoinHandle;

use crate::context::ExecutionContext;
use crate::errors::BotError;

/// Источник текущего времени в секундах POSIX
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

struct TimerTask {
    fire_at: i64,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    tasks: HashMap<UserId, TimerTask>,
    generations: HashMap<UserId, u64>,
}

#[derive(Clone)]
pub struct TimerScheduler {
    slots: Arc<Mutex<Slots>>,
    clock: Arc<dyn Clock>,
}

impl TimerScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            clock,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // Состояние слотов остаётся согласованным даже после паники в другом потоке
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Запланировать пробуждение пользователя на момент `fire_at`.
    ///
    /// Предыдущая задача пользователя сначала инвалидируется и отменяется с
    /// ожиданием завершения. `on_fire` получает копию контекста с новой
    /// трассой и поколение задачи.
    pub async fn schedule<F, Fut>(
        &self,
        ctx: &ExecutionContext,
        user_id: UserId,
        fire_at: i64,
        on_fire: F,
    ) -> Result<u64, BotError>
    where
        F: FnOnce(ExecutionContext, u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(ctx, user_id).await?;

        let delay = Duration::from_secs((fire_at - self.clock.now()).max(0) as u64);

        let mut slots = self.slots();
        let generation = slots.generations.get(&user_id).copied().unwrap_or(0) + 1;
        slots.generations.insert(user_id, generation);

        let task_ctx = ctx.for_timer("wakeup", user_id, generation);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(task_ctx, generation).await;
        });

        let task = TimerTask {
            fire_at,
            generation,
            handle,
        };
        if let Some(stale) = slots.tasks.insert(user_id, task) {
            stale.handle.abort();
        }

        log::debug!(
            "{} wake-up #{} for user {} scheduled at {} (in {:?})",
            ctx,
            generation,
            user_id,
            fire_at,
            delay
        );
        Ok(generation)
    }

    /// Отменить ожидающую задачу пользователя и дождаться её завершения.
    ///
    /// Если отменяемая задача — текущая (контекст таймера с тем же
    /// поколением), ждать её нельзя: возвращается [`BotError::Cancelled`],
    /// который должен дойти до корня задачи.
    pub async fn cancel(&self, ctx: &ExecutionContext, user_id: UserId) -> Result<(), BotError> {
        let task = {
            let mut slots = self.slots();
            *slots.generations.entry(user_id).or_insert(0) += 1;
            slots.tasks.remove(&user_id)
        };

        let Some(task) = task else {
            return Ok(());
        };

        if ctx.timer_generation() == Some(task.generation) && ctx.sender_id().ok() == Some(user_id) {
            log::debug!("{} wake-up #{} cancels itself", ctx, task.generation);
            task.handle.abort();
            return Err(BotError::Cancelled);
        }

        task.handle.abort();
        match task.handle.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => log::error!("{} wake-up task for user {} failed: {}", ctx, user_id, err),
        }
        log::debug!(
            "{} wake-up #{} for user {} (due at {}) cancelled",
            ctx,
            task.generation,
            user_id,
            task.fire_at
        );
        Ok(())
    }

    /// Забрать слот сработавшей задачи. `false`, если задача устарела.
    pub fn claim(&self, user_id: UserId, generation: u64) -> bool {
        let mut slots = self.slots();
        if slots.generations.get(&user_id) != Some(&generation) {
            return false;
        }
        if slots.tasks.get(&user_id).map(|t| t.generation) == Some(generation) {
            slots.tasks.remove(&user_id);
        }
        true
    }

    /// Поколение `generation` всё ещё актуально для пользователя
    pub fn is_current(&self, user_id: UserId, generation: u64) -> bool {
        self.slots().generations.get(&user_id) == Some(&generation)
    }

    #[cfg(test)]
    pub fn pending_count(&self, user_id: UserId) -> usize {
        usize::from(self.slots().tasks.contains_key(&user_id))
    }

    #[cfg(test)]
    pub fn pending_fire_at(&self, user_id: UserId) -> Option<i64> {
        self.slots().tasks.get(&user_id).map(|t| t.fire_at)
    }

    /// Отменить все задачи при остановке процесса
    pub async fn shutdown(&self, ctx: &ExecutionContext) {
        let users: Vec<UserId> = self.slots().tasks.keys().copied().collect();
        for user_id in users {
            if let Err(err) = self.cancel(ctx, user_id).await {
                log::error!("{} failed to cancel wake-up for user {}: {}", ctx, user_id, err);
            }
        }
    }
}
