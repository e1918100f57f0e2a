//! Операции бота над сессией пользователя и таймером.
//!
//! ```text
//! STOPPED --/run--> TIMER_ACTIVE            (mode=auto или нет доступных)
//! STOPPED --/run--> TIMER_PAUSED            (mode=manual и есть доступные)
//! TIMER_ACTIVE --fire--> TIMER_ACTIVE       (mode=auto, +1 доступная)
//! TIMER_ACTIVE --fire--> TIMER_PAUSED       (mode=manual, +1 доступная)
//! TIMER_ACTIVE --fire вне окна--> STOPPED   (уведомление об ошибке)
//! TIMER_PAUSED --/smoke последней--> TIMER_ACTIVE
//! * --/stop--> STOPPED
//! ```
//!
//! Сессия меняется только после всех вызовов, которые могут завершиться
//! ошибкой; ответы пользователю отправляются уже после освобождения сессии.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use teloxide::types::{BotCommand, ChatId, InlineKeyboardMarkup, MessageId, UserId};
use teloxide::utils::command::BotCommands;

use crate::context::{Event, ExecutionContext, TriggerKind};
use crate::database::Database;
use crate::errors::BotError;
use crate::handlers::utils;
use crate::messenger::Messenger;
use crate::models::{Setting, SettingDraft, TimerMode, TimerState, UserSession};
use crate::recovery::{Outcome, PeerBlockedHook, Recovery};
use crate::registry::SessionRegistry;
use crate::scheduler::TimerScheduler;
use crate::Command;

type WakeupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Действие из callback-данных `<setting> <adjust|set> <value>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingAction {
    Adjust(i64),
    Set(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Кнопка «Обновить» под статусом: `status update`
    StatusUpdate,
    Setting(Setting, SettingAction),
}

pub fn parse_callback_data(data: &str) -> Option<CallbackAction> {
    let parts: Vec<&str> = data.split_whitespace().collect();
    match parts.as_slice() {
        [utils::STATUS_CALLBACK_COMMAND, utils::STATUS_CALLBACK_ACTION] => {
            Some(CallbackAction::StatusUpdate)
        }
        [name, action, value] => {
            let setting = Setting::parse(name)?;
            let value: i64 = value.parse().ok()?;
            let action = match *action {
                "adjust" => SettingAction::Adjust(value),
                "set" => SettingAction::Set(value),
                _ => return None,
            };
            Some(CallbackAction::Setting(setting, action))
        }
        _ => None,
    }
}

/// Значение аргумента команды настройки; для режима допустимы и имена
fn parse_setting_arg(setting: Setting, arg: &str) -> Option<i64> {
    match (setting, arg) {
        (Setting::Mode, "auto") => Some(0),
        (Setting::Mode, "manual") => Some(1),
        (Setting::Mode, _) => None,
        _ => arg.parse().ok(),
    }
    .filter(|value| setting.contains(*value))
}

/// Реакция пользовательских обработчиков на блокировку бота: сессия
/// деактивируется, ожидающий таймер отменяется.
pub struct SessionDeactivator {
    registry: SessionRegistry,
    scheduler: TimerScheduler,
}

#[async_trait]
impl PeerBlockedHook for SessionDeactivator {
    async fn on_blocked_by_peer(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let user_id = ctx.sender_id()?;
        self.scheduler.cancel(ctx, user_id).await?;

        if let Some(session) = self.registry.get(user_id).await {
            let mut session = session.lock().await;
            session.is_active_user = false;
            session.is_running = false;
            session.is_timer_active = false;
            session.draft = None;
        }

        log::info!("{} 🚫 blocked by user {}, session deactivated", ctx, user_id);
        Ok(())
    }
}

/// Реакция обработчика запуска: блокировка администратором только логируется
pub struct BootstrapHook;

#[async_trait]
impl PeerBlockedHook for BootstrapHook {
    async fn on_blocked_by_peer(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        log::warn!("{} admin chat has blocked the bot", ctx);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SmokerBot {
    registry: SessionRegistry,
    scheduler: TimerScheduler,
    messenger: Arc<dyn Messenger>,
    recovery: Recovery,
    bootstrap: Recovery,
    bot_name: String,
}

impl SmokerBot {
    pub fn new(
        registry: SessionRegistry,
        scheduler: TimerScheduler,
        messenger: Arc<dyn Messenger>,
        bot_name: String,
    ) -> Self {
        let hook = Arc::new(SessionDeactivator {
            registry: registry.clone(),
            scheduler: scheduler.clone(),
        });

        Self {
            registry,
            scheduler,
            messenger,
            recovery: Recovery::new(hook),
            bootstrap: Recovery::new(Arc::new(BootstrapHook)),
            bot_name,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn scheduler(&self) -> &TimerScheduler {
        &self.scheduler
    }

    // Исходящие вызовы

    async fn send(
        &self,
        recovery: &Recovery,
        ctx: &mut ExecutionContext,
        chat_id: ChatId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<Option<MessageId>, BotError> {
        let messenger = self.messenger.clone();
        let outcome = recovery
            .run(ctx, "send_message", move |_ctx| {
                let messenger = messenger.clone();
                let text = text.clone();
                let keyboard = keyboard.clone();
                Box::pin(async move {
                    messenger
                        .send_text(chat_id, text, keyboard)
                        .await
                        .map_err(BotError::from)
                })
            })
            .await?;
        Ok(outcome.into_option())
    }

    async fn reply(&self, ctx: &mut ExecutionContext, text: String) -> Result<(), BotError> {
        self.reply_with(ctx, text, None).await
    }

    async fn reply_with(
        &self,
        ctx: &mut ExecutionContext,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), BotError> {
        let chat_id = ctx.chat_id()?;
        self.send(&self.recovery, ctx, chat_id, text, keyboard).await?;
        Ok(())
    }

    async fn edit(
        &self,
        ctx: &mut ExecutionContext,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), BotError> {
        let chat_id = ctx.chat_id()?;
        let message_id = ctx.message_id().ok_or(BotError::ContextMissing("message_id"))?;
        let messenger = self.messenger.clone();
        self.recovery
            .run(ctx, "edit_message", move |_ctx| {
                let messenger = messenger.clone();
                let text = text.clone();
                let keyboard = keyboard.clone();
                Box::pin(async move {
                    messenger
                        .edit_text(chat_id, message_id, text, keyboard)
                        .await
                        .map_err(BotError::from)
                })
            })
            .await?;
        Ok(())
    }

    async fn delete_current(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let chat_id = ctx.chat_id()?;
        let message_id = ctx.message_id().ok_or(BotError::ContextMissing("message_id"))?;
        let messenger = self.messenger.clone();
        self.recovery
            .run(ctx, "delete_message", move |_ctx| {
                let messenger = messenger.clone();
                Box::pin(async move {
                    messenger
                        .delete_message(chat_id, message_id)
                        .await
                        .map_err(BotError::from)
                })
            })
            .await?;
        Ok(())
    }

    async fn answer_query(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let query_id = ctx
            .query_id()
            .ok_or(BotError::ContextMissing("query_id"))?
            .to_owned();
        let messenger = self.messenger.clone();
        self.recovery
            .run(ctx, "answer_callback", move |_ctx| {
                let messenger = messenger.clone();
                let query_id = query_id.clone();
                Box::pin(async move { messenger.answer_callback(query_id).await.map_err(BotError::from) })
            })
            .await?;
        Ok(())
    }

    // Входящие события

    /// Точка входа для сообщений, правок и callback-запросов
    pub async fn handle_event(&self, event: Event) -> Result<(), BotError> {
        if let Event::Message(message) | Event::EditedMessage(message) = &event {
            if !message.is_private() || message.text.is_none() {
                log::info!(
                    "message [ {} @ {} ] is either service one or not private, ignore",
                    message.chat_id,
                    message.message_id.0
                );
                return Ok(());
            }
        }

        let scope = match event.kind() {
            TriggerKind::EditedMessage => "on_message_edited",
            TriggerKind::CallbackQuery => "on_callback_query",
            _ => "on_new_message",
        };
        let mut ctx = ExecutionContext::for_event(scope, &event)?;
        log::debug!("{} task {} started", ctx, ctx.task_id());

        let this = self.clone();
        let outcome = self
            .recovery
            .run(&mut ctx, "dispatch", move |ctx| {
                let this = this.clone();
                let event = event.clone();
                Box::pin(async move { this.dispatch(ctx, &event).await })
            })
            .await;

        match outcome {
            Ok(_) | Err(BotError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn dispatch(&self, ctx: &mut ExecutionContext, event: &Event) -> Result<(), BotError> {
        let user_id = ctx.sender_id()?;
        self.registry.get_or_create(user_id).await.lock().await.is_active_user = true;

        match event {
            Event::Message(message) => {
                let text = message.text.as_deref().unwrap_or_default();
                match Command::parse(text, &self.bot_name) {
                    Ok(command) => self.on_command(ctx, command).await,
                    Err(_) => self.reply(ctx, utils::not_understood_text(text)).await,
                }
            }
            Event::EditedMessage(_) => self.reply(ctx, utils::edited_message_text()).await,
            Event::CallbackQuery(_) => self.on_callback(ctx).await,
        }
    }

    async fn on_command(&self, ctx: &mut ExecutionContext, command: Command) -> Result<(), BotError> {
        match command {
            Command::Start => self.reply(ctx, utils::start_text()).await,
            Command::Help => self.reply(ctx, utils::help_text()).await,
            Command::Run => self.run(ctx).await,
            Command::Smoke => self.smoke(ctx).await,
            Command::Stop => self.stop(ctx).await,
            Command::Status => self.status(ctx).await,
            Command::Settings => self.settings(ctx).await,
            Command::Interval(arg) => self.setting_command(ctx, Setting::Interval, &arg).await,
            Command::Initial(arg) => self.setting_command(ctx, Setting::Initial, &arg).await,
            Command::Tz(arg) => self.setting_command(ctx, Setting::TzOffset, &arg).await,
            Command::Mode(arg) => self.setting_command(ctx, Setting::Mode, &arg).await,
        }
    }

    // Таймер

    fn wakeup_task(&self, ctx: ExecutionContext, generation: u64) -> WakeupFuture {
        let this = self.clone();
        Box::pin(async move { this.on_wakeup(ctx, generation).await })
    }

    /// Запустить отсчёт с момента `start`. Поля сессии меняются только после
    /// успешного планирования.
    async fn start_timer(
        &self,
        ctx: &mut ExecutionContext,
        session: &mut UserSession,
        start: i64,
    ) -> Result<(), BotError> {
        let user_id = UserId(session.user_id);
        let end = start + session.interval_seconds();

        let this = self.clone();
        self.scheduler
            .schedule(ctx, user_id, end, move |task_ctx, generation| {
                this.wakeup_task(task_ctx, generation)
            })
            .await?;

        session.timer_start = Some(start);
        session.timer_end = Some(end);
        session.is_timer_active = true;
        Ok(())
    }

    async fn on_wakeup(&self, mut ctx: ExecutionContext, generation: u64) {
        let Ok(user_id) = ctx.sender_id() else {
            log::error!("{} 🟥 wake-up without user", ctx);
            return;
        };
        if !self.scheduler.claim(user_id, generation) {
            log::debug!("{} stale wake-up #{} ignored", ctx, generation);
            return;
        }

        let this = self.clone();
        let outcome = self
            .recovery
            .run(&mut ctx, "fire", move |ctx| {
                let this = this.clone();
                Box::pin(async move { this.fire(ctx, generation).await })
            })
            .await;

        match outcome {
            Ok(_) => {}
            Err(BotError::Cancelled) => log::debug!("{} wake-up #{} cancelled itself", ctx, generation),
            Err(err) => log::error!("{} 🟥 wake-up #{} failed: {}", ctx, generation, err),
        }
    }

    async fn fire(&self, ctx: &mut ExecutionContext, generation: u64) -> Result<(), BotError> {
        let user_id = ctx.sender_id()?;
        let Some(session) = self.registry.get(user_id).await else {
            return Ok(());
        };

        let mut session = session.lock().await;
        if !self.scheduler.is_current(user_id, generation) || session.timer_state() != TimerState::Active {
            log::debug!("{} wake-up #{} is no longer relevant", ctx, generation);
            return Ok(());
        }

        let now = self.scheduler.now();
        let interval = session.interval_seconds();
        let timer_end = session.timer_end;
        let end = match timer_end {
            Some(end) if end <= now && now <= end + interval => end,
            _ => {
                log::warn!(
                    "{} wake-up at {} is out of window (timer_end={:?}, interval={}s), stopping",
                    ctx,
                    now,
                    timer_end,
                    interval
                );
                session.is_running = false;
                session.is_timer_active = false;
                let text = utils::wakeup_error_text(&session, now);
                drop(session);
                return self.reply(ctx, text).await;
            }
        };

        match session.mode {
            TimerMode::Auto => self.start_timer(ctx, &mut session, end).await?,
            TimerMode::Manual => session.is_timer_active = false,
        }
        session.available_count += 1;

        let text = utils::new_available_text(&session, now);
        drop(session);
        self.reply(ctx, text).await
    }

    // Команды

    pub async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let mut ctx = ctx.enter("run");
        let user_id = ctx.sender_id()?;
        let session = self.registry.get_or_create(user_id).await;
        let mut session = session.lock().await;

        if session.is_running {
            drop(session);
            log::debug!("{} timer is already running", *ctx);
            return self.reply(&mut ctx, utils::run_already_running_text()).await;
        }

        let now = self.scheduler.now();
        let initial = session.initial_available;
        if session.mode == TimerMode::Auto || initial == 0 {
            self.start_timer(&mut ctx, &mut session, now).await?;
        } else {
            session.is_timer_active = false;
            session.timer_start = None;
            session.timer_end = None;
        }
        session.is_running = true;
        session.is_active_user = true;
        session.available_count = initial;
        session.smoked_count = 0;
        session.ran_at = Some(now);

        let text = utils::status_text(&session, now);
        drop(session);
        self.reply(&mut ctx, text).await
    }

    pub async fn smoke(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let mut ctx = ctx.enter("smoke");
        let user_id = ctx.sender_id()?;
        let session = self.registry.get_or_create(user_id).await;
        let mut session = session.lock().await;
        let now = self.scheduler.now();

        let text = if !session.is_running {
            utils::escape_markdown_v2(utils::MUST_RUN_FIRST)
        } else if session.available_count == 0 {
            format!(
                "{}\n\n{}",
                utils::escape_markdown_v2(utils::NOTHING_AVAILABLE),
                utils::status_text(&session, now)
            )
        } else {
            if session.available_count == 1 && session.timer_state() == TimerState::Paused {
                self.start_timer(&mut ctx, &mut session, now).await?;
            }
            session.available_count -= 1;
            session.smoked_count += 1;
            format!("{}\n\n{}", utils::smoked_text(), utils::status_text(&session, now))
        };

        drop(session);
        self.reply(&mut ctx, text).await
    }

    pub async fn stop(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let mut ctx = ctx.enter("stop");
        let user_id = ctx.sender_id()?;
        let session = self.registry.get_or_create(user_id).await;
        let mut session = session.lock().await;
        let now = self.scheduler.now();

        let text = if session.is_running {
            self.scheduler.cancel(&ctx, user_id).await?;
            session.is_running = false;
            session.is_timer_active = false;
            format!("{}\n\n{}", utils::stopped_text(&session), utils::status_text(&session, now))
        } else {
            utils::status_text(&session, now)
        };

        drop(session);
        self.reply(&mut ctx, text).await
    }

    /// Статус с кнопкой «Обновить», пока таймер запущен
    async fn status_message(&self, user_id: UserId) -> (String, Option<InlineKeyboardMarkup>) {
        let session = self.registry.get_or_create(user_id).await;
        let session = session.lock().await;
        let text = utils::status_text(&session, self.scheduler.now());
        (text, session.is_running.then(utils::make_status_keyboard))
    }

    pub async fn status(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let mut ctx = ctx.enter("status");
        let (text, keyboard) = self.status_message(ctx.sender_id()?).await;
        self.reply_with(&mut ctx, text, keyboard).await
    }

    /// Обновить сообщение со статусом на месте
    async fn status_update(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let mut ctx = ctx.enter("status_update");
        let (text, keyboard) = self.status_message(ctx.sender_id()?).await;
        self.edit(&mut ctx, text, keyboard).await
    }

    pub async fn settings(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let mut ctx = ctx.enter("settings");
        let user_id = ctx.sender_id()?;
        let session = self.registry.get_or_create(user_id).await;
        let text = utils::settings_text(&*session.lock().await);
        self.reply(&mut ctx, text).await
    }

    /// Сохранить значение настройки. Переключение в авто-режим снимает паузу.
    async fn commit_setting(
        &self,
        ctx: &mut ExecutionContext,
        session: &mut UserSession,
        setting: Setting,
        value: i64,
    ) -> Result<(), BotError> {
        let resumes = setting == Setting::Mode
            && value == 0
            && session.timer_state() == TimerState::Paused;
        if resumes {
            self.start_timer(ctx, session, self.scheduler.now()).await?;
        }
        session.apply_setting(setting, value);
        session.draft = None;
        Ok(())
    }

    async fn setting_command(
        &self,
        ctx: &mut ExecutionContext,
        setting: Setting,
        arg: &str,
    ) -> Result<(), BotError> {
        let mut ctx = ctx.enter(setting.name());
        let user_id = ctx.sender_id()?;
        let session = self.registry.get_or_create(user_id).await;
        let mut session = session.lock().await;
        let arg = arg.trim();

        if arg.is_empty() {
            let draft = SettingDraft {
                setting,
                value: session.setting_value(setting),
            };
            session.draft = Some(draft);
            drop(session);
            return self
                .reply_with(
                    &mut ctx,
                    utils::draft_text(&draft),
                    Some(utils::make_setting_keyboard(&draft)),
                )
                .await;
        }

        let text = match parse_setting_arg(setting, arg) {
            Some(value) => {
                self.commit_setting(&mut ctx, &mut session, setting, value).await?;
                utils::setting_saved_text(&session)
            }
            None => utils::setting_rejected_text(setting),
        };
        drop(session);
        self.reply(&mut ctx, text).await
    }

    async fn on_callback(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        self.answer_query(ctx).await?;

        let data = ctx.query_data().unwrap_or_default().to_owned();
        match parse_callback_data(&data) {
            Some(CallbackAction::StatusUpdate) => self.status_update(ctx).await,
            Some(CallbackAction::Setting(setting, action)) => {
                self.setting_callback(ctx, setting, action).await
            }
            None => {
                log::warn!("{} unknown callback data {:?}", ctx, data);
                Ok(())
            }
        }
    }

    async fn setting_callback(
        &self,
        ctx: &mut ExecutionContext,
        setting: Setting,
        action: SettingAction,
    ) -> Result<(), BotError> {
        let mut ctx = ctx.enter(setting.name());
        let user_id = ctx.sender_id()?;
        let session = self.registry.get_or_create(user_id).await;
        let mut session = session.lock().await;

        match action {
            SettingAction::Adjust(delta) => {
                let staged = match session.draft {
                    Some(draft) if draft.setting == setting => draft.value,
                    _ => session.setting_value(setting),
                };
                let draft = SettingDraft {
                    setting,
                    value: setting.clamp(staged.saturating_add(delta)),
                };
                session.draft = Some(draft);
                drop(session);
                self.edit(
                    &mut ctx,
                    utils::draft_text(&draft),
                    Some(utils::make_setting_keyboard(&draft)),
                )
                .await
            }
            SettingAction::Set(value) if setting.contains(value) => {
                self.commit_setting(&mut ctx, &mut session, setting, value).await?;
                let text = utils::setting_saved_text(&session);
                drop(session);
                self.delete_current(&mut ctx).await?;
                self.reply(&mut ctx, text).await
            }
            SettingAction::Set(_) => {
                drop(session);
                self.reply(&mut ctx, utils::setting_rejected_text(setting)).await
            }
        }
    }

    // Запуск, сохранение

    /// Инициализация после старта. Любая ошибка прерывает запуск.
    pub async fn init(
        &self,
        commands: Vec<BotCommand>,
        admin: Option<ChatId>,
    ) -> Result<(), BotError> {
        let mut ctx = ExecutionContext::new_context("init", TriggerKind::Init, None, true)?;

        let messenger = self.messenger.clone();
        self.bootstrap
            .run(&mut ctx, "set_commands", move |_ctx| {
                let messenger = messenger.clone();
                let commands = commands.clone();
                Box::pin(async move { messenger.set_commands(commands).await.map_err(BotError::from) })
            })
            .await?;

        self.resume_timers(&mut ctx).await?;

        if let Some(admin) = admin {
            let text = utils::bot_started_text(self.registry.len().await);
            self.send(&self.bootstrap, &mut ctx, admin, text, None).await?;
        }

        log::info!("{} ✅ bot initialized", ctx);
        Ok(())
    }

    /// Перепланировать таймеры, восстановленные из хранилища
    async fn resume_timers(&self, ctx: &mut ExecutionContext) -> Result<(), BotError> {
        let ctx = ctx.enter("resume_timers");
        let now = self.scheduler.now();
        let mut resumed = 0;

        for user_id in self.registry.user_ids().await {
            let Some(session) = self.registry.get(user_id).await else {
                continue;
            };
            let session = session.lock().await;
            if !(session.is_active_user && session.timer_state() == TimerState::Active) {
                continue;
            }
            let Some(end) = session.timer_end else {
                continue;
            };

            let this = self.clone();
            self.scheduler
                .schedule(&ctx, user_id, end.max(now), move |task_ctx, generation| {
                    this.wakeup_task(task_ctx, generation)
                })
                .await?;
            resumed += 1;
        }

        log::info!("{} {} timers resumed", *ctx, resumed);
        Ok(())
    }

    /// Сохранить все сессии в новом контексте (периодически и при остановке)
    pub async fn persist(&self, db: &Database, scope: &str) -> Result<Outcome<()>, BotError> {
        let mut ctx = ExecutionContext::new_context(scope, TriggerKind::Periodic, None, false)?;
        let registry = self.registry.clone();
        let db = db.clone();
        self.recovery
            .run(&mut ctx, "save_sessions", move |_ctx| {
                let registry = registry.clone();
                let db = db.clone();
                Box::pin(async move { db.save_sessions(&registry.snapshot().await).await })
            })
            .await
    }

    /// Отменить все таймеры перед остановкой процесса
    pub async fn shutdown(&self) -> Result<(), BotError> {
        let ctx = ExecutionContext::new_context("shutdown", TriggerKind::Periodic, None, false)?;
        self.scheduler.shutdown(&ctx).await;
        Ok(())
    }
}
