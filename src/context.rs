//! Контекст выполнения: кто и что запустило текущую задачу.
//!
//! Контекст создаётся один раз на каждое внешнее событие (сообщение, callback,
//! срабатывание таймера, периодическое сохранение, инициализация) и явно
//! передаётся во все вложенные вызовы. Для новой параллельной задачи контекст
//! копируется через [`ExecutionContext::fork`], поэтому трасса вызовов никогда
//! не разделяется между задачами.

use std::fmt;
use std::ops::{Deref, DerefMut};

use teloxide::types::{CallbackQuery, ChatId, Message, MessageId, UserId};
use uuid::Uuid;

use crate::errors::BotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Message,
    EditedMessage,
    CallbackQuery,
    Timer,
    Periodic,
    Init,
}

impl TriggerKind {
    pub fn is_event(self) -> bool {
        matches!(
            self,
            TriggerKind::Message | TriggerKind::EditedMessage | TriggerKind::CallbackQuery
        )
    }
}

/// Снимок входящего сообщения
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub message_id: MessageId,
    pub text: Option<String>,
}

impl MessageEvent {
    /// Личный чат: его id совпадает с id отправителя
    pub fn is_private(&self) -> bool {
        self.sender_id.map(ChatId::from) == Some(self.chat_id)
    }
}

impl From<&Message> for MessageEvent {
    fn from(msg: &Message) -> Self {
        Self {
            chat_id: msg.chat.id,
            sender_id: msg.from.as_ref().map(|user| user.id),
            message_id: msg.id,
            text: msg.text().map(str::to_owned),
        }
    }
}

/// Снимок нажатия inline-кнопки
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub query_id: String,
    pub sender_id: UserId,
    pub chat_id: Option<ChatId>,
    pub message_id: Option<MessageId>,
    pub data: Option<String>,
}

impl From<&CallbackQuery> for CallbackEvent {
    fn from(q: &CallbackQuery) -> Self {
        Self {
            query_id: q.id.clone(),
            sender_id: q.from.id,
            chat_id: q.message.as_ref().map(|m| m.chat().id),
            message_id: q.message.as_ref().map(|m| m.id()),
            data: q.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(MessageEvent),
    EditedMessage(MessageEvent),
    CallbackQuery(CallbackEvent),
}

impl Event {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Event::Message(_) => TriggerKind::Message,
            Event::EditedMessage(_) => TriggerKind::EditedMessage,
            Event::CallbackQuery(_) => TriggerKind::CallbackQuery,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task_id: Uuid,
    trigger: TriggerKind,
    scope_trace: Vec<String>,

    chat_id: Option<ChatId>,
    sender_id: Option<UserId>,
    message_id: Option<MessageId>,
    query_id: Option<String>,
    query_data: Option<String>,

    /// Поколение таймера, если задача является срабатыванием таймера
    timer_generation: Option<u64>,
    propagate_exception: bool,
}

impl ExecutionContext {
    /// Создать контекст верхнего уровня для нового триггера.
    ///
    /// Обработчик событий обязан получить ровно одно событие подходящего типа,
    /// остальные триггеры создаются без события. Нарушение означает ошибку
    /// подключения обработчиков и всегда возвращается вызывающему.
    pub fn new_context(
        scope: &str,
        trigger: TriggerKind,
        event: Option<&Event>,
        propagate_exception: bool,
    ) -> Result<Self, BotError> {
        let mut ctx = Self {
            task_id: Uuid::new_v4(),
            trigger,
            scope_trace: vec![scope.to_owned()],
            chat_id: None,
            sender_id: None,
            message_id: None,
            query_id: None,
            query_data: None,
            timer_generation: None,
            propagate_exception,
        };

        match (trigger.is_event(), event) {
            (true, Some(event)) if event.kind() == trigger => ctx.copy_event(event),
            (false, None) => {}
            (_, event) => {
                let err = BotError::Wiring(format!(
                    "handler '{}' declared for {:?} trigger was called with {:?}",
                    scope,
                    trigger,
                    event.map(Event::kind)
                ));
                log::error!("{} 🟥 context build error: {}", ctx, err);
                return Err(err);
            }
        }

        Ok(ctx)
    }

    /// Контекст для события: тип триггера берётся из самого события
    pub fn for_event(scope: &str, event: &Event) -> Result<Self, BotError> {
        Self::new_context(scope, event.kind(), Some(event), false)
    }

    fn copy_event(&mut self, event: &Event) {
        match event {
            Event::Message(m) | Event::EditedMessage(m) => {
                self.chat_id = Some(m.chat_id);
                self.sender_id = m.sender_id;
                self.message_id = Some(m.message_id);
            }
            Event::CallbackQuery(q) => {
                self.chat_id = q.chat_id;
                self.sender_id = Some(q.sender_id);
                self.message_id = q.message_id;
                self.query_id = Some(q.query_id.clone());
                self.query_data = q.data.clone();
            }
        }
    }

    /// Копия контекста для новой параллельной задачи со свежей трассой
    pub fn fork(&self, scope: &str, trigger: TriggerKind) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            trigger,
            scope_trace: vec![scope.to_owned()],
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            message_id: None,
            query_id: None,
            query_data: None,
            timer_generation: None,
            propagate_exception: false,
        }
    }

    /// Контекст срабатывания таймера конкретного пользователя
    pub fn for_timer(&self, scope: &str, user_id: UserId, generation: u64) -> Self {
        let mut ctx = self.fork(scope, TriggerKind::Timer);
        ctx.sender_id = Some(user_id);
        ctx.chat_id = Some(ChatId::from(user_id));
        ctx.timer_generation = Some(generation);
        ctx
    }

    /// Войти во вложенную область. Метка снимается при выходе из области
    /// любым путём: возврат, `?`, паника или отмена future.
    pub fn enter(&mut self, label: &str) -> Scope<'_> {
        let depth = self.scope_trace.len();
        self.scope_trace.push(label.to_owned());
        Scope { ctx: self, depth }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn trigger(&self) -> TriggerKind {
        self.trigger
    }

    #[cfg(test)]
    pub fn scope_trace(&self) -> &[String] {
        &self.scope_trace
    }

    pub fn propagate_exception(&self) -> bool {
        self.propagate_exception
    }

    pub fn timer_generation(&self) -> Option<u64> {
        self.timer_generation
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn query_data(&self) -> Option<&str> {
        self.query_data.as_deref()
    }

    pub fn sender_id(&self) -> Result<UserId, BotError> {
        self.sender_id.ok_or(BotError::ContextMissing("sender_id"))
    }

    /// Идентификатор чата; для личного чата он совпадает с id отправителя,
    /// поэтому при отсутствии выводится из него и кешируется в контексте.
    pub fn chat_id(&mut self) -> Result<ChatId, BotError> {
        if let Some(chat_id) = self.chat_id {
            return Ok(chat_id);
        }
        let chat_id = ChatId::from(self.sender_id()?);
        self.chat_id = Some(chat_id);
        Ok(chat_id)
    }

    /// `[ chat_id @ message_id ]`, если чат известен
    fn chat_at_id(&self) -> Option<String> {
        self.chat_id.map(|chat| match self.message_id {
            Some(id) => format!("[ {} @ {} ]", chat, id.0),
            None => format!("[ {} ]", chat),
        })
    }
}

impl fmt::Display for ExecutionContext {
    /// Префикс для логов: трасса областей и идентификаторы триггера
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scope_trace.join(" > "))?;
        if let Some(chat_at_id) = self.chat_at_id() {
            write!(f, " {}", chat_at_id)?;
        }
        write!(f, ":")
    }
}

/// Вложенная область контекста, снимает свою метку при drop
pub struct Scope<'a> {
    ctx: &'a mut ExecutionContext,
    depth: usize,
}

impl Deref for Scope<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        self.ctx
    }
}

impl DerefMut for Scope<'_> {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.ctx
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.ctx.scope_trace.truncate(self.depth);
    }
}
