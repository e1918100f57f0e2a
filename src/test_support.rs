use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teloxide::types::{BotCommand, ChatId, InlineKeyboardMarkup, MessageId, UserId};
use teloxide::RequestError;

use crate::context::{CallbackEvent, Event, MessageEvent};
use crate::messenger::Messenger;
use crate::scheduler::Clock;

pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(now),
        })
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Send { chat_id: ChatId, text: String, keyboard: bool },
    Edit { chat_id: ChatId, message_id: MessageId, text: String },
    Delete { chat_id: ChatId, message_id: MessageId },
    Answer { query_id: String },
    SetCommands { count: usize },
}

/// Записывает исходящие вызовы; ошибки из очереди возвращаются по одной
/// на каждый следующий вызов. Для правок сообщений есть отдельная очередь.
#[derive(Default)]
pub struct FakeMessenger {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<VecDeque<RequestError>>,
    edit_failures: Mutex<VecDeque<RequestError>>,
    next_message_id: AtomicI32,
}

impl FakeMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_message_id: AtomicI32::new(1_000),
            ..Self::default()
        })
    }

    pub fn fail_next(&self, err: RequestError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_edit(&self, err: RequestError) {
        self.edit_failures.lock().unwrap().push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: Call) -> Result<(), RequestError> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<MessageId, RequestError> {
        self.record(Call::Send {
            chat_id,
            text,
            keyboard: keyboard.is_some(),
        })?;
        Ok(MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn edit_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
        _keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), RequestError> {
        self.record(Call::Edit {
            chat_id,
            message_id,
            text,
        })?;
        match self.edit_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), RequestError> {
        self.record(Call::Delete {
            chat_id,
            message_id,
        })
    }

    async fn answer_callback(&self, query_id: String) -> Result<(), RequestError> {
        self.record(Call::Answer { query_id })
    }

    async fn set_commands(&self, commands: Vec<BotCommand>) -> Result<(), RequestError> {
        self.record(Call::SetCommands {
            count: commands.len(),
        })
    }
}

pub fn message_event(user_id: u64, text: &str) -> Event {
    Event::Message(MessageEvent {
        chat_id: ChatId(user_id as i64),
        sender_id: Some(UserId(user_id)),
        message_id: MessageId(100),
        text: Some(text.to_owned()),
    })
}

/// Сообщение пользователя из группового чата `chat_id`
pub fn group_message_event(user_id: u64, chat_id: i64, text: &str) -> Event {
    Event::Message(MessageEvent {
        chat_id: ChatId(chat_id),
        sender_id: Some(UserId(user_id)),
        message_id: MessageId(100),
        text: Some(text.to_owned()),
    })
}

pub fn edited_message_event(user_id: u64, text: &str) -> Event {
    match message_event(user_id, text) {
        Event::Message(m) => Event::EditedMessage(m),
        other => other,
    }
}

pub fn callback_event(user_id: u64, data: &str) -> Event {
    Event::CallbackQuery(CallbackEvent {
        query_id: format!("q-{}", user_id),
        sender_id: UserId(user_id),
        chat_id: Some(ChatId(user_id as i64)),
        message_id: Some(MessageId(200)),
        data: Some(data.to_owned()),
    })
}
