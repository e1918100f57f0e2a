use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatId, InlineKeyboardMarkup, MessageId, ParseMode};
use teloxide::RequestError;

/// Исходящие вызовы к Telegram, которые нужны ядру бота.
///
/// Все тексты передаются уже в формате MarkdownV2.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<MessageId, RequestError>;

    async fn edit_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), RequestError>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId)
        -> Result<(), RequestError>;

    async fn answer_callback(&self, query_id: String) -> Result<(), RequestError>;

    async fn set_commands(&self, commands: Vec<BotCommand>) -> Result<(), RequestError>;
}

#[async_trait]
impl Messenger for Bot {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<MessageId, RequestError> {
        let request = self.send_message(chat_id, text).parse_mode(ParseMode::MarkdownV2);
        let sent = match keyboard {
            Some(keyboard) => request.reply_markup(keyboard).await?,
            None => request.await?,
        };
        Ok(sent.id)
    }

    async fn edit_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), RequestError> {
        let request = self
            .edit_message_text(chat_id, message_id, text)
            .parse_mode(ParseMode::MarkdownV2);
        match keyboard {
            Some(keyboard) => request.reply_markup(keyboard).await?,
            None => request.await?,
        };
        Ok(())
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), RequestError> {
        Requester::delete_message(self, chat_id, message_id).await?;
        Ok(())
    }

    async fn answer_callback(&self, query_id: String) -> Result<(), RequestError> {
        self.answer_callback_query(query_id).await?;
        Ok(())
    }

    async fn set_commands(&self, commands: Vec<BotCommand>) -> Result<(), RequestError> {
        self.set_my_commands(commands).await?;
        Ok(())
    }
}
