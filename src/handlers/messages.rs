use std::error::Error;

use teloxide::prelude::*;

use crate::context::{Event, MessageEvent};
use crate::smoker::SmokerBot;

/// Только текстовые сообщения пользователей в личном чате, сервисные
/// сообщения и группы пропускаются
pub fn is_private_text(msg: Message) -> bool {
    let passes = msg.chat.is_private() && msg.from.is_some() && msg.text().is_some();
    if !passes {
        log::info!(
            "message [ {} @ {} ] is either service one or not private, ignore",
            msg.chat.id,
            msg.id.0
        );
    }
    passes
}

/// Команды и любой другой текст: разбор команд выполняет `SmokerBot`
pub async fn message_handler(
    msg: Message,
    smoker: SmokerBot,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    smoker
        .handle_event(Event::Message(MessageEvent::from(&msg)))
        .await?;
    Ok(())
}

pub async fn edited_message_handler(
    msg: Message,
    smoker: SmokerBot,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    log::debug!("✏️ Edited message {} in chat {}", msg.id.0, msg.chat.id);
    smoker
        .handle_event(Event::EditedMessage(MessageEvent::from(&msg)))
        .await?;
    Ok(())
}
