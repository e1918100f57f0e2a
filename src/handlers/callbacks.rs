use std::error::Error;

use teloxide::prelude::*;

use crate::context::{CallbackEvent, Event};
use crate::smoker::SmokerBot;

pub async fn callback_handler(
    q: CallbackQuery,
    smoker: SmokerBot,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    smoker
        .handle_event(Event::CallbackQuery(CallbackEvent::from(&q)))
        .await?;
    Ok(())
}
