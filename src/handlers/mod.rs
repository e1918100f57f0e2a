pub mod callbacks;
pub mod messages;
pub mod utils;

pub use callbacks::callback_handler;
pub use messages::{edited_message_handler, is_private_text, message_handler};

use std::time::Duration;

use tokio::time;

use crate::database::Database;
use crate::recovery::Outcome;
use crate::smoker::SmokerBot;

/// Периодическое сохранение всех сессий. Каждый запуск получает свой контекст;
/// ошибка одного запуска не останавливает цикл.
pub async fn persistence_task(smoker: SmokerBot, db: Database, every: Duration) {
    let mut interval = time::interval(every);
    // Первый тик срабатывает сразу, сессии только что загружены
    interval.tick().await;

    loop {
        interval.tick().await;

        match smoker.persist(&db, "periodic_persist").await {
            Ok(Outcome::Done(())) => {}
            Ok(Outcome::Recovered(failure)) => {
                log::warn!("⚠️ Periodic save skipped: {:?}", failure)
            }
            Err(e) => log::error!("❌ Periodic save failed: {}", e),
        }
    }
}
