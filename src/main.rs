use std::sync::Arc;

use teloxide::{prelude::*, utils::command::BotCommands};

mod config;
mod context;
mod database;
mod errors;
mod handlers;
mod messenger;
mod models;
mod recovery;
mod registry;
mod scheduler;
mod smoker;
#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::database::Database;
use crate::handlers::{callback_handler, edited_message_handler, message_handler};
use crate::registry::SessionRegistry;
use crate::scheduler::{SystemClock, TimerScheduler};
use crate::smoker::SmokerBot;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Доступные команды:")]
pub enum Command {
    #[command(description = "начать работу с ботом")]
    Start,
    #[command(description = "показать помощь")]
    Help,
    #[command(description = "запустить таймер")]
    Run,
    #[command(description = "выкурить доступную сигарету")]
    Smoke,
    #[command(description = "остановить таймер")]
    Stop,
    #[command(description = "текущий статус")]
    Status,
    #[command(description = "текущие настройки")]
    Settings,
    #[command(description = "интервал между сигаретами, минут")]
    Interval(String),
    #[command(description = "сигарет при запуске")]
    Initial(String),
    #[command(description = "часовой пояс, смещение от UTC в часах")]
    Tz(String),
    #[command(description = "режим таймера: auto или manual")]
    Mode(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Загружаем .env и инициализируем логирование
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Starting smoker bot with SQLite...");

    let config = Config::from_env()?;

    let db = Database::new(&config.database_url).await?;
    db.init().await?;
    log::info!("✅ Database initialized");

    let registry = SessionRegistry::from_sessions(db.load_sessions().await?);
    let scheduler = TimerScheduler::new(Arc::new(SystemClock));

    let bot = Bot::from_env();
    let me = bot.get_me().await?;
    let bot_name = me.username().to_string();

    let smoker = SmokerBot::new(registry, scheduler, Arc::new(bot.clone()), bot_name);
    smoker.init(Command::bot_commands(), config.admin_chat).await?;

    // Фоновая задача для сохранения сессий
    let persist_handle = tokio::spawn(handlers::persistence_task(
        smoker.clone(),
        db.clone(),
        config.persistence_interval,
    ));

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter(handlers::is_private_text)
                .endpoint(message_handler),
        )
        .branch(
            Update::filter_edited_message()
                .filter(handlers::is_private_text)
                .endpoint(edited_message_handler),
        )
        .branch(Update::filter_callback_query().endpoint(callback_handler));

    log::info!("🚀 Starting dispatcher as @{}...", me.username());

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![smoker.clone()])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("🛑 Dispatcher stopped, saving sessions...");
    persist_handle.abort();
    smoker.shutdown().await?;
    smoker.persist(&db, "shutdown_persist").await?;
    db.pool.close().await;
    log::info!("👋 Bye");

    Ok(())
}
