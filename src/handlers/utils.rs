use chrono::{FixedOffset, TimeZone};
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::models::session::SECONDS_IN_MINUTE;
use crate::models::{Setting, SettingDraft, TimerMode, TimerState, UserSession};

const SECONDS_IN_HOUR: i64 = 60 * SECONDS_IN_MINUTE;

pub const MUST_RUN_FIRST: &str = "Таймер остановлен. Сначала запустите его командой /run";
pub const NOTHING_AVAILABLE: &str = "Доступных сигарет нет, дождитесь следующей.";

pub const STATUS_CALLBACK_COMMAND: &str = "status";
pub const STATUS_CALLBACK_ACTION: &str = "update";

/// Экранирование MarkdownV2
pub fn escape_markdown_v2(text: &str) -> String {
    let specials = ['_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!'];
    let mut out = String::with_capacity(text.len() * 2);

    for ch in text.chars() {
        if specials.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn bold(text: &str) -> String {
    format!("*{}*", escape_markdown_v2(text))
}

/// Время `HH:MM` в часовом поясе пользователя
pub fn format_time(posix: i64, tz_offset_hours: i32) -> String {
    FixedOffset::east_opt(tz_offset_hours * 3600)
        .and_then(|tz| tz.timestamp_opt(posix, 0).single())
        .map(|time| time.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

/// Интервал `hh:mm`, меньше минуты — `00:00.ss`
pub fn format_timedelta(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < SECONDS_IN_MINUTE {
        return format!("00:00.{:02}", seconds);
    }
    format!(
        "{:02}:{:02}",
        seconds / SECONDS_IN_HOUR,
        (seconds % SECONDS_IN_HOUR) / SECONDS_IN_MINUTE
    )
}

fn mode_name(mode: TimerMode) -> &'static str {
    match mode {
        TimerMode::Auto => "автоматический",
        TimerMode::Manual => "ручной",
    }
}

fn setting_title(setting: Setting) -> &'static str {
    match setting {
        Setting::Interval => "Интервал, минут",
        Setting::Initial => "Сигарет при запуске",
        Setting::TzOffset => "Часовой пояс, UTC+",
        Setting::Mode => "Режим таймера",
    }
}

fn draft_value_text(setting: Setting, value: i64) -> String {
    match setting {
        Setting::Mode if value == 0 => mode_name(TimerMode::Auto).to_string(),
        Setting::Mode => mode_name(TimerMode::Manual).to_string(),
        _ => value.to_string(),
    }
}

pub fn start_text() -> String {
    format!(
        "{}\n\n{}",
        bold("👋 Привет! Я помогу курить реже."),
        escape_markdown_v2(
            "Я выдаю по одной сигарете раз в заданный интервал. \
             Запустите таймер командой /run, отмечайте каждую выкуренную \
             сигарету командой /smoke. Подробнее: /help"
        )
    )
}

pub fn help_text() -> String {
    format!(
        "{}\n\n{}",
        bold("🆘 Команды"),
        escape_markdown_v2(
            "/run - запуск таймера\n\
             /smoke - выкурить сигарету\n\
             /stop - останов таймера\n\
             /status - текущий статус\n\
             /settings - настройки\n\
             /interval [минуты] - интервал (1-720)\n\
             /initial [число] - сигарет при запуске (0-3)\n\
             /tz [часы] - часовой пояс (-12..12)\n\
             /mode [auto|manual] - режим таймера\n\n\
             В автоматическом режиме таймер перезапускается сразу. \
             В ручном - ждёт, пока вы выкурите доступную сигарету."
        )
    )
}

pub fn status_text(session: &UserSession, now: i64) -> String {
    let tz = session.tz_offset_hours;
    match session.timer_state() {
        TimerState::Stopped => escape_markdown_v2("🔴 Таймер остановлен. Запуск: /run"),
        TimerState::Paused => escape_markdown_v2(&format!(
            "⏸ Таймер на паузе до следующей сигареты.\nДоступно сигарет: {}\nТекущее время: {}",
            session.available_count,
            format_time(now, tz)
        )),
        TimerState::Active => {
            let end = session.timer_end.unwrap_or(now);
            escape_markdown_v2(&format!(
                "🟢 Таймер запущен.\nДоступно сигарет: {}\nСледующая в {} (через {})\nТекущее время: {}",
                session.available_count,
                format_time(end, tz),
                format_timedelta(end - now),
                format_time(now, tz)
            ))
        }
    }
}

pub fn settings_text(session: &UserSession) -> String {
    format!(
        "{}\n{}",
        bold("⚙️ Настройки"),
        escape_markdown_v2(&format!(
            "Интервал: {} мин\nРежим: {}\nСигарет при запуске: {}\nЧасовой пояс: UTC{:+}",
            session.interval_minutes,
            mode_name(session.mode),
            session.initial_available,
            session.tz_offset_hours
        ))
    )
}

pub fn setting_saved_text(session: &UserSession) -> String {
    format!("{}\n\n{}", escape_markdown_v2("✅ Настройка сохранена."), settings_text(session))
}

pub fn setting_rejected_text(setting: Setting) -> String {
    let (low, high) = setting.bounds();
    let hint = match setting {
        Setting::Mode => "auto или manual".to_string(),
        _ => format!("целое число от {} до {}", low, high),
    };
    escape_markdown_v2(&format!(
        "❌ Неверное значение. {}: {}. Без аргумента /{} откроет выбор.",
        setting_title(setting),
        hint,
        setting.name()
    ))
}

pub fn draft_text(draft: &SettingDraft) -> String {
    format!(
        "{}\n{}",
        bold(setting_title(draft.setting)),
        escape_markdown_v2(&format!(
            "Выбрано: {}",
            draft_value_text(draft.setting, draft.value)
        ))
    )
}

pub fn run_already_running_text() -> String {
    escape_markdown_v2("ℹ️ Таймер уже запущен. Статус: /status, останов: /stop")
}

pub fn smoked_text() -> String {
    escape_markdown_v2("🚬 Сигарета засчитана.")
}

pub fn new_available_text(session: &UserSession, now: i64) -> String {
    format!(
        "{}\n\n{}",
        escape_markdown_v2(&format!(
            "🔔 Доступна новая сигарета! Всего доступно: {}",
            session.available_count
        )),
        status_text(session, now)
    )
}

pub fn stopped_text(session: &UserSession) -> String {
    escape_markdown_v2(&format!(
        "🔴 Таймер остановлен. Выкурено сигарет: {}",
        session.smoked_count
    ))
}

pub fn wakeup_error_text(session: &UserSession, now: i64) -> String {
    format!(
        "{}\n\n{}\n\n{}",
        escape_markdown_v2(
            "⚠️ Таймер сработал не вовремя и был остановлен. \
             Проверьте настройки и запустите его заново командой /run"
        ),
        settings_text(session),
        status_text(session, now)
    )
}

pub fn not_understood_text(text: &str) -> String {
    escape_markdown_v2(&format!("🤷 Не понимаю «{}». Список команд: /help", text))
}

pub fn edited_message_text() -> String {
    escape_markdown_v2("✏️ Изменённые сообщения не обрабатываются, отправьте команду заново.")
}

pub fn bot_started_text(users: usize) -> String {
    escape_markdown_v2(&format!("🤖 Бот запущен, пользователей: {}", users))
}

pub fn make_status_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "🔄 Обновить",
        format!("{} {}", STATUS_CALLBACK_COMMAND, STATUS_CALLBACK_ACTION),
    )]])
}

fn adjust_steps(setting: Setting) -> &'static [i64] {
    match setting {
        Setting::Interval => &[-60, -10, -1, 1, 10, 60],
        Setting::Initial | Setting::TzOffset | Setting::Mode => &[-1, 1],
    }
}

/// Клавиатура выбора значения: `<setting> adjust <delta>` и `<setting> set <value>`
pub fn make_setting_keyboard(draft: &SettingDraft) -> InlineKeyboardMarkup {
    let name = draft.setting.name();

    let steps = adjust_steps(draft.setting)
        .iter()
        .map(|step| {
            let label = match draft.setting {
                Setting::Mode if *step < 0 => "◀️ авто".to_string(),
                Setting::Mode => "ручной ▶️".to_string(),
                _ => format!("{:+}", step),
            };
            InlineKeyboardButton::callback(label, format!("{} adjust {}", name, step))
        })
        .collect::<Vec<_>>();

    InlineKeyboardMarkup::new(vec![
        steps,
        vec![InlineKeyboardButton::callback(
            "✅ Сохранить",
            format!("{} set {}", name, draft.value),
        )],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_specials_are_escaped() {
        assert_eq!(escape_markdown_v2("a.b!(c)"), "a\\.b\\!\\(c\\)");
    }

    #[test]
    fn time_respects_offset() {
        // 1970-01-01 01:30 UTC
        assert_eq!(format_time(5_400, 0), "01:30");
        assert_eq!(format_time(5_400, 3), "04:30");
        assert_eq!(format_time(5_400, -2), "23:30");
    }

    #[test]
    fn timedelta_formats() {
        assert_eq!(format_timedelta(3_600), "01:00");
        assert_eq!(format_timedelta(3_599), "00:59");
        assert_eq!(format_timedelta(42), "00:00.42");
        assert_eq!(format_timedelta(-5), "00:00.00");
    }

    #[test]
    fn keyboard_uses_callback_grammar() {
        let draft = SettingDraft {
            setting: Setting::Initial,
            value: 2,
        };
        let keyboard = make_setting_keyboard(&draft);
        assert_eq!(keyboard.inline_keyboard.len(), 2);
        assert_eq!(keyboard.inline_keyboard[0].len(), 2);
        assert_eq!(keyboard.inline_keyboard[1].len(), 1);
    }
}
