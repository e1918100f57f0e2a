use serde::{Deserialize, Serialize};

pub const SECONDS_IN_MINUTE: i64 = 60;

pub const INTERVAL_BOUNDS: (i64, i64) = (1, 720);
pub const INITIAL_BOUNDS: (i64, i64) = (0, 3);
pub const TZ_BOUNDS: (i64, i64) = (-12, 12);

/// Режим перезапуска таймера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerMode {
    /// Таймер перезапускается сразу после срабатывания
    Auto,
    /// Таймер ждёт, пока доступная сигарета не будет выкурена
    Manual,
}

/// Настраиваемые пользователем параметры
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Interval,
    Initial,
    TzOffset,
    Mode,
}

impl Setting {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "interval" => Some(Setting::Interval),
            "initial" => Some(Setting::Initial),
            "tz" => Some(Setting::TzOffset),
            "mode" => Some(Setting::Mode),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Setting::Interval => "interval",
            Setting::Initial => "initial",
            Setting::TzOffset => "tz",
            Setting::Mode => "mode",
        }
    }

    /// Допустимые границы значения (для `mode`: 0 = auto, 1 = manual)
    pub fn bounds(self) -> (i64, i64) {
        match self {
            Setting::Interval => INTERVAL_BOUNDS,
            Setting::Initial => INITIAL_BOUNDS,
            Setting::TzOffset => TZ_BOUNDS,
            Setting::Mode => (0, 1),
        }
    }

    pub fn clamp(self, value: i64) -> i64 {
        let (low, high) = self.bounds();
        value.clamp(low, high)
    }

    pub fn contains(self, value: i64) -> bool {
        let (low, high) = self.bounds();
        (low..=high).contains(&value)
    }
}

/// Несохранённое значение настройки, редактируемое через inline-клавиатуру
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingDraft {
    pub setting: Setting,
    pub value: i64,
}

/// Состояние таймера пользователя
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Active,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: u64,
    /// false, если пользователь заблокировал бота
    pub is_active_user: bool,

    pub is_running: bool,
    pub is_timer_active: bool,

    pub mode: TimerMode,
    pub interval_minutes: u32,
    pub initial_available: u32,
    pub tz_offset_hours: i32,

    pub ran_at: Option<i64>,
    pub timer_start: Option<i64>,
    pub timer_end: Option<i64>,

    pub available_count: u32,
    pub smoked_count: u32,

    #[serde(skip)]
    pub draft: Option<SettingDraft>,
}

impl UserSession {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            is_active_user: true,
            is_running: false,
            is_timer_active: false,
            mode: TimerMode::Auto,
            interval_minutes: 60,
            initial_available: 1,
            tz_offset_hours: 0,
            ran_at: None,
            timer_start: None,
            timer_end: None,
            available_count: 0,
            smoked_count: 0,
            draft: None,
        }
    }

    pub fn interval_seconds(&self) -> i64 {
        i64::from(self.interval_minutes) * SECONDS_IN_MINUTE
    }

    pub fn timer_state(&self) -> TimerState {
        match (self.is_running, self.is_timer_active) {
            (false, _) => TimerState::Stopped,
            (true, true) => TimerState::Active,
            (true, false) => TimerState::Paused,
        }
    }

    pub fn setting_value(&self, setting: Setting) -> i64 {
        match setting {
            Setting::Interval => i64::from(self.interval_minutes),
            Setting::Initial => i64::from(self.initial_available),
            Setting::TzOffset => i64::from(self.tz_offset_hours),
            Setting::Mode => match self.mode {
                TimerMode::Auto => 0,
                TimerMode::Manual => 1,
            },
        }
    }

    /// Записывает значение, уже проверенное через `Setting::contains`
    pub fn apply_setting(&mut self, setting: Setting, value: i64) {
        let value = setting.clamp(value);
        match setting {
            Setting::Interval => self.interval_minutes = value as u32,
            Setting::Initial => self.initial_available = value as u32,
            Setting::TzOffset => self.tz_offset_hours = value as i32,
            Setting::Mode => {
                self.mode = if value == 0 { TimerMode::Auto } else { TimerMode::Manual }
            }
        }
    }

    /// Проверка загруженной записи: границы настроек и согласованность таймера
    pub fn is_valid(&self) -> bool {
        let settings_ok = [Setting::Interval, Setting::Initial, Setting::TzOffset]
            .into_iter()
            .all(|s| s.contains(self.setting_value(s)));

        let timer_ok = !self.is_timer_active
            || (self.is_running
                && matches!(
                    (self.timer_start, self.timer_end),
                    (Some(start), Some(end)) if end > start
                ));

        settings_ok && timer_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_keeps_every_field() {
        let mut session = UserSession::new(42);
        session.is_running = true;
        session.is_timer_active = true;
        session.mode = TimerMode::Manual;
        session.interval_minutes = 90;
        session.initial_available = 3;
        session.tz_offset_hours = -5;
        session.ran_at = Some(1_700_000_000);
        session.timer_start = Some(1_700_000_000);
        session.timer_end = Some(1_700_005_400);
        session.available_count = 2;
        session.smoked_count = 7;

        let json = serde_json::to_string(&session).unwrap();
        let restored: UserSession = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn missing_key_fails_to_deserialize() {
        let mut value = serde_json::to_value(UserSession::new(1)).unwrap();
        value.as_object_mut().unwrap().remove("smoked_count");
        assert!(serde_json::from_value::<UserSession>(value).is_err());
    }

    #[test]
    fn validity_checks_bounds_and_timer() {
        let mut session = UserSession::new(1);
        assert!(session.is_valid());

        session.interval_minutes = 0;
        assert!(!session.is_valid());
        session.interval_minutes = 721;
        assert!(!session.is_valid());
        session.interval_minutes = 720;
        assert!(session.is_valid());

        session.is_running = true;
        session.is_timer_active = true;
        assert!(!session.is_valid());
        session.timer_start = Some(100);
        session.timer_end = Some(100);
        assert!(!session.is_valid());
        session.timer_end = Some(160);
        assert!(session.is_valid());
    }

    #[test]
    fn mode_setting_maps_to_enum() {
        let mut session = UserSession::new(1);
        session.apply_setting(Setting::Mode, 1);
        assert_eq!(session.mode, TimerMode::Manual);
        assert_eq!(session.setting_value(Setting::Mode), 1);
        session.apply_setting(Setting::Interval, 5000);
        assert_eq!(session.interval_minutes, 720);
    }
}
