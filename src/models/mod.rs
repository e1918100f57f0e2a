pub mod session;

pub use session::{Setting, SettingDraft, TimerMode, TimerState, UserSession};
