use crate::config::SessionSettings;
use crate::errors::ApiErrorKind;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    Lagging,
    Offline,
    UnknownStatus,
    Api(ApiErrorKind),
    /// The output directory could not be prepared.
    Storage,
    ProcessMissing,
}

impl RetryCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lagging => "lagging",
            Self::Offline => "offline",
            Self::UnknownStatus => "unknown_status",
            Self::Api(kind) => kind.as_str(),
            Self::Storage => "storage",
            Self::ProcessMissing => "process_missing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub wait: Duration,
    pub clear_room_id: bool,
    pub escalate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
    pub lag_wait: Duration,
    pub error_wait: Duration,
    /// Cookies or another authenticated path exist for gated streams.
    pub has_authenticated_fallback: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SessionSettings, has_authenticated_fallback: bool) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            lag_wait: settings.lag_wait,
            error_wait: settings.error_wait,
            has_authenticated_fallback,
        }
    }

    pub fn decide(&self, cause: RetryCause) -> RetryDecision {
        match cause {
            RetryCause::Lagging => self.wait(self.lag_wait, false),
            RetryCause::Offline => self.wait(self.poll_interval, true),
            RetryCause::UnknownStatus => self.wait(self.error_wait, true),
            RetryCause::Storage => self.wait(self.error_wait, false),
            RetryCause::ProcessMissing => Self::escalate(),
            RetryCause::Api(kind) => match kind {
                ApiErrorKind::Blacklisted => Self::escalate(),
                ApiErrorKind::LoginRequired | ApiErrorKind::AgeRestricted
                    if !self.has_authenticated_fallback =>
                {
                    Self::escalate()
                }
                _ => self.wait(self.error_wait, true),
            },
        }
    }

    fn wait(&self, wait: Duration, clear_room_id: bool) -> RetryDecision {
        RetryDecision {
            wait,
            clear_room_id,
            escalate: false,
        }
    }

    fn escalate() -> RetryDecision {
        RetryDecision {
            wait: Duration::ZERO,
            clear_room_id: true,
            escalate: true,
        }
    }
}

/// Operator wording for a wait: "Waiting 5 seconds", "Waiting 2 minutes".
pub fn describe_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        let unit = if minutes == 1 { "minute" } else { "minutes" };
        format!("Waiting {minutes} {unit}")
    } else {
        let unit = if secs == 1 { "second" } else { "seconds" };
        format!("Waiting {secs} {unit}")
    }
}
