use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutycycleErrorCode {
    E001UnknownTask,
    E002InvalidRecurrence,
    E003InvalidTimeOfDay,
    E004UnknownTarget,
}

impl DutycycleErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001UnknownTask => "E001_UNKNOWN_TASK",
            Self::E002InvalidRecurrence => "E002_INVALID_RECURRENCE",
            Self::E003InvalidTimeOfDay => "E003_INVALID_TIME_OF_DAY",
            Self::E004UnknownTarget => "E004_UNKNOWN_TARGET",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DutycycleError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),
    #[error("invalid time of day `{0}`: expected HH:MM")]
    InvalidTimeOfDay(String),
    #[error("no task body registered for target `{0}`")]
    UnknownTarget(String),
}

impl DutycycleError {
    pub fn code(&self) -> DutycycleErrorCode {
        match self {
            Self::UnknownTask(_) => DutycycleErrorCode::E001UnknownTask,
            Self::InvalidRecurrence(_) => DutycycleErrorCode::E002InvalidRecurrence,
            Self::InvalidTimeOfDay(_) => DutycycleErrorCode::E003InvalidTimeOfDay,
            Self::UnknownTarget(_) => DutycycleErrorCode::E004UnknownTarget,
        }
    }
}
