use std::{error, fmt};

/// Precondition violations the scheduler reports instead of panicking.
#[derive(Debug)]
pub enum SchedulerError {
    /// `post_response`/`post_probe` were called with a pattern key (ANY
    /// class or type). Only concrete keys can be answered.
    PatternKeyNotAllowed,
}

impl error::Error for SchedulerError {}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PatternKeyNotAllowed => {
                write!(f, "pattern keys (ANY class or type) cannot be used for a response or probe")
            }
        }
    }
}
