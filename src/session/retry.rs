use std::time::Duration;

/// Per-attempt policy for one send/await exchange: every attempt gets its own
/// write and read deadline, and the budget bounds the number of attempts
/// before the whole cycle is restarted.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}
