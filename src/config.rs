use std::time::Duration;

/// What happens to the `post` future when a handler throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostMessageErrorPolicy {
    /// `post` resolves normally; the error is only visible on the
    /// `failedMessages` stream.
    ConvertToFailedMessage,
    /// `post` resolves with the handler's error.
    Rethrow,
}

impl Default for PostMessageErrorPolicy {
    fn default() -> Self {
        PostMessageErrorPolicy::ConvertToFailedMessage
    }
}

/// Tunables for one engine instance, set at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub redirect_limit: u32,
    pub post_error_policy: PostMessageErrorPolicy,
    pub queue_capacity: usize,
    pub broadcast_capacity: usize,
    pub min_timer_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redirect_limit: 5,
            post_error_policy: PostMessageErrorPolicy::ConvertToFailedMessage,
            queue_capacity: 1024,
            broadcast_capacity: 256,
            min_timer_interval: Duration::from_micros(50),
        }
    }
}

impl EngineConfig {
    pub fn redirect_limit(mut self, n: u32) -> Self {
        self.redirect_limit = n;
        self
    }

    pub fn post_error_policy(mut self, p: PostMessageErrorPolicy) -> Self {
        self.post_error_policy = p;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn broadcast_capacity(mut self, n: usize) -> Self {
        self.broadcast_capacity = n;
        self
    }

    pub fn min_timer_interval(mut self, d: Duration) -> Self {
        self.min_timer_interval = d;
        self
    }
}
