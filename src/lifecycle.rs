use crate::error::{EngineError, EngineResult};

/// Top-level lifecycle of an engine, mirroring §4.8's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Disposed,
}

impl LifecycleState {
    pub fn is_disposed(&self) -> bool {
        matches!(self, LifecycleState::Disposed)
    }

    /// Whether `start()` may be called from this state (possibly after
    /// waiting for an in-flight stop, per `Stopping.start`).
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            LifecycleState::Constructed
                | LifecycleState::Stopped
                | LifecycleState::Stopping
                | LifecycleState::Starting
        )
    }

    /// Whether `stop()` may be called from this state.
    pub fn can_stop(&self) -> bool {
        matches!(self, LifecycleState::Started | LifecycleState::Starting)
    }

    pub fn check_not_disposed(&self) -> EngineResult<()> {
        if self.is_disposed() {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Constructed => "Constructed",
            LifecycleState::Starting => "Starting",
            LifecycleState::Started => "Started",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Disposed => "Disposed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposed_rejects_every_operation() {
        assert!(LifecycleState::Disposed.check_not_disposed().is_err());
        for s in [
            LifecycleState::Constructed,
            LifecycleState::Starting,
            LifecycleState::Started,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ] {
            assert!(s.check_not_disposed().is_ok());
        }
    }

    #[test]
    fn stopping_may_still_start() {
        assert!(LifecycleState::Stopping.can_start());
    }
}
