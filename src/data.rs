use std::any::Any;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Lifecycle state of a [`DataValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataState {
    Empty,
    Holding,
    Closed,
}

/// A value container scoped to one activation of a data state. Created on
/// entry, destroyed on exit; re-entering the state later creates a *new*
/// instance with no memory of the old one (§4.3).
pub struct DataValue<D> {
    state: DataState,
    value: Option<D>,
}

impl<D: Clone + Send + Sync + 'static> DataValue<D> {
    pub fn empty() -> Self {
        Self {
            state: DataState::Empty,
            value: None,
        }
    }

    pub fn holding(value: D) -> Self {
        Self {
            state: DataState::Holding,
            value: Some(value),
        }
    }

    /// A degenerate container for "no data" states, always `Holding(())`,
    /// whose `close` is a no-op (§9.3).
    pub fn void() -> DataValue<()> {
        DataValue {
            state: DataState::Holding,
            value: Some(()),
        }
    }

    pub fn get(&self) -> EngineResult<D> {
        match self.state {
            DataState::Holding => Ok(self.value.clone().expect("Holding implies a value")),
            DataState::Empty | DataState::Closed => Err(EngineError::UseAfterClose),
        }
    }

    /// Reads, computes, writes, and returns the new value.
    pub fn update(&mut self, f: impl FnOnce(&D) -> D) -> EngineResult<D> {
        match self.state {
            DataState::Holding => {
                let current = self.value.as_ref().expect("Holding implies a value");
                let next = f(current);
                self.value = Some(next.clone());
                Ok(next)
            }
            DataState::Empty | DataState::Closed => Err(EngineError::UseAfterClose),
        }
    }

    pub fn is_holding(&self) -> bool {
        self.state == DataState::Holding
    }

    pub fn close(&mut self) {
        if self.state != DataState::Closed {
            self.state = DataState::Closed;
            self.value = None;
        }
    }
}

/// Converts between `D` and the JSON representation used by the snapshot
/// codec (§4.11/§6.3).
pub trait DataCodec<D>: Send + Sync {
    fn encode(&self, value: &D) -> serde_json::Value;
    fn decode(&self, value: &serde_json::Value) -> EngineResult<D>;
}

/// A [`DataCodec`] backed by `serde`, used whenever `D: Serialize +
/// DeserializeOwned`.
pub struct SerdeCodec<D>(PhantomData<fn() -> D>);

impl<D> SerdeCodec<D> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<D> Default for SerdeCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Serialize + DeserializeOwned + Send + Sync> DataCodec<D> for SerdeCodec<D> {
    fn encode(&self, value: &D) -> serde_json::Value {
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
    }

    fn decode(&self, value: &serde_json::Value) -> EngineResult<D> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Type-erased codec, stored on a [`crate::node::DataSpec`].
pub(crate) trait ErasedCodec: Send + Sync {
    fn encode_any(&self, value: &dyn Any) -> Option<serde_json::Value>;
    fn decode_any(&self, value: &serde_json::Value) -> EngineResult<Box<dyn Any + Send>>;
}

pub(crate) struct ErasedCodecImpl<D, C> {
    pub codec: C,
    pub _marker: PhantomData<fn() -> D>,
}

impl<D, C> ErasedCodec for ErasedCodecImpl<D, C>
where
    D: Clone + Send + Sync + 'static,
    C: DataCodec<D> + 'static,
{
    fn encode_any(&self, value: &dyn Any) -> Option<serde_json::Value> {
        value.downcast_ref::<D>().map(|v| self.codec.encode(v))
    }

    fn decode_any(&self, value: &serde_json::Value) -> EngineResult<Box<dyn Any + Send>> {
        let decoded = self.codec.decode(value)?;
        Ok(Box::new(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_before_holding_is_use_after_close() {
        let dv = DataValue::<u32>::empty();
        assert!(matches!(dv.get(), Err(EngineError::UseAfterClose)));
    }

    #[test]
    fn update_in_place_is_legal_and_observable() {
        let mut dv = DataValue::holding(1u32);
        let updated = dv.update(|v| v + 1).unwrap();
        assert_eq!(updated, 2);
        assert_eq!(dv.get().unwrap(), 2);
    }

    #[test]
    fn close_then_read_fails() {
        let mut dv = DataValue::holding(1u32);
        dv.close();
        assert!(matches!(dv.get(), Err(EngineError::UseAfterClose)));
    }

    #[test]
    fn void_is_always_holding_unit() {
        let dv: DataValue<()> = DataValue::void();
        assert!(dv.is_holding());
        assert_eq!(dv.get().unwrap(), ());
    }
}
