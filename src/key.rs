use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Opaque identity of a state in the tree. Two states are equal iff they carry
/// the same name and the same bound data type (or both carry none).
///
/// Equality never crosses the plain/typed boundary: a plain key and a
/// data-typed key with the same name are always distinct, because a plain
/// key's `data_type` is `None` and a typed key's is `Some(_)`.
#[derive(Clone)]
pub struct StateKey(pub(crate) Arc<KeyInner>);

pub(crate) struct KeyInner {
    pub(crate) name: String,
    pub(crate) data_type: Option<TypeId>,
    pub(crate) data_type_name: Option<&'static str>,
}

impl StateKey {
    /// A plain key carrying only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(KeyInner {
            name: name.into(),
            data_type: None,
            data_type_name: None,
        }))
    }

    /// A data-typed key whose identity additionally binds the static type `D`.
    pub fn typed<D: 'static>(name: impl Into<String>) -> Self {
        Self(Arc::new(KeyInner {
            name: name.into(),
            data_type: Some(TypeId::of::<D>()),
            data_type_name: Some(std::any::type_name::<D>()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn data_type(&self) -> Option<TypeId> {
        self.0.data_type
    }

    pub fn is_data_typed(&self) -> bool {
        self.0.data_type.is_some()
    }
}

impl PartialEq for StateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name && self.0.data_type == other.0.data_type
    }
}
impl Eq for StateKey {}

impl Hash for StateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
        self.0.data_type.hash(state);
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.data_type_name {
            Some(t) => write!(f, "StateKey({:?}: {})", self.0.name, t),
            None => write!(f, "StateKey({:?})", self.0.name),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// A [`StateKey`] that statically carries its bound data type `D` as a
/// phantom marker, so `ctx.data::<D>(key)` lookups are checked at compile
/// time instead of requiring a reflective walk of ancestors.
pub struct DataStateKey<D> {
    key: StateKey,
    _marker: PhantomData<fn() -> D>,
}

impl<D: 'static> DataStateKey<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            key: StateKey::typed::<D>(name),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn into_key(self) -> StateKey {
        self.key
    }
}

impl<D> Clone for DataStateKey<D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<D> fmt::Debug for DataStateKey<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.key, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_keys_compare_by_name() {
        assert_eq!(StateKey::new("a"), StateKey::new("a"));
        assert_ne!(StateKey::new("a"), StateKey::new("b"));
    }

    #[test]
    fn typed_and_plain_keys_never_compare_equal() {
        let plain = StateKey::new("door");
        let typed = StateKey::typed::<u32>("door");
        assert_ne!(plain, typed);
    }

    #[test]
    fn typed_keys_with_different_data_types_are_distinct() {
        let a = StateKey::typed::<u32>("door");
        let b = StateKey::typed::<i64>("door");
        assert_ne!(a, b);
    }

    #[test]
    fn data_state_key_round_trips_to_its_state_key() {
        let k = DataStateKey::<u32>::new("speed");
        assert_eq!(k.key(), &StateKey::typed::<u32>("speed"));
    }
}
