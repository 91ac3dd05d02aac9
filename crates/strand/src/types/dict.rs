use std::fmt;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    resource::ResourceError,
    types::Str,
    value::Value,
};

/// A hashable dict key.
///
/// Only the immutable scalar kinds are accepted; anything else is rejected by
/// [`DictKey::from_value`] with `TypeError: unhashable type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl DictKey {
    /// Converts a value into a key.
    pub fn from_value(value: &Value, heap: &Heap) -> RunResult<Self> {
        match value {
            Value::None => Ok(Self::None),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Int(i) => Ok(Self::Int(*i)),
            other => match other.as_str(heap) {
                Some(s) => Ok(Self::Str(s.to_owned())),
                None => Err(ExcType::type_error_unhashable(&other.type_name(heap))),
            },
        }
    }

    /// Materializes the key as a value, allocating for strings.
    pub fn to_value(&self, heap: &mut Heap) -> Result<Value, ResourceError> {
        Ok(match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Str(s) => Value::Ref(heap.allocate(HeapData::Str(Str::from(s.as_str())))?),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for DictKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

/// Formats the key the way `repr()` would.
impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
        }
    }
}

/// Insertion-ordered mapping, used for `**kwargs` collections and frame locals views.
#[derive(Debug, Default)]
pub struct Dict {
    entries: IndexMap<DictKey, Value, RandomState>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &DictKey) -> Option<&Value> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries.get(&DictKey::from(key))
    }

    #[must_use]
    pub fn contains_key(&self, key: &DictKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts a value, returning the one it replaced for the caller to release.
    #[must_use]
    pub fn insert(&mut self, key: DictKey, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    /// Removes a key, preserving the order of the remaining entries.
    #[must_use]
    pub fn remove(&mut self, key: &DictKey) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DictKey, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DictKey> {
        self.entries.keys()
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in self.entries.values_mut() {
            value.dec_ref_ids(stack);
        }
    }
}

impl DropWithHeap for Dict {
    fn drop_with_heap(self, heap: &mut Heap) {
        for (_, value) in self.entries {
            value.drop_with_heap(heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_like_repr() {
        assert_eq!(DictKey::from("it's").to_string(), "'it\\'s'");
        assert_eq!(DictKey::Bool(true).to_string(), "True");
        assert_eq!(DictKey::None.to_string(), "None");
    }

    #[test]
    fn insertion_order_survives_removal() {
        let mut dict = Dict::new();
        for key in ["a", "b", "c"] {
            assert!(dict.insert(DictKey::from(key), Value::Int(1)).is_none());
        }
        assert!(dict.remove(&DictKey::from("b")).is_some());
        let keys: Vec<String> = dict.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["'a'", "'c'"]);
    }
}
