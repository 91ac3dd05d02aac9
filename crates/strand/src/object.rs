use std::fmt::{self, Write};

use crate::{
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData},
    runtime::Runtime,
    types::{
        DictKey,
        class::{builtin_base_of, class_name},
        exception::message_of,
    },
    value::Value,
};

/// A value detached from the heap, for passing across the host boundary.
///
/// Converting a [`Value`] into an `Object` copies containers recursively. Values
/// with no host representation (functions, generators, frames, ...) become
/// `Repr` and cannot be converted back.
///
/// # JSON
///
/// [`to_json_value`](Self::to_json_value) produces natural JSON for scalars,
/// lists and dicts; the other kinds use `$`-prefixed wrapper objects:
/// - `Tuple` → `{"$tuple": [...]}`
/// - `Exception` → `{"$exception": {"type": "...", "message": "..."}}`
/// - `Repr` → `{"$repr": "..."}`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Object {
    #[serde(alias = "none", alias = "NoneType")]
    None,
    #[serde(alias = "bool")]
    Bool(bool),
    #[serde(alias = "int")]
    Int(i64),
    #[serde(alias = "float")]
    Float(f64),
    #[serde(alias = "str")]
    String(String),
    #[serde(alias = "list")]
    List(Vec<Self>),
    #[serde(alias = "tuple")]
    Tuple(Vec<Self>),
    /// String-keyed or scalar-keyed mapping, in insertion order.
    #[serde(alias = "dict")]
    Dict(Vec<(Self, Self)>),
    /// An exception instance or class.
    Exception {
        /// Closest builtin type.
        exc_type: ExcType,
        /// Actual class name, which differs from `exc_type` for user classes.
        type_name: String,
        message: Option<String>,
    },
    /// Output-only: `repr()` of a value the host cannot hold directly.
    Repr(String),
}

const MAX_DEPTH: usize = 64;

impl Object {
    /// Copies `value` out of the heap.
    #[must_use]
    pub fn from_value(value: &Value, heap: &Heap) -> Self {
        Self::from_value_depth(value, heap, 0)
    }

    fn from_value_depth(value: &Value, heap: &Heap, depth: usize) -> Self {
        if depth > MAX_DEPTH {
            return Self::Repr("...".to_owned());
        }
        let items = |values: &[Value]| {
            values
                .iter()
                .map(|v| Self::from_value_depth(v, heap, depth + 1))
                .collect::<Vec<_>>()
        };
        match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => Self::Float(*f),
            Value::ExcClass(t) => Self::Exception {
                exc_type: *t,
                type_name: t.to_string(),
                message: None,
            },
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Self::String(s.as_str().to_owned()),
                HeapData::List(l) => Self::List(items(l.as_slice())),
                HeapData::Tuple(t) => Self::Tuple(items(t.as_slice())),
                HeapData::Dict(d) => Self::Dict(
                    d.iter()
                        .map(|(k, v)| (Self::from_key(k), Self::from_value_depth(v, heap, depth + 1)))
                        .collect(),
                ),
                HeapData::Exception(e) => Self::Exception {
                    exc_type: builtin_base_of(e.class(), heap).unwrap_or(ExcType::Exception),
                    type_name: class_name(e.class(), heap).into_owned(),
                    message: message_of(value, heap),
                },
                HeapData::Class(_) => Self::Exception {
                    exc_type: builtin_base_of(value, heap).unwrap_or(ExcType::Exception),
                    type_name: class_name(value, heap).into_owned(),
                    message: None,
                },
                _ => Self::Repr(value.py_repr(heap)),
            },
            other => Self::Repr(other.py_repr(heap)),
        }
    }

    fn from_key(key: &DictKey) -> Self {
        match key {
            DictKey::None => Self::None,
            DictKey::Bool(b) => Self::Bool(*b),
            DictKey::Int(i) => Self::Int(*i),
            DictKey::Str(s) => Self::String(s.clone()),
        }
    }

    /// Allocates the object on `rt`'s heap.
    ///
    /// Exceptions become their builtin class; `Repr` cannot be converted back.
    pub fn to_value(&self, rt: &mut Runtime) -> RunResult<Value> {
        Ok(match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Float(f) => Value::Float(*f),
            Self::String(s) => rt.new_str(s.as_str())?,
            Self::List(items) => {
                let values = Self::to_values(items, rt)?;
                rt.new_list(values)?
            }
            Self::Tuple(items) => {
                let values = Self::to_values(items, rt)?;
                rt.new_tuple(values)?
            }
            Self::Dict(pairs) => {
                let mut entries = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let Self::String(key) = k else {
                        rt.drop_value(entries);
                        return Err(ExcType::type_error(format!("dict key {k} is not a string")));
                    };
                    match v.to_value(rt) {
                        Ok(value) => entries.push((key.clone(), value)),
                        Err(e) => {
                            rt.drop_value(entries);
                            return Err(e);
                        }
                    }
                }
                rt.new_dict(entries)?
            }
            Self::Exception { exc_type, .. } => Value::ExcClass(*exc_type),
            Self::Repr(_) => return Err(ExcType::type_error("a repr placeholder cannot be converted to a value")),
        })
    }

    fn to_values(items: &[Self], rt: &mut Runtime) -> RunResult<Vec<Value>> {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match item.to_value(rt) {
                Ok(v) => values.push(v),
                Err(e) => {
                    rt.drop_value(values);
                    return Err(e);
                }
            }
        }
        Ok(values)
    }

    #[must_use]
    pub fn to_json_value(&self) -> serde_json::Value {
        use serde_json::{Value as JV, json};
        match self {
            Self::None => JV::Null,
            Self::Bool(b) => JV::Bool(*b),
            Self::Int(i) => json!(i),
            Self::Float(f) => {
                if f.is_nan() || f.is_infinite() {
                    JV::Null
                } else {
                    json!(f)
                }
            }
            Self::String(s) => JV::String(s.clone()),
            Self::List(items) => JV::Array(items.iter().map(Self::to_json_value).collect()),
            Self::Tuple(items) => json!({"$tuple": items.iter().map(Self::to_json_value).collect::<Vec<_>>()}),
            Self::Dict(pairs) => {
                let map: serde_json::Map<String, JV> = pairs
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Self::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key, v.to_json_value())
                    })
                    .collect();
                JV::Object(map)
            }
            Self::Exception {
                type_name, message, ..
            } => json!({"$exception": {"type": type_name, "message": message}}),
            Self::Repr(s) => json!({"$repr": s}),
        }
    }

    fn repr_fmt(&self, f: &mut impl Write) -> fmt::Result {
        let seq = |f: &mut dyn Write, items: &[Self]| -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        };
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Self::List(items) => {
                f.write_char('[')?;
                seq(f, items)?;
                f.write_char(']')
            }
            Self::Tuple(items) => {
                f.write_char('(')?;
                seq(f, items)?;
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            Self::Dict(pairs) => {
                f.write_char('{')?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_char('}')
            }
            Self::Exception {
                type_name,
                message: Some(m),
                ..
            } => write!(f, "{type_name}('{m}')"),
            Self::Exception { type_name, .. } => write!(f, "{type_name}()"),
            Self::Repr(s) => f.write_str(s),
        }
    }
}

impl fmt::Display for Object {
    /// Python `repr()` formatting.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.repr_fmt(f)
    }
}
