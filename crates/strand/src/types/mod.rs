/// Heap object types.
///
/// Each type owns the values it stores and reports its heap references through
/// `dec_ref_ids` so the arena can release children when the object dies.
pub mod cell;
pub mod class;
pub mod dict;
pub mod exception;
pub mod function;
pub mod generator;
pub mod list;
pub mod str;
pub mod tuple;
pub mod weakref;

pub use cell::Cell;
pub use class::{ClassInit, ClassObject};
pub use dict::{Dict, DictKey};
pub use exception::ExceptionObject;
pub use function::{Function, FunctionBody, FunctionKind, GeneratorBody, NativeFn};
pub use generator::{Generator, GeneratorKind, GeneratorStatus};
pub use list::List;
pub use str::Str;
pub use tuple::Tuple;
pub use weakref::WeakRef;
