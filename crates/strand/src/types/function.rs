use std::{fmt, rc::Rc};

use crate::{
    args::ArgValues,
    exception_private::RunResult,
    frame::CodeInfo,
    generator::GeneratorScope,
    heap::HeapId,
    runtime::Runtime,
    value::Value,
};

/// Body of a plain function. Runs on the caller's stack with its own frame pushed.
pub type FunctionBody = Rc<dyn Fn(&mut Runtime) -> RunResult<Value>>;

/// Body of a generator or coroutine. Runs on a fiber and suspends through the scope.
pub type GeneratorBody = Rc<dyn Fn(&mut GeneratorScope<'_>) -> RunResult<Value>>;

/// Host function called with the raw argument bundle. No frame is pushed for it.
pub type NativeFn = Rc<dyn Fn(&mut Runtime, ArgValues) -> RunResult<Value>>;

/// What calling a [`Function`] does.
#[derive(Clone)]
pub enum FunctionKind {
    /// Binds arguments into a fresh frame and runs the body to completion.
    Function(FunctionBody),
    /// Binds arguments and returns a new, unstarted generator.
    Generator(GeneratorBody),
    /// Binds arguments and returns a new, unstarted coroutine.
    Coroutine(GeneratorBody),
    Native(NativeFn),
}

impl fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Function(_) => "Function",
            Self::Generator(_) => "Generator",
            Self::Coroutine(_) => "Coroutine",
            Self::Native(_) => "Native",
        })
    }
}

/// A callable defined by the host.
///
/// `defaults` fill the trailing positional parameters of `code`; `closure`
/// holds the values (usually cells) every frame created for this function can
/// read through `Runtime::closure`.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub(crate) code: Rc<CodeInfo>,
    pub(crate) defaults: Vec<Value>,
    pub(crate) closure: Vec<Value>,
    pub kind: FunctionKind,
}

impl Function {
    #[must_use]
    pub fn new(code: Rc<CodeInfo>, kind: FunctionKind) -> Self {
        Self {
            name: code.name.clone(),
            code,
            defaults: Vec::new(),
            closure: Vec::new(),
            kind,
        }
    }

    #[must_use]
    pub fn code(&self) -> &Rc<CodeInfo> {
        &self.code
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in self.defaults.iter_mut().chain(self.closure.iter_mut()) {
            value.dec_ref_ids(stack);
        }
    }
}
