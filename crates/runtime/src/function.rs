//! Script and native functions
//!
//! Both function kinds share the metadata header ([`lemon_core::FunctionInfo`]):
//! ID, name, optional method context, alias names, return type, parameters,
//! signature hash and flags. Script functions add bytecode, local variables,
//! labels, pragmas and source info; native functions add the type-erased
//! wrapper around the host callable.

use lemon_core::{
    make_variable_id, FlyweightString, FunctionInfo, Opcode, VariableInfo, VariableKind,
};

use crate::exec::ExecContext;
use crate::native::NativeFunctionWrapper;

/// A local variable declared inside a script function. The ID is
/// frame-relative (kind nibble `Local`).
#[derive(Debug, Clone)]
pub struct LocalVariable {
    pub info: VariableInfo,
    pub declared_line: u32,
}

/// A named jump target inside a script function.
#[derive(Debug, Clone)]
pub struct Label {
    pub name: FlyweightString,
    /// Opcode index the label points at.
    pub offset: u32,
}

/// A function implemented in bytecode.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub info: FunctionInfo,
    pub opcodes: Vec<Opcode>,
    pub local_variables: Vec<LocalVariable>,
    pub labels: Vec<Label>,
    pub pragmas: Vec<String>,
    /// Index into the module's source file infos.
    pub source_file_index: usize,
    pub source_base_line_offset: u32,
}

impl ScriptFunction {
    pub fn new(info: FunctionInfo) -> Self {
        ScriptFunction {
            info,
            opcodes: Vec::new(),
            local_variables: Vec::new(),
            labels: Vec::new(),
            pragmas: Vec::new(),
            source_file_index: 0,
            source_base_line_offset: 0,
        }
    }

    /// Allocate the next local-variable slot. The caller is responsible for
    /// scope checks; a function-level duplicate is allowed to be reused by
    /// the token processor when the old one went out of scope.
    pub fn add_local_variable(
        &mut self,
        name: FlyweightString,
        data_type: lemon_core::DataTypeRef,
        declared_line: u32,
    ) -> VariableInfo {
        let info = VariableInfo {
            id: make_variable_id(VariableKind::Local, self.local_variables.len() as u32),
            name,
            data_type,
        };
        self.local_variables.push(LocalVariable {
            info: info.clone(),
            declared_line,
        });
        info
    }

    pub fn local_variable_by_name(&self, name_hash: u64) -> Option<&LocalVariable> {
        self.local_variables
            .iter()
            .find(|variable| variable.info.name.hash() == name_hash)
    }

    pub fn add_label(&mut self, name: FlyweightString, offset: u32) {
        self.labels.push(Label { name, offset });
    }

    pub fn label_by_name(&self, name_hash: u64) -> Option<&Label> {
        self.labels.iter().find(|label| label.name.hash() == name_hash)
    }
}

/// A function implemented by the host. The wrapper is shared so that the
/// compiler can execute `COMPILE_TIME_CONSTANT` natives through a registry
/// without reaching into module storage.
pub struct NativeFunction {
    pub info: FunctionInfo,
    pub wrapper: std::sync::Arc<NativeFunctionWrapper>,
}

impl NativeFunction {
    /// Pops arguments, runs the host callable, pushes the result.
    pub fn execute(&self, context: &mut ExecContext<'_>) {
        (self.wrapper.callable)(context);
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

/// Borrowed view over either function kind.
#[derive(Debug, Clone, Copy)]
pub enum Function<'a> {
    Script(&'a ScriptFunction),
    Native(&'a NativeFunction),
}

impl<'a> Function<'a> {
    pub fn info(&self) -> &'a FunctionInfo {
        match self {
            Function::Script(function) => &function.info,
            Function::Native(function) => &function.info,
        }
    }

    pub fn as_script(&self) -> Option<&'a ScriptFunction> {
        match self {
            Function::Script(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&'a NativeFunction> {
        match self {
            Function::Native(function) => Some(function),
            _ => None,
        }
    }
}
