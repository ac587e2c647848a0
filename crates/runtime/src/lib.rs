//! lemon-runtime — module model, program linking, and the stack VM
//!
//! The linkable unit is a [`Module`] (functions, variables, constants,
//! constant arrays, defines, string literals, custom data types), with a
//! versioned compressed binary form. Modules link into a [`Program`], and
//! a [`Runtime`] executes it: bytecode is translated lazily per function
//! into fused runtime opcodes, then interpreted cooperatively under a
//! host-supplied step budget.

pub mod builtins;
pub mod control_flow;
pub mod error;
pub mod exec;
pub mod function;
pub mod memory;
pub mod module;
pub mod module_serializer;
pub mod native;
pub mod program;
pub mod provider;
pub mod runtime;
pub mod runtime_function;
pub mod save_state;
pub mod variable;

pub use control_flow::{ControlFlow, ControlFlowState, StackCheck};
pub use error::{BuildError, RuntimeError, SerializeError};
pub use exec::{ExecContext, ExecFn};
pub use function::{Function, Label, LocalVariable, NativeFunction, ScriptFunction};
pub use memory::{
    FlatMemoryAccessHandler, MemoryAccessHandler, NullMemoryAccessHandler, SpecializationResult,
};
pub use module::{
    add_definitions_from_module, ConstantArray, Define, FunctionSlot, Module, SourceFileInfo,
    CALLABLE_ADDRESS_BASE,
};
pub use module_serializer::{deserialize_module, serialize_module};
pub use native::{
    wrap, AnyTypeValue, ArrayRef, IntoNativeWrapper, NativeFunctionWrapper, NativeRegistry,
    StackValued, StringRef,
};
pub use program::Program;
pub use provider::{LookupDictionary, NativizedOpcodeProvider, NativizedParameter};
pub use runtime::{
    active_environment, set_active_environment, ExecuteConnector, ExecuteResult, ExecutionLocation,
    ExecutionResult, FunctionCallParameters, Runtime, RuntimeDetailHandler, StopSignal,
};
pub use runtime_function::{
    BuildEnv, GlobalsLayout, ResolvedCallTarget, RuntimeFunction, RuntimeOpcode,
    RuntimeOpcodeBuffer, RuntimeOpcodeProvider, MAX_PARAMETER_SIZE,
};
pub use variable::{
    ExternalVariableAccessor, UserVariableCallback, Variable, VariablePayload,
};
