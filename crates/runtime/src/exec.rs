//! Opcode exec functions
//!
//! Every straight-line runtime opcode carries a plain `fn` pointer chosen
//! at build time from the (opcode type × base type) table in
//! [`select_exec_fn`]. Control-flow opcodes are handled by the interpreter
//! loop itself and never dispatch through here.
//!
//! [`ExecContext`] bundles the mutable pieces an exec function may touch:
//! the control flow's stacks, static memory for globals, the runtime string
//! table, and the host memory handler. Native functions receive the same
//! context.

use lemon_core::{cast_base_value, AnyBaseValue, BaseType, BaseValueRepr, OpcodeType, StringLookup};

use crate::control_flow::ControlFlow;
use crate::error::BuildError;
use crate::memory::MemoryAccessHandler;
use crate::program::Program;
use crate::runtime_function::{RuntimeOpcode, RuntimeOpcodeAux};

/// Execution context handed to exec functions and native callables.
pub struct ExecContext<'a> {
    pub flow: &'a mut ControlFlow,
    pub program: &'a Program,
    /// Static memory block holding global variables.
    pub static_memory: &'a mut [u8],
    /// The runtime's string table (string keys resolve here).
    pub strings: &'a mut StringLookup,
    pub memory: &'a mut dyn MemoryAccessHandler,
}

impl ExecContext<'_> {
    /// Read a global variable's full 8-byte slot.
    pub fn read_global_slot(&self, offset: usize) -> i64 {
        let bytes: [u8; 8] = self.static_memory[offset..offset + 8]
            .try_into()
            .expect("global slots are 8 bytes");
        i64::from_le_bytes(bytes)
    }

    pub fn write_global_slot(&mut self, offset: usize, value: i64) {
        self.static_memory[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Write only the low `bytes` of a global slot (fused narrow stores).
    pub fn write_global_slot_narrow(&mut self, offset: usize, value: i64, bytes: usize) {
        let le = value.to_le_bytes();
        self.static_memory[offset..offset + bytes].copy_from_slice(&le[..bytes]);
    }
}

pub type ExecFn = fn(&mut ExecContext<'_>, &RuntimeOpcode);

// --- value traits -----------------------------------------------------------

/// Arithmetic available on every numeric base type. Integer division and
/// modulo by zero yield zero; floats follow IEEE.
pub(crate) trait ScriptValue: BaseValueRepr + PartialEq + PartialOrd + Copy {
    fn val_add(a: Self, b: Self) -> Self;
    fn val_sub(a: Self, b: Self) -> Self;
    fn val_mul(a: Self, b: Self) -> Self;
    fn val_div(a: Self, b: Self) -> Self;
    fn val_mod(a: Self, b: Self) -> Self;
    fn val_neg(a: Self) -> Self;
}

/// Bit operations, integers only. Shift amounts are masked by the type
/// width like the hardware does.
pub(crate) trait ScriptIntValue: ScriptValue {
    fn val_and(a: Self, b: Self) -> Self;
    fn val_or(a: Self, b: Self) -> Self;
    fn val_xor(a: Self, b: Self) -> Self;
    fn val_shl(a: Self, b: Self) -> Self;
    fn val_shr(a: Self, b: Self) -> Self;
    fn val_bitnot(a: Self) -> Self;
    fn val_is_zero(a: Self) -> bool;
}

macro_rules! impl_script_int {
    ($ty:ty) => {
        impl ScriptValue for $ty {
            fn val_add(a: Self, b: Self) -> Self {
                a.wrapping_add(b)
            }
            fn val_sub(a: Self, b: Self) -> Self {
                a.wrapping_sub(b)
            }
            fn val_mul(a: Self, b: Self) -> Self {
                a.wrapping_mul(b)
            }
            fn val_div(a: Self, b: Self) -> Self {
                if b == 0 {
                    0
                } else {
                    a.wrapping_div(b)
                }
            }
            fn val_mod(a: Self, b: Self) -> Self {
                if b == 0 {
                    0
                } else {
                    a.wrapping_rem(b)
                }
            }
            fn val_neg(a: Self) -> Self {
                a.wrapping_neg()
            }
        }

        impl ScriptIntValue for $ty {
            fn val_and(a: Self, b: Self) -> Self {
                a & b
            }
            fn val_or(a: Self, b: Self) -> Self {
                a | b
            }
            fn val_xor(a: Self, b: Self) -> Self {
                a ^ b
            }
            fn val_shl(a: Self, b: Self) -> Self {
                a.wrapping_shl(b as u32)
            }
            fn val_shr(a: Self, b: Self) -> Self {
                a.wrapping_shr(b as u32)
            }
            fn val_bitnot(a: Self) -> Self {
                !a
            }
            fn val_is_zero(a: Self) -> bool {
                a == 0
            }
        }
    };
}

macro_rules! impl_script_float {
    ($ty:ty) => {
        impl ScriptValue for $ty {
            fn val_add(a: Self, b: Self) -> Self {
                a + b
            }
            fn val_sub(a: Self, b: Self) -> Self {
                a - b
            }
            fn val_mul(a: Self, b: Self) -> Self {
                a * b
            }
            fn val_div(a: Self, b: Self) -> Self {
                a / b
            }
            fn val_mod(a: Self, b: Self) -> Self {
                a % b
            }
            fn val_neg(a: Self) -> Self {
                -a
            }
        }
    };
}

impl_script_int!(i8);
impl_script_int!(i16);
impl_script_int!(i32);
impl_script_int!(i64);
impl_script_int!(u8);
impl_script_int!(u16);
impl_script_int!(u32);
impl_script_int!(u64);
impl_script_float!(f32);
impl_script_float!(f64);

// --- straight-line exec functions -------------------------------------------

pub(crate) fn exec_nop(_context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {}

pub(crate) fn exec_move_stack(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    context.flow.move_value_stack(op.param_i64(0));
}

pub(crate) fn exec_move_var_stack(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    if !context.flow.move_locals(op.param_i64(0)) {
        tracing::warn!("local-variable buffer limit reached, skipping frame locals");
    }
}

pub(crate) fn exec_push_constant(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    context.flow.push(op.param_u64(0));
}

fn exec_get_variable_local(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let index = lemon_core::variable_index_of_id(op.param_u32(0)) as usize;
    let value = context.flow.read_local(index);
    context.flow.push(value);
}

fn exec_set_variable_local(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let index = lemon_core::variable_index_of_id(op.param_u32(0)) as usize;
    let value = context.flow.read_value::<i64>(-1);
    context.flow.write_local(index, value);
}

fn exec_get_variable_global(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let offset = op.param_u32(4) as usize;
    let value = context.read_global_slot(offset);
    context.flow.push(value);
}

fn exec_set_variable_global(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let offset = op.param_u32(4) as usize;
    let value = context.flow.read_value::<i64>(-1);
    context.write_global_slot(offset, value);
}

fn exec_get_variable_user(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let id = op.param_u32(0);
    let getter = context
        .program
        .global_variable_by_id(id)
        .and_then(|variable| variable.user_getter().cloned());
    match getter {
        // The getter pushes the value onto the stack.
        Some(getter) => getter(context),
        None => context.flow.push(0u64),
    }
}

fn exec_set_variable_user(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let id = op.param_u32(0);
    let setter = context
        .program
        .global_variable_by_id(id)
        .and_then(|variable| variable.user_setter().cloned());
    if let Some(setter) = setter {
        // Plain SET keeps the value on the stack; hand the setter a copy.
        let value = context.flow.read_value::<i64>(-1);
        context.flow.push(value);
        setter(context);
    }
}

fn exec_get_variable_external(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let value = match op.aux() {
        Some(RuntimeOpcodeAux::ExternalCell(cell)) => {
            cell.load(std::sync::atomic::Ordering::Relaxed)
        }
        _ => 0,
    };
    context.flow.push(value);
}

fn exec_set_variable_external(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    if let Some(RuntimeOpcodeAux::ExternalCell(cell)) = op.aux() {
        let value = context.flow.read_value::<i64>(-1);
        cell.store(value, std::sync::atomic::Ordering::Relaxed);
    }
}

fn exec_read_memory<T: ScriptIntValue>(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let size = std::mem::size_of::<T>();
    if op.param_u64(0) == 0 {
        let address = context.flow.pop::<u64>();
        let value = context.memory.read_sized(address, size);
        context.flow.push(T::from_cell(value));
    } else {
        // No-consume variant: the address stays on the stack.
        let address = context.flow.read_value::<u64>(-1);
        let value = context.memory.read_sized(address, size);
        context.flow.push(T::from_cell(value));
    }
}

fn exec_write_memory<T: ScriptIntValue>(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let size = std::mem::size_of::<T>();
    if op.param_u64(0) == 0 {
        // Stack is [value, address]; pop the address, keep the value.
        let address = context.flow.pop::<u64>();
        let value = context.flow.read_value::<T>(-1);
        context.memory.write_sized(address, value.into_cell(), size);
    } else {
        // Exchanged order: [address, value]; keep the value.
        let value = context.flow.read_value::<T>(-1);
        let address = context.flow.read_value::<u64>(-2);
        context.memory.write_sized(address, value.into_cell(), size);
        context.flow.write_value(-2, value);
        context.flow.move_value_stack(-1);
    }
}

pub(crate) fn exec_cast_value(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let source = BaseType::from_u8(op.param_u8(0)).unwrap_or(BaseType::Uint64);
    let target = BaseType::from_u8(op.param_u8(1)).unwrap_or(BaseType::Uint64);
    let value = AnyBaseValue::from_raw(context.flow.read_value::<u64>(-1));
    if let Some(cast) = cast_base_value(value, source, target) {
        context.flow.write_value(-1, cast.raw());
    }
}

pub(crate) fn exec_make_bool(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
    let value = context.flow.read_value::<u64>(-1);
    context.flow.write_value(-1, (value != 0) as u64);
}

macro_rules! binary_exec {
    ($name:ident, $trait_:ident, $method:ident) => {
        fn $name<T: $trait_>(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
            let b = context.flow.read_value::<T>(-1);
            let a = context.flow.read_value::<T>(-2);
            context.flow.write_value(-2, T::$method(a, b));
            context.flow.move_value_stack(-1);
        }
    };
}

binary_exec!(exec_arithm_add, ScriptValue, val_add);
binary_exec!(exec_arithm_sub, ScriptValue, val_sub);
binary_exec!(exec_arithm_mul, ScriptValue, val_mul);
binary_exec!(exec_arithm_div, ScriptValue, val_div);
binary_exec!(exec_arithm_mod, ScriptValue, val_mod);
binary_exec!(exec_arithm_and, ScriptIntValue, val_and);
binary_exec!(exec_arithm_or, ScriptIntValue, val_or);
binary_exec!(exec_arithm_xor, ScriptIntValue, val_xor);

fn exec_arithm_shl<T: ScriptIntValue>(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
    let b = context.flow.read_value::<u64>(-1);
    let a = context.flow.read_value::<T>(-2);
    let masked = (b as u32) & (std::mem::size_of::<T>() as u32 * 8 - 1);
    context.flow.write_value(-2, T::val_shl(a, T::from_cell(masked as u64)));
    context.flow.move_value_stack(-1);
}

fn exec_arithm_shr<T: ScriptIntValue>(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
    let b = context.flow.read_value::<u64>(-1);
    let a = context.flow.read_value::<T>(-2);
    let masked = (b as u32) & (std::mem::size_of::<T>() as u32 * 8 - 1);
    context.flow.write_value(-2, T::val_shr(a, T::from_cell(masked as u64)));
    context.flow.move_value_stack(-1);
}

fn exec_arithm_neg<T: ScriptValue>(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
    let a = context.flow.read_value::<T>(-1);
    context.flow.write_value(-1, T::val_neg(a));
}

fn exec_arithm_not<T: ScriptIntValue>(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
    let a = context.flow.read_value::<T>(-1);
    context.flow.write_value(-1, T::val_is_zero(a) as u64);
}

fn exec_arithm_bitnot<T: ScriptIntValue>(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
    let a = context.flow.read_value::<T>(-1);
    context.flow.write_value(-1, T::val_bitnot(a));
}

macro_rules! compare_exec {
    ($name:ident, $op:tt) => {
        fn $name<T: ScriptValue>(context: &mut ExecContext<'_>, _opcode: &RuntimeOpcode) {
            let b = context.flow.read_value::<T>(-1);
            let a = context.flow.read_value::<T>(-2);
            context.flow.write_value(-2, (a $op b) as u64);
            context.flow.move_value_stack(-1);
        }
    };
}

compare_exec!(exec_compare_eq, ==);
compare_exec!(exec_compare_neq, !=);
compare_exec!(exec_compare_lt, <);
compare_exec!(exec_compare_le, <=);
compare_exec!(exec_compare_gt, >);
compare_exec!(exec_compare_ge, >=);

// --- dispatch ----------------------------------------------------------------

/// Select a generic exec function for any numeric base type.
macro_rules! select_numeric {
    ($func:ident, $base:expr) => {
        match $base {
            BaseType::Int8 => Ok($func::<i8> as ExecFn),
            BaseType::Int16 => Ok($func::<i16> as ExecFn),
            BaseType::Int32 => Ok($func::<i32> as ExecFn),
            BaseType::Int64 => Ok($func::<i64> as ExecFn),
            BaseType::Uint8 => Ok($func::<u8> as ExecFn),
            BaseType::Uint16 => Ok($func::<u16> as ExecFn),
            BaseType::Uint32 => Ok($func::<u32> as ExecFn),
            BaseType::Uint64 | BaseType::IntConst | BaseType::String => Ok($func::<u64> as ExecFn),
            BaseType::Float => Ok($func::<f32> as ExecFn),
            BaseType::Double => Ok($func::<f64> as ExecFn),
            other => Err(BuildError::UnsupportedOpcode(format!(
                "data type {:?} not valid for {}",
                other,
                stringify!($func)
            ))),
        }
    };
}

/// Select a generic exec function for integer base types only.
macro_rules! select_integer {
    ($func:ident, $base:expr) => {
        match $base {
            BaseType::Int8 => Ok($func::<i8> as ExecFn),
            BaseType::Int16 => Ok($func::<i16> as ExecFn),
            BaseType::Int32 => Ok($func::<i32> as ExecFn),
            BaseType::Int64 => Ok($func::<i64> as ExecFn),
            BaseType::Uint8 => Ok($func::<u8> as ExecFn),
            BaseType::Uint16 => Ok($func::<u16> as ExecFn),
            BaseType::Uint32 => Ok($func::<u32> as ExecFn),
            BaseType::Uint64 | BaseType::IntConst => Ok($func::<u64> as ExecFn),
            other => Err(BuildError::UnsupportedOpcode(format!(
                "data type {:?} not valid for {}",
                other,
                stringify!($func)
            ))),
        }
    };
}

/// Exec function for a straight-line opcode, chosen by type and data type.
/// Control-flow opcodes are valid input and get [`exec_nop`] (the
/// interpreter never calls it).
pub(crate) fn select_exec_fn(
    opcode_type: OpcodeType,
    data_type: BaseType,
    variable_kind: Option<lemon_core::VariableKind>,
) -> Result<ExecFn, BuildError> {
    use lemon_core::VariableKind as VK;
    use OpcodeType as O;

    match opcode_type {
        O::Nop => Ok(exec_nop),
        O::MoveStack => Ok(exec_move_stack),
        O::MoveVarStack => Ok(exec_move_var_stack),
        O::PushConstant => Ok(exec_push_constant),
        O::GetVariableValue => Ok(match variable_kind {
            Some(VK::User) => exec_get_variable_user,
            Some(VK::Global) => exec_get_variable_global,
            Some(VK::External) => exec_get_variable_external,
            _ => exec_get_variable_local,
        }),
        O::SetVariableValue => Ok(match variable_kind {
            Some(VK::User) => exec_set_variable_user,
            Some(VK::Global) => exec_set_variable_global,
            Some(VK::External) => exec_set_variable_external,
            _ => exec_set_variable_local,
        }),
        O::ReadMemory => select_integer!(exec_read_memory, data_type),
        O::WriteMemory => select_integer!(exec_write_memory, data_type),
        O::CastValue => Ok(exec_cast_value),
        O::MakeBool => Ok(exec_make_bool),
        O::ArithmAdd => select_numeric!(exec_arithm_add, data_type),
        O::ArithmSub => select_numeric!(exec_arithm_sub, data_type),
        O::ArithmMul => select_numeric!(exec_arithm_mul, data_type),
        O::ArithmDiv => select_numeric!(exec_arithm_div, data_type),
        O::ArithmMod => select_numeric!(exec_arithm_mod, data_type),
        O::ArithmAnd => select_integer!(exec_arithm_and, data_type),
        O::ArithmOr => select_integer!(exec_arithm_or, data_type),
        O::ArithmXor => select_integer!(exec_arithm_xor, data_type),
        O::ArithmShl => select_integer!(exec_arithm_shl, data_type),
        O::ArithmShr => select_integer!(exec_arithm_shr, data_type),
        O::ArithmNeg => select_numeric!(exec_arithm_neg, data_type),
        O::ArithmNot => select_integer!(exec_arithm_not, data_type),
        O::ArithmBitnot => select_integer!(exec_arithm_bitnot, data_type),
        O::CompareEq => select_numeric!(exec_compare_eq, data_type),
        O::CompareNeq => select_numeric!(exec_compare_neq, data_type),
        O::CompareLt => select_numeric!(exec_compare_lt, data_type),
        O::CompareLe => select_numeric!(exec_compare_le, data_type),
        O::CompareGt => select_numeric!(exec_compare_gt, data_type),
        O::CompareGe => select_numeric!(exec_compare_ge, data_type),
        O::Jump | O::JumpConditional | O::JumpSwitch | O::Call | O::Return | O::ExternalCall
        | O::ExternalJump => Ok(exec_nop),
    }
}
