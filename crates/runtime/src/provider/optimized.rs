//! Optimized opcode fuser
//!
//! Merges the fixed catalogue of common opcode pairs (and one triple) into
//! single runtime opcodes:
//!
//! - constant push + binary arithmetic/comparison → op-with-constant
//! - set variable + stack discard → set-and-discard per variable kind
//! - memory write + stack discard → write-and-discard
//! - constant address push + memory read/write → fixed-address access,
//!   with a direct-pointer variant when the memory handler offers one
//! - external variable read + constant push + add → external-add-constant

use lemon_core::{BaseType, Opcode, OpcodeType, VariableKind};

use crate::error::BuildError;
use crate::exec::{ExecContext, ExecFn, ScriptIntValue, ScriptValue};
use crate::memory::SpecializationResult;
use crate::runtime_function::{BuildEnv, RuntimeOpcode, RuntimeOpcodeAux, RuntimeOpcodeBuffer};

// --- fused exec functions ----------------------------------------------------

macro_rules! binary_constant_exec {
    ($name:ident, $trait_:ident, $method:ident) => {
        fn $name<T: $trait_>(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
            let a = context.flow.read_value::<T>(-1);
            let b = T::from_cell(op.param_u64(0));
            context.flow.write_value(-1, T::$method(a, b));
        }
    };
}

binary_constant_exec!(exec_add_constant, ScriptValue, val_add);
binary_constant_exec!(exec_sub_constant, ScriptValue, val_sub);
binary_constant_exec!(exec_mul_constant, ScriptValue, val_mul);
binary_constant_exec!(exec_div_constant, ScriptValue, val_div);
binary_constant_exec!(exec_mod_constant, ScriptValue, val_mod);
binary_constant_exec!(exec_and_constant, ScriptIntValue, val_and);
binary_constant_exec!(exec_or_constant, ScriptIntValue, val_or);
binary_constant_exec!(exec_xor_constant, ScriptIntValue, val_xor);

fn exec_shl_constant<T: ScriptIntValue>(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let a = context.flow.read_value::<T>(-1);
    let b = T::from_cell(op.param_u64(0));
    context.flow.write_value(-1, T::val_shl(a, b));
}

fn exec_shr_constant<T: ScriptIntValue>(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let a = context.flow.read_value::<T>(-1);
    let b = T::from_cell(op.param_u64(0));
    context.flow.write_value(-1, T::val_shr(a, b));
}

macro_rules! compare_constant_exec {
    ($name:ident, $op:tt) => {
        fn $name<T: ScriptValue>(context: &mut ExecContext<'_>, opcode: &RuntimeOpcode) {
            let a = context.flow.read_value::<T>(-1);
            let b = T::from_cell(opcode.param_u64(0));
            context.flow.write_value(-1, (a $op b) as u64);
        }
    };
}

compare_constant_exec!(exec_cmp_eq_constant, ==);
compare_constant_exec!(exec_cmp_neq_constant, !=);
compare_constant_exec!(exec_cmp_lt_constant, <);
compare_constant_exec!(exec_cmp_le_constant, <=);
compare_constant_exec!(exec_cmp_gt_constant, >);
compare_constant_exec!(exec_cmp_ge_constant, >=);

fn exec_set_variable_local_discard(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let index = lemon_core::variable_index_of_id(op.param_u32(0)) as usize;
    let value = context.flow.pop::<i64>();
    context.flow.write_local(index, value);
}

fn exec_set_variable_user_discard(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let id = op.param_u32(0);
    let setter = context
        .program
        .global_variable_by_id(id)
        .and_then(|variable| variable.user_setter().cloned());
    match setter {
        // The setter itself pops the value; that is the discard.
        Some(setter) => setter(context),
        None => context.flow.move_value_stack(-1),
    }
}

fn exec_set_variable_global_discard<T: ScriptIntValue>(
    context: &mut ExecContext<'_>,
    op: &RuntimeOpcode,
) {
    let offset = op.param_u32(4) as usize;
    let value = context.flow.pop::<i64>();
    context.write_global_slot_narrow(offset, value, std::mem::size_of::<T>());
}

fn exec_set_variable_external_discard<T: ScriptIntValue>(
    context: &mut ExecContext<'_>,
    op: &RuntimeOpcode,
) {
    let value = context.flow.pop::<i64>();
    if let Some(RuntimeOpcodeAux::ExternalCell(cell)) = op.aux() {
        // Narrow store: only the variable's width changes in the cell.
        let bytes = std::mem::size_of::<T>();
        if bytes >= 8 {
            cell.store(value, std::sync::atomic::Ordering::Relaxed);
        } else {
            let mask = (1i64 << (bytes * 8)) - 1;
            let old = cell.load(std::sync::atomic::Ordering::Relaxed);
            cell.store((old & !mask) | (value & mask), std::sync::atomic::Ordering::Relaxed);
        }
    }
}

fn exec_write_memory_discard<T: ScriptIntValue>(context: &mut ExecContext<'_>, _op: &RuntimeOpcode) {
    let address = context.flow.read_value::<u64>(-1);
    let value = context.flow.read_value::<T>(-2);
    context.flow.move_value_stack(-2);
    context
        .memory
        .write_sized(address, value.into_cell(), std::mem::size_of::<T>());
}

fn exec_read_memory_fixed_addr<T: ScriptIntValue>(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let address = op.param_u64(0);
    let value = context.memory.read_sized(address, std::mem::size_of::<T>());
    context.flow.push(T::from_cell(value));
}

fn read_direct<T: ScriptIntValue>(context: &mut ExecContext<'_>, offset: usize) -> u64 {
    let size = std::mem::size_of::<T>();
    match context.memory.direct_memory() {
        Some(block) if offset + size <= block.len() => {
            let mut bytes = [0u8; 8];
            bytes[..size].copy_from_slice(&block[offset..offset + size]);
            u64::from_le_bytes(bytes)
        }
        _ => 0,
    }
}

fn write_direct<T: ScriptIntValue>(context: &mut ExecContext<'_>, offset: usize, value: u64) {
    let size = std::mem::size_of::<T>();
    if let Some(block) = context.memory.direct_memory() {
        if offset + size <= block.len() {
            block[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
        }
    }
}

fn swap_bytes_sized(value: u64, size: usize) -> u64 {
    match size {
        1 => value,
        2 => (value as u16).swap_bytes() as u64,
        4 => (value as u32).swap_bytes() as u64,
        _ => value.swap_bytes(),
    }
}

fn exec_read_memory_fixed_addr_direct<T: ScriptIntValue>(
    context: &mut ExecContext<'_>,
    op: &RuntimeOpcode,
) {
    let value = read_direct::<T>(context, op.param_u64(0) as usize);
    context.flow.push(T::from_cell(value));
}

fn exec_read_memory_fixed_addr_direct_swap<T: ScriptIntValue>(
    context: &mut ExecContext<'_>,
    op: &RuntimeOpcode,
) {
    let value = read_direct::<T>(context, op.param_u64(0) as usize);
    let value = swap_bytes_sized(value, std::mem::size_of::<T>());
    context.flow.push(T::from_cell(value));
}

fn exec_write_memory_fixed_addr<T: ScriptIntValue>(
    context: &mut ExecContext<'_>,
    op: &RuntimeOpcode,
) {
    let value = context.flow.read_value::<T>(-1);
    context
        .memory
        .write_sized(op.param_u64(0), value.into_cell(), std::mem::size_of::<T>());
}

fn exec_write_memory_fixed_addr_direct<T: ScriptIntValue>(
    context: &mut ExecContext<'_>,
    op: &RuntimeOpcode,
) {
    let value = context.flow.read_value::<T>(-1);
    write_direct::<T>(context, op.param_u64(0) as usize, value.into_cell());
}

fn exec_write_memory_fixed_addr_direct_swap<T: ScriptIntValue>(
    context: &mut ExecContext<'_>,
    op: &RuntimeOpcode,
) {
    let value = context.flow.read_value::<T>(-1);
    let swapped = swap_bytes_sized(value.into_cell(), std::mem::size_of::<T>());
    write_direct::<T>(context, op.param_u64(0) as usize, swapped);
}

fn exec_external_add_constant<T: ScriptValue>(context: &mut ExecContext<'_>, op: &RuntimeOpcode) {
    let base = match op.aux() {
        Some(RuntimeOpcodeAux::ExternalCell(cell)) => {
            cell.load(std::sync::atomic::Ordering::Relaxed)
        }
        None => 0,
    };
    let a = T::from_cell(base as u64);
    let b = T::from_cell(op.param_u64(0));
    context.flow.push(T::val_add(a, b));
}

// --- selection helpers -------------------------------------------------------

macro_rules! select_numeric {
    ($func:ident, $base:expr) => {
        match $base {
            BaseType::Int8 => Some($func::<i8> as ExecFn),
            BaseType::Int16 => Some($func::<i16> as ExecFn),
            BaseType::Int32 => Some($func::<i32> as ExecFn),
            BaseType::Int64 => Some($func::<i64> as ExecFn),
            BaseType::Uint8 => Some($func::<u8> as ExecFn),
            BaseType::Uint16 => Some($func::<u16> as ExecFn),
            BaseType::Uint32 => Some($func::<u32> as ExecFn),
            BaseType::Uint64 | BaseType::IntConst | BaseType::String => {
                Some($func::<u64> as ExecFn)
            }
            BaseType::Float => Some($func::<f32> as ExecFn),
            BaseType::Double => Some($func::<f64> as ExecFn),
            _ => None,
        }
    };
}

macro_rules! select_integer {
    ($func:ident, $base:expr) => {
        match $base {
            BaseType::Int8 => Some($func::<i8> as ExecFn),
            BaseType::Int16 => Some($func::<i16> as ExecFn),
            BaseType::Int32 => Some($func::<i32> as ExecFn),
            BaseType::Int64 => Some($func::<i64> as ExecFn),
            BaseType::Uint8 => Some($func::<u8> as ExecFn),
            BaseType::Uint16 => Some($func::<u16> as ExecFn),
            BaseType::Uint32 => Some($func::<u32> as ExecFn),
            BaseType::Uint64 | BaseType::IntConst => Some($func::<u64> as ExecFn),
            _ => None,
        }
    };
}

macro_rules! select_by_width {
    ($func:ident, $bytes:expr) => {
        match $bytes {
            1 => Some($func::<u8> as ExecFn),
            2 => Some($func::<u16> as ExecFn),
            4 => Some($func::<u32> as ExecFn),
            8 => Some($func::<u64> as ExecFn),
            _ => None,
        }
    };
}

fn select_binary_constant_fn(opcode_type: OpcodeType, data_type: BaseType) -> Option<ExecFn> {
    use OpcodeType as O;
    match opcode_type {
        O::ArithmAdd => select_numeric!(exec_add_constant, data_type),
        O::ArithmSub => select_numeric!(exec_sub_constant, data_type),
        O::ArithmMul => select_numeric!(exec_mul_constant, data_type),
        O::ArithmDiv => select_numeric!(exec_div_constant, data_type),
        O::ArithmMod => select_numeric!(exec_mod_constant, data_type),
        O::ArithmAnd => select_integer!(exec_and_constant, data_type),
        O::ArithmOr => select_integer!(exec_or_constant, data_type),
        O::ArithmXor => select_integer!(exec_xor_constant, data_type),
        O::ArithmShl => select_integer!(exec_shl_constant, data_type),
        O::ArithmShr => select_integer!(exec_shr_constant, data_type),
        O::CompareEq => select_numeric!(exec_cmp_eq_constant, data_type),
        O::CompareNeq => select_numeric!(exec_cmp_neq_constant, data_type),
        O::CompareLt => select_numeric!(exec_cmp_lt_constant, data_type),
        O::CompareLe => select_numeric!(exec_cmp_le_constant, data_type),
        O::CompareGt => select_numeric!(exec_cmp_gt_constant, data_type),
        O::CompareGe => select_numeric!(exec_cmp_ge_constant, data_type),
        _ => None,
    }
}

// --- the fuser ---------------------------------------------------------------

/// Try to merge a prefix of the window into one runtime opcode. Returns the
/// number of source opcodes consumed, or `None` when nothing matched.
pub(crate) fn build_runtime_opcode(
    buffer: &mut RuntimeOpcodeBuffer,
    window: &[Opcode],
    env: &mut BuildEnv<'_>,
) -> Result<Option<usize>, BuildError> {
    if window.len() < 2 {
        return Ok(None);
    }

    // Merge: external variable + constant + add.
    if window.len() >= 3
        && window[0].opcode_type == OpcodeType::GetVariableValue
        && lemon_core::variable_kind_of_id(window[0].parameter as u32) == VariableKind::External
        && window[1].opcode_type == OpcodeType::PushConstant
        && window[2].opcode_type == OpcodeType::ArithmAdd
        && window[2].data_type == window[0].data_type
    {
        if let Some(exec_fn) = select_numeric!(exec_external_add_constant, window[0].data_type) {
            let variable_id = window[0].parameter as u32;
            let cell = env
                .program
                .global_variable_by_id(variable_id)
                .and_then(|variable| variable.external_cell());
            if let Some(cell) = cell {
                buffer.add_opcode(exec_fn, window[2].opcode_type, &window[1].parameter.to_le_bytes())?;
                let index = buffer.len() - 1;
                buffer.set_aux(index, RuntimeOpcodeAux::ExternalCell(cell));
                return Ok(Some(3));
            }
        }
    }

    // Merge: binary operation with a constant value.
    if window[0].opcode_type == OpcodeType::PushConstant
        && (window[1].opcode_type.is_binary_arithmetic() || window[1].opcode_type.is_comparison())
    {
        if let Some(exec_fn) = select_binary_constant_fn(window[1].opcode_type, window[1].data_type)
        {
            buffer.add_opcode(exec_fn, window[1].opcode_type, &window[0].parameter.to_le_bytes())?;
            return Ok(Some(2));
        }
    }

    // Merge: set variable value and discard its result.
    if window[0].opcode_type == OpcodeType::SetVariableValue
        && window[1].opcode_type == OpcodeType::MoveStack
        && window[1].parameter == -1
    {
        let variable_id = window[0].parameter as u32;
        let mut params = [0u8; 8];
        params[0..4].copy_from_slice(&variable_id.to_le_bytes());

        match lemon_core::variable_kind_of_id(variable_id) {
            VariableKind::Local => {
                buffer.add_opcode(
                    exec_set_variable_local_discard,
                    OpcodeType::SetVariableValue,
                    &params[0..4],
                )?;
                return Ok(Some(2));
            }
            VariableKind::User => {
                buffer.add_opcode(
                    exec_set_variable_user_discard,
                    OpcodeType::SetVariableValue,
                    &params[0..4],
                )?;
                return Ok(Some(2));
            }
            VariableKind::Global => {
                let Some(slot) = env.globals_layout.slot(variable_id) else {
                    return Ok(None);
                };
                let width = window[0].data_type.size_bytes().max(1);
                let Some(exec_fn) = select_by_width!(exec_set_variable_global_discard, width)
                else {
                    return Ok(None);
                };
                params[4..8].copy_from_slice(&(slot.offset as u32).to_le_bytes());
                buffer.add_opcode(exec_fn, OpcodeType::SetVariableValue, &params)?;
                return Ok(Some(2));
            }
            VariableKind::External => {
                let Some(cell) = env
                    .program
                    .global_variable_by_id(variable_id)
                    .and_then(|variable| variable.external_cell())
                else {
                    return Ok(None);
                };
                let width = env
                    .program
                    .global_variable_by_id(variable_id)
                    .map(|variable| variable.data_type().bytes())
                    .unwrap_or(8)
                    .max(1);
                let Some(exec_fn) = select_by_width!(exec_set_variable_external_discard, width)
                else {
                    return Ok(None);
                };
                buffer.add_opcode(exec_fn, OpcodeType::SetVariableValue, &params[0..4])?;
                let index = buffer.len() - 1;
                buffer.set_aux(index, RuntimeOpcodeAux::ExternalCell(cell));
                return Ok(Some(2));
            }
        }
    }

    // Merge: write memory and discard its result.
    if window[0].opcode_type == OpcodeType::WriteMemory
        && window[0].parameter == 0
        && window[1].opcode_type == OpcodeType::MoveStack
        && window[1].parameter == -1
    {
        if let Some(exec_fn) = select_integer!(exec_write_memory_discard, window[0].data_type) {
            buffer.add_opcode(exec_fn, OpcodeType::WriteMemory, &[])?;
            return Ok(Some(2));
        }
    }

    // Merge: read memory at a fixed address.
    if window[0].opcode_type == OpcodeType::PushConstant
        && window[1].opcode_type == OpcodeType::ReadMemory
        && window[1].parameter == 0
    {
        let address = window[0].parameter as u64;
        let size = window[1].data_type.size_bytes().max(1);
        let specialization = env.memory.get_direct_access_specialization(address, size, false);
        let (exec_fn, param) = match specialization {
            SpecializationResult::HasSpecialization { offset, swap_bytes } => {
                let exec_fn = if swap_bytes {
                    select_integer!(exec_read_memory_fixed_addr_direct_swap, window[1].data_type)
                } else {
                    select_integer!(exec_read_memory_fixed_addr_direct, window[1].data_type)
                };
                (exec_fn, offset as u64)
            }
            _ => (
                select_integer!(exec_read_memory_fixed_addr, window[1].data_type),
                address,
            ),
        };
        if let Some(exec_fn) = exec_fn {
            buffer.add_opcode(exec_fn, OpcodeType::ReadMemory, &param.to_le_bytes())?;
            return Ok(Some(2));
        }
    }

    // Merge: write memory at a fixed address.
    if window[0].opcode_type == OpcodeType::PushConstant
        && window[1].opcode_type == OpcodeType::WriteMemory
        && window[1].parameter == 0
    {
        let address = window[0].parameter as u64;
        let size = window[1].data_type.size_bytes().max(1);
        let specialization = env.memory.get_direct_access_specialization(address, size, true);
        let (exec_fn, param) = match specialization {
            SpecializationResult::HasSpecialization { offset, swap_bytes } => {
                let exec_fn = if swap_bytes {
                    select_integer!(exec_write_memory_fixed_addr_direct_swap, window[1].data_type)
                } else {
                    select_integer!(exec_write_memory_fixed_addr_direct, window[1].data_type)
                };
                (exec_fn, offset as u64)
            }
            _ => (
                select_integer!(exec_write_memory_fixed_addr, window[1].data_type),
                address,
            ),
        };
        if let Some(exec_fn) = exec_fn {
            buffer.add_opcode(exec_fn, OpcodeType::WriteMemory, &param.to_le_bytes())?;
            return Ok(Some(2));
        }
    }

    Ok(None)
}
