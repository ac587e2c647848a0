//! Runtime functions and runtime opcodes
//!
//! Bytecode is translated per function, on first call, into the runtime's
//! executable form: a dense stream of [`RuntimeOpcode`]s. Each carries its
//! exec function pointer, a precomputed successor index (`next`, possibly
//! skipping statically resolvable forward jumps), and the length of the
//! straight-line run starting at it (`successive_count`), which the
//! interpreter's inner loop uses to batch-dispatch without per-opcode
//! checks.
//!
//! Jump targets arrive as opcode indices and are rewritten to runtime
//! opcode indices through the per-function index map, which also backs the
//! program-counter translation used by save states.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use bitflags::bitflags;

use lemon_core::{BaseType, Opcode, OpcodeFlags, OpcodeType};

use crate::error::BuildError;
use crate::exec::{select_exec_fn, ExecFn};
use crate::function::ScriptFunction;
use crate::memory::MemoryAccessHandler;
use crate::program::Program;
use crate::provider::optimized;

/// Hard cap on a runtime opcode's parameter block. Anything larger hints at
/// a broken provider.
pub const MAX_PARAMETER_SIZE: usize = 0xc0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RuntimeOpcodeFlags: u8 {
        /// For CALL opcodes: resolve against the caller's base-call depth.
        const CALL_IS_BASE_CALL = 0x20;
    }
}

/// Lazily cached resolution of a CALL target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedCallTarget {
    Unresolved,
    /// Index into the runtime's function table.
    RuntimeFunction(usize),
    /// Function ID of a (usually native) program function.
    Function(u32),
}

/// Reference data some fused opcodes carry besides raw parameter bytes.
#[derive(Debug, Clone)]
pub enum RuntimeOpcodeAux {
    /// Live cell of an external variable, captured at build time.
    ExternalCell(Arc<AtomicI64>),
}

/// One executable runtime opcode.
pub struct RuntimeOpcode {
    pub exec_fn: ExecFn,
    pub opcode_type: OpcodeType,
    pub flags: RuntimeOpcodeFlags,
    /// Length of the straight-line run starting here; 0 means the
    /// interpreter loop handles this opcode itself.
    pub successive_count: u8,
    /// Index of the successor runtime opcode; `u32::MAX` for the last one.
    pub next: u32,
    params: Vec<u8>,
    pub resolved_call: Cell<ResolvedCallTarget>,
    aux: Option<RuntimeOpcodeAux>,
}

impl RuntimeOpcode {
    pub fn param_len(&self) -> usize {
        self.params.len()
    }

    pub fn param_u8(&self, offset: usize) -> u8 {
        self.params.get(offset).copied().unwrap_or(0)
    }

    pub fn param_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.param_u8(offset + i);
        }
        u32::from_le_bytes(bytes)
    }

    pub fn param_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.param_u8(offset + i);
        }
        u64::from_le_bytes(bytes)
    }

    pub fn param_i64(&self, offset: usize) -> i64 {
        self.param_u64(offset) as i64
    }

    pub fn set_param_u32(&mut self, offset: usize, value: u32) {
        self.params[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_param_u64(&mut self, offset: usize, value: u64) {
        self.params[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn aux(&self) -> Option<&RuntimeOpcodeAux> {
        self.aux.as_ref()
    }

    pub fn external_cell(&self) -> Option<&Arc<AtomicI64>> {
        match &self.aux {
            Some(RuntimeOpcodeAux::ExternalCell(cell)) => Some(cell),
            None => None,
        }
    }
}

impl std::fmt::Debug for RuntimeOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOpcode")
            .field("opcode_type", &self.opcode_type)
            .field("successive_count", &self.successive_count)
            .field("next", &self.next)
            .field("param_len", &self.params.len())
            .finish_non_exhaustive()
    }
}

/// The per-function stream of runtime opcodes.
#[derive(Debug, Default)]
pub struct RuntimeOpcodeBuffer {
    ops: Vec<RuntimeOpcode>,
}

impl RuntimeOpcodeBuffer {
    pub fn new() -> Self {
        RuntimeOpcodeBuffer { ops: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RuntimeOpcode> {
        self.ops.get(index)
    }

    pub fn ops(&self) -> &[RuntimeOpcode] {
        &self.ops
    }

    pub(crate) fn ops_mut(&mut self) -> &mut [RuntimeOpcode] {
        &mut self.ops
    }

    /// Append a runtime opcode. Fails when the parameter block exceeds the
    /// hard limit.
    pub fn add_opcode(
        &mut self,
        exec_fn: ExecFn,
        opcode_type: OpcodeType,
        params: &[u8],
    ) -> Result<&mut RuntimeOpcode, BuildError> {
        if params.len() > MAX_PARAMETER_SIZE {
            return Err(BuildError::ParameterTooLarge(params.len()));
        }
        self.ops.push(RuntimeOpcode {
            exec_fn,
            opcode_type,
            flags: RuntimeOpcodeFlags::empty(),
            successive_count: 1,
            next: u32::MAX,
            params: params.to_vec(),
            resolved_call: Cell::new(ResolvedCallTarget::Unresolved),
            aux: None,
        });
        Ok(self.ops.last_mut().expect("just pushed"))
    }

    pub(crate) fn set_aux(&mut self, index: usize, aux: RuntimeOpcodeAux) {
        self.ops[index].aux = Some(aux);
    }
}

/// Static-memory placement of the program's global variables, computed by
/// the runtime at `set_program`.
#[derive(Debug, Default)]
pub struct GlobalsLayout {
    slots: HashMap<u32, GlobalSlot>,
    total_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalSlot {
    pub offset: usize,
    pub bytes: usize,
}

impl GlobalsLayout {
    /// Lay out all `Global`-kind variables of the program: 8-byte-aligned
    /// slots in declaration order.
    pub fn build(program: &Program) -> Self {
        let mut slots = HashMap::new();
        let mut total_size = 0usize;
        for variable in program.global_variables() {
            if variable.kind() == lemon_core::VariableKind::Global {
                let bytes = variable.data_type().bytes().max(1);
                let aligned = (bytes + 7) / 8 * 8;
                slots.insert(
                    variable.id(),
                    GlobalSlot {
                        offset: total_size,
                        bytes,
                    },
                );
                total_size += aligned;
            }
        }
        GlobalsLayout { slots, total_size }
    }

    pub fn slot(&self, variable_id: u32) -> Option<GlobalSlot> {
        self.slots.get(&variable_id).copied()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

/// Everything a provider may need while translating opcodes.
pub struct BuildEnv<'a> {
    pub program: &'a Program,
    pub memory: &'a mut dyn MemoryAccessHandler,
    pub globals_layout: &'a GlobalsLayout,
}

/// A runtime opcode provider: given a window of straight-line opcodes,
/// either emits one runtime opcode consuming some prefix of them and
/// returns the consumed count, or declines.
pub trait RuntimeOpcodeProvider: Send + Sync {
    fn build_runtime_opcode(
        &self,
        buffer: &mut RuntimeOpcodeBuffer,
        opcodes: &[Opcode],
        first_opcode_index: usize,
        env: &mut BuildEnv<'_>,
    ) -> Result<Option<usize>, BuildError>;
}

/// The executable form of one script function; empty until `build` runs.
pub struct RuntimeFunction {
    pub function_id: u32,
    pub buffer: RuntimeOpcodeBuffer,
    /// Runtime opcode index where the translation of each source opcode
    /// starts. Fused opcodes map every consumed source index to the same
    /// runtime index.
    pc_by_opcode_index: Vec<u32>,
    built: bool,
}

impl RuntimeFunction {
    pub fn new(function_id: u32) -> Self {
        RuntimeFunction {
            function_id,
            buffer: RuntimeOpcodeBuffer::new(),
            pc_by_opcode_index: Vec::new(),
            built: false,
        }
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Runtime opcode index for a source opcode index. An index one past
    /// the end resolves to the function's terminal RETURN.
    pub fn translate_to_runtime_pc(&self, opcode_index: usize) -> usize {
        match self.pc_by_opcode_index.get(opcode_index) {
            Some(&pc) => pc as usize,
            None => self.buffer.len().saturating_sub(1),
        }
    }

    /// Source opcode index for a runtime opcode index (binary search over
    /// the monotone index map).
    pub fn translate_from_runtime_pc(&self, runtime_pc: usize) -> Option<usize> {
        if self.pc_by_opcode_index.is_empty() {
            return None;
        }
        let target = runtime_pc as u32;
        let mut low = 0usize;
        let mut high = self.pc_by_opcode_index.len() - 1;
        while low <= high {
            let median = (low + high) / 2;
            match self.pc_by_opcode_index[median].cmp(&target) {
                std::cmp::Ordering::Less => low = median + 1,
                std::cmp::Ordering::Greater => {
                    if median == 0 {
                        return None;
                    }
                    high = median - 1;
                }
                std::cmp::Ordering::Equal => return Some(median),
            }
        }
        None
    }

    /// Translate the function's bytecode into runtime opcodes. Does nothing
    /// when already built or when the function has no opcodes.
    pub fn build(&mut self, function: &ScriptFunction, env: &mut BuildEnv<'_>) -> Result<(), BuildError> {
        if self.built || function.opcodes.is_empty() {
            self.built = true;
            return Ok(());
        }

        let opcodes = &function.opcodes;
        let count = opcodes.len();
        let sequence_lengths = compute_sequence_lengths(opcodes);
        self.pc_by_opcode_index = vec![u32::MAX; count];

        let mut index = 0usize;
        while index < count {
            let window = &opcodes[index..index + sequence_lengths[index]];
            let start = self.buffer.len() as u32;
            let consumed = create_runtime_opcode(&mut self.buffer, window, index, env)?;
            debug_assert!(consumed >= 1 && consumed <= window.len());
            for offset in 0..consumed {
                self.pc_by_opcode_index[index + offset] = start;
            }
            index += consumed;
        }

        self.translate_jump_targets(opcodes)?;
        self.update_successive_counts();
        self.link_next_pointers();

        self.built = true;
        Ok(())
    }

    fn translate_jump_targets(&mut self, opcodes: &[Opcode]) -> Result<(), BuildError> {
        let count = opcodes.len();
        let last_index = (self.buffer.len() - 1) as u32;
        let last_is_return =
            self.buffer.ops().last().map(|op| op.opcode_type) == Some(OpcodeType::Return);

        for op in self.buffer.ops_mut() {
            if !matches!(
                op.opcode_type,
                OpcodeType::Jump | OpcodeType::JumpConditional | OpcodeType::JumpSwitch
            ) {
                continue;
            }
            let target = op.param_u32(0) as usize;
            let translated = if target < count {
                self.pc_by_opcode_index[target]
            } else {
                // A jump to opcodes.len() resolves to the terminal RETURN.
                if !last_is_return {
                    return Err(BuildError::CorruptBytecode(
                        "function does not end with a return".into(),
                    ));
                }
                last_index
            };
            op.set_param_u32(0, translated);
        }
        Ok(())
    }

    /// Backward sweep computing the straight-line run lengths.
    fn update_successive_counts(&mut self) {
        let mut sequence_length: u8 = 0;
        for op in self.buffer.ops_mut().iter_mut().rev() {
            if op.successive_count == 0 {
                sequence_length = 0;
            } else if op.opcode_type == OpcodeType::JumpConditional {
                // A handled conditional jump ends its run after executing.
                sequence_length = 1;
            } else if sequence_length < u8::MAX {
                sequence_length += 1;
            }
            op.successive_count = sequence_length;
        }
    }

    /// Fill `next` with the physical successor, then short-circuit chains
    /// of *forward* unconditional jumps (up to five hops). Backward jumps
    /// are never skipped: they are loop edges whose step-budget checks must
    /// fire.
    fn link_next_pointers(&mut self) {
        let count = self.buffer.len();
        for index in 0..count {
            if index + 1 >= count {
                continue;
            }
            let mut next = (index + 1) as u32;
            for _ in 0..5 {
                let next_op = &self.buffer.ops()[next as usize];
                if next_op.opcode_type != OpcodeType::Jump {
                    break;
                }
                let target = next_op.param_u32(0);
                if target as usize <= index {
                    break;
                }
                next = target;
            }
            self.buffer.ops_mut()[index].next = next;
        }
    }
}

/// Straight-line window length available for fusion starting at each
/// opcode: stops before control flow and before any later opcode marked as
/// a sequence break (jump targets must begin their own runtime opcode).
fn compute_sequence_lengths(opcodes: &[Opcode]) -> Vec<usize> {
    let count = opcodes.len();
    let mut lengths = vec![1usize; count];
    for index in (0..count).rev() {
        if opcodes[index].opcode_type.is_control_flow() {
            lengths[index] = 1;
            continue;
        }
        let mut length = 1;
        if index + 1 < count {
            let next = &opcodes[index + 1];
            if !next.flags.contains(OpcodeFlags::SEQ_BREAK)
                && !next.opcode_type.is_control_flow()
            {
                length = 1 + lengths[index + 1];
            }
        }
        lengths[index] = length;
    }
    lengths
}

/// One translation step: nativized provider first (optimization level 2+),
/// then the optimized fuser (level 1+), then the one-to-one default.
fn create_runtime_opcode(
    buffer: &mut RuntimeOpcodeBuffer,
    window: &[Opcode],
    first_opcode_index: usize,
    env: &mut BuildEnv<'_>,
) -> Result<usize, BuildError> {
    if env.program.optimization_level() >= 2 {
        if let Some(provider) = env.program.nativized_provider() {
            if let Some(consumed) =
                provider.build_runtime_opcode(buffer, window, first_opcode_index, env)?
            {
                return Ok(consumed);
            }
        }
    }

    if env.program.optimization_level() >= 1 {
        if let Some(consumed) = optimized::build_runtime_opcode(buffer, window, env)? {
            return Ok(consumed);
        }
    }

    build_default_runtime_opcode(buffer, &window[0], env)?;
    Ok(1)
}

/// Fallback translation: one runtime opcode per source opcode.
fn build_default_runtime_opcode(
    buffer: &mut RuntimeOpcodeBuffer,
    opcode: &Opcode,
    env: &mut BuildEnv<'_>,
) -> Result<(), BuildError> {
    use OpcodeType as O;

    match opcode.opcode_type {
        O::Jump | O::JumpConditional | O::JumpSwitch => {
            let op = buffer.add_opcode(
                crate::exec::exec_nop,
                opcode.opcode_type,
                &(opcode.parameter as u32).to_le_bytes(),
            )?;
            op.successive_count = 0;
        }
        O::Call => {
            let op = buffer.add_opcode(
                crate::exec::exec_nop,
                O::Call,
                &(opcode.parameter as u64).to_le_bytes(),
            )?;
            op.successive_count = 0;
            // Base calls carry a non-void data type tag in the bytecode.
            if opcode.data_type != BaseType::Void {
                op.flags |= RuntimeOpcodeFlags::CALL_IS_BASE_CALL;
            }
        }
        O::Return | O::ExternalCall | O::ExternalJump => {
            let op = buffer.add_opcode(crate::exec::exec_nop, opcode.opcode_type, &[])?;
            op.successive_count = 0;
        }
        O::GetVariableValue | O::SetVariableValue => {
            let variable_id = opcode.parameter as u32;
            let kind = lemon_core::variable_kind_of_id(variable_id);
            let exec_fn = select_exec_fn(opcode.opcode_type, opcode.data_type, Some(kind))?;

            let mut params = [0u8; 8];
            params[0..4].copy_from_slice(&variable_id.to_le_bytes());
            match kind {
                lemon_core::VariableKind::Global => {
                    let slot = env.globals_layout.slot(variable_id).ok_or_else(|| {
                        BuildError::CorruptBytecode(format!(
                            "unknown global variable {:#010x}",
                            variable_id
                        ))
                    })?;
                    params[4..8].copy_from_slice(&(slot.offset as u32).to_le_bytes());
                    buffer.add_opcode(exec_fn, opcode.opcode_type, &params)?;
                }
                lemon_core::VariableKind::External => {
                    let cell = env
                        .program
                        .global_variable_by_id(variable_id)
                        .and_then(|variable| variable.external_cell())
                        .ok_or_else(|| {
                            BuildError::CorruptBytecode(format!(
                                "unknown external variable {:#010x}",
                                variable_id
                            ))
                        })?;
                    buffer.add_opcode(exec_fn, opcode.opcode_type, &params[0..4])?;
                    let index = buffer.len() - 1;
                    buffer.set_aux(index, RuntimeOpcodeAux::ExternalCell(cell));
                }
                _ => {
                    buffer.add_opcode(exec_fn, opcode.opcode_type, &params[0..4])?;
                }
            }
        }
        O::CastValue => {
            let exec_fn = select_exec_fn(O::CastValue, opcode.data_type, None)?;
            let params = [opcode.parameter as u8, opcode.data_type as u8];
            buffer.add_opcode(exec_fn, O::CastValue, &params)?;
        }
        _ => {
            let exec_fn = select_exec_fn(opcode.opcode_type, opcode.data_type, None)?;
            buffer.add_opcode(
                exec_fn,
                opcode.opcode_type,
                &(opcode.parameter as u64).to_le_bytes(),
            )?;
        }
    }
    Ok(())
}
