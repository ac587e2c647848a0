//! Save states
//!
//! `"LMN|"` + u16 version (≥ 0x01). Contains the call stack (per frame:
//! function name, signature hash, program counter as a source opcode
//! index, and the frame's local variables), the value stack, and all
//! global variables addressed by name — which makes states forward
//! compatible across global-variable additions and removals.
//!
//! On load, frames are re-resolved against the current program; a repair
//! pass then snaps each non-leaf frame's program counter to the nearest
//! matching call site in its function, so states stay playable when call
//! sites moved slightly between script versions.

use std::sync::Arc;

use lemon_core::{murmur2_64, name_and_signature_hash, BinaryReader, BinaryWriter, OpcodeType};

use crate::control_flow::ControlFlowState;
use crate::error::SerializeError;
use crate::function::Function;
use crate::program::Program;
use crate::runtime::Runtime;

const SIGNATURE: &[u8; 4] = b"LMN|";
const CURRENT_VERSION: u16 = 0x01;
const MINIMUM_VERSION: u16 = 0x01;

impl Runtime {
    /// Serialize the main control flow and all global variables.
    pub fn save_state(&self) -> Result<Vec<u8>, SerializeError> {
        let mut writer = BinaryWriter::new();
        writer.write_bytes(SIGNATURE);
        writer.write_u16(CURRENT_VERSION);

        let flow = self.main_control_flow();
        let call_stack = flow.call_stack();
        writer.write_u32(call_stack.len() as u32);
        for (frame_index, state) in call_stack.iter().enumerate() {
            let function = self
                .runtime_function(state.runtime_function)
                .ok_or_else(|| SerializeError::UnmatchedFunction("<missing frame>".into()))?;
            let script = self
                .program()
                .script_function_by_id(function.function_id)
                .ok_or_else(|| SerializeError::UnmatchedFunction("<missing function>".into()))?;

            writer.write_str(script.info.name.as_str());
            writer.write_u32(script.info.signature_hash);
            let opcode_index = function
                .translate_from_runtime_pc(state.program_counter)
                .unwrap_or(0);
            writer.write_u32(opcode_index as u32);

            let locals_end = call_stack
                .get(frame_index + 1)
                .map(|next| next.locals_start)
                .unwrap_or(flow.locals_size());
            writer.write_u32((locals_end - state.locals_start) as u32);
            for slot in state.locals_start..locals_end {
                writer.write_i64(flow.local_slot(slot));
            }
        }

        let cells = flow.value_stack_cells();
        writer.write_u32(cells.len() as u32);
        for cell in cells {
            writer.write_u64(*cell);
        }

        let globals: Vec<_> = self.program().global_variables().collect();
        writer.write_u32(globals.len() as u32);
        for variable in globals {
            writer.write_str(variable.name().as_str());
            writer.write_u64(self.global_variable_value(variable.id()).raw());
        }

        Ok(writer.into_vec())
    }

    /// Restore a previously saved state. Control flows are reset; cached
    /// runtime functions stay valid.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SerializeError> {
        let mut reader = BinaryReader::new(data);
        let signature = reader.read_bytes(4)?;
        if signature != SIGNATURE {
            return Err(SerializeError::IncompatibleFormat("bad signature".into()));
        }
        let version = reader.read_u16()?;
        if !(MINIMUM_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(SerializeError::IncompatibleFormat(format!(
                "unsupported save state version {:#06x}",
                version
            )));
        }

        self.clear_all_control_flows();

        // Call stack. Remember frame data for the repair pass.
        let frame_count = reader.read_u32()? as usize;
        let mut frame_function_ids = Vec::with_capacity(frame_count);
        let mut frame_opcode_indices = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let function_name = reader.read_str()?;
            let signature_hash = reader.read_u32()?;
            let opcode_index = reader.read_u32()? as usize;

            let name_hash = murmur2_64(function_name.as_bytes());
            let hash = name_and_signature_hash(name_hash, signature_hash);
            let function_id = match self.program().function_by_signature(hash, 0) {
                Some(Function::Script(function)) => function.info.id,
                _ => return Err(SerializeError::UnmatchedFunction(function_name)),
            };
            let runtime_index = self
                .runtime_function_index(function_id)
                .ok_or_else(|| SerializeError::UnmatchedFunction(function_name.clone()))?;
            let runtime_pc = self
                .runtime_function(runtime_index)
                .expect("index just resolved")
                .translate_to_runtime_pc(opcode_index);

            let local_count = reader.read_u32()? as usize;
            let flow = self.selected_control_flow_mut();
            let locals_start = flow.locals_size();
            if !flow.grow_locals(local_count) {
                return Err(SerializeError::IncompatibleFormat(
                    "local variables exceed the buffer limit".into(),
                ));
            }
            for index in 0..local_count {
                let value = reader.read_i64()?;
                flow.set_local_slot(locals_start + index, value);
            }
            flow.call_stack.push(ControlFlowState {
                runtime_function: runtime_index,
                base_call_index: 0,
                program_counter: runtime_pc,
                locals_start,
            });

            frame_function_ids.push(function_id);
            frame_opcode_indices.push(opcode_index);
        }

        // Repair callers whose call sites moved between versions.
        if frame_count > 1 {
            let program = Arc::clone(self.program());
            for frame_index in 0..frame_count - 1 {
                let caller_id = frame_function_ids[frame_index];
                let callee_id = frame_function_ids[frame_index + 1];
                let old_pc = frame_opcode_indices[frame_index];
                let repaired =
                    match_caller_program_counter(program.as_ref(), caller_id, callee_id, old_pc);
                let runtime_index =
                    self.selected_control_flow().call_stack()[frame_index].runtime_function;
                let runtime_pc = self
                    .runtime_function(runtime_index)
                    .expect("frame resolved above")
                    .translate_to_runtime_pc(repaired);
                self.selected_control_flow_mut().call_stack[frame_index].program_counter =
                    runtime_pc;
            }
        }

        // Value stack.
        let cell_count = reader.read_u32()? as usize;
        let mut cells = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            cells.push(reader.read_u64()?);
        }
        self.selected_control_flow_mut().restore_value_stack(&cells);

        // Global variables by name hash; unknown names are skipped.
        let global_count = reader.read_u32()? as usize;
        for _ in 0..global_count {
            let name = reader.read_str()?;
            let value = reader.read_u64()?;
            let name_hash = murmur2_64(name.as_bytes());
            let variable_id = self
                .program()
                .global_variable_by_name(name_hash)
                .filter(|variable| variable.kind() == lemon_core::VariableKind::Global)
                .map(|variable| variable.id());
            if let Some(id) = variable_id {
                self.set_global_variable_value(id, lemon_core::AnyBaseValue::from_raw(value));
            }
        }

        Ok(())
    }
}

/// Find the call-site opcode in the caller that most plausibly produced
/// the given child frame: nearest matching direct call, then nearest
/// external call, then nearest call to a native function.
fn match_caller_program_counter(
    program: &Program,
    caller_id: u32,
    callee_id: u32,
    old_pc: usize,
) -> usize {
    let Some(caller) = program.script_function_by_id(caller_id) else {
        return old_pc;
    };
    let Some(callee) = program.function_by_id(callee_id) else {
        return old_pc;
    };
    let callee_hash = callee.info().name_and_signature_hash();

    let nearest = |candidates: &mut dyn Iterator<Item = usize>| -> Option<usize> {
        candidates.min_by_key(|&pc| pc.abs_diff(old_pc))
    };

    // Pass 1: direct calls to the callee.
    let mut direct = caller.opcodes.iter().enumerate().filter_map(|(index, opcode)| {
        (opcode.opcode_type == OpcodeType::Call
            && opcode.parameter as u64 == callee_hash
            && opcode.data_type == lemon_core::BaseType::Void)
            .then_some(index + 1)
    });
    if let Some(pc) = nearest(&mut direct) {
        return pc;
    }

    // Pass 2: external calls, no filtering.
    let mut external = caller.opcodes.iter().enumerate().filter_map(|(index, opcode)| {
        (opcode.opcode_type == OpcodeType::ExternalCall).then_some(index + 1)
    });
    if let Some(pc) = nearest(&mut external) {
        return pc;
    }

    // Pass 3: calls that resolve to native functions.
    let mut native_calls = caller.opcodes.iter().enumerate().filter_map(|(index, opcode)| {
        if opcode.opcode_type != OpcodeType::Call
            || opcode.data_type != lemon_core::BaseType::Void
        {
            return None;
        }
        match program.function_by_signature(opcode.parameter as u64, 0) {
            Some(Function::Native(_)) => Some(index + 1),
            _ => None,
        }
    });
    if let Some(pc) = nearest(&mut native_calls) {
        return pc;
    }

    old_pc
}
