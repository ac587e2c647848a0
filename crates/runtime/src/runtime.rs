//! The runtime: lazy function building and the interpreter loop
//!
//! A runtime borrows a linked [`Program`] and owns the executable state:
//! one [`RuntimeFunction`] per script function (built on first call), the
//! static memory block for globals, the runtime string table, and the
//! control flows. Execution is cooperative: `execute_steps` runs under a
//! host step budget and hands every non-local control transfer (calls,
//! returns, external calls/jumps) back to the host through an
//! [`ExecuteConnector`].

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lemon_core::{
    name_and_signature_hash, void_signature_hash, AnyBaseValue, DataTypeRef, FunctionInfo,
    FunctionKind, SignatureBuilder, StringLookup, VariableKind,
};

use crate::control_flow::{ControlFlow, ControlFlowState, StackCheck};
use crate::error::RuntimeError;
use crate::exec::ExecContext;
use crate::memory::{MemoryAccessHandler, NullMemoryAccessHandler};
use crate::program::Program;
use crate::runtime_function::{
    BuildEnv, GlobalsLayout, ResolvedCallTarget, RuntimeFunction, RuntimeOpcodeFlags,
};

/// Result state of one `execute_steps` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Okay,
    Halt,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteResult {
    pub result: ExecutionResult,
    pub steps_executed: usize,
}

/// Host interface receiving all non-local control transfers.
pub trait ExecuteConnector {
    /// A call was dispatched; `function` is the resolved callee, or `None`
    /// when resolution failed. Returning false aborts execution.
    fn handle_call(&mut self, function: Option<&FunctionInfo>, call_target: u64) -> bool;
    /// A frame returned. Returning false stops execution.
    fn handle_return(&mut self) -> bool;
    fn handle_external_call(&mut self, address: u64) -> bool;
    fn handle_external_jump(&mut self, address: u64) -> bool;
}

/// Hooks around native function execution, e.g. for profiling.
pub trait RuntimeDetailHandler {
    fn pre_execute_external_function(&mut self, _function: &FunctionInfo, _flow: &ControlFlow) {}
    fn post_execute_external_function(&mut self, _function: &FunctionInfo, _flow: &ControlFlow) {}
}

/// Typed parameters for host-initiated calls by signature.
#[derive(Default)]
pub struct FunctionCallParameters {
    pub return_type: Option<DataTypeRef>,
    pub parameters: Vec<(DataTypeRef, u64)>,
}

/// Host-visible source location of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLocation {
    pub function_id: u32,
    /// Source opcode index.
    pub program_counter: usize,
}

/// Cloneable handle for requesting a cooperative stop from native code.
#[derive(Clone)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

// Process-wide slots: the active runtime (per thread) and the active
// environment host data. Set by a scoped guard for the duration of
// `execute_steps`.
thread_local! {
    static ACTIVE_RUNTIME_ID: Cell<Option<u64>> = const { Cell::new(None) };
    static ACTIVE_ENVIRONMENT: std::cell::RefCell<Option<Arc<dyn std::any::Any>>> =
        const { std::cell::RefCell::new(None) };
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Install host environment data reachable from native functions on this
/// thread.
pub fn set_active_environment(environment: Option<Arc<dyn std::any::Any>>) {
    ACTIVE_ENVIRONMENT.with(|slot| *slot.borrow_mut() = environment);
}

pub fn active_environment() -> Option<Arc<dyn std::any::Any>> {
    ACTIVE_ENVIRONMENT.with(|slot| slot.borrow().clone())
}

struct ActiveRuntimeGuard;

impl ActiveRuntimeGuard {
    fn enter(runtime_id: u64) -> Self {
        ACTIVE_RUNTIME_ID.with(|slot| slot.set(Some(runtime_id)));
        ActiveRuntimeGuard
    }
}

impl Drop for ActiveRuntimeGuard {
    fn drop(&mut self) {
        ACTIVE_RUNTIME_ID.with(|slot| slot.set(None));
    }
}

enum InnerExit {
    StepLimit,
    Call { opcode_index: usize },
    Return,
    ExternalCall(u64),
    ExternalJump(u64),
    InvalidProgramCounter,
}

pub struct Runtime {
    instance_id: u64,
    program: Arc<Program>,
    memory_access_handler: Box<dyn MemoryAccessHandler>,
    runtime_detail_handler: Option<Box<dyn RuntimeDetailHandler>>,

    runtime_functions: Vec<RuntimeFunction>,
    functions_mapped: HashMap<u32, usize>,
    /// Name-and-signature hash → runtime function chain, most-derived
    /// first (base calls index into this).
    functions_by_signature: HashMap<u64, Vec<usize>>,

    globals_layout: GlobalsLayout,
    static_memory: Vec<u8>,
    strings: StringLookup,

    control_flows: Vec<ControlFlow>,
    selected_control_flow: usize,

    encountered_build_error: bool,
    stop_signal: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            instance_id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            program: Arc::new(Program::new()),
            memory_access_handler: Box::new(NullMemoryAccessHandler),
            runtime_detail_handler: None,
            runtime_functions: Vec::new(),
            functions_mapped: HashMap::new(),
            functions_by_signature: HashMap::new(),
            globals_layout: GlobalsLayout::default(),
            static_memory: Vec::new(),
            strings: StringLookup::new(),
            control_flows: vec![ControlFlow::new()],
            selected_control_flow: 0,
            encountered_build_error: false,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn set_program(&mut self, program: Arc<Program>) {
        self.program = program;
        self.reset();
        self.setup_global_variables();
    }

    pub fn set_memory_access_handler(&mut self, handler: Box<dyn MemoryAccessHandler>) {
        self.memory_access_handler = handler;
    }

    pub fn memory_access_handler_mut(&mut self) -> &mut dyn MemoryAccessHandler {
        &mut *self.memory_access_handler
    }

    pub fn set_runtime_detail_handler(&mut self, handler: Box<dyn RuntimeDetailHandler>) {
        self.runtime_detail_handler = Some(handler);
    }

    pub fn is_active(&self) -> bool {
        ACTIVE_RUNTIME_ID.with(|slot| slot.get()) == Some(self.instance_id)
    }

    pub fn stop_signal_handle(&self) -> StopSignal {
        StopSignal(self.stop_signal.clone())
    }

    pub fn trigger_stop_signal(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    /// Rebuild the (empty) runtime function table from the program and
    /// reload string literals. Clears all control flows.
    pub fn reset(&mut self) {
        self.encountered_build_error = false;
        self.clear_all_control_flows();

        self.runtime_functions.clear();
        self.functions_mapped.clear();
        self.functions_by_signature.clear();
        self.strings.clear();

        let program = Arc::clone(&self.program);
        for &function_id in program.script_function_ids() {
            let index = self.runtime_functions.len();
            self.runtime_functions.push(RuntimeFunction::new(function_id));
            self.functions_mapped.insert(function_id, index);
            if let Some(function) = program.script_function_by_id(function_id) {
                // Most-derived first: later modules shadow earlier ones.
                self.functions_by_signature
                    .entry(function.info.name_and_signature_hash())
                    .or_default()
                    .insert(0, index);
            }
        }
        program.collect_all_string_literals(&mut self.strings);
    }

    pub fn clear_all_control_flows(&mut self) {
        for flow in &mut self.control_flows {
            flow.reset();
        }
        self.selected_control_flow = 0;
    }

    /// Reset global variables back to their initial values.
    pub fn reset_runtime_state(&mut self) {
        self.setup_global_variables();
    }

    fn setup_global_variables(&mut self) {
        self.globals_layout = GlobalsLayout::build(&self.program);
        self.static_memory = vec![0; self.globals_layout.total_size()];
        let program = Arc::clone(&self.program);
        for variable in program.global_variables() {
            if variable.kind() == VariableKind::Global {
                if let Some(slot) = self.globals_layout.slot(variable.id()) {
                    let value = variable.initial_value().get::<i64>();
                    self.static_memory[slot.offset..slot.offset + 8]
                        .copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }

    // --- runtime functions ---

    /// Eagerly build every script function's runtime form.
    pub fn build_all_runtime_functions(&mut self) {
        let ids: Vec<u32> = self.functions_mapped.keys().copied().collect();
        for id in ids {
            self.runtime_function_index(id);
        }
    }

    pub fn encountered_build_error(&self) -> bool {
        self.encountered_build_error
    }

    pub fn can_execute_steps(&self) -> bool {
        !self.encountered_build_error
    }

    /// Index of the (built) runtime function for a script function ID.
    /// Builds lazily; a build failure latches the runtime-wide error.
    pub fn runtime_function_index(&mut self, function_id: u32) -> Option<usize> {
        let index = *self.functions_mapped.get(&function_id)?;
        if !self.runtime_functions[index].is_built() {
            let program = Arc::clone(&self.program);
            let function = program.script_function_by_id(function_id)?;
            let mut env = BuildEnv {
                program: program.as_ref(),
                memory: &mut *self.memory_access_handler,
                globals_layout: &self.globals_layout,
            };
            if let Err(error) = self.runtime_functions[index].build(function, &mut env) {
                tracing::error!(function = %function.info.name, %error, "runtime function build failed");
                self.encountered_build_error = true;
                return None;
            }
        }
        Some(index)
    }

    pub fn runtime_function(&self, index: usize) -> Option<&RuntimeFunction> {
        self.runtime_functions.get(index)
    }

    fn runtime_function_index_by_signature(
        &mut self,
        name_and_signature: u64,
        chain_index: usize,
    ) -> Option<usize> {
        let index = *self
            .functions_by_signature
            .get(&name_and_signature)?
            .get(chain_index)?;
        let function_id = self.runtime_functions[index].function_id;
        self.runtime_function_index(function_id)
    }

    // --- strings ---

    pub fn add_string(&mut self, text: &str) -> u64 {
        self.strings.add(text)
    }

    pub fn has_string_with_key(&self, key: u64) -> bool {
        self.strings.contains_hash(key)
    }

    pub fn resolve_string_by_key(&self, key: u64) -> Option<&str> {
        self.strings.get_by_hash(key).map(|stored| stored.as_str())
    }

    // --- global variables ---

    pub fn global_variable_value(&self, variable_id: u32) -> AnyBaseValue {
        match self.globals_layout.slot(variable_id) {
            Some(slot) => {
                let bytes: [u8; 8] = self.static_memory[slot.offset..slot.offset + 8]
                    .try_into()
                    .expect("global slots are 8 bytes");
                AnyBaseValue::from(i64::from_le_bytes(bytes))
            }
            None => AnyBaseValue::new(),
        }
    }

    pub fn set_global_variable_value(&mut self, variable_id: u32, value: AnyBaseValue) {
        if let Some(slot) = self.globals_layout.slot(variable_id) {
            self.static_memory[slot.offset..slot.offset + 8]
                .copy_from_slice(&value.get::<i64>().to_le_bytes());
        }
    }

    // --- control flows ---

    pub fn main_control_flow(&self) -> &ControlFlow {
        &self.control_flows[0]
    }

    pub fn selected_control_flow(&self) -> &ControlFlow {
        &self.control_flows[self.selected_control_flow]
    }

    pub fn selected_control_flow_mut(&mut self) -> &mut ControlFlow {
        &mut self.control_flows[self.selected_control_flow]
    }

    /// Host-visible call stack as (function, source opcode index) pairs.
    pub fn call_stack_locations(&self) -> Vec<ExecutionLocation> {
        self.selected_control_flow()
            .call_stack()
            .iter()
            .map(|state| {
                let function = &self.runtime_functions[state.runtime_function];
                ExecutionLocation {
                    function_id: function.function_id,
                    program_counter: function
                        .translate_from_runtime_pc(state.program_counter)
                        .unwrap_or(0),
                }
            })
            .collect()
    }

    /// Execution context over this runtime's state, for native calls made
    /// outside `execute_steps` (e.g. compile-time evaluation).
    pub fn make_exec_context(&mut self) -> ExecContext<'_> {
        ExecContext {
            flow: &mut self.control_flows[self.selected_control_flow],
            program: self.program.as_ref(),
            static_memory: &mut self.static_memory,
            strings: &mut self.strings,
            memory: &mut *self.memory_access_handler,
        }
    }

    // --- calls ---

    fn push_runtime_frame(
        &mut self,
        runtime_function_index: usize,
        base_call_index: usize,
    ) -> Result<(), RuntimeError> {
        let function_id = self.runtime_functions[runtime_function_index].function_id;
        let local_count = self
            .program
            .script_function_by_id(function_id)
            .map(|function| function.local_variables.len())
            .unwrap_or(0);
        let flow = &mut self.control_flows[self.selected_control_flow];
        if flow.locals_size() + local_count > ControlFlow::VAR_STACK_LIMIT {
            return Err(RuntimeError::VariableStackOverflow);
        }
        let locals_start = flow.locals_size();
        flow.call_stack.push(ControlFlowState {
            runtime_function: runtime_function_index,
            base_call_index,
            program_counter: 0,
            locals_start,
        });
        Ok(())
    }

    /// Call a function by ID: script functions get a new frame, native
    /// functions execute immediately.
    pub fn call_function(&mut self, function_id: u32) -> Result<(), RuntimeError> {
        self.call_function_with_base_index(function_id, 0)
    }

    fn call_function_with_base_index(
        &mut self,
        function_id: u32,
        base_call_index: usize,
    ) -> Result<(), RuntimeError> {
        let program = Arc::clone(&self.program);
        let function = program
            .function_by_id(function_id)
            .ok_or_else(|| RuntimeError::UnknownFunction(format!("#{}", function_id)))?;
        match function.info().kind {
            FunctionKind::Script => {
                let index = self
                    .runtime_function_index(function_id)
                    .ok_or_else(|| RuntimeError::UnknownFunction(format!("#{}", function_id)))?;
                self.push_runtime_frame(index, base_call_index)
            }
            FunctionKind::Native => {
                let native = function.as_native().expect("kind checked");
                if let Some(handler) = &mut self.runtime_detail_handler {
                    handler.pre_execute_external_function(
                        &native.info,
                        &self.control_flows[self.selected_control_flow],
                    );
                }
                {
                    let mut context = ExecContext {
                        flow: &mut self.control_flows[self.selected_control_flow],
                        program: program.as_ref(),
                        static_memory: &mut self.static_memory,
                        strings: &mut self.strings,
                        memory: &mut *self.memory_access_handler,
                    };
                    native.execute(&mut context);
                }
                if let Some(handler) = &mut self.runtime_detail_handler {
                    handler.post_execute_external_function(
                        &native.info,
                        &self.control_flows[self.selected_control_flow],
                    );
                }
                Ok(())
            }
        }
    }

    /// Call a `() -> void` function by name, optionally at a label.
    pub fn call_function_by_name(&mut self, name: &str, label: Option<&str>) -> bool {
        let name_hash = lemon_core::murmur2_64(name.as_bytes());
        let hash = name_and_signature_hash(name_hash, void_signature_hash());
        let Some(function) = self.program.function_by_signature(hash, 0) else {
            return false;
        };
        let function_id = function.info().id;
        match label {
            None => self.call_function(function_id).is_ok(),
            Some(label) => self.call_function_at_label(function_id, label).is_ok(),
        }
    }

    /// Call a script function with its frame starting at a label. All
    /// local variables of the function start out zeroed.
    pub fn call_function_at_label(
        &mut self,
        function_id: u32,
        label_name: &str,
    ) -> Result<(), RuntimeError> {
        let program = Arc::clone(&self.program);
        let function = program
            .script_function_by_id(function_id)
            .ok_or_else(|| RuntimeError::UnknownFunction(format!("#{}", function_id)))?;
        let label = function
            .label_by_name(lemon_core::murmur2_64(label_name.as_bytes()))
            .ok_or_else(|| RuntimeError::UnknownLabel(label_name.to_string()))?;
        let label_offset = label.offset as usize;
        let local_count = function.local_variables.len();

        let index = self
            .runtime_function_index(function_id)
            .ok_or_else(|| RuntimeError::UnknownFunction(format!("#{}", function_id)))?;
        self.push_runtime_frame(index, 0)?;

        let runtime_pc = self.runtime_functions[index].translate_to_runtime_pc(label_offset);
        let flow = &mut self.control_flows[self.selected_control_flow];
        if !flow.grow_locals(local_count) {
            flow.call_stack.pop();
            return Err(RuntimeError::VariableStackOverflow);
        }
        flow.call_stack.last_mut().expect("frame just pushed").program_counter = runtime_pc;
        Ok(())
    }

    /// Resolve a function by name and built signature, push the given
    /// parameters, and call it.
    pub fn call_function_with_parameters(
        &mut self,
        name: &str,
        parameters: &FunctionCallParameters,
    ) -> bool {
        let return_type = parameters
            .return_type
            .clone()
            .unwrap_or_else(lemon_core::PredefinedDataTypes::void);
        let mut builder = SignatureBuilder::new(&return_type);
        for (data_type, _) in &parameters.parameters {
            builder.add_parameter_type(data_type);
        }
        let name_hash = lemon_core::murmur2_64(name.as_bytes());
        let hash = name_and_signature_hash(name_hash, builder.finish());
        let Some(function) = self.program.function_by_signature(hash, 0) else {
            return false;
        };
        let function_id = function.info().id;

        for (_, storage) in &parameters.parameters {
            self.control_flows[self.selected_control_flow].push(*storage);
        }
        self.call_function(function_id).is_ok()
    }

    /// Pop the current frame, truncating its locals. False when the call
    /// stack is empty.
    pub fn return_from_function(&mut self) -> bool {
        let flow = &mut self.control_flows[self.selected_control_flow];
        match flow.call_stack.last() {
            Some(state) => {
                let locals_start = state.locals_start;
                flow.truncate_locals(locals_start);
                flow.call_stack.pop();
                true
            }
            None => false,
        }
    }

    // --- execution ---

    /// Run up to `steps_limit` opcodes on the selected control flow.
    ///
    /// Returns when the budget is exhausted at a jump or call boundary,
    /// when the call stack drops to `minimum_call_stack_size`, when a stop
    /// signal arrives, or when a connector handler returns false.
    pub fn execute_steps(
        &mut self,
        connector: &mut dyn ExecuteConnector,
        steps_limit: usize,
        minimum_call_stack_size: usize,
    ) -> ExecuteResult {
        let mut result = ExecuteResult {
            result: ExecutionResult::Okay,
            steps_executed: 0,
        };
        if self.encountered_build_error {
            result.result = ExecutionResult::Halt;
            return result;
        }
        if self.control_flows[self.selected_control_flow].call_stack().len()
            <= minimum_call_stack_size
        {
            result.result = ExecutionResult::Halt;
            return result;
        }

        self.stop_signal.store(false, Ordering::Relaxed);
        let _guard = ActiveRuntimeGuard::enter(self.instance_id);
        let mut steps = 0usize;

        while !self.stop_signal.load(Ordering::Relaxed) {
            let selected = self.selected_control_flow;
            {
                let flow = &mut self.control_flows[selected];
                match flow.check_value_stack_bounds() {
                    StackCheck::Okay => {}
                    StackCheck::ClampedUnderflow => {
                        tracing::warn!("value stack error: removed elements from empty stack");
                    }
                    StackCheck::ClampedOverflow => {
                        tracing::warn!("value stack error: too many elements");
                    }
                }
                flow.refresh_current_locals();
            }

            let Some(state) = self.control_flows[selected].call_stack().last() else {
                result.steps_executed = steps;
                return result;
            };
            let function_index = state.runtime_function;

            let exit = {
                let program = Arc::clone(&self.program);
                let mut context = ExecContext {
                    flow: &mut self.control_flows[selected],
                    program: program.as_ref(),
                    static_memory: &mut self.static_memory,
                    strings: &mut self.strings,
                    memory: &mut *self.memory_access_handler,
                };
                run_inner(
                    &self.runtime_functions[function_index],
                    &mut context,
                    &mut steps,
                    steps_limit,
                )
            };

            match exit {
                InnerExit::StepLimit => {
                    result.steps_executed = steps;
                    return result;
                }
                InnerExit::InvalidProgramCounter => {
                    tracing::error!("invalid program counter, halting");
                    result.result = ExecutionResult::Halt;
                    result.steps_executed = steps;
                    return result;
                }
                InnerExit::Return => {
                    if connector.handle_return()
                        && self.control_flows[selected].call_stack().len()
                            > minimum_call_stack_size
                        && steps < steps_limit
                    {
                        continue;
                    }
                    result.steps_executed = steps;
                    return result;
                }
                InnerExit::Call { opcode_index } => {
                    let (call_target, is_base_call) = {
                        let op = &self.runtime_functions[function_index].buffer.ops()[opcode_index];
                        (
                            op.param_u64(0),
                            op.flags.contains(RuntimeOpcodeFlags::CALL_IS_BASE_CALL),
                        )
                    };
                    let base_call_index = if is_base_call {
                        self.control_flows[selected]
                            .call_stack()
                            .last()
                            .map(|state| state.base_call_index + 1)
                            .unwrap_or(0)
                    } else {
                        0
                    };

                    let called = match self.handle_result_call(
                        function_index,
                        opcode_index,
                        call_target,
                        base_call_index,
                    ) {
                        Ok(called) => called,
                        Err(error) => {
                            tracing::error!(%error, "call dispatch failed, halting");
                            result.result = ExecutionResult::Halt;
                            result.steps_executed = steps;
                            return result;
                        }
                    };

                    let program = Arc::clone(&self.program);
                    let info = called
                        .and_then(|id| program.function_by_id(id))
                        .map(|function| function.info());
                    if connector.handle_call(info, call_target) {
                        continue;
                    }
                    result.steps_executed = steps;
                    return result;
                }
                InnerExit::ExternalCall(address) => {
                    if connector.handle_external_call(address) {
                        continue;
                    }
                    result.steps_executed = steps;
                    return result;
                }
                InnerExit::ExternalJump(address) => {
                    if connector.handle_external_jump(address)
                        && self.control_flows[selected].call_stack().len()
                            > minimum_call_stack_size
                        && steps < steps_limit
                    {
                        continue;
                    }
                    result.steps_executed = steps;
                    return result;
                }
            }
        }

        result.steps_executed = steps;
        result
    }

    /// Resolve and dispatch a CALL opcode. Caches the resolution on the
    /// runtime opcode so subsequent executions skip the signature lookup.
    fn handle_result_call(
        &mut self,
        function_index: usize,
        opcode_index: usize,
        call_target: u64,
        base_call_index: usize,
    ) -> Result<Option<u32>, RuntimeError> {
        let resolved = self.runtime_functions[function_index].buffer.ops()[opcode_index]
            .resolved_call
            .get();

        match resolved {
            ResolvedCallTarget::RuntimeFunction(index) => {
                self.push_runtime_frame(index, base_call_index)?;
                Ok(Some(self.runtime_functions[index].function_id))
            }
            ResolvedCallTarget::Function(function_id) => {
                self.call_function_with_base_index(function_id, base_call_index)?;
                Ok(Some(function_id))
            }
            ResolvedCallTarget::Unresolved => {
                if let Some(index) =
                    self.runtime_function_index_by_signature(call_target, base_call_index)
                {
                    let function_id = self.runtime_functions[index].function_id;
                    self.runtime_functions[function_index].buffer.ops()[opcode_index]
                        .resolved_call
                        .set(ResolvedCallTarget::RuntimeFunction(index));
                    self.push_runtime_frame(index, base_call_index)?;
                    return Ok(Some(function_id));
                }

                let function_id = self
                    .program
                    .function_by_signature(call_target, base_call_index)
                    .map(|function| function.info().id);
                match function_id {
                    Some(function_id) => {
                        self.runtime_functions[function_index].buffer.ops()[opcode_index]
                            .resolved_call
                            .set(ResolvedCallTarget::Function(function_id));
                        self.call_function_with_base_index(function_id, base_call_index)?;
                        Ok(Some(function_id))
                    }
                    None => {
                        tracing::warn!(call_target, "unresolved call target");
                        Ok(None)
                    }
                }
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

/// The inner interpreter loop: straight-line batches plus jumps, inside a
/// single function. Exits on every transfer that changes the running
/// function or needs the host.
fn run_inner(
    function: &RuntimeFunction,
    context: &mut ExecContext<'_>,
    steps: &mut usize,
    steps_limit: usize,
) -> InnerExit {
    use lemon_core::OpcodeType as O;

    let mut opcode_index = match context.flow.call_stack.last() {
        Some(state) => state.program_counter,
        None => return InnerExit::InvalidProgramCounter,
    };

    loop {
        let Some(op) = function.buffer.get(opcode_index) else {
            return InnerExit::InvalidProgramCounter;
        };

        if op.successive_count > 0 {
            if op.successive_count >= 4 {
                // Four opcodes in a row without per-opcode dispatch checks.
                let mut current = opcode_index;
                for _ in 0..4 {
                    let op = &function.buffer.ops()[current];
                    (op.exec_fn)(context, op);
                    current = op.next as usize;
                }
                *steps += 4;
                opcode_index = current;
            } else {
                (op.exec_fn)(context, op);
                opcode_index = op.next as usize;
                *steps += 1;
            }
            continue;
        }

        match op.opcode_type {
            O::JumpConditional => {
                let condition = context.flow.pop::<u64>();
                if condition != 0 {
                    opcode_index = op.next as usize;
                    *steps += 1;
                    continue;
                }
                // Fall through into an unconditional jump.
                let target = op.param_u32(0) as usize;
                *steps += 1;
                if let Some(state) = context.flow.call_stack.last_mut() {
                    state.program_counter = target;
                }
                if *steps >= steps_limit {
                    return InnerExit::StepLimit;
                }
                opcode_index = target;
            }
            O::Jump => {
                let target = op.param_u32(0) as usize;
                *steps += 1;
                if let Some(state) = context.flow.call_stack.last_mut() {
                    state.program_counter = target;
                }
                // The budget is only checked on executed jumps; this is
                // what keeps endless loops preemptible.
                if *steps >= steps_limit {
                    return InnerExit::StepLimit;
                }
                opcode_index = target;
            }
            O::JumpSwitch => {
                if context.flow.read_value::<u64>(-1) == 0 {
                    context.flow.move_value_stack(-1);
                    opcode_index = op.param_u32(0) as usize;
                } else {
                    let value = context.flow.read_value::<u64>(-1);
                    context.flow.write_value(-1, value.wrapping_sub(1));
                    opcode_index = op.next as usize;
                    *steps += 1;
                }
            }
            O::Call => {
                if let Some(state) = context.flow.call_stack.last_mut() {
                    state.program_counter = op.next as usize;
                }
                *steps += 1;
                return InnerExit::Call { opcode_index };
            }
            O::Return => {
                let locals_start = context
                    .flow
                    .call_stack
                    .last()
                    .map(|state| state.locals_start)
                    .unwrap_or(0);
                context.flow.truncate_locals(locals_start);
                context.flow.call_stack.pop();
                *steps += 1;
                return InnerExit::Return;
            }
            O::ExternalCall => {
                if let Some(state) = context.flow.call_stack.last_mut() {
                    state.program_counter = opcode_index + 1;
                }
                let address = context.flow.pop::<u64>();
                *steps += 1;
                return InnerExit::ExternalCall(address);
            }
            O::ExternalJump => {
                let address = context.flow.pop::<u64>();
                let locals_start = context
                    .flow
                    .call_stack
                    .last()
                    .map(|state| state.locals_start)
                    .unwrap_or(0);
                context.flow.truncate_locals(locals_start);
                context.flow.call_stack.pop();
                *steps += 1;
                return InnerExit::ExternalJump(address);
            }
            _ => return InnerExit::InvalidProgramCounter,
        }
    }
}
