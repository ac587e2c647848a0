//! End-to-end execution tests: hand-built bytecode through linking, the
//! runtime-function builder, and the interpreter loop.

use std::sync::Arc;

use lemon_core::{
    name_and_signature_hash, BaseType, FlyweightString, FunctionInfo,
    FunctionParameter, GlobalsLookup, Opcode, OpcodeFlags, OpcodeType, PredefinedDataTypes,
};
use lemon_runtime::{
    add_definitions_from_module, wrap, ExecuteConnector, ExecutionResult, FlatMemoryAccessHandler,
    MemoryAccessHandler, Module, Program, Runtime,
};

/// Connector that approves everything and records what it saw.
#[derive(Default)]
struct RecordingConnector {
    calls: Vec<u64>,
    returns: usize,
    external_calls: Vec<u64>,
    external_jumps: Vec<u64>,
}

impl ExecuteConnector for RecordingConnector {
    fn handle_call(&mut self, _function: Option<&FunctionInfo>, call_target: u64) -> bool {
        self.calls.push(call_target);
        true
    }
    fn handle_return(&mut self) -> bool {
        self.returns += 1;
        true
    }
    fn handle_external_call(&mut self, address: u64) -> bool {
        self.external_calls.push(address);
        true
    }
    fn handle_external_jump(&mut self, address: u64) -> bool {
        self.external_jumps.push(address);
        true
    }
}

struct Setup {
    runtime: Runtime,
}

fn link(module: Module) -> Setup {
    let mut program = Program::new();
    program.add_module(module);
    let mut runtime = Runtime::new();
    runtime.set_program(Arc::new(program));
    Setup { runtime }
}

fn module_with_function(name: &str, opcodes: Vec<Opcode>) -> (Module, u32) {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let function = module.add_script_function(
        FlyweightString::new(name),
        PredefinedDataTypes::void(),
        Vec::<FunctionParameter>::new(),
        Vec::new(),
    );
    function.opcodes = opcodes;
    let id = function.info.id;
    (module, id)
}

#[test]
fn endless_loop_honors_step_budget() {
    // while (true) {}  —  a jump to itself.
    let mut jump = Opcode::simple(OpcodeType::Jump, 0, 1);
    jump.flags |= OpcodeFlags::SEQ_BREAK;
    let (module, function_id) =
        module_with_function("spin", vec![jump, Opcode::simple(OpcodeType::Return, 0, 2)]);
    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();

    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 10, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(result.steps_executed, 10);
    // The frame is still on the call stack, ready to continue.
    assert_eq!(setup.runtime.selected_control_flow().call_stack().len(), 1);

    // Continuing runs another budget's worth.
    let result = setup.runtime.execute_steps(&mut connector, 10, 0);
    assert_eq!(result.steps_executed, 10);
}

#[test]
fn fused_global_write_and_discard() {
    // global u16 g; g = 0x1234
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("g"), PredefinedDataTypes::u16())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("store"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 0x1234, 1),
        Opcode::new(
            OpcodeType::SetVariableValue,
            BaseType::Uint16,
            variable_id as i64,
            1,
        ),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let function_id = function.info.id;

    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();

    // The set + discard pair fuses into one runtime opcode:
    // push / set-and-discard / return.
    let index = setup.runtime.runtime_function_index(function_id).unwrap();
    assert_eq!(setup.runtime.runtime_function(index).unwrap().buffer.len(), 3);

    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(setup.runtime.selected_control_flow().value_stack_size(), 0);
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u16>(),
        0x1234
    );
}

#[test]
fn call_and_return_round_trip() {
    // function u32 g() { return 7 }  function void f() { g() }
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);

    let g = module.add_script_function(
        FlyweightString::new("g"),
        PredefinedDataTypes::u32(),
        Vec::new(),
        Vec::new(),
    );
    g.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 7, 1),
        Opcode::simple(OpcodeType::Return, 0, 1),
    ];
    let g_hash = g.info.name_and_signature_hash();

    let f = module.add_script_function(
        FlyweightString::new("f"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    f.opcodes = vec![
        Opcode::simple(OpcodeType::Call, g_hash as i64, 2),
        Opcode::simple(OpcodeType::MoveStack, -1, 2),
        Opcode::simple(OpcodeType::Return, 0, 3),
    ];
    let f_id = f.info.id;

    let mut setup = link(module);
    setup.runtime.call_function(f_id).unwrap();

    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(connector.calls, vec![g_hash]);
    assert_eq!(connector.returns, 2);
    // Balanced: nothing left on the value stack, no frames left.
    assert_eq!(setup.runtime.selected_control_flow().value_stack_size(), 0);
    assert!(setup.runtime.selected_control_flow().call_stack().is_empty());

    // The second run resolves the call through the cached target.
    setup.runtime.call_function(f_id).unwrap();
    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(connector.calls, vec![g_hash]);
}

#[test]
fn conditional_jump_consumes_final_step() {
    // A taken conditional jump with the budget exhausted still counts the
    // step and hands control back.
    let mut target = Opcode::simple(OpcodeType::PushConstant, 0, 1);
    target.flags |= OpcodeFlags::SEQ_BREAK;
    let (module, function_id) = module_with_function(
        "loopy",
        vec![
            target,
            Opcode::simple(OpcodeType::JumpConditional, 0, 1),
            Opcode::simple(OpcodeType::Return, 0, 2),
        ],
    );
    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();

    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 2, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(result.steps_executed, 2);
    assert_eq!(setup.runtime.selected_control_flow().call_stack().len(), 1);
}

#[test]
fn jump_switch_counts_down() {
    // Push 2, then loop a body twice via JUMP_SWITCH.
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("iterations"), PredefinedDataTypes::u16())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("countdown"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    let mut switch_op = Opcode::simple(OpcodeType::JumpSwitch, 8, 1);
    switch_op.flags |= OpcodeFlags::SEQ_BREAK;
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 2, 1),
        switch_op,
        Opcode::new(OpcodeType::GetVariableValue, BaseType::Uint16, variable_id as i64, 2),
        Opcode::simple(OpcodeType::PushConstant, 1, 2),
        Opcode::new(OpcodeType::ArithmAdd, BaseType::Uint16, 0, 2),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint16, variable_id as i64, 2),
        Opcode::simple(OpcodeType::MoveStack, -1, 2),
        Opcode::simple(OpcodeType::Jump, 1, 3),
        Opcode::simple(OpcodeType::Return, 0, 4),
    ];
    let function_id = function.info.id;

    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();
    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 1000, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u16>(),
        2
    );
    assert_eq!(setup.runtime.selected_control_flow().value_stack_size(), 0);
}

#[test]
fn external_jump_pops_frame_and_notifies_host() {
    let (module, function_id) = module_with_function(
        "trampoline",
        vec![
            Opcode::simple(OpcodeType::PushConstant, 0x1000, 1),
            Opcode::simple(OpcodeType::ExternalJump, 0, 1),
            Opcode::simple(OpcodeType::Return, 0, 2),
        ],
    );
    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();

    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(connector.external_jumps, vec![0x1000]);
    // The frame was popped; the host is free to install a new one.
    assert!(setup.runtime.selected_control_flow().call_stack().is_empty());
}

#[test]
fn base_call_resolves_through_shadowing_chain() {
    // A base module and a mod both define update(); the mod's version
    // calls base.update(), which must land in the base module's function.
    let mut lookup = GlobalsLookup::new();

    let mut base = Module::new("base");
    base.start_compiling(&lookup);
    let variable_id = base
        .add_global_variable(FlyweightString::new("marker"), PredefinedDataTypes::u16())
        .info
        .id;
    let base_update = base.add_script_function(
        FlyweightString::new("update"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    base_update.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 7, 1),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint16, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let update_hash = base_update.info.name_and_signature_hash();
    add_definitions_from_module(&mut lookup, &base);

    let mut of_mod = Module::new("mod");
    of_mod.start_compiling(&lookup);
    let mod_update = of_mod.add_script_function(
        FlyweightString::new("update"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    // A base call carries a non-void data type tag on the CALL opcode.
    mod_update.opcodes = vec![
        Opcode::new(OpcodeType::Call, BaseType::Uint8, update_hash as i64, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let mod_update_id = mod_update.info.id;

    let mut program = Program::new();
    program.add_module(base);
    program.add_module(of_mod);
    let program = Arc::new(program);
    let mut runtime = Runtime::new();
    runtime.set_program(program);

    runtime.call_function(mod_update_id).unwrap();
    let mut connector = RecordingConnector::default();
    let result = runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    // The base implementation ran.
    assert_eq!(runtime.global_variable_value(variable_id).get::<u16>(), 7);
}

#[test]
fn native_function_call_from_script() {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let native = module.add_native_function(
        "triple",
        wrap(|value: u32| -> u32 { value * 3 }),
        lemon_core::FunctionFlags::empty(),
    );
    let native_hash = native.info.name_and_signature_hash();

    let variable_id = module
        .add_global_variable(FlyweightString::new("result"), PredefinedDataTypes::u32())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("run"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 5, 1),
        Opcode::simple(OpcodeType::Call, native_hash as i64, 1),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint32, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let function_id = function.info.id;

    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();
    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u32>(),
        15
    );
    assert_eq!(connector.calls, vec![native_hash]);
}

#[test]
fn fixed_address_memory_read_uses_direct_access() {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("loaded"), PredefinedDataTypes::u16())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("load"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 0x2010, 1),
        Opcode::new(OpcodeType::ReadMemory, BaseType::Uint16, 0, 1),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint16, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let function_id = function.info.id;

    let mut setup = link(module);
    let mut handler = FlatMemoryAccessHandler::new(0x2000, 0x100);
    handler.write16(0x2010, 0xbeef);
    setup.runtime.set_memory_access_handler(Box::new(handler));

    setup.runtime.call_function(function_id).unwrap();
    // Push + read fuse into a single direct-read opcode.
    let index = setup.runtime.runtime_function_index(function_id).unwrap();
    assert_eq!(setup.runtime.runtime_function(index).unwrap().buffer.len(), 3);

    let mut connector = RecordingConnector::default();
    setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u16>(),
        0xbeef
    );
}

#[test]
fn swapped_direct_access_swaps_bytes() {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("loaded"), PredefinedDataTypes::u16())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("load"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 0x2010, 1),
        Opcode::new(OpcodeType::ReadMemory, BaseType::Uint16, 0, 1),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint16, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let function_id = function.info.id;

    let mut setup = link(module);
    let mut handler = FlatMemoryAccessHandler::new(0x2000, 0x100);
    handler.write16(0x2010, 0xbeef);
    handler.swapped_direct_access = true;
    setup.runtime.set_memory_access_handler(Box::new(handler));

    setup.runtime.call_function(function_id).unwrap();
    let mut connector = RecordingConnector::default();
    setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u16>(),
        0xefbe
    );
}

#[test]
fn unoptimized_build_translates_one_to_one() {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let function = module.add_script_function(
        FlyweightString::new("calc"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 2, 1),
        Opcode::simple(OpcodeType::PushConstant, 3, 1),
        Opcode::new(OpcodeType::ArithmAdd, BaseType::Uint32, 0, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let opcode_count = function.opcodes.len();
    let function_id = function.info.id;

    let mut program = Program::new();
    program.set_optimization_level(0);
    program.add_module(module);
    let mut runtime = Runtime::new();
    runtime.set_program(Arc::new(program));

    let index = runtime.runtime_function_index(function_id).unwrap();
    let runtime_function = runtime.runtime_function(index).unwrap();
    assert_eq!(runtime_function.buffer.len(), opcode_count);
    // Without fusion the translation maps are the identity.
    for opcode_index in 0..opcode_count {
        let pc = runtime_function.translate_to_runtime_pc(opcode_index);
        assert_eq!(pc, opcode_index);
        assert_eq!(runtime_function.translate_from_runtime_pc(pc), Some(opcode_index));
    }
}

#[test]
fn save_and_restore_resumes_identically() {
    // g = g + 1 in an endless loop; save mid-flight, keep running, then
    // restore and verify the same trajectory.
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("counter"), PredefinedDataTypes::u16())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("tick"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    let mut loop_head = Opcode::new(
        OpcodeType::GetVariableValue,
        BaseType::Uint16,
        variable_id as i64,
        1,
    );
    loop_head.flags |= OpcodeFlags::SEQ_BREAK;
    function.opcodes = vec![
        loop_head,
        Opcode::simple(OpcodeType::PushConstant, 1, 1),
        Opcode::new(OpcodeType::ArithmAdd, BaseType::Uint16, 0, 1),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint16, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Jump, 0, 2),
        Opcode::simple(OpcodeType::Return, 0, 3),
    ];
    let function_id = function.info.id;

    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();
    let mut connector = RecordingConnector::default();
    setup.runtime.execute_steps(&mut connector, 17, 0);

    let saved = setup.runtime.save_state().unwrap();
    let saved_counter = setup.runtime.global_variable_value(variable_id).get::<u16>();

    setup.runtime.execute_steps(&mut connector, 40, 0);
    let after_continue = setup.runtime.global_variable_value(variable_id).get::<u16>();
    assert!(after_continue > saved_counter);

    setup.runtime.load_state(&saved).unwrap();
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u16>(),
        saved_counter
    );
    setup.runtime.execute_steps(&mut connector, 40, 0);
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u16>(),
        after_continue
    );
}

#[test]
fn stop_signal_exits_on_next_boundary() {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);

    // The native requests a cooperative stop through the signal handle.
    let signal_slot: Arc<std::sync::Mutex<Option<lemon_runtime::StopSignal>>> =
        Arc::new(std::sync::Mutex::new(None));
    let shared = signal_slot.clone();
    let native = module.add_native_function(
        "pause",
        wrap(move || {
            if let Some(signal) = shared.lock().unwrap().as_ref() {
                signal.trigger();
            }
        }),
        lemon_core::FunctionFlags::empty(),
    );
    let native_hash = native.info.name_and_signature_hash();

    let function = module.add_script_function(
        FlyweightString::new("main"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    let mut call = Opcode::simple(OpcodeType::Call, native_hash as i64, 1);
    call.flags |= OpcodeFlags::SEQ_BREAK;
    function.opcodes = vec![
        call,
        Opcode::simple(OpcodeType::Jump, 0, 2),
        Opcode::simple(OpcodeType::Return, 0, 3),
    ];
    let function_id = function.info.id;

    let mut setup = link(module);
    *signal_slot.lock().unwrap() = Some(setup.runtime.stop_signal_handle());

    setup.runtime.call_function(function_id).unwrap();
    let mut connector = RecordingConnector::default();
    let result = setup.runtime.execute_steps(&mut connector, 1_000_000, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    // Stopped long before the budget, with the frame intact.
    assert!(result.steps_executed < 10);
    assert_eq!(setup.runtime.selected_control_flow().call_stack().len(), 1);
}

#[test]
fn call_function_at_label() {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("path"), PredefinedDataTypes::u16())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("main"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    // Entry writes 1, the labeled tail writes 2.
    let mut tail = Opcode::simple(OpcodeType::PushConstant, 2, 4);
    tail.flags |= OpcodeFlags::SEQ_BREAK;
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 1, 1),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint16, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        tail,
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint16, variable_id as i64, 4),
        Opcode::simple(OpcodeType::MoveStack, -1, 4),
        Opcode::simple(OpcodeType::Return, 0, 5),
    ];
    function.add_label(FlyweightString::new("tail"), 3);
    let function_id = function.info.id;

    let mut setup = link(module);
    setup
        .runtime
        .call_function_at_label(function_id, "tail")
        .unwrap();
    let mut connector = RecordingConnector::default();
    setup.runtime.execute_steps(&mut connector, 100, 0);
    // Only the labeled tail ran.
    assert_eq!(setup.runtime.global_variable_value(variable_id).get::<u16>(), 2);
}

#[test]
fn call_function_with_parameters_resolves_signature() {
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("echoed"), PredefinedDataTypes::u32())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("echo"),
        PredefinedDataTypes::void(),
        vec![FunctionParameter {
            name: FlyweightString::new("value"),
            data_type: PredefinedDataTypes::u32(),
        }],
        Vec::new(),
    );
    // The single parameter arrives on the value stack.
    function.opcodes = vec![
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint32, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];

    let mut setup = link(module);
    let parameters = lemon_runtime::FunctionCallParameters {
        return_type: None,
        parameters: vec![(PredefinedDataTypes::u32(), 0xcafe)],
    };
    assert!(setup
        .runtime
        .call_function_with_parameters("echo", &parameters));
    let mut connector = RecordingConnector::default();
    setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(
        setup.runtime.global_variable_value(variable_id).get::<u32>(),
        0xcafe
    );

    // A wrong signature doesn't resolve.
    let wrong = lemon_runtime::FunctionCallParameters {
        return_type: None,
        parameters: vec![(PredefinedDataTypes::u8(), 1)],
    };
    assert!(!setup.runtime.call_function_with_parameters("echo", &wrong));
}

#[test]
fn unknown_call_target_asks_host() {
    let bogus = name_and_signature_hash(lemon_core::murmur2_64(b"missing"), 0x1234);
    let (module, function_id) = module_with_function(
        "caller",
        vec![
            Opcode::simple(OpcodeType::Call, bogus as i64, 1),
            Opcode::simple(OpcodeType::Return, 0, 2),
        ],
    );
    let mut setup = link(module);
    setup.runtime.call_function(function_id).unwrap();

    // A connector that rejects unresolved calls.
    struct StrictConnector {
        saw_unresolved: bool,
    }
    impl ExecuteConnector for StrictConnector {
        fn handle_call(&mut self, function: Option<&FunctionInfo>, _t: u64) -> bool {
            self.saw_unresolved = function.is_none();
            function.is_some()
        }
        fn handle_return(&mut self) -> bool {
            true
        }
        fn handle_external_call(&mut self, _a: u64) -> bool {
            true
        }
        fn handle_external_jump(&mut self, _a: u64) -> bool {
            true
        }
    }
    let mut connector = StrictConnector {
        saw_unresolved: false,
    };
    let result = setup.runtime.execute_steps(&mut connector, 100, 0);
    assert_eq!(result.result, ExecutionResult::Okay);
    assert!(connector.saw_unresolved);
}

#[test]
fn module_roundtrip_executes_identically() {
    // Serialize a module, reload it, and make sure the reloaded program
    // produces the same global state.
    let lookup = GlobalsLookup::new();
    let mut module = Module::new("scripts");
    module.start_compiling(&lookup);
    let variable_id = module
        .add_global_variable(FlyweightString::new("out"), PredefinedDataTypes::u32())
        .info
        .id;
    let function = module.add_script_function(
        FlyweightString::new("main"),
        PredefinedDataTypes::void(),
        Vec::new(),
        Vec::new(),
    );
    function.opcodes = vec![
        Opcode::simple(OpcodeType::PushConstant, 40, 1),
        Opcode::simple(OpcodeType::PushConstant, 2, 1),
        Opcode::new(OpcodeType::ArithmAdd, BaseType::Uint32, 0, 1),
        Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint32, variable_id as i64, 1),
        Opcode::simple(OpcodeType::MoveStack, -1, 1),
        Opcode::simple(OpcodeType::Return, 0, 2),
    ];
    let function_id = function.info.id;
    let dependency_hash = module.build_dependency_hash();

    let data =
        lemon_runtime::serialize_module(&module, &lookup, dependency_hash, 1).unwrap();

    let run = |module: Module| -> u32 {
        let mut setup = link(module);
        setup.runtime.call_function(function_id).unwrap();
        let mut connector = RecordingConnector::default();
        setup.runtime.execute_steps(&mut connector, 100, 0);
        setup.runtime.global_variable_value(variable_id).get::<u32>()
    };

    let direct = run(module);

    let mut reloaded = Module::new("scripts");
    lemon_runtime::deserialize_module(&mut reloaded, &lookup, &data, dependency_hash, 1)
        .unwrap();
    let from_disk = run(reloaded);

    assert_eq!(direct, 42);
    assert_eq!(direct, from_disk);
}

#[test]
fn nativized_path_matches_plain_path() {
    // The same bytecode run with and without a nativized specialization
    // must produce identical observable state.
    fn build_module() -> (Module, u32, u32) {
        let lookup = GlobalsLookup::new();
        let mut module = Module::new("scripts");
        module.start_compiling(&lookup);
        let variable_id = module
            .add_global_variable(FlyweightString::new("sum"), PredefinedDataTypes::u32())
            .info
            .id;
        let function = module.add_script_function(
            FlyweightString::new("main"),
            PredefinedDataTypes::void(),
            Vec::new(),
            Vec::new(),
        );
        function.opcodes = vec![
            Opcode::simple(OpcodeType::PushConstant, 30, 1),
            Opcode::simple(OpcodeType::PushConstant, 12, 1),
            Opcode::new(OpcodeType::ArithmAdd, BaseType::Uint32, 0, 1),
            Opcode::new(OpcodeType::SetVariableValue, BaseType::Uint32, variable_id as i64, 1),
            Opcode::simple(OpcodeType::MoveStack, -1, 1),
            Opcode::simple(OpcodeType::Return, 0, 2),
        ];
        let function_id = function.info.id;
        (module, function_id, variable_id)
    }

    fn exec_push_constants_added(
        context: &mut lemon_runtime::ExecContext<'_>,
        op: &lemon_runtime::RuntimeOpcode,
    ) {
        context
            .flow
            .push(op.param_u64(0).wrapping_add(op.param_u64(8)));
    }

    let run = |with_provider: bool| -> (u32, usize) {
        let (module, function_id, variable_id) = build_module();
        let mut program = Program::new();
        if with_provider {
            let pattern = vec![
                Opcode::simple(OpcodeType::PushConstant, 0, 0),
                Opcode::simple(OpcodeType::PushConstant, 0, 0),
                Opcode::new(OpcodeType::ArithmAdd, BaseType::Uint32, 0, 0),
            ];
            let provider = lemon_runtime::NativizedOpcodeProvider::new(|dictionary| {
                dictionary.add_entry(
                    &pattern,
                    exec_push_constants_added,
                    vec![
                        lemon_runtime::NativizedParameter {
                            source_opcode: 0,
                            dest_offset: 0,
                        },
                        lemon_runtime::NativizedParameter {
                            source_opcode: 1,
                            dest_offset: 8,
                        },
                    ],
                );
            });
            program.set_nativized_provider(Box::new(provider));
        }
        program.add_module(module);
        let mut runtime = Runtime::new();
        runtime.set_program(Arc::new(program));
        runtime.call_function(function_id).unwrap();
        let index = runtime.runtime_function_index(function_id).unwrap();
        let buffer_len = runtime.runtime_function(index).unwrap().buffer.len();
        let mut connector = RecordingConnector::default();
        let result = runtime.execute_steps(&mut connector, 100, 0);
        assert_eq!(result.result, ExecutionResult::Okay);
        assert_eq!(runtime.selected_control_flow().value_stack_size(), 0);
        (runtime.global_variable_value(variable_id).get::<u32>(), buffer_len)
    };

    let (plain_value, plain_len) = run(false);
    let (nativized_value, nativized_len) = run(true);
    assert_eq!(plain_value, 42);
    assert_eq!(plain_value, nativized_value);
    // The nativized run collapsed the push/push/add prefix.
    assert!(nativized_len < plain_len);
}

#[test]
fn vm_arithmetic_matches_compile_time_folding_rules() {
    // Division and modulo by zero yield zero at runtime, matching the
    // constant folder; other operators agree with plain i64 semantics.
    let cases: Vec<(OpcodeType, i64, i64, i64)> = vec![
        (OpcodeType::ArithmAdd, 2, 3, 5),
        (OpcodeType::ArithmSub, 2, 5, -3),
        (OpcodeType::ArithmMul, -4, 6, -24),
        (OpcodeType::ArithmDiv, 42, 5, 8),
        (OpcodeType::ArithmDiv, 42, 0, 0),
        (OpcodeType::ArithmMod, 42, 5, 2),
        (OpcodeType::ArithmMod, 42, 0, 0),
        (OpcodeType::ArithmAnd, 0b1100, 0b1010, 0b1000),
        (OpcodeType::ArithmOr, 0b1100, 0b1010, 0b1110),
        (OpcodeType::ArithmXor, 0b1100, 0b1010, 0b0110),
        (OpcodeType::ArithmShl, 1, 4, 16),
        (OpcodeType::ArithmShr, -16, 2, -4),
    ];
    for (op, a, b, expected) in cases {
        let lookup = GlobalsLookup::new();
        let mut module = Module::new("scripts");
        module.start_compiling(&lookup);
        let variable_id = module
            .add_global_variable(FlyweightString::new("out"), PredefinedDataTypes::i64())
            .info
            .id;
        let function = module.add_script_function(
            FlyweightString::new("calc"),
            PredefinedDataTypes::void(),
            Vec::new(),
            Vec::new(),
        );
        function.opcodes = vec![
            Opcode::simple(OpcodeType::PushConstant, a, 1),
            Opcode::simple(OpcodeType::PushConstant, b, 1),
            Opcode::new(op, BaseType::Int64, 0, 1),
            Opcode::new(OpcodeType::SetVariableValue, BaseType::Int64, variable_id as i64, 1),
            Opcode::simple(OpcodeType::MoveStack, -1, 1),
            Opcode::simple(OpcodeType::Return, 0, 2),
        ];
        let function_id = function.info.id;

        let mut setup = link(module);
        setup.runtime.call_function(function_id).unwrap();
        let mut connector = RecordingConnector::default();
        setup.runtime.execute_steps(&mut connector, 100, 0);
        assert_eq!(
            setup.runtime.global_variable_value(variable_id).get::<i64>(),
            expected,
            "operator {:?} over ({}, {})",
            op,
            a,
            b
        );
    }
}
