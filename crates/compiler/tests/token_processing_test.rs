//! End-to-end tests of the token processing pipeline, driving it with
//! hand-built token lists the way the parser would.

use lemon_compiler::{CompilationContext, CompileOptions, TokenProcessing, WarningCode};
use lemon_core::{
    AnyBaseValue, ConstantArrayInfo, ConstantInfo, DataTypeRef, FlyweightString, FunctionFlags,
    FunctionParameter, GlobalsLookup, Keyword, Operator, PredefinedDataTypes, StatementNode,
    StatementToken, Token, TokenList, VariableInfo, VariableKind,
};
use lemon_runtime::{
    add_definitions_from_module, builtins, wrap, Module, NativeRegistry, CALLABLE_ADDRESS_BASE,
};

fn identifier(name: &str) -> Token {
    Token::Statement(StatementToken::new(StatementNode::Identifier {
        name: FlyweightString::new(name),
        resolved: None,
    }))
}

fn int_constant(value: i64) -> Token {
    Token::Statement(StatementToken::typed(
        StatementNode::Constant {
            value: AnyBaseValue::from(value),
        },
        PredefinedDataTypes::const_int(),
    ))
}

fn op(operator: Operator) -> Token {
    Token::Operator(operator)
}

fn tokens(list: Vec<Token>) -> TokenList {
    TokenList::from_tokens(list)
}

/// A module with builtins, a few definitions and one function to compile
/// into, plus everything the processor needs around it.
struct Fixture {
    lookup: GlobalsLookup,
    module: Module,
    natives: NativeRegistry,
    options: CompileOptions,
    function_index: usize,
}

impl Fixture {
    fn new() -> Self {
        let mut lookup = GlobalsLookup::new();
        let mut module = Module::new("test");
        module.start_compiling(&lookup);
        builtins::register_builtin_functions(&mut module);

        module.add_global_variable(
            FlyweightString::new("ringCount"),
            PredefinedDataTypes::u16(),
        );
        module.add_constant(
            FlyweightString::new("MAX_RINGS"),
            PredefinedDataTypes::u16(),
            AnyBaseValue::from(999u64),
        );
        module.add_constant_array(
            FlyweightString::new("levelHeights"),
            PredefinedDataTypes::u16(),
            vec![
                AnyBaseValue::from(0x100u64),
                AnyBaseValue::from(0x200u64),
                AnyBaseValue::from(0x300u64),
            ],
            true,
        );
        // define SPEED_CAP = 0x0c00
        module.add_define(
            FlyweightString::new("SPEED_CAP"),
            PredefinedDataTypes::u16(),
            tokens(vec![int_constant(0x0c00)]),
        );
        // A native usable for compile-time evaluation.
        module.add_native_function(
            "doubled",
            wrap(|value: u32| -> u32 { value * 2 }),
            FunctionFlags::COMPILE_TIME_CONSTANT,
        );
        // An overload pair for overload-selection tests.
        module.add_native_function(
            "clamp16",
            wrap(|value: u16| -> u16 { value }),
            FunctionFlags::empty(),
        );
        module.add_native_function(
            "clamp16",
            wrap(|value: u16, limit: u16| -> u16 { value.min(limit) }),
            FunctionFlags::empty(),
        );

        let function = module.add_script_function(
            FlyweightString::new("update"),
            PredefinedDataTypes::void(),
            Vec::<FunctionParameter>::new(),
            Vec::new(),
        );
        function.info.address_hooks.push(0x2f80);
        let function_index = module.script_functions().len() - 1;

        let mut natives = NativeRegistry::new();
        natives.register_module(&module);
        add_definitions_from_module(&mut lookup, &module);

        Fixture {
            lookup,
            module,
            natives,
            options: CompileOptions::default(),
            function_index,
        }
    }

    fn process(&mut self, list: &mut TokenList) -> Result<(), lemon_compiler::CompilerError> {
        self.process_with_result_type(list, None)
    }

    fn process_with_result_type(
        &mut self,
        list: &mut TokenList,
        result_type: Option<&DataTypeRef>,
    ) -> Result<(), lemon_compiler::CompilerError> {
        let mut local_variables = Vec::new();
        let mut local_constants = Vec::new();
        let mut local_constant_arrays = Vec::new();
        let mut context = CompilationContext {
            function_index: self.function_index,
            local_variables: &mut local_variables,
            local_constants: &mut local_constants,
            local_constant_arrays: &mut local_constant_arrays,
        };
        let mut processing =
            TokenProcessing::new(&self.lookup, &mut self.module, &self.options, &self.natives);
        processing.process_tokens(&mut context, list, 1, result_type)
    }
}

fn single_statement(list: &TokenList) -> &StatementToken {
    assert_eq!(list.len(), 1, "expected a single statement, got {:?}", list);
    list[0].as_statement().expect("expected a statement token")
}

#[test]
fn addition_folds_to_constant() {
    // 2 + 3 * 4 folds completely at compile time.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        int_constant(2),
        op(Operator::BinaryPlus),
        int_constant(3),
        op(Operator::BinaryMultiply),
        int_constant(4),
    ]);
    fixture.process(&mut list).unwrap();

    let statement = single_statement(&list);
    match &statement.node {
        StatementNode::Constant { value } => assert_eq!(value.get::<i64>(), 14),
        other => panic!("expected folded constant, got {:?}", other),
    }
}

#[test]
fn division_by_zero_folds_to_zero() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        int_constant(7),
        op(Operator::BinaryDivide),
        int_constant(0),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<i64>(), 0),
        other => panic!("expected folded constant, got {:?}", other),
    }
}

#[test]
fn precedence_builds_correct_tree() {
    // ringCount + 3 < MAX_RINGS: the comparison must be the root.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        identifier("ringCount"),
        op(Operator::BinaryPlus),
        int_constant(3),
        op(Operator::CompareLess),
        identifier("MAX_RINGS"),
    ]);
    fixture.process(&mut list).unwrap();

    let statement = single_statement(&list);
    match &statement.node {
        StatementNode::BinaryOperation { op, left, .. } => {
            assert_eq!(*op, Operator::CompareLess);
            assert!(matches!(
                left.node,
                StatementNode::BinaryOperation {
                    op: Operator::BinaryPlus,
                    ..
                }
            ));
        }
        other => panic!("expected comparison at the root, got {:?}", other),
    }
    assert_eq!(
        statement.data_type.as_ref().unwrap().name().as_str(),
        "bool"
    );
}

#[test]
fn parenthesis_mismatch_is_an_error() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        op(Operator::ParenthesisLeft),
        int_constant(1),
        op(Operator::BracketRight),
    ]);
    let error = fixture.process(&mut list).unwrap_err();
    assert!(error.message.contains("parenthesis not matching"));
    assert_eq!(error.line_number, 1);

    let mut list = tokens(vec![op(Operator::ParenthesisLeft), int_constant(1)]);
    let error = fixture.process(&mut list).unwrap_err();
    assert!(error.message.contains("too many open"));
}

#[test]
fn define_expands_and_resolves() {
    // SPEED_CAP + 1 → 0x0c01 after expansion and folding.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        identifier("SPEED_CAP"),
        op(Operator::BinaryPlus),
        int_constant(1),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<i64>(), 0x0c01),
        other => panic!("expected folded constant, got {:?}", other),
    }
}

#[test]
fn variable_definition_allocates_local() {
    // u16 speed = 100
    let mut fixture = Fixture::new();
    let mut local_variables = Vec::new();
    let mut local_constants = Vec::new();
    let mut local_constant_arrays = Vec::new();
    let mut list = tokens(vec![
        Token::VarType(PredefinedDataTypes::u16()),
        identifier("speed"),
        op(Operator::Assign),
        int_constant(100),
    ]);
    {
        let mut context = CompilationContext {
            function_index: fixture.function_index,
            local_variables: &mut local_variables,
            local_constants: &mut local_constants,
            local_constant_arrays: &mut local_constant_arrays,
        };
        let mut processing = TokenProcessing::new(
            &fixture.lookup,
            &mut fixture.module,
            &fixture.options,
            &fixture.natives,
        );
        processing
            .process_tokens(&mut context, &mut list, 5, None)
            .unwrap();
    }

    assert_eq!(local_variables.len(), 1);
    assert_eq!(local_variables[0].name.as_str(), "speed");
    assert_eq!(local_variables[0].kind(), VariableKind::Local);
    let function = &fixture.module.script_functions()[fixture.function_index];
    assert_eq!(function.local_variables.len(), 1);
    assert_eq!(function.local_variables[0].declared_line, 5);

    // The result is an assignment with the variable on the left.
    match &single_statement(&list).node {
        StatementNode::BinaryOperation { op, left, .. } => {
            assert_eq!(*op, Operator::Assign);
            assert!(matches!(left.node, StatementNode::Variable { .. }));
        }
        other => panic!("expected assignment, got {:?}", other),
    }
}

#[test]
fn duplicate_variable_in_scope_is_an_error() {
    let mut fixture = Fixture::new();
    let mut local_variables = vec![VariableInfo {
        id: lemon_core::make_variable_id(VariableKind::Local, 0),
        name: FlyweightString::new("speed"),
        data_type: PredefinedDataTypes::u16(),
    }];
    let mut local_constants = Vec::new();
    let mut local_constant_arrays = Vec::new();
    let mut list = tokens(vec![
        Token::VarType(PredefinedDataTypes::u16()),
        identifier("speed"),
    ]);
    let mut context = CompilationContext {
        function_index: fixture.function_index,
        local_variables: &mut local_variables,
        local_constants: &mut local_constants,
        local_constant_arrays: &mut local_constant_arrays,
    };
    let mut processing = TokenProcessing::new(
        &fixture.lookup,
        &mut fixture.module,
        &fixture.options,
        &fixture.natives,
    );
    let error = processing
        .process_tokens(&mut context, &mut list, 9, None)
        .unwrap_err();
    assert!(error.message.contains("already used"));
}

#[test]
fn function_call_selects_overload() {
    // clamp16(5, 10) picks the two-parameter overload.
    let mut fixture = Fixture::new();
    let mut arguments = TokenList::new();
    arguments.push(int_constant(5));
    arguments.push(op(Operator::CommaSeparator));
    arguments.push(int_constant(10));

    let mut list = tokens(vec![
        identifier("clamp16"),
        op(Operator::ParenthesisLeft),
    ]);
    for token in arguments.iter() {
        list.push(token.clone());
    }
    list.push(op(Operator::ParenthesisRight));

    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::FunctionCall {
            function,
            parameters,
            ..
        } => {
            let function = function.as_ref().expect("function resolved");
            assert_eq!(function.parameters.len(), 2);
            assert_eq!(parameters.len(), 2);
        }
        other => panic!("expected function call, got {:?}", other),
    }
}

#[test]
fn unknown_function_is_an_error() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        identifier("fireLaser"),
        op(Operator::ParenthesisLeft),
        op(Operator::ParenthesisRight),
    ]);
    let error = fixture.process(&mut list).unwrap_err();
    assert!(error.message.contains("unknown function name 'fireLaser'"));
}

#[test]
fn compile_time_constant_native_evaluates() {
    // doubled(21) is flagged COMPILE_TIME_CONSTANT and folds to 42.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        identifier("doubled"),
        op(Operator::ParenthesisLeft),
        int_constant(21),
        op(Operator::ParenthesisRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<i64>(), 42),
        other => panic!("expected folded constant, got {:?}", other),
    }
}

#[test]
fn memory_access_requires_plain_integer_type() {
    // u16[0xffff0000] works; string[...] must not.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        Token::VarType(PredefinedDataTypes::u16()),
        op(Operator::BracketLeft),
        int_constant(0xffff0000),
        op(Operator::BracketRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::MemoryAccess { .. } => {}
        other => panic!("expected memory access, got {:?}", other),
    }
    assert_eq!(
        single_statement(&list).data_type.as_ref().unwrap().name().as_str(),
        "u16"
    );

    let mut list = tokens(vec![
        Token::VarType(PredefinedDataTypes::string()),
        op(Operator::BracketLeft),
        int_constant(0),
        op(Operator::BracketRight),
    ]);
    let error = fixture.process(&mut list).unwrap_err();
    assert!(error.message.contains("basic integer types"));
}

#[test]
fn constant_array_access_binds_builtin_reader() {
    // levelHeights[2] becomes a call to the u16 array reader.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        identifier("levelHeights"),
        op(Operator::BracketLeft),
        int_constant(2),
        op(Operator::BracketRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::FunctionCall {
            function,
            parameters,
            ..
        } => {
            let function = function.as_ref().expect("builtin bound");
            assert_eq!(function.name.as_str(), builtins::CONSTANT_ARRAY_ACCESS);
            assert_eq!(function.return_type.name().as_str(), "u16");
            assert_eq!(parameters.len(), 2);
            // First parameter is the array ID constant.
            assert!(matches!(
                parameters[0].node,
                StatementNode::Constant { .. }
            ));
        }
        other => panic!("expected builtin call, got {:?}", other),
    }
}

#[test]
fn constant_array_length_folds() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        identifier("levelHeights.length"),
        op(Operator::ParenthesisLeft),
        op(Operator::ParenthesisRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<u64>(), 3),
        other => panic!("expected length constant, got {:?}", other),
    }
}

#[test]
fn explicit_cast_is_recognized() {
    // u8(ringCount)
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        Token::VarType(PredefinedDataTypes::u8()),
        op(Operator::ParenthesisLeft),
        identifier("ringCount"),
        op(Operator::ParenthesisRight),
    ]);
    fixture.process(&mut list).unwrap();
    let statement = single_statement(&list);
    assert!(matches!(statement.node, StatementNode::ValueCast { .. }));
    assert_eq!(statement.data_type.as_ref().unwrap().name().as_str(), "u8");
}

#[test]
fn impossible_explicit_cast_is_an_error() {
    let mut fixture = Fixture::new();
    // A string literal constant forced into an integer cast.
    let mut list = tokens(vec![
        Token::VarType(PredefinedDataTypes::u8()),
        op(Operator::ParenthesisLeft),
        Token::Statement(StatementToken::typed(
            StatementNode::Constant {
                value: AnyBaseValue::from(0x1234u64),
            },
            PredefinedDataTypes::string(),
        )),
        op(Operator::ParenthesisRight),
    ]);
    let error = fixture.process(&mut list).unwrap_err();
    assert!(error.message.contains("explicit cast not possible"));
}

#[test]
fn unary_minus_binds_tighter_than_binary() {
    // -5 + 3 folds to -2; the minus is unary because nothing precedes it.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        op(Operator::BinaryMinus),
        int_constant(5),
        op(Operator::BinaryPlus),
        int_constant(3),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<i64>(), -2),
        other => panic!("expected folded constant, got {:?}", other),
    }
}

#[test]
fn assignment_inserts_cast_on_right() {
    // ringCount = bigValue where the right side is u32: a cast to u16
    // must appear on the right-hand side.
    let mut fixture = Fixture::new();
    fixture.module.add_global_variable(
        FlyweightString::new("bigValue"),
        PredefinedDataTypes::u32(),
    );
    // Re-register so the lookup sees the new global.
    let module = &fixture.module;
    let mut lookup = GlobalsLookup::new();
    add_definitions_from_module(&mut lookup, module);
    fixture.lookup = lookup;

    let mut list = tokens(vec![
        identifier("ringCount"),
        op(Operator::Assign),
        identifier("bigValue"),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::BinaryOperation { op, right, .. } => {
            assert_eq!(*op, Operator::Assign);
            assert!(
                matches!(right.node, StatementNode::ValueCast { .. }),
                "expected implicit cast on the right side, got {:?}",
                right.node
            );
            assert_eq!(right.data_type.as_ref().unwrap().name().as_str(), "u16");
        }
        other => panic!("expected assignment, got {:?}", other),
    }
}

#[test]
fn string_concatenation_binds_builtin() {
    // "ab" + "cd" selects the bound string-plus native.
    let mut fixture = Fixture::new();
    let string_constant = |text: &str| {
        Token::Statement(StatementToken::typed(
            StatementNode::Constant {
                value: AnyBaseValue::from(lemon_core::murmur2_64(text.as_bytes())),
            },
            PredefinedDataTypes::string(),
        ))
    };
    let mut list = tokens(vec![
        string_constant("ab"),
        op(Operator::BinaryPlus),
        string_constant("cd"),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::BinaryOperation { function, .. } => {
            let function = function.as_ref().expect("builtin bound");
            assert_eq!(function.name.as_str(), builtins::STRING_OPERATOR_PLUS);
        }
        other => panic!("expected binary operation, got {:?}", other),
    }
    assert_eq!(
        single_statement(&list).data_type.as_ref().unwrap().name().as_str(),
        "string"
    );
}

#[test]
fn string_operators_gated_by_feature_level() {
    let mut fixture = Fixture::new();
    fixture.options.script_feature_level = 1;
    let string_constant = |text: &str| {
        Token::Statement(StatementToken::typed(
            StatementNode::Constant {
                value: AnyBaseValue::from(lemon_core::murmur2_64(text.as_bytes())),
            },
            PredefinedDataTypes::string(),
        ))
    };
    let mut list = tokens(vec![
        string_constant("ab"),
        op(Operator::BinaryPlus),
        string_constant("cd"),
    ]);
    let error = fixture.process(&mut list).unwrap_err();
    assert!(error.message.contains("cannot apply binary operator +"));
}

#[test]
fn compound_assignment_splits_for_string_append() {
    // text += "suffix" becomes text = text + "suffix" with the bound
    // string-plus function on the inner operation.
    let mut fixture = Fixture::new();
    fixture.module.add_global_variable(
        FlyweightString::new("text"),
        PredefinedDataTypes::string(),
    );
    let mut lookup = GlobalsLookup::new();
    add_definitions_from_module(&mut lookup, &fixture.module);
    fixture.lookup = lookup;

    let mut list = tokens(vec![
        identifier("text"),
        op(Operator::AssignPlus),
        Token::Statement(StatementToken::typed(
            StatementNode::Constant {
                value: AnyBaseValue::from(lemon_core::murmur2_64(b"!")),
            },
            PredefinedDataTypes::string(),
        )),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::BinaryOperation { op, right, .. } => {
            assert_eq!(*op, Operator::Assign);
            match &right.node {
                StatementNode::BinaryOperation {
                    op: inner_op,
                    function,
                    ..
                } => {
                    assert_eq!(*inner_op, Operator::BinaryPlus);
                    assert!(function.is_some());
                }
                other => panic!("expected split inner operation, got {:?}", other),
            }
        }
        other => panic!("expected assignment, got {:?}", other),
    }
}

#[test]
fn make_callable_registers_address() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        Token::Keyword(Keyword::MakeCallable),
        op(Operator::ParenthesisLeft),
        identifier("update"),
        op(Operator::ParenthesisRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => {
            assert_eq!(value.get::<u32>(), CALLABLE_ADDRESS_BASE);
        }
        other => panic!("expected callable address constant, got {:?}", other),
    }
    // The module now knows the callable registration.
    assert!(fixture
        .module
        .callable_function_by_address(CALLABLE_ADDRESS_BASE)
        .is_some());
}

#[test]
fn addressof_function_resolves_hook() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        Token::Keyword(Keyword::Addressof),
        op(Operator::ParenthesisLeft),
        identifier("update"),
        op(Operator::ParenthesisRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<u32>(), 0x2f80),
        other => panic!("expected address constant, got {:?}", other),
    }
}

#[test]
fn addressof_memory_access_yields_address_expression() {
    // addressof(u16[0xfff0]) reduces to the address statement.
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![
        Token::Keyword(Keyword::Addressof),
        op(Operator::ParenthesisLeft),
        Token::VarType(PredefinedDataTypes::u16()),
        op(Operator::BracketLeft),
        int_constant(0xfff0),
        op(Operator::BracketRight),
        op(Operator::ParenthesisRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<i64>(), 0xfff0),
        other => panic!("expected the address expression, got {:?}", other),
    }
}

#[test]
fn deprecated_function_produces_warning() {
    let mut fixture = Fixture::new();
    fixture.module.add_native_function(
        "oldTrick",
        wrap(|| {}),
        FunctionFlags::DEPRECATED,
    );
    let mut lookup = GlobalsLookup::new();
    add_definitions_from_module(&mut lookup, &fixture.module);
    fixture.lookup = lookup;

    let mut local_variables = Vec::new();
    let mut local_constants = Vec::new();
    let mut local_constant_arrays = Vec::new();
    let mut context = CompilationContext {
        function_index: fixture.function_index,
        local_variables: &mut local_variables,
        local_constants: &mut local_constants,
        local_constant_arrays: &mut local_constant_arrays,
    };
    let mut processing = TokenProcessing::new(
        &fixture.lookup,
        &mut fixture.module,
        &fixture.options,
        &fixture.natives,
    );
    let mut list = tokens(vec![
        identifier("oldTrick"),
        op(Operator::ParenthesisLeft),
        op(Operator::ParenthesisRight),
    ]);
    processing
        .process_tokens(&mut context, &mut list, 77, None)
        .unwrap();
    let warnings = processing.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].code, WarningCode::DeprecatedFunction);
    assert_eq!(warnings[0].line_number, 77);
}

#[test]
fn local_constants_substitute() {
    let mut fixture = Fixture::new();
    let mut local_variables = Vec::new();
    let mut local_constants = vec![ConstantInfo {
        name: FlyweightString::new("localCap"),
        data_type: PredefinedDataTypes::u8(),
        value: AnyBaseValue::from(12u64),
    }];
    let mut local_constant_arrays = Vec::<ConstantArrayInfo>::new();
    let mut context = CompilationContext {
        function_index: fixture.function_index,
        local_variables: &mut local_variables,
        local_constants: &mut local_constants,
        local_constant_arrays: &mut local_constant_arrays,
    };
    let mut processing = TokenProcessing::new(
        &fixture.lookup,
        &mut fixture.module,
        &fixture.options,
        &fixture.natives,
    );
    let mut list = tokens(vec![
        identifier("localCap"),
        op(Operator::BinaryPlus),
        int_constant(1),
    ]);
    processing
        .process_tokens(&mut context, &mut list, 1, None)
        .unwrap();
    match &single_statement(&list).node {
        StatementNode::Constant { value } => assert_eq!(value.get::<i64>(), 13),
        other => panic!("expected folded constant, got {:?}", other),
    }
}

#[test]
fn preprocessor_subset_builds_expression_tree() {
    let mut fixture = Fixture::new();
    let mut processing = TokenProcessing::new(
        &fixture.lookup,
        &mut fixture.module,
        &fixture.options,
        &fixture.natives,
    );
    // (1 + 2) * 3: only parentheses, unary and binary ops are applied.
    let mut list = tokens(vec![
        op(Operator::ParenthesisLeft),
        int_constant(1),
        op(Operator::BinaryPlus),
        int_constant(2),
        op(Operator::ParenthesisRight),
        op(Operator::BinaryMultiply),
        int_constant(3),
    ]);
    processing.process_for_preprocessor(&mut list, 1).unwrap();
    match &single_statement(&list).node {
        StatementNode::BinaryOperation { op, left, .. } => {
            assert_eq!(*op, Operator::BinaryMultiply);
            assert!(matches!(left.node, StatementNode::Parenthesis { .. }));
        }
        other => panic!("expected multiplication at the root, got {:?}", other),
    }
}

#[test]
fn unresolved_identifier_is_an_error() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![identifier("ghostVariable")]);
    let error = fixture.process(&mut list).unwrap_err();
    assert!(error
        .message
        .contains("unable to resolve identifier: ghostVariable"));
}

#[test]
fn constants_adopt_expected_result_type() {
    let mut fixture = Fixture::new();
    let mut list = tokens(vec![int_constant(42)]);
    let expected = PredefinedDataTypes::u8();
    fixture
        .process_with_result_type(&mut list, Some(&expected))
        .unwrap();
    assert_eq!(
        single_statement(&list).data_type.as_ref().unwrap().name().as_str(),
        "u8"
    );

    // Without an expected type, integers stay const_int.
    let mut list = tokens(vec![int_constant(42)]);
    fixture.process(&mut list).unwrap();
    assert_eq!(
        single_statement(&list).data_type.as_ref().unwrap().name().as_str(),
        "const_int"
    );
}

#[test]
fn method_call_resolves_through_data_type_context() {
    // title.length() finds the native method registered for the string
    // type and passes the variable as the implicit first parameter.
    let mut fixture = Fixture::new();
    fixture.module.add_global_variable(
        FlyweightString::new("title"),
        PredefinedDataTypes::string(),
    );
    let mut lookup = GlobalsLookup::new();
    add_definitions_from_module(&mut lookup, &fixture.module);
    fixture.lookup = lookup;

    let mut list = tokens(vec![
        identifier("title.length"),
        op(Operator::ParenthesisLeft),
        op(Operator::ParenthesisRight),
    ]);
    fixture.process(&mut list).unwrap();
    match &single_statement(&list).node {
        StatementNode::FunctionCall {
            function,
            parameters,
            ..
        } => {
            let function = function.as_ref().expect("method resolved");
            assert_eq!(function.name.as_str(), "length");
            assert!(function.context.is_some());
            // The variable itself arrives as the implicit first parameter.
            assert_eq!(parameters.len(), 1);
            assert!(matches!(
                parameters[0].node,
                StatementNode::Variable { .. }
            ));
        }
        other => panic!("expected method call, got {:?}", other),
    }
}
