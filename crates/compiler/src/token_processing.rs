//! Token processing: the expression middle end
//!
//! Takes the flat token list the parser produced for one line or
//! expression and reshapes it, in place, into a typed tree: identifiers
//! are resolved, defines expanded, parentheses and commas build the
//! hierarchy, then the statement forms are recognized (variable
//! definitions, calls, memory and array accesses, casts), operators are
//! bound by precedence, constants folded, and finally every statement gets
//! its data type with implicit casts inserted where signatures demand
//! them.
//!
//! The processor mutates the surrounding compilation context: newly
//! defined local variables are appended to the active scope, and
//! `makeCallable` registrations land in the module.

use std::collections::HashMap;

use lemon_core::{
    AnyBaseValue, ConstantArrayInfo, ConstantInfo, DataTypeClass, DataTypeRef, FlyweightString,
    FunctionFlags, FunctionKind, FunctionRef, GlobalsLookup, Identifier, IntegerSemantics,
    Keyword, Operator, OperatorClass, OperatorHelper, ParenthesisType, PredefinedDataTypes,
    StatementNode, StatementToken, Token, TokenList, VariableInfo,
};
use lemon_runtime::{builtins, Module, NativeRegistry, Runtime};

use crate::error::{CompilerError, CompilerWarning, WarningCode};
use crate::options::CompileOptions;
use crate::type_casting::{
    BinaryOperatorSignature, CastHandling, TypeCasting, INVALID_PRIORITY, INVALID_SIGNATURE,
};

/// Maximum rounds of define expansion before giving up on a cycle.
const MAX_DEFINE_EXPANSION_ROUNDS: usize = 10;

/// The scope the processor works inside, set up by the driver per
/// function body. The current function is addressed by its index in the
/// module's script-function storage (the processor owns the module borrow);
/// variable definitions append to the scope vectors.
pub struct CompilationContext<'a> {
    pub function_index: usize,
    pub local_variables: &'a mut Vec<VariableInfo>,
    pub local_constants: &'a mut Vec<ConstantInfo>,
    pub local_constant_arrays: &'a mut Vec<ConstantArrayInfo>,
}

struct BinaryOperationLookup {
    function: Option<FunctionRef>,
    signature: BinaryOperatorSignature,
    split_to_operator: Option<Operator>,
}

struct BinaryOperationResult {
    signature: BinaryOperatorSignature,
    enforced_function: Option<FunctionRef>,
    split_to_operator: Option<Operator>,
}

pub struct TokenProcessing<'a> {
    globals_lookup: &'a GlobalsLookup,
    module: &'a mut Module,
    options: &'a CompileOptions,
    natives: &'a NativeRegistry,
    line_number: u32,
    warnings: Vec<CompilerWarning>,

    builtin_constant_array_access: Vec<FunctionRef>,
    binary_operation_lookup: HashMap<Operator, Vec<BinaryOperationLookup>>,
}

impl<'a> TokenProcessing<'a> {
    pub fn new(
        globals_lookup: &'a GlobalsLookup,
        module: &'a mut Module,
        options: &'a CompileOptions,
        natives: &'a NativeRegistry,
    ) -> Self {
        let cache = |name: &str| -> Vec<FunctionRef> {
            let references =
                globals_lookup.functions_by_name(FlyweightString::new(name).hash());
            if references.is_empty() {
                tracing::debug!(name, "built-in function not registered");
            }
            references
                .iter()
                .map(|reference| reference.function.clone())
                .collect()
        };
        let single = |name: &str| -> Option<FunctionRef> { cache(name).into_iter().next() };

        let string_type = PredefinedDataTypes::string;
        let i64_type = PredefinedDataTypes::i64;
        let bool_type = PredefinedDataTypes::bool_type;
        let signature = |left: DataTypeRef, right: DataTypeRef, result: DataTypeRef| {
            BinaryOperatorSignature {
                left,
                right,
                result,
            }
        };

        let plus = single(builtins::STRING_OPERATOR_PLUS);
        let plus_int64 = single(builtins::STRING_OPERATOR_PLUS_INT64);
        let plus_int64_inv = single(builtins::STRING_OPERATOR_PLUS_INT64_INV);
        let less = single(builtins::STRING_OPERATOR_LESS);
        let less_or_equal = single(builtins::STRING_OPERATOR_LESS_OR_EQUAL);
        let greater = single(builtins::STRING_OPERATOR_GREATER);
        let greater_or_equal = single(builtins::STRING_OPERATOR_GREATER_OR_EQUAL);

        let mut lookup: HashMap<Operator, Vec<BinaryOperationLookup>> = HashMap::new();
        let mut add = |op: Operator,
                       function: &Option<FunctionRef>,
                       sig: BinaryOperatorSignature,
                       split: Option<Operator>| {
            if let Some(function) = function {
                lookup.entry(op).or_default().push(BinaryOperationLookup {
                    function: Some(function.clone()),
                    signature: sig,
                    split_to_operator: split,
                });
            }
        };

        add(
            Operator::BinaryPlus,
            &plus,
            signature(string_type(), string_type(), string_type()),
            None,
        );
        add(
            Operator::BinaryPlus,
            &plus_int64,
            signature(string_type(), i64_type(), string_type()),
            None,
        );
        add(
            Operator::BinaryPlus,
            &plus_int64_inv,
            signature(i64_type(), string_type(), string_type()),
            None,
        );
        add(
            Operator::AssignPlus,
            &plus,
            signature(string_type(), string_type(), string_type()),
            Some(Operator::BinaryPlus),
        );
        add(
            Operator::AssignPlus,
            &plus_int64,
            signature(string_type(), i64_type(), string_type()),
            Some(Operator::BinaryPlus),
        );
        add(
            Operator::CompareLess,
            &less,
            signature(string_type(), string_type(), bool_type()),
            None,
        );
        add(
            Operator::CompareLessOrEqual,
            &less_or_equal,
            signature(string_type(), string_type(), bool_type()),
            None,
        );
        add(
            Operator::CompareGreater,
            &greater,
            signature(string_type(), string_type(), bool_type()),
            None,
        );
        add(
            Operator::CompareGreaterOrEqual,
            &greater_or_equal,
            signature(string_type(), string_type(), bool_type()),
            None,
        );

        TokenProcessing {
            globals_lookup,
            module,
            options,
            natives,
            line_number: 0,
            warnings: Vec::new(),
            builtin_constant_array_access: cache(builtins::CONSTANT_ARRAY_ACCESS),
            binary_operation_lookup: lookup,
        }
    }

    pub fn warnings(&self) -> &[CompilerWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<CompilerWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn error(&self, message: impl Into<String>) -> CompilerError {
        CompilerError::new(message, self.line_number)
    }

    fn casting(&self) -> TypeCasting<'a> {
        TypeCasting::new(self.options)
    }

    /// The full pipeline over one line or expression.
    pub fn process_tokens(
        &mut self,
        context: &mut CompilationContext<'_>,
        tokens: &mut TokenList,
        line_number: u32,
        result_type: Option<&DataTypeRef>,
    ) -> Result<(), CompilerError> {
        self.line_number = line_number;

        self.resolve_identifiers(tokens);
        // Defines first: they can introduce tokens every later step must see.
        self.process_defines(tokens)?;
        self.process_constants(context, tokens);
        self.process_parentheses(tokens)?;
        self.process_comma_separators(tokens)?;
        self.process_token_list_recursive(context, tokens)?;
        self.assign_statement_data_types(tokens, result_type)?;
        Ok(())
    }

    /// Restricted pipeline for `#if`-style preprocessor expressions: only
    /// parentheses, unary and binary operations.
    pub fn process_for_preprocessor(
        &mut self,
        tokens: &mut TokenList,
        line_number: u32,
    ) -> Result<(), CompilerError> {
        self.line_number = line_number;
        self.process_parentheses(tokens)?;
        self.process_token_list_recursive_for_preprocessor(tokens)?;
        Ok(())
    }

    fn process_token_list_recursive_for_preprocessor(
        &mut self,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        for index in 0..tokens.len() {
            let inner = match tokens.get_mut(index) {
                Some(Token::Statement(StatementToken {
                    node: StatementNode::Parenthesis { content, .. },
                    ..
                })) => Some(std::mem::take(content)),
                _ => None,
            };
            if let Some(mut inner) = inner {
                self.process_token_list_recursive_for_preprocessor(&mut inner)?;
                if let Some(Token::Statement(StatementToken {
                    node: StatementNode::Parenthesis { content, .. },
                    ..
                })) = tokens.get_mut(index)
                {
                    *content = inner;
                }
            }
        }
        self.process_unary_operations(tokens)?;
        self.process_binary_operations(tokens)?;
        Ok(())
    }

    // --- identifier resolution ----------------------------------------------

    fn resolve_identifiers(&self, tokens: &mut TokenList) {
        for index in 0..tokens.len() {
            self.try_resolve_identifier(tokens, index);
        }
    }

    fn try_resolve_identifier(&self, tokens: &mut TokenList, index: usize) -> bool {
        let resolved = match tokens.get(index) {
            Some(Token::Statement(StatementToken {
                node:
                    StatementNode::Identifier {
                        name,
                        resolved: None,
                    },
                ..
            })) => match self.globals_lookup.resolve_identifier(name.hash()) {
                Some(identifier) => identifier.clone(),
                None => return false,
            },
            _ => return false,
        };

        // Data-type names become var-type tokens right away.
        if let Identifier::DataType(data_type) = &resolved {
            tokens.replace(index, Token::VarType(data_type.clone()));
            return true;
        }
        if let Some(Token::Statement(StatementToken {
            node: StatementNode::Identifier { resolved: slot, .. },
            ..
        })) = tokens.get_mut(index)
        {
            *slot = Some(resolved);
        }
        true
    }

    // --- defines ------------------------------------------------------------

    fn process_defines(&mut self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        for _ in 0..MAX_DEFINE_EXPANSION_ROUNDS {
            let mut any_expanded = false;
            let mut index = 0;
            while index < tokens.len() {
                let content = match tokens.get(index) {
                    Some(Token::Statement(StatementToken {
                        node:
                            StatementNode::Identifier {
                                resolved: Some(Identifier::Define(define)),
                                ..
                            },
                        ..
                    })) => define.content.clone(),
                    _ => {
                        index += 1;
                        continue;
                    }
                };
                tokens.remove(index);
                for (offset, token) in content.iter().enumerate() {
                    tokens.insert(index + offset, token.clone());
                }
                index += content.len();
                any_expanded = true;
            }
            if !any_expanded {
                return Ok(());
            }
            self.resolve_identifiers(tokens);
        }

        // Anything still resolving to a define after the bounded rounds is
        // a cycle.
        for token in tokens.iter() {
            if let Token::Statement(StatementToken {
                node:
                    StatementNode::Identifier {
                        name,
                        resolved: Some(Identifier::Define(_)),
                    },
                ..
            }) = token
            {
                return Err(self.error(format!(
                    "define '{}' expands recursively beyond {} levels",
                    name, MAX_DEFINE_EXPANSION_ROUNDS
                )));
            }
        }
        Ok(())
    }

    // --- constants ----------------------------------------------------------

    fn process_constants(&self, context: &CompilationContext<'_>, tokens: &mut TokenList) {
        for index in 0..tokens.len() {
            self.process_constant(context, tokens, index);
        }
    }

    fn process_constant(
        &self,
        context: &CompilationContext<'_>,
        tokens: &mut TokenList,
        index: usize,
    ) -> bool {
        self.try_resolve_identifier(tokens, index);
        let constant = match tokens.get(index) {
            Some(Token::Statement(StatementToken {
                node: StatementNode::Identifier { name, resolved },
                ..
            })) => match resolved {
                Some(Identifier::Constant(constant)) => Some(constant.clone()),
                _ => context
                    .local_constants
                    .iter()
                    .find(|local| local.name.hash() == name.hash())
                    .cloned(),
            },
            _ => None,
        };
        match constant {
            Some(constant) => {
                tokens.replace(
                    index,
                    Token::Statement(StatementToken::typed(
                        StatementNode::Constant {
                            value: constant.value,
                        },
                        constant.data_type,
                    )),
                );
                true
            }
            None => false,
        }
    }

    // --- parenthesization ---------------------------------------------------

    fn process_parentheses(&self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        let mut stack: Vec<(ParenthesisType, usize)> = Vec::new();
        let mut index = 0;
        while index < tokens.len() {
            let op = match tokens.get(index) {
                Some(Token::Operator(op)) => *op,
                _ => {
                    index += 1;
                    continue;
                }
            };
            match op {
                Operator::ParenthesisLeft => {
                    stack.push((ParenthesisType::Parenthesis, index));
                    index += 1;
                }
                Operator::BracketLeft => {
                    stack.push((ParenthesisType::Bracket, index));
                    index += 1;
                }
                Operator::ParenthesisRight | Operator::BracketRight => {
                    let closing = if op == Operator::ParenthesisRight {
                        ParenthesisType::Parenthesis
                    } else {
                        ParenthesisType::Bracket
                    };
                    let matches = stack
                        .last()
                        .map(|(open, _)| *open == closing)
                        .unwrap_or(false);
                    if !matches {
                        return Err(
                            self.error("parenthesis not matching (too many closed)")
                        );
                    }
                    let (parenthesis_type, start) = stack.pop().expect("checked above");

                    // Pack everything between the brackets into a new token.
                    let content = tokens.extract_range(start + 1, index - start - 1);
                    tokens.remove(start + 1); // the closing bracket
                    tokens.replace(
                        start,
                        Token::Statement(StatementToken::new(StatementNode::Parenthesis {
                            parenthesis_type,
                            content,
                        })),
                    );
                    index = start + 1;
                }
                _ => index += 1,
            }
        }
        if !stack.is_empty() {
            return Err(self.error("parenthesis not matching (too many open)"));
        }
        Ok(())
    }

    // --- comma grouping -----------------------------------------------------

    fn process_comma_separators(&self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        // Recurse through the whole parenthesis hierarchy first.
        for token in tokens.iter_mut() {
            if let Token::Statement(StatementToken {
                node: StatementNode::Parenthesis { content, .. },
                ..
            }) = token
            {
                let mut inner = std::mem::take(content);
                self.process_comma_separators(&mut inner)?;
                *content = inner;
            }
        }

        let has_commas = tokens
            .iter()
            .any(|token| crate::token_helper::is_operator(token, Operator::CommaSeparator));
        if !has_commas {
            return Ok(());
        }

        let drained = tokens.extract_range(0, tokens.len());
        let mut parts = vec![TokenList::new()];
        for token in drained.iter() {
            if crate::token_helper::is_operator(token, Operator::CommaSeparator) {
                parts.push(TokenList::new());
            } else {
                parts.last_mut().expect("non-empty").push(token.clone());
            }
        }
        tokens.push(Token::Statement(StatementToken::new(
            StatementNode::CommaSeparatedList { content: parts },
        )));
        Ok(())
    }

    // --- the recursive core -------------------------------------------------

    fn process_token_list_recursive(
        &mut self,
        context: &mut CompilationContext<'_>,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        // `addressof`/`makeCallable` over function names must go before the
        // recursion: the bare function name would be a syntax error below.
        self.resolve_addressof_functions(tokens)?;
        self.resolve_make_callable(tokens)?;

        for index in 0..tokens.len() {
            enum Child {
                Parenthesis(TokenList),
                CommaList(Vec<TokenList>),
            }
            let child = match tokens.get_mut(index) {
                Some(Token::Statement(StatementToken {
                    node: StatementNode::Parenthesis { content, .. },
                    ..
                })) => Some(Child::Parenthesis(std::mem::take(content))),
                Some(Token::Statement(StatementToken {
                    node: StatementNode::CommaSeparatedList { content },
                    ..
                })) => Some(Child::CommaList(std::mem::take(content))),
                _ => None,
            };
            match child {
                Some(Child::Parenthesis(mut inner)) => {
                    self.process_token_list_recursive(context, &mut inner)?;
                    if let Some(Token::Statement(StatementToken {
                        node: StatementNode::Parenthesis { content, .. },
                        ..
                    })) = tokens.get_mut(index)
                    {
                        *content = inner;
                    }
                }
                Some(Child::CommaList(mut lists)) => {
                    for list in &mut lists {
                        self.process_token_list_recursive(context, list)?;
                    }
                    if let Some(Token::Statement(StatementToken {
                        node: StatementNode::CommaSeparatedList { content },
                        ..
                    })) = tokens.get_mut(index)
                    {
                        *content = lists;
                    }
                }
                None => {}
            }
        }

        self.process_variable_definitions(context, tokens)?;
        self.process_function_calls(context, tokens)?;
        self.process_memory_accesses(tokens)?;
        self.process_array_accesses(context, tokens)?;
        self.process_explicit_casts(tokens)?;
        self.process_variables(context, tokens)?;

        self.resolve_addressof_memory_accesses(tokens)?;

        self.process_unary_operations(tokens)?;
        self.process_binary_operations(tokens)?;

        self.evaluate_compile_time_constants(tokens)?;
        Ok(())
    }

    // --- variable definitions -----------------------------------------------

    fn process_variable_definitions(
        &mut self,
        context: &mut CompilationContext<'_>,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        let mut index = 0;
        while index < tokens.len() {
            match tokens.get(index) {
                Some(Token::Keyword(Keyword::Function)) => {
                    let next_is_identifier = matches!(
                        tokens.get(index + 1),
                        Some(Token::Statement(StatementToken {
                            node: StatementNode::Identifier { .. },
                            ..
                        }))
                    );
                    if !next_is_identifier {
                        return Err(
                            self.error("function keyword must be followed by an identifier")
                        );
                    }
                }
                Some(Token::VarType(var_type)) => {
                    let var_type = var_type.clone();
                    if index + 1 >= tokens.len() {
                        return Err(self.error("type name must not be the last token"));
                    }
                    let name = match tokens.get(index + 1) {
                        Some(Token::Statement(StatementToken {
                            node: StatementNode::Identifier { name, .. },
                            ..
                        })) => Some(name.clone()),
                        _ => None,
                    };
                    if let Some(name) = name {
                        if var_type.is_void() {
                            return Err(self.error("void variables not allowed"));
                        }
                        if self.find_scope_variable(context, name.hash()).is_some() {
                            return Err(self.error(format!(
                                "variable name '{}' already used",
                                name
                            )));
                        }
                        // The variable may already exist in the function but
                        // out of scope; reuse its slot in that case.
                        let line_number = self.line_number;
                        let function =
                            &mut self.module.script_functions_mut()[context.function_index];
                        let info = match function.local_variable_by_name(name.hash()) {
                            Some(local) => local.info.clone(),
                            None => function.add_local_variable(
                                name,
                                var_type.clone(),
                                line_number,
                            ),
                        };
                        context.local_variables.push(info.clone());

                        tokens.replace(
                            index,
                            Token::Statement(StatementToken::typed(
                                StatementNode::Variable {
                                    variable: info.clone(),
                                },
                                info.data_type,
                            )),
                        );
                        tokens.remove(index + 1);
                    }
                }
                _ => {}
            }
            index += 1;
        }
        Ok(())
    }

    // --- function calls -----------------------------------------------------

    fn process_function_calls(
        &mut self,
        context: &mut CompilationContext<'_>,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        let mut index = 0;
        while index + 1 < tokens.len() {
            let name = match (tokens.get(index), tokens.get(index + 1)) {
                (
                    Some(Token::Statement(StatementToken {
                        node: StatementNode::Identifier { name, .. },
                        ..
                    })),
                    Some(next),
                ) if crate::token_helper::is_parenthesis(next, ParenthesisType::Parenthesis) => {
                    name.clone()
                }
                _ => {
                    index += 1;
                    continue;
                }
            };
            let function_name = name.as_str().to_string();

            let mut is_base_call = false;
            let mut base_function_exists = false;
            let mut this_pointer_variable: Option<VariableInfo> = None;
            let mut candidates: Vec<(FunctionRef, bool)> = self
                .globals_lookup
                .functions_by_name(name.hash())
                .iter()
                .map(|reference| (reference.function.clone(), reference.is_deprecated))
                .collect();

            let content_is_empty =
                crate::token_helper::parenthesis_content(
                    &tokens[index + 1],
                    ParenthesisType::Parenthesis,
                )
                .map(|content| content.is_empty())
                .unwrap_or(true);

            let enclosing = self.module.script_functions()[context.function_index].info.clone();
            if candidates.is_empty() {
                if let Some(base_name) = function_name.strip_prefix("base.") {
                    // It's a base call.
                    if base_name != enclosing.name.as_str() {
                        return Err(self.error(format!(
                            "base call '{}' goes to a different function, expected 'base.{}' instead",
                            function_name, enclosing.name
                        )));
                    }
                    is_base_call = true;
                    let base_hash = lemon_core::murmur2_64(base_name.as_bytes());
                    base_function_exists = self
                        .globals_lookup
                        .functions_by_name(base_hash)
                        .iter()
                        .any(|reference| {
                            reference.function.signature_hash == enclosing.signature_hash
                                && reference.function.id != enclosing.id
                        });
                } else {
                    let mut valid_method_call = false;
                    if let Some(dot) = function_name.rfind('.') {
                        let context_part = &function_name[..dot];
                        let name_part = &function_name[dot + 1..];

                        // A method-like call: the first part must name a
                        // variable in scope.
                        let context_hash = lemon_core::murmur2_64(context_part.as_bytes());
                        if let Some(variable) = self.find_variable(context, context_hash) {
                            let key = variable
                                .data_type
                                .name()
                                .hash()
                                .wrapping_add(lemon_core::murmur2_64(name_part.as_bytes()));
                            let methods = self.globals_lookup.methods_by_name(key);
                            if !methods.is_empty() {
                                candidates = methods
                                    .iter()
                                    .map(|reference| {
                                        (reference.function.clone(), reference.is_deprecated)
                                    })
                                    .collect();
                                this_pointer_variable = Some(variable);
                                valid_method_call = true;
                            }
                        }

                        if !valid_method_call && name_part == "length" && content_is_empty {
                            // `array.length()` on a constant array folds to
                            // a compile-time constant.
                            if let Some(array) = self.find_constant_array(context, context_hash)
                            {
                                tokens.replace(
                                    index,
                                    Token::Statement(StatementToken::typed(
                                        StatementNode::Constant {
                                            value: AnyBaseValue::from(array.size as u64),
                                        },
                                        PredefinedDataTypes::const_int(),
                                    )),
                                );
                                tokens.remove(index + 1);
                                continue;
                            }
                        }
                    }
                    if !valid_method_call {
                        return Err(
                            self.error(format!("unknown function name '{}'", function_name))
                        );
                    }
                }
            }

            // Build the parameter list from the parenthesis content.
            let content = match tokens.remove(index + 1) {
                Token::Statement(StatementToken {
                    node: StatementNode::Parenthesis { content, .. },
                    ..
                }) => content,
                _ => unreachable!("checked to be a parenthesis"),
            };
            let mut parameters: Vec<StatementToken> = Vec::new();
            if let Some(variable) = &this_pointer_variable {
                parameters.push(StatementToken::typed(
                    StatementNode::Variable {
                        variable: variable.clone(),
                    },
                    variable.data_type.clone(),
                ));
            }
            if !content.is_empty() {
                let lists: Vec<TokenList> = match content.get(0) {
                    Some(Token::Statement(StatementToken {
                        node: StatementNode::CommaSeparatedList { content: lists },
                        ..
                    })) if content.len() == 1 => lists.clone(),
                    _ => vec![content],
                };
                for mut list in lists {
                    if list.len() != 1 {
                        return Err(
                            self.error("function parameter content must be one token")
                        );
                    }
                    match list.remove(0) {
                        Token::Statement(statement) => parameters.push(statement),
                        _ => {
                            return Err(
                                self.error("function parameter content must be a statement")
                            )
                        }
                    }
                }
            }

            // Assign parameter types to match signatures against.
            let mut parameter_types = Vec::with_capacity(parameters.len());
            for parameter in &mut parameters {
                let data_type = self
                    .assign_statement_data_type(parameter, None)?
                    .unwrap_or_else(PredefinedDataTypes::void);
                parameter_types.push(data_type);
            }

            let mut chosen: Option<FunctionRef> = None;
            if is_base_call {
                // Base calls must use the enclosing function's signature.
                if parameter_types.len() != enclosing.parameters.len() {
                    return Err(self.error(format!(
                        "base function call for '{}' has different parameter count",
                        function_name
                    )));
                }
                if let Err(failed_index) = self
                    .casting()
                    .can_match_signature(&parameter_types, &enclosing.parameters)
                {
                    let parameter_name = enclosing
                        .parameters
                        .get(failed_index)
                        .map(|parameter| parameter.name.as_str().to_string())
                        .unwrap_or_default();
                    return Err(self.error(format!(
                        "can't cast parameters of '{}' function call to match base function, parameter '{}' has the wrong type",
                        function_name, parameter_name
                    )));
                }

                if base_function_exists {
                    chosen = Some(std::sync::Arc::new(enclosing.clone()));
                } else {
                    // No base function with this signature: the call
                    // compiles to nothing, or to a default return value.
                    match enclosing.return_type.class() {
                        DataTypeClass::Void => {
                            tokens.remove(index);
                        }
                        DataTypeClass::Integer | DataTypeClass::String => {
                            tokens.replace(
                                index,
                                Token::Statement(StatementToken::typed(
                                    StatementNode::Constant {
                                        value: AnyBaseValue::new(),
                                    },
                                    enclosing.return_type.clone(),
                                )),
                            );
                        }
                        DataTypeClass::Any => {
                            return Err(self.error(
                                "'any' type cannot be used as a return value",
                            ));
                        }
                        _ => {}
                    }
                    return Ok(());
                }
            } else {
                // Pick the best-fitting overload.
                let mut best_priority = INVALID_PRIORITY;
                let mut best: Option<(FunctionRef, bool)> = None;
                for (candidate, deprecated) in &candidates {
                    let priority = self
                        .casting()
                        .priority_of_function_signature(&parameter_types, &candidate.parameters);
                    if priority < best_priority {
                        best_priority = priority;
                        best = Some((candidate.clone(), *deprecated));
                    }
                }
                if best_priority >= INVALID_PRIORITY {
                    return Err(self.error(format!(
                        "no appropriate function overload found calling '{}', the number or types of parameters passed are wrong",
                        function_name
                    )));
                }
                let (function, deprecated) = best.expect("priority was valid");
                if deprecated {
                    if name == function.name {
                        self.warnings.push(CompilerWarning {
                            code: WarningCode::DeprecatedFunction,
                            message: format!(
                                "function '{}' is deprecated and might be removed in the future",
                                name
                            ),
                            line_number: self.line_number,
                        });
                    } else {
                        self.warnings.push(CompilerWarning {
                            code: WarningCode::DeprecatedFunctionAlias,
                            message: format!(
                                "function name '{}' is deprecated, consider using the new name '{}' instead",
                                name, function.name
                            ),
                            line_number: self.line_number,
                        });
                    }
                }
                chosen = Some(function);
            }

            let function = chosen.expect("resolved above");
            let return_type = function.return_type.clone();
            tokens.replace(
                index,
                Token::Statement(StatementToken::typed(
                    StatementNode::FunctionCall {
                        function: Some(function),
                        is_base_call,
                        parameters,
                    },
                    return_type,
                )),
            );
            index += 1;
        }
        Ok(())
    }

    // --- memory accesses ----------------------------------------------------

    fn process_memory_accesses(&mut self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        let mut index = 0;
        while index + 1 < tokens.len() {
            let is_access = matches!(tokens.get(index), Some(Token::VarType(_)))
                && crate::token_helper::is_parenthesis(
                    &tokens[index + 1],
                    ParenthesisType::Bracket,
                );
            if !is_access {
                index += 1;
                continue;
            }
            let data_type = match tokens.get(index) {
                Some(Token::VarType(data_type)) => data_type.clone(),
                _ => unreachable!("checked above"),
            };
            if data_type.class() != DataTypeClass::Integer
                || data_type.semantics() != IntegerSemantics::Default
            {
                return Err(self.error(format!(
                    "memory access is only possible using basic integer types, but not '{}'",
                    data_type.name()
                )));
            }

            let mut content = match tokens.remove(index + 1) {
                Token::Statement(StatementToken {
                    node: StatementNode::Parenthesis { content, .. },
                    ..
                }) => content,
                _ => unreachable!("checked to be a bracket"),
            };
            if content.len() != 1 {
                return Err(self.error("expected exactly one token inside brackets"));
            }
            let mut address = match content.remove(0) {
                Token::Statement(statement) => statement,
                _ => return Err(self.error("expected statement token inside brackets")),
            };
            self.assign_statement_data_type(&mut address, Some(&PredefinedDataTypes::u32()))?;

            tokens.replace(
                index,
                Token::Statement(StatementToken::typed(
                    StatementNode::MemoryAccess {
                        address: Box::new(address),
                    },
                    data_type,
                )),
            );
            index += 1;
        }
        Ok(())
    }

    // --- array accesses -----------------------------------------------------

    fn process_array_accesses(
        &mut self,
        context: &mut CompilationContext<'_>,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        let mut index = 0;
        while index + 1 < tokens.len() {
            let name = match (tokens.get(index), tokens.get(index + 1)) {
                (
                    Some(Token::Statement(StatementToken {
                        node: StatementNode::Identifier { name, .. },
                        ..
                    })),
                    Some(next),
                ) if crate::token_helper::is_parenthesis(next, ParenthesisType::Bracket) => {
                    name.clone()
                }
                _ => {
                    index += 1;
                    continue;
                }
            };

            // Could be a constant array, or a variable whose type exposes
            // the bracket operator.
            let constant_array = self.find_constant_array(context, name.hash());
            let variable = if constant_array.is_none() {
                let variable = self.find_variable(context, name.hash());
                if variable.is_none() {
                    return Err(
                        self.error(format!("unable to resolve identifier: {}", name))
                    );
                }
                variable
            } else {
                None
            };

            if let Some(variable) = &variable {
                if variable.data_type.bracket_operator().is_none() {
                    return Err(self.error(format!(
                        "variable {} can't be followed by the brackets []",
                        variable.name
                    )));
                }
            }

            let mut content = match tokens.remove(index + 1) {
                Token::Statement(StatementToken {
                    node: StatementNode::Parenthesis { content, .. },
                    ..
                }) => content,
                _ => unreachable!("checked to be a bracket"),
            };
            if content.len() != 1 {
                return Err(self.error("expected exactly one token inside brackets"));
            }
            let index_statement = match content.remove(0) {
                Token::Statement(statement) => statement,
                _ => return Err(self.error("expected statement token inside brackets")),
            };

            if let Some(array) = constant_array {
                // Becomes a call to the built-in constant-array reader whose
                // return type matches the element type.
                let function = self
                    .builtin_constant_array_access
                    .iter()
                    .find(|candidate| candidate.return_type.id() == array.element_type.id())
                    .cloned()
                    .ok_or_else(|| {
                        self.error(format!(
                            "could not find fitting type implementation for constant array {}",
                            name
                        ))
                    })?;

                let mut parameters = vec![
                    StatementToken::typed(
                        StatementNode::Constant {
                            value: AnyBaseValue::from(array.id as u64),
                        },
                        PredefinedDataTypes::u32(),
                    ),
                    index_statement,
                ];
                for (parameter, declared) in parameters.iter_mut().zip(&function.parameters) {
                    self.assign_statement_data_type(parameter, Some(&declared.data_type))?;
                }
                let return_type = function.return_type.clone();
                tokens.replace(
                    index,
                    Token::Statement(StatementToken::typed(
                        StatementNode::FunctionCall {
                            function: Some(function),
                            is_base_call: false,
                            parameters,
                        },
                        return_type,
                    )),
                );
            } else {
                let variable = variable.expect("either array or variable");
                let bracket = variable
                    .data_type
                    .bracket_operator()
                    .expect("checked above")
                    .clone();
                let mut index_statement = index_statement;
                self.assign_statement_data_type(
                    &mut index_statement,
                    Some(&bracket.parameter_type),
                )?;
                tokens.replace(
                    index,
                    Token::Statement(StatementToken::typed(
                        StatementNode::BracketAccess {
                            variable,
                            index: Box::new(index_statement),
                        },
                        bracket.value_type,
                    )),
                );
            }
            index += 1;
        }
        Ok(())
    }

    // --- explicit casts -----------------------------------------------------

    fn process_explicit_casts(&mut self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        let mut index = 0;
        while index + 1 < tokens.len() {
            let is_cast = matches!(tokens.get(index), Some(Token::VarType(_)))
                && crate::token_helper::is_parenthesis(
                    &tokens[index + 1],
                    ParenthesisType::Parenthesis,
                );
            if !is_cast {
                index += 1;
                continue;
            }
            let target_type = match tokens.get(index) {
                Some(Token::VarType(data_type)) => data_type.clone(),
                _ => unreachable!("checked above"),
            };
            let argument = match tokens.remove(index + 1) {
                Token::Statement(statement) => statement,
                _ => unreachable!("checked to be a parenthesis"),
            };
            tokens.replace(
                index,
                Token::Statement(StatementToken::typed(
                    StatementNode::ValueCast {
                        argument: Box::new(argument),
                    },
                    target_type,
                )),
            );
            index += 1;
        }
        Ok(())
    }

    // --- remaining identifiers ----------------------------------------------

    fn process_variables(
        &mut self,
        context: &CompilationContext<'_>,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        for index in 0..tokens.len() {
            let name = match tokens.get(index) {
                Some(Token::Statement(StatementToken {
                    node: StatementNode::Identifier { name, .. },
                    ..
                })) => name.clone(),
                _ => continue,
            };
            let variable = self
                .find_variable(context, name.hash())
                .ok_or_else(|| self.error(format!("unable to resolve identifier: {}", name)))?;
            tokens.replace(
                index,
                Token::Statement(StatementToken::typed(
                    StatementNode::Variable {
                        variable: variable.clone(),
                    },
                    variable.data_type,
                )),
            );
        }
        Ok(())
    }

    // --- addressof / makeCallable -------------------------------------------

    fn resolve_addressof_functions(&mut self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        let mut index = 0;
        while index + 1 < tokens.len() {
            if !crate::token_helper::is_keyword(&tokens[index], Keyword::Addressof) {
                index += 1;
                continue;
            }
            let content = crate::token_helper::parenthesis_content(
                &tokens[index + 1],
                ParenthesisType::Parenthesis,
            )
            .ok_or_else(|| self.error("addressof must be followed by parentheses"))?;

            // Only the function-name form is handled here; memory accesses
            // are resolved after the recursive processing.
            let name = match content.get(0) {
                Some(Token::Statement(StatementToken {
                    node: StatementNode::Identifier { name, .. },
                    ..
                })) if content.len() == 1 => name.clone(),
                _ => {
                    index += 1;
                    continue;
                }
            };

            let candidates = self.globals_lookup.functions_by_name(name.hash());
            if candidates.is_empty() {
                return Err(self.error(format!("unknown function '{}' in addressof", name)));
            }
            let address = candidates
                .iter()
                .filter(|reference| reference.function.kind == FunctionKind::Script)
                .find_map(|reference| reference.function.address_hooks.first().copied())
                .ok_or_else(|| {
                    self.error(format!("no address hook found for function '{}'", name))
                })?;

            tokens.replace(
                index,
                Token::Statement(StatementToken::typed(
                    StatementNode::Constant {
                        value: AnyBaseValue::from(address as u64),
                    },
                    PredefinedDataTypes::u32(),
                )),
            );
            tokens.remove(index + 1);
            break;
        }
        Ok(())
    }

    fn resolve_make_callable(&mut self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        let mut index = 0;
        while index + 1 < tokens.len() {
            if !crate::token_helper::is_keyword(&tokens[index], Keyword::MakeCallable) {
                index += 1;
                continue;
            }
            let content = crate::token_helper::parenthesis_content(
                &tokens[index + 1],
                ParenthesisType::Parenthesis,
            )
            .ok_or_else(|| self.error("makeCallable must be followed by parentheses"))?;
            let name = match content.get(0) {
                Some(Token::Statement(StatementToken {
                    node: StatementNode::Identifier { name, .. },
                    ..
                })) if content.len() == 1 => name.clone(),
                _ => return Err(self.error("makeCallable parameter must be a function name")),
            };

            let (function, any_found) = self
                .globals_lookup
                .function_by_name_and_signature(name.hash(), lemon_core::void_signature_hash());
            let function = match function {
                Some(reference) => reference.function.clone(),
                None if any_found => {
                    return Err(self.error(format!(
                        "function '{}' in makeCallable must have no parameters and no return value",
                        name
                    )))
                }
                None => {
                    return Err(
                        self.error(format!("function '{}' in makeCallable is unknown", name))
                    )
                }
            };

            let address = self.module.add_or_find_callable_function_address(&function);
            tokens.replace(
                index,
                Token::Statement(StatementToken::typed(
                    StatementNode::Constant {
                        value: AnyBaseValue::from(address as u64),
                    },
                    PredefinedDataTypes::u32(),
                )),
            );
            tokens.remove(index + 1);
            break;
        }
        Ok(())
    }

    fn resolve_addressof_memory_accesses(
        &mut self,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        let mut index = 0;
        while index + 1 < tokens.len() {
            if !crate::token_helper::is_keyword(&tokens[index], Keyword::Addressof) {
                index += 1;
                continue;
            }
            let content_len = crate::token_helper::parenthesis_content(
                &tokens[index + 1],
                ParenthesisType::Parenthesis,
            )
            .ok_or_else(|| self.error("addressof must be followed by parentheses"))?
            .len();
            if content_len != 1 {
                return Err(
                    self.error("expected a single token in parentheses after addressof")
                );
            }

            let parenthesis = tokens.remove(index + 1);
            let inner = match parenthesis {
                Token::Statement(StatementToken {
                    node: StatementNode::Parenthesis { mut content, .. },
                    ..
                }) => content.remove(0),
                _ => unreachable!("checked to be a parenthesis"),
            };
            match inner {
                Token::Statement(StatementToken {
                    node: StatementNode::MemoryAccess { address },
                    ..
                }) => {
                    // The address expression replaces the whole construct.
                    tokens.replace(index, Token::Statement(*address));
                }
                _ => return Err(self.error("unsupported use of addressof")),
            }
            index += 1;
        }
        Ok(())
    }

    // --- unary operations ---------------------------------------------------

    fn process_unary_operations(&mut self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        // Left to right: postfix increment/decrement.
        let mut index = 0;
        while index < tokens.len() {
            let op = match tokens.get(index) {
                Some(Token::Operator(
                    op @ (Operator::UnaryIncrement | Operator::UnaryDecrement),
                )) => *op,
                _ => {
                    index += 1;
                    continue;
                }
            };
            if index == 0 || !tokens[index - 1].is_statement() {
                index += 1;
                continue;
            }
            let argument = tokens
                .remove(index - 1)
                .into_statement()
                .expect("checked to be a statement");
            tokens.replace(
                index - 1,
                Token::Statement(StatementToken::new(StatementNode::UnaryOperation {
                    op,
                    argument: Box::new(argument),
                })),
            );
            // The new token sits at index - 1; continue after it.
        }

        // Right to left: prefix forms and unary minus/not/bitnot.
        let mut index = tokens.len() as i64 - 1;
        while index >= 0 {
            let position = index as usize;
            let op = match tokens.get(position) {
                Some(Token::Operator(op)) => *op,
                _ => {
                    index -= 1;
                    continue;
                }
            };
            match op {
                Operator::BinaryMinus | Operator::UnaryNot | Operator::UnaryBitnot => {
                    if position + 1 == tokens.len() {
                        return Err(self.error("unary operator not allowed as last"));
                    }
                    // Minus could be binary or unary; it is unary only when
                    // not preceded by a statement.
                    if op == Operator::BinaryMinus
                        && position > 0
                        && !matches!(tokens.get(position - 1), Some(Token::Operator(_)))
                    {
                        index -= 1;
                        continue;
                    }
                    if !tokens[position + 1].is_statement() {
                        return Err(self.error("right of operator is no statement"));
                    }
                    let argument = tokens
                        .remove(position + 1)
                        .into_statement()
                        .expect("checked to be a statement");
                    tokens.replace(
                        position,
                        Token::Statement(StatementToken::new(StatementNode::UnaryOperation {
                            op,
                            argument: Box::new(argument),
                        })),
                    );
                }
                Operator::UnaryIncrement | Operator::UnaryDecrement => {
                    // Prefix form.
                    if position + 1 == tokens.len() || !tokens[position + 1].is_statement() {
                        index -= 1;
                        continue;
                    }
                    let argument = tokens
                        .remove(position + 1)
                        .into_statement()
                        .expect("checked to be a statement");
                    tokens.replace(
                        position,
                        Token::Statement(StatementToken::new(StatementNode::UnaryOperation {
                            op,
                            argument: Box::new(argument),
                        })),
                    );
                }
                _ => {}
            }
            index -= 1;
        }
        Ok(())
    }

    // --- binary operations --------------------------------------------------

    fn process_binary_operations(&mut self, tokens: &mut TokenList) -> Result<(), CompilerError> {
        loop {
            // Find the operator with the lowest priority; on ties, the
            // later occurrence wins for left-associative operators.
            let mut best_priority = 0xffu8;
            let mut best_position = 0usize;
            for index in 0..tokens.len() {
                let op = match tokens.get(index) {
                    Some(Token::Operator(op)) => *op,
                    _ => continue,
                };
                if index == 0
                    || index == tokens.len() - 1
                    || OperatorHelper::operator_class(op) == OperatorClass::Structural
                {
                    return Err(self.error(operator_not_allowed_message(op)));
                }
                let priority = OperatorHelper::priority(op);
                let is_lower = if priority == best_priority {
                    OperatorHelper::is_associative(op)
                } else {
                    priority < best_priority
                };
                if is_lower {
                    best_priority = priority;
                    best_position = index;
                }
            }
            if best_position == 0 {
                break;
            }

            let op = match &tokens[best_position] {
                Token::Operator(op) => *op,
                _ => unreachable!("found above"),
            };
            if !tokens[best_position - 1].is_statement() {
                return Err(self.error(format!(
                    "left of operator {} is no statement",
                    OperatorHelper::characters(op)
                )));
            }
            if !tokens[best_position + 1].is_statement() {
                return Err(self.error(format!(
                    "right of operator {} is no statement",
                    OperatorHelper::characters(op)
                )));
            }

            let right = tokens
                .remove(best_position + 1)
                .into_statement()
                .expect("checked above");
            let left = tokens
                .remove(best_position - 1)
                .into_statement()
                .expect("checked above");
            tokens.replace(
                best_position - 1,
                Token::Statement(StatementToken::new(StatementNode::BinaryOperation {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    function: None,
                })),
            );
        }
        Ok(())
    }

    // --- compile-time folding -----------------------------------------------

    fn evaluate_compile_time_constants(
        &mut self,
        tokens: &mut TokenList,
    ) -> Result<(), CompilerError> {
        for index in 0..tokens.len() {
            if let Some(Token::Statement(_)) = tokens.get(index) {
                let mut statement = match tokens.replace(
                    index,
                    Token::Operator(Operator::CommaSeparator), // placeholder
                ) {
                    Token::Statement(statement) => statement,
                    _ => unreachable!("checked above"),
                };
                self.evaluate_compile_time_constants_recursive(&mut statement)?;
                tokens.replace(index, Token::Statement(statement));
            }
        }
        Ok(())
    }

    fn evaluate_compile_time_constants_recursive(
        &mut self,
        token: &mut StatementToken,
    ) -> Result<(), CompilerError> {
        match &mut token.node {
            StatementNode::Parenthesis {
                parenthesis_type: ParenthesisType::Parenthesis,
                content,
            } if content.len() == 1 && content[0].is_statement() => {
                // A parenthesis around a single statement is transparent;
                // its content was folded when the inner list was processed.
                let inner = content
                    .remove(0)
                    .into_statement()
                    .expect("checked to be a statement");
                *token = inner;
            }
            StatementNode::UnaryOperation { op, argument } => {
                let op = *op;
                self.evaluate_compile_time_constants_recursive(argument)?;
                if let Some((value, data_type)) = constant_integer_of(argument) {
                    if let Some(folded) = try_fold_unary(op, value) {
                        *token = StatementToken::typed(
                            StatementNode::Constant {
                                value: AnyBaseValue::from(folded),
                            },
                            data_type,
                        );
                    }
                }
            }
            StatementNode::BinaryOperation {
                op, left, right, ..
            } => {
                let op = *op;
                self.evaluate_compile_time_constants_recursive(left)?;
                self.evaluate_compile_time_constants_recursive(right)?;
                if let (Some((left_value, data_type)), Some((right_value, _))) =
                    (constant_integer_of(left), constant_integer_of(right))
                {
                    if let Some(folded) = try_fold_binary(op, left_value, right_value) {
                        *token = StatementToken::typed(
                            StatementNode::Constant {
                                value: AnyBaseValue::from(folded),
                            },
                            data_type,
                        );
                    }
                }
            }
            StatementNode::FunctionCall {
                function,
                parameters,
                ..
            } => {
                let function = function.clone();
                for parameter in parameters.iter_mut() {
                    self.evaluate_compile_time_constants_recursive(parameter)?;
                }
                let all_constant = parameters
                    .iter()
                    .all(|parameter| matches!(parameter.node, StatementNode::Constant { .. }));
                if let Some(function) = function {
                    if all_constant
                        && function.kind == FunctionKind::Native
                        && function.flags.contains(FunctionFlags::COMPILE_TIME_CONSTANT)
                        && parameters.len() == function.parameters.len()
                    {
                        if let Some(wrapper) = self.natives.wrapper(function.id) {
                            // Evaluate through a throwaway runtime: push the
                            // arguments, run the wrapper, pop the result.
                            let mut runtime = Runtime::new();
                            let mut exec_context = runtime.make_exec_context();
                            for (parameter, declared) in
                                parameters.iter_mut().zip(&function.parameters)
                            {
                                self.cast_compile_time_constant(parameter, &declared.data_type)?;
                                if let StatementNode::Constant { value } = &parameter.node {
                                    exec_context.flow.push(value.raw());
                                }
                            }
                            (wrapper.callable)(&mut exec_context);
                            let result = exec_context.flow.pop::<i64>();

                            let data_type = token
                                .data_type
                                .clone()
                                .unwrap_or_else(PredefinedDataTypes::const_int);
                            *token = StatementToken::typed(
                                StatementNode::Constant {
                                    value: AnyBaseValue::from(result),
                                },
                                data_type,
                            );
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn cast_compile_time_constant(
        &self,
        token: &mut StatementToken,
        target: &DataTypeRef,
    ) -> Result<(), CompilerError> {
        let source = token
            .data_type
            .clone()
            .unwrap_or_else(PredefinedDataTypes::const_int);
        if let StatementNode::Constant { value } = &mut token.node {
            match self.casting().cast_constant_value(*value, &source, target) {
                Some(cast) => {
                    *value = cast;
                    token.data_type = Some(target.clone());
                }
                None => return Err(self.error("invalid cast of constants")),
            }
        }
        Ok(())
    }

    // --- type assignment ----------------------------------------------------

    fn assign_statement_data_types(
        &mut self,
        tokens: &mut TokenList,
        result_type: Option<&DataTypeRef>,
    ) -> Result<(), CompilerError> {
        for index in 0..tokens.len() {
            if !tokens[index].is_statement() {
                continue;
            }
            let mut statement = tokens
                .replace(index, Token::Operator(Operator::CommaSeparator))
                .into_statement()
                .expect("checked above");
            self.assign_statement_data_type(&mut statement, result_type)?;
            tokens.replace(index, Token::Statement(statement));
        }
        Ok(())
    }

    fn assign_statement_data_type(
        &mut self,
        token: &mut StatementToken,
        result_type: Option<&DataTypeRef>,
    ) -> Result<Option<DataTypeRef>, CompilerError> {
        match &mut token.node {
            StatementNode::Constant { .. } => {
                let current = token
                    .data_type
                    .clone()
                    .unwrap_or_else(PredefinedDataTypes::const_int);
                if current.class() == DataTypeClass::Integer {
                    let adopted = match result_type {
                        Some(expected) if expected.class() == DataTypeClass::Integer => {
                            expected.clone()
                        }
                        _ => PredefinedDataTypes::const_int(),
                    };
                    token.data_type = Some(adopted);
                } else if token.data_type.is_none() {
                    token.data_type = Some(current);
                }
            }

            // Already fully typed when they were created.
            StatementNode::Variable { .. }
            | StatementNode::FunctionCall { .. }
            | StatementNode::MemoryAccess { .. }
            | StatementNode::BracketAccess { .. }
            | StatementNode::Identifier { .. }
            | StatementNode::CommaSeparatedList { .. } => {}

            StatementNode::Parenthesis { content, .. } => {
                if content.len() != 1 {
                    return Err(self.error("parenthesis content must be one token"));
                }
                if !content[0].is_statement() {
                    return Err(self.error("parenthesis content must be a statement"));
                }
                let mut inner = content
                    .remove(0)
                    .into_statement()
                    .expect("checked above");
                let inner_type = self.assign_statement_data_type(&mut inner, result_type)?;
                content.push(Token::Statement(inner));
                token.data_type = inner_type;
            }

            StatementNode::UnaryOperation { argument, .. } => {
                token.data_type = self.assign_statement_data_type(argument, result_type)?;
            }

            StatementNode::BinaryOperation {
                op,
                left,
                right,
                function,
            } => {
                let op_value = *op;
                let op_class = OperatorHelper::operator_class(op_value);
                let expected = if op_class == OperatorClass::Symmetric {
                    result_type
                } else {
                    None
                };

                let left_type = self
                    .assign_statement_data_type(left, expected)?
                    .ok_or_else(|| self.error("left side of operator has no type"))?;
                let right_expected = if op_class == OperatorClass::Assignment {
                    Some(&left_type)
                } else {
                    expected
                };
                let right_type = self
                    .assign_statement_data_type(right, right_expected)?
                    .ok_or_else(|| self.error("right side of operator has no type"))?;

                let best = self.best_operator_signature(op_value, &left_type, &right_type)?;
                match best.enforced_function {
                    None => {
                        token.data_type = Some(best.signature.result.clone());
                        if OperatorHelper::operator_class(op_value) != OperatorClass::Trinary {
                            self.insert_cast_if_necessary(left, &best.signature.left);
                            self.insert_cast_if_necessary(right, &best.signature.right);
                        }
                    }
                    Some(enforced) => match best.split_to_operator {
                        None => {
                            *function = Some(enforced);
                            token.data_type = Some(best.signature.result.clone());
                        }
                        Some(split_op) => {
                            // Split `a += b` into `a = a + b`, with the
                            // enforced function implementing the `+`.
                            let result = best.signature.result.clone();
                            let left_clone = left.clone();
                            let old_right = std::mem::replace(
                                right,
                                Box::new(StatementToken::new(StatementNode::Constant {
                                    value: AnyBaseValue::new(),
                                })),
                            );
                            *right = Box::new(StatementToken {
                                data_type: Some(result.clone()),
                                node: StatementNode::BinaryOperation {
                                    op: split_op,
                                    left: left_clone,
                                    right: old_right,
                                    function: Some(enforced),
                                },
                            });
                            *op = Operator::Assign;
                            *function = None;
                            token.data_type = Some(result);
                        }
                    },
                }
            }

            StatementNode::ValueCast { argument } => {
                let target = token
                    .data_type
                    .clone()
                    .ok_or_else(|| self.error("cast has no target type"))?;
                let source = self
                    .assign_statement_data_type(argument, Some(&target))?
                    .ok_or_else(|| self.error("cast argument has no type"))?;
                if !self.casting().can_explicitly_cast(&source, &target) {
                    return Err(self.error(format!(
                        "explicit cast not possible from {} to {}",
                        source.name(),
                        target.name()
                    )));
                }
            }
        }
        Ok(token.data_type.clone())
    }

    fn insert_cast_if_necessary(&self, token: &mut Box<StatementToken>, target: &DataTypeRef) {
        let source = match &token.data_type {
            Some(data_type) => data_type.clone(),
            None => return,
        };
        if self.casting().get_cast_handling(&source, target, false) == CastHandling::BaseCast {
            let inner = std::mem::replace(
                token,
                Box::new(StatementToken::new(StatementNode::Constant {
                    value: AnyBaseValue::new(),
                })),
            );
            *token = Box::new(StatementToken::typed(
                StatementNode::ValueCast { argument: inner },
                target.clone(),
            ));
        }
    }

    fn best_operator_signature(
        &mut self,
        op: Operator,
        left: &DataTypeRef,
        right: &DataTypeRef,
    ) -> Result<BinaryOperationResult, CompilerError> {
        let casting = self.casting();

        // Special handling for certain operations with strings.
        if casting.string_operators_enabled() {
            if let Some(lookups) = self.binary_operation_lookup.get(&op) {
                let mut best: Option<(&BinaryOperationLookup, u16)> = None;
                for lookup in lookups {
                    let priority = casting.priority_of_signature(&lookup.signature, left, right);
                    if priority < INVALID_SIGNATURE
                        && best.map(|(_, b)| priority < b).unwrap_or(true)
                    {
                        best = Some((lookup, priority));
                    }
                }
                if let Some((lookup, _)) = best {
                    return Ok(BinaryOperationResult {
                        signature: lookup.signature.clone(),
                        enforced_function: lookup.function.clone(),
                        split_to_operator: lookup.split_to_operator,
                    });
                }
            }
        }

        let signatures = TypeCasting::binary_signatures_for_operator(op);
        let exact_left = TypeCasting::exact_left_required(op);
        match casting.best_operator_signature(&signatures, exact_left, left, right) {
            Some(index) => Ok(BinaryOperationResult {
                signature: signatures[index].clone(),
                enforced_function: None,
                split_to_operator: None,
            }),
            None => {
                // Assignment of two values of the same type always works.
                if left.id() == right.id() && op == Operator::Assign {
                    return Ok(BinaryOperationResult {
                        signature: BinaryOperatorSignature {
                            left: left.clone(),
                            right: right.clone(),
                            result: left.clone(),
                        },
                        enforced_function: None,
                        split_to_operator: None,
                    });
                }
                Err(self.error(format!(
                    "cannot apply binary operator {} between types '{}' and '{}'",
                    OperatorHelper::characters(op),
                    left.name(),
                    right.name()
                )))
            }
        }
    }

    // --- scope lookups ------------------------------------------------------

    fn find_scope_variable(
        &self,
        context: &CompilationContext<'_>,
        name_hash: u64,
    ) -> Option<VariableInfo> {
        context
            .local_variables
            .iter()
            .find(|variable| variable.name.hash() == name_hash)
            .cloned()
    }

    fn find_variable(
        &self,
        context: &CompilationContext<'_>,
        name_hash: u64,
    ) -> Option<VariableInfo> {
        // Local variables shadow globals.
        if let Some(variable) = self.find_scope_variable(context, name_hash) {
            return Some(variable);
        }
        match self.globals_lookup.resolve_identifier(name_hash) {
            Some(Identifier::Variable(variable)) => Some(variable.clone()),
            _ => None,
        }
    }

    fn find_constant_array(
        &self,
        context: &CompilationContext<'_>,
        name_hash: u64,
    ) -> Option<ConstantArrayInfo> {
        if let Some(array) = context
            .local_constant_arrays
            .iter()
            .find(|array| array.name.hash() == name_hash)
        {
            return Some(array.clone());
        }
        match self.globals_lookup.resolve_identifier(name_hash) {
            Some(Identifier::ConstantArray(array)) => Some(array.clone()),
            _ => None,
        }
    }
}

fn constant_integer_of(token: &StatementToken) -> Option<(i64, DataTypeRef)> {
    match &token.node {
        StatementNode::Constant { value } => {
            let data_type = token
                .data_type
                .clone()
                .unwrap_or_else(PredefinedDataTypes::const_int);
            (data_type.class() == DataTypeClass::Integer)
                .then(|| (value.get::<i64>(), data_type))
        }
        _ => None,
    }
}

fn try_fold_unary(op: Operator, value: i64) -> Option<i64> {
    Some(match op {
        Operator::BinaryMinus => value.wrapping_neg(),
        Operator::UnaryNot => (value == 0) as i64,
        Operator::UnaryBitnot => !value,
        _ => return None,
    })
}

fn try_fold_binary(op: Operator, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        Operator::BinaryPlus => a.wrapping_add(b),
        Operator::BinaryMinus => a.wrapping_sub(b),
        Operator::BinaryMultiply => a.wrapping_mul(b),
        // Division and modulo by zero fold to zero, like at runtime.
        Operator::BinaryDivide => {
            if b == 0 {
                0
            } else {
                a.wrapping_div(b)
            }
        }
        Operator::BinaryModulo => {
            if b == 0 {
                0
            } else {
                a.wrapping_rem(b)
            }
        }
        Operator::BinaryShiftLeft => a.wrapping_shl(b as u32),
        Operator::BinaryShiftRight => a.wrapping_shr(b as u32),
        Operator::BinaryAnd => a & b,
        Operator::BinaryOr => a | b,
        Operator::BinaryXor => a ^ b,
        _ => return None,
    })
}

fn operator_not_allowed_message(op: Operator) -> String {
    use Operator as Op;
    match op {
        Op::UnaryNot | Op::UnaryBitnot | Op::UnaryDecrement | Op::UnaryIncrement => {
            format!(
                "unary operator {} is not allowed here",
                OperatorHelper::characters(op)
            )
        }
        Op::SemicolonSeparator => "semicolon ; is only allowed in for-loops".to_string(),
        Op::CommaSeparator => "comma , is not allowed here".to_string(),
        Op::ParenthesisLeft => "parenthesis ( is not allowed here".to_string(),
        Op::ParenthesisRight => "parenthesis ) is not allowed here".to_string(),
        Op::BracketLeft => "bracket [ is not allowed here".to_string(),
        Op::BracketRight => "bracket ] is not allowed here".to_string(),
        _ => format!(
            "binary operator {} is not allowed here",
            OperatorHelper::characters(op)
        ),
    }
}
