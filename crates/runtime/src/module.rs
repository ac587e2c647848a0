//! Module: the linkable unit
//!
//! A module exclusively owns its functions, variables, constants, constant
//! arrays, defines, string literals, source-file infos and custom data
//! types. IDs of every kind are allocated sequentially starting from the
//! counters latched by `start_compiling`, so that two runs over the same
//! set of modules produce identical IDs. After a module is added to a
//! program it is never mutated again.

use std::sync::Arc;

use lemon_core::{
    make_variable_id, murmur2_64, AliasName, AnyBaseValue, ConstantArrayInfo, ConstantInfo,
    DataTypeDefinition, DataTypeRef, DefineInfo, FlyweightString, FunctionFlags, FunctionInfo,
    FunctionKind, FunctionParameter, GlobalsLookup, PredefinedDataTypes, SharedTokenList,
    SignatureBuilder, TokenList, VariableInfo, VariableKind,
};

use crate::function::{NativeFunction, ScriptFunction};
use crate::native::NativeFunctionWrapper;
use crate::variable::{
    ExternalVariableAccessor, UserVariableCallback, Variable, VariablePayload,
};

/// Callable addresses handed out by `makeCallable` start here; the low bits
/// are the registration index.
pub const CALLABLE_ADDRESS_BASE: u32 = 0x4000_0000;

/// One source file a module was compiled from.
#[derive(Debug, Clone)]
pub struct SourceFileInfo {
    pub filename: String,
    pub local_path: String,
    pub index: usize,
}

/// A named constant array: fixed-size data addressable from script.
#[derive(Debug, Clone)]
pub struct ConstantArray {
    pub info: ConstantArrayInfo,
    pub values: Vec<AnyBaseValue>,
    /// Global definitions are visible across modules; the rest are local
    /// to a function body.
    pub is_global_definition: bool,
}

/// A define: token-level macro owned by the module.
#[derive(Debug, Clone)]
pub struct Define {
    pub name: FlyweightString,
    pub data_type: DataTypeRef,
    pub content: SharedTokenList,
}

/// Position of a function in the module's per-kind storage, in
/// registration order.
#[derive(Debug, Clone, Copy)]
pub enum FunctionSlot {
    Script(usize),
    Native(usize),
}

pub struct Module {
    name: String,
    module_id: u64,
    script_feature_level: u32,

    first_function_id: u32,
    function_order: Vec<FunctionSlot>,
    script_functions: Vec<ScriptFunction>,
    native_functions: Vec<NativeFunction>,
    /// makeCallable registrations: (address, name-and-signature hash).
    callable_functions: Vec<(u32, u64)>,

    first_variable_id: u32,
    global_variables: Vec<Variable>,

    constants: Vec<ConstantInfo>,
    preprocessor_definitions: Vec<ConstantInfo>,

    first_constant_array_id: u32,
    num_global_constant_arrays: usize,
    constant_arrays: Vec<ConstantArray>,

    defines: Vec<Define>,
    string_literals: Vec<FlyweightString>,

    first_data_type_id: u16,
    data_types: Vec<DataTypeRef>,

    source_files: Vec<SourceFileInfo>,
    compiled_code_hash: u64,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            module_id: murmur2_64(name.as_bytes()),
            script_feature_level: 2,
            first_function_id: 0,
            function_order: Vec::new(),
            script_functions: Vec::new(),
            native_functions: Vec::new(),
            callable_functions: Vec::new(),
            first_variable_id: 0,
            global_variables: Vec::new(),
            constants: Vec::new(),
            preprocessor_definitions: Vec::new(),
            first_constant_array_id: 0,
            num_global_constant_arrays: 0,
            constant_arrays: Vec::new(),
            defines: Vec::new(),
            string_literals: Vec::new(),
            first_data_type_id: 0,
            data_types: Vec::new(),
            source_files: Vec::new(),
            compiled_code_hash: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_id(&self) -> u64 {
        self.module_id
    }

    pub fn script_feature_level(&self) -> u32 {
        self.script_feature_level
    }

    pub fn set_script_feature_level(&mut self, level: u32) {
        self.script_feature_level = level;
    }

    pub fn compiled_code_hash(&self) -> u64 {
        self.compiled_code_hash
    }

    pub fn set_compiled_code_hash(&mut self, hash: u64) {
        self.compiled_code_hash = hash;
    }

    /// Latch the next available IDs from the lookup so that everything
    /// allocated during compilation is globally unique across modules.
    pub fn start_compiling(&mut self, lookup: &GlobalsLookup) {
        if self.function_order.is_empty() {
            self.first_function_id = lookup.next_function_id();
        }
        if self.global_variables.is_empty() {
            self.first_variable_id = lookup.next_variable_id();
        }
        if self.constant_arrays.is_empty() {
            self.first_constant_array_id = lookup.next_constant_array_id();
        }
        if self.data_types.is_empty() {
            self.first_data_type_id = lookup.next_data_type_id();
        }
    }

    // --- source files ---

    pub fn add_source_file_info(&mut self, local_path: &str, filename: &str) -> usize {
        let index = self.source_files.len();
        self.source_files.push(SourceFileInfo {
            filename: filename.to_string(),
            local_path: local_path.to_string(),
            index,
        });
        index
    }

    pub fn source_files(&self) -> &[SourceFileInfo] {
        &self.source_files
    }

    // --- functions ---

    fn next_function_id(&self) -> u32 {
        self.first_function_id + self.function_order.len() as u32
    }

    pub fn first_function_id(&self) -> u32 {
        self.first_function_id
    }

    pub fn add_script_function(
        &mut self,
        name: FlyweightString,
        return_type: DataTypeRef,
        parameters: Vec<FunctionParameter>,
        alias_names: Vec<AliasName>,
    ) -> &mut ScriptFunction {
        let mut builder = SignatureBuilder::new(&return_type);
        for parameter in &parameters {
            builder.add_parameter_type(&parameter.data_type);
        }
        let info = FunctionInfo {
            id: self.next_function_id(),
            kind: FunctionKind::Script,
            name,
            context: None,
            alias_names,
            signature_hash: builder.finish(),
            return_type,
            parameters,
            flags: FunctionFlags::empty(),
            address_hooks: Vec::new(),
        };
        self.function_order
            .push(FunctionSlot::Script(self.script_functions.len()));
        self.script_functions.push(ScriptFunction::new(info));
        self.script_functions.last_mut().expect("just pushed")
    }

    pub fn add_native_function(
        &mut self,
        name: &str,
        wrapper: NativeFunctionWrapper,
        flags: FunctionFlags,
    ) -> &NativeFunction {
        self.add_native_internal(None, name, wrapper, flags)
    }

    /// A native method: callable as `<var>.<name>(…)` for variables whose
    /// data type's name matches the context.
    pub fn add_native_method(
        &mut self,
        context: &str,
        name: &str,
        wrapper: NativeFunctionWrapper,
        flags: FunctionFlags,
    ) -> &NativeFunction {
        self.add_native_internal(Some(FlyweightString::new(context)), name, wrapper, flags)
    }

    fn add_native_internal(
        &mut self,
        context: Option<FlyweightString>,
        name: &str,
        wrapper: NativeFunctionWrapper,
        flags: FunctionFlags,
    ) -> &NativeFunction {
        let mut builder = SignatureBuilder::new(&wrapper.return_type);
        let mut parameters = Vec::with_capacity(wrapper.parameter_types.len());
        for (index, data_type) in wrapper.parameter_types.iter().enumerate() {
            builder.add_parameter_type(data_type);
            parameters.push(FunctionParameter {
                name: FlyweightString::new(&format!("param{}", index)),
                data_type: data_type.clone(),
            });
        }
        let info = FunctionInfo {
            id: self.next_function_id(),
            kind: FunctionKind::Native,
            name: FlyweightString::new(name),
            context,
            alias_names: Vec::new(),
            signature_hash: builder.finish(),
            return_type: wrapper.return_type.clone(),
            parameters,
            flags,
            address_hooks: Vec::new(),
        };
        self.function_order
            .push(FunctionSlot::Native(self.native_functions.len()));
        self.native_functions.push(NativeFunction {
            info,
            wrapper: Arc::new(wrapper),
        });
        self.native_functions.last().expect("just pushed")
    }

    pub fn function_order(&self) -> &[FunctionSlot] {
        &self.function_order
    }

    pub fn script_functions(&self) -> &[ScriptFunction] {
        &self.script_functions
    }

    pub fn script_functions_mut(&mut self) -> &mut [ScriptFunction] {
        &mut self.script_functions
    }

    pub fn native_functions(&self) -> &[NativeFunction] {
        &self.native_functions
    }

    pub fn script_function(&self, index: usize) -> Option<&ScriptFunction> {
        self.script_functions.get(index)
    }

    pub fn native_function(&self, index: usize) -> Option<&NativeFunction> {
        self.native_functions.get(index)
    }

    pub fn native_function_by_name_and_signature(
        &self,
        name_hash: u64,
        signature_hash: u32,
    ) -> Option<&NativeFunction> {
        self.native_functions.iter().find(|function| {
            function.info.name.hash() == name_hash && function.info.signature_hash == signature_hash
        })
    }

    /// Register a function as callable via `external_call`; idempotent per
    /// function.
    pub fn add_or_find_callable_function_address(&mut self, function: &FunctionInfo) -> u32 {
        let hash = function.name_and_signature_hash();
        if let Some((address, _)) = self
            .callable_functions
            .iter()
            .find(|(_, stored)| *stored == hash)
        {
            return *address;
        }
        let address = CALLABLE_ADDRESS_BASE + self.callable_functions.len() as u32;
        self.callable_functions.push((address, hash));
        address
    }

    pub fn callable_function_by_address(&self, address: u32) -> Option<u64> {
        self.callable_functions
            .iter()
            .find(|(stored, _)| *stored == address)
            .map(|(_, hash)| *hash)
    }

    // --- variables ---

    pub fn first_variable_id(&self) -> u32 {
        self.first_variable_id
    }

    fn next_variable_index(&self) -> u32 {
        self.first_variable_id + self.global_variables.len() as u32
    }

    pub fn add_global_variable(
        &mut self,
        name: FlyweightString,
        data_type: DataTypeRef,
    ) -> &mut Variable {
        let id = make_variable_id(VariableKind::Global, self.next_variable_index());
        self.global_variables.push(Variable {
            info: VariableInfo {
                id,
                name,
                data_type,
            },
            payload: VariablePayload::Global {
                initial_value: AnyBaseValue::new(),
            },
        });
        self.global_variables.last_mut().expect("just pushed")
    }

    pub fn add_user_defined_variable(
        &mut self,
        name: FlyweightString,
        data_type: DataTypeRef,
        getter: UserVariableCallback,
        setter: UserVariableCallback,
    ) -> &Variable {
        let id = make_variable_id(VariableKind::User, self.next_variable_index());
        self.global_variables.push(Variable {
            info: VariableInfo {
                id,
                name,
                data_type,
            },
            payload: VariablePayload::User { getter, setter },
        });
        self.global_variables.last().expect("just pushed")
    }

    pub fn add_external_variable(
        &mut self,
        name: FlyweightString,
        data_type: DataTypeRef,
        accessor: ExternalVariableAccessor,
    ) -> &Variable {
        let id = make_variable_id(VariableKind::External, self.next_variable_index());
        self.global_variables.push(Variable {
            info: VariableInfo {
                id,
                name,
                data_type,
            },
            payload: VariablePayload::External { accessor },
        });
        self.global_variables.last().expect("just pushed")
    }

    pub fn global_variables(&self) -> &[Variable] {
        &self.global_variables
    }

    // --- constants ---

    pub fn add_constant(
        &mut self,
        name: FlyweightString,
        data_type: DataTypeRef,
        value: AnyBaseValue,
    ) -> &ConstantInfo {
        self.constants.push(ConstantInfo {
            name,
            data_type,
            value,
        });
        self.constants.last().expect("just pushed")
    }

    pub fn constants(&self) -> &[ConstantInfo] {
        &self.constants
    }

    pub fn add_preprocessor_definition(&mut self, name: FlyweightString, value: i64) {
        self.preprocessor_definitions.push(ConstantInfo {
            name,
            data_type: PredefinedDataTypes::const_int(),
            value: AnyBaseValue::from(value),
        });
    }

    pub fn preprocessor_definitions(&self) -> &[ConstantInfo] {
        &self.preprocessor_definitions
    }

    // --- constant arrays ---

    pub fn first_constant_array_id(&self) -> u32 {
        self.first_constant_array_id
    }

    pub fn add_constant_array(
        &mut self,
        name: FlyweightString,
        element_type: DataTypeRef,
        values: Vec<AnyBaseValue>,
        is_global_definition: bool,
    ) -> &ConstantArray {
        let id = self.first_constant_array_id + self.constant_arrays.len() as u32;
        let info = ConstantArrayInfo {
            id,
            name,
            element_type,
            size: values.len(),
        };
        if is_global_definition {
            self.num_global_constant_arrays += 1;
        }
        self.constant_arrays.push(ConstantArray {
            info,
            values,
            is_global_definition,
        });
        self.constant_arrays.last().expect("just pushed")
    }

    pub fn constant_arrays(&self) -> &[ConstantArray] {
        &self.constant_arrays
    }

    pub fn num_global_constant_arrays(&self) -> usize {
        self.num_global_constant_arrays
    }

    // --- defines ---

    pub fn add_define(
        &mut self,
        name: FlyweightString,
        data_type: DataTypeRef,
        content: TokenList,
    ) -> &Define {
        self.defines.push(Define {
            name,
            data_type,
            content: Arc::new(content),
        });
        self.defines.last().expect("just pushed")
    }

    pub fn defines(&self) -> &[Define] {
        &self.defines
    }

    // --- string literals ---

    pub fn add_string_literal(&mut self, literal: FlyweightString) {
        self.string_literals.push(literal);
    }

    pub fn string_literals(&self) -> &[FlyweightString] {
        &self.string_literals
    }

    // --- data types ---

    pub fn first_data_type_id(&self) -> u16 {
        self.first_data_type_id
    }

    pub fn add_custom_data_type(&mut self, name: &str, base_type: lemon_core::BaseType) -> DataTypeRef {
        let id = self.first_data_type_id + self.data_types.len() as u16;
        let data_type: DataTypeRef = Arc::new(DataTypeDefinition::custom(name, id, base_type));
        self.data_types.push(data_type.clone());
        data_type
    }

    /// A fixed-size array type over an element type; named `element[size]`.
    pub fn add_array_data_type(&mut self, element_type: DataTypeRef, size: usize) -> DataTypeRef {
        let id = self.first_data_type_id + self.data_types.len() as u16;
        let name = format!("{}[{}]", element_type.name(), size);
        let data_type: DataTypeRef =
            Arc::new(DataTypeDefinition::array(&name, id, element_type, size));
        self.data_types.push(data_type.clone());
        data_type
    }

    pub fn data_types(&self) -> &[DataTypeRef] {
        &self.data_types
    }

    // --- dependency hash ---

    /// A cheap order-sensitive summary used as an invalidation key for
    /// serialized caches: changes whenever a definition is added.
    pub fn build_dependency_hash(&self) -> u32 {
        (self.function_order.len()
            + self.global_variables.len()
            + self.constants.len()
            + self.constant_arrays.len()
            + self.defines.len()
            + self.string_literals.len()) as u32
    }
}

/// Contribute all of a module's definitions to a globals lookup, in the
/// same order the module serializer relies on.
pub fn add_definitions_from_module(lookup: &mut GlobalsLookup, module: &Module) {
    for constant in module.preprocessor_definitions() {
        lookup
            .preprocessor_definitions
            .set_definition(constant.name.clone(), constant.value.get::<i64>());
        lookup.register_constant(constant.clone());
    }
    for slot in module.function_order() {
        let info = match slot {
            FunctionSlot::Script(index) => &module.script_functions()[*index].info,
            FunctionSlot::Native(index) => &module.native_functions()[*index].info,
        };
        lookup.register_function(Arc::new(info.clone()));
    }
    for variable in module.global_variables() {
        lookup.register_global_variable(variable.info.clone());
    }
    for constant in module.constants() {
        lookup.register_constant(constant.clone());
    }
    for array in module
        .constant_arrays()
        .iter()
        .filter(|array| array.is_global_definition)
    {
        lookup.register_constant_array(array.info.clone());
    }
    for define in module.defines() {
        lookup.register_define(DefineInfo {
            name: define.name.clone(),
            data_type: define.data_type.clone(),
            content: define.content.clone(),
        });
    }
    for data_type in module.data_types() {
        lookup.register_data_type(data_type.clone());
    }
    for literal in module.string_literals() {
        lookup.add_string_literal(literal.as_str());
    }
}
