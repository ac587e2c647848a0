//! Globals lookup
//!
//! The name-to-identifier table that unifies variables, constants, constant
//! arrays, defines and data types across all linked modules, plus the
//! function overload indexes. Modules contribute owned metadata records;
//! nothing here points back into module storage, and an identifier is a
//! tagged union over the five identifier kinds.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::any_value::AnyBaseValue;
use crate::data_type::{DataTypeRef, PredefinedDataTypes};
use crate::flyweight::{FlyweightString, StringLookup};
use crate::signature::name_and_signature_hash;
use crate::token::SharedTokenList;

/// Variable storage kind, carried in the high nibble of the 32-bit ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VariableKind {
    /// Frame-relative slot in the local-variable buffer.
    Local = 0x0,
    /// Host-supplied getter/setter operating via the value stack.
    User = 0x1,
    /// Stored in the runtime's static memory block.
    Global = 0x2,
    /// Host-supplied accessor yielding a live shared i64.
    External = 0x3,
}

impl VariableKind {
    pub fn from_nibble(nibble: u8) -> VariableKind {
        match nibble & 0x0f {
            0x1 => VariableKind::User,
            0x2 => VariableKind::Global,
            0x3 => VariableKind::External,
            _ => VariableKind::Local,
        }
    }
}

/// Build a variable ID from kind and index.
pub fn make_variable_id(kind: VariableKind, index: u32) -> u32 {
    ((kind as u32) << 28) | (index & 0x0fff_ffff)
}

pub fn variable_kind_of_id(id: u32) -> VariableKind {
    VariableKind::from_nibble((id >> 28) as u8)
}

pub fn variable_index_of_id(id: u32) -> u32 {
    id & 0x0fff_ffff
}

/// Metadata record for a variable, as seen by the token processor.
#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub id: u32,
    pub name: FlyweightString,
    pub data_type: DataTypeRef,
}

impl VariableInfo {
    pub fn kind(&self) -> VariableKind {
        variable_kind_of_id(self.id)
    }
}

/// A named compile-time constant.
#[derive(Debug, Clone)]
pub struct ConstantInfo {
    pub name: FlyweightString,
    pub data_type: DataTypeRef,
    pub value: AnyBaseValue,
}

/// A named constant array (ID + element type + fixed size).
#[derive(Debug, Clone)]
pub struct ConstantArrayInfo {
    pub id: u32,
    pub name: FlyweightString,
    pub element_type: DataTypeRef,
    pub size: usize,
}

/// A define: a token-level macro expanded during processing.
#[derive(Debug, Clone)]
pub struct DefineInfo {
    pub name: FlyweightString,
    pub data_type: DataTypeRef,
    pub content: SharedTokenList,
}

/// Resolution result for an identifier name hash.
#[derive(Debug, Clone)]
pub enum Identifier {
    Variable(VariableInfo),
    Constant(ConstantInfo),
    ConstantArray(ConstantArrayInfo),
    Define(DefineInfo),
    DataType(DataTypeRef),
}

bitflags! {
    /// Flags on functions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u8 {
        const DEPRECATED = 0x01;
        /// Native function that may be evaluated at compile time when all
        /// arguments are constants.
        const COMPILE_TIME_CONSTANT = 0x02;
        const ALLOW_INLINE_EXECUTION = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Native,
}

#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub name: FlyweightString,
    pub data_type: DataTypeRef,
}

/// An alternative (usually older) name for a function.
#[derive(Debug, Clone)]
pub struct AliasName {
    pub name: FlyweightString,
    pub is_deprecated: bool,
}

/// Metadata record describing one function for lookup and overload
/// resolution. The executable side (bytecode or native wrapper) stays with
/// the owning module.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub id: u32,
    pub kind: FunctionKind,
    pub name: FlyweightString,
    /// Method context: set for native methods registered on a data type.
    pub context: Option<FlyweightString>,
    pub alias_names: Vec<AliasName>,
    pub return_type: DataTypeRef,
    pub parameters: Vec<FunctionParameter>,
    pub signature_hash: u32,
    pub flags: FunctionFlags,
    /// Address hooks of script functions (`addressof` resolves these).
    pub address_hooks: Vec<u32>,
}

impl FunctionInfo {
    pub fn name_and_signature_hash(&self) -> u64 {
        name_and_signature_hash(self.name.hash(), self.signature_hash)
    }
}

/// Shared handle to a function metadata record.
pub type FunctionRef = std::sync::Arc<FunctionInfo>;

/// One entry of an overload set.
#[derive(Debug, Clone)]
pub struct FunctionReference {
    pub function: FunctionRef,
    /// Set when this entry was registered under a deprecated name or alias.
    pub is_deprecated: bool,
}

/// Preprocessor definitions: name hash → integer value.
#[derive(Debug, Clone, Default)]
pub struct PreprocessorDefinitionMap {
    map: HashMap<u64, (FlyweightString, i64)>,
}

impl PreprocessorDefinitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_definition(&mut self, name: FlyweightString, value: i64) {
        self.map.insert(name.hash(), (name, value));
    }

    pub fn get(&self, name_hash: u64) -> Option<i64> {
        self.map.get(&name_hash).map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlyweightString, i64)> {
        self.map.values().map(|(name, value)| (name, *value))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The combined name-to-identifier table plus function overload indexes.
pub struct GlobalsLookup {
    identifiers: HashMap<u64, Identifier>,
    functions_by_name: HashMap<u64, Vec<FunctionReference>>,
    /// Key is context name hash + function name hash (wrapping add).
    methods_by_name: HashMap<u64, Vec<FunctionReference>>,
    next_function_id: u32,
    next_variable_id: u32,
    next_constant_array_id: u32,
    data_types: Vec<DataTypeRef>,
    string_literals: StringLookup,
    pub preprocessor_definitions: PreprocessorDefinitionMap,
}

impl GlobalsLookup {
    pub fn new() -> Self {
        let mut lookup = GlobalsLookup {
            identifiers: HashMap::new(),
            functions_by_name: HashMap::new(),
            methods_by_name: HashMap::new(),
            next_function_id: 0,
            next_variable_id: 0,
            next_constant_array_id: 0,
            data_types: Vec::new(),
            string_literals: StringLookup::new(),
            preprocessor_definitions: PreprocessorDefinitionMap::new(),
        };
        for data_type in PredefinedDataTypes::all() {
            lookup.register_data_type(data_type.clone());
        }
        lookup
    }

    pub fn clear(&mut self) {
        *self = GlobalsLookup::new();
    }

    // --- identifiers ---

    pub fn resolve_identifier(&self, name_hash: u64) -> Option<&Identifier> {
        self.identifiers.get(&name_hash)
    }

    // --- functions ---

    pub fn functions_by_name(&self, name_hash: u64) -> &[FunctionReference] {
        self.functions_by_name
            .get(&name_hash)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Exact lookup by name and signature. `any_found` tells whether the
    /// name matched at all (for better error messages on signature
    /// mismatch).
    pub fn function_by_name_and_signature(
        &self,
        name_hash: u64,
        signature_hash: u32,
    ) -> (Option<&FunctionReference>, bool) {
        let candidates = self.functions_by_name(name_hash);
        let found = candidates
            .iter()
            .find(|reference| reference.function.signature_hash == signature_hash);
        (found, !candidates.is_empty())
    }

    /// Methods registered for a data-type context; the key is the sum of
    /// the context name hash and the method name hash.
    pub fn methods_by_name(&self, context_and_name_hash: u64) -> &[FunctionReference] {
        self.methods_by_name
            .get(&context_and_name_hash)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn register_function(&mut self, function: FunctionRef) {
        let deprecated = function.flags.contains(FunctionFlags::DEPRECATED);
        match &function.context {
            None => {
                self.functions_by_name
                    .entry(function.name.hash())
                    .or_default()
                    .push(FunctionReference {
                        function: function.clone(),
                        is_deprecated: deprecated,
                    });
                for alias in &function.alias_names {
                    self.functions_by_name
                        .entry(alias.name.hash())
                        .or_default()
                        .push(FunctionReference {
                            function: function.clone(),
                            is_deprecated: alias.is_deprecated,
                        });
                }
            }
            Some(context) => {
                let key = context.hash().wrapping_add(function.name.hash());
                self.methods_by_name
                    .entry(key)
                    .or_default()
                    .push(FunctionReference {
                        function: function.clone(),
                        is_deprecated: deprecated,
                    });
            }
        }
        self.next_function_id = self.next_function_id.max(function.id + 1);
    }

    // --- variables ---

    pub fn register_global_variable(&mut self, variable: VariableInfo) {
        self.next_variable_id = self
            .next_variable_id
            .max(variable_index_of_id(variable.id) + 1);
        self.identifiers
            .insert(variable.name.hash(), Identifier::Variable(variable));
    }

    // --- constants ---

    pub fn register_constant(&mut self, constant: ConstantInfo) {
        self.identifiers
            .insert(constant.name.hash(), Identifier::Constant(constant));
    }

    // --- constant arrays ---

    pub fn register_constant_array(&mut self, array: ConstantArrayInfo) {
        self.next_constant_array_id = self.next_constant_array_id.max(array.id + 1);
        self.identifiers
            .insert(array.name.hash(), Identifier::ConstantArray(array));
    }

    // --- defines ---

    pub fn register_define(&mut self, define: DefineInfo) {
        self.identifiers
            .insert(define.name.hash(), Identifier::Define(define));
    }

    // --- data types ---

    pub fn register_data_type(&mut self, data_type: DataTypeRef) {
        self.identifiers.insert(
            data_type.name().hash(),
            Identifier::DataType(data_type.clone()),
        );
        self.data_types.push(data_type);
    }

    pub fn data_types(&self) -> &[DataTypeRef] {
        &self.data_types
    }

    pub fn data_type_by_id(&self, id: u16) -> Option<DataTypeRef> {
        // IDs are allocated sequentially in registration order, so the
        // common case is a direct index.
        if let Some(data_type) = self.data_types.get(id as usize) {
            if data_type.id() == id {
                return Some(data_type.clone());
            }
        }
        self.data_types
            .iter()
            .find(|data_type| data_type.id() == id)
            .cloned()
    }

    // --- string literals ---

    pub fn add_string_literal(&mut self, text: &str) -> u64 {
        self.string_literals.add(text)
    }

    pub fn string_literal_by_hash(&self, hash: u64) -> Option<&str> {
        self.string_literals.get_by_hash(hash).map(|s| s.as_str())
    }

    pub fn string_literals(&self) -> &StringLookup {
        &self.string_literals
    }

    // --- ID allocation ---

    pub fn next_function_id(&self) -> u32 {
        self.next_function_id
    }

    pub fn next_variable_id(&self) -> u32 {
        self.next_variable_id
    }

    pub fn next_constant_array_id(&self) -> u32 {
        self.next_constant_array_id
    }

    pub fn next_data_type_id(&self) -> u16 {
        self.data_types
            .iter()
            .map(|data_type| data_type.id() + 1)
            .max()
            .unwrap_or(0)
    }
}

impl Default for GlobalsLookup {
    fn default() -> Self {
        GlobalsLookup::new()
    }
}
