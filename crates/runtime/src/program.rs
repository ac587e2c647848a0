//! Program: linked set of modules
//!
//! A program owns the modules added to it and maintains the unified
//! indexes the runtime resolves against: functions by ID, by name hash and
//! by name-and-signature hash, global variables by ID and name, constant
//! arrays, and the set of all data types seen. Modules added later shadow
//! earlier ones in overload chains (index 0 is the most-derived function),
//! which is what base calls walk.

use std::collections::HashMap;

use lemon_core::{variable_index_of_id, DataTypeRef, PredefinedDataTypes};

use crate::function::Function;
use crate::module::{ConstantArray, Define, FunctionSlot, Module};
use crate::runtime_function::RuntimeOpcodeProvider;
use crate::variable::Variable;

pub struct Program {
    modules: Vec<Module>,
    functions_by_id: HashMap<u32, (usize, FunctionSlot)>,
    /// Script function IDs in link order; the runtime's function table is
    /// parallel to this.
    script_function_ids: Vec<u32>,
    functions_by_signature: HashMap<u64, Vec<u32>>,
    functions_by_name: HashMap<u64, Vec<u32>>,
    variables_by_index: HashMap<u32, (usize, usize)>,
    variables_by_name: HashMap<u64, u32>,
    global_variable_order: Vec<u32>,
    constant_arrays_by_id: HashMap<u32, (usize, usize)>,
    data_types: Vec<DataTypeRef>,
    optimization_level: u8,
    nativized_provider: Option<Box<dyn RuntimeOpcodeProvider>>,
}

impl Program {
    pub fn new() -> Self {
        Program {
            modules: Vec::new(),
            functions_by_id: HashMap::new(),
            script_function_ids: Vec::new(),
            functions_by_signature: HashMap::new(),
            functions_by_name: HashMap::new(),
            variables_by_index: HashMap::new(),
            variables_by_name: HashMap::new(),
            global_variable_order: Vec::new(),
            constant_arrays_by_id: HashMap::new(),
            data_types: PredefinedDataTypes::all().to_vec(),
            optimization_level: 3,
            nativized_provider: None,
        }
    }

    pub fn optimization_level(&self) -> u8 {
        self.optimization_level
    }

    pub fn set_optimization_level(&mut self, level: u8) {
        self.optimization_level = level;
    }

    pub fn nativized_provider(&self) -> Option<&dyn RuntimeOpcodeProvider> {
        self.nativized_provider.as_deref()
    }

    pub fn set_nativized_provider(&mut self, provider: Box<dyn RuntimeOpcodeProvider>) {
        self.nativized_provider = Some(provider);
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Link a module into the program, taking ownership. The module's IDs
    /// must have been allocated against the same globals lookup the
    /// previous modules registered into.
    pub fn add_module(&mut self, module: Module) {
        let module_index = self.modules.len();

        for slot in module.function_order() {
            let info = match slot {
                FunctionSlot::Script(index) => &module.script_functions()[*index].info,
                FunctionSlot::Native(index) => &module.native_functions()[*index].info,
            };
            self.functions_by_id.insert(info.id, (module_index, *slot));
            if matches!(slot, FunctionSlot::Script(_)) {
                self.script_function_ids.push(info.id);
            }
            // Later modules shadow earlier ones: most-derived first.
            self.functions_by_signature
                .entry(info.name_and_signature_hash())
                .or_default()
                .insert(0, info.id);
            self.functions_by_name
                .entry(info.name.hash())
                .or_default()
                .insert(0, info.id);
            for alias in &info.alias_names {
                self.functions_by_signature
                    .entry(lemon_core::name_and_signature_hash(
                        alias.name.hash(),
                        info.signature_hash,
                    ))
                    .or_default()
                    .insert(0, info.id);
                self.functions_by_name
                    .entry(alias.name.hash())
                    .or_default()
                    .insert(0, info.id);
            }
        }

        for (variable_index, variable) in module.global_variables().iter().enumerate() {
            let index = variable_index_of_id(variable.id());
            self.variables_by_index
                .insert(index, (module_index, variable_index));
            self.variables_by_name
                .insert(variable.name().hash(), variable.id());
            self.global_variable_order.push(variable.id());
        }

        for (array_index, array) in module.constant_arrays().iter().enumerate() {
            self.constant_arrays_by_id
                .insert(array.info.id, (module_index, array_index));
        }

        for data_type in module.data_types() {
            self.data_types.push(data_type.clone());
        }

        self.modules.push(module);
    }

    // --- functions ---

    pub fn function_by_id(&self, id: u32) -> Option<Function<'_>> {
        let (module_index, slot) = self.functions_by_id.get(&id)?;
        let module = &self.modules[*module_index];
        Some(match slot {
            FunctionSlot::Script(index) => Function::Script(module.script_function(*index)?),
            FunctionSlot::Native(index) => Function::Native(module.native_function(*index)?),
        })
    }

    /// Function with the given name-and-signature hash. `index` walks the
    /// shadowing chain: 0 is the most-derived, 1 its base, and so on.
    pub fn function_by_signature(&self, name_and_signature_hash: u64, index: usize) -> Option<Function<'_>> {
        let ids = self.functions_by_signature.get(&name_and_signature_hash)?;
        self.function_by_id(*ids.get(index)?)
    }

    pub fn functions_by_name(&self, name_hash: u64) -> Vec<Function<'_>> {
        match self.functions_by_name.get(&name_hash) {
            Some(ids) => ids.iter().filter_map(|id| self.function_by_id(*id)).collect(),
            None => Vec::new(),
        }
    }

    /// Script function IDs in link order.
    pub fn script_function_ids(&self) -> &[u32] {
        &self.script_function_ids
    }

    pub fn script_function_by_id(&self, id: u32) -> Option<&crate::function::ScriptFunction> {
        self.function_by_id(id)?.as_script()
    }

    // --- variables ---

    pub fn global_variable_by_id(&self, variable_id: u32) -> Option<&Variable> {
        let (module_index, variable_index) = self
            .variables_by_index
            .get(&variable_index_of_id(variable_id))?;
        self.modules[*module_index]
            .global_variables()
            .get(*variable_index)
    }

    pub fn global_variable_by_name(&self, name_hash: u64) -> Option<&Variable> {
        self.global_variable_by_id(*self.variables_by_name.get(&name_hash)?)
    }

    /// All global variables in link/declaration order.
    pub fn global_variables(&self) -> impl Iterator<Item = &Variable> {
        self.global_variable_order
            .iter()
            .filter_map(|id| self.global_variable_by_id(*id))
    }

    // --- constant arrays ---

    pub fn constant_array_by_id(&self, id: u32) -> Option<&ConstantArray> {
        let (module_index, array_index) = self.constant_arrays_by_id.get(&id)?;
        self.modules[*module_index].constant_arrays().get(*array_index)
    }

    // --- defines ---

    pub fn defines(&self) -> impl Iterator<Item = &Define> {
        self.modules.iter().flat_map(|module| module.defines().iter())
    }

    // --- data types ---

    pub fn data_types(&self) -> &[DataTypeRef] {
        &self.data_types
    }

    pub fn data_type_by_id(&self, id: u16) -> Option<DataTypeRef> {
        self.data_types
            .iter()
            .find(|data_type| data_type.id() == id)
            .cloned()
    }

    // --- string literals ---

    /// Load every module's string literals into a runtime string table.
    pub fn collect_all_string_literals(&self, strings: &mut lemon_core::StringLookup) {
        for module in &self.modules {
            for literal in module.string_literals() {
                strings.add_with_hash(literal.as_str(), literal.hash());
            }
        }
    }
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lemon_core::{FlyweightString, FunctionParameter, GlobalsLookup};

    fn module_with_function(name: &str, function: &str, lookup: &GlobalsLookup) -> Module {
        let mut module = Module::new(name);
        module.start_compiling(lookup);
        module.add_script_function(
            FlyweightString::new(function),
            PredefinedDataTypes::void(),
            Vec::<FunctionParameter>::new(),
            Vec::new(),
        );
        module
    }

    #[test]
    fn test_function_indexes() {
        let mut lookup = GlobalsLookup::new();
        let mut program = Program::new();
        let module = module_with_function("base", "update", &lookup);
        crate::module::add_definitions_from_module(&mut lookup, &module);
        program.add_module(module);

        let name_hash = FlyweightString::new("update").hash();
        let functions = program.functions_by_name(name_hash);
        assert_eq!(functions.len(), 1);
        let info = functions[0].info();
        assert!(program
            .function_by_signature(info.name_and_signature_hash(), 0)
            .is_some());
        assert_eq!(program.script_function_ids().len(), 1);
    }

    #[test]
    fn test_later_module_shadows_earlier() {
        let mut lookup = GlobalsLookup::new();
        let mut program = Program::new();
        let base = module_with_function("base", "update", &lookup);
        crate::module::add_definitions_from_module(&mut lookup, &base);
        let base_id = base.script_functions()[0].info.id;
        program.add_module(base);

        let of_mod = module_with_function("mod", "update", &lookup);
        let mod_id = of_mod.script_functions()[0].info.id;
        program.add_module(of_mod);
        assert_ne!(base_id, mod_id);

        let hash = {
            let function = program.function_by_id(mod_id).unwrap();
            function.info().name_and_signature_hash()
        };
        // Index 0 is the most-derived (the mod), index 1 the base.
        assert_eq!(
            program.function_by_signature(hash, 0).unwrap().info().id,
            mod_id
        );
        assert_eq!(
            program.function_by_signature(hash, 1).unwrap().info().id,
            base_id
        );
        assert!(program.function_by_signature(hash, 2).is_none());
    }

    #[test]
    fn test_variable_lookup() {
        let mut lookup = GlobalsLookup::new();
        let mut program = Program::new();
        let mut module = Module::new("vars");
        module.start_compiling(&lookup);
        let id = module
            .add_global_variable(FlyweightString::new("score"), PredefinedDataTypes::u32())
            .info
            .id;
        crate::module::add_definitions_from_module(&mut lookup, &module);
        program.add_module(module);

        assert_eq!(program.global_variable_by_id(id).unwrap().id(), id);
        assert_eq!(
            program
                .global_variable_by_name(FlyweightString::new("score").hash())
                .unwrap()
                .id(),
            id
        );
        assert_eq!(program.global_variables().count(), 1);
    }

    #[test]
    fn test_data_types_include_predefined() {
        let program = Program::new();
        assert!(program.data_type_by_id(0).unwrap().is_void());
        assert_eq!(program.data_type_by_id(12).unwrap().name().as_str(), "string");
    }
}
