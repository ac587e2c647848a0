//! Module binary format
//!
//! `"LMD|"` + u16 format version + u32 dependency hash + u32 app version,
//! followed by the zlib-compressed payload. All three header fields must
//! match on read, before decompression is even attempted. Versions below
//! the minimum are rejected; there is no backward-compat reading.
//!
//! Opcodes are packed into a u16 type-and-flags word: 6 bits type, 3 bits
//! parameter encoding, a data-type presence bit, a sequence-break bit, and
//! 5 bits of line-number delta (31 = explicit u32 follows).

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use lemon_core::{
    AliasName, AnyBaseValue, BaseType, BinaryReader, BinaryWriter, DataTypeClass, DataTypeRef,
    FunctionKind, FunctionParameter, GlobalsLookup, Opcode, OpcodeFlags, OpcodeType, ReadError,
    SignatureBuilder, TokenSerializer, VariableKind,
};

use crate::error::SerializeError;
use crate::module::{FunctionSlot, Module};

const SIGNATURE: &[u8; 4] = b"LMD|";
const CURRENT_VERSION: u16 = 0x10;
const MINIMUM_VERSION: u16 = 0x10;

// Function flag byte.
const FLAG_NATIVE_FUNCTION: u8 = 0x01;
const FLAG_HAS_ALIAS_NAMES: u8 = 0x02;
const FLAG_HAS_RETURN_TYPE: u8 = 0x04;
const FLAG_HAS_PARAMETERS: u8 = 0x08;
const FLAG_HAS_LABELS: u8 = 0x10;
const FLAG_HAS_ADDRESS_HOOKS: u8 = 0x20;
const FLAG_HAS_PRAGMAS: u8 = 0x40;

/// Serialize a module into the on-disk format.
pub fn serialize_module(
    module: &Module,
    lookup: &GlobalsLookup,
    dependency_hash: u32,
    app_version: u32,
) -> Result<Vec<u8>, SerializeError> {
    let _ = lookup; // Data types are written as IDs; nothing to resolve.

    let mut payload = BinaryWriter::new();
    write_payload(module, &mut payload)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(5));
    encoder.write_all(payload.as_slice())?;
    let compressed = encoder.finish()?;

    let mut writer = BinaryWriter::new();
    writer.write_bytes(SIGNATURE);
    writer.write_u16(CURRENT_VERSION);
    writer.write_u32(dependency_hash);
    writer.write_u32(app_version);
    writer.write_bytes(&compressed);
    Ok(writer.into_vec())
}

/// Deserialize into a module that already carries the host-registered
/// native functions and user-defined/external variables. Nothing is
/// mutated when the header does not match.
pub fn deserialize_module(
    module: &mut Module,
    lookup: &GlobalsLookup,
    data: &[u8],
    dependency_hash: u32,
    app_version: u32,
) -> Result<(), SerializeError> {
    let mut reader = BinaryReader::new(data);
    let signature = reader.read_bytes(4)?;
    if signature != SIGNATURE {
        return Err(SerializeError::IncompatibleFormat("bad signature".into()));
    }
    let version = reader.read_u16()?;
    if version < MINIMUM_VERSION || version > CURRENT_VERSION {
        return Err(SerializeError::IncompatibleFormat(format!(
            "unsupported format version {:#06x}",
            version
        )));
    }
    if reader.read_u32()? != dependency_hash {
        return Err(SerializeError::IncompatibleFormat(
            "dependency hash mismatch".into(),
        ));
    }
    if reader.read_u32()? != app_version {
        return Err(SerializeError::IncompatibleFormat(
            "app version mismatch".into(),
        ));
    }

    let mut decoder = ZlibDecoder::new(reader.remaining());
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .map_err(|_| SerializeError::Decompression)?;

    read_payload(module, lookup, &payload)
}

fn write_data_type(writer: &mut BinaryWriter, data_type: &DataTypeRef) {
    writer.write_u16(data_type.id());
}

fn read_data_type(
    reader: &mut BinaryReader<'_>,
    lookup: &GlobalsLookup,
) -> Result<DataTypeRef, SerializeError> {
    let id = reader.read_u16()?;
    lookup
        .data_type_by_id(id)
        .ok_or_else(|| SerializeError::Read(ReadError::InvalidData(format!("unknown data type ID {}", id))))
}

fn write_payload(module: &Module, writer: &mut BinaryWriter) -> Result<(), SerializeError> {
    writer.write_u32(module.first_function_id());
    writer.write_u32(module.first_variable_id());

    // Source file infos.
    writer.write_u16(module.source_files().len() as u16);
    for source_file in module.source_files() {
        writer.write_str(&source_file.filename);
    }

    // Preprocessor definitions.
    writer.write_u16(module.preprocessor_definitions().len() as u16);
    for constant in module.preprocessor_definitions() {
        writer.write_flyweight(&constant.name);
        writer.write_u64(constant.value.raw());
    }

    write_functions(module, writer)?;

    // Global variables: user-defined/external first, then plain globals.
    let user_defined = module
        .global_variables()
        .iter()
        .take_while(|variable| variable.kind() != VariableKind::Global)
        .count();
    for variable in &module.global_variables()[user_defined..] {
        if variable.kind() != VariableKind::Global {
            return Err(SerializeError::IncompatibleFormat(
                "mix of global variables and others".into(),
            ));
        }
    }
    writer.write_u32(user_defined as u32);
    writer.write_u32((module.global_variables().len() - user_defined) as u32);
    for variable in &module.global_variables()[user_defined..] {
        writer.write_flyweight(variable.name());
        write_data_type(writer, variable.data_type());
        writer.write_i64(variable.initial_value().get::<i64>());
    }

    // Constants.
    writer.write_u16(module.constants().len() as u16);
    for constant in module.constants() {
        writer.write_flyweight(&constant.name);
        write_data_type(writer, &constant.data_type);
        writer.write_u64(constant.value.raw());
    }

    // Constant arrays.
    writer.write_u16(module.constant_arrays().len() as u16);
    writer.write_u16(module.num_global_constant_arrays() as u16);
    for array in module.constant_arrays() {
        writer.write_flyweight(&array.info.name);
        write_data_type(writer, &array.info.element_type);
        let width = array.info.element_type.bytes().max(1);
        writer.write_u32(array.values.len() as u32);
        for value in &array.values {
            writer.write_bytes(&value.raw().to_le_bytes()[..width]);
        }
    }

    // Defines.
    writer.write_u16(module.defines().len() as u16);
    for define in module.defines() {
        writer.write_flyweight(&define.name);
        write_data_type(writer, &define.data_type);
        TokenSerializer::write_token_list(writer, &define.content).map_err(|error| {
            SerializeError::IncompatibleFormat(format!("define '{}': {}", define.name, error))
        })?;
    }

    // String literals.
    writer.write_u32(module.string_literals().len() as u32);
    for literal in module.string_literals() {
        writer.write_flyweight(literal);
    }

    // Custom data types. Array types have no serialized form.
    let custom_types: Vec<_> = module
        .data_types()
        .iter()
        .filter(|data_type| data_type.class() == DataTypeClass::Custom)
        .collect();
    if custom_types.len() != module.data_types().len() {
        return Err(SerializeError::IncompatibleFormat(
            "array data types are not supported in serialization".into(),
        ));
    }
    writer.write_u16(custom_types.len() as u16);
    for data_type in custom_types {
        writer.write_flyweight(data_type.name());
        writer.write_u8(data_type.base_type() as u8);
    }

    Ok(())
}

fn write_functions(module: &Module, writer: &mut BinaryWriter) -> Result<(), SerializeError> {
    writer.write_u32(module.function_order().len() as u32);

    let mut last_line_number = 0u32;
    for slot in module.function_order() {
        let (info, script) = match slot {
            FunctionSlot::Script(index) => {
                let function = &module.script_functions()[*index];
                (&function.info, Some(function))
            }
            FunctionSlot::Native(index) => (&module.native_functions()[*index].info, None),
        };

        let mut flags = 0u8;
        if info.kind == FunctionKind::Native {
            flags |= FLAG_NATIVE_FUNCTION;
        }
        if !info.alias_names.is_empty() {
            flags |= FLAG_HAS_ALIAS_NAMES;
        }
        if !info.return_type.is_void() {
            flags |= FLAG_HAS_RETURN_TYPE;
        }
        if !info.parameters.is_empty() {
            flags |= FLAG_HAS_PARAMETERS;
        }
        if let Some(function) = script {
            if !function.labels.is_empty() {
                flags |= FLAG_HAS_LABELS;
            }
            if !function.info.address_hooks.is_empty() {
                flags |= FLAG_HAS_ADDRESS_HOOKS;
            }
            if !function.pragmas.is_empty() {
                flags |= FLAG_HAS_PRAGMAS;
            }
        }
        writer.write_u8(flags);
        writer.write_flyweight(&info.name);

        if flags & FLAG_HAS_ALIAS_NAMES != 0 {
            writer.write_u8(info.alias_names.len() as u8);
            for alias in &info.alias_names {
                writer.write_flyweight(&alias.name);
                writer.write_u8(alias.is_deprecated as u8);
            }
        }
        if flags & FLAG_HAS_RETURN_TYPE != 0 {
            write_data_type(writer, &info.return_type);
        }
        if flags & FLAG_HAS_PARAMETERS != 0 {
            writer.write_u8(info.parameters.len() as u8);
            for parameter in &info.parameters {
                writer.write_flyweight(&parameter.name);
                write_data_type(writer, &parameter.data_type);
            }
        }

        let Some(function) = script else {
            continue;
        };

        // Source information.
        writer.write_u16(function.source_file_index as u16);
        writer.write_u32(function.source_base_line_offset);

        // Opcodes.
        writer.write_u32(function.opcodes.len() as u32);
        for opcode in &function.opcodes {
            let parameter = opcode.parameter;
            let parameter_bits: u8 = if parameter == 0 {
                0
            } else if parameter == 1 {
                1
            } else if parameter == -1 {
                2
            } else if parameter == (parameter as i8) as i64 {
                3
            } else if parameter == (parameter as i16) as i64 {
                4
            } else if parameter == (parameter as i32) as i64 {
                5
            } else if parameter == (parameter as u32) as i64 {
                6
            } else {
                7
            };
            let has_data_type = opcode.data_type != opcode.opcode_type.default_base_type();
            let is_sequence_break = opcode.flags.contains(OpcodeFlags::SEQ_BREAK);
            let line_number_bits: u8 = if opcode.line_number >= last_line_number
                && opcode.line_number < last_line_number + 31
            {
                (opcode.line_number - last_line_number) as u8
            } else {
                31
            };

            let type_and_flags = (opcode.opcode_type as u16)
                | ((parameter_bits as u16) << 6)
                | ((has_data_type as u16) * 0x200)
                | ((is_sequence_break as u16) * 0x400)
                | ((line_number_bits as u16) << 11);
            writer.write_u16(type_and_flags);

            match parameter_bits {
                3 => writer.write_i8(parameter as i8),
                4 => writer.write_i16(parameter as i16),
                5 => writer.write_i32(parameter as i32),
                6 => writer.write_u32(parameter as u32),
                7 => writer.write_i64(parameter),
                _ => {}
            }
            if has_data_type {
                writer.write_u8(opcode.data_type as u8);
            }
            if line_number_bits == 31 {
                writer.write_u32(opcode.line_number);
            }
            last_line_number = opcode.line_number;
        }

        // Local variables.
        writer.write_u32(function.local_variables.len() as u32);
        for variable in &function.local_variables {
            writer.write_flyweight(&variable.info.name);
            write_data_type(writer, &variable.info.data_type);
        }

        if flags & FLAG_HAS_LABELS != 0 {
            writer.write_u32(function.labels.len() as u32);
            for label in &function.labels {
                writer.write_flyweight(&label.name);
                writer.write_u32(label.offset);
            }
        }
        if flags & FLAG_HAS_ADDRESS_HOOKS != 0 {
            writer.write_u32(function.info.address_hooks.len() as u32);
            for hook in &function.info.address_hooks {
                writer.write_u32(*hook);
            }
        }
        if flags & FLAG_HAS_PRAGMAS != 0 {
            writer.write_u32(function.pragmas.len() as u32);
            for pragma in &function.pragmas {
                writer.write_str(pragma);
            }
        }
    }
    Ok(())
}

fn read_payload(
    module: &mut Module,
    lookup: &GlobalsLookup,
    payload: &[u8],
) -> Result<(), SerializeError> {
    let mut reader = BinaryReader::new(payload);

    let _first_function_id = reader.read_u32()?;
    let _first_variable_id = reader.read_u32()?;

    // Source file infos.
    let source_file_count = reader.read_u16()? as usize;
    for _ in 0..source_file_count {
        let filename = reader.read_str()?;
        module.add_source_file_info("", &filename);
    }

    // Preprocessor definitions.
    let preprocessor_count = reader.read_u16()? as usize;
    for _ in 0..preprocessor_count {
        let name = reader.read_flyweight()?;
        let value = reader.read_u64()? as i64;
        module.add_preprocessor_definition(name, value);
    }

    read_functions(module, lookup, &mut reader)?;

    // Global variables.
    let user_defined = reader.read_u32()? as usize;
    if module.global_variables().len() != user_defined {
        return Err(SerializeError::IncompatibleFormat(format!(
            "expected {} user-defined variables, module has {}",
            user_defined,
            module.global_variables().len()
        )));
    }
    let global_count = reader.read_u32()? as usize;
    for _ in 0..global_count {
        let name = reader.read_flyweight()?;
        let data_type = read_data_type(&mut reader, lookup)?;
        let initial_value = reader.read_i64()?;
        let variable = module.add_global_variable(name, data_type);
        variable.set_initial_value(AnyBaseValue::from(initial_value));
    }

    // Constants.
    let constant_count = reader.read_u16()? as usize;
    for _ in 0..constant_count {
        let name = reader.read_flyweight()?;
        let data_type = read_data_type(&mut reader, lookup)?;
        let value = AnyBaseValue::from_raw(reader.read_u64()?);
        module.add_constant(name, data_type, value);
    }

    // Constant arrays.
    let array_count = reader.read_u16()? as usize;
    let global_array_count = reader.read_u16()? as usize;
    for index in 0..array_count {
        let name = reader.read_flyweight()?;
        let element_type = read_data_type(&mut reader, lookup)?;
        let width = element_type.bytes().max(1);
        let value_count = reader.read_u32()? as usize;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let bytes = reader.read_bytes(width)?;
            let mut cell = [0u8; 8];
            cell[..width].copy_from_slice(bytes);
            values.push(AnyBaseValue::from_raw(u64::from_le_bytes(cell)));
        }
        module.add_constant_array(name, element_type, values, index < global_array_count);
    }

    // Defines.
    let define_count = reader.read_u16()? as usize;
    for _ in 0..define_count {
        let name = reader.read_flyweight()?;
        let data_type = read_data_type(&mut reader, lookup)?;
        let content = TokenSerializer::read_token_list(&mut reader, lookup)?;
        module.add_define(name, data_type, content);
    }

    // String literals.
    let literal_count = reader.read_u32()? as usize;
    for _ in 0..literal_count {
        module.add_string_literal(reader.read_flyweight()?);
    }

    // Custom data types.
    let data_type_count = reader.read_u16()? as usize;
    for _ in 0..data_type_count {
        let name = reader.read_flyweight()?;
        let base_type_raw = reader.read_u8()?;
        let base_type = BaseType::from_u8(base_type_raw).ok_or_else(|| {
            SerializeError::Read(ReadError::InvalidData(format!(
                "unknown base type {:#04x}",
                base_type_raw
            )))
        })?;
        module.add_custom_data_type(name.as_str(), base_type);
    }

    Ok(())
}

fn read_functions(
    module: &mut Module,
    lookup: &GlobalsLookup,
    reader: &mut BinaryReader<'_>,
) -> Result<(), SerializeError> {
    let function_count = reader.read_u32()? as usize;
    let mut last_line_number = 0u32;

    for _ in 0..function_count {
        let flags = reader.read_u8()?;
        let name = reader.read_flyweight()?;

        let mut alias_names = Vec::new();
        if flags & FLAG_HAS_ALIAS_NAMES != 0 {
            let alias_count = reader.read_u8()? as usize;
            for _ in 0..alias_count {
                let alias = reader.read_flyweight()?;
                let is_deprecated = reader.read_u8()? != 0;
                alias_names.push(AliasName {
                    name: alias,
                    is_deprecated,
                });
            }
        }

        let return_type = if flags & FLAG_HAS_RETURN_TYPE != 0 {
            read_data_type(reader, lookup)?
        } else {
            lemon_core::PredefinedDataTypes::void()
        };

        let mut parameters = Vec::new();
        if flags & FLAG_HAS_PARAMETERS != 0 {
            let parameter_count = reader.read_u8()? as usize;
            for _ in 0..parameter_count {
                let parameter_name = reader.read_flyweight()?;
                let data_type = read_data_type(reader, lookup)?;
                parameters.push(FunctionParameter {
                    name: parameter_name,
                    data_type,
                });
            }
        }

        if flags & FLAG_NATIVE_FUNCTION != 0 {
            // Native functions must already be registered by the host;
            // verify name and signature line up.
            let mut builder = SignatureBuilder::new(&return_type);
            for parameter in &parameters {
                builder.add_parameter_type(&parameter.data_type);
            }
            if module
                .native_function_by_name_and_signature(name.hash(), builder.finish())
                .is_none()
            {
                return Err(SerializeError::IncompatibleFormat(format!(
                    "native function '{}' is not registered with a matching signature",
                    name
                )));
            }
            continue;
        }

        let source_file_index = reader.read_u16()? as usize;
        let source_base_line_offset = reader.read_u32()?;

        let opcode_count = reader.read_u32()? as usize;
        let mut opcodes = Vec::with_capacity(opcode_count);
        for _ in 0..opcode_count {
            let type_and_flags = reader.read_u16()?;
            let opcode_type = OpcodeType::from_u8((type_and_flags & 0x3f) as u8).ok_or_else(|| {
                SerializeError::Read(ReadError::InvalidData(format!(
                    "unknown opcode type {}",
                    type_and_flags & 0x3f
                )))
            })?;
            let parameter_bits = ((type_and_flags >> 6) & 0x07) as u8;
            let has_data_type = type_and_flags & 0x200 != 0;
            let is_sequence_break = type_and_flags & 0x400 != 0;
            let line_number_bits = ((type_and_flags >> 11) & 0x1f) as u8;

            let parameter: i64 = match parameter_bits {
                0 => 0,
                1 => 1,
                2 => -1,
                3 => reader.read_i8()? as i64,
                4 => reader.read_i16()? as i64,
                5 => reader.read_i32()? as i64,
                6 => reader.read_u32()? as i64,
                _ => reader.read_i64()?,
            };

            let data_type = if has_data_type {
                let raw = reader.read_u8()?;
                BaseType::from_u8(raw).ok_or_else(|| {
                    SerializeError::Read(ReadError::InvalidData(format!(
                        "unknown base type {:#04x}",
                        raw
                    )))
                })?
            } else {
                opcode_type.default_base_type()
            };

            let line_number = if line_number_bits == 31 {
                reader.read_u32()?
            } else {
                last_line_number + line_number_bits as u32
            };
            last_line_number = line_number;

            let mut opcode = Opcode::new(opcode_type, data_type, parameter, line_number);
            if is_sequence_break {
                opcode.flags |= OpcodeFlags::SEQ_BREAK;
            }
            opcodes.push(opcode);
        }

        let mut local_variables = Vec::new();
        let local_count = reader.read_u32()? as usize;
        for _ in 0..local_count {
            let local_name = reader.read_flyweight()?;
            let data_type = read_data_type(reader, lookup)?;
            local_variables.push((local_name, data_type));
        }

        let mut labels = Vec::new();
        if flags & FLAG_HAS_LABELS != 0 {
            let label_count = reader.read_u32()? as usize;
            for _ in 0..label_count {
                let label_name = reader.read_flyweight()?;
                let offset = reader.read_u32()?;
                labels.push((label_name, offset));
            }
        }

        let mut address_hooks = Vec::new();
        if flags & FLAG_HAS_ADDRESS_HOOKS != 0 {
            let hook_count = reader.read_u32()? as usize;
            for _ in 0..hook_count {
                address_hooks.push(reader.read_u32()?);
            }
        }

        let mut pragmas = Vec::new();
        if flags & FLAG_HAS_PRAGMAS != 0 {
            let pragma_count = reader.read_u32()? as usize;
            for _ in 0..pragma_count {
                pragmas.push(reader.read_str()?);
            }
        }

        let function = module.add_script_function(name, return_type, parameters, alias_names);
        function.source_file_index = source_file_index;
        function.source_base_line_offset = source_base_line_offset;
        function.opcodes = opcodes;
        for (local_name, data_type) in local_variables {
            function.add_local_variable(local_name, data_type, 0);
        }
        for (label_name, offset) in labels {
            function.add_label(label_name, offset);
        }
        function.info.address_hooks = address_hooks;
        function.pragmas = pragmas;
    }
    Ok(())
}
