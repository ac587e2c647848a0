//! Nativized opcode provider
//!
//! Interface to the ahead-of-time nativizer: a lookup dictionary maps a
//! hash over an opcode pattern (types plus data types) to a precompiled
//! exec function. When a pattern matches a prefix of the opcodes being
//! translated, one runtime opcode is emitted whose parameters are filled
//! from the matched opcodes, and the whole run is consumed. The code
//! generator that fills the dictionary lives outside this crate.

use std::collections::HashMap;

use lemon_core::Opcode;

use crate::error::BuildError;
use crate::exec::ExecFn;
use crate::runtime_function::{
    BuildEnv, RuntimeOpcodeBuffer, RuntimeOpcodeProvider, MAX_PARAMETER_SIZE,
};

/// Where one parameter of a nativized opcode comes from.
#[derive(Debug, Clone, Copy)]
pub struct NativizedParameter {
    /// Index of the source opcode within the matched run.
    pub source_opcode: usize,
    /// Byte offset inside the runtime opcode's parameter block.
    pub dest_offset: usize,
}

/// One precompiled entry.
pub struct NativizedEntry {
    pub exec_fn: ExecFn,
    /// Number of opcodes this entry replaces.
    pub consumed: usize,
    pub parameters: Vec<NativizedParameter>,
}

/// Hash of an opcode pattern: type and data type of each opcode, in order.
/// Parameters are deliberately not hashed; entries bake parameter *slots*,
/// not values.
pub fn hash_opcode_pattern(opcodes: &[Opcode]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for opcode in opcodes {
        for byte in [opcode.opcode_type as u8, opcode.data_type as u8] {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// The dictionary filled by a nativizer build function.
#[derive(Default)]
pub struct LookupDictionary {
    entries: HashMap<u64, NativizedEntry>,
    /// Longest pattern in the dictionary, bounding the match search.
    max_consumed: usize,
}

impl LookupDictionary {
    pub fn new() -> Self {
        LookupDictionary::default()
    }

    pub fn add_entry(&mut self, pattern: &[Opcode], exec_fn: ExecFn, parameters: Vec<NativizedParameter>) {
        self.max_consumed = self.max_consumed.max(pattern.len());
        self.entries.insert(
            hash_opcode_pattern(pattern),
            NativizedEntry {
                exec_fn,
                consumed: pattern.len(),
                parameters,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Provider backed by a [`LookupDictionary`].
pub struct NativizedOpcodeProvider {
    dictionary: LookupDictionary,
}

impl NativizedOpcodeProvider {
    pub fn new(build_function: impl FnOnce(&mut LookupDictionary)) -> Self {
        let mut dictionary = LookupDictionary::new();
        build_function(&mut dictionary);
        NativizedOpcodeProvider { dictionary }
    }

    pub fn from_dictionary(dictionary: LookupDictionary) -> Self {
        NativizedOpcodeProvider { dictionary }
    }

    pub fn is_valid(&self) -> bool {
        !self.dictionary.is_empty()
    }
}

impl RuntimeOpcodeProvider for NativizedOpcodeProvider {
    fn build_runtime_opcode(
        &self,
        buffer: &mut RuntimeOpcodeBuffer,
        opcodes: &[Opcode],
        _first_opcode_index: usize,
        _env: &mut BuildEnv<'_>,
    ) -> Result<Option<usize>, BuildError> {
        if self.dictionary.is_empty() {
            return Ok(None);
        }

        // Longest match first.
        let longest = self.dictionary.max_consumed.min(opcodes.len());
        for length in (2..=longest).rev() {
            let hash = hash_opcode_pattern(&opcodes[..length]);
            let Some(entry) = self.dictionary.entries.get(&hash) else {
                continue;
            };
            if entry.consumed != length {
                continue;
            }

            let param_size = entry
                .parameters
                .iter()
                .map(|parameter| parameter.dest_offset + 8)
                .max()
                .unwrap_or(0);
            if param_size > MAX_PARAMETER_SIZE {
                return Err(BuildError::ParameterTooLarge(param_size));
            }

            let mut params = vec![0u8; param_size];
            for parameter in &entry.parameters {
                let value = opcodes[parameter.source_opcode].parameter as u64;
                params[parameter.dest_offset..parameter.dest_offset + 8]
                    .copy_from_slice(&value.to_le_bytes());
            }

            buffer.add_opcode(entry.exec_fn, opcodes[0].opcode_type, &params)?;
            return Ok(Some(length));
        }

        Ok(None)
    }
}
