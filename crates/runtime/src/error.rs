//! Runtime error types
//!
//! The VM hot path never unwinds. Fatal problems during runtime-function
//! building latch `encountered_build_error` on the runtime and turn further
//! execution into `Halt`; problems during execution are reported through
//! these types and the execute result.

use std::fmt;

use lemon_core::ReadError;

/// Fatal error while translating bytecode into runtime opcodes.
#[derive(Debug, Clone)]
pub enum BuildError {
    /// An opcode type/data type combination with no exec function.
    UnsupportedOpcode(String),
    /// Structurally broken bytecode (bad variable ID, jump out of range).
    CorruptBytecode(String),
    /// A runtime opcode's parameter block exceeded the hard limit.
    ParameterTooLarge(usize),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::UnsupportedOpcode(msg) => write!(f, "unsupported opcode: {}", msg),
            BuildError::CorruptBytecode(msg) => write!(f, "corrupt bytecode: {}", msg),
            BuildError::ParameterTooLarge(size) => {
                write!(f, "runtime opcode parameter of {} bytes exceeds the limit", size)
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Errors reported by runtime entry points outside the opcode loop.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    NoProgram,
    UnknownFunction(String),
    UnknownLabel(String),
    /// The local-variable buffer is full, usually due to runaway recursion.
    VariableStackOverflow,
    InvalidVariable(u32),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NoProgram => write!(f, "no program loaded"),
            RuntimeError::UnknownFunction(name) => write!(f, "unknown function '{}'", name),
            RuntimeError::UnknownLabel(name) => write!(f, "unknown label '{}'", name),
            RuntimeError::VariableStackOverflow => {
                write!(f, "reached var stack limit, possibly due to recursive function calls")
            }
            RuntimeError::InvalidVariable(id) => write!(f, "invalid variable ID {:#010x}", id),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Error while reading or writing a serialized module or save state.
#[derive(Debug)]
pub enum SerializeError {
    /// Signature, version, dependency hash or app version mismatch.
    IncompatibleFormat(String),
    /// zlib decompression failed.
    Decompression,
    Read(ReadError),
    /// Save state references a function the loaded program doesn't have.
    UnmatchedFunction(String),
    Io(std::io::Error),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::IncompatibleFormat(msg) => write!(f, "incompatible format: {}", msg),
            SerializeError::Decompression => write!(f, "decompression failed"),
            SerializeError::Read(err) => write!(f, "read error: {}", err),
            SerializeError::UnmatchedFunction(name) => {
                write!(f, "could not match function signature for script function of name '{}'", name)
            }
            SerializeError::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl std::error::Error for SerializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializeError::Read(err) => Some(err),
            SerializeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ReadError> for SerializeError {
    fn from(err: ReadError) -> Self {
        SerializeError::Read(err)
    }
}

impl From<std::io::Error> for SerializeError {
    fn from(err: std::io::Error) -> Self {
        SerializeError::Io(err)
    }
}
