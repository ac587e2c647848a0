//! Runtime opcode providers
//!
//! Three translation tiers feed the runtime-function builder, tried in
//! order: the nativized provider (host-registered specializations), the
//! optimized fuser (the fixed catalogue of two-opcode merges), and the
//! one-to-one default translation in `runtime_function`.

pub mod nativized;
pub mod optimized;

pub use nativized::{LookupDictionary, NativizedEntry, NativizedOpcodeProvider, NativizedParameter};
