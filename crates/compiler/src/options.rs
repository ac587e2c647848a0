//! Compile options
//!
//! The option set is fixed and small, so it is a plain record with
//! enum-valued fields rather than anything dynamic. Hosts build one per
//! compilation and hand it to the token processor.

use lemon_core::{DataTypeRef, PredefinedDataTypes};

/// How aggressively the runtime-function builder may fuse opcodes.
/// Level 0 disables all fusion, level 1 enables the optimized fuser,
/// level 2 additionally enables nativized specializations.
pub type OptimizationLevel = u8;

#[derive(Clone)]
pub struct CompileOptions {
    /// Language feature gate; string operators require level 2.
    pub script_feature_level: u32,
    pub optimization_level: OptimizationLevel,
    /// Remove pragmas from functions once the compiler consumed them.
    pub consume_processed_pragmas: bool,
    /// Data type of addresses passed to `external_call`/`external_jump`.
    pub external_address_type: DataTypeRef,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            script_feature_level: 2,
            optimization_level: 3,
            consume_processed_pragmas: false,
            external_address_type: PredefinedDataTypes::u32(),
        }
    }
}
