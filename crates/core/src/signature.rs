//! Function signature hashing
//!
//! A function's signature hash is a 32-bit digest of its return type and
//! parameter types. Together with the 64-bit name hash it indexes overload
//! sets: `name_and_signature_hash = name_hash + signature_hash` (wrapping).
//! The hash is salted with a format version so that signature changes in
//! the type encoding invalidate old serialized references.

use crate::data_type::DataTypeRef;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Bumped whenever the signature encoding changes.
const SIGNATURE_FORMAT_SALT: u32 = 0x10;

/// Incremental builder over return and parameter types.
pub struct SignatureBuilder {
    hash: u32,
}

impl SignatureBuilder {
    /// Start a signature with the given return type.
    pub fn new(return_type: &DataTypeRef) -> Self {
        let mut builder = SignatureBuilder {
            hash: FNV_OFFSET ^ SIGNATURE_FORMAT_SALT,
        };
        builder.feed_u16(return_type.id());
        builder
    }

    pub fn add_parameter_type(&mut self, data_type: &DataTypeRef) {
        self.feed_u16(data_type.id());
    }

    pub fn finish(&self) -> u32 {
        self.hash
    }

    fn feed_u16(&mut self, value: u16) {
        for byte in value.to_le_bytes() {
            self.hash ^= byte as u32;
            self.hash = self.hash.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Signature hash of `() -> void`, the shape used for label calls and
/// `makeCallable` targets.
pub fn void_signature_hash() -> u32 {
    SignatureBuilder::new(&crate::data_type::PredefinedDataTypes::void()).finish()
}

/// Combined 64-bit key indexing overload sets.
pub fn name_and_signature_hash(name_hash: u64, signature_hash: u32) -> u64 {
    name_hash.wrapping_add(signature_hash as u64)
}
