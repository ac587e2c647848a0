//! lemon-core — shared definitions for the lemonscript language
//!
//! This crate holds everything both the compiler middle end and the runtime
//! need to agree on: the data-type registry, flyweight strings and the
//! string lookup table, the 64-bit any-value carrier, the bytecode opcode
//! model, the token model, the globals lookup, and the little-endian binary
//! reader/writer behind the serialization formats.

pub mod any_value;
pub mod binary;
pub mod data_type;
pub mod flyweight;
pub mod globals;
pub mod opcode;
pub mod operator;
pub mod signature;
pub mod token;

pub use any_value::{cast_base_value, AnyBaseValue, BaseValueRepr};
pub use binary::{BinaryReader, BinaryWriter, ReadError};
pub use data_type::{
    BaseType, BracketOperator, DataTypeClass, DataTypeDefinition, DataTypeRef, IntegerSemantics,
    PredefinedDataTypes, ANY_DATA_TYPE_ID, NUM_PREDEFINED_DATA_TYPES,
};
pub use flyweight::{murmur2_64, FlyweightString, StoredString, StringLookup};
pub use globals::{
    make_variable_id, variable_index_of_id, variable_kind_of_id, AliasName, ConstantArrayInfo,
    ConstantInfo, DefineInfo, FunctionFlags, FunctionInfo, FunctionKind, FunctionParameter,
    FunctionRef, FunctionReference, GlobalsLookup, Identifier, PreprocessorDefinitionMap,
    VariableInfo, VariableKind,
};
pub use opcode::{Opcode, OpcodeFlags, OpcodeType, NUM_OPCODE_TYPES};
pub use operator::{Operator, OperatorClass, OperatorHelper, NUM_OPERATORS};
pub use signature::{name_and_signature_hash, void_signature_hash, SignatureBuilder};
pub use token::{
    Keyword, ParenthesisType, SharedTokenList, StatementNode, StatementToken, Token, TokenList,
    TokenSerializeError, TokenSerializer,
};
