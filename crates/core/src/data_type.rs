//! Data-type registry
//!
//! Every value in lemonscript has a [`DataTypeDefinition`]. Fourteen types
//! are predefined at fixed IDs 0..=13 so that serialized modules can refer
//! to them by ID; modules may register additional custom and array types,
//! whose IDs are allocated sequentially after the predefined block. Two runs
//! over the same set of modules therefore produce identical IDs.

use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::flyweight::FlyweightString;

/// Underlying representation tag of a data type.
///
/// Integers encode signedness and width in the value: `0x10 | log2(bytes)`
/// for signed, `0x18 | log2(bytes)` for unsigned. That keeps the helpers
/// below branch-free and gives stable bytes for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BaseType {
    Void = 0x00,
    Int8 = 0x10,
    Int16 = 0x11,
    Int32 = 0x12,
    Int64 = 0x13,
    Uint8 = 0x18,
    Uint16 = 0x19,
    Uint32 = 0x1a,
    Uint64 = 0x1b,
    /// Untyped integer constant; adapts to its context during processing.
    IntConst = 0x1f,
    Float = 0x20,
    Double = 0x21,
    String = 0x30,
    ArrayBase = 0x31,
    Any = 0x32,
    /// First value of the user-defined range; customs are `0x80 + n`.
    UserDefined = 0x80,
}

impl BaseType {
    pub fn from_u8(value: u8) -> Option<BaseType> {
        Some(match value {
            0x00 => BaseType::Void,
            0x10 => BaseType::Int8,
            0x11 => BaseType::Int16,
            0x12 => BaseType::Int32,
            0x13 => BaseType::Int64,
            0x18 => BaseType::Uint8,
            0x19 => BaseType::Uint16,
            0x1a => BaseType::Uint32,
            0x1b => BaseType::Uint64,
            0x1f => BaseType::IntConst,
            0x20 => BaseType::Float,
            0x21 => BaseType::Double,
            0x30 => BaseType::String,
            0x31 => BaseType::ArrayBase,
            0x32 => BaseType::Any,
            0x80 => BaseType::UserDefined,
            _ => return None,
        })
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            BaseType::Int8
                | BaseType::Int16
                | BaseType::Int32
                | BaseType::Int64
                | BaseType::Uint8
                | BaseType::Uint16
                | BaseType::Uint32
                | BaseType::Uint64
                | BaseType::IntConst
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BaseType::Int8 | BaseType::Int16 | BaseType::Int32 | BaseType::Int64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, BaseType::Float | BaseType::Double)
    }

    /// Size in bytes of the base representation; 8 for everything that
    /// occupies a full stack cell (strings, int consts, any).
    pub fn size_bytes(self) -> usize {
        match self {
            BaseType::Void => 0,
            BaseType::Int8 | BaseType::Uint8 => 1,
            BaseType::Int16 | BaseType::Uint16 => 2,
            BaseType::Int32 | BaseType::Uint32 | BaseType::Float => 4,
            _ => 8,
        }
    }
}

/// Coarse classification used by the token processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTypeClass {
    Void,
    Integer,
    Float,
    String,
    Array,
    Any,
    Custom,
}

/// Distinguishes plain integers from booleans and named constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegerSemantics {
    Default,
    Boolean,
    Constant,
}

/// Bracket operator exposed by a data type, enabling `variable[index]`.
#[derive(Debug, Clone)]
pub struct BracketOperator {
    pub parameter_type: DataTypeRef,
    pub value_type: DataTypeRef,
}

/// Shared handle to a data-type definition.
pub type DataTypeRef = Arc<DataTypeDefinition>;

/// Full description of a script-visible data type.
#[derive(Debug, Clone)]
pub struct DataTypeDefinition {
    name: FlyweightString,
    id: u16,
    base_type: BaseType,
    bytes: usize,
    class: DataTypeClass,
    semantics: IntegerSemantics,
    bracket_operator: Option<BracketOperator>,
    /// Set for array types: element type and fixed size.
    array_element: Option<(DataTypeRef, usize)>,
}

impl DataTypeDefinition {
    pub fn new(
        name: &str,
        id: u16,
        base_type: BaseType,
        bytes: usize,
        class: DataTypeClass,
        semantics: IntegerSemantics,
    ) -> Self {
        DataTypeDefinition {
            name: FlyweightString::new(name),
            id,
            base_type,
            bytes,
            class,
            semantics,
            bracket_operator: None,
            array_element: None,
        }
    }

    /// A custom (user-defined) type as registered by a module.
    pub fn custom(name: &str, id: u16, base_type: BaseType) -> Self {
        DataTypeDefinition::new(
            name,
            id,
            base_type,
            base_type.size_bytes(),
            DataTypeClass::Custom,
            IntegerSemantics::Default,
        )
    }

    /// A fixed-size array type over the given element type.
    pub fn array(name: &str, id: u16, element: DataTypeRef, size: usize) -> Self {
        let mut def = DataTypeDefinition::new(
            name,
            id,
            BaseType::ArrayBase,
            4, // array handle is a 32-bit variable/array ID
            DataTypeClass::Array,
            IntegerSemantics::Default,
        );
        def.bracket_operator = Some(BracketOperator {
            parameter_type: PredefinedDataTypes::u32(),
            value_type: element.clone(),
        });
        def.array_element = Some((element, size));
        def
    }

    pub fn with_bracket_operator(mut self, bracket: BracketOperator) -> Self {
        self.bracket_operator = Some(bracket);
        self
    }

    pub fn name(&self) -> &FlyweightString {
        &self.name
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn base_type(&self) -> BaseType {
        self.base_type
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn class(&self) -> DataTypeClass {
        self.class
    }

    pub fn semantics(&self) -> IntegerSemantics {
        self.semantics
    }

    pub fn bracket_operator(&self) -> Option<&BracketOperator> {
        self.bracket_operator.as_ref()
    }

    pub fn array_element(&self) -> Option<(&DataTypeRef, usize)> {
        self.array_element.as_ref().map(|(ty, size)| (ty, *size))
    }

    pub fn is_void(&self) -> bool {
        self.class == DataTypeClass::Void
    }
}

impl PartialEq for DataTypeDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DataTypeDefinition {}

impl fmt::Display for DataTypeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_str())
    }
}

/// Number of predefined types occupying the fixed ID block 0..=13.
pub const NUM_PREDEFINED_DATA_TYPES: u16 = 14;

/// ID of the predefined "any" carrier type, registered directly after the
/// fixed block so it is stable as well.
pub const ANY_DATA_TYPE_ID: u16 = 14;

static PREDEFINED: LazyLock<Vec<DataTypeRef>> = LazyLock::new(|| {
    use BaseType as B;
    use DataTypeClass as C;
    use IntegerSemantics as S;

    let make = |name, id, base: B, bytes, class, sem| {
        Arc::new(DataTypeDefinition::new(name, id, base, bytes, class, sem))
    };

    vec![
        make("void", 0, B::Void, 0, C::Void, S::Default),
        make("bool", 1, B::Uint8, 1, C::Integer, S::Boolean),
        make("s8", 2, B::Int8, 1, C::Integer, S::Default),
        make("u8", 3, B::Uint8, 1, C::Integer, S::Default),
        make("s16", 4, B::Int16, 2, C::Integer, S::Default),
        make("u16", 5, B::Uint16, 2, C::Integer, S::Default),
        make("s32", 6, B::Int32, 4, C::Integer, S::Default),
        make("u32", 7, B::Uint32, 4, C::Integer, S::Default),
        make("s64", 8, B::Int64, 8, C::Integer, S::Default),
        make("u64", 9, B::Uint64, 8, C::Integer, S::Default),
        make("float", 10, B::Float, 4, C::Float, S::Default),
        make("double", 11, B::Double, 8, C::Float, S::Default),
        make("string", 12, B::String, 8, C::String, S::Default),
        make("const_int", 13, B::IntConst, 8, C::Integer, S::Constant),
        make("any", ANY_DATA_TYPE_ID, B::Any, 8, C::Any, S::Default),
    ]
});

/// Accessors for the predefined type block.
pub struct PredefinedDataTypes;

impl PredefinedDataTypes {
    pub fn void() -> DataTypeRef {
        PREDEFINED[0].clone()
    }

    pub fn bool_type() -> DataTypeRef {
        PREDEFINED[1].clone()
    }

    pub fn i8() -> DataTypeRef {
        PREDEFINED[2].clone()
    }

    pub fn u8() -> DataTypeRef {
        PREDEFINED[3].clone()
    }

    pub fn i16() -> DataTypeRef {
        PREDEFINED[4].clone()
    }

    pub fn u16() -> DataTypeRef {
        PREDEFINED[5].clone()
    }

    pub fn i32() -> DataTypeRef {
        PREDEFINED[6].clone()
    }

    pub fn u32() -> DataTypeRef {
        PREDEFINED[7].clone()
    }

    pub fn i64() -> DataTypeRef {
        PREDEFINED[8].clone()
    }

    pub fn u64() -> DataTypeRef {
        PREDEFINED[9].clone()
    }

    pub fn float() -> DataTypeRef {
        PREDEFINED[10].clone()
    }

    pub fn double() -> DataTypeRef {
        PREDEFINED[11].clone()
    }

    pub fn string() -> DataTypeRef {
        PREDEFINED[12].clone()
    }

    pub fn const_int() -> DataTypeRef {
        PREDEFINED[13].clone()
    }

    pub fn any() -> DataTypeRef {
        PREDEFINED[14].clone()
    }

    /// All predefined types including `any`, in ID order.
    pub fn all() -> &'static [DataTypeRef] {
        &PREDEFINED
    }

    /// The predefined integer type for a given base type, if one exists.
    pub fn by_base_type(base_type: BaseType) -> Option<DataTypeRef> {
        let index = match base_type {
            BaseType::Void => 0,
            BaseType::Int8 => 2,
            BaseType::Uint8 => 3,
            BaseType::Int16 => 4,
            BaseType::Uint16 => 5,
            BaseType::Int32 => 6,
            BaseType::Uint32 => 7,
            BaseType::Int64 => 8,
            BaseType::Uint64 => 9,
            BaseType::Float => 10,
            BaseType::Double => 11,
            BaseType::String => 12,
            BaseType::IntConst => 13,
            BaseType::Any => 14,
            _ => return None,
        };
        Some(PREDEFINED[index].clone())
    }
}
