//! Any-value: the tagged 64-bit carrier
//!
//! Every stack cell, constant and native-call argument is an
//! [`AnyBaseValue`]: one 64-bit word whose interpretation is recovered from
//! an accompanying data-type reference. Smaller integers occupy the low
//! bits; floats live in the cell as their raw bit pattern. Conversions
//! between base types always go through this carrier — bits are never
//! reinterpreted implicitly.

use crate::data_type::BaseType;

/// One 64-bit storage cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnyBaseValue(u64);

/// Types that can be stored in and recovered from a stack cell.
///
/// Signed integers sign-extend into the cell so that reading them back at a
/// wider type preserves their value; unsigned integers zero-extend. Floats
/// store raw bits in the low lanes of the cell.
pub trait BaseValueRepr: Copy {
    fn from_cell(cell: u64) -> Self;
    fn into_cell(self) -> u64;
}

macro_rules! impl_signed_repr {
    ($ty:ty) => {
        impl BaseValueRepr for $ty {
            fn from_cell(cell: u64) -> Self {
                cell as $ty
            }
            fn into_cell(self) -> u64 {
                self as i64 as u64
            }
        }
    };
}

macro_rules! impl_unsigned_repr {
    ($ty:ty) => {
        impl BaseValueRepr for $ty {
            fn from_cell(cell: u64) -> Self {
                cell as $ty
            }
            fn into_cell(self) -> u64 {
                self as u64
            }
        }
    };
}

impl_signed_repr!(i8);
impl_signed_repr!(i16);
impl_signed_repr!(i32);
impl_signed_repr!(i64);
impl_unsigned_repr!(u8);
impl_unsigned_repr!(u16);
impl_unsigned_repr!(u32);
impl_unsigned_repr!(u64);

impl BaseValueRepr for bool {
    fn from_cell(cell: u64) -> Self {
        cell != 0
    }
    fn into_cell(self) -> u64 {
        self as u64
    }
}

impl BaseValueRepr for f32 {
    fn from_cell(cell: u64) -> Self {
        f32::from_bits(cell as u32)
    }
    fn into_cell(self) -> u64 {
        self.to_bits() as u64
    }
}

impl BaseValueRepr for f64 {
    fn from_cell(cell: u64) -> Self {
        f64::from_bits(cell)
    }
    fn into_cell(self) -> u64 {
        self.to_bits()
    }
}

impl AnyBaseValue {
    pub fn new() -> Self {
        AnyBaseValue(0)
    }

    pub fn from<T: BaseValueRepr>(value: T) -> Self {
        AnyBaseValue(value.into_cell())
    }

    pub fn from_raw(cell: u64) -> Self {
        AnyBaseValue(cell)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn get<T: BaseValueRepr>(self) -> T {
        T::from_cell(self.0)
    }

    pub fn set<T: BaseValueRepr>(&mut self, value: T) {
        self.0 = value.into_cell();
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Numeric conversion between two base types, carried out on the cell.
///
/// Integer-to-integer conversion truncates or extends by the source's
/// signedness; float↔int uses round-to-nearest-ties-even. Returns `None`
/// when either side is not numeric (string, array, any, void), except the
/// identity conversion which always succeeds.
pub fn cast_base_value(value: AnyBaseValue, from: BaseType, to: BaseType) -> Option<AnyBaseValue> {
    if from == to {
        return Some(value);
    }
    if !is_numeric(from) || !is_numeric(to) {
        return None;
    }

    // Read the source into the widest lossless intermediate.
    enum Num {
        Signed(i64),
        Unsigned(u64),
        Real(f64),
    }

    let num = match from {
        BaseType::Int8 => Num::Signed(value.get::<i8>() as i64),
        BaseType::Int16 => Num::Signed(value.get::<i16>() as i64),
        BaseType::Int32 => Num::Signed(value.get::<i32>() as i64),
        BaseType::Int64 | BaseType::IntConst => Num::Signed(value.get::<i64>()),
        BaseType::Uint8 => Num::Unsigned(value.get::<u8>() as u64),
        BaseType::Uint16 => Num::Unsigned(value.get::<u16>() as u64),
        BaseType::Uint32 => Num::Unsigned(value.get::<u32>() as u64),
        BaseType::Uint64 => Num::Unsigned(value.get::<u64>()),
        BaseType::Float => Num::Real(value.get::<f32>() as f64),
        BaseType::Double => Num::Real(value.get::<f64>()),
        _ => return None,
    };

    let as_signed = |n: &Num| -> i64 {
        match n {
            Num::Signed(v) => *v,
            Num::Unsigned(v) => *v as i64,
            Num::Real(v) => v.round_ties_even() as i64,
        }
    };
    let as_unsigned = |n: &Num| -> u64 {
        match n {
            Num::Signed(v) => *v as u64,
            Num::Unsigned(v) => *v,
            Num::Real(v) => v.round_ties_even() as u64,
        }
    };
    let as_real = |n: &Num| -> f64 {
        match n {
            Num::Signed(v) => *v as f64,
            Num::Unsigned(v) => *v as f64,
            Num::Real(v) => *v,
        }
    };

    let result = match to {
        BaseType::Int8 => AnyBaseValue::from(as_signed(&num) as i8),
        BaseType::Int16 => AnyBaseValue::from(as_signed(&num) as i16),
        BaseType::Int32 => AnyBaseValue::from(as_signed(&num) as i32),
        BaseType::Int64 | BaseType::IntConst => AnyBaseValue::from(as_signed(&num)),
        BaseType::Uint8 => AnyBaseValue::from(as_unsigned(&num) as u8),
        BaseType::Uint16 => AnyBaseValue::from(as_unsigned(&num) as u16),
        BaseType::Uint32 => AnyBaseValue::from(as_unsigned(&num) as u32),
        BaseType::Uint64 => AnyBaseValue::from(as_unsigned(&num)),
        BaseType::Float => AnyBaseValue::from(as_real(&num) as f32),
        BaseType::Double => AnyBaseValue::from(as_real(&num)),
        _ => return None,
    };
    Some(result)
}

fn is_numeric(base: BaseType) -> bool {
    base.is_integer() || base.is_float()
}
