//! Type casting engine
//!
//! Decides whether one data type converts to another, how much an implicit
//! conversion "costs", and which signature of a binary operator fits a
//! pair of operand types best. Exact matches are free; widening is cheap;
//! signedness changes, narrowing and int↔float conversions get
//! progressively more expensive; untyped integer constants adapt to any
//! integer for almost nothing. Assignment operators additionally require
//! an exact match on the left-hand side.

use lemon_core::{
    cast_base_value, AnyBaseValue, DataTypeClass, DataTypeRef, FunctionParameter,
    IntegerSemantics, Operator, OperatorClass, OperatorHelper, PredefinedDataTypes,
};

use crate::options::CompileOptions;

/// Cost of an invalid implicit conversion.
pub const INVALID_CAST: u8 = 0xff;
/// Signature-level sentinel: no fit.
pub const INVALID_SIGNATURE: u16 = 0xff00;
/// Overload-level sentinel: no fit.
pub const INVALID_PRIORITY: u32 = 0xff00_0000;

/// What a conversion from one type to another requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastHandling {
    /// Types agree (or only differ in semantics); no opcode needed.
    NoCast,
    /// A CAST_VALUE opcode converting between the two base types.
    BaseCast,
    Invalid,
}

/// One candidate signature of a binary operator.
#[derive(Debug, Clone)]
pub struct BinaryOperatorSignature {
    pub left: DataTypeRef,
    pub right: DataTypeRef,
    pub result: DataTypeRef,
}

pub struct TypeCasting<'a> {
    options: &'a CompileOptions,
}

impl<'a> TypeCasting<'a> {
    pub fn new(options: &'a CompileOptions) -> Self {
        TypeCasting { options }
    }

    /// Cost of implicitly converting `source` into `target`; lower is
    /// better, [`INVALID_CAST`] means not allowed.
    pub fn implicit_cast_priority(&self, source: &DataTypeRef, target: &DataTypeRef) -> u8 {
        if source.id() == target.id() {
            return 0;
        }

        let source_class = source.class();
        let target_class = target.class();

        // Everything converts into "any", at the highest finite cost.
        if target_class == DataTypeClass::Any {
            return 10;
        }

        match (source_class, target_class) {
            (DataTypeClass::Integer, DataTypeClass::Integer) => {
                // Untyped constants adapt to any integer.
                if source.semantics() == IntegerSemantics::Constant {
                    return 1;
                }
                let source_signed = source.base_type().is_signed();
                let target_signed = target.base_type().is_signed();
                if source.bytes() == target.bytes() {
                    2
                } else if source.bytes() < target.bytes() {
                    // Widening.
                    if source_signed == target_signed {
                        1
                    } else if target_signed {
                        2
                    } else {
                        3
                    }
                } else {
                    // Narrowing is allowed implicitly, but expensive.
                    4
                }
            }
            (DataTypeClass::Integer, DataTypeClass::Float) => {
                if source.semantics() == IntegerSemantics::Constant {
                    2
                } else {
                    5
                }
            }
            (DataTypeClass::Float, DataTypeClass::Integer) => 6,
            (DataTypeClass::Float, DataTypeClass::Float) => {
                if source.bytes() < target.bytes() {
                    1
                } else {
                    2
                }
            }
            _ => INVALID_CAST,
        }
    }

    pub fn can_implicitly_cast(&self, source: &DataTypeRef, target: &DataTypeRef) -> bool {
        self.implicit_cast_priority(source, target) != INVALID_CAST
    }

    /// Explicit casts additionally allow any numeric-to-numeric pair.
    pub fn can_explicitly_cast(&self, source: &DataTypeRef, target: &DataTypeRef) -> bool {
        if source.id() == target.id() {
            return true;
        }
        let numeric = |class: DataTypeClass| {
            matches!(class, DataTypeClass::Integer | DataTypeClass::Float)
        };
        numeric(source.class()) && numeric(target.class())
    }

    /// What converting `source` to `target` requires.
    pub fn get_cast_handling(
        &self,
        source: &DataTypeRef,
        target: &DataTypeRef,
        explicit: bool,
    ) -> CastHandling {
        if source.id() == target.id() {
            return CastHandling::NoCast;
        }
        let allowed = if explicit {
            self.can_explicitly_cast(source, target)
        } else {
            self.can_implicitly_cast(source, target)
        };
        if !allowed {
            return CastHandling::Invalid;
        }
        // "any" is a reinterpretation, not a value conversion.
        if target.class() == DataTypeClass::Any {
            return CastHandling::NoCast;
        }
        if source.base_type() == target.base_type() {
            CastHandling::NoCast
        } else {
            CastHandling::BaseCast
        }
    }

    /// Convert a compile-time constant value between two types.
    pub fn cast_constant_value(
        &self,
        value: AnyBaseValue,
        source: &DataTypeRef,
        target: &DataTypeRef,
    ) -> Option<AnyBaseValue> {
        match self.get_cast_handling(source, target, false) {
            CastHandling::NoCast => Some(value),
            CastHandling::BaseCast => {
                cast_base_value(value, source.base_type(), target.base_type())
            }
            CastHandling::Invalid => None,
        }
    }

    /// Total cost of calling a function with the given argument types.
    pub fn priority_of_function_signature(
        &self,
        argument_types: &[DataTypeRef],
        parameters: &[FunctionParameter],
    ) -> u32 {
        if argument_types.len() != parameters.len() {
            return INVALID_PRIORITY;
        }
        let mut total = 0u32;
        for (argument, parameter) in argument_types.iter().zip(parameters) {
            let cost = self.implicit_cast_priority(argument, &parameter.data_type);
            if cost == INVALID_CAST {
                return INVALID_PRIORITY;
            }
            total += cost as u32;
        }
        total
    }

    /// Whether the argument types can be cast into the parameter list.
    /// On failure returns the index of the first parameter that can't.
    pub fn can_match_signature(
        &self,
        argument_types: &[DataTypeRef],
        parameters: &[FunctionParameter],
    ) -> Result<(), usize> {
        if argument_types.len() != parameters.len() {
            return Err(argument_types.len().min(parameters.len()));
        }
        for (index, (argument, parameter)) in argument_types.iter().zip(parameters).enumerate() {
            if !self.can_implicitly_cast(argument, &parameter.data_type) {
                return Err(index);
            }
        }
        Ok(())
    }

    /// Cost of a binary operator signature for the operand pair.
    pub fn priority_of_signature(
        &self,
        signature: &BinaryOperatorSignature,
        left: &DataTypeRef,
        right: &DataTypeRef,
    ) -> u16 {
        let left_cost = self.implicit_cast_priority(left, &signature.left);
        let right_cost = self.implicit_cast_priority(right, &signature.right);
        if left_cost == INVALID_CAST || right_cost == INVALID_CAST {
            return INVALID_SIGNATURE;
        }
        left_cost as u16 + right_cost as u16
    }

    /// Candidate signatures for a binary operator over the base types.
    pub fn binary_signatures_for_operator(op: Operator) -> Vec<BinaryOperatorSignature> {
        use Operator as Op;

        let integers = [
            PredefinedDataTypes::i64(),
            PredefinedDataTypes::u64(),
            PredefinedDataTypes::i32(),
            PredefinedDataTypes::u32(),
            PredefinedDataTypes::i16(),
            PredefinedDataTypes::u16(),
            PredefinedDataTypes::i8(),
            PredefinedDataTypes::u8(),
        ];
        let floats = [PredefinedDataTypes::float(), PredefinedDataTypes::double()];
        let symmetric = |types: &[DataTypeRef]| -> Vec<BinaryOperatorSignature> {
            types
                .iter()
                .map(|data_type| BinaryOperatorSignature {
                    left: data_type.clone(),
                    right: data_type.clone(),
                    result: data_type.clone(),
                })
                .collect()
        };
        let comparing = |types: &[DataTypeRef]| -> Vec<BinaryOperatorSignature> {
            types
                .iter()
                .map(|data_type| BinaryOperatorSignature {
                    left: data_type.clone(),
                    right: data_type.clone(),
                    result: PredefinedDataTypes::bool_type(),
                })
                .collect()
        };

        match op {
            Op::BinaryPlus | Op::BinaryMinus | Op::BinaryMultiply | Op::BinaryDivide
            | Op::BinaryModulo => {
                let mut signatures = symmetric(&integers);
                signatures.extend(symmetric(&floats));
                signatures
            }
            Op::BinaryAnd | Op::BinaryOr | Op::BinaryXor | Op::BinaryShiftLeft
            | Op::BinaryShiftRight => symmetric(&integers),
            Op::CompareEqual | Op::CompareNotEqual | Op::CompareLess | Op::CompareLessOrEqual
            | Op::CompareGreater | Op::CompareGreaterOrEqual => {
                let mut signatures = comparing(&integers);
                signatures.extend(comparing(&floats));
                signatures.push(BinaryOperatorSignature {
                    left: PredefinedDataTypes::string(),
                    right: PredefinedDataTypes::string(),
                    result: PredefinedDataTypes::bool_type(),
                });
                signatures
            }
            Op::LogicalAnd | Op::LogicalOr => vec![BinaryOperatorSignature {
                left: PredefinedDataTypes::bool_type(),
                right: PredefinedDataTypes::bool_type(),
                result: PredefinedDataTypes::bool_type(),
            }],
            Op::Assign => {
                let mut signatures = symmetric(&integers);
                signatures.extend(symmetric(&floats));
                signatures.push(BinaryOperatorSignature {
                    left: PredefinedDataTypes::string(),
                    right: PredefinedDataTypes::string(),
                    result: PredefinedDataTypes::string(),
                });
                signatures
            }
            Op::AssignPlus | Op::AssignMinus | Op::AssignMultiply | Op::AssignDivide
            | Op::AssignModulo => {
                let mut signatures = symmetric(&integers);
                signatures.extend(symmetric(&floats));
                signatures
            }
            Op::AssignAnd | Op::AssignOr | Op::AssignXor | Op::AssignShiftLeft
            | Op::AssignShiftRight => symmetric(&integers),
            _ => Vec::new(),
        }
    }

    /// Best-fitting signature index for the operand pair, honoring the
    /// exact-left-match rule for assignments.
    pub fn best_operator_signature(
        &self,
        signatures: &[BinaryOperatorSignature],
        exact_match_left_required: bool,
        left: &DataTypeRef,
        right: &DataTypeRef,
    ) -> Option<usize> {
        let mut best: Option<(usize, u16)> = None;
        for (index, signature) in signatures.iter().enumerate() {
            if exact_match_left_required && signature.left.id() != left.id() {
                continue;
            }
            let priority = self.priority_of_signature(signature, left, right);
            if priority >= INVALID_SIGNATURE {
                continue;
            }
            if best.map(|(_, best_priority)| priority < best_priority).unwrap_or(true) {
                best = Some((index, priority));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Whether string operators are available at the configured feature
    /// level.
    pub fn string_operators_enabled(&self) -> bool {
        self.options.script_feature_level >= 2
    }

    /// Whether the operator requires an exact left-hand type match.
    pub fn exact_left_required(op: Operator) -> bool {
        OperatorHelper::operator_class(op) == OperatorClass::Assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn casting_with(options: &CompileOptions) -> TypeCasting<'_> {
        TypeCasting::new(options)
    }

    #[test]
    fn test_exact_match_is_free() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        assert_eq!(
            casting.implicit_cast_priority(&PredefinedDataTypes::u16(), &PredefinedDataTypes::u16()),
            0
        );
    }

    #[test]
    fn test_widening_beats_narrowing() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        let widen = casting
            .implicit_cast_priority(&PredefinedDataTypes::u8(), &PredefinedDataTypes::u16());
        let narrow = casting
            .implicit_cast_priority(&PredefinedDataTypes::u16(), &PredefinedDataTypes::u8());
        assert!(widen < narrow);
    }

    #[test]
    fn test_const_int_adapts_cheaply() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        assert_eq!(
            casting.implicit_cast_priority(
                &PredefinedDataTypes::const_int(),
                &PredefinedDataTypes::u8()
            ),
            1
        );
    }

    #[test]
    fn test_string_never_casts_to_int() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        assert!(!casting.can_implicitly_cast(
            &PredefinedDataTypes::string(),
            &PredefinedDataTypes::u32()
        ));
        assert!(!casting.can_explicitly_cast(
            &PredefinedDataTypes::string(),
            &PredefinedDataTypes::u32()
        ));
    }

    #[test]
    fn test_explicit_cast_allows_float_int() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        assert!(casting.can_explicitly_cast(
            &PredefinedDataTypes::float(),
            &PredefinedDataTypes::u8()
        ));
    }

    #[test]
    fn test_cast_handling_distinguishes_semantics_from_base() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        // bool and u8 share the base type; no opcode needed.
        assert_eq!(
            casting.get_cast_handling(
                &PredefinedDataTypes::bool_type(),
                &PredefinedDataTypes::u8(),
                false
            ),
            CastHandling::NoCast
        );
        assert_eq!(
            casting.get_cast_handling(
                &PredefinedDataTypes::u8(),
                &PredefinedDataTypes::u32(),
                false
            ),
            CastHandling::BaseCast
        );
    }

    #[test]
    fn test_best_signature_for_mixed_widths() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        let signatures = TypeCasting::binary_signatures_for_operator(Operator::BinaryPlus);
        let index = casting
            .best_operator_signature(
                &signatures,
                false,
                &PredefinedDataTypes::u8(),
                &PredefinedDataTypes::u16(),
            )
            .unwrap();
        assert_eq!(signatures[index].result.name().as_str(), "u16");
    }

    #[test]
    fn test_assignment_requires_exact_left() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        let signatures = TypeCasting::binary_signatures_for_operator(Operator::Assign);
        let index = casting
            .best_operator_signature(
                &signatures,
                true,
                &PredefinedDataTypes::u8(),
                &PredefinedDataTypes::u32(),
            )
            .unwrap();
        // The left side dictates the signature even though the right is wider.
        assert_eq!(signatures[index].left.name().as_str(), "u8");
    }

    #[test]
    fn test_comparison_results_are_bool() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        let signatures = TypeCasting::binary_signatures_for_operator(Operator::CompareLess);
        let index = casting
            .best_operator_signature(
                &signatures,
                false,
                &PredefinedDataTypes::i32(),
                &PredefinedDataTypes::i32(),
            )
            .unwrap();
        assert_eq!(signatures[index].result.name().as_str(), "bool");
    }

    #[test]
    fn test_function_signature_priority() {
        let options = CompileOptions::default();
        let casting = casting_with(&options);
        let parameters = vec![
            FunctionParameter {
                name: lemon_core::FlyweightString::new("a"),
                data_type: PredefinedDataTypes::u16(),
            },
            FunctionParameter {
                name: lemon_core::FlyweightString::new("b"),
                data_type: PredefinedDataTypes::u32(),
            },
        ];
        let exact = casting.priority_of_function_signature(
            &[PredefinedDataTypes::u16(), PredefinedDataTypes::u32()],
            &parameters,
        );
        assert_eq!(exact, 0);
        let close = casting.priority_of_function_signature(
            &[PredefinedDataTypes::u8(), PredefinedDataTypes::u32()],
            &parameters,
        );
        assert!(close > exact && close < INVALID_PRIORITY);
        let wrong_count =
            casting.priority_of_function_signature(&[PredefinedDataTypes::u16()], &parameters);
        assert_eq!(wrong_count, INVALID_PRIORITY);
        let invalid = casting.priority_of_function_signature(
            &[PredefinedDataTypes::string(), PredefinedDataTypes::u32()],
            &parameters,
        );
        assert_eq!(invalid, INVALID_PRIORITY);
    }
}
