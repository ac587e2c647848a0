//! Bytecode opcode model
//!
//! The back end emits a flat vector of [`Opcode`]s per script function. Each
//! opcode is a type tag, a base data type, a 64-bit parameter (immediate,
//! address, variable ID, signature hash, or jump target index), the source
//! line, and a small flag set. The runtime-function builder later translates
//! these into runtime opcodes.

use bitflags::bitflags;

use crate::data_type::BaseType;

/// The 36 bytecode instruction types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpcodeType {
    Nop = 0,
    /// Move the value stack pointer by the (signed) parameter.
    MoveStack,
    /// Grow/shrink the local-variable buffer; new cells are zero-initialized.
    MoveVarStack,
    PushConstant,
    /// Parameter is a 32-bit variable ID (kind in the high nibble).
    GetVariableValue,
    /// Peeks the top cell (does not pop) and writes it to the variable.
    SetVariableValue,
    /// Parameter 0: pop address, push value. Parameter 1: peek address.
    ReadMemory,
    /// Parameter 0: stack is [value, address]; pops the address, writes,
    /// leaves the value. Parameter 1: exchanged operand order.
    WriteMemory,
    /// Parameter holds the source base type; the data type is the target.
    CastValue,
    MakeBool,
    ArithmAdd,
    ArithmSub,
    ArithmMul,
    ArithmDiv,
    ArithmMod,
    ArithmAnd,
    ArithmOr,
    ArithmXor,
    ArithmShl,
    ArithmShr,
    ArithmNeg,
    ArithmNot,
    ArithmBitnot,
    CompareEq,
    CompareNeq,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,
    /// Parameter is an absolute opcode index.
    Jump,
    /// Pops the condition; jumps on zero, falls through on non-zero.
    JumpConditional,
    /// Top == 0: pop and jump. Otherwise decrement in place and continue.
    JumpSwitch,
    /// Parameter is the callee's name-and-signature hash.
    Call,
    Return,
    /// Pops the target address and hands it to the host.
    ExternalCall,
    /// Pops the target address, pops the frame, hands the address to the host.
    ExternalJump,
}

pub const NUM_OPCODE_TYPES: usize = 36;

impl OpcodeType {
    pub fn from_u8(value: u8) -> Option<OpcodeType> {
        if (value as usize) < NUM_OPCODE_TYPES {
            // Discriminants are dense starting at zero.
            Some(unsafe { std::mem::transmute::<u8, OpcodeType>(value) })
        } else {
            None
        }
    }

    /// Whether this opcode transfers control (the interpreter loop handles
    /// these itself instead of dispatching an exec function).
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            OpcodeType::Jump
                | OpcodeType::JumpConditional
                | OpcodeType::JumpSwitch
                | OpcodeType::Call
                | OpcodeType::Return
                | OpcodeType::ExternalCall
                | OpcodeType::ExternalJump
        )
    }

    pub fn is_binary_arithmetic(self) -> bool {
        (self as u8) >= (OpcodeType::ArithmAdd as u8) && (self as u8) <= (OpcodeType::ArithmShr as u8)
    }

    pub fn is_comparison(self) -> bool {
        (self as u8) >= (OpcodeType::CompareEq as u8) && (self as u8) <= (OpcodeType::CompareGe as u8)
    }

    /// Base type assumed when the serialized opcode omits an explicit one.
    /// Keeping this table in sync with the writer is what makes the compact
    /// module format work.
    pub fn default_base_type(self) -> BaseType {
        use OpcodeType as O;
        match self {
            O::Nop | O::MoveStack | O::MoveVarStack => BaseType::Void,
            O::PushConstant => BaseType::IntConst,
            O::GetVariableValue | O::SetVariableValue => BaseType::Uint32,
            O::ReadMemory | O::WriteMemory => BaseType::Uint8,
            O::CastValue | O::MakeBool => BaseType::Void,
            O::ArithmAdd | O::ArithmSub | O::ArithmMul | O::ArithmDiv | O::ArithmMod => {
                BaseType::Uint32
            }
            O::ArithmAnd | O::ArithmOr | O::ArithmXor => BaseType::Uint8,
            O::ArithmShl | O::ArithmShr => BaseType::Uint32,
            O::ArithmNeg => BaseType::IntConst,
            O::ArithmNot | O::ArithmBitnot => BaseType::Uint8,
            O::CompareEq | O::CompareNeq | O::CompareLt | O::CompareLe | O::CompareGt
            | O::CompareGe => BaseType::Uint8,
            O::Jump | O::JumpConditional | O::JumpSwitch | O::Call | O::Return
            | O::ExternalCall | O::ExternalJump => BaseType::Void,
        }
    }
}

bitflags! {
    /// Flags carried by a bytecode opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpcodeFlags: u8 {
        /// The straight-line sequence must stop here (set by the back end,
        /// preserved by serialization).
        const SEQ_BREAK = 0x01;
        /// Control-flow opcode; rebuilt from the type on deserialization.
        const CTRLFLOW = 0x02;
    }
}

/// One bytecode instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Opcode {
    pub opcode_type: OpcodeType,
    pub data_type: BaseType,
    pub parameter: i64,
    pub line_number: u32,
    pub flags: OpcodeFlags,
}

impl Opcode {
    pub fn new(opcode_type: OpcodeType, data_type: BaseType, parameter: i64, line_number: u32) -> Self {
        let mut flags = OpcodeFlags::empty();
        if opcode_type.is_control_flow() && opcode_type != OpcodeType::JumpSwitch {
            flags |= OpcodeFlags::CTRLFLOW;
        }
        Opcode {
            opcode_type,
            data_type,
            parameter,
            line_number,
            flags,
        }
    }

    /// Shorthand using the opcode's default base type.
    pub fn simple(opcode_type: OpcodeType, parameter: i64, line_number: u32) -> Self {
        Opcode::new(opcode_type, opcode_type.default_base_type(), parameter, line_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_type_roundtrip() {
        for i in 0..NUM_OPCODE_TYPES as u8 {
            let ty = OpcodeType::from_u8(i).expect("dense discriminants");
            assert_eq!(ty as u8, i);
        }
        assert!(OpcodeType::from_u8(NUM_OPCODE_TYPES as u8).is_none());
    }

    #[test]
    fn test_control_flow_classification() {
        assert!(OpcodeType::Jump.is_control_flow());
        assert!(OpcodeType::Call.is_control_flow());
        assert!(OpcodeType::ExternalJump.is_control_flow());
        assert!(!OpcodeType::PushConstant.is_control_flow());
        assert!(!OpcodeType::ArithmAdd.is_control_flow());
    }

    #[test]
    fn test_arithmetic_and_comparison_ranges() {
        assert!(OpcodeType::ArithmAdd.is_binary_arithmetic());
        assert!(OpcodeType::ArithmShr.is_binary_arithmetic());
        assert!(!OpcodeType::ArithmNeg.is_binary_arithmetic());
        assert!(OpcodeType::CompareEq.is_comparison());
        assert!(OpcodeType::CompareGe.is_comparison());
        assert!(!OpcodeType::Jump.is_comparison());
    }

    #[test]
    fn test_default_base_types() {
        assert_eq!(OpcodeType::PushConstant.default_base_type(), BaseType::IntConst);
        assert_eq!(OpcodeType::GetVariableValue.default_base_type(), BaseType::Uint32);
        assert_eq!(OpcodeType::ReadMemory.default_base_type(), BaseType::Uint8);
        assert_eq!(OpcodeType::Jump.default_base_type(), BaseType::Void);
    }

    #[test]
    fn test_ctrlflow_flag_set_on_construction() {
        let op = Opcode::simple(OpcodeType::Return, 0, 10);
        assert!(op.flags.contains(OpcodeFlags::CTRLFLOW));
        let op = Opcode::simple(OpcodeType::PushConstant, 5, 10);
        assert!(!op.flags.contains(OpcodeFlags::CTRLFLOW));
    }
}
