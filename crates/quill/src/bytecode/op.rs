//! Opcode definitions.

use strum::{FromRepr, IntoStaticStr};

/// One VM instruction's opcode byte.
///
/// Operand layout (big-endian for multi-byte operands):
///
/// | opcode | operands |
/// |---|---|
/// | `Constant` | u16 pool index |
/// | `GetVar` / `SetVar` / `DefineVar` / `DefineConst` | u16 name pool index |
/// | `GetProperty` / `SetProperty` / `GetPropertyOptional` | u16 name pool index |
/// | `Array` / `Map` | u16 initial capacity |
/// | `Jump` / `JumpIfFalse` | u16 forward offset |
/// | `Loop` | u16 backward offset |
/// | `Call` / `CallOptional` | u8 argument count |
/// | `Invoke` | u16 name pool index, u8 argument count |
/// | `Closure` | u16 function pool index |
/// | `Class` | u16 name pool index, u16 method count |
/// | `EnumCtor` | u16 enum-name pool index, u16 ctor-name pool index, u8 arity |
/// | `Import` / `ImportModule` | u16 path pool index |
/// | `Export` / `ExportValue` | u16 name pool index |
/// | `ExportFrom` | u8 pair count, then pair count × (u16 from, u16 to); 0 re-exports all |
///
/// Everything else is a bare opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Constant,
    Null,
    True,
    False,
    Pop,
    Negate,
    Not,
    Stringify,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    GetVar,
    SetVar,
    DefineVar,
    DefineConst,
    GetProperty,
    SetProperty,
    GetPropertyOptional,
    GetIndex,
    SetIndex,
    GetIndexOptional,
    Array,
    Map,
    ArrayAppend,
    MapSet,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    CallOptional,
    Invoke,
    Closure,
    Class,
    EnumCtor,
    Return,
    Import,
    ImportModule,
    Export,
    ExportValue,
    ExportFrom,
    BeginScope,
    EndScope,
    ArgCount,
    Gc,
}

impl Opcode {
    /// Decodes the opcode at `code[offset]`.
    ///
    /// # Panics
    /// Panics on an invalid opcode byte; chunks are only produced by the
    /// compiler, so this indicates corruption.
    pub fn at(code: &[u8], offset: usize) -> Self {
        Self::from_repr(code[offset]).expect("invalid opcode byte")
    }

    /// Total operand bytes following the opcode at `offset`.
    ///
    /// `ExportFrom` is variable-length; its first operand byte is the pair
    /// count.
    pub fn operand_len(self, code: &[u8], offset: usize) -> usize {
        match self {
            Self::Constant
            | Self::GetVar
            | Self::SetVar
            | Self::DefineVar
            | Self::DefineConst
            | Self::GetProperty
            | Self::SetProperty
            | Self::GetPropertyOptional
            | Self::Array
            | Self::Map
            | Self::Jump
            | Self::JumpIfFalse
            | Self::Loop
            | Self::Closure
            | Self::Import
            | Self::ImportModule
            | Self::Export
            | Self::ExportValue => 2,
            Self::Call | Self::CallOptional => 1,
            Self::Invoke => 3,
            Self::Class => 4,
            Self::EnumCtor => 5,
            Self::ExportFrom => 1 + usize::from(code[offset + 1]) * 4,
            Self::Null
            | Self::True
            | Self::False
            | Self::Pop
            | Self::Negate
            | Self::Not
            | Self::Stringify
            | Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Modulo
            | Self::Equal
            | Self::Greater
            | Self::GreaterEqual
            | Self::Less
            | Self::LessEqual
            | Self::GetIndex
            | Self::SetIndex
            | Self::GetIndexOptional
            | Self::ArrayAppend
            | Self::MapSet
            | Self::Return
            | Self::BeginScope
            | Self::EndScope
            | Self::ArgCount
            | Self::Gc => 0,
        }
    }

    /// True for the three relative-jump instructions.
    pub fn is_jump(self) -> bool {
        matches!(self, Self::Jump | Self::JumpIfFalse | Self::Loop)
    }

    /// Mnemonic for disassembly.
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_round_trip() {
        assert_eq!(Opcode::from_repr(Opcode::Gc as u8), Some(Opcode::Gc));
        assert_eq!(Opcode::from_repr(Opcode::Constant as u8), Some(Opcode::Constant));
    }

    #[test]
    fn mnemonics_are_screaming_snake() {
        assert_eq!(Opcode::GetPropertyOptional.mnemonic(), "GET_PROPERTY_OPTIONAL");
        assert_eq!(Opcode::JumpIfFalse.mnemonic(), "JUMP_IF_FALSE");
    }

    #[test]
    fn export_from_length_is_data_driven() {
        let code = [Opcode::ExportFrom as u8, 2, 0, 0, 0, 1, 0, 2, 0, 3];
        assert_eq!(Opcode::ExportFrom.operand_len(&code, 0), 9);
    }
}
