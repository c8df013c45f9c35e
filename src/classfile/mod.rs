//! Lossless class-file codec: parse, edit, emit.
//!
//! The model keeps everything it does not need to edit as raw bytes (field
//! and class attributes, non-`Code` method attributes, the sub-attributes of
//! `Code`) so that `emit(parse(c)) == c` for any accepted input. Methods
//! parse their `Code` attribute structurally because the mutater edits code
//! arrays in place.

pub mod codec;
pub mod opcode;
pub mod pool;

use thiserror::Error;

pub use codec::{emit, parse};
pub use pool::{ConstPool, Constant};

pub const ACC_SYNTHETIC: u16 = 0x1000;

/// Codec-level errors.
#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("not a class file (bad magic)")]
    BadMagic,
    #[error("unexpected end of class file at byte {at}")]
    Truncated { at: usize },
    #[error("trailing garbage after class file body")]
    TrailingBytes,
    #[error("unknown constant pool tag {tag}")]
    UnknownPoolTag { tag: u8 },
    #[error("unknown opcode 0x{opcode:02x} at pc {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("code array truncated at pc {pc}")]
    TruncatedCode { pc: usize },
    #[error("malformed switch instruction at pc {pc}")]
    MalformedSwitch { pc: usize },
    #[error("replacement length {replacement} differs from instruction length {original} at pc {pc}")]
    LengthMismatch {
        pc: usize,
        original: usize,
        replacement: usize,
    },
    #[error("edit range out of bounds at pc {pc}")]
    EditOutOfBounds { pc: usize },
}

/// An attribute kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub data: Vec<u8>,
}

/// One exception-table row of a `Code` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// A parsed `Code` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttr {
    pub name_index: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exceptions: Vec<ExceptionEntry>,
    pub attributes: Vec<RawAttribute>,
}

impl CodeAttr {
    /// Byte length of the attribute payload, as written to the `u32` length
    /// field on emission.
    pub fn payload_len(&self) -> u32 {
        let attrs: usize = self.attributes.iter().map(|a| 6 + a.data.len()).sum();
        (2 + 2 + 4 + self.code.len() + 2 + 8 * self.exceptions.len() + 2 + attrs) as u32
    }

    /// Replace the instruction at `pc` with `replacement`, which must have
    /// the same byte length. Branch offsets, exception ranges, and line
    /// tables all address byte offsets, so edits never shift code.
    pub fn replace_insn(&mut self, pc: usize, replacement: &[u8]) -> Result<(), ClassFileError> {
        let original = opcode::insn_len(&self.code, pc)?;
        if original != replacement.len() {
            return Err(ClassFileError::LengthMismatch {
                pc,
                original,
                replacement: replacement.len(),
            });
        }
        self.code[pc..pc + original].copy_from_slice(replacement);
        Ok(())
    }

    /// Overwrite raw code bytes at `at` without touching instruction
    /// boundaries. Used for switch-payload edits, which rewrite 4-byte
    /// target slots inside one instruction.
    pub(crate) fn overwrite(&mut self, at: usize, bytes: &[u8]) -> Result<(), ClassFileError> {
        let end = at
            .checked_add(bytes.len())
            .filter(|end| *end <= self.code.len())
            .ok_or(ClassFileError::EditOutOfBounds { pc: at })?;
        self.code[at..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Source line for `pc` from the `LineNumberTable`, if present.
    pub fn line_for_pc(&self, pool: &ConstPool, pc: usize) -> Option<u32> {
        let table = self
            .attributes
            .iter()
            .find(|attr| pool.utf8(attr.name_index) == Some("LineNumberTable"))?;
        let data = &table.data;
        let count = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
        let mut best: Option<u32> = None;
        for row in 0..count {
            let at = 2 + row * 4;
            let start_pc = u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]) as usize;
            let line = u16::from_be_bytes([*data.get(at + 2)?, *data.get(at + 3)?]) as u32;
            if start_pc <= pc {
                best = Some(line);
            }
        }
        best
    }
}

/// A method attribute in declaration order; `Code` is structural, the rest
/// stay raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodAttr {
    Code(CodeAttr),
    Raw(RawAttribute),
}

/// One field declaration, attributes kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub access: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

/// One method declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub access: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<MethodAttr>,
}

impl MethodInfo {
    pub fn code(&self) -> Option<&CodeAttr> {
        self.attributes.iter().find_map(|attr| match attr {
            MethodAttr::Code(code) => Some(code),
            MethodAttr::Raw(_) => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttr> {
        self.attributes.iter_mut().find_map(|attr| match attr {
            MethodAttr::Code(code) => Some(code),
            MethodAttr::Raw(_) => None,
        })
    }

    pub fn is_synthetic(&self, pool: &ConstPool) -> bool {
        self.access & ACC_SYNTHETIC != 0
            || self
                .attributes
                .iter()
                .any(|attr| matches!(attr, MethodAttr::Raw(raw) if pool.utf8(raw.name_index) == Some("Synthetic")))
    }
}

/// In-memory representation of one compiled class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassImage {
    pub minor: u16,
    pub major: u16,
    pub pool: ConstPool,
    pub access: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<RawAttribute>,
}

impl ClassImage {
    /// Binary name of this class (`a/b/C` form).
    pub fn this_name(&self) -> Option<&str> {
        self.pool.class_name(self.this_class)
    }

    pub fn method_name(&self, method: &MethodInfo) -> Option<&str> {
        self.pool.utf8(method.name_index)
    }

    pub fn method_descriptor(&self, method: &MethodInfo) -> Option<&str> {
        self.pool.utf8(method.descriptor_index)
    }
}
