//! Mutation-point enumeration and application.
//!
//! The mutater walks a parsed class image in a fixed order (methods in
//! declaration order, bytecode offsets ascending, kinds in declaration order
//! at one offset) and either counts the mutatable sites or applies the edit
//! at one ordinal index. Counting and applying share the same walk, so a
//! given `(class, kinds, exclusions)` triple always yields the same indices,
//! descriptions, and locations.

pub mod kinds;

use std::collections::BTreeSet;
use std::ops::Range;

use thiserror::Error;
use tracing::debug;

use crate::classfile::opcode::{self, *};
use crate::classfile::{self, ClassFileError, ClassImage, CodeAttr, Constant};

pub use kinds::{KindSet, MutationKind};

/// Mutater-level errors. Malformed class bytes are fatal for the target and
/// surface to the scheduler as an engine error.
#[derive(Debug, Error)]
pub enum MutateError {
    #[error("class file error: {0}")]
    ClassFile(#[from] ClassFileError),
}

/// A mutated class image plus the human-readable account of the edit.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub bytes: Vec<u8>,
    pub description: String,
    pub method: String,
    pub line: Option<u32>,
    pub kind: MutationKind,
}

/// Description of one enumerable mutation point, used by the scheduler to
/// announce mutants before dispatching them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointInfo {
    pub index: usize,
    pub method: String,
    pub line: Option<u32>,
    pub kind: MutationKind,
    pub description: String,
}

/// Method names never mutated by default: the program entry point and
/// self-check methods.
pub fn default_exclusions() -> BTreeSet<String> {
    ["main", "integrity"].into_iter().map(String::from).collect()
}

#[derive(Debug, Clone)]
enum Edit {
    /// Equal-length instruction replacement at `pc`.
    ReplaceInsn { pc: usize, bytes: Vec<u8> },
    /// Swap two equal-length byte ranges inside a switch payload.
    SwapCode { a: usize, b: usize, len: usize },
    /// Overwrite raw bytes inside a switch payload.
    OverwriteCode { at: usize, bytes: Vec<u8> },
    /// Add one to a numeric pool entry.
    PoolIncrement { index: u16 },
    /// Repoint a string pool entry at a fresh empty utf8 entry.
    PoolBlankString { index: u16 },
}

#[derive(Debug, Clone)]
struct Candidate {
    method_index: usize,
    pc: usize,
    kind: MutationKind,
    edit: Edit,
    description: String,
}

/// Enumerates and applies bytecode edits for one class.
#[derive(Debug, Clone)]
pub struct Mutater {
    kinds: KindSet,
    excluded: BTreeSet<String>,
}

impl Mutater {
    pub fn new(kinds: KindSet, excluded: BTreeSet<String>) -> Self {
        Self { kinds, excluded }
    }

    /// Total number of mutation points in `class_bytes`.
    pub fn count_points(&self, class_bytes: &[u8]) -> Result<usize, MutateError> {
        let image = classfile::parse(class_bytes)?;
        Ok(self.candidates(&image)?.len())
    }

    /// Describe every point without applying any edit.
    pub fn describe_points(&self, class_bytes: &[u8]) -> Result<Vec<PointInfo>, MutateError> {
        let image = classfile::parse(class_bytes)?;
        Ok(self
            .candidates(&image)?
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| {
                let method = image
                    .method_name(&image.methods[candidate.method_index])
                    .unwrap_or("<unnamed>")
                    .to_string();
                let line = image.methods[candidate.method_index]
                    .code()
                    .and_then(|code| code.line_for_pc(&image.pool, candidate.pc));
                PointInfo {
                    index,
                    method,
                    line,
                    kind: candidate.kind,
                    description: candidate.description,
                }
            })
            .collect())
    }

    /// Apply the mutation at ordinal `index`. Returns `None` when `index` is
    /// past the last point, which is how callers detect the end of the
    /// enumeration.
    pub fn mutate(&self, class_bytes: &[u8], index: usize) -> Result<Option<Mutation>, MutateError> {
        let mut image = classfile::parse(class_bytes)?;
        let candidates = self.candidates(&image)?;
        let Some(candidate) = candidates.into_iter().nth(index) else {
            return Ok(None);
        };

        let method = image
            .method_name(&image.methods[candidate.method_index])
            .unwrap_or("<unnamed>")
            .to_string();
        let line = image.methods[candidate.method_index]
            .code()
            .and_then(|code| code.line_for_pc(&image.pool, candidate.pc));

        match candidate.edit {
            Edit::ReplaceInsn { pc, ref bytes } => {
                let code = image.methods[candidate.method_index]
                    .code_mut()
                    .ok_or(ClassFileError::EditOutOfBounds { pc })?;
                code.replace_insn(pc, bytes)?;
            }
            Edit::SwapCode { a, b, len } => {
                let code = image.methods[candidate.method_index]
                    .code_mut()
                    .ok_or(ClassFileError::EditOutOfBounds { pc: a })?;
                let first = code.code[a..a + len].to_vec();
                let second = code.code[b..b + len].to_vec();
                code.overwrite(a, &second)?;
                code.overwrite(b, &first)?;
            }
            Edit::OverwriteCode { at, ref bytes } => {
                let code = image.methods[candidate.method_index]
                    .code_mut()
                    .ok_or(ClassFileError::EditOutOfBounds { pc: at })?;
                code.overwrite(at, bytes)?;
            }
            Edit::PoolIncrement { index } => match image.pool.get_mut(index) {
                Some(Constant::Integer(value)) => *value = value.wrapping_add(1),
                Some(Constant::Long(value)) => *value = value.wrapping_add(1),
                Some(Constant::Float(bits)) => *bits = (f32::from_bits(*bits) + 1.0).to_bits(),
                Some(Constant::Double(bits)) => *bits = (f64::from_bits(*bits) + 1.0).to_bits(),
                _ => return Err(ClassFileError::EditOutOfBounds { pc: candidate.pc }.into()),
            },
            Edit::PoolBlankString { index } => {
                let empty = image.pool.push(Constant::Utf8(Vec::new()));
                match image.pool.get_mut(index) {
                    Some(Constant::String(utf8)) => *utf8 = empty,
                    _ => return Err(ClassFileError::EditOutOfBounds { pc: candidate.pc }.into()),
                }
            }
        }

        debug!(index, kind = %candidate.kind, method = %method, "applied mutation");
        Ok(Some(Mutation {
            bytes: classfile::emit(&image),
            description: candidate.description,
            method,
            line,
            kind: candidate.kind,
        }))
    }

    fn candidates(&self, image: &ClassImage) -> Result<Vec<Candidate>, MutateError> {
        let ldc_refs = ldc_refs_per_method(image)?;
        let shared = field_constant_refs(image);
        let mut out = Vec::new();
        for method_index in 0..image.methods.len() {
            let method = &image.methods[method_index];
            let name = image.method_name(method).unwrap_or("<unnamed>");
            if self.excluded.contains(name) || method.is_synthetic(&image.pool) {
                continue;
            }
            let Some(code) = method.code() else { continue };
            let guard_ranges = assertion_ranges(image, code)?;
            self.method_candidates(
                image,
                method_index,
                code,
                &guard_ranges,
                &ldc_refs,
                &shared,
                &mut out,
            )?;
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn method_candidates(
        &self,
        image: &ClassImage,
        method_index: usize,
        code: &CodeAttr,
        guard_ranges: &[Range<usize>],
        ldc_refs: &[BTreeSet<u16>],
        shared: &BTreeSet<u16>,
        out: &mut Vec<Candidate>,
    ) -> Result<(), MutateError> {
        let guarded = |pc: usize| guard_ranges.iter().any(|range| range.contains(&pc));
        let mut prev: Option<(usize, u8)> = None;

        for item in opcode::InsnIter::new(&code.code) {
            let (pc, op) = item?;
            if guarded(pc) {
                prev = Some((pc, op));
                continue;
            }
            for kind in self.kinds.iter() {
                let candidate = match kind {
                    MutationKind::NegateConditional => negate_conditional(code, pc, op),
                    MutationKind::SwapArith => swap_arith(pc, op),
                    MutationKind::Increments => increments(code, pc, op),
                    MutationKind::ReturnValues => {
                        return_values(code, pc, op, prev.filter(|(ppc, _)| !guarded(*ppc)))
                    }
                    MutationKind::InlineConstants => inline_constants(code, pc, op),
                    MutationKind::ConstantPool => constant_pool(
                        image,
                        code,
                        pc,
                        op,
                        method_index,
                        ldc_refs,
                        shared,
                    ),
                    MutationKind::Switch => switch(code, pc, op)?,
                    MutationKind::Stores => stores(code, pc, op),
                };
                if let Some((edit, description)) = candidate {
                    out.push(Candidate {
                        method_index,
                        pc,
                        kind,
                        edit,
                        description,
                    });
                }
            }
            prev = Some((pc, op));
        }
        Ok(())
    }
}

type Site = Option<(Edit, String)>;

fn negate_conditional(code: &CodeAttr, pc: usize, op: u8) -> Site {
    let negated = kinds::negated_branch(op)?;
    let bytes = vec![negated, code.code[pc + 1], code.code[pc + 2]];
    Some((
        Edit::ReplaceInsn { pc, bytes },
        format!("negated conditional ({} -> {})", mnemonic(op), mnemonic(negated)),
    ))
}

fn swap_arith(pc: usize, op: u8) -> Site {
    let swapped = kinds::swapped_arith(op)?;
    Some((
        Edit::ReplaceInsn { pc, bytes: vec![swapped] },
        format!("replaced {} with {}", mnemonic(op), mnemonic(swapped)),
    ))
}

fn increments(code: &CodeAttr, pc: usize, op: u8) -> Site {
    match op {
        IINC => {
            let constant = code.code[pc + 2] as i8;
            if constant == i8::MIN {
                return None;
            }
            let bytes = vec![IINC, code.code[pc + 1], (-constant) as u8];
            Some((
                Edit::ReplaceInsn { pc, bytes },
                format!("negated increment ({} -> {})", constant, -constant),
            ))
        }
        WIDE if code.code.get(pc + 1) == Some(&IINC) => {
            let constant = i16::from_be_bytes([code.code[pc + 4], code.code[pc + 5]]);
            if constant == i16::MIN {
                return None;
            }
            let negated = (-constant).to_be_bytes();
            let bytes = vec![
                WIDE,
                IINC,
                code.code[pc + 2],
                code.code[pc + 3],
                negated[0],
                negated[1],
            ];
            Some((
                Edit::ReplaceInsn { pc, bytes },
                format!("negated increment ({} -> {})", constant, -constant),
            ))
        }
        _ => None,
    }
}

fn return_values(code: &CodeAttr, pc: usize, op: u8, prev: Option<(usize, u8)>) -> Site {
    if !(IRETURN..=ARETURN).contains(&op) {
        return None;
    }
    let (ppc, pop) = prev?;
    let (bytes, description) = match op {
        IRETURN => match pop {
            ICONST_M1..=ICONST_5 => {
                let (new_op, from, to) = kinds::perturbed_iconst(pop)?;
                (vec![new_op], format!("replaced return value {from} with {to}"))
            }
            BIPUSH => {
                let value = code.code[ppc + 1] as i8;
                let next = value.wrapping_add(1);
                (
                    vec![BIPUSH, next as u8],
                    format!("replaced return value {value} with {next}"),
                )
            }
            SIPUSH => {
                let value = i16::from_be_bytes([code.code[ppc + 1], code.code[ppc + 2]]);
                let next = value.wrapping_add(1);
                let operand = next.to_be_bytes();
                (
                    vec![SIPUSH, operand[0], operand[1]],
                    format!("replaced return value {value} with {next}"),
                )
            }
            _ => return None,
        },
        LRETURN => match pop {
            LCONST_0 => (vec![LCONST_1], "replaced return value 0 with 1".to_string()),
            LCONST_1 => (vec![LCONST_0], "replaced return value 1 with 0".to_string()),
            _ => return None,
        },
        FRETURN => match pop {
            FCONST_0 => (vec![FCONST_1], "replaced return value 0.0 with 1.0".to_string()),
            FCONST_1 => (vec![FCONST_0], "replaced return value 1.0 with 0.0".to_string()),
            FCONST_2 => (vec![FCONST_0], "replaced return value 2.0 with 0.0".to_string()),
            _ => return None,
        },
        DRETURN => match pop {
            DCONST_0 => (vec![DCONST_1], "replaced return value 0.0 with 1.0".to_string()),
            DCONST_1 => (vec![DCONST_0], "replaced return value 1.0 with 0.0".to_string()),
            _ => return None,
        },
        ARETURN => match pop {
            ALOAD_0..=ALOAD_3 => (
                vec![ACONST_NULL],
                "replaced returned reference with null".to_string(),
            ),
            // Two one-byte instructions stand in for the two-byte load; the
            // extra nop keeps every later offset intact.
            ALOAD => (
                vec![ACONST_NULL, NOP],
                "replaced returned reference with null".to_string(),
            ),
            _ => return None,
        },
        _ => return None,
    };
    Some((Edit::ReplaceInsn { pc: ppc, bytes }, description))
}

fn inline_constants(code: &CodeAttr, pc: usize, op: u8) -> Site {
    match op {
        ICONST_M1..=ICONST_5 => {
            let (new_op, from, to) = kinds::perturbed_iconst(op)?;
            Some((
                Edit::ReplaceInsn { pc, bytes: vec![new_op] },
                format!("replaced constant {from} with {to}"),
            ))
        }
        BIPUSH => {
            let value = code.code[pc + 1] as i8;
            let next = value.wrapping_add(1);
            Some((
                Edit::ReplaceInsn { pc, bytes: vec![BIPUSH, next as u8] },
                format!("replaced constant {value} with {next}"),
            ))
        }
        SIPUSH => {
            let value = i16::from_be_bytes([code.code[pc + 1], code.code[pc + 2]]);
            let next = value.wrapping_add(1);
            let operand = next.to_be_bytes();
            Some((
                Edit::ReplaceInsn { pc, bytes: vec![SIPUSH, operand[0], operand[1]] },
                format!("replaced constant {value} with {next}"),
            ))
        }
        _ => None,
    }
}

fn constant_pool(
    image: &ClassImage,
    code: &CodeAttr,
    pc: usize,
    op: u8,
    method_index: usize,
    ldc_refs: &[BTreeSet<u16>],
    shared: &BTreeSet<u16>,
) -> Site {
    let index = match op {
        LDC => code.code[pc + 1] as u16,
        LDC_W | LDC2_W => u16::from_be_bytes([code.code[pc + 1], code.code[pc + 2]]),
        _ => return None,
    };
    // Only entries no other method (and no field initialiser) refers to.
    if shared.contains(&index) {
        return None;
    }
    for (other, refs) in ldc_refs.iter().enumerate() {
        if other != method_index && refs.contains(&index) {
            return None;
        }
    }
    match image.pool.get(index)? {
        Constant::Integer(value) => Some((
            Edit::PoolIncrement { index },
            format!("incremented pool constant {} -> {}", value, value.wrapping_add(1)),
        )),
        Constant::Long(value) => Some((
            Edit::PoolIncrement { index },
            format!("incremented pool constant {} -> {}", value, value.wrapping_add(1)),
        )),
        Constant::Float(bits) => {
            let value = f32::from_bits(*bits);
            Some((
                Edit::PoolIncrement { index },
                format!("incremented pool constant {} -> {}", value, value + 1.0),
            ))
        }
        Constant::Double(bits) => {
            let value = f64::from_bits(*bits);
            Some((
                Edit::PoolIncrement { index },
                format!("incremented pool constant {} -> {}", value, value + 1.0),
            ))
        }
        Constant::String(utf8) => {
            let text = image.pool.utf8(*utf8).unwrap_or("");
            Some((
                Edit::PoolBlankString { index },
                format!("replaced string constant \"{text}\" with empty string"),
            ))
        }
        _ => None,
    }
}

fn switch(code: &CodeAttr, pc: usize, op: u8) -> Result<Site, ClassFileError> {
    let read = |at: usize| -> Result<i32, ClassFileError> {
        code.code
            .get(at..at + 4)
            .and_then(|s| s.try_into().ok())
            .map(i32::from_be_bytes)
            .ok_or(ClassFileError::TruncatedCode { pc: at })
    };
    let base = switch_payload(pc);
    let (cases, first_target_at) = match op {
        TABLESWITCH => {
            let low = read(base + 4)?;
            let high = read(base + 8)?;
            ((high - low + 1) as usize, base + 12)
        }
        LOOKUPSWITCH => {
            let npairs = read(base + 4)? as usize;
            (npairs, base + 12)
        }
        _ => return Ok(None),
    };
    let step = if op == TABLESWITCH { 4 } else { 8 };
    if cases >= 2 {
        let a = first_target_at;
        let b = first_target_at + step;
        if read(a)? == read(b)? {
            return Ok(None);
        }
        return Ok(Some((
            Edit::SwapCode { a, b, len: 4 },
            "swapped switch case targets".to_string(),
        )));
    }
    if cases == 1 {
        let default = read(base)?;
        let target = read(first_target_at)?;
        if default == target {
            return Ok(None);
        }
        return Ok(Some((
            Edit::OverwriteCode {
                at: base,
                bytes: target.to_be_bytes().to_vec(),
            },
            "redirected switch default to case target".to_string(),
        )));
    }
    Ok(None)
}

/// `(two-byte family opcode, slot, is-short-form)` for a store instruction,
/// or `None` when `op` is not a store.
fn store_family(code: &[u8], pc: usize, op: u8) -> Option<(u8, u16, bool)> {
    match op {
        ISTORE..=ASTORE => Some((op, code[pc + 1] as u16, false)),
        ISTORE_0..=ASTORE_3 => {
            let family = ISTORE + (op - ISTORE_0) / 4;
            Some((family, ((op - ISTORE_0) % 4) as u16, true))
        }
        _ => None,
    }
}

fn stores(code: &CodeAttr, pc: usize, op: u8) -> Site {
    let (family, slot, short_form) = store_family(&code.code, pc, op)?;
    let wide_slot = matches!(family, LSTORE | DSTORE);
    let load_family = family - (ISTORE - ILOAD);
    let short_store_base = ISTORE_0 + (family - ISTORE) * 4;
    let short_load_base = ILOAD_0 + (family - ISTORE) * 4;

    let same_family_touch = |candidate: u16| {
        let mut found = false;
        for item in opcode::InsnIter::new(&code.code) {
            let Ok((qpc, qop)) = item else { break };
            if qpc == pc {
                continue;
            }
            let touches = match qop {
                q if q == family || q == load_family => {
                    code.code.get(qpc + 1).copied().map(u16::from) == Some(candidate)
                }
                q if candidate <= 3
                    && (q == short_store_base + candidate as u8
                        || q == short_load_base + candidate as u8) =>
                {
                    true
                }
                _ => false,
            };
            if touches {
                found = true;
                break;
            }
        }
        found
    };

    let limit = code.max_locals as u16;
    let fits = |candidate: u16| {
        candidate < limit && (!wide_slot || candidate + 1 < limit)
    };

    for candidate in [slot.checked_add(1), slot.checked_sub(1)].into_iter().flatten() {
        if !fits(candidate) || !same_family_touch(candidate) {
            continue;
        }
        let bytes = if short_form {
            if candidate > 3 {
                continue;
            }
            vec![short_store_base + candidate as u8]
        } else {
            if candidate > u8::MAX as u16 {
                continue;
            }
            vec![family, candidate as u8]
        };
        return Some((
            Edit::ReplaceInsn { pc, bytes },
            format!("redirected store from local {slot} to local {candidate}"),
        ));
    }
    None
}

/// Byte ranges covered by assertion machinery: the `GETSTATIC
/// $assertionsDisabled; IFNE skip; ...` guard bodies, and in `<clinit>` the
/// prologue that computes and stores the flag.
fn assertion_ranges(image: &ClassImage, code: &CodeAttr) -> Result<Vec<Range<usize>>, ClassFileError> {
    let mut ranges = Vec::new();
    for item in opcode::InsnIter::new(&code.code) {
        let (pc, op) = item?;
        if op != GETSTATIC && op != PUTSTATIC {
            continue;
        }
        let index = u16::from_be_bytes([code.code[pc + 1], code.code[pc + 2]]);
        if image.pool.member_name(index) != Some("$assertionsDisabled") {
            continue;
        }
        if op == PUTSTATIC {
            ranges.push(0..pc + 3);
            continue;
        }
        let branch_pc = pc + 3;
        if code.code.get(branch_pc) == Some(&IFNE) {
            let offset =
                i16::from_be_bytes([code.code[branch_pc + 1], code.code[branch_pc + 2]]) as isize;
            let target = branch_pc as isize + offset;
            if target > pc as isize {
                ranges.push(pc..target as usize);
            }
        }
    }
    Ok(ranges)
}

/// Pool indices referenced by `ldc`-family instructions, per method.
fn ldc_refs_per_method(image: &ClassImage) -> Result<Vec<BTreeSet<u16>>, ClassFileError> {
    let mut per_method = Vec::with_capacity(image.methods.len());
    for method in &image.methods {
        let mut refs = BTreeSet::new();
        if let Some(code) = method.code() {
            for item in opcode::InsnIter::new(&code.code) {
                let (pc, op) = item?;
                match op {
                    LDC => {
                        refs.insert(code.code[pc + 1] as u16);
                    }
                    LDC_W | LDC2_W => {
                        refs.insert(u16::from_be_bytes([code.code[pc + 1], code.code[pc + 2]]));
                    }
                    _ => {}
                }
            }
        }
        per_method.push(refs);
    }
    Ok(per_method)
}

/// Pool indices pinned by field `ConstantValue` attributes; these are never
/// safe to perturb on behalf of one method.
fn field_constant_refs(image: &ClassImage) -> BTreeSet<u16> {
    let mut refs = BTreeSet::new();
    for field in &image.fields {
        for attr in &field.attributes {
            if image.pool.utf8(attr.name_index) == Some("ConstantValue") && attr.data.len() == 2 {
                refs.insert(u16::from_be_bytes([attr.data[0], attr.data[1]]));
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests;
