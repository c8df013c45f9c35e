use super::*;
use crate::classfile::pool::ConstPool;
use crate::classfile::{ClassImage, MethodAttr, MethodInfo, RawAttribute};

fn build_image(methods: Vec<(&str, &str, u16, Vec<u8>)>) -> ClassImage {
    let mut pool = ConstPool::new();
    let this_name = pool.utf8_index("demo/Target");
    let super_name = pool.utf8_index("java/lang/Object");
    let this_class = pool.push(Constant::Class(this_name));
    let super_class = pool.push(Constant::Class(super_name));
    let code_name = pool.utf8_index("Code");
    let line_table = pool.utf8_index("LineNumberTable");

    let mut infos = Vec::new();
    for (name, descriptor, max_locals, code) in methods {
        let name_index = pool.utf8_index(name);
        let descriptor_index = pool.utf8_index(descriptor);
        infos.push(MethodInfo {
            access: 0x0001,
            name_index,
            descriptor_index,
            attributes: vec![MethodAttr::Code(CodeAttr {
                name_index: code_name,
                max_stack: 4,
                max_locals,
                code,
                exceptions: Vec::new(),
                attributes: vec![RawAttribute {
                    name_index: line_table,
                    data: vec![0, 1, 0, 0, 0, 10],
                }],
            })],
        });
    }

    ClassImage {
        minor: 0,
        major: 49,
        pool,
        access: 0x0021,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: infos,
        attributes: Vec::new(),
    }
}

fn only(kind: MutationKind) -> KindSet {
    let mut set = KindSet::empty();
    set.enable(kind);
    set
}

/// `int max(int a, int b)` compiled the usual way.
fn max_method() -> Vec<u8> {
    vec![
        ILOAD_0,      // 0
        ILOAD_0 + 1,  // 1: iload_1
        IF_ICMPLE,    // 2 -> 7
        0,
        5,
        ILOAD_0,      // 5
        IRETURN,      // 6
        ILOAD_0 + 1,  // 7
        IRETURN,      // 8
    ]
}

#[test]
fn enumeration_is_deterministic() {
    let bytes = classfile::emit(&build_image(vec![("max", "(II)I", 2, max_method())]));
    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    let first = mutater.describe_points(&bytes).expect("first walk should succeed");
    let second = mutater.describe_points(&bytes).expect("second walk should succeed");
    assert_eq!(first, second);
    assert_eq!(
        mutater.count_points(&bytes).expect("count should succeed"),
        first.len()
    );
}

#[test]
fn negate_conditional_flips_branch_and_preserves_length() {
    let bytes = classfile::emit(&build_image(vec![("max", "(II)I", 2, max_method())]));
    let mutater = Mutater::new(only(MutationKind::NegateConditional), default_exclusions());
    assert_eq!(mutater.count_points(&bytes).expect("count should succeed"), 1);

    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    assert_eq!(mutation.bytes.len(), bytes.len());
    assert_ne!(mutation.bytes, bytes);
    assert!(mutation.description.contains("negated conditional"));
    assert_eq!(mutation.method, "max");
    assert_eq!(mutation.line, Some(10));

    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    let code = mutated.methods[0].code().expect("method should keep code");
    assert_eq!(code.code[2], IF_ICMPGT);
    // Branch target is untouched.
    assert_eq!(&code.code[3..5], &[0, 5]);
}

#[test]
fn swap_arith_uses_the_fixed_pairing() {
    let code = vec![ILOAD_0, ILOAD_0 + 1, IADD, ICONST_2, IMUL, IRETURN];
    let bytes = classfile::emit(&build_image(vec![("combine", "(II)I", 2, code)]));
    let mutater = Mutater::new(only(MutationKind::SwapArith), default_exclusions());
    let points = mutater.describe_points(&bytes).expect("walk should succeed");
    assert_eq!(points.len(), 2);
    assert!(points[0].description.contains("replaced iadd with isub"));
    assert!(points[1].description.contains("replaced imul with idiv"));

    let mutation = mutater
        .mutate(&bytes, 1)
        .expect("mutate should succeed")
        .expect("point 1 should exist");
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    assert_eq!(mutated.methods[0].code().expect("code").code[4], IDIV);
}

#[test]
fn return_value_point_sits_behind_the_constant_point() {
    let code = vec![BIPUSH, 42, IRETURN];
    let bytes = classfile::emit(&build_image(vec![("answer", "()I", 1, code)]));
    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    let points = mutater.describe_points(&bytes).expect("walk should succeed");
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].kind, MutationKind::InlineConstants);
    assert_eq!(points[1].kind, MutationKind::ReturnValues);
    assert!(points[1].description.contains("replaced return value 42 with 43"));

    let mutation = mutater
        .mutate(&bytes, 1)
        .expect("mutate should succeed")
        .expect("point 1 should exist");
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    assert_eq!(&mutated.methods[0].code().expect("code").code[..2], &[BIPUSH, 43]);
}

#[test]
fn returned_reference_is_replaced_by_null() {
    let code = vec![ALOAD_0, ARETURN];
    let bytes = classfile::emit(&build_image(vec![("identity", "()Ljava/lang/Object;", 1, code)]));
    let mutater = Mutater::new(only(MutationKind::ReturnValues), default_exclusions());
    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    assert_eq!(mutated.methods[0].code().expect("code").code[0], ACONST_NULL);
}

#[test]
fn wide_reference_load_gets_nop_padding() {
    let code = vec![ALOAD, 4, ARETURN];
    let bytes = classfile::emit(&build_image(vec![("pick", "()Ljava/lang/Object;", 6, code)]));
    let mutater = Mutater::new(only(MutationKind::ReturnValues), default_exclusions());
    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    assert_eq!(mutation.bytes.len(), bytes.len());
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    assert_eq!(
        &mutated.methods[0].code().expect("code").code[..3],
        &[ACONST_NULL, NOP, ARETURN]
    );
}

#[test]
fn increment_constant_is_negated_in_place() {
    let code = vec![IINC, 1, 3, RETURN];
    let bytes = classfile::emit(&build_image(vec![("bump", "(I)V", 2, code)]));
    let mutater = Mutater::new(only(MutationKind::Increments), default_exclusions());
    let points = mutater.describe_points(&bytes).expect("walk should succeed");
    assert_eq!(points.len(), 1);
    assert!(points[0].description.contains("negated increment (3 -> -3)"));

    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    assert_eq!(mutated.methods[0].code().expect("code").code[2] as i8, -3);
}

#[test]
fn unrepresentable_increment_negation_is_not_a_point() {
    let code = vec![IINC, 1, i8::MIN as u8, RETURN];
    let bytes = classfile::emit(&build_image(vec![("bump", "(I)V", 2, code)]));
    let mutater = Mutater::new(only(MutationKind::Increments), default_exclusions());
    assert_eq!(mutater.count_points(&bytes).expect("count should succeed"), 0);
}

#[test]
fn switch_case_targets_are_swapped() {
    let mut code = vec![ILOAD_0, TABLESWITCH, 0, 0];
    code.extend_from_slice(&27i32.to_be_bytes()); // default -> 28
    code.extend_from_slice(&0i32.to_be_bytes()); // low
    code.extend_from_slice(&1i32.to_be_bytes()); // high
    code.extend_from_slice(&23i32.to_be_bytes()); // case 0 -> 24
    code.extend_from_slice(&25i32.to_be_bytes()); // case 1 -> 26
    code.extend_from_slice(&[ICONST_0, IRETURN, ICONST_1, IRETURN, ICONST_2, IRETURN]);
    assert_eq!(code.len(), 30);

    let bytes = classfile::emit(&build_image(vec![("pick", "(I)I", 1, code)]));
    let mutater = Mutater::new(only(MutationKind::Switch), default_exclusions());
    assert_eq!(mutater.count_points(&bytes).expect("count should succeed"), 1);

    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    assert_eq!(mutation.bytes.len(), bytes.len());
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    let code = &mutated.methods[0].code().expect("code").code;
    let read = |at: usize| i32::from_be_bytes(code[at..at + 4].try_into().expect("4 bytes"));
    assert_eq!(read(16), 25);
    assert_eq!(read(20), 23);
}

#[test]
fn store_is_redirected_to_an_adjacent_live_slot() {
    let code = vec![ICONST_0, ISTORE_0 + 1, ICONST_1, ISTORE_0 + 2, ILOAD_0 + 1, IRETURN];
    let bytes = classfile::emit(&build_image(vec![("shuffle", "()I", 4, code)]));
    let mutater = Mutater::new(only(MutationKind::Stores), default_exclusions());
    let points = mutater.describe_points(&bytes).expect("walk should succeed");
    assert_eq!(points.len(), 2);
    assert!(points[0].description.contains("from local 1 to local 2"));

    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    assert_eq!(mutated.methods[0].code().expect("code").code[1], ISTORE_0 + 2);
}

#[test]
fn store_with_no_adjacent_evidence_is_not_a_point() {
    let code = vec![ICONST_0, ISTORE_0 + 1, ILOAD_0 + 1, IRETURN];
    let bytes = classfile::emit(&build_image(vec![("lonely", "()I", 4, code)]));
    let mutater = Mutater::new(only(MutationKind::Stores), default_exclusions());
    assert_eq!(mutater.count_points(&bytes).expect("count should succeed"), 0);
}

fn image_with_ldc(shared: bool) -> ClassImage {
    let mut image = build_image(vec![
        ("one", "()I", 1, Vec::new()),
        ("two", "()I", 1, Vec::new()),
    ]);
    let constant = image.pool.push(Constant::Integer(7));
    assert!(constant <= u8::MAX as u16);
    let one_code = vec![LDC, constant as u8, IRETURN];
    image.methods[0].code_mut().expect("code").code = one_code.clone();
    image.methods[1].code_mut().expect("code").code = if shared {
        one_code
    } else {
        vec![ICONST_0, IRETURN]
    };
    image
}

#[test]
fn pool_constant_referenced_by_one_method_is_mutated() {
    let image = image_with_ldc(false);
    let bytes = classfile::emit(&image);
    let mutater = Mutater::new(only(MutationKind::ConstantPool), default_exclusions());
    let points = mutater.describe_points(&bytes).expect("walk should succeed");
    assert_eq!(points.len(), 1);
    assert!(points[0].description.contains("incremented pool constant 7 -> 8"));

    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    assert_eq!(mutation.bytes.len(), bytes.len());
    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    assert!(mutated
        .pool
        .entries()
        .any(|(_, constant)| *constant == Constant::Integer(8)));
}

#[test]
fn pool_constant_shared_between_methods_is_skipped() {
    let bytes = classfile::emit(&image_with_ldc(true));
    let mutater = Mutater::new(only(MutationKind::ConstantPool), default_exclusions());
    assert_eq!(mutater.count_points(&bytes).expect("count should succeed"), 0);
}

#[test]
fn pool_string_is_blanked_via_a_fresh_utf8() {
    let mut image = build_image(vec![("greet", "()Ljava/lang/String;", 1, Vec::new())]);
    let text = image.pool.push(Constant::Utf8(b"hello".to_vec()));
    let string = image.pool.push(Constant::String(text));
    assert!(string <= u8::MAX as u16);
    image.methods[0].code_mut().expect("code").code = vec![LDC, string as u8, ARETURN];
    let bytes = classfile::emit(&image);

    let mutater = Mutater::new(only(MutationKind::ConstantPool), default_exclusions());
    let mutation = mutater
        .mutate(&bytes, 0)
        .expect("mutate should succeed")
        .expect("point 0 should exist");
    assert!(mutation.description.contains("\"hello\""));

    let mutated = classfile::parse(&mutation.bytes).expect("mutant should reparse");
    let repointed = match mutated.pool.get(string) {
        Some(Constant::String(utf8)) => *utf8,
        other => panic!("expected string entry, got {other:?}"),
    };
    assert_eq!(mutated.pool.utf8(repointed), Some(""));
    // The original text is still in the pool for every other referent.
    assert_eq!(mutated.pool.utf8(text), Some("hello"));
}

#[test]
fn assertion_guard_bodies_yield_no_points() {
    let mut image = build_image(vec![("check", "(I)V", 1, Vec::new())]);
    let field_name = image.pool.push(Constant::Utf8(b"$assertionsDisabled".to_vec()));
    let field_descriptor = image.pool.push(Constant::Utf8(b"Z".to_vec()));
    let name_and_type = image.pool.push(Constant::NameAndType {
        name: field_name,
        descriptor: field_descriptor,
    });
    let field = image.pool.push(Constant::FieldRef {
        class: image.this_class,
        name_and_type,
    });
    let error_name = image.pool.utf8_index("java/lang/AssertionError");
    let error_class = image.pool.push(Constant::Class(error_name));
    let init_name = image.pool.utf8_index("<init>");
    let void_descriptor = image.pool.utf8_index("()V");
    let init_nat = image.pool.push(Constant::NameAndType {
        name: init_name,
        descriptor: void_descriptor,
    });
    let init_ref = image.pool.push(Constant::MethodRef {
        class: error_class,
        name_and_type: init_nat,
    });

    let field_operand = field.to_be_bytes();
    let class_operand = error_class.to_be_bytes();
    let init_operand = init_ref.to_be_bytes();
    let code = vec![
        GETSTATIC, field_operand[0], field_operand[1], // 0
        IFNE, 0, 15,                                   // 3 -> 18
        ILOAD_0,                                       // 6
        IFGT, 0, 11,                                   // 7 -> 18
        NEW, class_operand[0], class_operand[1],       // 10
        0x59,                                          // 13: dup
        INVOKESPECIAL, init_operand[0], init_operand[1], // 14
        ATHROW,                                        // 17
        RETURN,                                        // 18
    ];
    image.methods[0].code_mut().expect("code").code = code;
    let bytes = classfile::emit(&image);

    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    assert_eq!(mutater.count_points(&bytes).expect("count should succeed"), 0);
}

#[test]
fn clinit_assertion_prologue_is_skipped() {
    let mut image = build_image(vec![("<clinit>", "()V", 0, Vec::new())]);
    let field_name = image.pool.push(Constant::Utf8(b"$assertionsDisabled".to_vec()));
    let field_descriptor = image.pool.push(Constant::Utf8(b"Z".to_vec()));
    let name_and_type = image.pool.push(Constant::NameAndType {
        name: field_name,
        descriptor: field_descriptor,
    });
    let field = image.pool.push(Constant::FieldRef {
        class: image.this_class,
        name_and_type,
    });
    let operand = field.to_be_bytes();
    // Abbreviated flag computation: the branchy iconst selection ahead of the
    // putstatic would otherwise enumerate as conditional and constant points.
    let code = vec![
        ICONST_0, IFNE, 0, 7, ICONST_1, GOTO, 0, 4, ICONST_0,
        PUTSTATIC, operand[0], operand[1], RETURN,
    ];
    image.methods[0].code_mut().expect("code").code = code;
    let bytes = classfile::emit(&image);

    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    assert_eq!(mutater.count_points(&bytes).expect("count should succeed"), 0);
}

#[test]
fn excluded_and_synthetic_methods_are_skipped() {
    let mut image = build_image(vec![
        ("main", "([Ljava/lang/String;)V", 1, vec![RETURN]),
        ("integrity", "()I", 1, vec![BIPUSH, 9, IRETURN]),
        ("lambda$0", "()I", 1, vec![BIPUSH, 9, IRETURN]),
        ("real", "()I", 1, vec![BIPUSH, 9, IRETURN]),
    ]);
    image.methods[2].access |= crate::classfile::ACC_SYNTHETIC;
    let bytes = classfile::emit(&image);

    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    let points = mutater.describe_points(&bytes).expect("walk should succeed");
    assert!(points.iter().all(|point| point.method == "real"));
    assert_eq!(points.len(), 2);
}

#[test]
fn index_past_the_end_returns_none() {
    let bytes = classfile::emit(&build_image(vec![("max", "(II)I", 2, max_method())]));
    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    let count = mutater.count_points(&bytes).expect("count should succeed");
    assert!(mutater
        .mutate(&bytes, count)
        .expect("mutate should succeed")
        .is_none());
}

#[test]
fn every_mutant_preserves_total_length_for_code_edits() {
    let code = vec![ILOAD_0, ILOAD_0 + 1, IADD, ICONST_2, IMUL, IRETURN];
    let mut methods = vec![("combine", "(II)I", 2, code)];
    methods.push(("max", "(II)I", 2, max_method()));
    let bytes = classfile::emit(&build_image(methods));
    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    let count = mutater.count_points(&bytes).expect("count should succeed");
    assert!(count > 0);
    for index in 0..count {
        let mutation = mutater
            .mutate(&bytes, index)
            .expect("mutate should succeed")
            .expect("point should exist");
        assert_eq!(mutation.bytes.len(), bytes.len(), "index {index}");
        assert_ne!(mutation.bytes, bytes, "index {index}");
        classfile::parse(&mutation.bytes).expect("mutant should reparse");
    }
}

#[test]
fn malformed_class_bytes_are_fatal() {
    let mutater = Mutater::new(KindSet::all(), default_exclusions());
    assert!(matches!(
        mutater.count_points(&[0, 1, 2, 3]),
        Err(MutateError::ClassFile(_))
    ));
}
