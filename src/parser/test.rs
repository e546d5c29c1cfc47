use crate::error::FormatError;
use crate::leb128;
use crate::module::{
    CustomPayload, CustomSection, ExportKind, FuncBody, FuncType, Instruction, Module,
    NameSubsection, Section, ValType,
};
use crate::parser::parse;
use crate::testutil::{add_module, two_exit_module, Fixture, FuncSpec};

const HEADER: [u8; 8] = [0x00, b'a', b's', b'm', 0x01, 0x00, 0x00, 0x00];

fn module_bytes(sections: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut bytes = HEADER.to_vec();
    for (id, payload) in sections {
        bytes.push(*id);
        leb128::encode_u32(payload.len() as u32, &mut bytes);
        bytes.extend_from_slice(payload);
    }
    bytes
}

#[test]
fn empty_module_parses() {
    let module = parse(&HEADER).unwrap();
    assert!(module.sections.is_empty());
}

#[test]
fn bad_magic_is_rejected() {
    assert_eq!(parse(b"\0wat"), Err(FormatError::InvalidMagic));
    assert_eq!(parse(b"\0as"), Err(FormatError::InvalidMagic));
    assert_eq!(parse(&[]), Err(FormatError::InvalidMagic));
}

#[test]
fn wrong_version_is_rejected() {
    let mut bytes = HEADER.to_vec();
    bytes[4] = 0x02;
    assert_eq!(parse(&bytes), Err(FormatError::UnsupportedVersion(2)));
}

#[test]
fn truncated_version_is_rejected() {
    let bytes = [0x00, b'a', b's', b'm', 0x01, 0x00];
    assert_eq!(
        parse(&bytes),
        Err(FormatError::TruncatedSection { offset: 4 })
    );
}

#[test]
fn section_running_past_the_end_is_rejected() {
    let mut bytes = HEADER.to_vec();
    bytes.push(1);
    bytes.push(10);
    bytes.push(0);
    assert_eq!(
        parse(&bytes),
        Err(FormatError::TruncatedSection { offset: 9 })
    );
}

#[test]
fn out_of_order_sections_are_rejected() {
    let bytes = module_bytes(&[(3, vec![0]), (1, vec![0])]);
    match parse(&bytes) {
        Err(FormatError::SectionOutOfOrder { id: 1, .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn duplicate_sections_are_rejected() {
    let bytes = module_bytes(&[(1, vec![0]), (1, vec![0])]);
    assert!(matches!(
        parse(&bytes),
        Err(FormatError::SectionOutOfOrder { id: 1, .. })
    ));
}

#[test]
fn custom_sections_are_exempt_from_ordering() {
    let mut payload = Vec::new();
    leb128::encode_u32(3, &mut payload);
    payload.extend_from_slice(b"foo");
    payload.push(0xaa);
    let bytes = module_bytes(&[(1, vec![0]), (0, payload.clone()), (3, vec![0]), (0, payload)]);
    let module = parse(&bytes).unwrap();
    assert_eq!(module.sections.len(), 4);
}

#[test]
fn trailing_garbage_in_section_is_rejected() {
    let bytes = module_bytes(&[(1, vec![0, 0xff])]);
    assert!(matches!(
        parse(&bytes),
        Err(FormatError::SectionSizeMismatch { .. })
    ));
}

#[test]
fn fixture_module_decodes_fully() {
    let module = parse(&add_module()).unwrap();

    let types = module.type_section().unwrap();
    assert_eq!(types[0].params, vec![ValType::I32, ValType::I32]);
    assert_eq!(types[0].results, vec![ValType::I32]);

    let export = &module.export_section().unwrap()[0];
    assert_eq!(export.name, "add");
    assert_eq!(export.kind, ExportKind::Func);
    assert_eq!(export.index, 0);

    let body = &module.code_section().unwrap()[0];
    assert_eq!(
        body.instructions,
        vec![
            Instruction::LocalGet(0),
            Instruction::LocalGet(1),
            Instruction::I32Add,
            Instruction::End,
        ]
    );

    let names = module.name_section().unwrap();
    assert_eq!(
        names.subsections,
        vec![NameSubsection::Functions(vec![(0, "add".to_string())])]
    );
}

#[test]
fn block_structure_is_decoded_with_raw_blocktypes() {
    let module = parse(&two_exit_module()).unwrap();
    let body = &module.code_section().unwrap()[0];
    assert!(body
        .instructions
        .contains(&Instruction::If(crate::module::BlockType(vec![0x40]))));
    // Nested end plus function end.
    let ends = body
        .instructions
        .iter()
        .filter(|i| **i == Instruction::End)
        .count();
    assert_eq!(ends, 2);
}

#[test]
fn uninterpreted_opcodes_keep_their_operand_bytes() {
    let mut fixture = Fixture::default();
    fixture.funcs.push(
        FuncSpec::new(vec![], vec![])
            .body(vec![
                wasm_encoder::Instruction::I64Const(5),
                wasm_encoder::Instruction::Drop,
            ])
            .export("f"),
    );
    let module = parse(&fixture.build()).unwrap();
    let body = &module.code_section().unwrap()[0];
    assert_eq!(
        body.instructions,
        vec![
            Instruction::Other { opcode: 0x42, operands: vec![0x05] },
            Instruction::Other { opcode: 0x1a, operands: vec![] },
            Instruction::End,
        ]
    );
}

#[test]
fn table_and_data_sections_pass_through_opaque() {
    let mut fixture = Fixture::default();
    fixture
        .funcs
        .push(FuncSpec::new(vec![], vec![]).export("f"));
    fixture.func_table = vec![0];
    let module = parse(&fixture.build()).unwrap();
    assert!(module
        .sections
        .iter()
        .any(|s| matches!(s, Section::Opaque { id: 4, .. })));
}

#[test]
fn element_function_lists_are_decoded() {
    let mut fixture = Fixture::default();
    fixture
        .funcs
        .push(FuncSpec::new(vec![], vec![]).export("f"));
    fixture.func_table = vec![0];
    let module = parse(&fixture.build()).unwrap();
    let segments = module
        .sections
        .iter()
        .find_map(|s| match s {
            Section::Element(segments) => Some(segments),
            _ => None,
        })
        .unwrap();
    assert_eq!(segments[0].flags, 0);
    assert_eq!(
        segments[0].offset,
        Some(vec![Instruction::I32Const(0), Instruction::End])
    );
    assert_eq!(
        segments[0].items,
        crate::module::ElementItems::Functions(vec![0])
    );
}

#[test]
fn unknown_custom_sections_are_kept_raw() {
    let mut payload = Vec::new();
    leb128::encode_u32(5, &mut payload);
    payload.extend_from_slice(b"debug");
    payload.extend_from_slice(&[1, 2, 3]);
    let bytes = module_bytes(&[(0, payload)]);
    let module = parse(&bytes).unwrap();
    assert_eq!(
        module.sections[0],
        Section::Custom(CustomSection {
            name: "debug".to_string(),
            payload: CustomPayload::Raw(vec![1, 2, 3]),
        })
    );
}

#[test]
fn malformed_name_section_reports_reason() {
    let mut payload = Vec::new();
    leb128::encode_u32(4, &mut payload);
    payload.extend_from_slice(b"name");
    // Subsection id 1 claiming more bytes than remain.
    payload.push(1);
    payload.push(50);
    let bytes = module_bytes(&[(0, payload)]);
    assert!(matches!(
        parse(&bytes),
        Err(FormatError::MalformedNameSection { .. })
    ));
}

#[test]
fn vector_opcodes_are_unsupported() {
    let body = vec![0x00, 0xfd, 0x0b];
    let mut payload = Vec::new();
    leb128::encode_u32(1, &mut payload);
    leb128::encode_u32(body.len() as u32, &mut payload);
    payload.extend_from_slice(&body);
    let bytes = module_bytes(&[
        (1, vec![1, 0x60, 0, 0]),
        (3, vec![1, 0]),
        (10, payload),
    ]);
    assert!(matches!(
        parse(&bytes),
        Err(FormatError::UnsupportedOpcode { opcode: 0xfd, .. })
    ));
}

#[test]
fn body_with_trailing_bytes_is_rejected() {
    let body = vec![0x00, 0x0b, 0x0b];
    let mut payload = Vec::new();
    leb128::encode_u32(1, &mut payload);
    leb128::encode_u32(body.len() as u32, &mut payload);
    payload.extend_from_slice(&body);
    let bytes = module_bytes(&[
        (1, vec![1, 0x60, 0, 0]),
        (3, vec![1, 0]),
        (10, payload),
    ]);
    assert!(matches!(
        parse(&bytes),
        Err(FormatError::BodySizeMismatch { .. })
    ));
}

#[test]
fn body_without_terminator_is_rejected() {
    let body = vec![0x00, 0x41, 0x07];
    let mut payload = Vec::new();
    leb128::encode_u32(1, &mut payload);
    leb128::encode_u32(body.len() as u32, &mut payload);
    payload.extend_from_slice(&body);
    let bytes = module_bytes(&[
        (1, vec![1, 0x60, 0, 0]),
        (3, vec![1, 0]),
        (10, payload),
    ]);
    assert!(matches!(
        parse(&bytes),
        Err(FormatError::BodySizeMismatch { .. })
    ));
}

#[test]
fn function_and_code_counts_must_match() {
    let module = Module {
        sections: vec![
            Section::Type(vec![FuncType { params: vec![], results: vec![] }]),
            Section::Function(vec![0, 0]),
            Section::Code(vec![FuncBody {
                locals: vec![],
                instructions: vec![Instruction::End],
            }]),
        ],
    };
    let bytes = crate::encoder::serialize(&module);
    assert_eq!(
        parse(&bytes),
        Err(FormatError::FunctionCountMismatch { declared: 2, bodies: 1 })
    );
}

#[test]
fn function_section_without_code_section_is_rejected() {
    let bytes = module_bytes(&[(1, vec![1, 0x60, 0, 0]), (3, vec![1, 0])]);
    assert_eq!(
        parse(&bytes),
        Err(FormatError::FunctionCountMismatch { declared: 1, bodies: 0 })
    );
}

#[test]
fn import_kinds_decode() {
    let mut fixture = Fixture::default();
    fixture
        .imports
        .push(("env", "log", vec![wasm_encoder::ValType::I32], vec![]));
    fixture
        .funcs
        .push(FuncSpec::new(vec![], vec![]).export("f"));
    let module = parse(&fixture.build()).unwrap();
    let import = &module.import_section().unwrap()[0];
    assert_eq!(import.module, "env");
    assert_eq!(import.name, "log");
    assert_eq!(import.kind, crate::module::ImportKind::Func(0));
    assert_eq!(module.imported_function_count(), 1);
}
