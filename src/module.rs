//! Structured in-memory representation of a WebAssembly module.
//!
//! Sections the tool needs to understand are decoded; everything else is
//! kept as an opaque byte blob and re-emitted verbatim, so modules using
//! features this tool does not know about still pass through unharmed.


use std::fmt;

pub const MAGIC: [u8; 4] = *b"\0asm";
pub const VERSION: u32 = 1;
pub const PAGE_SIZE: u32 = 65536;

pub mod section_id {
    pub const CUSTOM: u8 = 0;
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNCTION: u8 = 3;
    pub const TABLE: u8 = 4;
    pub const MEMORY: u8 = 5;
    pub const GLOBAL: u8 = 6;
    pub const EXPORT: u8 = 7;
    pub const START: u8 = 8;
    pub const ELEMENT: u8 = 9;
    pub const CODE: u8 = 10;
    pub const DATA: u8 = 11;
    pub const DATA_COUNT: u8 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

impl ValType {
    pub fn from_byte(byte: u8) -> Option<ValType> {
        match byte {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            0x7b => Some(ValType::V128),
            0x70 => Some(ValType::FuncRef),
            0x6f => Some(ValType::ExternRef),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ValType::I32 => 0x7f,
            ValType::I64 => 0x7e,
            ValType::F32 => 0x7d,
            ValType::F64 => 0x7c,
            ValType::V128 => 0x7b,
            ValType::FuncRef => 0x70,
            ValType::ExternRef => 0x6f,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.params {
            write!(f, "{param} ")?;
        }
        match self.results.as_slice() {
            [] => write!(f, "-> ()"),
            results => {
                write!(f, "->")?;
                for result in results {
                    write!(f, " {result}")?;
                }
                Ok(())
            }
        }
    }
}

/// Memory limits. `shared` is preserved for pass-through but the injected
/// ring buffer writers are not synchronized for shared memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
    pub shared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    Func(u32),
    Table { ref_type: u8, limits: Limits },
    Memory(Limits),
    Global { val_type: u8, mutable: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

impl ExportKind {
    pub fn from_byte(byte: u8) -> Option<ExportKind> {
        match byte {
            0 => Some(ExportKind::Func),
            1 => Some(ExportKind::Table),
            2 => Some(ExportKind::Memory),
            3 => Some(ExportKind::Global),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ExportKind::Func => 0,
            ExportKind::Table => 1,
            ExportKind::Memory => 2,
            ExportKind::Global => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub val_type: u8,
    pub mutable: bool,
    pub init: Vec<Instruction>,
}

/// One element segment, decoded far enough to reach every function index
/// it stores, so that renumbering can reach them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSegment {
    pub flags: u32,
    pub table_index: Option<u32>,
    pub offset: Option<Vec<Instruction>>,
    /// Element kind byte (flags 1-3) or reference type byte (flags 5-7).
    pub kind: Option<u8>,
    pub items: ElementItems,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementItems {
    Functions(Vec<u32>),
    Expressions(Vec<Vec<Instruction>>),
}

/// Immediate operands of a memory access instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub align: u32,
    pub offset: u32,
}

/// Raw encoding of a block type: either a single shorthand byte or a
/// signed LEB128 type index. Kept as bytes since the engine never needs
/// to interpret it, only to re-emit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockType(pub Vec<u8>);

impl BlockType {
    pub const EMPTY: u8 = 0x40;

    pub fn empty() -> BlockType {
        BlockType(vec![BlockType::EMPTY])
    }
}

/// One instruction. Only the opcodes the instrumentation engine inserts,
/// renumbers, or tracks nesting with are decoded; the rest keep their
/// opcode and raw operand bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Unreachable,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    End,
    Return,
    Call(u32),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    I32Load(MemArg),
    I32Store(MemArg),
    I32Const(i32),
    I32Add,
    I32Mul,
    I32RemU,
    I32LtU,
    RefFunc(u32),
    Other { opcode: u8, operands: Vec<u8> },
}

/// One entry of the code section: local declarations plus the flat
/// instruction sequence, terminated by `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncBody {
    pub locals: Vec<(u32, ValType)>,
    pub instructions: Vec<Instruction>,
}

impl FuncBody {
    /// Total number of declared locals, not counting parameters.
    pub fn local_count(&self) -> u32 {
        self.locals.iter().map(|(count, _)| count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    pub payload: CustomPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomPayload {
    Name(NameSection),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameSection {
    pub subsections: Vec<NameSubsection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameSubsection {
    /// Function names: (function index, name) pairs.
    Functions(Vec<(u32, String)>),
    /// Local names, keyed by function index. Inner maps are kept decoded
    /// only so the outer function indices can be renumbered.
    Locals(Vec<(u32, Vec<(u32, String)>)>),
    Raw { id: u8, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Type(Vec<FuncType>),
    Import(Vec<Import>),
    Function(Vec<u32>),
    Memory(Vec<Limits>),
    Global(Vec<Global>),
    Export(Vec<Export>),
    Start(u32),
    Element(Vec<ElementSegment>),
    Code(Vec<FuncBody>),
    Custom(CustomSection),
    Opaque { id: u8, bytes: Vec<u8> },
}

impl Section {
    pub fn id(&self) -> u8 {
        match self {
            Section::Type(_) => section_id::TYPE,
            Section::Import(_) => section_id::IMPORT,
            Section::Function(_) => section_id::FUNCTION,
            Section::Memory(_) => section_id::MEMORY,
            Section::Global(_) => section_id::GLOBAL,
            Section::Export(_) => section_id::EXPORT,
            Section::Start(_) => section_id::START,
            Section::Element(_) => section_id::ELEMENT,
            Section::Code(_) => section_id::CODE,
            Section::Custom(_) => section_id::CUSTOM,
            Section::Opaque { id, .. } => *id,
        }
    }
}

/// Position of a section id in the prescribed module ordering. Custom
/// and unknown sections have no rank; the data count section sorts just
/// before code.
pub fn section_rank(id: u8) -> Option<u8> {
    match id {
        1..=9 => Some(id),
        section_id::DATA_COUNT => Some(10),
        section_id::CODE => Some(11),
        section_id::DATA => Some(12),
        _ => None,
    }
}

/// One parsed module: magic and version are implicit (validated on parse,
/// fixed on serialize), sections keep their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub sections: Vec<Section>,
}

impl Module {
    pub fn type_section(&self) -> Option<&Vec<FuncType>> {
        self.sections.iter().find_map(|s| match s {
            Section::Type(types) => Some(types),
            _ => None,
        })
    }

    pub fn import_section(&self) -> Option<&Vec<Import>> {
        self.sections.iter().find_map(|s| match s {
            Section::Import(imports) => Some(imports),
            _ => None,
        })
    }

    pub fn import_section_mut(&mut self) -> Option<&mut Vec<Import>> {
        self.sections.iter_mut().find_map(|s| match s {
            Section::Import(imports) => Some(imports),
            _ => None,
        })
    }

    pub fn function_section(&self) -> Option<&Vec<u32>> {
        self.sections.iter().find_map(|s| match s {
            Section::Function(funcs) => Some(funcs),
            _ => None,
        })
    }

    pub fn memory_section_mut(&mut self) -> Option<&mut Vec<Limits>> {
        self.sections.iter_mut().find_map(|s| match s {
            Section::Memory(mems) => Some(mems),
            _ => None,
        })
    }

    pub fn export_section(&self) -> Option<&Vec<Export>> {
        self.sections.iter().find_map(|s| match s {
            Section::Export(exports) => Some(exports),
            _ => None,
        })
    }

    pub fn code_section(&self) -> Option<&Vec<FuncBody>> {
        self.sections.iter().find_map(|s| match s {
            Section::Code(bodies) => Some(bodies),
            _ => None,
        })
    }

    pub fn code_section_mut(&mut self) -> Option<&mut Vec<FuncBody>> {
        self.sections.iter_mut().find_map(|s| match s {
            Section::Code(bodies) => Some(bodies),
            _ => None,
        })
    }

    pub fn name_section(&self) -> Option<&NameSection> {
        self.sections.iter().find_map(|s| match s {
            Section::Custom(CustomSection {
                payload: CustomPayload::Name(names),
                ..
            }) => Some(names),
            _ => None,
        })
    }

    pub fn name_section_mut(&mut self) -> Option<&mut NameSection> {
        self.sections.iter_mut().find_map(|s| match s {
            Section::Custom(CustomSection {
                payload: CustomPayload::Name(names),
                ..
            }) => Some(names),
            _ => None,
        })
    }

    /// Number of imported functions. These occupy the front of the
    /// function index space, in import-section order.
    pub fn imported_function_count(&self) -> u32 {
        self.import_section().map_or(0, |imports| {
            imports
                .iter()
                .filter(|import| matches!(import.kind, ImportKind::Func(_)))
                .count() as u32
        })
    }

    /// Number of functions defined by the function/code sections.
    pub fn defined_function_count(&self) -> u32 {
        self.function_section().map_or(0, |funcs| funcs.len() as u32)
    }

    /// Signature of the function at `index` in the function index space.
    pub fn function_type(&self, index: u32) -> Option<&FuncType> {
        let imports = self.imported_function_count();
        let type_index = if index < imports {
            self.import_section()?
                .iter()
                .filter_map(|import| match import.kind {
                    ImportKind::Func(type_index) => Some(type_index),
                    _ => None,
                })
                .nth(index as usize)?
        } else {
            *self
                .function_section()?
                .get((index - imports) as usize)?
        };
        self.type_section()?.get(type_index as usize)
    }

    /// Inserts a known section at the position the prescribed ordering
    /// requires: directly after the last section of lower rank, so a
    /// trailing custom section (typically `"name"`) stays last.
    pub fn insert_section(&mut self, section: Section) {
        let rank = section_rank(section.id());
        let mut at = 0;
        for (i, existing) in self.sections.iter().enumerate() {
            match (section_rank(existing.id()), rank) {
                (Some(existing_rank), Some(rank)) if existing_rank < rank => at = i + 1,
                _ => {}
            }
        }
        self.sections.insert(at, section);
    }

    /// Index of a function type equal to `ty`, appending it if absent.
    /// Appending keeps all existing type indices stable.
    pub fn ensure_type(&mut self, ty: FuncType) -> u32 {
        if self.type_section().is_none() {
            self.insert_section(Section::Type(Vec::new()));
        }
        let types = self
            .sections
            .iter_mut()
            .find_map(|s| match s {
                Section::Type(types) => Some(types),
                _ => None,
            })
            .unwrap_or_else(|| unreachable!("type section inserted above"));
        if let Some(index) = types.iter().position(|existing| *existing == ty) {
            return index as u32;
        }
        types.push(ty);
        (types.len() - 1) as u32
    }
}
