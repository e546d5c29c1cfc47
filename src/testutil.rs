//! Shared fixtures for tests: small modules assembled with wasm-encoder.

use wasm_encoder::{
    CodeSection, ConstExpr, ElementSection, Elements, ExportKind, ExportSection, Function,
    FunctionSection, ImportSection, Instruction, MemorySection, MemoryType, Module as EncModule,
    NameSection as EncNameSection, TypeSection, ValType,
};

pub struct FuncSpec {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub locals: Vec<(u32, ValType)>,
    pub body: Vec<Instruction<'static>>,
    pub export: Option<&'static str>,
    pub name: Option<&'static str>,
}

impl FuncSpec {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> FuncSpec {
        FuncSpec {
            params,
            results,
            locals: vec![],
            body: vec![],
            export: None,
            name: None,
        }
    }

    pub fn body(mut self, body: Vec<Instruction<'static>>) -> FuncSpec {
        self.body = body;
        self
    }

    pub fn export(mut self, name: &'static str) -> FuncSpec {
        self.export = Some(name);
        self
    }

    pub fn name(mut self, name: &'static str) -> FuncSpec {
        self.name = Some(name);
        self
    }

    pub fn locals(mut self, locals: Vec<(u32, ValType)>) -> FuncSpec {
        self.locals = locals;
        self
    }
}

pub struct Fixture {
    pub imports: Vec<(&'static str, &'static str, Vec<ValType>, Vec<ValType>)>,
    pub funcs: Vec<FuncSpec>,
    pub memory_pages: Option<u64>,
    pub export_memory: bool,
    pub func_table: Vec<u32>,
    pub emit_names: bool,
}

impl Default for Fixture {
    fn default() -> Fixture {
        Fixture {
            imports: vec![],
            funcs: vec![],
            memory_pages: None,
            export_memory: false,
            func_table: vec![],
            emit_names: true,
        }
    }
}

impl Fixture {
    pub fn build(&self) -> Vec<u8> {
        let mut types = TypeSection::new();
        let mut imports = ImportSection::new();
        let mut functions = FunctionSection::new();
        let mut exports = ExportSection::new();
        let mut codes = CodeSection::new();
        let mut func_names = wasm_encoder::NameMap::new();

        for (module, name, params, results) in &self.imports {
            let type_index = types.len();
            types.function(params.clone(), results.clone());
            imports.import(module, name, wasm_encoder::EntityType::Function(type_index));
        }
        let import_count = self.imports.len() as u32;

        for (i, spec) in self.funcs.iter().enumerate() {
            let type_index = types.len();
            types.function(spec.params.clone(), spec.results.clone());
            functions.function(type_index);
            let index = import_count + i as u32;
            if let Some(name) = spec.export {
                exports.export(name, ExportKind::Func, index);
            }
            if let Some(name) = spec.name {
                func_names.append(index, name);
            }
            let mut function = Function::new(spec.locals.clone());
            for instruction in &spec.body {
                function.instruction(instruction);
            }
            function.instruction(&Instruction::End);
            codes.function(&function);
        }

        let mut module = EncModule::new();
        module.section(&types);
        if import_count > 0 {
            module.section(&imports);
        }
        module.section(&functions);
        if !self.func_table.is_empty() {
            let mut tables = wasm_encoder::TableSection::new();
            tables.table(wasm_encoder::TableType {
                element_type: wasm_encoder::RefType::FUNCREF,
                table64: false,
                minimum: self.func_table.len() as u64,
                maximum: None,
            });
            module.section(&tables);
        }
        if let Some(pages) = self.memory_pages {
            let mut memories = MemorySection::new();
            memories.memory(MemoryType {
                minimum: pages,
                maximum: None,
                memory64: false,
                shared: false,
                page_size_log2: None,
            });
            module.section(&memories);
            if self.export_memory {
                exports.export("memory", ExportKind::Memory, 0);
            }
        }
        module.section(&exports);
        if !self.func_table.is_empty() {
            let mut elements = ElementSection::new();
            elements.active(
                None,
                &ConstExpr::i32_const(0),
                Elements::Functions(&self.func_table),
            );
            module.section(&elements);
        }
        module.section(&codes);
        if self.emit_names && !self.funcs.iter().all(|f| f.name.is_none()) {
            let mut names = EncNameSection::new();
            names.functions(&func_names);
            module.section(&names);
        }
        module.finish()
    }
}

/// `add(a, b) = a + b`, exported and named.
pub fn add_module() -> Vec<u8> {
    let mut fixture = Fixture::default();
    fixture.funcs.push(
        FuncSpec::new(vec![ValType::I32; 2], vec![ValType::I32])
            .body(vec![
                Instruction::LocalGet(0),
                Instruction::LocalGet(1),
                Instruction::I32Add,
            ])
            .export("add")
            .name("add"),
    );
    fixture.build()
}

/// A small call chain: `start_chain` calls `double` which calls `add`.
/// Only `start_chain` is exported.
pub fn chain_module() -> Vec<u8> {
    let mut fixture = Fixture::default();
    fixture.funcs.push(
        FuncSpec::new(vec![ValType::I32; 2], vec![ValType::I32])
            .body(vec![
                Instruction::LocalGet(0),
                Instruction::LocalGet(1),
                Instruction::I32Add,
            ])
            .name("add"),
    );
    fixture.funcs.push(
        FuncSpec::new(vec![ValType::I32], vec![ValType::I32])
            .body(vec![
                Instruction::LocalGet(0),
                Instruction::LocalGet(0),
                Instruction::Call(0),
            ])
            .name("double"),
    );
    fixture.funcs.push(
        FuncSpec::new(vec![ValType::I32], vec![ValType::I32])
            .body(vec![Instruction::LocalGet(0), Instruction::Call(1)])
            .export("start_chain")
            .name("start_chain"),
    );
    fixture.build()
}

/// `sign(x)`: returns 1 from inside an `if` for positive input, otherwise
/// falls through to return 0. Exercises both explicit return and implicit
/// end exits.
pub fn two_exit_module() -> Vec<u8> {
    let mut fixture = Fixture::default();
    fixture.funcs.push(
        FuncSpec::new(vec![ValType::I32], vec![ValType::I32])
            .body(vec![
                Instruction::LocalGet(0),
                Instruction::I32Const(0),
                Instruction::I32GtS,
                Instruction::If(wasm_encoder::BlockType::Empty),
                Instruction::I32Const(1),
                Instruction::Return,
                Instruction::End,
                Instruction::I32Const(0),
            ])
            .export("sign")
            .name("sign"),
    );
    fixture.build()
}

/// Recursive factorial, exported.
pub fn factorial_module() -> Vec<u8> {
    let mut fixture = Fixture::default();
    fixture.funcs.push(
        FuncSpec::new(vec![ValType::I32], vec![ValType::I32])
            .body(vec![
                Instruction::LocalGet(0),
                Instruction::I32Const(2),
                Instruction::I32LtS,
                Instruction::If(wasm_encoder::BlockType::Empty),
                Instruction::I32Const(1),
                Instruction::Return,
                Instruction::End,
                Instruction::LocalGet(0),
                Instruction::LocalGet(0),
                Instruction::I32Const(1),
                Instruction::I32Sub,
                Instruction::Call(0),
                Instruction::I32Mul,
            ])
            .export("factorial")
            .name("factorial"),
    );
    fixture.build()
}

/// An exported function with no results, storing into memory.
pub fn void_module() -> Vec<u8> {
    let mut fixture = Fixture::default();
    fixture.memory_pages = Some(1);
    fixture.export_memory = true;
    fixture.funcs.push(
        FuncSpec::new(vec![ValType::I32], vec![])
            .body(vec![
                Instruction::I32Const(0),
                Instruction::LocalGet(0),
                Instruction::I32Store(wasm_encoder::MemArg {
                    offset: 0,
                    align: 2,
                    memory_index: 0,
                }),
            ])
            .export("poke")
            .name("poke"),
    );
    fixture.build()
}
