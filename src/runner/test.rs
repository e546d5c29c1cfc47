use crate::encoder::serialize;
use crate::instrument::{instrument, Selection, TraceConfig};
use crate::parser::parse;
use crate::runner::run_traced;
use crate::testutil::{add_module, chain_module, factorial_module, two_exit_module, void_module};
use crate::trace::TraceRecord;

fn instrumented(wasm: &[u8], selection: Selection, capacity: u32) -> Vec<u8> {
    let mut module = parse(wasm).unwrap();
    instrument(&mut module, &TraceConfig { selection, capacity }).unwrap();
    serialize(&module)
}

#[test]
fn add_keeps_its_result_and_traces_one_call() {
    let wasm = instrumented(&add_module(), Selection::Exported, 16);
    let outcome = run_traced(&wasm, "add", &[3, 4]).unwrap();
    assert_eq!(outcome.results[0].i32(), Some(7));
    assert_eq!(
        outcome.records,
        vec![TraceRecord::Call(4), TraceRecord::ReturnValue(7)]
    );
}

#[test]
fn both_exit_paths_are_traced() {
    let wasm = instrumented(&two_exit_module(), Selection::Exported, 16);

    let outcome = run_traced(&wasm, "sign", &[5]).unwrap();
    assert_eq!(
        outcome.records,
        vec![TraceRecord::Call(4), TraceRecord::ReturnValue(1)]
    );

    let outcome = run_traced(&wasm, "sign", &[-5]).unwrap();
    assert_eq!(
        outcome.records,
        vec![TraceRecord::Call(4), TraceRecord::ReturnValue(0)]
    );
}

#[test]
fn nested_calls_keep_stack_discipline() {
    let wasm = instrumented(&chain_module(), Selection::All, 64);
    let outcome = run_traced(&wasm, "start_chain", &[21]).unwrap();
    assert_eq!(outcome.results[0].i32(), Some(42));
    assert_eq!(
        outcome.records,
        vec![
            TraceRecord::Call(6),
            TraceRecord::Call(5),
            TraceRecord::Call(4),
            TraceRecord::ReturnValue(42),
            TraceRecord::ReturnValue(42),
            TraceRecord::ReturnValue(42),
        ]
    );
}

#[test]
fn recursion_unwinds_in_order() {
    let wasm = instrumented(&factorial_module(), Selection::All, 64);
    let outcome = run_traced(&wasm, "factorial", &[4]).unwrap();
    assert_eq!(outcome.results[0].i32(), Some(24));

    let calls = outcome
        .records
        .iter()
        .filter(|r| matches!(r, TraceRecord::Call(_)))
        .count();
    assert_eq!(calls, 4);
    assert_eq!(outcome.records.last(), Some(&TraceRecord::ReturnValue(24)));

    // Innermost call returns first.
    let first_return = outcome
        .records
        .iter()
        .position(|r| matches!(r, TraceRecord::ReturnValue(_)))
        .unwrap();
    assert_eq!(first_return, 4);
    assert_eq!(outcome.records[first_return], TraceRecord::ReturnValue(1));
}

#[test]
fn ring_keeps_newest_records_once_full() {
    let wasm = instrumented(&add_module(), Selection::Exported, 4);
    // Three calls write six records into four slots; the first call's
    // pair is overwritten.
    let records = run_many(&wasm, &[(1, 1), (2, 2), (3, 3)]);
    assert_eq!(
        records,
        vec![
            TraceRecord::Call(4),
            TraceRecord::ReturnValue(4),
            TraceRecord::Call(4),
            TraceRecord::ReturnValue(6),
        ]
    );
}

#[test]
fn void_functions_trace_a_void_return() {
    let wasm = instrumented(&void_module(), Selection::Exported, 16);
    let outcome = run_traced(&wasm, "poke", &[9]).unwrap();
    assert!(outcome.results.is_empty());
    assert_eq!(
        outcome.records,
        vec![TraceRecord::Call(4), TraceRecord::ReturnVoid]
    );
}

#[test]
fn default_selection_skips_internal_calls() {
    let wasm = instrumented(&chain_module(), Selection::Exported, 16);
    let outcome = run_traced(&wasm, "start_chain", &[10]).unwrap();
    assert_eq!(outcome.results[0].i32(), Some(20));
    assert_eq!(
        outcome.records,
        vec![TraceRecord::Call(6), TraceRecord::ReturnValue(20)]
    );
}

#[test]
fn missing_entry_point_is_an_error() {
    let wasm = instrumented(&add_module(), Selection::Exported, 16);
    assert!(run_traced(&wasm, "nope", &[]).is_err());
}

#[test]
fn wrong_argument_count_is_an_error() {
    let wasm = instrumented(&add_module(), Selection::Exported, 16);
    assert!(run_traced(&wasm, "add", &[1]).is_err());
}

/// Calls `add` several times inside one instance so the ring accumulates
/// across calls, returning the final decode.
fn run_many(wasm: &[u8], calls: &[(i32, i32)]) -> Vec<TraceRecord> {
    use wasmi::{Engine, Linker, Module, Store};

    let engine = Engine::default();
    let module = Module::new(&engine, wasm).unwrap();
    let mut store = Store::new(&engine, ());
    let linker = <Linker<()>>::new(&engine);
    let instance = linker
        .instantiate(&mut store, &module)
        .unwrap()
        .start(&mut store)
        .unwrap();

    let add = instance
        .get_typed_func::<(i32, i32), i32>(&store, "add")
        .unwrap();
    for &(a, b) in calls {
        add.call(&mut store, (a, b)).unwrap();
    }
    let base = instance
        .get_typed_func::<(), i32>(&store, crate::trace::EXPOSE_TRACER)
        .unwrap()
        .call(&mut store, ())
        .unwrap();
    let memory = instance.get_memory(&store, "memory").unwrap();
    crate::trace::read_trace(memory.data(&store), base as usize)
}
