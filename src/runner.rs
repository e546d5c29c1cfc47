//! Host harness: instantiates an instrumented module under wasmi, calls
//! an exported function and reads the trace buffer back out of the
//! instance's memory.

#[cfg(test)]
mod test;

use anyhow::{anyhow, bail, Context};
use wasmi::{Engine, Linker, Memory, Module, Store, Val};

use crate::trace::{read_trace, TraceRecord, EXPOSE_TRACER, EXPOSE_TRACER_LEN, MEMORY_EXPORT};

pub struct RunOutcome {
    pub results: Vec<Val>,
    pub records: Vec<TraceRecord>,
}

/// Instantiates `wasm`, calls the export `entry` with `args` and decodes
/// the trace ring afterwards. Only i32 parameters are supported, matching
/// what the tracer itself can capture.
pub fn run_traced(wasm: &[u8], entry: &str, args: &[i32]) -> anyhow::Result<RunOutcome> {
    let engine = Engine::default();
    let module = Module::new(&engine, wasm).context("failed to load module")?;
    let mut store = Store::new(&engine, ());
    let linker = <Linker<()>>::new(&engine);
    let instance = linker
        .instantiate(&mut store, &module)
        .context("failed to instantiate module")?
        .start(&mut store)
        .context("start function trapped")?;

    let func = instance
        .get_func(&store, entry)
        .ok_or_else(|| anyhow!("no exported function named '{entry}'"))?;
    let ty = func.ty(&store);
    if ty.params().len() != args.len() {
        bail!(
            "'{entry}' takes {} argument(s), got {}",
            ty.params().len(),
            args.len()
        );
    }
    if !ty.params().iter().all(|p| *p == wasmi::core::ValType::I32) {
        bail!("'{entry}' has non-i32 parameters: {ty:?}");
    }

    let call_args: Vec<Val> = args.iter().map(|&v| Val::I32(v)).collect();
    let mut results: Vec<Val> = ty.results().iter().map(|ty| Val::default(*ty)).collect();
    func.call(&mut store, &call_args, &mut results)
        .with_context(|| format!("'{entry}' trapped"))?;

    let base = instance
        .get_typed_func::<(), i32>(&store, EXPOSE_TRACER)
        .context("module has no tracer exports; was it instrumented?")?
        .call(&mut store, ())?;
    // The count export is read for its side of the contract even though
    // the decoder re-reads it from the header.
    let _len = instance
        .get_typed_func::<(), i32>(&store, EXPOSE_TRACER_LEN)?
        .call(&mut store, ())?;

    let memory = find_memory(&instance, &store)
        .ok_or_else(|| anyhow!("module exports no memory to read the trace from"))?;
    let records = read_trace(memory.data(&store), base as usize);
    Ok(RunOutcome { results, records })
}

fn find_memory(instance: &wasmi::Instance, store: &Store<()>) -> Option<Memory> {
    if let Some(memory) = instance.get_memory(store, MEMORY_EXPORT) {
        return Some(memory);
    }
    instance
        .exports(store)
        .find_map(|export| export.into_memory())
}
