use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::instrument::{instrument, Selection, TraceConfig};
use crate::names::{function_names, NamePolicy};
use crate::runner::run_traced;
use crate::trace::{render_trace, DEFAULT_CAPACITY};

mod encoder;
mod error;
mod instrument;
mod leb128;
mod module;
mod names;
mod parser;
mod runner;
#[cfg(test)]
mod testutil;
mod trace;

/// Inject call/return tracing into a WebAssembly module.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Module to instrument.
    input: PathBuf,

    /// Where to write the instrumented module.
    #[arg(short, long, default_value = "output.wasm")]
    output: PathBuf,

    /// Trace every defined function, not just exported ones.
    #[arg(long, conflicts_with = "function")]
    all: bool,

    /// Trace only the named function(s). Repeatable.
    #[arg(short, long = "function")]
    function: Vec<String>,

    /// Ring buffer capacity, in records.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: u32,

    /// List the module's function index space and exit.
    #[arg(long)]
    list: bool,

    /// After writing the output, run this export under wasmi and print
    /// its trace.
    #[arg(long, value_name = "NAME")]
    invoke: Option<String>,

    /// i32 arguments for --invoke.
    #[arg(value_name = "ARGS", requires = "invoke", allow_negative_numbers = true)]
    invoke_args: Vec<i32>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(error) = run(args) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let bytes = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let mut module = parser::parse(&bytes)
        .with_context(|| format!("failed to parse {}", args.input.display()))?;

    if args.list {
        list_functions(&module)?;
        return Ok(());
    }

    let selection = if args.all {
        Selection::All
    } else if !args.function.is_empty() {
        Selection::Named(args.function.clone())
    } else {
        Selection::Exported
    };
    instrument(
        &mut module,
        &TraceConfig {
            selection,
            capacity: args.capacity,
        },
    )?;

    let output = encoder::serialize(&module);
    fs::write(&args.output, &output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    log::info!(
        "wrote {} ({} bytes, was {})",
        args.output.display(),
        output.len(),
        bytes.len()
    );

    if let Some(entry) = &args.invoke {
        let mut names = function_names(&module, NamePolicy::Lenient)?;
        names.fill_from_exports(&module);
        let outcome = run_traced(&output, entry, &args.invoke_args)?;
        print!("{}", render_trace(&outcome.records, &names));
        for result in &outcome.results {
            match result.i32() {
                Some(value) => println!("{entry} = {value}"),
                None => println!("{entry} = {result:?}"),
            }
        }
    }
    Ok(())
}

/// Prints every function in the index space with its signature, the way
/// the module numbers them.
fn list_functions(module: &module::Module) -> anyhow::Result<()> {
    let mut names = function_names(module, NamePolicy::Lenient)?;
    names.fill_from_exports(module);
    let imports = module.imported_function_count();
    let total = imports + module.defined_function_count();
    for index in 0..total {
        let ty = module
            .function_type(index)
            .map(ToString::to_string)
            .unwrap_or_else(|| "?".to_string());
        let name = names.get(index).unwrap_or("<unnamed>");
        let origin = if index < imports { " (imported)" } else { "" };
        println!("#{index} {name}: {ty}{origin}");
    }
    Ok(())
}
