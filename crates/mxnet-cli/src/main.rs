use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mxnet_core::{
    CachedOp, Context, NdManager, ParameterSet, Result, Shape, Symbol, engine, ops,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mxnet-cli")]
#[command(about = "oxidizedMXNet development CLI")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the inputs, outputs and layers of a symbol file.
    Inspect {
        symbol: PathBuf,
    },
    /// List operators known to the engine.
    Ops {
        /// Only show operators whose name contains this string.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Load `<dir>/<prefix>-symbol.json` + `<dir>/<prefix>.safetensors` and run one input.
    Run {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        prefix: String,
        /// Input shape, e.g. `1,3`.
        #[arg(long, value_delimiter = ',')]
        shape: Vec<i64>,
        /// Input values, comma separated.
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        values: Vec<f32>,
        /// Context to run in; defaults to `MXNET_RS_CONTEXT` or `cpu(0)`.
        #[arg(long)]
        context: Option<Context>,
    },
    /// Run a quick smoke test of the cached-op path.
    Smoke,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.cmd {
        Cmd::Inspect { symbol } => inspect(symbol),
        Cmd::Ops { filter } => list_ops(filter.as_deref()),
        Cmd::Run {
            dir,
            prefix,
            shape,
            values,
            context,
        } => run(dir, &prefix, shape, &values, context),
        Cmd::Smoke => smoke(),
    }
}

fn inspect(path: PathBuf) -> Result<()> {
    let symbol = Symbol::load(&path)?;
    println!("Symbol: {}", path.display());
    println!("Inputs: {:?}", symbol.all_names()?);
    println!("Aux states: {:?}", symbol.aux_states()?);
    println!("Heads: {:?}", symbol.head_outputs()?);
    println!("Layers:");
    for name in symbol.layer_names()? {
        println!("  {name}");
    }
    Ok(())
}

fn list_ops(filter: Option<&str>) -> Result<()> {
    let registry = ops::registry()?;
    let mut shown = 0;
    for info in registry.iter() {
        let name = ops::strip_op_prefix(&info.name);
        if filter.is_some_and(|f| !name.contains(f)) {
            continue;
        }
        let args: Vec<&str> = info.arguments.iter().map(|a| a.name.as_str()).collect();
        println!("{name:<24} ({}) {}", args.join(", "), info.description);
        shown += 1;
    }
    println!("\n{shown} of {} operators", registry.len());
    Ok(())
}

fn run(
    dir: PathBuf,
    prefix: &str,
    shape: Vec<i64>,
    values: &[f32],
    context: Option<Context>,
) -> Result<()> {
    let manager = NdManager::new(context.unwrap_or_else(Context::default_context));
    let block = mxnet_io::load_symbol_block(&dir, prefix, &manager)?;
    println!("Context: {}", manager.context());
    println!("Runtime inputs: {:?}", block.runtime_input_names()?);

    let mut op = block.cached_op(&manager)?;
    let input = manager.from_f32(values, &Shape::new(shape))?;
    for (name, out) in block
        .symbol()
        .head_outputs()?
        .iter()
        .zip(op.invoke(&[&input])?)
    {
        println!(
            "{name} {} [{}] = {:?}",
            out.shape()?,
            out.storage_type(),
            out.to_vec_f32()?
        );
    }
    Ok(())
}

fn smoke() -> Result<()> {
    println!("Engine version: {}", engine::version()?);
    println!("GPUs: {}", engine::gpu_count()?);
    let manager = NdManager::default();
    println!("Context: {}\n", manager.context());

    // y = relu(x @ w^T + b), with w and b bound as parameters.
    let graph = json!({
        "nodes": [
            {"op": "null", "name": "x", "inputs": []},
            {"op": "null", "name": "w", "inputs": []},
            {"op": "null", "name": "b", "inputs": []},
            {"op": "FullyConnected", "name": "fc", "attrs": {"num_hidden": "2"},
             "inputs": [[0, 0, 0], [1, 0, 0], [2, 0, 0]]},
            {"op": "Activation", "name": "act", "attrs": {"act_type": "relu"},
             "inputs": [[3, 0, 0]]}
        ],
        "arg_nodes": [0, 1, 2],
        "heads": [[4, 0, 0]]
    });
    let symbol = Symbol::from_json(&graph.to_string())?;
    println!("inputs {:?} -> outputs {:?}", symbol.all_names()?, symbol.head_outputs()?);

    let mut params = ParameterSet::new();
    params.insert(
        "w",
        manager.from_f32(&[1.0, 0.0, 0.0, -1.0], &Shape::new(vec![2, 2]))?,
    )?;
    params.insert("b", manager.from_f32(&[0.5, 0.5], &Shape::new(vec![2]))?)?;

    let mut op = CachedOp::builder(&symbol, &manager)
        .parameters(&params)
        .build()?;
    println!("runtime slots: {:?}", op.partition().runtime_names());

    for x in [[1.0f32, 2.0], [-3.0, -4.0]] {
        let input = manager.from_f32(&x, &Shape::new(vec![1, 2]))?;
        let out = op.invoke(&[&input])?;
        println!("relu(fc({x:?})) = {:?}", out[0].to_vec_f32()?);
    }

    println!("\nAll smoke tests passed.");
    Ok(())
}
