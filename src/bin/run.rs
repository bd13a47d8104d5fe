//! axon-run: load an AXGM model, execute the graph once, print the outputs.
//!
//! Exit status is 0 on success; any load/build/allocate/invoke failure
//! prints a message to stderr and exits 1.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use axon_runtime::cli;
use axon_runtime::container::Model;
use axon_runtime::engine::GraphInstance;
use axon_runtime::error::PipelineError;
use axon_runtime::ops::OpResolver;
use axon_runtime::tensor::ElemType;

#[derive(Parser)]
#[command(name = "axon-run", about = "Execute an AXGM model graph once")]
struct Args {
    /// Path to the .axgm model file
    model: PathBuf,
}

fn main() {
    let args = Args::parse();
    cli::init_logging();

    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), PipelineError> {
    let model = Arc::new(Model::load(&args.model)?);
    println!(
        "model loaded: {} tensors, {} ops",
        model.n_tensors(),
        model.n_ops()
    );

    let resolver = OpResolver::builtin();
    let mut graph = GraphInstance::build(model, &resolver)?;
    println!("graph built");

    graph.allocate()?;
    println!("tensors allocated");

    // Fill every f32 input with the ramp 1.0, 2.0, 3.0, ... as the demo
    // driver has always done. Other input types stay zeroed.
    for i in 0..graph.input_count() {
        if graph.input_elem(i) == ElemType::F32 {
            let input = graph.typed_input::<f32>(i)?;
            for (j, v) in input.iter_mut().enumerate() {
                *v = (j + 1) as f32;
            }
        }
    }
    println!("input data set");

    graph.invoke()?;
    println!("invocation complete");

    for i in 0..graph.output_count() {
        let elem = graph.output_elem(i);
        let shape = graph.output_shape(i).to_vec();
        println!("output {}: type={} shape={:?}", i, elem, shape);
        let rendered = match elem {
            ElemType::F32 => join(graph.typed_output::<f32>(i)?),
            ElemType::I32 => join(graph.typed_output::<i32>(i)?),
            ElemType::U8 => join(graph.typed_output::<u8>(i)?),
            ElemType::I64 => join(graph.typed_output::<i64>(i)?),
        };
        println!("{}", rendered);
    }

    Ok(())
}

fn join<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
