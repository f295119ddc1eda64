//! Tessel CLI - inspect graphs, render dot graphs, synthesize training graphs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tessel_cli::{grad, inspect};
use tessel_graph::{ModelSource, load_graph, save_graph, to_dot};

#[derive(Parser)]
#[command(name = "tessel")]
#[command(about = "Graph runtime with training graph synthesis", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect a graph's inputs, outputs and operators
    Inspect {
        /// Path to the graph document
        #[arg(value_name = "MODEL")]
        model: PathBuf,
    },
    /// Generate a Graphviz DOT file from a graph
    Dot {
        /// Path to the graph document
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Output file path (defaults to stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Synthesize the training graph of a forward graph
    Grad {
        /// Path to the forward graph document
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Initializers to train (comma separated)
        #[arg(long, value_delimiter = ',')]
        train: Vec<String>,

        /// User inputs that need gradients (comma separated)
        #[arg(long = "require-grad", value_delimiter = ',')]
        require_grad: Vec<String>,

        /// Input shape (format: name=d0,d1, can be repeated)
        #[arg(short, long = "shape")]
        shapes: Vec<String>,

        /// Output file path for the training graph (defaults to stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { model } => cmd_inspect(model)?,
        Commands::Dot { model, output } => cmd_dot(model, output)?,
        Commands::Grad {
            model,
            train,
            require_grad,
            shapes,
            output,
        } => cmd_grad(model, &train, &require_grad, &shapes, output)?,
    }

    Ok(())
}

fn load(model_path: PathBuf) -> Result<tessel_graph::Graph> {
    let display = model_path.display().to_string();
    load_graph(&ModelSource::Path(model_path))
        .with_context(|| format!("Failed to load graph from {}", display))
}

fn cmd_inspect(model_path: PathBuf) -> Result<()> {
    let graph = load(model_path)?;
    print!("{}", inspect::summarize(&graph));
    Ok(())
}

fn cmd_dot(model_path: PathBuf, output_path: Option<PathBuf>) -> Result<()> {
    let graph = load(model_path)?;
    let dot = to_dot(&graph);

    if let Some(output_path) = output_path {
        std::fs::write(&output_path, dot)
            .with_context(|| format!("Failed to write DOT output to {}", output_path.display()))?;
        eprintln!("Wrote DOT output to {}", output_path.display());
    } else {
        print!("{}", dot);
    }
    Ok(())
}

fn cmd_grad(
    model_path: PathBuf,
    train: &[String],
    require_grad: &[String],
    shape_args: &[String],
    output_path: Option<PathBuf>,
) -> Result<()> {
    let forward = load(model_path)?;
    let shapes = shape_args
        .iter()
        .map(|arg| grad::parse_shape(arg))
        .collect::<Result<Vec<_>>>()?;

    let (graph, info) = grad::synthesize(forward, train, require_grad, &shapes)?;

    eprintln!("Yield gradients: {:?}", info.backward_output_grad_names);
    eprintln!("Gradient outputs: {:?}", info.gradient_output_names);

    if let Some(output_path) = output_path {
        save_graph(&graph, &output_path).with_context(|| {
            format!("Failed to write training graph to {}", output_path.display())
        })?;
        eprintln!("Wrote training graph to {}", output_path.display());
    } else {
        let bytes = tessel_graph::to_bytes(&graph)?;
        println!("{}", String::from_utf8_lossy(&bytes));
    }
    Ok(())
}
