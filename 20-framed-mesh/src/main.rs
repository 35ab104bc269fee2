use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use framed_mesh::{
    cli::{Cli, EvaluatorKind, NodeArgs},
    console,
    evaluator::{Calculator, Echo, Evaluator},
    node::{Node, NodeConfig, NodeHandle},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.command.node_config();
    let args = cli.command.node_args();
    match args.evaluator {
        EvaluatorKind::Calc => run(config, Calculator, args).await,
        EvaluatorKind::Echo => run(config, Echo, args).await,
    }
}

async fn run<E: Evaluator>(config: NodeConfig, evaluator: E, args: &NodeArgs) -> Result<()> {
    let node = Node::start(config, evaluator)
        .await
        .context("failed to start node")?;
    let handle = node.handle();

    if let Some(addr) = node.local_addr() {
        // The banner goes to stdout so scripts can pick up an ephemeral port.
        println!("listening on {addr}");
        info!(%addr, "node listening");
    }

    console::spawn_event_printer(handle.subscribe());
    let running = tokio::spawn(node.run_until_ctrl_c());

    run_startup_input(&handle, args).await?;
    console::spawn_console(handle).context("failed to start console thread")?;

    if let Err(err) = running.await {
        warn!("node task failed: {err:?}");
        return Err(err.into());
    }
    Ok(())
}

async fn run_startup_input(handle: &NodeHandle, args: &NodeArgs) -> Result<()> {
    if let Some(path) = &args.script {
        let script = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read script {}", path.display()))?;
        println!("{}", console::render_submission(&handle.submit(&script)));
    }
    for expression in &args.expressions {
        println!("{}", console::render_submission(&handle.submit(expression)));
    }
    Ok(())
}
