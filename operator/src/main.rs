use clap::Parser;
use owo_colors::OwoColorize;

mod clusters;
mod db;
mod events;
mod naming;
mod platform;
mod util;

#[derive(Parser, Debug)]
#[command(name = "coral-operator", about = "Operator managing CoralDB clusters")]
struct Args {
    /// Namespace to watch and deploy into.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Image used for the per-pod sidecar container.
    #[arg(long, env = "OPERATOR_IMAGE", default_value = "coraldb/coral-operator:latest")]
    operator_image: String,

    /// Port of the node-local database admin API.
    #[arg(long, env = "ADMIN_PORT", default_value_t = 10000)]
    admin_port: u16,

    /// Serve prometheus metrics on this port when set.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coral_common::init();
    let args = Args::parse();

    #[cfg(feature = "metrics")]
    if let Some(port) = args.metrics_port {
        tokio::spawn(util::metrics::serve(port));
    }

    let client = kube::Client::try_default().await?;
    let config = clusters::OperatorConfig {
        namespace: args.namespace,
        operator_image: args.operator_image,
        admin_port: args.admin_port,
    };
    clusters::run(client, config).await?;
    println!("{}", "👋 Cluster controller stopped.".green());
    Ok(())
}
