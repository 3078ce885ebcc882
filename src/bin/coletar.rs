//! Collection CLI
//!
//! Reads configuration from the `PDPJ_*` environment variables and the
//! individuals from a JSON file (`[{"id", "name", "document"}, ...]`),
//! runs the full collection, and prints the run report as JSON.

use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use pdpj_collector::{Collector, Config, Individual};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let input_path = std::env::args()
        .nth(1)
        .context("usage: coletar <individuals.json>")?;

    let cfg = Config::from_env();
    let raw = fs::read_to_string(&input_path)
        .with_context(|| format!("failed to read {input_path}"))?;
    let individuals: Vec<Individual> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {input_path}"))?;
    info!(count = individuals.len(), input = %input_path, "input loaded");

    let mut collector = Collector::new(cfg).context("failed to build collector")?;
    let report = collector
        .run(&individuals)
        .await
        .context("collection run failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
