use std::sync::Arc;

use anyhow::*;
use clap::Parser;
use mrpipeline::pipeline::{Pipeline, PipelineConfig};
use mrpipeline::standalone::{engine::run_job, Args, Commands, Job};
use mrpipeline::*;
use tracing::info_span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn report(counters: &MemoryCounters) {
    for (group, name, value) in counters.snapshot() {
        tracing::info!(%group, %name, value, "counter");
    }
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let counters = Arc::new(MemoryCounters::new());
    let ctx = TaskContext::new(counters.clone(), info_span!("standalone"));

    match args.command {
        Commands::Submit {
            input,
            workload,
            output,
            reducers,
            args,
        } => {
            let engine = workload::named(&workload)?;
            let job = Job {
                input,
                workload,
                output,
                args,
            };
            run_job(&job, &engine, reducers, &ctx)?;
        }
        Commands::Pipeline { config } => {
            let pipeline = Pipeline::new(PipelineConfig::load(&config)?)?;
            let output = pipeline.run(&ctx)?;
            for (coord, value) in output.cells()? {
                println!("{}\t{}", coord, value);
            }
        }
    }

    report(&counters);
    Ok(())
}
