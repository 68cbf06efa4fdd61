use clap::{Parser, Subcommand};

pub mod engine;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single stage over a set of input files
    Submit {
        /// Glob spec for the input files; repeatable
        #[arg(short, long, required = true)]
        input: Vec<String>,

        /// Name of the workload
        #[arg(short, long)]
        workload: String,

        /// Output directory
        #[arg(short, long)]
        output: String,

        /// Number of reduce buckets
        #[arg(short, long, default_value_t = 4)]
        reducers: u32,

        /// Auxiliary arguments to pass to the MapReduce application.
        #[clap(value_parser, last = true)]
        args: Vec<String>,
    },
    /// Run every stage described by a pipeline configuration file
    Pipeline {
        /// Path of the JSON pipeline configuration
        #[arg(short, long)]
        config: String,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub input: Vec<String>,
    pub workload: String,
    pub output: String,
    pub args: Vec<String>,
}
