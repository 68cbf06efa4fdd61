//! Runs every stage, in order, on the standalone engine.
//!
//! ```text
//! ingest (per source) -> join -> stats -> normalize -> design -> matrix
//! ```
//!
//! Each stage writes `mr-out-*` files under its own directory of the work
//! directory and hands `mr-out-0` of its upstream to the next stage as
//! `--metadata`. The last stage computes `XᵀX` of the design matrix `X`,
//! whose rows are the normalized days and whose columns are the variables.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use glob::glob;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::{
    codec::{decode_line, Line, Metadata},
    context::TaskContext,
    date::{DateKey, DateRange},
    error::{ConfigErrors, PipelineError},
    ingest::{IngestArgs, Shape},
    matrix::{format_row, parse_cell, Coordinate, Dims},
    record::TypedRecord,
    standalone::{engine::run_job, Job},
    workload,
};

fn default_reducers() -> u32 {
    4
}

fn default_separator() -> String {
    ",".to_string()
}

/// One raw input dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Unique name; also the directory the ingested dataset is written to.
    pub name: String,
    pub shape: Shape,
    /// Glob matching the source's CSV files.
    pub input: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub header: bool,
    #[serde(default)]
    pub comment_prefix: Option<String>,
    #[serde(default)]
    pub date_format: Option<String>,
    /// Column index overrides, by field name.
    #[serde(default)]
    pub columns: BTreeMap<String, usize>,
}

impl SourceConfig {
    /// The ingest stage arguments for this source.
    pub fn ingest_args(&self, start: &str, end: &str) -> Vec<String> {
        let mut args = vec![
            format!("--start={start}"),
            format!("--end={end}"),
            format!("--separator={}", self.separator),
        ];
        if self.header {
            args.push("--header".to_string());
        }
        if let Some(prefix) = &self.comment_prefix {
            args.push(format!("--comment-prefix={prefix}"));
        }
        if let Some(format) = &self.date_format {
            args.push(format!("--date-format={format}"));
        }
        for (name, index) in &self.columns {
            args.push(format!("--column={name}={index}"));
        }
        args
    }
}

/// The whole pipeline, as read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub work_dir: String,
    #[serde(default = "default_reducers")]
    pub reducers: u32,
    /// First day kept (inclusive).
    pub start: String,
    /// First day dropped (exclusive).
    pub end: String,
    pub sources: Vec<SourceConfig>,
    /// The model's variables; also the factor list of the joined dataset.
    pub variables: Vec<String>,
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline configuration {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing pipeline configuration {}", path.display()))
    }

    /// Checks the whole configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut errors = ConfigErrors::new();

        if self.work_dir.trim().is_empty() {
            errors.push("work_dir must not be empty");
        }
        if self.reducers == 0 {
            errors.push("reducers must be at least 1");
        }
        if let Err(problems) = DateRange::parse(Some(&self.start), Some(&self.end)) {
            problems.into_iter().for_each(|p| errors.push(p));
        }
        let range_problems = errors.messages().to_vec();

        if self.sources.is_empty() {
            errors.push("no sources configured");
        }
        let mut names = BTreeSet::new();
        for source in &self.sources {
            let name = &source.name;
            if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                errors.push(format!("source name `{name}` cannot be used as a directory name"));
            }
            if !names.insert(name.as_str()) {
                errors.push(format!("source `{name}` is configured more than once"));
            }
            match IngestArgs::try_parse_from(source.ingest_args(&self.start, &self.end)) {
                Ok(args) => {
                    if let Err(problems) = args.validate(source.shape) {
                        for problem in problems.messages() {
                            if !range_problems.contains(problem) {
                                errors.push(format!("source `{name}`: {problem}"));
                            }
                        }
                    }
                }
                Err(e) => errors.push(format!("source `{name}`: {e}")),
            }
        }

        if self.variables.is_empty() {
            errors.push("no variables configured");
        }
        let mut seen = BTreeSet::new();
        for variable in &self.variables {
            if !seen.insert(variable.as_str()) {
                errors.push(format!("variable `{variable}` is listed more than once"));
            }
            let numeric = self.sources.iter().any(|source| {
                source
                    .shape
                    .schema()
                    .kind_of(variable)
                    .is_some_and(|kind| kind.is_numeric())
            });
            if !numeric {
                errors.push(format!(
                    "variable `{variable}` is not a numeric field of any configured source"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Where a finished run left its results.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    /// Directory of the normalized dataset.
    pub normalized: String,
    /// Directory of the `XᵀX` cells.
    pub product: String,
    /// Dimensions of `X`: days by variables.
    pub design: Dims,
}

impl PipelineOutput {
    /// Reads the product cells back, in row-major order.
    pub fn cells(&self) -> Result<BTreeMap<Coordinate, f64>> {
        load_product(&format!("{}/mr-out-*", self.product))
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn dir(&self, stage: &str) -> String {
        format!("{}/{}", self.config.work_dir.trim_end_matches('/'), stage)
    }

    /// Runs workload `name`, replacing whatever an earlier run left in
    /// `output`.
    fn run_stage(
        &self,
        name: &str,
        input: Vec<String>,
        output: String,
        args: Vec<String>,
        ctx: &TaskContext,
    ) -> Result<()> {
        if Path::new(&output).exists() {
            fs::remove_dir_all(&output).with_context(|| format!("clearing {}", output))?;
        }
        let job = Job {
            input,
            workload: name.to_string(),
            output,
            args,
        };
        run_job(&job, &workload::named(name)?, self.config.reducers, ctx)
            .with_context(|| format!("stage `{}` failed", name))
    }

    /// `--start`, `--end`, one `--variable` each and the upstream metadata.
    fn dataset_args(&self, flag: &str, metadata: &[String]) -> Vec<String> {
        let mut args = vec![
            format!("--start={}", self.config.start),
            format!("--end={}", self.config.end),
        ];
        args.extend(self.config.variables.iter().map(|v| format!("--{flag}={v}")));
        args.extend(metadata.iter().map(|m| format!("--metadata={m}")));
        args
    }

    pub fn run(&self, ctx: &TaskContext) -> Result<PipelineOutput> {
        let span = info_span!(parent: ctx.span(), "pipeline", work_dir = %self.config.work_dir);
        let ctx = ctx.with_span(span);
        let config = &self.config;

        let mut ingested = Vec::new();
        let mut ingest_metadata = Vec::new();
        for source in &config.sources {
            let output = self.dir(&format!("ingest/{}", source.name));
            self.run_stage(
                source.shape.name(),
                vec![source.input.clone()],
                output.clone(),
                source.ingest_args(&config.start, &config.end),
                &ctx,
            )?;
            ingested.push(format!("{output}/mr-out-*"));
            ingest_metadata.push(format!("{output}/mr-out-0"));
        }

        let joined = self.dir("join");
        self.run_stage(
            "join",
            ingested,
            joined.clone(),
            self.dataset_args("factor", &ingest_metadata),
            &ctx,
        )?;

        let joined_files = vec![format!("{joined}/mr-out-*")];
        let joined_metadata = vec![format!("{joined}/mr-out-0")];
        let stats = self.dir("stats");
        self.run_stage(
            "stats",
            joined_files.clone(),
            stats.clone(),
            self.dataset_args("variable", &joined_metadata),
            &ctx,
        )?;

        let normalized = self.dir("normalize");
        let mut args = self.dataset_args("variable", &joined_metadata);
        args.push(format!("--stats={stats}/mr-out-*"));
        self.run_stage("normalize", joined_files, normalized.clone(), args, &ctx)?;

        let (_, records) = load_dataset(&normalized)?;
        let x = design_matrix(&records, &config.variables);
        let design = Dims::new(x.len() as u32, config.variables.len() as u32);
        if x.is_empty() {
            bail!("no records left in {} to build the design matrix from", normalized);
        }
        info!(parent: ctx.span(), %design, "built design matrix");

        let design_dir = self.dir("design");
        write_rows(&format!("{design_dir}/xt"), &transpose(&x))?;
        write_rows(&format!("{design_dir}/x"), &x)?;

        let product = self.dir("matrix");
        let transposed = Dims::new(design.cols, design.rows);
        self.run_stage(
            "matrix",
            vec![format!("{design_dir}/xt/*"), format!("{design_dir}/x/*")],
            product.clone(),
            vec![
                format!("--lhs={transposed}"),
                format!("--rhs={design}"),
                "--lhs-input=*/design/xt/*".to_string(),
                "--rhs-input=*/design/x/*".to_string(),
                "--multiplicand=lhs".to_string(),
            ],
            &ctx,
        )?;

        info!(parent: ctx.span(), %product, "pipeline finished");
        Ok(PipelineOutput {
            normalized,
            product,
            design,
        })
    }
}

/// Reads a persisted dataset: the metadata of `mr-out-0` and every record
/// of every `mr-out-*` file, ordered by day.
pub fn load_dataset(dir: &str) -> Result<(Metadata, Vec<(NaiveDate, TypedRecord)>)> {
    let metadata = Metadata::load(&[format!("{dir}/mr-out-0")])?;
    let mut records = Vec::new();
    for path in glob(&format!("{dir}/mr-out-*"))?.flatten() {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading dataset file {}", path.display()))?;
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            if let Line::Record(DateKey::Day(day), record) = decode_line(line, &metadata.types)? {
                records.push((day, record));
            }
        }
    }
    records.sort_by_key(|(day, _)| *day);
    Ok((metadata, records))
}

/// One row per record, one column per variable. Absent or non-numeric
/// values read as `0.0`.
pub fn design_matrix<S: AsRef<str>>(records: &[(NaiveDate, TypedRecord)], variables: &[S]) -> Vec<Vec<f64>> {
    records
        .iter()
        .map(|(_, record)| {
            variables
                .iter()
                .map(|v| record.get_f64(v.as_ref()).unwrap_or(0.0))
                .collect()
        })
        .collect()
}

pub fn transpose(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let cols = rows.first().map_or(0, Vec::len);
    (0..cols)
        .map(|col| rows.iter().map(|row| row[col]).collect())
        .collect()
}

/// Writes `rows` as matrix input, `row\tv0,v1,...`, into `dir/part-0`.
fn write_rows(dir: &str, rows: &[Vec<f64>]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir))?;
    let mut text = String::new();
    for (i, row) in rows.iter().enumerate() {
        text.push_str(&format_row(i as u32, row));
        text.push('\n');
    }
    let path = format!("{dir}/part-0");
    fs::write(&path, text).with_context(|| format!("writing {}", path))
}

/// Reads every `row,col\tvalue` cell of the files matching `pattern`.
pub fn load_product(pattern: &str) -> Result<BTreeMap<Coordinate, f64>> {
    let mut cells = BTreeMap::new();
    for path in glob(pattern)?.flatten() {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading product file {}", path.display()))?;
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let (coord, value) = parse_cell(line)?;
            cells.insert(coord, value);
        }
    }
    Ok(cells)
}
