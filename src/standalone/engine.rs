use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use glob::glob;
use itertools::Itertools;
use std::{
    fs::{self, File},
    io::{Read, Write},
};
use tracing::{debug, info, info_span};

use crate::standalone::Job;
use crate::*;

// types related to this engine
type BucketIndex = u32;
type Buckets = DashMap<BucketIndex, Vec<KeyValue>>;

pub fn perform_map(
    job: &Job,
    engine: &Workload,
    serialized_args: &Bytes,
    num_reduce_worker: u32,
    ctx: &TaskContext,
) -> Result<Buckets> {
    let buckets: Buckets = Buckets::new();
    for spec in &job.input {
        // Iterator going through all files matching one input glob
        for pathspec in glob(spec)?.flatten() {
            let mut buf = Vec::new();
            {
                // a scope so that the file is closed right after reading
                let mut file = File::open(&pathspec)
                    .with_context(|| format!("opening input {}", pathspec.display()))?;
                file.read_to_end(&mut buf)?;
            }
            let filename = pathspec.to_str().unwrap_or("unknown").to_string();
            let span = info_span!(parent: ctx.span(), "map", workload = %job.workload, file = %filename);
            let task = ctx.with_span(span);
            // Stores the data read from each file as <Filename, All data in file>
            let input_kv = KeyValue {
                key: Bytes::from(filename),
                value: Bytes::from(buf),
            };
            let map_func = engine.map_fn;
            // For each <key, value> object that has been mapped by the map function,
            // insert it into the bucket its key partitions to
            for item in map_func(input_kv, serialized_args.clone(), &task)? {
                let KeyValue { key, value } = item?;
                let bucket_no = partition(&key, num_reduce_worker);

                buckets
                    .entry(bucket_no)
                    .or_default()
                    .push(KeyValue { key, value });
            }
            ctx.increment("engine", "map_tasks");
        }
    }

    Ok(buckets)
}

pub fn perform_reduce(
    job: &Job,
    engine: &Workload,
    serialized_args: &Bytes,
    buckets: Buckets,
    ctx: &TaskContext,
) -> Result<()> {
    let reduce_func = engine.reduce_fn;
    let output_dir = &job.output;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir))?;
    // For each bucket, sort the keys in ascending order and write the
    // reduced groups to the bucket's output file.
    for (reduce_id, mut bkt) in buckets.into_iter().sorted_by_key(|(id, _)| *id) {
        let span = info_span!(parent: ctx.span(), "reduce", workload = %job.workload, bucket = reduce_id);
        let task = ctx.with_span(span);
        let out_pathspec = format!("{}/mr-out-{}", &output_dir, reduce_id);
        let mut out_file = File::create(&out_pathspec)
            .with_context(|| format!("creating {}", out_pathspec))?;
        bkt.sort_by_key(KeyValue::key);
        let mut groups = 0usize;
        // Iterate through the values associated with each key and apply reduce function and write to file.
        for (key, value_group) in &bkt.into_iter().chunk_by(KeyValue::key) {
            let iter = value_group.map(KeyValue::into_value);
            let out = reduce_func(key.clone(), Box::new(iter), serialized_args.clone(), &task)?;
            out_file.write_all(&out)?;
            groups += 1;
        }
        debug!(parent: task.span(), groups, "bucket written");
        ctx.increment("engine", "reduce_tasks");
    }
    Ok(())
}

/// Runs `job` to completion: every map task, then every reduce bucket.
///
/// The map logic carries out mapping and also shuffle, which makes sense
/// for a single-process engine.
pub fn run_job(job: &Job, engine: &Workload, n_reduce: u32, ctx: &TaskContext) -> Result<()> {
    let serialized_args = utils::serialize_args(&job.args)?;
    let span = info_span!(parent: ctx.span(), "job", workload = %job.workload);
    let ctx = ctx.with_span(span);
    info!(parent: ctx.span(), input = ?job.input, output = %job.output, "starting job");
    let buckets = perform_map(job, engine, &serialized_args, n_reduce.max(1), &ctx)?;
    perform_reduce(job, engine, &serialized_args, buckets, &ctx)?;
    info!(parent: ctx.span(), "job finished");
    Ok(())
}
