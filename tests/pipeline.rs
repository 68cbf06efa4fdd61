use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDate;
use mrpipeline::{
    ingest::Shape,
    matrix::{Coordinate, Dims},
    pipeline::{design_matrix, load_dataset, load_product, Pipeline, PipelineConfig, SourceConfig},
    record::Value,
    standalone::{engine::run_job, Job},
    workload, MemoryCounters, PipelineError, TaskContext,
};
use tracing::Span;

const STOCK: &str = "\
Date,Open,High,Low,Close,Adj Close,Volume
2015-01-02,2058.9,2072.36,2046.04,2058.2,2058.2,2708700000
2015-01-05,2054.44,2054.44,2017.34,2020.58,2020.58,3799120000
2015-01-06,2022.15,2030.25,1992.44,2002.61,2002.61,4460110000
2015-01-07,2005.55,2029.61,2005.55,2025.9,2025.9,3805480000
2015-02-02,1996.67,2021.66,1980.9,2020.85,2020.85,4008330000
";

const CRIME: &str = "\
ID,Case Number,Date,Block
10000092,HY189866,01/02/2015 07:44:00 PM,047XX W OHIO ST
10000094,HY190059,01/02/2015 11:00:00 PM,066XX S MARSHFIELD AVE
10000095,HY190052,01/05/2015 10:45:00 PM,044XX S LAKE PARK AVE
10000096,HY190054,01/06/2015 10:30:00 PM,051XX S MICHIGAN AVE
10000097,HY189523,01/06/2015 01:30:00 AM,007XX N CENTRAL PARK AVE
10000098,HY190047,01/06/2015 09:50:00 PM,023XX W 56TH ST
10000099,HY190060,01/08/2015 10:55:00 PM,040XX W 74TH ST
";

const WEATHER: &str = "\
2015-01-02 01:00:00,270,269,271,1012,80,3.5,200,0,90,500,Rain,light rain
2015-01-02 02:00:00,272,271,273,1013,82,4.5,210,0,90,500,Rain,light rain
2015-01-05 01:00:00,260,259,261,1020,70,2,180,0,20,800,Clear,sky is clear
2015-01-06 01:00:00,265,264,266,1018,75,1.5,170,0,40,802,Clouds,scattered clouds
2015-01-07 01:00:00,268,267,269,1016,77,6,150,0,75,803,Clouds,broken clouds
";

/// A fresh scratch directory, removed when dropped.
struct Scratch(PathBuf);

impl Scratch {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("mrpipeline-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    fn path(&self, rel: &str) -> String {
        self.0.join(rel).to_str().unwrap().to_string()
    }

    fn write(&self, rel: &str, text: &str) {
        let path = self.0.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

fn source(scratch: &Scratch, name: &str, shape: Shape) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        shape,
        input: scratch.path(&format!("data/{name}/*.csv")),
        separator: ",".to_string(),
        header: shape != Shape::Weather,
        comment_prefix: None,
        date_format: (shape == Shape::Weather).then(|| "%Y-%m-%d %H:%M:%S".to_string()),
        columns: Default::default(),
    }
}

fn config(scratch: &Scratch) -> PipelineConfig {
    scratch.write("data/stock/sp500.csv", STOCK);
    scratch.write("data/crime/chicago.csv", CRIME);
    scratch.write("data/weather/hourly.csv", WEATHER);
    PipelineConfig {
        work_dir: scratch.path("work"),
        reducers: 3,
        start: "2015-01-01".to_string(),
        end: "2015-02-01".to_string(),
        sources: vec![
            source(scratch, "stock", Shape::Stock),
            source(scratch, "crime", Shape::Crime),
            source(scratch, "weather", Shape::Weather),
        ],
        variables: vec!["close".into(), "crimes".into(), "temp".into()],
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, d).unwrap()
}

#[test]
fn pipeline_produces_the_normal_matrix() {
    let scratch = Scratch::new();
    let counters = Arc::new(MemoryCounters::new());
    let ctx = TaskContext::new(counters.clone(), Span::none());
    let pipeline = Pipeline::new(config(&scratch)).unwrap();
    let output = pipeline.run(&ctx).unwrap();

    assert_eq!(output.design, Dims::new(5, 3));
    assert_eq!(counters.get("ingest", "filtered"), 1);
    assert_eq!(counters.get("ingest", "header"), 2);

    let (metadata, records) = load_dataset(&output.normalized).unwrap();
    assert_eq!(
        metadata.date_range.as_deref(),
        Some("2015-01-01 to 2015-02-01")
    );
    let days: Vec<NaiveDate> = records.iter().map(|(d, _)| *d).collect();
    assert_eq!(days, vec![day(2), day(5), day(6), day(7), day(8)]);

    for (day, record) in &records {
        for variable in ["close", "crimes", "temp"] {
            let value = record.get(variable);
            assert!(
                matches!(value, Some(Value::Double(v)) if (0.0..=1.0).contains(v)),
                "{day} {variable}: {value:?}"
            );
        }
    }
    let crimes: Vec<f64> = records
        .iter()
        .map(|(_, r)| r.get_f64("crimes").unwrap())
        .collect();
    // 2, 1, 3, absent, 1 incidents
    assert_eq!(crimes, vec![0.5, 0.0, 1.0, 0.0, 0.0]);
    // the weather of the first day is the mean of its two hours
    let temps: Vec<f64> = records.iter().map(|(_, r)| r.get_f64("temp").unwrap()).collect();
    assert_eq!(temps[0], 1.0);
    assert_eq!(temps[1], 0.0);

    let x = design_matrix(&records, &pipeline.config().variables);
    let cells = output.cells().unwrap();
    assert_eq!(cells.len(), 9);
    for i in 0..3u32 {
        for j in 0..3u32 {
            let expected: f64 = x.iter().map(|row| row[i as usize] * row[j as usize]).sum();
            let found = cells[&Coordinate::new(i, j)];
            assert!((found - expected).abs() < 1e-9, "({i},{j}): {found} != {expected}");
            assert_eq!(found, cells[&Coordinate::new(j, i)]);
        }
    }
}

#[test]
fn rerunning_replaces_earlier_output() {
    let scratch = Scratch::new();
    let pipeline = Pipeline::new(config(&scratch)).unwrap();
    let first = pipeline.run(&TaskContext::detached()).unwrap();
    let second = pipeline.run(&TaskContext::detached()).unwrap();
    assert_eq!(first.cells().unwrap(), second.cells().unwrap());
}

#[test]
fn stages_refuse_input_produced_for_another_range() {
    let scratch = Scratch::new();
    let pipeline = Pipeline::new(config(&scratch)).unwrap();
    pipeline.run(&TaskContext::detached()).unwrap();

    let joined = scratch.path("work/join");
    let job = Job {
        input: vec![format!("{joined}/mr-out-*")],
        workload: "stats".to_string(),
        output: scratch.path("work/stats-again"),
        args: vec![
            "--start=2015-01-01".to_string(),
            "--end=2015-03-01".to_string(),
            "--variable=close".to_string(),
            "--variable=crimes".to_string(),
            "--variable=temp".to_string(),
            format!("--metadata={joined}/mr-out-0"),
        ],
    };
    let err = run_job(&job, &workload::named("stats").unwrap(), 2, &TaskContext::detached())
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Consistency { tag: "date range", .. })
        ),
        "{err:?}"
    );
}

#[test]
fn normalize_refuses_statistics_of_another_range() {
    let scratch = Scratch::new();
    let pipeline = Pipeline::new(config(&scratch)).unwrap();
    pipeline.run(&TaskContext::detached()).unwrap();

    let stats = fs::read_to_string(scratch.path("work/stats/mr-out-0")).unwrap();
    assert!(stats.contains("#\tDate range: 2015-01-01 to 2015-02-01\n"), "{stats}");
    let mut other = String::new();
    for path in glob::glob(&scratch.path("work/stats/mr-out-*")).unwrap().flatten() {
        other.push_str(&fs::read_to_string(path).unwrap());
    }
    scratch.write(
        "stale/mr-out-0",
        &other.replace("to 2015-02-01", "to 2015-03-01"),
    );

    let joined = scratch.path("work/join");
    let job = Job {
        input: vec![format!("{joined}/mr-out-*")],
        workload: "normalize".to_string(),
        output: scratch.path("work/normalize-again"),
        args: vec![
            "--start=2015-01-01".to_string(),
            "--end=2015-02-01".to_string(),
            "--variable=close".to_string(),
            "--variable=crimes".to_string(),
            "--variable=temp".to_string(),
            format!("--metadata={joined}/mr-out-0"),
            format!("--stats={}", scratch.path("stale/mr-out-*")),
        ],
    };
    let err = run_job(&job, &workload::named("normalize").unwrap(), 2, &TaskContext::detached())
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Consistency { tag: "date range", .. })
        ),
        "{err:?}"
    );
}

#[test]
fn invalid_configuration_is_rejected_before_running() {
    let scratch = Scratch::new();
    let mut config = config(&scratch);
    config.variables.push("weather_main".into());
    config.sources[0].columns.insert("nope".into(), 4);
    config.reducers = 0;
    match Pipeline::new(config) {
        Err(PipelineError::Config(errors)) => assert_eq!(errors.messages().len(), 3, "{errors}"),
        other => panic!("expected a configuration error, got {:?}", other.err()),
    }
    assert!(!Path::new(&scratch.path("work")).exists());
}

#[test]
fn standalone_matrix_job() {
    let scratch = Scratch::new();
    scratch.write("m/a/part-0", "0\t1,2\n1\t3,4\n");
    scratch.write("m/b/part-0", "0\t5,6\n1\t7,8\n");
    let job = Job {
        input: vec![scratch.path("m/a/*"), scratch.path("m/b/*")],
        workload: "matrix".to_string(),
        output: scratch.path("m/out"),
        args: vec![
            "--lhs=2x2".to_string(),
            "--rhs=2x2".to_string(),
            "--lhs-input=*/m/a/*".to_string(),
            "--rhs-input=*/m/b/*".to_string(),
        ],
    };
    run_job(&job, &workload::named("matrix").unwrap(), 3, &TaskContext::detached()).unwrap();

    let cells = load_product(&scratch.path("m/out/mr-out-*")).unwrap();
    let values: Vec<f64> = cells.values().copied().collect();
    assert_eq!(values, vec![19.0, 22.0, 43.0, 50.0]);
}
