use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ivf_bench::config::effective_threads;
use ivf_bench::dataset::{load_dataset, open_train, FvecsWriter};
use ivf_bench::engine::{centroid_table, index_name, Connector, Store};
use ivf_bench::{
    build_and_monitor, run_parallel, run_sequential, train_centroids, BenchConfig, BulkLoader,
    CancelHandle, CentroidSet, FailurePolicy, IndexSpec, LoadConfig, LocalEngine, Metric, MonitorConfig,
    SamplingMode, SearchParams, TrainConfig, VectorDataset, Workload, DEFAULT_CHUNKS,
    DEFAULT_EPSILON, DEFAULT_ITERATIONS, DEFAULT_LISTS, DEFAULT_NUM_THREADS, DEFAULT_PROBES,
    DEFAULT_SEED, DEFAULT_TOP_K, MAX_POINTS_PER_CLUSTER,
};

#[derive(Parser, Debug)]
#[command(name = "ivf-bench")]
#[command(about = "Train IVF codebooks, load vectors, build and benchmark an index")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train centroids on a dataset and write them to a file
    Train {
        /// Dataset name, like: sift
        #[arg(short = 'n', long)]
        name: String,

        /// Directory holding the dataset files
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Output centroid file
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Top-level centroid count
        #[arg(long, default_value_t = DEFAULT_LISTS)]
        lists: usize,

        /// Child centroids per top-level cluster
        #[arg(long = "lists-2")]
        lists_2: Option<usize>,

        /// K-means iterations
        #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
        niter: usize,

        #[arg(short = 'm', long, value_enum, default_value_t = Metric::L2)]
        metric: Metric,

        /// Request GPU training
        #[arg(short = 'g', long)]
        gpu: bool,

        /// Sample with parallel readers instead of one streaming pass
        #[arg(long)]
        partitioned: bool,

        /// Reader count for partitioned sampling
        #[arg(long, default_value_t = DEFAULT_CHUNKS)]
        chunks: usize,

        /// Training points drawn per centroid
        #[arg(long, default_value_t = MAX_POINTS_PER_CLUSTER)]
        max_points: usize,

        /// Random seed for reproducibility
        #[arg(short = 's', long, default_value_t = DEFAULT_SEED)]
        seed: u64,
    },

    /// Load a dataset into the engine and build its index
    BuildIndex {
        #[arg(short = 'n', long)]
        name: String,

        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Engine data directory
        #[arg(long, env = "IVF_BENCH_DATA_DIR")]
        data_dir: PathBuf,

        /// Precomputed centroid file; the engine trains its own otherwise
        #[arg(short = 'c', long)]
        centroids: Option<PathBuf>,

        /// Internal training lists, one value per level
        #[arg(long, num_args = 1..=2, default_values_t = [DEFAULT_LISTS])]
        lists: Vec<usize>,

        #[arg(short = 'm', long, value_enum, default_value_t = Metric::L2)]
        metric: Metric,

        /// Build threads (0 = use all available cores)
        #[arg(short = 'w', long, default_value_t = DEFAULT_NUM_THREADS)]
        workers: usize,

        /// Copy sessions used to load the vectors
        #[arg(long, default_value_t = DEFAULT_CHUNKS)]
        chunks: usize,

        /// Progress poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,

        /// Stop monitoring after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Query a built index and report recall, QPS and latency
    Benchmark {
        #[arg(short = 'n', long)]
        name: String,

        #[arg(short = 'i', long)]
        input: PathBuf,

        #[arg(long, env = "IVF_BENCH_DATA_DIR")]
        data_dir: PathBuf,

        /// Neighbors per query
        #[arg(short = 't', long, default_value_t = DEFAULT_TOP_K, value_parser = parse_top)]
        top: usize,

        /// Lists probed per query
        #[arg(long, default_value_t = DEFAULT_PROBES)]
        probes: usize,

        #[arg(long, default_value_t = DEFAULT_EPSILON)]
        epsilon: f32,

        /// Concurrent workers replaying the full query set
        #[arg(long, default_value_t = 1)]
        processes: usize,

        /// Keep going when some workers fail
        #[arg(long)]
        best_effort: bool,

        /// Also write the report as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Write a table's vectors to an fvecs file
    Dump {
        #[arg(short = 'n', long)]
        name: String,

        #[arg(long, env = "IVF_BENCH_DATA_DIR")]
        data_dir: PathBuf,

        #[arg(short = 'o', long)]
        output: PathBuf,
    },
}

fn parse_top(s: &str) -> std::result::Result<usize, String> {
    match s {
        "10" => Ok(10),
        "100" => Ok(100),
        _ => Err(format!("top must be 10 or 100, got {}", s)),
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 0.001 {
        format!("{:.3} ms", secs * 1000.0)
    } else {
        format!("{:.3} µs", secs * 1_000_000.0)
    }
}

fn format_throughput(count: usize, duration: Duration) -> String {
    let per_second = count as f64 / duration.as_secs_f64();
    if per_second >= 1_000_000.0 {
        format!("{:.2} M/s", per_second / 1_000_000.0)
    } else if per_second >= 1_000.0 {
        format!("{:.2} K/s", per_second / 1_000.0)
    } else {
        format!("{:.2}/s", per_second)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Train {
            name,
            input,
            output,
            lists,
            lists_2,
            niter,
            metric,
            gpu,
            partitioned,
            chunks,
            max_points,
            seed,
        } => {
            let dataset = open_train(&input, &name)
                .with_context(|| format!("opening dataset {} in {}", name, input.display()))?;
            let sampling = if partitioned {
                SamplingMode::Partitioned { chunks }
            } else {
                SamplingMode::Streaming
            };
            let mut config = TrainConfig::default()
                .with_lists(lists)
                .with_child_lists(lists_2)
                .with_iterations(niter)
                .with_metric(metric)
                .with_sampling(sampling)
                .with_max_points_per_cluster(max_points)
                .with_seed(seed)
                .with_progress(true);
            config.gpu = gpu;

            println!("=== Train Centroids ===");
            println!("  Input:          {}", dataset.path().display());
            println!("  Vectors:        {:>12}", dataset.len());
            println!("  Dimensions:     {:>12}", dataset.dims());
            println!("  Lists:          {:>12}", lists);
            if let Some(k2) = lists_2 {
                println!("  Lists (child):  {:>12}", k2);
            }
            println!("  Metric:         {:>12}", metric);

            let start = Instant::now();
            let centroids = train_centroids(&dataset, &config).context("training centroids")?;
            let duration = start.elapsed();
            centroids
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;

            println!("  Centroids:      {:>12}", centroids.len());
            println!("  Time:           {:>12}", format_duration(duration));
            println!("  Output:         {}", output.display());
        }

        Command::BuildIndex {
            name,
            input,
            data_dir,
            centroids,
            lists,
            metric,
            workers,
            chunks,
            poll_ms,
            timeout_secs,
        } => {
            let dataset = open_train(&input, &name)
                .with_context(|| format!("opening dataset {} in {}", name, input.display()))?;
            let mut engine = LocalEngine::open(&data_dir)
                .with_context(|| format!("opening engine at {}", data_dir.display()))?;
            info!(root = %engine.root().display(), "engine opened");

            let mut loader = BulkLoader::new(
                engine.connection(),
                LoadConfig::default().with_chunks(chunks).with_progress(true),
            );
            let start = Instant::now();
            let rows = loader
                .load_embeddings(&name, &dataset)
                .await
                .context("loading vectors")?;
            let load_duration = start.elapsed();
            println!(
                "Loaded {} vectors in {} ({})",
                rows,
                format_duration(load_duration),
                format_throughput(rows as usize, load_duration)
            );

            let spec = match centroids {
                Some(path) => {
                    let set = CentroidSet::load(&path)
                        .with_context(|| format!("reading centroids {}", path.display()))?;
                    loader
                        .load_centroids(&centroid_table(&name), &set)
                        .await
                        .context("loading centroids")?;
                    IndexSpec::external(&name, metric)
                }
                None => {
                    // Internal builds leave no centroids table behind
                    loader
                        .store_mut()
                        .drop_table(&centroid_table(&name))
                        .await
                        .context("dropping old centroids")?;
                    IndexSpec::internal(&name, metric, lists)
                }
            }
            .with_build_threads(effective_threads(workers));

            let monitor = MonitorConfig::default()
                .with_poll_interval(Duration::from_millis(poll_ms))
                .with_timeout(timeout_secs.map(Duration::from_secs))
                .with_progress(true);
            let cancel = CancelHandle::default();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let start = Instant::now();
            let progress = engine.connection();
            build_and_monitor(&mut engine, progress, &spec, monitor, &cancel)
                .await
                .with_context(|| format!("building {}", spec.index_name))?;
            println!(
                "Built {} in {}",
                spec.index_name,
                format_duration(start.elapsed())
            );
        }

        Command::Benchmark {
            name,
            input,
            data_dir,
            top,
            probes,
            epsilon,
            processes,
            best_effort,
            json,
        } => {
            let dataset = load_dataset(&input, &name)
                .with_context(|| format!("opening dataset {} in {}", name, input.display()))?;
            if dataset.ground_truth_k() < top {
                bail!(
                    "ground truth has {} neighbors per query, fewer than top {}",
                    dataset.ground_truth_k(),
                    top
                );
            }
            let engine = LocalEngine::open(&data_dir)?;
            let params = SearchParams { probes, epsilon };
            let connector = engine
                .connector(&index_name(&name), params)
                .context("opening index")?;

            let policy = if best_effort {
                FailurePolicy::BestEffort
            } else {
                FailurePolicy::AbortAll
            };
            let config = BenchConfig::default()
                .with_top_k(top)
                .with_search(params)
                .with_workers(processes)
                .with_policy(policy)
                .with_progress(true);
            let workload = Workload::new(&dataset.test, &dataset.neighbors)?;
            info!(queries = workload.len(), processes, probes, "running benchmark");

            let report = if processes <= 1 {
                let mut endpoint = connector.connect()?;
                run_sequential(&mut endpoint, workload, &config)?
            } else {
                run_parallel(&connector, workload, &config)?
            };
            println!("{}", report);

            if let Some(path) = json {
                let writer = BufWriter::new(
                    File::create(&path).with_context(|| format!("creating {}", path.display()))?,
                );
                serde_json::to_writer_pretty(writer, &report)?;
            }
        }

        Command::Dump {
            name,
            data_dir,
            output,
        } => {
            let mut engine = LocalEngine::open(&data_dir)?;
            let mut writer = FvecsWriter::create(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            engine
                .scan(&name, &mut |row| writer.write(&row.vector))
                .await
                .with_context(|| format!("reading table {}", name))?;
            let count = writer.finish()?;
            println!("Wrote {} vectors to {}", count, output.display());
        }
    }

    Ok(())
}
