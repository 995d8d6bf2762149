use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use arity_sort::report::{self, BEST_ARITY_FILE, RESULTS_FILE};
use arity_sort::{AritySearch, ExternalSorter, ExternalSorterBuilder, SearchConfig, SortConfig, SortCostOracle, SortError};

/// Arity used when neither `--arity` nor a persisted best arity is available.
const FALLBACK_ARITY: usize = 62;

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    match arg_parser.subcommand() {
        Some(("sort", args)) => run_sort(args),
        Some(("search", args)) => run_search(args),
        _ => unreachable!("subcommand is required"),
    }
}

fn run_sort(args: &clap::ArgMatches) {
    let input = Path::new(args.value_of("input").expect("value is required"));
    let output = Path::new(args.value_of("output").expect("value is required"));

    let arity: usize = if args.is_present("arity") {
        args.value_of_t_or_exit("arity")
    } else {
        let results_dir = Path::new(args.value_of("results").expect("value has default"));
        persisted_arity(&results_dir.join(BEST_ARITY_FILE))
    };

    let sorter = exit_on_error(build_sorter(args), "sorter initialization error");
    let stats = exit_on_error(sorter.sort(input, output, arity), "data sorting error");

    log::info!(
        "sorted {} records: {} runs, {} passes, {} I/O operations",
        stats.records,
        stats.runs,
        stats.passes.len(),
        stats.io_operations()
    );
}

fn run_search(args: &clap::ArgMatches) {
    let inputs = Vec::from_iter(args.values_of("input").expect("value is required").map(PathBuf::from));
    let results_dir = PathBuf::from(args.value_of("results").expect("value has default"));

    let search_config = SearchConfig {
        min_arity: args.value_of_t_or_exit("min_arity"),
        max_arity: args.value_of_t_or_exit("max_arity"),
        threshold: args.value_of_t_or_exit("threshold"),
        parallel_probes: args.is_present("parallel"),
    };

    let sorter = exit_on_error(build_sorter(args), "sorter initialization error");
    let mut oracle = exit_on_error(SortCostOracle::new(sorter, inputs), "oracle initialization error");
    if let Some(dir) = args.value_of("keep_outputs") {
        oracle = exit_on_error(oracle.keep_outputs(Path::new(dir)), "output directory error");
    }

    let cost_table = args.value_of("cost_table").map(PathBuf::from);
    if let Some(path) = cost_table.as_deref().filter(|path| path.exists()) {
        let table = exit_on_error(report::load_cost_table(path), "cost table loading error");
        oracle.load_cost_table(table);
    }

    let search_report = exit_on_error(AritySearch::new(search_config).run(&oracle), "arity search error");

    exit_on_error(
        fs::create_dir_all(&results_dir).map_err(SortError::IO),
        "results directory error",
    );
    exit_on_error(
        report::write_results(&results_dir.join(RESULTS_FILE), &search_report),
        "results saving error",
    );
    exit_on_error(
        report::write_best_arity(&results_dir.join(BEST_ARITY_FILE), search_report.best_arity),
        "best arity saving error",
    );
    if let Some(path) = cost_table.as_deref() {
        exit_on_error(report::save_cost_table(path, &oracle.cost_table()), "cost table saving error");
    }

    log::info!(
        "optimal arity: {} ({} I/O operations, {} evaluations)",
        search_report.best_arity,
        search_report.best_cost,
        search_report.evaluations.len()
    );
}

fn build_sorter(args: &clap::ArgMatches) -> Result<ExternalSorter, SortError> {
    let memory = args.value_of("memory").expect("value has default");
    let block_size: usize = args.value_of_t_or_exit("block_size");

    let config = SortConfig::new(
        block_size,
        memory.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize,
    );

    let mut sorter_builder = ExternalSorterBuilder::new().with_config(config);
    if args.is_present("threads") {
        sorter_builder = sorter_builder.with_threads_number(args.value_of_t_or_exit("threads"));
    }
    if let Some(tmp_dir) = args.value_of("tmp_dir") {
        sorter_builder = sorter_builder.with_tmp_dir(Path::new(tmp_dir));
    }

    sorter_builder.build()
}

fn persisted_arity(path: &Path) -> usize {
    match report::read_best_arity(path) {
        Ok(arity) => {
            log::info!("using best arity {} from {}", arity, path.display());
            arity
        }
        Err(err) => {
            log::warn!("best arity not available ({}), using {}", err, FALLBACK_ARITY);
            FALLBACK_ARITY
        }
    }
}

fn exit_on_error<T>(result: Result<T, SortError>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            log::error!("{}: {}", context, err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn sorter_args() -> Vec<clap::Arg<'static>> {
    vec![
        clap::Arg::new("memory")
            .short('m')
            .long("memory")
            .help("memory budget")
            .takes_value(true)
            .default_value("50MiB")
            .validator(|v| match v.parse::<ByteSize>() {
                Ok(_) => Ok(()),
                Err(err) => Err(format!("Memory budget format incorrect: {}", err)),
            }),
        clap::Arg::new("block_size")
            .short('b')
            .long("block-size")
            .help("disk block size in bytes")
            .takes_value(true)
            .default_value("4096"),
        clap::Arg::new("threads")
            .short('t')
            .long("threads")
            .help("number of threads to use for parallel sorting and merging")
            .takes_value(true),
        clap::Arg::new("tmp_dir")
            .short('d')
            .long("tmp-dir")
            .help("directory to be used to store temporary data")
            .takes_value(true),
        clap::Arg::new("results")
            .short('r')
            .long("results")
            .help("directory holding arity search results")
            .takes_value(true)
            .default_value("results"),
    ]
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("arity-sort")
        .about("external merge sort with merge arity tuning")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .subcommand(
            clap::App::new("sort")
                .about("sort a file of 64-bit integers")
                .arg(
                    clap::Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("file to be sorted")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("result file")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("arity")
                        .short('a')
                        .long("arity")
                        .help("merge arity, defaults to the persisted best arity")
                        .takes_value(true),
                )
                .args(sorter_args()),
        )
        .subcommand(
            clap::App::new("search")
                .about("search the merge arity minimizing I/O operations")
                .arg(
                    clap::Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("reference file, may be repeated to average several sequences")
                        .required(true)
                        .takes_value(true)
                        .multiple_occurrences(true),
                )
                .arg(
                    clap::Arg::new("min_arity")
                        .long("min")
                        .help("smallest arity to consider")
                        .takes_value(true)
                        .default_value("2"),
                )
                .arg(
                    clap::Arg::new("max_arity")
                        .long("max")
                        .help("largest arity to consider")
                        .takes_value(true)
                        .default_value("512"),
                )
                .arg(
                    clap::Arg::new("threshold")
                        .long("threshold")
                        .help("interval width below which all arities are evaluated")
                        .takes_value(true)
                        .default_value("4"),
                )
                .arg(
                    clap::Arg::new("parallel")
                        .long("parallel")
                        .help("evaluate both narrowing probes concurrently"),
                )
                .arg(
                    clap::Arg::new("keep_outputs")
                        .long("keep-outputs")
                        .help("directory where every probe's sorted output is kept")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("cost_table")
                        .long("cost-table")
                        .help("file used to resume and persist evaluated costs")
                        .takes_value(true),
                )
                .args(sorter_args()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
