use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgMatches, Command};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flowstats_core::{
    network::{DnsCorrelator, FileDnsMapStore},
    utils::{format_timestamp_micros, output_path_for},
    BatchDriver, CaptureJob, CapturePipeline, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("flowstats")
        .version("0.1.0")
        .about("Extract per-flow packet statistics from cloud gaming captures")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true)
        )
        .subcommand(
            Command::new("extract")
                .about("Process every capture under a dataset directory")
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .value_name("DIR")
                        .help("Base path to the data directory")
                        .default_value("../data/")
                )
                .arg(
                    Arg::new("num-packets")
                        .short('n')
                        .long("num-packets")
                        .value_name("N")
                        .help("Packets kept per flow, 0 for all")
                        .value_parser(value_parser!(usize))
                )
                .arg(
                    Arg::new("jobs")
                        .short('j')
                        .long("jobs")
                        .value_name("N")
                        .help("Captures processed concurrently")
                        .value_parser(value_parser!(usize))
                )
        )
        .subcommand(
            Command::new("file")
                .about("Process a single capture")
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .value_name("FILE")
                        .help("Capture file to process")
                        .required(true)
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Output path, defaults to <capture>_packetStats.json")
                )
                .arg(
                    Arg::new("num-packets")
                        .short('n')
                        .long("num-packets")
                        .value_name("N")
                        .help("Packets kept per flow, 0 for all")
                        .value_parser(value_parser!(usize))
                )
        )
        .subcommand(
            Command::new("dns")
                .about("Build or load the DNS map of a capture and print it")
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .value_name("FILE")
                        .help("Capture file to scan")
                        .required(true)
                )
        )
        .subcommand(
            Command::new("init-config")
                .about("Write the default configuration to a file")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Destination of the configuration file")
                        .default_value("flowstats.json")
                )
        )
        .get_matches();

    let mut config = load_config(matches.get_one::<String>("config"))?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    match matches.subcommand() {
        Some(("extract", sub_matches)) => {
            apply_overrides(&mut config, sub_matches);
            let root = sub_matches.get_one::<String>("path").map(PathBuf::from).unwrap_or_default();
            run_extract_mode(&config, &root).await?;
        }
        Some(("file", sub_matches)) => {
            apply_overrides(&mut config, sub_matches);
            let input = sub_matches.get_one::<String>("input").map(PathBuf::from).unwrap_or_default();
            let output = sub_matches.get_one::<String>("output").map(PathBuf::from);
            run_file_mode(&config, input, output)?;
        }
        Some(("dns", sub_matches)) => {
            let input = sub_matches.get_one::<String>("input").map(PathBuf::from).unwrap_or_default();
            run_dns_mode(&config, &input)?;
        }
        Some(("init-config", sub_matches)) => {
            let output = sub_matches.get_one::<String>("output").map(PathBuf::from).unwrap_or_default();
            Config::default().to_file(&output)?;
            info!("Default configuration written to {}", output.display());
        }
        _ => {
            eprintln!("No subcommand provided. Use --help for usage information.");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config(path: Option<&String>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path).with_context(|| format!("loading configuration {}", path)),
        None => Ok(Config::default()),
    }
}

fn apply_overrides(config: &mut Config, matches: &ArgMatches) {
    if let Some(&num_packets) = matches.get_one::<usize>("num-packets") {
        config.extraction.max_packets_per_flow = num_packets;
    }
    if let Ok(Some(&jobs)) = matches.try_get_one::<usize>("jobs") {
        config.batch.max_concurrent_files = jobs;
    }
}

async fn run_extract_mode(config: &Config, root: &Path) -> anyhow::Result<()> {
    config.validate()?;
    info!("Starting extraction under {}", root.display());

    let pipeline = Arc::new(CapturePipeline::from_config(config)?);
    let driver = BatchDriver::new(&config.batch);
    let report = driver.run(root, pipeline).await?;

    println!("\n=== EXTRACTION SUMMARY ===");
    println!("Processed: {}", report.processed.len());
    println!("Skipped: {}", report.skipped.len());
    println!("Failed: {}", report.failed.len());
    for failure in &report.failed {
        println!("  {}: {}", failure.capture.display(), failure.error);
    }

    if !report.is_success() {
        bail!("{} captures failed", report.failed.len());
    }
    Ok(())
}

fn run_file_mode(config: &Config, input: PathBuf, output: Option<PathBuf>) -> anyhow::Result<()> {
    config.validate()?;
    let output = match output {
        Some(output) => output,
        None => output_path_for(&input, &config.batch.output_suffix)?,
    };
    if output.exists() {
        warn!("Overwriting existing output {}", output.display());
    }

    let pipeline = CapturePipeline::from_config(config)?;
    let summary = pipeline.process(&CaptureJob { capture: input, output })?;

    println!("\n=== CAPTURE SUMMARY ===");
    println!("Capture: {}", summary.capture.display());
    println!("Output: {}", summary.output.display());
    println!("DNS entries: {}", summary.dns_entries);
    println!("Frames: {}", summary.stats.frames);
    println!("Flows: {}", summary.stats.flows);
    println!("Packets kept: {}", summary.stats.packets_kept);
    println!("Dropped: {}", summary.stats.dropped());
    println!("  undecodable: {}", summary.stats.undecodable);
    println!("  not IPv4: {}", summary.stats.not_ipv4);
    println!("  no local endpoint: {}", summary.stats.no_local_endpoint);
    println!("  unclassified: {}", summary.stats.unclassified);
    println!("  over flow cap: {}", summary.stats.capped);
    if let (Some(first), Some(last)) = (summary.stats.first_timestamp_us, summary.stats.last_timestamp_us) {
        println!("First packet: {}", format_timestamp_micros(first));
        println!("Last packet: {}", format_timestamp_micros(last));
    }

    Ok(())
}

fn run_dns_mode(config: &Config, input: &Path) -> anyhow::Result<()> {
    let store = Arc::new(FileDnsMapStore::new(config.batch.dns_cache_file.clone()));
    let correlator = DnsCorrelator::new(store, config.extraction.dns_port, config.batch.read_buffer_size);
    let map = correlator.correlate(input)?;

    println!("\n=== DNS MAP ({} entries) ===", map.len());
    for (addr, name) in map.iter() {
        println!("{} -> {}", addr, name);
    }

    Ok(())
}
