extern crate log;
extern crate pretty_env_logger;

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use clap::{arg, command, ArgMatches, Command};

use crate::election::BallotSpec;
use crate::error::{Result, ScanError};
use crate::frame::ScanFrame;
use crate::scanner::{ReferenceImage, ScanConfig, Scanner};
use crate::server::ServerConfig;

mod archive;
mod debug;
mod edges;
mod election;
mod error;
mod frame;
mod geometry;
mod resample;
mod scanner;
mod server;
mod threshold;
mod transform;

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let matches = cli().get_matches();
    let result = match matches.subcommand() {
        Some(("scan", sub)) => run_scan(sub),
        Some(("serve", sub)) => run_serve(sub),
        _ => unreachable!("a subcommand is required"),
    };
    if let Err(err) = result {
        eprintln!("{err}");
        exit(1);
    }
}

fn cli() -> Command {
    command!()
        .subcommand_required(true)
        .subcommand(
            Command::new("scan")
                .about("Scan one ballot image against a reference rendering")
                .arg(arg!(-b --bubbles <PATH> "bubble geometry json").required(true))
                .arg(arg!(-o --orig <PATH> "reference ballot rendering").required(true))
                .arg(arg!(-s --scan <PATH> "scanned ballot image").required(true))
                .arg(arg!(--dbpng [PATH] "write the scan rectified into the reference frame"))
                .arg(arg!(--bubpng [PATH] "write oversampled bubble crops"))
                .arg(arg!(--targets [PATH] "write candidate alignment hotspots"))
                .arg(arg!(--"mark-threshold" [VALUE] "darkness at or above which a bubble is marked")),
        )
        .subcommand(
            Command::new("serve")
                .about("Serve the scan endpoint over HTTP")
                .arg(arg!(--listen [ADDR] "address to bind").default_value("0.0.0.0:8080"))
                .arg(arg!(--studio <URL> "studio service base url").required(true))
                .arg(arg!(--prefix [PATH] "path prefix in front of /scan/").default_value(""))
                .arg(arg!(--"archive-dir" [PATH] "directory for submitted-image archives"))
                .arg(arg!(--threads [COUNT] "worker threads").default_value("8"))
                .arg(arg!(--"mark-threshold" [VALUE] "darkness at or above which a bubble is marked")),
        )
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches
        .get_one::<String>(name)
        .expect("required argument")
        .as_str()
}

fn mark_threshold_flag(matches: &ArgMatches) -> Result<Option<f64>> {
    match matches.get_one::<String>("mark-threshold") {
        None => Ok(None),
        Some(text) => text
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ScanError::Config(format!("mark threshold {text:?} is not a number"))),
    }
}

fn run_scan(matches: &ArgMatches) -> Result<()> {
    let bubbles_path = required(matches, "bubbles");
    let orig_path = required(matches, "orig");
    let scan_path = required(matches, "scan");

    let spec = Arc::new(BallotSpec::from_json_reader(File::open(bubbles_path)?)?);
    let rendering = image::open(orig_path)
        .map_err(|err| ScanError::InputDecode(format!("{orig_path}: {err}")))?;
    let reference = ReferenceImage::new(rendering, &spec)?;
    let scanned = image::open(scan_path)
        .map_err(|err| ScanError::InputDecode(format!("{scan_path}: {err}")))?;
    let frame = ScanFrame::from_dynamic(scanned);

    let config = ScanConfig::resolve(mark_threshold_flag(matches)?)?;
    let scanner = Scanner::new(spec, reference, config);

    if let Some(path) = matches.get_one::<String>("targets") {
        let spots = debug::find_alignment_hotspots(scanner.reference());
        debug::write_hotspots_png(scanner.reference(), &spots, Path::new(path))?;
    }

    let transform = scanner.align(&frame)?;
    let results = scanner.score_bubbles(&frame, &transform);
    println!(
        "{}",
        serde_json::to_string_pretty(&results)
            .map_err(|err| ScanError::Config(format!("result encode: {err}")))?
    );

    if let Some(path) = matches.get_one::<String>("dbpng") {
        debug::write_rectified_png(scanner.reference(), &frame, &transform, Path::new(path))?;
    }
    if let Some(path) = matches.get_one::<String>("bubpng") {
        debug::write_bubble_strip_png(&scanner, &frame, &transform, Path::new(path))?;
    }
    Ok(())
}

fn run_serve(matches: &ArgMatches) -> Result<()> {
    let threads = required(matches, "threads")
        .parse::<usize>()
        .map_err(|_| ScanError::Config("thread count is not a number".to_string()))?;
    let archive_dir = matches
        .get_one::<String>("archive-dir")
        .cloned()
        .or_else(|| env::var("SCAN_ARCHIVE_DIR").ok())
        .map(PathBuf::from);

    let config = ServerConfig {
        listen: required(matches, "listen").to_string(),
        studio_prefix: required(matches, "studio").to_string(),
        app_prefix: required(matches, "prefix").to_string(),
        threads,
        scan: ScanConfig::resolve(mark_threshold_flag(matches)?)?,
        archive_dir,
    };
    server::run(config)
}
