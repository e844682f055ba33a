//! `socketreplay`: a standalone driver for the mock socket server, one
//! `structopt` subcommand per operator task, mirroring the original
//! `socketreplay_main.cc`'s minimal "serve forever" driver.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "socketreplay", about = "Replay recorded socket conversations out of process")]
enum Cli {
    /// Bind `host:port` for each given port and replay accepted connections
    /// against the matching recorded trace, then sleep forever.
    Serve {
        host: String,
        #[structopt(long, short)]
        port: Vec<u16>,
        /// Directory to scan for `socket_rec_*.bin` recordings.
        #[structopt(long, default_value = ".")]
        recordings_dir: PathBuf,
    },
    /// Print a JSON summary of a recorded trace file.
    TraceInfo { path: PathBuf },
}

#[derive(Serialize)]
struct TraceSummary {
    entry_count: usize,
    kind_histogram: BTreeMap<i32, usize>,
    first_debug_string: Option<String>,
    last_debug_string: Option<String>,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::from_args();

    let result = match cli {
        Cli::Serve { host, port, recordings_dir } => serve(&recordings_dir, &host, &port),
        Cli::TraceInfo { path } => trace_info(&path),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "socketreplay failed");
        std::process::exit(1);
    }
}

fn serve(recordings_dir: &std::path::Path, host: &str, ports: &[u16]) -> tracereplay::Result<()> {
    let _server = tracereplay::MockServer::new(recordings_dir, host, ports)?;
    tracing::info!(host, ?ports, "serving recorded traffic; sleeping forever");
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn trace_info(path: &std::path::Path) -> tracereplay::Result<()> {
    let bin_path = match path.extension() {
        Some(ext) if ext == "bin" => path.to_path_buf(),
        _ => path.with_extension("bin"),
    };
    let mut file = std::fs::File::open(&bin_path)?;
    let entries = tracereplay::codec::read_all_entries(&mut file)?;

    let mut kind_histogram = BTreeMap::new();
    for entry in &entries {
        *kind_histogram.entry(entry.kind).or_insert(0) += 1;
    }
    let summary = TraceSummary {
        entry_count: entries.len(),
        kind_histogram,
        first_debug_string: entries.first().map(|e| e.short_debug_string()),
        last_debug_string: entries.last().map(|e| e.short_debug_string()),
    };

    let rendered = serde_json::to_string_pretty(&summary).expect("TraceSummary is always serializable");
    println!("{}", rendered);
    Ok(())
}
