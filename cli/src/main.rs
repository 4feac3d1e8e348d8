use clap::Parser;
use cli::{load_servers, parse_target, render_reports};
use engine::{QueryEngine, QueryPolicy};
use log::info;
use protocol::StripColors;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Query game servers", long_about = None)]
struct Args {
    /// Servers as type:host:port, e.g. css:203.0.113.7:27015
    targets: Vec<String>,

    /// JSON file with a list of servers to query
    #[arg(short = 's', long)]
    servers: Option<PathBuf>,

    /// Per-attempt timeout in milliseconds
    #[arg(short = 't', long, default_value = "3000")]
    timeout_ms: u64,

    /// Re-sends after a timed out attempt
    #[arg(short = 'r', long, default_value = "1")]
    retries: u32,

    /// Maximum number of sockets open at once
    #[arg(long, default_value = "256")]
    max_sockets: usize,

    /// Largest datagram accepted, in bytes
    #[arg(long, default_value = "65535")]
    recv_buffer_size: usize,

    /// Remove in-game colour codes from text values
    #[arg(long)]
    strip_colors: bool,

    /// Pretty-print the JSON output
    #[arg(short = 'p', long)]
    pretty: bool,

    /// List known protocol ids and exit
    #[arg(long)]
    list_protocols: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let policy = QueryPolicy::new()
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_retries(args.retries)
        .with_max_sockets(args.max_sockets)
        .with_recv_buffer_size(args.recv_buffer_size);
    let mut engine = QueryEngine::new(policy);

    if args.list_protocols {
        for name in engine.registry().names() {
            println!("{}", name);
        }
        return Ok(());
    }

    if args.strip_colors {
        engine.add_filter(StripColors);
    }

    let mut servers = Vec::new();
    if let Some(path) = &args.servers {
        servers.extend(load_servers(path)?);
    }
    for target in &args.targets {
        servers.push(parse_target(target)?);
    }
    if servers.is_empty() {
        return Err("no servers given; pass type:host:port targets or --servers".into());
    }

    info!("Timeout {}ms, {} retries", args.timeout_ms, args.retries);
    let reports = engine.run(servers).await;
    println!("{}", render_reports(&reports, args.pretty)?);

    Ok(())
}
