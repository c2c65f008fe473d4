//! chainsync CLI: inspect the engine and replay recorded fixtures.
//!
//! Usage:
//! ```bash
//! chainsync replay fixtures/usdc.json
//! chainsync info
//! ```

mod logging;
mod replay;

use std::env;
use std::path::Path;
use std::process;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "replay" => {
            let Some(path) = args.get(2) else {
                eprintln!("replay: missing <fixture.json>");
                print_usage();
                process::exit(1);
            };
            if let Err(e) = cmd_replay(Path::new(path)).await {
                eprintln!("replay failed: {e:#}");
                process::exit(1);
            }
        }
        "version" | "--version" | "-V" => {
            println!("chainsync {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("chainsync {}", env!("CARGO_PKG_VERSION"));
    println!("Checkpoint-driven, reorg-aware event indexing service\n");
    println!("USAGE:");
    println!("    chainsync <COMMAND>\n");
    println!("COMMANDS:");
    println!("    replay <fixture.json>  Replay a recorded fixture and print metrics as JSON");
    println!("    info                   Show ChainSync engine info");
    println!("    version                Print version");
    println!("    help                   Print this help");
}

fn cmd_info() {
    println!("ChainSync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Scheduling: finalized checkpoint ranges, watermark advances per page");
    println!("  Dispatch: one handler at a time, in (timestamp, log index) order");
    println!("  Failures: first handler error halts the pipeline until reset");
    println!("  Reorgs: record store and watermark rewound to the common ancestor");
    println!("  Storage backends: memory");
}

async fn cmd_replay(path: &Path) -> anyhow::Result<()> {
    let fixture = replay::load(path)?;
    logging::init_tracing(&fixture.config.log);
    let report = replay::run(fixture).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
