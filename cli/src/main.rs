//! chainwatch CLI — stream wallet activity from the terminal.
//!
//! Usage:
//! ```bash
//! # Stream records for two wallets as JSON lines
//! CHAINWATCH_API_KEYS=key1,key2 chainwatch watch --wallet <ADDR> --wallet <ADDR>
//!
//! # Use a config file and JSON logs
//! chainwatch watch --config chainwatch.json --wallet <ADDR> --json-logs
//!
//! # Check an address without touching the network
//! chainwatch validate <ADDR>
//! ```

use std::env;
use std::process;
use std::time::Duration;

use chainwatch_core::config::EngineConfig;
use chainwatch_core::types::ConnectionState;
use chainwatch_engine::{init_tracing, MonitorEngine};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "watch" => cmd_watch(&args[2..]).await,
        "validate" => cmd_validate(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("chainwatch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainwatch {}", env!("CARGO_PKG_VERSION"));
    println!("Real-time wallet transaction monitor\n");
    println!("USAGE:");
    println!("    chainwatch <COMMAND>\n");
    println!("COMMANDS:");
    println!("    watch      Stream transactions for wallets as JSON lines");
    println!("    validate   Check a wallet address format");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("WATCH FLAGS:");
    println!("    --config <FILE>   JSON engine config");
    println!("    --wallet <ADDR>   Wallet to track (repeatable)  [required]");
    println!("    --json-logs       Emit logs as JSON on stderr\n");
    println!("ENVIRONMENT:");
    println!("    CHAINWATCH_API_KEYS      Comma-separated provider keys");
    println!("    CHAINWATCH_WS_URL        Streaming endpoint ({{api_key}} placeholder)");
    println!("    CHAINWATCH_METADATA_URL  Token metadata endpoint");
}

async fn cmd_watch(args: &[String]) -> Result<(), String> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => EngineConfig::from_json_file(&path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    config.apply_env();
    if args.iter().any(|a| a == "--json-logs") {
        config.log.json = true;
    }

    let wallets = parse_flag_all(args, "--wallet");
    if wallets.is_empty() {
        return Err("at least one --wallet is required".into());
    }

    init_tracing(&config.log);

    let engine = MonitorEngine::new(config).map_err(|e| e.to_string())?;
    for wallet in &wallets {
        engine.add_wallet(wallet).map_err(|e| e.to_string())?;
    }
    engine.on_transaction(|record| {
        println!("{}", serde_json::to_string(&record)?);
        Ok(())
    });
    engine.connect().map_err(|e| e.to_string())?;

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupt received, shutting down");
                break Ok(());
            }
            _ = poll.tick() => {
                if engine.status().state == ConnectionState::Terminated {
                    break Err("connection terminated after exhausting reconnect attempts".to_string());
                }
            }
        }
    };

    let status = engine.status();
    engine.shutdown().await;
    eprintln!("{}", serde_json::to_string(&status).unwrap_or_default());
    outcome
}

fn cmd_validate(args: &[String]) -> Result<(), String> {
    let address = args.first().ok_or("address argument is required")?;
    if chainwatch_core::is_valid_address(address.trim()) {
        println!("valid: {address}");
        Ok(())
    } else {
        Err(format!("invalid wallet address: {address}"))
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_flag_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}
