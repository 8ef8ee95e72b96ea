#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use xrec_block::FileDevice;
use xrec_log::{Log, ReplayPass, Transaction, TransactionDispatcher, ZeroedCheck};
use xrec_types::{Daddr, LogBlock};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Debug, Serialize)]
struct ScanReport {
    zeroed: String,
    head: u32,
    tail: u32,
    head_cycle: u32,
    clean_unmount: bool,
}

/// Counts deliveries without interpreting item contents.
#[derive(Default)]
struct CountingDispatcher {
    delivered: u64,
}

impl TransactionDispatcher for CountingDispatcher {
    fn deliver(&mut self, _pass: ReplayPass, _txn: &Transaction) -> xrec_error::Result<()> {
        self.delivered += 1;
        Ok(())
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage();
        return Ok(());
    };

    match cmd.as_str() {
        "scan" | "replay" => {
            let image = args.next().context("missing <image> argument")?;
            let log_bbs: u32 = args
                .next()
                .context("missing <log-bbs> argument")?
                .parse()
                .context("log-bbs must be a block count")?;
            let uuid = match args.next() {
                Some(hex) => parse_uuid(&hex)?,
                None => [0_u8; 16],
            };

            let dev = FileDevice::open(&image)
                .with_context(|| format!("opening image {image}"))?;
            let log = Log::new(&dev, Daddr(0), log_bbs, uuid)?;

            let zeroed = log.find_zeroed()?;
            let head = log.find_head()?;
            let report = log.find_tail(head)?;
            let scan = ScanReport {
                zeroed: match zeroed {
                    ZeroedCheck::Written => "written".to_owned(),
                    ZeroedCheck::Zeroed { first_blk } => format!("zeroed from {first_blk}"),
                },
                head: report.head.0,
                tail: report.tail.0,
                head_cycle: report.head_cycle.0,
                clean_unmount: report.clean_unmount,
            };
            println!("{}", serde_json::to_string_pretty(&scan)?);

            if cmd == "replay" {
                let mut dispatcher = CountingDispatcher::default();
                let (pass1, pass2) = log.run_recovery(
                    LogBlock(scan.tail),
                    LogBlock(scan.head),
                    &mut dispatcher,
                )?;
                println!("{}", serde_json::to_string_pretty(&(pass1, pass2))?);
            }
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {cmd}")
        }
    }
}

fn parse_uuid(hex: &str) -> Result<[u8; 16]> {
    let hex: String = hex.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        bail!("uuid must be 32 hex digits");
    }
    let mut out = [0_u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .context("uuid contains a non-hex digit")?;
    }
    Ok(out)
}

fn print_usage() {
    println!("xrec-harness");
    println!();
    println!("USAGE:");
    println!("  xrec-harness scan <image> <log-bbs> [uuid]");
    println!("  xrec-harness replay <image> <log-bbs> [uuid]");
}
