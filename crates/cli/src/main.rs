//! # DriftKV shell
//!
//! A single-process deployment of the disaggregated engine: the configured
//! StoCs run in-process behind the loopback fabric, and a REPL drives the
//! LTC node. Designed for interactive use and scripted testing (pipe
//! commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! SET key value      Replicate the log record, then apply
//! GET key            Look up a key (prints value or "(nil)")
//! DEL key            Delete a key (writes a tombstone)
//! FLUSH              Flush the memtable into a remote SSTable
//! COMPACT            Remote-compact all current tables
//! STATS              Print node state + StoC load statistics
//! EXIT / QUIT        Shut down gracefully
//! ```
//!
//! Configuration comes from the `DRIFT_*` environment variables documented
//! in the `config` crate.

use anyhow::Result;
use cli::LtcNode;
use config::NodeConfig;
use std::io::{self, BufRead, Write};

fn main() -> Result<()> {
    env_logger::init();
    let cfg = NodeConfig::from_env();
    let mut node = LtcNode::start(cfg.clone())?;

    println!(
        "DriftKV started (seq={}, stocs={}, replicas={}, chunk={}KiB)",
        node.seq(),
        cfg.stoc_servers.len(),
        cfg.log_replicas,
        cfg.sst_chunk_size / 1024,
    );
    println!("Commands: SET key value | GET key | DEL key | FLUSH | COMPACT | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_uppercase().as_str() {
                "SET" => {
                    if let Some(k) = parts.next() {
                        let v: String = parts.collect::<Vec<&str>>().join(" ");
                        if v.is_empty() {
                            println!("ERR usage: SET key value");
                        } else {
                            match node.put(k.as_bytes().to_vec(), v.as_bytes().to_vec()) {
                                Ok(()) => println!("OK"),
                                Err(e) => println!("ERR set failed: {e:#}"),
                            }
                        }
                    } else {
                        println!("ERR usage: SET key value");
                    }
                }
                "GET" => {
                    if let Some(k) = parts.next() {
                        match node.get(k.as_bytes()) {
                            Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                            Ok(None) => println!("(nil)"),
                            Err(e) => println!("ERR read failed: {e:#}"),
                        }
                    } else {
                        println!("ERR usage: GET key");
                    }
                }
                "DEL" => {
                    if let Some(k) = parts.next() {
                        match node.delete(k.as_bytes().to_vec()) {
                            Ok(()) => println!("OK"),
                            Err(e) => println!("ERR del failed: {e:#}"),
                        }
                    } else {
                        println!("ERR usage: DEL key");
                    }
                }
                "FLUSH" => match node.flush() {
                    Ok(()) => println!("OK (L0={}, L1={})", node.l0_count(), node.l1_count()),
                    Err(e) => println!("ERR flush failed: {e:#}"),
                },
                "COMPACT" => match node.compact() {
                    Ok(()) => println!("OK (L0={}, L1={})", node.l0_count(), node.l1_count()),
                    Err(e) => println!("ERR compact failed: {e:#}"),
                },
                "STATS" => {
                    println!("{node:?}");
                    match node.dc_stats() {
                        Ok(stats) => println!(
                            "stoc: queue_depth={} read_bytes={} write_bytes={}",
                            stats.queue_depth, stats.pending_read_bytes, stats.pending_write_bytes
                        ),
                        Err(e) => println!("ERR stats failed: {e:#}"),
                    }
                }
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => {
                    println!("unknown command: {other}");
                }
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}
