#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use dc::{BackendConfig, BackendFlags, DiskCache, NUM_STREAMS};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize)]
struct StatsOutput {
    items: Vec<StatItem>,
}

#[derive(Debug, Serialize)]
struct StatItem {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    ok: bool,
    entries: i32,
    dirty_entries: Option<u32>,
    error: Option<String>,
    error_code: Option<i32>,
}

#[derive(Debug, Serialize)]
struct ListedEntry {
    key: String,
    address: String,
    stream_sizes: Vec<i32>,
    /// Seconds since the Unix epoch.
    last_used: u64,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "stats" | "check" | "list" => {
            let Some(path) = args.next() else {
                bail!("{command} requires a cache directory argument");
            };
            let json = args.any(|arg| arg == "--json");
            let cache = open_cache(Path::new(&path))?;
            match command.as_str() {
                "stats" => stats(&cache, json),
                "check" => check(&cache, json),
                _ => list(&cache, json),
            }
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("dc\n");
    println!("USAGE:");
    println!("  dc stats <cache-dir> [--json]");
    println!("  dc check <cache-dir> [--json]");
    println!("  dc list <cache-dir> [--json]");
}

/// Open an existing cache as it is: no run id bump, no crash flag, no
/// trimming and no recreation of damaged files.
fn open_cache(path: &Path) -> Result<DiskCache> {
    if !path.join("index").is_file() {
        bail!("{} does not contain a cache index", path.display());
    }
    let config = BackendConfig {
        max_size: i64::from(i32::MAX),
        flags: BackendFlags {
            upgrade_mode: true,
            no_load_protection: true,
            ..BackendFlags::default()
        },
        ..BackendConfig::at(path)
    };
    let cache = DiskCache::new(config).context("start cache thread")?;
    cache
        .init()
        .wait()
        .with_context(|| format!("failed to open cache at {}", path.display()))?;
    Ok(cache)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn stats(cache: &DiskCache, json: bool) -> Result<()> {
    let items = cache.get_stats().wait().context("read stats")?;
    if json {
        let items = items
            .into_iter()
            .map(|(name, value)| StatItem { name, value })
            .collect();
        return print_json(&StatsOutput { items });
    }
    let width = items.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, value) in items {
        println!("{name:<width$}  {value}");
    }
    Ok(())
}

fn check(cache: &DiskCache, json: bool) -> Result<()> {
    let entries = cache.entry_count().wait().context("read entry count")?;
    let output = match cache.self_check().wait() {
        Ok(dirty) => CheckOutput {
            ok: true,
            entries,
            dirty_entries: Some(dirty),
            error: None,
            error_code: None,
        },
        Err(err) => CheckOutput {
            ok: false,
            entries,
            dirty_entries: None,
            error_code: match &err {
                dc::DcError::Check(code) => Some(code.code()),
                _ => None,
            },
            error: Some(err.to_string()),
        },
    };
    if json {
        print_json(&output)?;
    } else if let Some(dirty) = output.dirty_entries {
        println!("cache is consistent: {entries} entries, {dirty} dirty");
    } else {
        println!("cache check failed: {}", output.error.as_deref().unwrap_or("unknown error"));
    }
    if !output.ok {
        bail!("self check failed");
    }
    Ok(())
}

fn list(cache: &DiskCache, json: bool) -> Result<()> {
    let mut listed = Vec::new();
    let mut it = cache.enumerate();
    while let Some(entry) = cache.open_next_entry(&mut it).wait().context("enumerate entries")? {
        let mut stream_sizes = Vec::with_capacity(NUM_STREAMS);
        for index in 0..NUM_STREAMS {
            stream_sizes.push(entry.data_size(index).wait().context("read stream size")?);
        }
        let last_used = entry.last_used().wait().context("read entry times")?;
        listed.push(ListedEntry {
            key: entry.key().to_owned(),
            address: format!("{:#010x}", entry.address()),
            stream_sizes,
            last_used: unix_seconds(last_used),
        });
    }
    cache.end_enumeration(it);

    if json {
        return print_json(&listed);
    }
    for entry in &listed {
        let sizes: Vec<String> = entry.stream_sizes.iter().map(i32::to_string).collect();
        println!("{}  {}  [{}]  {}", entry.address, entry.last_used, sizes.join(", "), entry.key);
    }
    println!("{} entries", listed.len());
    Ok(())
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_secs())
}
