#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail, ensure};
use serde::Serialize;
use std::env;
use zro::{CacheStrategy, PAGE_SIZE, ZipConfig, ZipStats};
use zro_harness::{ImageBuilder, Mounted, ReaderKind, pattern};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("roundtrip") => roundtrip(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

#[derive(Debug, Serialize)]
struct RoundtripReport {
    files: usize,
    pages_per_file: u64,
    cluster_bits: u8,
    cache_strategy: CacheStrategy,
    verified_pages: u64,
    stats: ZipStats,
}

fn roundtrip(args: &[String]) -> Result<()> {
    let mut files = 4_usize;
    let mut pages = 32_u64;
    let mut cluster_bits = 12_u8;
    let mut strategy = CacheStrategy::default();

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .with_context(|| format!("{flag} requires a value"))?;
        match flag.as_str() {
            "--files" => files = value.parse().context("--files")?,
            "--pages" => pages = value.parse().context("--pages")?,
            "--cluster-bits" => cluster_bits = value.parse().context("--cluster-bits")?,
            "--strategy" => {
                strategy = serde_json::from_value(serde_json::Value::String(value.clone()))
                    .with_context(|| format!("unknown strategy {value}"))?;
            }
            other => bail!("unknown flag: {other}"),
        }
    }
    ensure!(files > 0 && pages > 0, "--files and --pages must be positive");

    let mut builder = ImageBuilder::new(cluster_bits)?;
    let len = usize::try_from(pages)? * PAGE_SIZE;
    for seed in 0..files {
        builder.add_file(pattern(u8::try_from(seed % 256)?, len));
    }
    let config = ZipConfig {
        cache_strategy: strategy,
        ..ZipConfig::default()
    };
    let mounted = Mounted::new(builder.build()?, config, ReaderKind::Threaded(2))?;

    let indices: Vec<u64> = (0..pages).collect();
    let mut verified = 0_u64;
    for file in 0..files {
        let (result, read) = mounted.read_pages(file, &indices);
        result.with_context(|| format!("read_pages of file {file}"))?;
        for (index, page) in indices.iter().zip(&read) {
            ensure!(
                page.to_vec() == mounted.file(file).expected_page(*index),
                "file {file} page {index} differs"
            );
            verified += 1;
        }
    }

    let report = RoundtripReport {
        files,
        pages_per_file: pages,
        cluster_bits,
        cache_strategy: strategy,
        verified_pages: verified,
        stats: mounted.context.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_usage() {
    println!("zro-harness: read-path test harness");
    println!();
    println!("USAGE:");
    println!("  zro-harness roundtrip [--files N] [--pages N] [--cluster-bits B] [--strategy S]");
    println!();
    println!("  Builds an in-memory image, reads every page back through the");
    println!("  decompression pipeline, verifies it and prints the pipeline stats.");
    println!("  S is one of disabled, read_ahead, read_around.");
}
