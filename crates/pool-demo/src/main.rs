//! Runs a scripted allocation workload against a buddy pool and prints the
//! resulting size-class table.

use core::{error::Error as _, ptr::NonNull};
use std::process;

use argh::FromArgs;
use buddy_pool::{InvariantViolation, Pool, PoolError, live_pool_count};
use log::{LevelFilter, info, warn};
use snafu::{ResultExt as _, Snafu};

mod console;

const DEFAULT_SIZES: [usize; 8] = [10, 3, 200, 1000, 32, 4000, 90, 500];

/// Seed a pool, run an allocation workload and dump its size-class table.
#[derive(Debug, FromArgs)]
struct Args {
    /// size class exponent of the seed chunks
    #[argh(option, default = "12")]
    seed_class: u8,

    /// number of seed chunks
    #[argh(option, default = "2")]
    seed_count: usize,

    /// allocation request size in bytes (repeatable)
    #[argh(option)]
    size: Vec<usize>,

    /// free every n-th allocation again (0 keeps all of them)
    #[argh(option, default = "2")]
    release_every: usize,

    /// do not print the table dump
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// log divisions and merges
    #[argh(switch)]
    trace: bool,
}

#[derive(Debug, Snafu)]
enum DemoError {
    #[snafu(display("failed to seed pool with {count} chunk(s) of class {exp}"))]
    Seed { exp: u8, count: usize, source: PoolError },
    #[snafu(display("failed to allocate {size} bytes"))]
    Allocate { size: usize, source: PoolError },
    #[snafu(display("size-class table is inconsistent"))]
    Inconsistent { source: InvariantViolation },
}

fn main() {
    let args: Args = argh::from_env();

    let level = if args.trace {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    if let Err(err) = console::init(level) {
        eprintln!("failed to install logger: {err}");
    }

    if let Err(err) = run(&args) {
        eprintln!("\x1B[31;1mError:\x1B[0m {err}");
        let mut source = err.source();
        while let Some(err) = source {
            eprintln!("  caused by: {err}");
            source = err.source();
        }
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), DemoError> {
    let pool = Pool::builder()
        .seed(args.seed_class, args.seed_count)
        .low_memory_handler(|| warn!("system allocator is out of memory"))
        .build()
        .context(SeedSnafu {
            exp: args.seed_class,
            count: args.seed_count,
        })?;
    info!("live pools: {}", live_pool_count());

    let sizes = if args.size.is_empty() {
        &DEFAULT_SIZES[..]
    } else {
        &args.size[..]
    };

    let mut live = Vec::<NonNull<u8>>::new();
    for (i, &size) in sizes.iter().enumerate() {
        let ptr = pool.allocate(size).context(AllocateSnafu { size })?;
        let info = unsafe { pool.block_info(ptr) };
        info!(
            "allocated {size} byte(s) at {ptr:p}: class {}, offset {:#x} in chunk {:#x}",
            info.class,
            info.offset(),
            info.chunk_base,
        );
        if args.release_every != 0 && (i + 1).is_multiple_of(args.release_every) {
            unsafe { pool.deallocate(ptr) };
            info!("released {size} byte(s) at {ptr:p}");
        } else {
            live.push(ptr);
        }
    }

    let snapshot = pool.snapshot();
    snapshot.check_invariants().context(InconsistentSnafu)?;
    info!(
        "{} block(s) outstanding, {} free byte(s) in {} chunk(s)",
        live.len(),
        snapshot.total_free_bytes(),
        snapshot.chunk_bases().len(),
    );
    if !args.quiet {
        print!("{snapshot}");
    }

    drop(pool);
    info!("pool torn down, live pools: {}", live_pool_count());
    Ok(())
}
