// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};

lazy_static! {
    pub static ref BLOCK_SIZE_BYTES: Box<Histogram> = {
        let block_size = Box::new(
            Histogram::with_opts(
                HistogramOpts::new("bucket_cache_block_size", "Histogram of cached block size")
                    .buckets(vec![
                        32., 64., 128., 256., 512., 1024., 2048., 4096., 8192., 16384., 32768.,
                        65536.,
                    ]),
            )
            .unwrap(),
        );

        prometheus::default_registry()
            .register(block_size.clone())
            .expect("registering the bucket_cache_block_size metric must succeed");
        block_size
    };
    pub static ref IO_HIT_LATENCY: Box<Histogram> = {
        let hist = Box::new(
            Histogram::with_opts(HistogramOpts::new(
                "bucket_cache_io_hit_latency_seconds",
                "Latency of engine reads that served a cache hit",
            ))
            .unwrap(),
        );
        prometheus::default_registry()
            .register(hist.clone())
            .expect("registering the bucket_cache_io_hit_latency_seconds metric must succeed");
        hist
    };
    pub static ref HITS: Box<IntCounter> = register_counter(
        "bucket_cache_hits_total",
        "Total number of get() calls served from RAM staging or the backing map",
    );
    pub static ref MISSES: Box<IntCounter> = register_counter(
        "bucket_cache_misses_total",
        "Total number of get() calls that found nothing",
    );
    pub static ref EVICTIONS: Box<IntCounter> = register_counter(
        "bucket_cache_evictions_total",
        "Total number of freeSpace() runs",
    );
    pub static ref EVICTED_BLOCKS: Box<IntCounter> = register_counter(
        "bucket_cache_evicted_blocks_total",
        "Total number of blocks evicted across all freeSpace() runs",
    );
    pub static ref FAILED_BLOCK_ADDITIONS: Box<IntCounter> = register_counter(
        "bucket_cache_failed_block_additions_total",
        "Total number of admissions dropped because the writer queue stayed full",
    );
    pub static ref FAILED_NO_SPACE_IN_CLASS: Box<IntCounter> = register_counter(
        "bucket_cache_failed_no_space_in_class_total",
        "Total number of writes dropped after NoSpaceInThisSizeClass could not be resolved",
    );
    pub static ref USED_SIZE_BYTES: Box<IntGauge> = register_gauge(
        "bucket_cache_used_size_bytes",
        "Bytes currently allocated in the bucket allocator",
    );
    pub static ref BLOCK_COUNT: Box<IntGauge> = register_gauge(
        "bucket_cache_block_count",
        "Number of blocks tracked across RAM staging and the backing map",
    );
}

fn register_counter(name: &str, help: &str) -> Box<IntCounter> {
    let counter = Box::new(IntCounter::with_opts(Opts::new(name, help)).unwrap());
    prometheus::default_registry()
        .register(counter.clone())
        .unwrap_or_else(|e| panic!("registering the {name} metric must succeed: {e}"));
    counter
}

fn register_gauge(name: &str, help: &str) -> Box<IntGauge> {
    let gauge = Box::new(IntGauge::with_opts(Opts::new(name, help)).unwrap());
    prometheus::default_registry()
        .register(gauge.clone())
        .unwrap_or_else(|e| panic!("registering the {name} metric must succeed: {e}"));
    gauge
}
