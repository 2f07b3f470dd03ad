// SPDX-License-Identifier: BSD-3-Clause-LBNL
use prometheus::{
    exponential_buckets, register_counter, register_counter_vec, register_gauge,
    register_gauge_vec, register_histogram, Counter, CounterVec, Gauge, GaugeVec, Histogram,
    HistogramOpts, Opts,
};
use std::sync::LazyLock;

use crate::constants::MAX_SEEDED_SHARDS;
use crate::errors::{DetectError, ReassembleError};

// Counters
pub static PACKETS_RECEIVED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_packets_received_total",
        "The total number of frames handed to the manager"
    ))
    .unwrap()
});

pub static DETECT_ERRORS: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        Opts::new(
            "netdefrag_detect_errors_total",
            "Frames rejected during header inspection"
        ),
        &["kind"]
    )
    .unwrap()
});

pub static FRAGMENTS_DETECTED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_fragments_detected_total",
        "Frames identified as IP fragments"
    ))
    .unwrap()
});

pub static FRAGMENTS_ACCEPTED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_fragments_accepted_total",
        "Fragments inserted into a group"
    ))
    .unwrap()
});

pub static FRAGMENTS_DUPLICATE: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_fragments_duplicate_total",
        "Fragments dropped because their offset was already present"
    ))
    .unwrap()
});

pub static GROUPS_CREATED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_groups_created_total",
        "Fragment groups opened"
    ))
    .unwrap()
});

pub static GROUPS_COMPLETED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_groups_completed_total",
        "Fragment groups that received every fragment"
    ))
    .unwrap()
});

pub static GROUPS_EXPIRED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_groups_expired_total",
        "Fragment groups released by the expiry sweep"
    ))
    .unwrap()
});

pub static GROUPS_ABANDONED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_groups_abandoned_total",
        "Incomplete fragment groups released at shutdown"
    ))
    .unwrap()
});

pub static REASSEMBLY_ERRORS: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        Opts::new(
            "netdefrag_reassembly_errors_total",
            "Complete groups that failed to rebuild"
        ),
        &["kind"]
    )
    .unwrap()
});

pub static FULL_PACKETS_PUSHED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_full_packets_pushed_total",
        "Reassembled packets placed on the output queue"
    ))
    .unwrap()
});

pub static FULL_PACKETS_POPPED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_full_packets_popped_total",
        "Reassembled packets handed to the consumer"
    ))
    .unwrap()
});

pub static FULL_PACKETS_TRIMMED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_full_packets_trimmed_total",
        "Reassembled packets discarded by the output queue valve"
    ))
    .unwrap()
});

pub static ELEMENTS_ALLOCATED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_elements_allocated_total",
        "Fragment elements allocated because the pool was empty"
    ))
    .unwrap()
});

pub static ELEMENTS_RECYCLED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_elements_recycled_total",
        "Fragment elements returned to the pool"
    ))
    .unwrap()
});

pub static LAYER_RESETS: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "netdefrag_layer_resets_total",
        "Resets of per-collector header templates"
    ))
    .unwrap()
});

// Histograms
pub static REASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(HistogramOpts::new(
        "netdefrag_reassembly_duration_seconds",
        "Time spent rebuilding a complete group"
    )
    .buckets(exponential_buckets(0.000_001, 2.0, 20).unwrap()))
    .unwrap()
});

// Gauges
pub static OUTPUT_QUEUE_LENGTH: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!(Opts::new(
        "netdefrag_output_queue_length",
        "Reassembled packets waiting to be popped"
    ))
    .unwrap()
});

pub static ACTIVE_GROUPS: LazyLock<GaugeVec> = LazyLock::new(|| {
    register_gauge_vec!(
        Opts::new(
            "netdefrag_active_groups",
            "Incomplete fragment groups held by each collector"
        ),
        &["shard"]
    )
    .unwrap()
});

/// Initialize all metrics with default values
pub fn init_metrics(shards: usize) {
    for kind in DetectError::KINDS {
        DETECT_ERRORS.with_label_values(&[kind]).inc_by(0.0);
    }
    for kind in ReassembleError::KINDS {
        REASSEMBLY_ERRORS.with_label_values(&[kind]).inc_by(0.0);
    }

    for i in 0..shards.min(MAX_SEEDED_SHARDS) {
        let shard = i.to_string();
        ACTIVE_GROUPS.with_label_values(&[&shard]).set(0.0);
    }
    OUTPUT_QUEUE_LENGTH.set(0.0);
}
