//! Engine metrics.
//!
//! Process-wide counters for completion routing, pool pressure and ring
//! back-pressure. Exposed through `metriken` for whatever exporter the
//! embedding driver registers.

use metriken::{Counter, Gauge, metric};

// ── Completions ──────────────────────────────────────────────────

#[metric(
    name = "pipedma/completions/processed",
    description = "Completions taken off completion rings"
)]
pub static COMPLETIONS_PROCESSED: Counter = Counter::new();

#[metric(
    name = "pipedma/completions/dropped",
    description = "Completions dropped after failing validation or lookup"
)]
pub static COMPLETIONS_DROPPED: Counter = Counter::new();

#[metric(
    name = "pipedma/notifications/forwarded",
    description = "Learn, stat and idle notifications handed to listeners"
)]
pub static NOTIFICATIONS_FORWARDED: Counter = Counter::new();

// ── Buffers ──────────────────────────────────────────────────────

#[metric(
    name = "pipedma/buffers/outstanding",
    description = "DMA buffers currently checked out of their pools"
)]
pub static BUFFERS_OUTSTANDING: Gauge = Gauge::new();

#[metric(
    name = "pipedma/pool/exhausted",
    description = "Allocation attempts that found the pool empty"
)]
pub static POOL_EXHAUSTED: Counter = Counter::new();

// ── Rings ────────────────────────────────────────────────────────

#[metric(
    name = "pipedma/ring/full_retries",
    description = "Descriptor pushes retried after servicing a full ring"
)]
pub static RING_FULL_RETRIES: Counter = Counter::new();

#[metric(
    name = "pipedma/ring/flow_control_waits",
    description = "Pushes that waited for a completion ring to drain"
)]
pub static FLOW_CONTROL_WAITS: Counter = Counter::new();

// ── Operations ───────────────────────────────────────────────────

#[metric(
    name = "pipedma/ilist/buffers_pushed",
    description = "Instruction-list buffers transmitted"
)]
pub static IL_BUFFERS_PUSHED: Counter = Counter::new();

#[metric(
    name = "pipedma/block/read_subops",
    description = "Read-block sub-transfers submitted"
)]
pub static READ_BLOCK_SUBOPS: Counter = Counter::new();

#[metric(
    name = "pipedma/block/write_ops",
    description = "Write-block broadcasts submitted"
)]
pub static WRITE_BLOCK_OPS: Counter = Counter::new();
