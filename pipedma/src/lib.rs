//! pipedma: host-side DMA engine for a programmable switch pipeline.
//!
//! The engine sits between driver code that programs the forwarding
//! pipeline and the descriptor rings of the device. Callers open a
//! [session](DmaContext::open_session), compose instruction lists into
//! fixed-size DMA buffers, and push them; block reads and broadcast block
//! writes move table contents in bulk. Completions are polled off the rings
//! with [`DmaContext::service_device`] and routed back to the session that
//! submitted them by the message id echoed with each one.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pipedma::{ConfigBuilder, DevId, DeviceInfo, DmaContext, Family, Loopback, Notifier, Stage};
//!
//! let config = ConfigBuilder::new().build().unwrap();
//! let ctx = DmaContext::new(config, Arc::new(Loopback::new(64))).unwrap();
//! ctx.add_device(DevId(0), DeviceInfo::simple(Family::Gen2, 4, 12)).unwrap();
//!
//! let sess = ctx.open_session().unwrap();
//! ctx.il_add(sess, DevId(0), 0, Stage::Mau(3), 0b1111, &pipedma::instr::write_reg(0x40, 1))
//!     .unwrap();
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! ctx.il_push(sess, Some(Notifier::channel(tx))).unwrap();
//! ctx.service_device(DevId(0));
//! assert!(!rx.recv().unwrap().error);
//! ctx.close_session(sess).unwrap();
//! ```
//!
//! # Threading
//!
//! Every operation takes `&self`. Sessions are independent and may be
//! driven from different threads; completion servicing may run on yet
//! another. Notifications are always delivered with no session lock held,
//! so a callback may submit new work.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod block;
pub(crate) mod buffer;
pub(crate) mod context;
pub(crate) mod diag;
pub(crate) mod dispatch;
pub(crate) mod ilist;
pub(crate) mod loopback;
pub(crate) mod metrics;
pub(crate) mod msg_id;
pub(crate) mod notify;
pub(crate) mod ring;
pub(crate) mod session;
pub(crate) mod topology;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod instr;

// ── Re-exports: Engine ──────────────────────────────────────────────────

/// The DMA engine.
pub use context::DmaContext;
/// Caller session handle.
pub use session::SessionId;
/// Per-session debug counters.
pub use session::SessionStats;
/// Snapshot of one composing instruction-list chain.
pub use ilist::PendingChain;

// ── Re-exports: Block transfers ─────────────────────────────────────────

/// Entry widths accepted by block transfers.
pub use block::ENTRY_SIZES;
/// Read-block request.
pub use block::ReadBlockReq;
/// Write-block request.
pub use block::WriteBlockReq;

// ── Re-exports: Buffers ─────────────────────────────────────────────────

/// Buffer pool type.
pub use buffer::BufferType;
/// A DMA buffer checked out of a pool.
pub use buffer::DmaBuf;
/// Identifies the pool a buffer came from.
pub use buffer::PoolKey;

// ── Re-exports: Devices and rings ───────────────────────────────────────

pub use topology::{DevId, DeviceInfo, Family, Stage};
/// One entry taken off a completion ring.
pub use ring::Completion;
/// Operation-specific descriptor fields.
pub use ring::DescOp;
/// Transfer descriptor handed to the transport.
pub use ring::Descriptor;
/// Per-ring in-flight accounting.
pub use ring::RingCredit;
pub use ring::{RingFamily, RingId};
/// Descriptor-ring transport the engine drives.
pub use ring::RingTransport;
/// Software transport used for tests and bring-up.
pub use loopback::{Loopback, Posted};
pub use msg_id::{MsgId, OpKind};

// ── Re-exports: Completion delivery ─────────────────────────────────────

pub use notify::{IlCompletion, Notification, Notifier, ReadBlockEvent, ReadIlEvent, WriteBlockEvent};

// ── Re-exports: Diagnostics ─────────────────────────────────────────────

pub use diag::{DeviceDump, PoolDump, SessionDump};

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Engine configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Buffer pool layout.
pub use config::{PoolLayout, PoolSpec};
/// Engine error.
pub use error::Error;
/// Engine result alias.
pub use error::Result;
/// Transport failure.
pub use error::TransportError;
