//! Device-independent JTAG plumbing.
//!
//! This crate drives scan chains without knowing anything about the cable
//! on the other end: a TAP state machine with precomputed minimal TMS
//! paths, reusable I/O templates that accumulate state moves, TDI data and
//! TDO captures, a compiler that flattens a template into ternary wire
//! strings, and chain discovery that identifies every device on a chain
//! from raw scans.
//!
//! Cable drivers live behind the [`Transport`] trait: they get the
//! compiled strings once, may splice their own command framing into them,
//! and from then on only move concrete bits. The [`sim`] module has
//! software transports (a full TAP-chain simulator among them) for running
//! everything without hardware.
//!
//! # Quickstart
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use jtag_tools::{Chain, ChainParams, JtagTemplate, PartDb, Tdi};
//! use jtag_tools::sim::{VirtualChain, VirtualTap};
//!
//! let transport = Arc::new(Mutex::new(VirtualChain::new(&[VirtualTap {
//!     idcode: Some(0x1234_5003),
//!     ir_length: 6,
//!     ir_capture: 0b00_0001,
//!     dr_length: 8,
//! }])));
//! let chain = Chain::discover(transport.clone(), &PartDb::new(), ChainParams::default())?;
//! assert_eq!(chain.len(), 1);
//!
//! let mut write = JtagTemplate::with_bypass(transport, chain[0].bypass);
//! write.write_ir(6, Tdi::Word(0b10_0010), true)?;
//! write.write_dr(8, Tdi::var(), true)?;
//! write.run(&[&[0xA5]])?;
//! # Ok::<(), jtag_tools::JtagError>(())
//! ```

#![forbid(unsafe_code)]

pub mod chain;
pub mod partdb;
pub mod sim;
pub mod states;
pub mod template;
pub mod transport;
pub mod xstring;

pub use chain::{BypassInfo, Chain, ChainParams, IdCode, Part};
pub use partdb::{PartDb, PartParams};
pub use states::{TapState, TmsPath};
pub use template::{JtagTemplate, Tdi};
pub use transport::Transport;
pub use xstring::{BitString, TemplateStrings, XBit, XString};

#[derive(Debug, thiserror::Error)]
pub enum JtagError {
    #[error("A transport I/O error occurred.")]
    Transport(#[from] std::io::Error),

    /// The state has no self-loop TMS level to park on.
    #[error("{0} is not a valid cycle state")]
    NotCycleState(TapState),

    #[error("no TMS path from {from} to {to}")]
    NoPath { from: TapState, to: TapState },

    /// Data shifts and captures only happen in `shift_dr`/`shift_ir`.
    #[error("cannot shift data in {0}")]
    NotShiftState(TapState),

    #[error("TDI pattern is {got} bits for a {bits}-clock shift")]
    TdiWidthMismatch { bits: usize, got: usize },

    #[error(
        "mismatched state transitions on join: {tail} -> {via} uses different TMS values than {head} -> {via}"
    )]
    JoinMismatch {
        tail: TapState,
        head: TapState,
        via: TapState,
    },

    #[error("templates are bound to different transports")]
    TransportMismatch,

    #[error("templates carry different bypass layouts")]
    BypassMismatch,

    #[error("end_loop without a matching begin_loop")]
    UnbalancedLoop,

    #[error("TDI word {value:#x} does not fit in {bits} bits")]
    TdiOverflow { bits: usize, value: u128 },

    #[error("expected TDI stream lengths {expected:?}, got {got:?}")]
    TdiStreamMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// The chain read back a constant level; nothing is connected, or the
    /// lines are shorted.
    #[error("JTAG chain stuck at {level} ({op})")]
    ChainStuck { level: u8, op: &'static str },

    #[error("inconsistent JTAG reads ({op}):\n    {dump}")]
    InconsistentReads { op: &'static str, dump: String },

    #[error("JTAG chain appears to have more than {0} devices in it")]
    TooManyDevices(usize),

    #[error("unexpectedly long instruction register: {0}")]
    OverlongIr(String),

    #[error("empty JTAG chain ({0})")]
    EmptyChain(&'static str),

    /// The ID scan ran out of bits in the middle of an IDCODE.
    #[error("id scan ended inside an IDCODE")]
    TruncatedIdcode,

    /// The first captured instruction bit must be 1 (IEEE 1149.1 pins
    /// every capture to `...01`).
    #[error("illegal last device in chain: {0}")]
    IllegalLastDevice(String),

    #[error("broken instruction register: expected {devices} devices, got {capture}")]
    BrokenIr { devices: usize, capture: String },

    /// Zero or several instruction-register layouts survived every check;
    /// the raw reads are dumped to the log for inspection.
    #[error("cannot resolve instruction register layout: {candidates} candidate partitions")]
    AmbiguousIr { candidates: usize },
}
