//! `newt` is the core of a Rust LwM2M client:
//! - A non-blocking CoAP **exchange engine** that drives one confirmable or
//!   non-confirmable request/response interaction to completion, including
//!   retransmission back-off and RFC7959 block-wise transfer
//!   ([`exchange`])
//! - A **registration state machine** that sequences Bootstrap, Register,
//!   Update, Observe/Notify, Queue Mode and Disable behavior on top of
//!   repeated exchanges ([`reg`])
//!
//! ## LwM2M
//! Lightweight M2M is a device-management protocol layered on CoAP: a managed
//! device registers itself with a management server, keeps that registration
//! alive, and exposes its data model (Objects / Instances / Resources) to the
//! server for read, write, execute and observe operations.
//!
//! ## Cooperative non-blocking design
//! There is no internal threading and no blocking I/O anywhere in this crate.
//! All progress happens inside explicit calls to [`reg::Client::step`], which
//! the host application invokes repeatedly from its main loop. Anything that
//! cannot complete immediately yields [`nb::Error::WouldBlock`] and must be
//! polled again later; [`reg::Client::time_to_next`] tells the host how long
//! it may sleep before the next call is useful.
//!
//! Timers are monotonic [`embedded_time::Instant`]s, never wall-clock time,
//! so scheduling stays correct across real-time clock adjustments.
//!
//! ## Collaborators
//! The CoAP wire codec is consumed from [`coap_lite`]; UDP/DTLS transport,
//! clock and RNG backends are provided by the host through the [`net::Socket`]
//! and [`time::Clock`] contracts; the device's data model is provided through
//! the [`dm::ObjectHandler`] contract.

// -
// style
#![allow(clippy::unused_unit)]
// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]


pub(crate) mod logging;

/// RFC7959 Block1/Block2 option codec
pub mod block;

/// runtime configuration
pub mod config;

/// data-model contract & request dispatch
pub mod dm;

/// the CoAP exchange engine
pub mod exchange;

/// CoAP message helpers over the `coap_lite` framing
pub mod msg;

/// network socket contract
pub mod net;

/// registration / connection state machine
pub mod reg;

/// customizable retrying of fallible operations
pub mod retry;

/// time primitives
pub mod time;
