//! `zip-over-udp` — an account-transfer service ("ZIP") over plain UDP.
//!
//! Clients discover a server on the local network, are registered as
//! accounts with a starting balance, and submit transfer requests that
//! debit one account and credit another.  UDP gives no delivery guarantees,
//! so reliability is layered on top: the client runs a stop-and-wait ARQ
//! loop (send, wait for the matching ACK, retransmit on timeout) and the
//! server deduplicates retransmissions by tracking the last processed
//! request id per client.
//!
//! # Architecture
//!
//! ```text
//!  stdin ──▶ Client (sender)  ── request ──▶  Server receive loop
//!               │    ▲                             │ one worker thread
//!               │    │ condvar                     ▼ per datagram
//!               │  Client (receiver) ◀── reply ── ServerState
//!               │    ▲                             │
//!               ▼    │                             ▼
//!             Transport ◀─── UDP datagrams ───▶ LockedMap (accounts)
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     — fixed-size wire format (encode / decode)
//! - [`transport`]  — packet-oriented UDP endpoint
//! - [`locked_map`] — concurrent map with per-entry reader-writer locks
//!                    and an atomic two-entry operation
//! - [`server`]     — request dispatch and the transaction state machine
//! - [`client`]     — discovery, user input loop, stop-and-wait sender

pub mod client;
pub mod locked_map;
pub mod packet;
pub mod server;
pub mod transport;
