//! Server side: account registry, request dispatch, and the transfer
//! state machine.
//!
//! [`ServerState`] holds all protocol state and processes one packet at a
//! time via [`ServerState::handle`]; it performs no I/O, so the whole state
//! machine is unit-testable without sockets.  [`Server`] owns the socket:
//! its receive loop hands every valid datagram to a detached worker thread,
//! and workers run concurrently against the shared state.
//!
//! # Exactly-once execution
//!
//! The server tracks the last processed request id per client.  A request
//! whose id is not greater than that is a retransmission: it is answered
//! with an ACK re-derived from current state and changes nothing.  The
//! duplicate check and the id advance happen inside a single write-locked
//! [`LockedMap::update`] — done as separate read and write steps, two
//! workers holding the same retransmitted datagram could both pass the
//! check and debit twice.  Because the id is committed before any balance
//! change, the loser of that race always lands in the replay branch.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::locked_map::LockedMap;
use crate::packet::{Packet, PacketType, Payload};
use crate::transport::{Transport, TransportError};

/// Balance granted to every client on first discovery.
pub const CLIENT_INITIAL_BALANCE: u32 = 100;

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

/// Per-client account state, keyed by the client's source IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRecord {
    /// Highest request id already processed; ids at or below it replay.
    pub last_request_id: u32,
    pub balance: u32,
}

impl Default for ClientRecord {
    fn default() -> Self {
        Self {
            last_request_id: 0,
            balance: CLIENT_INITIAL_BALANCE,
        }
    }
}

/// The concurrent account registry.
pub type AccountMap = LockedMap<Ipv4Addr, ClientRecord>;

/// One completed transfer, kept for the operator-facing history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub src: Ipv4Addr,
    pub request_id: u32,
    pub dest: Ipv4Addr,
    pub value: u32,
}

/// Global aggregates, maintained under one mutex separate from all entry
/// locks.  `total_balance` changes only when a client registers; transfers
/// conserve it.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub num_transactions: u64,
    pub total_transferred: u64,
    pub total_balance: u64,
    pub history: Vec<Transfer>,
}

// ---------------------------------------------------------------------------
// ServerState
// ---------------------------------------------------------------------------

/// Outcome of the admission step on the sender's entry.
enum Admission {
    /// Request id already processed; replay from current state.
    Duplicate { last_id: u32, balance: u32 },
    /// New id, committed; `balance` is the sender's balance at admission.
    Fresh { balance: u32 },
}

/// All protocol state.  Free of I/O; safe to share across worker threads.
pub struct ServerState {
    accounts: AccountMap,
    stats: Mutex<ServerStats>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            accounts: AccountMap::new(),
            stats: Mutex::new(ServerStats::default()),
        }
    }

    /// Snapshot of the aggregates.
    pub fn stats(&self) -> ServerStats {
        self.stats.lock().unwrap().clone()
    }

    /// Current record for a registered client.
    pub fn account(&self, ip: Ipv4Addr) -> Option<ClientRecord> {
        self.accounts.read(&ip)
    }

    /// Process one inbound packet from `src`; the return value, if any, is
    /// the reply to send back.  Reply-typed and unexpected packets are
    /// ignored without an answer.
    pub fn handle(&self, packet: &Packet, src: Ipv4Addr) -> Option<Packet> {
        match (packet.ptype, packet.payload) {
            (PacketType::ClientDiscovery, _) => self.handle_discovery(src),
            (PacketType::TransactionRequest, Payload::Request { dest, value }) => {
                self.handle_transfer(src, packet.request_id, dest, value)
            }
            _ => None,
        }
    }

    /// Register the sender if new and report its account state.
    ///
    /// Idempotent: a repeated discovery changes nothing and produces the
    /// same ACK shape, so clients may also use it as a state probe.
    fn handle_discovery(&self, src: Ipv4Addr) -> Option<Packet> {
        if self.accounts.insert(src, ClientRecord::default()) {
            let mut stats = self.stats.lock().unwrap();
            stats.total_balance += u64::from(CLIENT_INITIAL_BALANCE);
            log::info!(
                "client {src} registered, num transactions {} total transferred {} total balance {}",
                stats.num_transactions,
                stats.total_transferred,
                stats.total_balance
            );
        }
        let record = self.accounts.read(&src)?;
        Some(Packet::discovery_ack(record.last_request_id, record.balance))
    }

    /// The transfer state machine.  Validation failures answer with a typed
    /// ACK; only a registered destination with sufficient sender funds
    /// reaches the atomic pair step.
    fn handle_transfer(
        &self,
        src: Ipv4Addr,
        request_id: u32,
        dest: Ipv4Addr,
        value: u32,
    ) -> Option<Packet> {
        // Admission: duplicate check and id advance as one atomic step on
        // the sender's entry.
        let admission = self.accounts.update(&src, |record| {
            if request_id <= record.last_request_id {
                Admission::Duplicate {
                    last_id: record.last_request_id,
                    balance: record.balance,
                }
            } else {
                record.last_request_id = request_id;
                Admission::Fresh {
                    balance: record.balance,
                }
            }
        });

        let Some(admission) = admission else {
            // Unregistered sender.
            log::info!("client {src} unknown, id req {request_id} dest {dest} value {value}");
            return Some(Packet::error_ack(request_id, 0));
        };

        let balance = match admission {
            Admission::Duplicate { last_id, balance } => {
                log::info!("client {src} DUP!! id req {request_id} dest {dest} value {value}");
                return Some(Packet::transaction_ack(last_id, balance));
            }
            Admission::Fresh { balance } => {
                log::info!("client {src} id req {request_id} dest {dest} value {value}");
                balance
            }
        };

        // Zero-value transfers acknowledge without touching any account.
        if value == 0 {
            return Some(Packet::transaction_ack(request_id, balance));
        }
        if !self.accounts.exists(&dest) {
            return Some(Packet::invalid_client_ack(request_id, balance));
        }
        // Self-transfers are a no-op; the pair operation needs two entries.
        if dest == src {
            return Some(Packet::transaction_ack(request_id, balance));
        }

        // Debit and credit while holding both entry write locks.  The
        // balance check lives inside the closure: outside it, a concurrent
        // transfer could drain the account between check and debit.
        let outcome = self.accounts.atomic_pair(&src, &dest, |from, to| {
            if from.balance < value {
                Err(from.balance)
            } else {
                from.balance -= value;
                to.balance += value;
                Ok(from.balance)
            }
        })?;

        match outcome {
            Err(balance) => Some(Packet::insufficient_balance_ack(request_id, balance)),
            Ok(new_balance) => {
                let mut stats = self.stats.lock().unwrap();
                stats.num_transactions += 1;
                stats.total_transferred += u64::from(value);
                stats.history.push(Transfer {
                    src,
                    request_id,
                    dest,
                    value,
                });
                log::info!(
                    "num transactions {} total transferred {} total balance {}",
                    stats.num_transactions,
                    stats.total_transferred,
                    stats.total_balance
                );
                Some(Packet::transaction_ack(request_id, new_balance))
            }
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The network-facing server: a bound socket plus the shared state.
pub struct Server {
    transport: Arc<Transport>,
    state: Arc<ServerState>,
}

impl Server {
    /// Bind 0.0.0.0 on `port` (0 = OS-assigned, used by tests) and log the
    /// zero-valued aggregates.
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        let transport = Transport::bind(port)?;
        let state = ServerState::new();
        log::info!("listening on {}", transport.local_addr);
        log::info!("num transactions 0 total transferred 0 total balance 0");
        Ok(Self {
            transport: Arc::new(transport),
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Receive loop: one full-size datagram per iteration, each handed to a
    /// detached worker.  Undecodable datagrams are dropped without a reply;
    /// transient socket errors are logged and the loop continues.
    pub fn run(&self) {
        loop {
            match self.transport.recv_from() {
                Ok((packet, sender)) => {
                    let SocketAddr::V4(sender) = sender else {
                        continue;
                    };
                    let state = Arc::clone(&self.state);
                    let transport = Arc::clone(&self.transport);
                    thread::spawn(move || {
                        if let Some(reply) = state.handle(&packet, *sender.ip()) {
                            if let Err(e) = transport.send_to(&reply, SocketAddr::V4(sender)) {
                                log::warn!("failed to reply to {sender}: {e}");
                            }
                        }
                    });
                }
                Err(TransportError::Packet(e)) => {
                    log::debug!("dropping malformed datagram: {e}");
                }
                Err(TransportError::Io(e)) => {
                    log::warn!("receive error: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    /// Register `count` clients 10.0.0.1 … 10.0.0.count.
    fn state_with_clients(count: u8) -> ServerState {
        let state = ServerState::new();
        for i in 1..=count {
            let ack = state.handle(&Packet::discovery(), ip(i)).unwrap();
            assert_eq!(ack.ptype, PacketType::ClientDiscoveryAck);
        }
        state
    }

    fn transfer(state: &ServerState, src: Ipv4Addr, rid: u32, dest: Ipv4Addr, value: u32) -> Packet {
        state
            .handle(&Packet::transfer(rid, dest, value), src)
            .expect("transfer request must be answered")
    }

    // Discovery

    #[test]
    fn discovery_registers_with_initial_balance() {
        let state = ServerState::new();
        let ack = state.handle(&Packet::discovery(), ip(1)).unwrap();

        assert_eq!(ack, Packet::discovery_ack(0, CLIENT_INITIAL_BALANCE));
        assert_eq!(
            state.account(ip(1)),
            Some(ClientRecord {
                last_request_id: 0,
                balance: CLIENT_INITIAL_BALANCE
            })
        );
        assert_eq!(state.stats().total_balance, 100);
    }

    #[test]
    fn discovery_is_idempotent() {
        let state = ServerState::new();
        let first = state.handle(&Packet::discovery(), ip(1)).unwrap();
        let second = state.handle(&Packet::discovery(), ip(1)).unwrap();

        assert_eq!(first, second);
        assert_eq!(state.stats().total_balance, 100);
    }

    #[test]
    fn discovery_reflects_current_state() {
        let state = state_with_clients(2);
        transfer(&state, ip(1), 1, ip(2), 30);

        // A later discovery reports the post-transfer balance and the last
        // processed id.
        let ack = state.handle(&Packet::discovery(), ip(1)).unwrap();
        assert_eq!(ack, Packet::discovery_ack(1, 70));
    }

    // Transfer happy path

    #[test]
    fn single_transfer_moves_balance() {
        let state = state_with_clients(2);
        let ack = transfer(&state, ip(1), 1, ip(2), 30);

        assert_eq!(ack, Packet::transaction_ack(1, 70));
        assert_eq!(state.account(ip(1)).unwrap().balance, 70);
        assert_eq!(state.account(ip(2)).unwrap().balance, 130);

        let stats = state.stats();
        assert_eq!(stats.num_transactions, 1);
        assert_eq!(stats.total_transferred, 30);
        assert_eq!(stats.total_balance, 200);
        assert_eq!(
            stats.history,
            vec![Transfer {
                src: ip(1),
                request_id: 1,
                dest: ip(2),
                value: 30
            }]
        );
    }

    // Duplicates

    #[test]
    fn duplicate_request_replays_without_second_debit() {
        let state = state_with_clients(2);
        let first = transfer(&state, ip(1), 1, ip(2), 30);
        let replay = transfer(&state, ip(1), 1, ip(2), 30);

        assert_eq!(first, Packet::transaction_ack(1, 70));
        assert_eq!(replay, Packet::transaction_ack(1, 70));
        assert_eq!(state.account(ip(1)).unwrap().balance, 70);
        assert_eq!(state.account(ip(2)).unwrap().balance, 130);
        assert_eq!(state.stats().num_transactions, 1);
    }

    #[test]
    fn stale_request_id_replays_latest_state() {
        let state = state_with_clients(2);
        transfer(&state, ip(1), 1, ip(2), 10);
        transfer(&state, ip(1), 2, ip(2), 10);

        // An old id echoes the last processed id, not its own.
        let replay = transfer(&state, ip(1), 1, ip(2), 10);
        assert_eq!(replay, Packet::transaction_ack(2, 80));
        assert_eq!(state.stats().num_transactions, 2);
    }

    #[test]
    fn failed_request_still_consumes_its_id() {
        let state = state_with_clients(2);
        let rejected = transfer(&state, ip(1), 1, ip(2), 500);
        assert_eq!(rejected.ptype, PacketType::InsufficientBalanceAck);

        // The id advanced, so re-sending id 1 is a replay even though no
        // transfer happened.
        let replay = transfer(&state, ip(1), 1, ip(2), 10);
        assert_eq!(replay, Packet::transaction_ack(1, 100));
        assert_eq!(state.account(ip(1)).unwrap().last_request_id, 1);
    }

    // Rejections

    #[test]
    fn unknown_sender_gets_error_ack() {
        let state = state_with_clients(1);
        let ack = transfer(&state, ip(9), 1, ip(1), 10);
        assert_eq!(ack, Packet::error_ack(1, 0));
        assert_eq!(state.stats().num_transactions, 0);
    }

    #[test]
    fn unknown_destination_gets_invalid_client_ack() {
        let state = state_with_clients(1);
        let ack = transfer(&state, ip(1), 1, ip(9), 10);
        assert_eq!(ack, Packet::invalid_client_ack(1, 100));
        assert_eq!(state.account(ip(1)).unwrap().balance, 100);
        assert_eq!(state.stats().num_transactions, 0);
    }

    #[test]
    fn insufficient_balance_changes_nothing() {
        let state = state_with_clients(2);
        let ack = transfer(&state, ip(1), 1, ip(2), 500);

        assert_eq!(ack, Packet::insufficient_balance_ack(1, 100));
        assert_eq!(state.account(ip(1)).unwrap().balance, 100);
        assert_eq!(state.account(ip(2)).unwrap().balance, 100);

        let stats = state.stats();
        assert_eq!(stats.num_transactions, 0);
        assert_eq!(stats.total_transferred, 0);
    }

    #[test]
    fn exact_balance_transfer_succeeds() {
        let state = state_with_clients(2);
        let ack = transfer(&state, ip(1), 1, ip(2), 100);
        assert_eq!(ack, Packet::transaction_ack(1, 0));
        assert_eq!(state.account(ip(2)).unwrap().balance, 200);
    }

    #[test]
    fn zero_value_transfer_acks_without_effect() {
        let state = state_with_clients(2);
        let ack = transfer(&state, ip(1), 1, ip(2), 0);
        assert_eq!(ack, Packet::transaction_ack(1, 100));
        assert_eq!(state.stats().num_transactions, 0);
    }

    #[test]
    fn self_transfer_acks_without_effect() {
        let state = state_with_clients(1);
        let ack = transfer(&state, ip(1), 1, ip(1), 50);
        assert_eq!(ack, Packet::transaction_ack(1, 100));
        assert_eq!(state.account(ip(1)).unwrap().balance, 100);
        assert_eq!(state.stats().num_transactions, 0);
    }

    #[test]
    fn reply_typed_packets_are_ignored() {
        let state = state_with_clients(1);
        for packet in [
            Packet::transaction_ack(1, 50),
            Packet::discovery_ack(0, 100),
            Packet::error_ack(1, 0),
            Packet::insufficient_balance_ack(1, 0),
            Packet::invalid_client_ack(1, 0),
        ] {
            assert_eq!(state.handle(&packet, ip(1)), None);
        }
    }

    // Concurrency

    #[test]
    fn concurrent_disjoint_transfers_both_succeed() {
        let state = Arc::new(state_with_clients(4));

        let ab = {
            let state = Arc::clone(&state);
            thread::spawn(move || transfer(&state, ip(1), 1, ip(2), 10))
        };
        let cd = {
            let state = Arc::clone(&state);
            thread::spawn(move || transfer(&state, ip(3), 1, ip(4), 10))
        };
        assert_eq!(ab.join().unwrap(), Packet::transaction_ack(1, 90));
        assert_eq!(cd.join().unwrap(), Packet::transaction_ack(1, 90));

        assert_eq!(state.account(ip(1)).unwrap().balance, 90);
        assert_eq!(state.account(ip(2)).unwrap().balance, 110);
        assert_eq!(state.account(ip(3)).unwrap().balance, 90);
        assert_eq!(state.account(ip(4)).unwrap().balance, 110);
        assert_eq!(state.stats().num_transactions, 2);
    }

    #[test]
    fn concurrent_overlapping_transfers_conserve_total() {
        let state = Arc::new(state_with_clients(2));

        let ab = {
            let state = Arc::clone(&state);
            thread::spawn(move || transfer(&state, ip(1), 1, ip(2), 10))
        };
        let ba = {
            let state = Arc::clone(&state);
            thread::spawn(move || transfer(&state, ip(2), 1, ip(1), 20))
        };
        assert_eq!(ab.join().unwrap().ptype, PacketType::TransactionAck);
        assert_eq!(ba.join().unwrap().ptype, PacketType::TransactionAck);

        let a = state.account(ip(1)).unwrap().balance;
        let b = state.account(ip(2)).unwrap().balance;
        assert_eq!(a + b, 200);
        assert_eq!(a, 110);
        assert_eq!(b, 90);
        assert_eq!(state.stats().num_transactions, 2);
    }

    #[test]
    fn racing_workers_on_one_datagram_debit_once() {
        // Many workers process the identical retransmitted datagram; the
        // admission step must let exactly one of them through.
        for _ in 0..50 {
            let state = Arc::new(state_with_clients(2));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let state = Arc::clone(&state);
                    thread::spawn(move || transfer(&state, ip(1), 1, ip(2), 30))
                })
                .collect();
            for h in handles {
                let ack = h.join().unwrap();
                // A replay racing the execution may still see the
                // pre-transfer balance; it must never see a double debit.
                assert_eq!(ack.ptype, PacketType::TransactionAck);
                assert_eq!(ack.request_id, 1);
                assert!(matches!(ack.new_balance(), Some(70) | Some(100)));
            }

            assert_eq!(state.account(ip(1)).unwrap().balance, 70);
            assert_eq!(state.account(ip(2)).unwrap().balance, 130);
            assert_eq!(state.stats().num_transactions, 1);
        }
    }

    #[test]
    fn total_balance_constant_across_transfers() {
        let state = Arc::new(state_with_clients(4));
        assert_eq!(state.stats().total_balance, 400);

        let handles: Vec<_> = (1..=4u8)
            .map(|src| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for rid in 1..=25u32 {
                        let dest = ip(src % 4 + 1);
                        transfer(&state, ip(src), rid, dest, 3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = state.stats();
        assert_eq!(stats.total_balance, 400);
        let sum: u64 = (1..=4u8)
            .map(|i| u64::from(state.account(ip(i)).unwrap().balance))
            .sum();
        assert_eq!(sum, 400);
        // Rejections aside, every accepted transfer is counted exactly once.
        assert_eq!(stats.num_transactions, stats.history.len() as u64);
    }

    #[test]
    fn request_ids_are_monotonic_per_client() {
        let state = state_with_clients(2);
        let mut prev = 0;
        for rid in [3u32, 1, 5, 4, 7] {
            transfer(&state, ip(1), rid, ip(2), 1);
            let last = state.account(ip(1)).unwrap().last_request_id;
            assert!(last >= prev);
            prev = last;
        }
        assert_eq!(state.account(ip(1)).unwrap().last_request_id, 7);
        // Only the strictly increasing ids executed: 3, 5, 7.
        assert_eq!(state.stats().num_transactions, 3);
    }
}
