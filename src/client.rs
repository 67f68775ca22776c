//! Client side: server discovery, the user input loop, and the
//! stop-and-wait sender.
//!
//! The client runs two threads over one shared [`Transport`]:
//! - the **input thread** (the caller of [`Client::run`]) parses
//!   `<dest-ip> <value>` lines, forms transfer requests, and drives the
//!   stop-and-wait loop in [`Client::transfer`];
//! - the **receiver thread** classifies inbound replies, wakes the sender
//!   when the awaited ACK arrives, and prints the outcome.
//!
//! The threads coordinate through a mutex, a condvar, and an atomic
//! `pending_ack_request_id` (0 = idle).  The receiver compares ids on the
//! atomic alone before ever touching the mutex, so retransmission storms
//! and stray datagrams stay off the lock.
//!
//! Reliability is stop-and-wait ARQ: one request in flight, retransmitted
//! every [`ACK_TIMEOUT`] until the matching ACK arrives.  Retries are
//! unbounded; the protocol assumes the server is eventually reachable.

use std::io::{self, BufRead};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::packet::{Packet, PacketType, Payload};
use crate::transport::{Transport, TransportError};

/// Time to wait for an ACK before retransmitting the pending request.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Sender/receiver shared state
// ---------------------------------------------------------------------------

/// Stop-and-wait state shared between the input and receiver threads.
struct AckSync {
    pending: Mutex<PendingState>,
    /// Signalled by the receiver once the awaited ACK has been matched.
    ack_received: Condvar,
    /// Request id the sender is waiting on; 0 means idle.  Read lock-free
    /// by the receiver's fast path.
    pending_ack_request_id: AtomicU32,
}

/// Mutex-guarded copies of the in-flight request and its matched reply.
/// The request copy feeds retransmission and result formatting.
#[derive(Default)]
struct PendingState {
    request: Option<Packet>,
    reply: Option<Packet>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A connected client: transport, discovered server address, and the
/// stop-and-wait machinery.
pub struct Client {
    transport: Arc<Transport>,
    server_addr: SocketAddr,
    /// Id for the next request.  Starts at 1 (0 is reserved for discovery)
    /// and advances on every request, acknowledged or not.
    next_request_id: u32,
    sync: Arc<AckSync>,
}

impl Client {
    /// Bind a broadcast-capable socket and locate the server.
    ///
    /// With `server_ip` given, discovery probes that address directly;
    /// otherwise probes go to the limited broadcast address and whichever
    /// server answers first wins.
    pub fn connect(port: u16, server_ip: Option<Ipv4Addr>) -> Result<Self, TransportError> {
        let transport = Transport::bind_broadcast()?;
        transport.set_read_timeout(Some(ACK_TIMEOUT))?;

        let probe_dest = SocketAddr::V4(SocketAddrV4::new(
            server_ip.unwrap_or(Ipv4Addr::BROADCAST),
            port,
        ));
        let server_addr = discover(&transport, probe_dest)?;
        println!("connected to server at {server_addr}");

        Ok(Self {
            transport: Arc::new(transport),
            server_addr,
            next_request_id: 1,
            sync: Arc::new(AckSync {
                pending: Mutex::new(PendingState::default()),
                ack_received: Condvar::new(),
                pending_ack_request_id: AtomicU32::new(0),
            }),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Spawn the receiver thread and process stdin until end of input.
    ///
    /// Malformed lines are reported and skipped; a failed send aborts only
    /// the request it belonged to.
    pub fn run(&mut self) -> Result<(), TransportError> {
        self.spawn_receiver();

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line.map_err(TransportError::Io)?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_transfer_line(&line) {
                Ok((dest, value)) => {
                    if let Err(e) = self.transfer(dest, value) {
                        eprintln!("send failed: {e}");
                    }
                }
                Err(reason) => eprintln!("invalid input: {reason}"),
            }
        }
        Ok(())
    }

    /// Start the background thread that matches ACKs and prints outcomes.
    pub fn spawn_receiver(&self) -> thread::JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let sync = Arc::clone(&self.sync);
        let server_addr = self.server_addr;
        thread::spawn(move || receive_loop(&transport, &sync, server_addr))
    }

    /// Send one transfer request and wait for its ACK.
    ///
    /// Blocks until the receiver thread matches the ACK (retransmitting
    /// every [`ACK_TIMEOUT`]) and returns the reply packet.  `None` only if
    /// the pending slot was cleared without a reply being stored.
    pub fn transfer(
        &mut self,
        dest: Ipv4Addr,
        value: u32,
    ) -> Result<Option<Packet>, TransportError> {
        let request = Packet::transfer(self.next_request_id, dest, value);
        // The id is consumed even if the request goes nowhere.
        self.next_request_id += 1;
        self.send_request(request)
    }

    /// The stop-and-wait loop.
    fn send_request(&self, request: Packet) -> Result<Option<Packet>, TransportError> {
        let mut pending = self.sync.pending.lock().unwrap();
        pending.request = Some(request);
        pending.reply = None;
        self.sync
            .pending_ack_request_id
            .store(request.request_id, Ordering::SeqCst);

        while self.sync.pending_ack_request_id.load(Ordering::SeqCst) == request.request_id {
            if let Err(e) = self.transport.send_to(&request, self.server_addr) {
                // Abort this request; the protocol state stays clean for
                // the next one.
                self.sync.pending_ack_request_id.store(0, Ordering::SeqCst);
                pending.request = None;
                return Err(e);
            }
            let (guard, _timed_out) = self
                .sync
                .ack_received
                .wait_timeout_while(pending, ACK_TIMEOUT, |_| {
                    self.sync.pending_ack_request_id.load(Ordering::SeqCst) == request.request_id
                })
                .unwrap();
            pending = guard;
        }
        Ok(pending.reply.take())
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Probe `dest` with discovery packets until a server acknowledges, then
/// return that server's address.
fn discover(transport: &Transport, dest: SocketAddr) -> Result<SocketAddr, TransportError> {
    let probe = Packet::discovery();
    log::info!("discovering server via {dest}");
    loop {
        transport.send_to(&probe, dest)?;
        // Drain inbound datagrams for one interval, then probe again.
        loop {
            match transport.recv_from() {
                Ok((packet, from)) if packet.ptype == PacketType::ClientDiscoveryAck => {
                    return Ok(from);
                }
                Ok(_) => continue,
                Err(e) if e.is_timeout() => break,
                Err(TransportError::Packet(e)) => {
                    log::debug!("dropping malformed datagram: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver thread
// ---------------------------------------------------------------------------

fn receive_loop(transport: &Transport, sync: &AckSync, server_addr: SocketAddr) {
    loop {
        let (packet, _from) = match transport.recv_from() {
            Ok(received) => received,
            Err(e) if e.is_timeout() => continue,
            Err(TransportError::Packet(e)) => {
                log::debug!("dropping malformed datagram: {e}");
                continue;
            }
            Err(TransportError::Io(e)) => {
                log::warn!("receive error: {e}");
                continue;
            }
        };
        if !packet.ptype.is_reply() {
            continue;
        }

        // Fast path: no lock unless the id actually matches what the
        // sender is waiting on.
        let awaited = sync.pending_ack_request_id.load(Ordering::SeqCst);
        if awaited == 0 || packet.request_id != awaited {
            continue;
        }

        let mut pending = sync.pending.lock().unwrap();
        // Re-check under the lock; the sender may have aborted meanwhile.
        if sync.pending_ack_request_id.load(Ordering::SeqCst) != packet.request_id {
            continue;
        }
        let request = pending.request.take();
        pending.reply = Some(packet);
        sync.pending_ack_request_id.store(0, Ordering::SeqCst);
        drop(pending);
        sync.ack_received.notify_all();

        report_outcome(&packet, request, server_addr);
    }
}

/// Print the user-facing result for a matched reply.
fn report_outcome(reply: &Packet, request: Option<Packet>, server_addr: SocketAddr) {
    match reply.ptype {
        PacketType::TransactionAck => {
            // Destination and value come from the request copy; the reply
            // only carries the new balance.
            if let Some(Packet {
                payload: Payload::Request { dest, value },
                ..
            }) = request
            {
                println!(
                    "server {} id req {} dest {} value {} new balance {}",
                    server_addr.ip(),
                    reply.request_id,
                    dest,
                    value,
                    reply.new_balance().unwrap_or(0)
                );
            }
        }
        PacketType::InsufficientBalanceAck => println!("insufficient balance"),
        PacketType::InvalidClientAck => println!("invalid destination client"),
        PacketType::ErrorAck => println!("server error"),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Input parsing
// ---------------------------------------------------------------------------

/// Parse one stdin line of the form `<dest-ipv4> <value>`.
pub fn parse_transfer_line(line: &str) -> Result<(Ipv4Addr, u32), String> {
    let mut parts = line.split_whitespace();
    let dest = parts
        .next()
        .ok_or_else(|| "expected '<dest-ip> <value>'".to_string())?;
    let value = parts
        .next()
        .ok_or_else(|| "missing transfer value".to_string())?;
    if parts.next().is_some() {
        return Err("trailing input after '<dest-ip> <value>'".to_string());
    }
    let dest: Ipv4Addr = dest
        .parse()
        .map_err(|_| format!("invalid destination address '{dest}'"))?;
    let value: u32 = value
        .parse()
        .map_err(|_| format!("invalid transfer value '{value}'"))?;
    Ok((dest, value))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        assert_eq!(
            parse_transfer_line("10.1.1.3 30"),
            Ok((Ipv4Addr::new(10, 1, 1, 3), 30))
        );
    }

    #[test]
    fn tolerates_extra_whitespace() {
        assert_eq!(
            parse_transfer_line("  192.168.0.1\t5  "),
            Ok((Ipv4Addr::new(192, 168, 0, 1), 5))
        );
    }

    #[test]
    fn zero_value_is_accepted() {
        assert_eq!(
            parse_transfer_line("10.0.0.1 0"),
            Ok((Ipv4Addr::new(10, 0, 0, 1), 0))
        );
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_transfer_line("").is_err());
        assert!(parse_transfer_line("10.0.0.1").is_err());
    }

    #[test]
    fn rejects_bad_address() {
        assert!(parse_transfer_line("not-an-ip 10").is_err());
        assert!(parse_transfer_line("10.0.0.256 10").is_err());
    }

    #[test]
    fn rejects_bad_value() {
        assert!(parse_transfer_line("10.0.0.1 ten").is_err());
        assert!(parse_transfer_line("10.0.0.1 -5").is_err());
        assert!(parse_transfer_line("10.0.0.1 1.5").is_err());
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse_transfer_line("10.0.0.1 10 extra").is_err());
    }
}
