use core::convert::Infallible;
use core::mem;

use coap_lite::{MessageClass, MessageType, Packet};
use embedded_time::Instant;
use log::{debug, trace, warn};
use rand::{Rng, SeedableRng};

use crate::block::{Block, BlockType};
use crate::config::{Con, Config, Msg};
use crate::logging::msg_summary;
use crate::msg::{self, IdGen};
use crate::net::{Addrd, Socket};
use crate::retry::Attempts;
use crate::time::{Clock, Millis};

/// How long a block-wise transfer may sit waiting for the peer's next
/// continuation request before the exchange is failed
/// (`MAX_TRANSMIT_WAIT`).
const CONTINUATION_TIMEOUT: Millis = Millis(93_000);

/// Who started this exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
  /// We sent a request and drive it until the final response
  Client,
  /// We are answering a request the peer sent us
  Server,
}

/// Lifecycle of one exchange.
///
/// ```text
/// Idle -> Sending -> AwaitingAckOrResponse <-> Retransmitting
///                                 |
///                                 v
///             Completed | Failed | Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExchangeState {
  /// Constructed, nothing sent yet
  Idle,
  /// A datagram is waiting to go out
  Sending,
  /// Sent; waiting for an ACK, a response, or a block continuation
  AwaitingAckOrResponse,
  /// A retransmission deadline fired and the resend has not yet been
  /// pushed through the socket
  Retransmitting,
  /// Terminal: the exchange produced an [`Outcome`]
  Completed,
  /// Terminal: the exchange failed (also carries an [`Outcome`])
  Failed,
  /// Terminal: [`Exchange::terminate`] was honored
  Terminated,
}

/// Why an exchange failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureCause {
  /// The retransmission budget was spent with no reply,
  /// or a block continuation never arrived
  Timeout,
  /// A hard (non-`WouldBlock`) socket error
  Network,
  /// The peer violated protocol: a Reset, an out-of-order or duplicate
  /// block, a body overflowing the reassembly arena
  Protocol,
  /// [`Exchange::terminate`] was called
  Aborted,
}

/// Terminal result of an exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// Client role: the final response, with a block-wise body fully
  /// reassembled. May carry any response code; deciding whether a 4.xx
  /// is fatal belongs to the caller.
  Response(Packet),
  /// The outgoing transfer was delivered and nothing more is expected
  /// (server responses, non-confirmable notifies)
  Sent,
  /// The exchange did not complete
  Failed(FailureCause),
}

/// What the current outgoing leg is waiting for after it is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
  /// A response (piggybacked or separate); empty ACKs merely stop
  /// retransmission
  Response,
  /// An empty ACK completes the exchange
  AckOnly,
  /// The peer's next block continuation request
  Continuation,
  /// Nothing; the exchange completes as soon as the leg is sent
  Nothing,
}

/// Outgoing block-wise progress
#[derive(Debug, Clone, Copy)]
struct TxBlock {
  /// Bytes of the body the peer has confirmed (or, server role, that we
  /// have already served)
  confirmed: usize,
  /// Length of the most recently sent segment
  last_len: usize,
  /// Current negotiated block size
  size: u16,
}

/// Incoming block-wise reassembly
#[derive(Debug, Clone)]
struct RxBlock {
  buf: Vec<u8>,
  /// Block size of the transfer (set by the first block)
  size: u16,
}

/// Exactly one in-flight CoAP request/response cycle.
///
/// Owned exclusively by whichever higher-level operation started it; at
/// most one exchange is active per connection at a time. Created when an
/// operation needs to talk to a peer, dropped when the exchange reaches a
/// terminal state and its [`Outcome`] has been consumed.
///
/// All progress happens inside [`Exchange::step`], which never blocks:
/// `Err(WouldBlock)` means "call me again", `Ok(())` means the exchange is
/// terminal and [`Exchange::take_outcome`] will yield its result.
#[derive(Debug)]
pub struct Exchange<C: Clock> {
  state: ExchangeState,
  role: Role,
  peer: no_std_net::SocketAddr,
  con: Con,
  msg_cfg: Msg,

  /// The outgoing message, sans body when block-wise
  template: Packet,
  /// Full outgoing body (empty when it fit in one message)
  body: Vec<u8>,
  /// Serialized datagram currently being pushed through the socket
  wire: Vec<u8>,
  /// Message ID of the datagram in `wire`
  current_id: u16,
  /// Token of the request (client role)
  token: Vec<u8>,
  /// Uri-Path of the request we are answering (server role)
  serve_path: String,

  expect: Expect,
  /// Retransmissions performed for the current leg
  retransmits: Attempts,
  deadline: Option<Instant<C>>,
  interval: Millis,
  acked: bool,

  tx: Option<TxBlock>,
  rx: Option<RxBlock>,

  /// Datagrams that arrived mid-exchange but belong to someone else
  /// (e.g. server requests while our Register is in flight)
  stray: Vec<Addrd<Packet>>,

  recv_buf: Vec<u8>,
  rand: rand_chacha::ChaCha8Rng,
  terminating: bool,
  outcome: Option<Outcome>,
}

impl<C: Clock> Exchange<C> {
  /// Begin a client-initiated exchange: `msg` is a request (or a notify)
  /// bound for `peer`.
  ///
  /// Non-blocking; attempts the first send before returning.
  pub fn begin_client<S: Socket>(config: &Config,
                                 now: Instant<C>,
                                 rand_seed: u64,
                                 msg: Addrd<Packet>,
                                 sock: &mut S,
                                 ids: &mut IdGen)
                                 -> Self {
    let Addrd(packet, peer) = msg;

    let expect = match (packet.header.code, packet.header.get_type()) {
      | (MessageClass::Request(_), _) => Expect::Response,
      | (_, MessageType::Confirmable) => Expect::AckOnly,
      | _ => Expect::Nothing,
    };

    let mut ex = Self::init(config, Role::Client, peer, packet, rand_seed);
    ex.expect = expect;

    ex.build_first_leg(sock, ids, now);
    ex
  }

  /// Begin a server-role exchange: `rep` answers the request `req`.
  ///
  /// A body too big for one datagram is served as Block2 segments,
  /// the peer pulling each with a continuation request.
  pub fn begin_server<S: Socket>(config: &Config,
                                 now: Instant<C>,
                                 rand_seed: u64,
                                 req: &Addrd<Packet>,
                                 rep: Packet,
                                 sock: &mut S,
                                 ids: &mut IdGen)
                                 -> Self {
    let mut ex = Self::init(config, Role::Server, req.addr(), rep, rand_seed);
    ex.serve_path = msg::uri_path(req.data());

    ex.build_first_leg(sock, ids, now);
    ex
  }

  fn init(config: &Config,
          role: Role,
          peer: no_std_net::SocketAddr,
          packet: Packet,
          rand_seed: u64)
          -> Self {
    Self { state: ExchangeState::Idle,
           role,
           peer,
           con: config.con,
           msg_cfg: config.msg,
           token: packet.get_token().to_vec(),
           template: packet,
           body: vec![],
           wire: vec![],
           current_id: 0,
           serve_path: String::new(),
           expect: Expect::Nothing,
           retransmits: Attempts(0),
           deadline: None,
           interval: Millis(0),
           acked: false,
           tx: None,
           rx: None,
           stray: vec![],
           recv_buf: vec![],
           rand: rand_chacha::ChaCha8Rng::seed_from_u64(rand_seed),
           terminating: false,
           outcome: None }
  }

  /// Current lifecycle state
  pub fn state(&self) -> ExchangeState {
    self.state
  }

  /// The terminal result, once there is one.
  pub fn outcome(&self) -> Option<&Outcome> {
    self.outcome.as_ref()
  }

  /// Consume the terminal result
  pub fn take_outcome(&mut self) -> Option<Outcome> {
    self.outcome.take()
  }

  /// The address of the peer this exchange talks to
  pub fn peer(&self) -> no_std_net::SocketAddr {
    self.peer
  }

  /// Datagrams received during this exchange that belong to some other
  /// conversation; the owner decides what to do with them.
  pub fn take_stray(&mut self) -> Vec<Addrd<Packet>> {
    mem::take(&mut self.stray)
  }

  /// Request cooperative cancellation.
  ///
  /// Only marks intent: the exchange must still be stepped, and will
  /// reach [`ExchangeState::Terminated`] on the next call. A caller that
  /// stops stepping after `terminate` leaves transport resources held.
  pub fn terminate(&mut self) {
    self.terminating = true;
  }

  /// When the engine next needs stepping regardless of network activity
  /// (the retransmission/continuation deadline), for hosts that sleep
  /// between steps.
  pub fn next_timeout(&self) -> Option<Instant<C>> {
    match self.state {
      | ExchangeState::Completed | ExchangeState::Failed | ExchangeState::Terminated => None,
      | _ => self.deadline,
    }
  }

  /// Drive the exchange.
  ///
  /// Pushes pending bytes, consumes matching datagrams, applies
  /// retransmission timing. `Ok(())` means the exchange is terminal;
  /// `Err(WouldBlock)` means progress needs a later step with identical
  /// arguments. Hard network errors do not surface here, they become
  /// [`Outcome::Failed`].
  pub fn step<S: Socket>(&mut self,
                         now: Instant<C>,
                         sock: &mut S,
                         ids: &mut IdGen)
                         -> nb::Result<(), Infallible> {
    if self.is_terminal() {
      return Ok(());
    }

    if self.terminating {
      debug!("exchange with {} terminated by request", self.peer);
      self.state = ExchangeState::Terminated;
      self.outcome = Some(Outcome::Failed(FailureCause::Aborted));
      return Ok(());
    }

    if matches!(self.state,
                ExchangeState::Idle | ExchangeState::Sending | ExchangeState::Retransmitting)
    {
      match self.push_wire(sock, now) {
        | Pushed::Sent => (),
        | Pushed::WouldBlock => return Err(nb::Error::WouldBlock),
        | Pushed::Terminal => return Ok(()),
      }
    }

    if self.state == ExchangeState::AwaitingAckOrResponse {
      self.drain_socket(sock, now, ids);

      // receiving may have queued the next leg
      if self.state == ExchangeState::Sending {
        match self.push_wire(sock, now) {
          | Pushed::Sent => (),
          | Pushed::WouldBlock => return Err(nb::Error::WouldBlock),
          | Pushed::Terminal => return Ok(()),
        }
      }
    }

    if !self.is_terminal() {
      self.check_deadline(now);

      if self.state == ExchangeState::Retransmitting {
        match self.push_wire(sock, now) {
          | Pushed::Sent => (),
          | Pushed::WouldBlock => return Err(nb::Error::WouldBlock),
          | Pushed::Terminal => return Ok(()),
        }
      }
    }

    if self.is_terminal() {
      Ok(())
    } else {
      Err(nb::Error::WouldBlock)
    }
  }

  fn is_terminal(&self) -> bool {
    matches!(self.state,
             ExchangeState::Completed | ExchangeState::Failed | ExchangeState::Terminated)
  }

  fn fail(&mut self, cause: FailureCause) {
    debug!("exchange with {} failed: {:?}", self.peer, cause);
    self.state = ExchangeState::Failed;
    self.deadline = None;
    self.outcome = Some(Outcome::Failed(cause));
  }

  fn complete(&mut self, outcome: Outcome) {
    trace!("exchange with {} completed", self.peer);
    self.state = ExchangeState::Completed;
    self.deadline = None;
    self.outcome = Some(outcome);
  }

  // -
  // sending

  /// Negotiated block size for the first leg: the configured preference,
  /// clamped down so a full block (plus header room) fits the transport
  /// MTU.
  fn initial_block_size<S: Socket>(&self, sock: &S) -> u16 {
    let budget = sock.inner_mtu().saturating_sub(128).max(16) as u16;

    let mut size = self.msg_cfg.preferred_block_size.clamp(16, 1024);
    while size > budget && size > 16 {
      size /= 2;
    }
    size
  }

  /// Prepare (and attempt to send) the first leg, segmenting the body
  /// when it does not fit one block.
  fn build_first_leg<S: Socket>(&mut self, sock: &mut S, ids: &mut IdGen, now: Instant<C>) {
    let size = self.initial_block_size(sock);
    let body = mem::take(&mut self.template.payload);

    if body.len() > size as usize {
      self.body = body;
      self.tx = Some(TxBlock { confirmed: 0,
                               last_len: 0,
                               size });
      self.queue_tx_segment(None, ids);
    } else {
      self.template.payload = body;
      let packet = self.template.clone();
      self.queue_wire(packet);
    }

    self.state = ExchangeState::Sending;
    match self.push_wire(sock, now) {
      | Pushed::Sent | Pushed::Terminal => (),
      | Pushed::WouldBlock => (),
    }
  }

  /// Build the next outgoing block segment. For server role,
  /// `answering` is the continuation request the segment responds to.
  fn queue_tx_segment(&mut self, answering: Option<&Packet>, ids: &mut IdGen) {
    let tx = match self.tx {
      | Some(tx) => tx,
      | None => return,
    };

    let start = tx.confirmed;
    let end = (start + tx.size as usize).min(self.body.len());
    let more = end < self.body.len();

    let mut packet = self.template.clone();
    packet.payload = self.body[start..end].to_vec();

    let ty = match self.role {
      | Role::Client => BlockType::Block1,
      | Role::Server => BlockType::Block2,
    };

    let block = Block::new(ty, (start / tx.size as usize) as u32, tx.size, more);
    if block.apply(&mut packet).is_err() {
      // the body would need a block number past the 20-bit range
      self.fail(FailureCause::Protocol);
      return;
    }

    match (self.role, answering) {
      | (Role::Server, Some(req)) => {
        packet.header.message_id = req.header.message_id;
        let token: &[u8] = req.get_token();
        packet.set_token(token.to_vec());
        packet.header
              .set_type(match req.header.get_type() {
                          | MessageType::Confirmable => MessageType::Acknowledgement,
                          | _ => MessageType::NonConfirmable,
                        });
      },
      | (Role::Client, _) if start > 0 => {
        // follow-up legs are new messages
        packet.header.message_id = ids.id();
      },
      | _ => (),
    }

    self.tx = Some(TxBlock { last_len: end - start,
                             ..tx });
    self.expect = match (self.role, more) {
      | (Role::Client, _) => Expect::Response,
      | (Role::Server, true) => Expect::Continuation,
      | (Role::Server, false) => Expect::Nothing,
    };

    self.new_leg();
    self.queue_wire(packet);
  }

  /// Reset per-leg retransmission state
  fn new_leg(&mut self) {
    self.retransmits = Attempts(0);
    self.deadline = None;
    self.interval = Millis(0);
    self.acked = false;
    self.state = ExchangeState::Sending;
  }

  fn queue_wire(&mut self, packet: Packet) {
    self.current_id = packet.header.message_id;
    trace!("-> {} {}", self.peer, msg_summary(&packet));

    match packet.to_bytes() {
      | Ok(bytes) => self.wire = bytes,
      | Err(e) => {
        warn!("serializing message failed: {:?}", e);
        self.fail(FailureCause::Protocol);
      },
    }
  }

  fn push_wire<S: Socket>(&mut self, sock: &mut S, now: Instant<C>) -> Pushed {
    if self.is_terminal() {
      return Pushed::Terminal;
    }

    match sock.send(Addrd(self.wire.as_slice(), self.peer)) {
      | Ok(()) => {
        self.after_send(now);
        if self.is_terminal() {
          Pushed::Terminal
        } else {
          Pushed::Sent
        }
      },
      | Err(nb::Error::WouldBlock) => Pushed::WouldBlock,
      | Err(nb::Error::Other(e)) => {
        warn!("socket send to {} failed: {:?}", self.peer, e);
        self.fail(FailureCause::Network);
        Pushed::Terminal
      },
    }
  }

  fn after_send(&mut self, now: Instant<C>) {
    match self.expect {
      | Expect::Nothing => {
        self.complete(Outcome::Sent);
        return;
      },
      | Expect::Continuation => {
        self.state = ExchangeState::AwaitingAckOrResponse;
        if self.deadline.is_none() {
          self.deadline = Some(now + CONTINUATION_TIMEOUT);
        }
        return;
      },
      | Expect::Response | Expect::AckOnly => (),
    }

    self.state = ExchangeState::AwaitingAckOrResponse;

    // a deadline is already armed when this send was a retransmission
    if self.deadline.is_none() && !self.acked {
      self.interval = Millis(self.rand.gen_range(self.con.retry_strategy.range()));
      self.deadline = Some(now + self.interval);
    }
  }

  fn check_deadline(&mut self, now: Instant<C>) {
    let deadline = match self.deadline {
      | Some(d) if now >= d => d,
      | _ => return,
    };

    if self.expect == Expect::Continuation {
      warn!("peer {} never asked for the next block", self.peer);
      self.fail(FailureCause::Timeout);
      return;
    }

    if self.retransmits >= self.con.max_retransmit {
      debug!("{} retransmissions with no reply from {}",
             self.retransmits.0, self.peer);
      self.fail(FailureCause::Timeout);
      return;
    }

    self.retransmits.0 += 1;
    self.interval = Millis(self.interval.0 * 2);
    self.deadline = Some(deadline + self.interval);
    self.state = ExchangeState::Retransmitting;
    trace!("retransmit #{} to {}", self.retransmits.0, self.peer);
  }

  // -
  // receiving

  fn drain_socket<S: Socket>(&mut self, sock: &mut S, now: Instant<C>, ids: &mut IdGen) {
    self.recv_buf.resize(self.msg_cfg.max_message_size, 0);
    let mut buf = mem::take(&mut self.recv_buf);

    while self.state == ExchangeState::AwaitingAckOrResponse {
      match sock.recv(&mut buf) {
        | Err(nb::Error::WouldBlock) => break,
        | Err(nb::Error::Other(e)) => {
          warn!("socket recv failed: {:?}", e);
          self.fail(FailureCause::Network);
          break;
        },
        | Ok(Addrd(n, addr)) => match Packet::from_bytes(&buf[..n]) {
          | Err(e) => {
            // a malformed datagram is dropped, never escalated
            trace!("ignoring unparseable datagram from {}: {:?}", addr, e);
          },
          | Ok(packet) => self.handle_datagram(Addrd(packet, addr), now, ids),
        },
      }
    }

    self.recv_buf = buf;
  }

  fn handle_datagram(&mut self, msg: Addrd<Packet>, now: Instant<C>, ids: &mut IdGen) {
    if msg.addr() != self.peer {
      self.stray.push(msg);
      return;
    }

    let packet = msg.data();
    trace!("<- {} {}", msg.addr(), msg_summary(packet));

    let ty = packet.header.get_type();
    let id_matches = packet.header.message_id == self.current_id;

    match (ty, packet.header.code) {
      | (MessageType::Acknowledgement, MessageClass::Empty) if id_matches => {
        // separate response pending; stop retransmitting and keep waiting
        self.acked = true;
        self.deadline = None;

        if self.expect == Expect::AckOnly {
          self.complete(Outcome::Sent);
        }
      },
      | (MessageType::Reset, _) if id_matches => {
        warn!("peer {} reset the exchange", self.peer);
        self.fail(FailureCause::Protocol);
      },
      | (_, MessageClass::Response(_)) if self.role == Role::Client
                                          && msg::token_matches(&self.token, packet) =>
      {
        let packet = msg.unwrap();
        self.handle_response(packet, ids);
      },
      | (_, MessageClass::Request(_)) if self.role == Role::Server => {
        self.handle_continuation(msg, now, ids);
      },
      | _ => self.stray.push(msg),
    }
  }

  /// Client role: a response with our token arrived
  fn handle_response(&mut self, packet: Packet, ids: &mut IdGen) {
    let block = match Block::decode(&packet) {
      | Ok(b) => b,
      | Err(e) => {
        warn!("peer {} sent a malformed block option: {:?}", self.peer, e);
        self.fail(FailureCause::Protocol);
        return;
      },
    };

    // request body still being uploaded: expect 2.31 Continue echoes
    if let (Some(tx), Some(b)) = (self.tx, block) {
      let uploading = tx.confirmed + tx.last_len < self.body.len();

      if b.ty == BlockType::Block1 && uploading {
        if msg::class_detail(packet.header.code) == (2, 31) {
          // the echoed option confirms bytes through the end of block
          // `num` at the (possibly renegotiated, smaller) echoed size
          let confirmed = (b.num as usize + 1) * b.size as usize;

          if b.size > tx.size || confirmed > self.body.len() {
            warn!("peer {} confirmed an impossible block", self.peer);
            self.fail(FailureCause::Protocol);
            return;
          }

          // a retransmitted Continue for a block we already moved past
          // must not rewind the upload
          if confirmed <= tx.confirmed {
            trace!("ignoring stale continue echo from {}", self.peer);
            return;
          }

          self.tx = Some(TxBlock { confirmed,
                                   last_len: 0,
                                   size: b.size });
          self.queue_tx_segment(None, ids);
          return;
        }

        // a final code before we sent everything cuts the upload short;
        // fall through and yield it
      }
    }

    let rx_started = self.rx.is_some();
    match block {
      | Some(b) if b.ty == BlockType::Block2 => self.handle_rx_block(packet, b, ids),
      | _ if rx_started => {
        warn!("peer {} dropped the Block2 option mid-transfer", self.peer);
        self.fail(FailureCause::Protocol);
      },
      | _ => self.complete(Outcome::Response(packet)),
    }
  }

  /// Client role: one Block2 segment of the response body
  fn handle_rx_block(&mut self, packet: Packet, b: Block, ids: &mut IdGen) {
    let mut rx = self.rx
                     .take()
                     .unwrap_or_else(|| {
                       RxBlock { buf: Vec::with_capacity(self.msg_cfg.reassembly_capacity),
                                 size: b.size }
                     });

    // blocks must arrive in strict ascending order: the segment's byte
    // offset has to land exactly at the end of what we have. Covers
    // duplicates, gaps and mid-transfer size changes alike.
    let offset = b.num as usize * b.size as usize;
    if offset != rx.buf.len() {
      warn!("peer {} sent block {} (offset {}) but reassembly is at {}",
            self.peer,
            b.num,
            offset,
            rx.buf.len());
      self.fail(FailureCause::Protocol);
      return;
    }

    if rx.buf.len() + packet.payload.len() > self.msg_cfg.reassembly_capacity {
      warn!("response body from {} overflows the {} byte reassembly arena",
            self.peer, self.msg_cfg.reassembly_capacity);
      self.fail(FailureCause::Protocol);
      return;
    }

    rx.buf.extend_from_slice(&packet.payload);
    rx.size = b.size;

    if b.more {
      let next = (rx.buf.len() / rx.size as usize) as u32;
      let mut follow_up = self.template.clone();
      follow_up.payload = vec![];
      follow_up.clear_option(BlockType::Block1.option());
      follow_up.header.message_id = ids.id();

      if Block::new(BlockType::Block2, next, rx.size, false).apply(&mut follow_up)
                                                            .is_err()
      {
        self.fail(FailureCause::Protocol);
        self.rx = Some(rx);
        return;
      }

      self.rx = Some(rx);
      self.expect = Expect::Response;
      self.new_leg();
      self.queue_wire(follow_up);
    } else {
      let mut packet = packet;
      packet.payload = rx.buf;
      packet.clear_option(BlockType::Block2.option());
      self.complete(Outcome::Response(packet));
    }
  }

  /// Server role: the peer asks for the next Block2 segment
  fn handle_continuation(&mut self, msg: Addrd<Packet>, _now: Instant<C>, ids: &mut IdGen) {
    let tx = match self.tx {
      | Some(tx) => tx,
      | None => {
        self.stray.push(msg);
        return;
      },
    };

    let req = msg.data();

    if msg::uri_path(req) != self.serve_path {
      self.stray.push(msg);
      return;
    }

    let b = match Block::decode(req) {
      | Ok(Some(b)) if b.ty == BlockType::Block2 => b,
      | Ok(_) => {
        self.stray.push(msg);
        return;
      },
      | Err(e) => {
        warn!("continuation from {} has a malformed block option: {:?}",
              self.peer, e);
        self.fail(FailureCause::Protocol);
        return;
      },
    };

    let offset = b.num as usize * b.size as usize;
    let next = tx.confirmed + tx.last_len;
    let redo = tx.confirmed;

    if offset == next || offset == redo {
      if b.size > tx.size {
        warn!("peer {} tried to negotiate the block size up", self.peer);
        self.fail(FailureCause::Protocol);
        return;
      }

      self.tx = Some(TxBlock { confirmed: offset,
                               last_len: 0,
                               size: b.size });
      self.queue_tx_segment(Some(req), ids);
    } else {
      warn!("peer {} requested block at offset {} but transfer is at {}",
            self.peer, offset, next);
      self.fail(FailureCause::Protocol);
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pushed {
  Sent,
  WouldBlock,
  Terminal,
}
