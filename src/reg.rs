//! The top-level client: a state machine sequencing Bootstrap, Register,
//! Update, Observe/Notify, Queue Mode and Disable on top of repeated
//! CoAP exchanges.
//!
//! All progress happens inside [`Client::step`], which the host calls in
//! its main loop; [`Client::time_to_next`] says how long the host may
//! sleep between steps. At most one exchange is in flight at a time and
//! queued work is serviced strictly first-in first-out behind it.

use core::fmt;
use std::collections::VecDeque;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};
use embedded_time::Instant;
use log::{debug, error, info, trace, warn};
use rand::{Rng, SeedableRng};

use crate::config::{Config, Server};
use crate::dm::{Path, Registry};
use crate::exchange::{Exchange, FailureCause, Outcome};
use crate::msg::{self, IdGen};
use crate::net::{Addrd, Socket};
use crate::retry::{Attempts, RetryTimer, Strategy, YouShould};
use crate::time::{earliest, millis_between, Clock, Millis, Timeout};

/// Connection status of the client's server relationship.
///
/// Exactly one status holds at any time; only [`Client::step`] and the
/// explicit trigger calls mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnStatus {
  /// Nothing has happened yet; the next step inspects configuration
  Initial,
  /// Configuration was found invalid; decays to [`ConnStatus::Failure`]
  Invalid,
  /// Talking to the Bootstrap Server
  Bootstrapping,
  /// Bootstrap finished; registration is next
  Bootstrapped,
  /// A Register exchange is in flight or scheduled
  Registering,
  /// Steady state: registered, serving requests, updating before the
  /// lifetime expires
  Registered,
  /// Transitioning into Queue Mode (receive path being turned off)
  EnteringQueueMode,
  /// Dormant between self-initiated exchanges; the receive path is off
  QueueMode,
  /// Disabled by the server (or the host); resumes after the disable
  /// timeout
  Suspended,
  /// Terminal until [`Client::restart`]
  Failure,
}

/// Errors surfaced by [`Client::step`].
///
/// Everything protocol- or network-shaped is handled internally by the
/// retry policies; only a broken clock reaches the caller.
#[derive(Debug)]
pub enum Error {
  /// The monotonic clock failed
  Clock(embedded_time::clock::Error),
}

/// A client-initiated operation waiting its turn behind the in-flight
/// exchange
#[derive(Debug, Clone, PartialEq)]
enum Op {
  Register,
  Update,
  Deregister { then: After },
  Notify { token: Vec<u8> },
  Send { payload: Vec<u8> },
  BootstrapRequest,
  /// Server role: a response we owe the peer
  Respond,
}

/// What happens once a De-Register completes
#[derive(Debug, Clone, Copy, PartialEq)]
enum After {
  Suspend(Timeout),
  Bootstrap,
  Shutdown,
}

/// Host-triggered events deferred until the in-flight exchange completes
#[derive(Debug, Clone, Copy, PartialEq)]
enum Trigger {
  Disable(Timeout),
  Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
  None,
  /// Waiting for the in-flight exchange to wind down
  Draining,
  /// Best-effort De-Register on the way out
  Deregistering,
  /// Non-blocking transport teardown
  Closing,
  Done,
}

/// An active observation of a data-model path
#[derive(Debug, Clone)]
struct Observation {
  token: Vec<u8>,
  path: Path,
  seq: u32,
}

/// Registration bookkeeping: the two-tier communication retry policy
/// plus the Update schedule.
#[derive(Debug)]
struct RegState<C: Clock> {
  /// Linear tier: `retry_count` attempts spaced `retry_timer` apart
  linear: Option<RetryTimer<C>>,
  /// Outer tier: single attempts each preceded by `seq_delay_timer`
  seq: Option<RetryTimer<C>>,
  /// The linear tier is exhausted
  in_seq: bool,
  update_at: Option<Instant<C>>,
}

impl<C: Clock> RegState<C> {
  fn fresh() -> Self {
    Self { linear: None,
           seq: None,
           in_seq: false,
           update_at: None }
  }
}

/// Bootstrap phase bookkeeping
#[derive(Debug)]
struct BootState<C: Clock> {
  /// Exponential back-off across whole-phase attempts
  timer: Option<RetryTimer<C>>,
  /// The Request-Bootstrap exchange succeeded; the server is now
  /// writing to us
  requested: bool,
  /// Inactivity window bounding the whole phase
  deadline: Option<Instant<C>>,
}

impl<C: Clock> BootState<C> {
  fn fresh() -> Self {
    Self { timer: None,
           requested: false,
           deadline: None }
  }
}

/// An LwM2M client.
///
/// Owns the transport, the clock and the data-model [`Registry`];
/// the host wires those up, then calls [`Client::step`] repeatedly:
///
/// ```no_run
/// # use newt::config::{Config, Server};
/// # use newt::reg::{Client, ConnStatus};
/// # fn run<C: newt::time::Clock, S: newt::net::Socket>(clock: C, sock: S) {
/// let mut config = Config::new("urn:dev:os-419");
/// config.server =
///   Some(Server::new(no_std_net::SocketAddr::new(no_std_net::IpAddr::V4(no_std_net::Ipv4Addr::new(203, 0, 113, 9)),
///                                                5683),
///                    1));
///
/// let mut client = Client::new(config, clock, sock);
/// loop {
///   match client.step() {
///     | Ok(ConnStatus::Failure) => break,
///     | Ok(_) => { /* sleep for client.time_to_next() */ },
///     | Err(e) => panic!("clock broke: {:?}", e),
///   }
/// }
/// # }
/// ```
pub struct Client<C: Clock, S: Socket> {
  config: Config,
  clock: C,
  sock: S,
  ids: IdGen,
  rand: rand_chacha::ChaCha8Rng,

  status: ConnStatus,
  registry: Registry,

  exchange: Option<Exchange<C>>,
  in_flight: Option<Op>,
  queue: VecDeque<Op>,
  pending_inbound: VecDeque<Addrd<Packet>>,
  pending_trigger: Option<Trigger>,

  reg: RegState<C>,
  boot: BootState<C>,
  /// Location-Path from the Register response, e.g. `rd/5a3f`
  location: Option<String>,
  observations: Vec<Observation>,
  last_activity: Option<Instant<C>>,
  resume_at: Option<Instant<C>>,
  /// Next Update should carry a fresh registration payload
  refresh_payload: bool,
  /// Next Update should re-announce the lifetime
  update_lifetime: bool,

  shutdown: ShutdownPhase,
  scratch: Vec<u8>,
}

impl<C: Clock, S: Socket> fmt::Debug for Client<C, S> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Client")
     .field("endpoint", &self.config.endpoint_name)
     .field("status", &self.status)
     .field("in_flight", &self.in_flight)
     .field("queued", &self.queue.len())
     .field("location", &self.location)
     .finish()
  }
}

impl<C: Clock, S: Socket> Client<C, S> {
  /// A client that has not yet talked to anyone.
  ///
  /// Configuration is validated on the first [`Client::step`], not here;
  /// an invalid configuration drives the status to
  /// [`ConnStatus::Failure`].
  pub fn new(config: Config, clock: C, sock: S) -> Self {
    let seed = config.msg.token_seed;

    Self { config,
           clock,
           sock,
           ids: IdGen::new(seed),
           rand: rand_chacha::ChaCha8Rng::seed_from_u64(seed as u64),
           status: ConnStatus::Initial,
           registry: Registry::new(),
           exchange: None,
           in_flight: None,
           queue: VecDeque::new(),
           pending_inbound: VecDeque::new(),
           pending_trigger: None,
           reg: RegState::fresh(),
           boot: BootState::fresh(),
           location: None,
           observations: vec![],
           last_activity: None,
           resume_at: None,
           refresh_payload: false,
           update_lifetime: false,
           shutdown: ShutdownPhase::None,
           scratch: vec![] }
  }

  /// Current connection status
  pub fn status(&self) -> ConnStatus {
    self.status
  }

  /// The data model this client exposes
  pub fn registry_mut(&mut self) -> &mut Registry {
    &mut self.registry
  }

  /// Replace the managed-server relationship, e.g. after a bootstrap
  /// populated it
  pub fn set_server(&mut self, server: Server) {
    self.config.server = Some(server);
  }

  // -
  // triggers

  /// Ask for a registration Update ahead of schedule. Wakes the client
  /// out of Queue Mode.
  pub fn request_update(&mut self) {
    self.queue_op(Op::Update);
  }

  /// Ask to re-bootstrap. Deferred until the in-flight exchange
  /// completes; a De-Register is sent first when registered.
  ///
  /// Honored immediately while [`ConnStatus::Suspended`], which violates
  /// the server's requested quiet period - that is the caller's call.
  pub fn request_bootstrap(&mut self) {
    self.pending_trigger = Some(Trigger::Bootstrap);
  }

  /// Disable the server relationship for `timeout`
  /// ([`Timeout::Never`] suspends until an explicit trigger). Deferred
  /// until the in-flight exchange completes, then a De-Register is sent
  /// and the client holds in [`ConnStatus::Suspended`].
  pub fn disable(&mut self, timeout: Timeout) {
    self.pending_trigger = Some(Trigger::Disable(timeout));
  }

  /// Reset to [`ConnStatus::Initial`], recovering from
  /// [`ConnStatus::Failure`]. Immediate: any in-flight exchange is
  /// dropped on the floor and while suspended this violates the
  /// server's quiet period.
  pub fn restart(&mut self) {
    info!("restart requested");
    self.exchange = None;
    self.in_flight = None;
    self.queue.clear();
    self.pending_inbound.clear();
    self.pending_trigger = None;
    self.reg = RegState::fresh();
    self.boot = BootState::fresh();
    self.location = None;
    self.observations.clear();
    self.resume_at = None;
    self.sock.rx_enabled(true);
    self.set_status(ConnStatus::Initial);
  }

  /// Queue an LwM2M Send with an opaque, pre-encoded payload
  pub fn send_data(&mut self, payload: Vec<u8>) {
    self.queue.push_back(Op::Send { payload });
  }

  /// The value at `path` changed. Notifies every observation covering
  /// the path; a change to the Server Object's Lifetime resource also
  /// schedules an Update.
  pub fn notify_changed(&mut self, path: &Path) {
    if path.object == 1 && path.resource == Some(1) {
      self.update_lifetime = true;
      self.queue_op(Op::Update);
    }

    let tokens = self.observations
                     .iter()
                     .filter(|obs| covers(&obs.path, path))
                     .map(|obs| obs.token.clone())
                     .collect::<Vec<_>>();

    for token in tokens {
      self.queue_op(Op::Notify { token });
    }
  }

  /// An Object Instance was added or removed: the registration payload
  /// is stale and an Update must re-announce it
  pub fn notify_instances_changed(&mut self) {
    self.refresh_payload = true;
    self.queue_op(Op::Update);
  }

  /// Begin cooperative shutdown: wind down the in-flight exchange,
  /// best-effort De-Register, then tear down the transport. Keep
  /// stepping until [`Client::is_shut_down`]; a caller that stops
  /// stepping leaves transport resources allocated.
  pub fn shutdown(&mut self) {
    if self.shutdown == ShutdownPhase::None {
      info!("shutdown requested");
      self.shutdown = ShutdownPhase::Draining;
    }
  }

  /// Has cooperative shutdown finished
  pub fn is_shut_down(&self) -> bool {
    self.shutdown == ShutdownPhase::Done
  }

  fn queue_op(&mut self, op: Op) {
    if !self.queue.contains(&op) {
      self.queue.push_back(op);
    }
  }

  // -
  // the step loop

  /// Drive the client one increment forward.
  ///
  /// Never blocks. Hosts call this repeatedly; between calls they may
  /// sleep for [`Client::time_to_next`] or until the socket becomes
  /// readable.
  pub fn step(&mut self) -> Result<ConnStatus, Error> {
    let now = self.clock.try_now().map_err(Error::Clock)?;

    if self.shutdown != ShutdownPhase::None {
      self.step_shutdown(now);
      return Ok(self.status);
    }

    if self.exchange.is_some() {
      self.step_exchange(now);
      return Ok(self.status);
    }

    match self.status {
      | ConnStatus::Initial => self.step_initial(now),
      | ConnStatus::Invalid => self.set_status(ConnStatus::Failure),
      | ConnStatus::Bootstrapping => self.step_bootstrapping(now),
      | ConnStatus::Bootstrapped => self.step_bootstrapped(now),
      | ConnStatus::Registering => self.step_registering(now),
      | ConnStatus::Registered => self.step_registered(now),
      | ConnStatus::EnteringQueueMode => {
        self.sock.rx_enabled(false);
        self.set_status(ConnStatus::QueueMode);
      },
      | ConnStatus::QueueMode => self.step_queue_mode(now),
      | ConnStatus::Suspended => self.step_suspended(now),
      | ConnStatus::Failure => (),
    }

    Ok(self.status)
  }

  /// How long the host may sleep before the next step is required.
  ///
  /// A pure query over the pending timers: retransmission deadlines, the
  /// Update schedule, the Queue Mode deadline, retry schedules and the
  /// Suspend resume time.
  pub fn time_to_next(&self) -> Result<Timeout, Error> {
    let now = self.clock.try_now().map_err(Error::Clock)?;

    if self.shutdown != ShutdownPhase::None {
      return Ok(Timeout::Millis(0));
    }

    if let Some(ex) = self.exchange.as_ref() {
      return Ok(match ex.next_timeout() {
                  | Some(t) => Timeout::Millis(millis_between(now, t)),
                  | None => Timeout::Millis(0),
                });
    }

    let work_ready = !self.queue.is_empty()
                     || !self.pending_inbound.is_empty()
                     || self.pending_trigger.is_some();

    let deadline = match self.status {
      | ConnStatus::Initial | ConnStatus::Invalid | ConnStatus::Bootstrapped => {
        return Ok(Timeout::Millis(0))
      },
      | ConnStatus::Failure => return Ok(Timeout::Never),
      | ConnStatus::Registering => {
        let timer = if self.reg.in_seq {
          self.reg.seq.as_ref()
        } else {
          self.reg.linear.as_ref()
        };
        match timer.and_then(RetryTimer::next_attempt_at) {
          | Some(t) => Some(t),
          | None => return Ok(Timeout::Millis(0)),
        }
      },
      | ConnStatus::Bootstrapping => match self.boot.timer.as_ref() {
        | None if !self.boot.requested => return Ok(Timeout::Millis(0)),
        | timer => earliest(timer.and_then(|t| t.next_attempt_at()),
                            self.boot.deadline),
      },
      | ConnStatus::Registered | ConnStatus::EnteringQueueMode => {
        if work_ready {
          return Ok(Timeout::Millis(0));
        }
        earliest(self.reg.update_at, self.queue_mode_deadline())
      },
      | ConnStatus::QueueMode => {
        if work_ready {
          return Ok(Timeout::Millis(0));
        }
        self.reg.update_at
      },
      | ConnStatus::Suspended => {
        if work_ready || self.pending_trigger.is_some() {
          return Ok(Timeout::Millis(0));
        }
        self.resume_at
      },
    };

    Ok(match deadline {
         | Some(t) => Timeout::Millis(millis_between(now, t)),
         | None => Timeout::Never,
       })
  }

  fn set_status(&mut self, status: ConnStatus) {
    if status != self.status {
      info!("{:?} -> {:?}", self.status, status);
      self.status = status;
    }
  }

  fn queue_mode_deadline(&self) -> Option<Instant<C>> {
    if !self.config.queue_mode.enabled {
      return None;
    }
    self.last_activity
        .map(|t| t + self.config.queue_mode.timeout)
  }

  // -
  // per-status steps

  fn step_initial(&mut self, now: Instant<C>) {
    if let Err(why) = self.config.validate() {
      error!("configuration invalid: {}", why);
      self.set_status(ConnStatus::Invalid);
      return;
    }

    if self.config.bootstrap.is_some() {
      self.enter_bootstrapping(now);
    } else {
      self.enter_registering();
    }
  }

  fn step_bootstrapping(&mut self, now: Instant<C>) {
    if let Some(deadline) = self.boot.deadline {
      if now >= deadline {
        warn!("bootstrap inactivity window expired");
        self.bootstrap_failed(now);
        return;
      }
    }

    if !self.boot.requested {
      let due = match self.boot.timer.as_mut() {
        | None => true,
        | Some(timer) => timer.what_should_i_do(now) == Ok(YouShould::Retry),
      };
      if due {
        self.start_op(now, Op::BootstrapRequest);
        return;
      }
    }

    if let Some(inbound) = self.next_inbound() {
      self.boot.deadline = self.config.bootstrap.map(|b| now + b.timeout);
      self.dispatch_inbound(now, inbound);
    }
  }

  fn step_bootstrapped(&mut self, _now: Instant<C>) {
    if self.config.server.is_none() {
      error!("bootstrap finished but no server relationship was configured");
      self.set_status(ConnStatus::Failure);
      return;
    }
    self.enter_registering();
  }

  fn step_registering(&mut self, now: Instant<C>) {
    let timer = if self.reg.in_seq {
      self.reg.seq.as_mut()
    } else {
      self.reg.linear.as_mut()
    };

    let due = match timer {
      | None => true,
      | Some(timer) => timer.what_should_i_do(now) == Ok(YouShould::Retry),
    };

    if due {
      self.start_op(now, Op::Register);
    }
  }

  fn step_registered(&mut self, now: Instant<C>) {
    if let Some(inbound) = self.next_inbound() {
      self.touch(now);
      self.dispatch_inbound(now, inbound);
      return;
    }

    if let Some(trigger) = self.pending_trigger.take() {
      self.enact_trigger(now, trigger);
      return;
    }

    if let Some(op) = self.queue.pop_front() {
      self.start_op(now, op);
      return;
    }

    if let Some(update_at) = self.reg.update_at {
      if now >= update_at {
        self.start_op(now, Op::Update);
        return;
      }
    }

    if let Some(deadline) = self.queue_mode_deadline() {
      if now >= deadline {
        info!("{}ms of inactivity, entering queue mode",
              self.config.queue_mode.timeout.0);
        self.set_status(ConnStatus::EnteringQueueMode);
      }
    }
  }

  fn step_queue_mode(&mut self, now: Instant<C>) {
    let update_due = self.reg
                         .update_at
                         .map(|t| now >= t)
                         .unwrap_or(false);

    if !self.queue.is_empty() || self.pending_trigger.is_some() || update_due {
      info!("waking from queue mode");
      self.sock.rx_enabled(true);
      self.touch(now);
      self.set_status(ConnStatus::Registered);
    }
  }

  fn step_suspended(&mut self, now: Instant<C>) {
    match self.pending_trigger.take() {
      | Some(Trigger::Bootstrap) => {
        warn!("re-bootstrapping while suspended violates the server's quiet period");
        self.enter_bootstrapping(now);
        return;
      },
      | Some(Trigger::Disable(timeout)) => {
        self.enter_suspended(now, timeout);
        return;
      },
      | None => (),
    }

    if let Some(resume_at) = self.resume_at {
      if now >= resume_at {
        info!("disable period over, reconnecting");
        self.resume_at = None;
        self.set_status(ConnStatus::Initial);
      }
    }
  }

  fn step_shutdown(&mut self, now: Instant<C>) {
    if self.shutdown == ShutdownPhase::Draining {
      match self.exchange.as_mut() {
        | Some(ex) => {
          if self.in_flight != Some(Op::Deregister { then: After::Shutdown }) {
            ex.terminate();
          }
        },
        | None => {
          let registered = matches!(self.status,
                                    ConnStatus::Registered
                                    | ConnStatus::EnteringQueueMode
                                    | ConnStatus::QueueMode);

          if registered && self.location.is_some() {
            self.sock.rx_enabled(true);
            self.shutdown = ShutdownPhase::Deregistering;
            self.start_op(now, Op::Deregister { then: After::Shutdown });
          } else {
            self.shutdown = ShutdownPhase::Closing;
          }
          return;
        },
      }
    }

    if self.exchange.is_some() {
      self.step_exchange(now);
      return;
    }

    if self.shutdown == ShutdownPhase::Deregistering {
      // the De-Register outcome moved us to Closing; if it did not
      // (exchange dropped some other way), close anyway
      self.shutdown = ShutdownPhase::Closing;
    }

    if self.shutdown == ShutdownPhase::Closing {
      match self.sock.shutdown() {
        | Ok(()) => {
          info!("transport released, shutdown complete");
          self.shutdown = ShutdownPhase::Done;
        },
        | Err(nb::Error::WouldBlock) => (),
        | Err(nb::Error::Other(e)) => {
          warn!("transport teardown failed, resources may leak: {:?}", e);
          self.shutdown = ShutdownPhase::Done;
        },
      }
    }
  }

  // -
  // exchanges

  fn step_exchange(&mut self, now: Instant<C>) {
    let mut ex = match self.exchange.take() {
      | Some(ex) => ex,
      | None => return,
    };

    let res = ex.step(now, &mut self.sock, &mut self.ids);
    self.pending_inbound.extend(ex.take_stray());

    match res {
      | Err(nb::Error::WouldBlock) => {
        self.exchange = Some(ex);
      },
      | Err(nb::Error::Other(never)) => match never {},
      | Ok(()) => {
        let op = self.in_flight.take();
        let outcome = ex.take_outcome();
        self.on_outcome(now, op, outcome);
      },
    }
  }

  fn start_op(&mut self, now: Instant<C>, op: Op) {
    let built = match &op {
      | Op::Register => self.build_register(),
      | Op::Update => self.build_update(),
      | Op::Deregister { then } => {
        let then = *then;
        match self.build_deregister() {
          | Some(built) => Some(built),
          | None => {
            // never registered: nothing to tear down remotely
            self.after_deregister(now, then);
            return;
          },
        }
      },
      | Op::Notify { token } => self.build_notify(token.clone()),
      | Op::Send { payload } => self.build_send(payload.clone()),
      | Op::BootstrapRequest => self.build_bootstrap_request(),
      | Op::Respond => None,
    };

    let Some(packet) = built else { return };

    trace!("starting {:?}", op);
    let seed = self.rand.gen();
    let ex = Exchange::begin_client(&self.config,
                                    now,
                                    seed,
                                    packet,
                                    &mut self.sock,
                                    &mut self.ids);
    self.exchange = Some(ex);
    self.in_flight = Some(op);
  }

  fn build_register(&mut self) -> Option<Addrd<Packet>> {
    let Some(server) = self.config.server else {
      error!("cannot register without a server relationship");
      self.set_status(ConnStatus::Failure);
      return None;
    };

    let mut req = msg::request(MessageType::Confirmable,
                               RequestType::Post,
                               self.ids.id(),
                               self.ids.token());
    msg::set_uri_path(&mut req, "rd");
    msg::add_uri_query(&mut req, format!("ep={}", self.config.endpoint_name));
    msg::add_uri_query(&mut req, format!("lt={}", server.lifetime.0 / 1_000));
    msg::add_uri_query(&mut req, format!("b={}", server.binding.as_str()));
    req.payload = self.registry.link_format().into_bytes();

    Some(Addrd(req, server.addr))
  }

  fn build_update(&mut self) -> Option<Addrd<Packet>> {
    let Some(server) = self.config.server else { return None };
    let Some(location) = self.location.clone() else {
      // our registration is gone; fall back to a full Register
      self.enter_registering();
      return None;
    };

    let mut req = msg::request(MessageType::Confirmable,
                               RequestType::Post,
                               self.ids.id(),
                               self.ids.token());
    msg::set_uri_path(&mut req, &location);
    if self.update_lifetime {
      msg::add_uri_query(&mut req, format!("lt={}", server.lifetime.0 / 1_000));
    }
    if self.refresh_payload {
      req.payload = self.registry.link_format().into_bytes();
    }

    Some(Addrd(req, server.addr))
  }

  fn build_deregister(&mut self) -> Option<Addrd<Packet>> {
    let server = self.config.server?;
    let location = self.location.clone()?;

    let mut req = msg::request(MessageType::Confirmable,
                               RequestType::Delete,
                               self.ids.id(),
                               self.ids.token());
    msg::set_uri_path(&mut req, &location);

    Some(Addrd(req, server.addr))
  }

  fn build_notify(&mut self, token: Vec<u8>) -> Option<Addrd<Packet>> {
    let server = self.config.server?;
    let Some(obs) = self.observations.iter_mut().find(|o| o.token == token) else {
      // cancelled while queued
      return None;
    };

    let path = obs.path;
    obs.seq = obs.seq.wrapping_add(1);
    let seq = obs.seq;

    match self.registry.read(&path) {
      | Ok(value) => {
        let mut rep = Packet::new();
        rep.header.set_type(MessageType::NonConfirmable);
        rep.header.code = msg::code(2, 5);
        rep.header.message_id = self.ids.id();
        rep.set_token(token);
        rep.add_option(CoapOption::Observe, observe_value(seq));
        rep.payload = value;
        Some(Addrd(rep, server.addr))
      },
      | Err(e) => {
        warn!("observed {} became unreadable ({}), dropping observation",
              path, e);
        self.observations.retain(|o| o.token != token);
        None
      },
    }
  }

  fn build_send(&mut self, payload: Vec<u8>) -> Option<Addrd<Packet>> {
    let server = self.config.server?;

    let mut req = msg::request(MessageType::Confirmable,
                               RequestType::Post,
                               self.ids.id(),
                               self.ids.token());
    msg::set_uri_path(&mut req, "dp");
    req.payload = payload;

    Some(Addrd(req, server.addr))
  }

  fn build_bootstrap_request(&mut self) -> Option<Addrd<Packet>> {
    let bootstrap = self.config.bootstrap?;

    let mut req = msg::request(MessageType::Confirmable,
                               RequestType::Post,
                               self.ids.id(),
                               self.ids.token());
    msg::set_uri_path(&mut req, "bs");
    msg::add_uri_query(&mut req, format!("ep={}", self.config.endpoint_name));

    Some(Addrd(req, bootstrap.addr))
  }

  // -
  // outcomes

  fn on_outcome(&mut self, now: Instant<C>, op: Option<Op>, outcome: Option<Outcome>) {
    let Some(op) = op else { return };
    let Some(outcome) = outcome else { return };

    match op {
      | Op::Register => match outcome {
        | Outcome::Response(rep) if msg::class_detail(rep.header.code) == (2, 1) => {
          match location_from(&rep) {
            | Some(location) => {
              info!("registered at /{}", location);
              self.location = Some(location);
              self.registration_ok(now);
            },
            | None => {
              warn!("Register succeeded but carried no Location-Path");
              self.registration_failed(now);
            },
          }
        },
        | Outcome::Response(rep) => {
          let (class, detail) = msg::class_detail(rep.header.code);
          warn!("Register rejected with {}.{:02}", class, detail);
          self.registration_failed(now);
        },
        | Outcome::Failed(cause) => {
          warn!("Register failed: {:?}", cause);
          self.registration_failed(now);
        },
        | Outcome::Sent => (),
      },

      | Op::Update => match outcome {
        | Outcome::Response(rep) if msg::class_detail(rep.header.code) == (2, 4) => {
          debug!("registration updated");
          self.refresh_payload = false;
          self.update_lifetime = false;
          self.registration_ok(now);
        },
        | other => {
          warn!("Update failed ({:?}), re-registering", failure_of(&other));
          self.set_status(ConnStatus::Registering);
          self.registration_failed(now);
        },
      },

      | Op::Deregister { then } => {
        // best effort: the relationship ends locally either way
        if let Some(cause) = failure_of(&outcome) {
          debug!("De-Register did not complete cleanly: {:?}", cause);
        }
        self.after_deregister(now, then);
      },

      | Op::Notify { token } => match outcome {
        | Outcome::Sent | Outcome::Response(_) => self.touch(now),
        | Outcome::Failed(cause) => {
          warn!("notify failed: {:?}", cause);
          if cause == FailureCause::Protocol {
            self.observations.retain(|o| o.token != token);
          }
        },
      },

      | Op::Send { .. } => match outcome {
        | Outcome::Response(rep) if msg::class_detail(rep.header.code).0 == 2 => {
          self.touch(now)
        },
        | other => warn!("Send failed: {:?}", failure_of(&other)),
      },

      | Op::BootstrapRequest => match outcome {
        | Outcome::Response(rep) if msg::class_detail(rep.header.code) == (2, 4) => {
          debug!("bootstrap requested, awaiting server writes");
          self.boot.requested = true;
          self.boot.deadline = self.config.bootstrap.map(|b| now + b.timeout);
        },
        | other => {
          warn!("Request-Bootstrap failed: {:?}", failure_of(&other));
          self.bootstrap_failed(now);
        },
      },

      | Op::Respond => {
        if let Some(cause) = failure_of(&outcome) {
          warn!("serving a request failed: {:?}", cause);
        } else {
          self.touch(now);
        }
      },
    }
  }

  fn registration_ok(&mut self, now: Instant<C>) {
    self.reg.linear = None;
    self.reg.seq = None;
    self.reg.in_seq = false;
    self.boot.timer = None;
    self.schedule_update(now);
    self.touch(now);
    self.set_status(ConnStatus::Registered);
  }

  /// The two-tier communication retry policy from the Server Object:
  /// `retry_count` attempts spaced `retry_timer` apart (linear), then
  /// `seq_retry_count` further single attempts each preceded by
  /// `seq_delay_timer`, then give up.
  ///
  /// [`step_registering`](Self::step_registering) polls the active tier's
  /// [`RetryTimer`] to fire each attempt; this only arms the timers and
  /// notices exhaustion.
  fn registration_failed(&mut self, now: Instant<C>) {
    let Some(server) = self.config.server else {
      self.set_status(ConnStatus::Failure);
      return;
    };

    self.set_status(ConnStatus::Registering);

    if !self.reg.in_seq {
      let exhausted = match self.reg.linear.as_ref() {
        | Some(timer) => timer.next_attempt_at().is_none(),
        | None => {
          debug!("register failed, retrying every {}ms (up to {} attempts)",
                 server.retry_timer.0, server.retry_count.0);
          let timer = RetryTimer::new(now,
                                      Strategy::Delay { min: server.retry_timer,
                                                        max: server.retry_timer },
                                      server.retry_count);
          let exhausted = timer.next_attempt_at().is_none();
          self.reg.linear = Some(timer);
          exhausted
        },
      };
      if !exhausted {
        return;
      }

      self.reg.in_seq = true;
      if server.seq_retry_count.0 > 0 {
        debug!("linear retries exhausted, {} sequenced attempts {}ms apart",
               server.seq_retry_count.0, server.seq_delay_timer.0);
        self.reg.seq =
          Some(RetryTimer::new(now,
                               Strategy::Delay { min: server.seq_delay_timer,
                                                 max: server.seq_delay_timer },
                               Attempts(server.seq_retry_count.0 + 1)));
        return;
      }
    } else {
      let exhausted = self.reg
                          .seq
                          .as_ref()
                          .map(|timer| timer.next_attempt_at().is_none())
                          .unwrap_or(true);
      if !exhausted {
        return;
      }
    }

    if server.bootstrap_on_registration_failure && self.config.bootstrap.is_some() {
      warn!("registration retries exhausted, falling back to bootstrap");
      self.enter_bootstrapping(now);
    } else {
      error!("registration retries exhausted");
      self.set_status(ConnStatus::Failure);
    }
  }

  /// Bootstrap retry: exponential, `retry_timeout * 2^(attempt-1)`,
  /// capped at `retry_count` attempts.
  fn bootstrap_failed(&mut self, now: Instant<C>) {
    let Some(bootstrap) = self.config.bootstrap else {
      self.set_status(ConnStatus::Failure);
      return;
    };

    self.boot.requested = false;

    let exhausted = match self.boot.timer.as_ref() {
      | Some(timer) => timer.next_attempt_at().is_none(),
      | None => {
        let strategy = Strategy::Exponential { init_min: bootstrap.retry_timeout,
                                               init_max: bootstrap.retry_timeout };
        let timer = RetryTimer::new(now, strategy, bootstrap.retry_count);
        let exhausted = timer.next_attempt_at().is_none();
        self.boot.timer = Some(timer);
        exhausted
      },
    };

    if exhausted {
      error!("bootstrap retries exhausted");
      self.set_status(ConnStatus::Failure);
      return;
    }

    // re-arm the inactivity window around the next attempt
    if let Some(timer) = self.boot.timer.as_ref() {
      if let Some(at) = timer.next_attempt_at() {
        debug!("bootstrap attempt {}/{} pending",
               timer.attempts().0 + 1,
               bootstrap.retry_count.0);
        self.boot.deadline = Some(at + bootstrap.timeout);
      }
    }
  }

  fn after_deregister(&mut self, now: Instant<C>, then: After) {
    self.location = None;
    self.observations.clear();
    self.reg.update_at = None;

    match then {
      | After::Suspend(timeout) => self.enter_suspended(now, timeout),
      | After::Bootstrap => self.enter_bootstrapping(now),
      | After::Shutdown => self.shutdown = ShutdownPhase::Closing,
    }
  }

  fn enter_registering(&mut self) {
    self.reg = RegState::fresh();
    self.set_status(ConnStatus::Registering);
  }

  fn enter_bootstrapping(&mut self, now: Instant<C>) {
    self.boot = BootState::fresh();
    self.boot.deadline = self.config.bootstrap.map(|b| now + b.timeout);
    self.location = None;
    self.observations.clear();
    self.reg.update_at = None;
    self.sock.rx_enabled(true);
    self.set_status(ConnStatus::Bootstrapping);
  }

  fn enter_suspended(&mut self, now: Instant<C>, timeout: Timeout) {
    self.queue.clear();
    self.resume_at = match timeout {
      | Timeout::Millis(ms) => Some(now + Millis(ms)),
      | Timeout::Never => None,
    };
    self.set_status(ConnStatus::Suspended);
  }

  fn schedule_update(&mut self, now: Instant<C>) {
    let Some(server) = self.config.server else { return };
    let lifetime = server.lifetime.0;

    // leave enough headroom for a full retransmission budget (the last
    // retransmission plus the wait for its ACK), or a tenth of the
    // lifetime, whichever is larger
    let budget = self.config
                     .con
                     .retry_strategy
                     .max_time(Attempts(self.config.con.max_retransmit.0 + 1));
    let margin = (lifetime / 10).max(budget.0).min(lifetime / 2);
    self.reg.update_at = Some(now + Millis(lifetime - margin));
  }

  fn touch(&mut self, now: Instant<C>) {
    self.last_activity = Some(now);
  }

  fn enact_trigger(&mut self, now: Instant<C>, trigger: Trigger) {
    match trigger {
      | Trigger::Disable(timeout) => {
        info!("disable requested");
        self.start_op(now, Op::Deregister { then: After::Suspend(timeout) });
      },
      | Trigger::Bootstrap => {
        info!("bootstrap requested");
        if self.location.is_some() {
          self.start_op(now, Op::Deregister { then: After::Bootstrap });
        } else {
          self.enter_bootstrapping(now);
        }
      },
    }
  }

  // -
  // inbound requests

  fn next_inbound(&mut self) -> Option<Addrd<Packet>> {
    if let Some(queued) = self.pending_inbound.pop_front() {
      return Some(queued);
    }

    self.scratch.resize(self.config.msg.max_message_size, 0);
    match self.sock.poll(&mut self.scratch) {
      | Ok(Some(dgram)) => match Packet::from_bytes(dgram.data()) {
        | Ok(packet) => Some(Addrd(packet, dgram.addr())),
        | Err(e) => {
          trace!("ignoring unparseable datagram from {}: {:?}", dgram.addr(), e);
          None
        },
      },
      | Ok(None) => None,
      | Err(e) => {
        warn!("socket recv failed: {:?}", e);
        None
      },
    }
  }

  fn dispatch_inbound(&mut self, now: Instant<C>, req: Addrd<Packet>) {
    if !matches!(req.data().header.code, MessageClass::Request(_)) {
      trace!("ignoring stray non-request from {}", req.addr());
      return;
    }

    let rep = if self.status == ConnStatus::Bootstrapping {
      self.handle_bootstrap_request(req.data())
    } else {
      self.handle_server_request(req.data())
    };

    let seed = self.rand.gen();
    let ex = Exchange::begin_server(&self.config,
                                    now,
                                    seed,
                                    &req,
                                    rep,
                                    &mut self.sock,
                                    &mut self.ids);
    self.exchange = Some(ex);
    self.in_flight = Some(Op::Respond);
  }

  /// Bootstrap phase: the Bootstrap Server writes to us, then posts
  /// `/bs` to signal Bootstrap-Finish.
  fn handle_bootstrap_request(&mut self, req: &Packet) -> Packet {
    let is_finish = req.header.code == MessageClass::Request(RequestType::Post)
                    && msg::uri_path(req) == "bs";

    if is_finish {
      info!("bootstrap finished");
      self.set_status(ConnStatus::Bootstrapped);
      return msg::response_for(req, msg::code(2, 4));
    }

    self.registry.dispatch(req)
  }

  fn handle_server_request(&mut self, req: &Packet) -> Packet {
    if req.header.code == MessageClass::Request(RequestType::Get) {
      if let Some(observe) = observe_request(req) {
        return self.handle_observe(req, observe);
      }
    }

    self.registry.dispatch(req)
  }

  fn handle_observe(&mut self, req: &Packet, observe: u32) -> Packet {
    let token: &[u8] = req.get_token();
    let token = token.to_vec();

    match observe {
      | 0 => {
        let path = match Path::parse(&msg::uri_path(req)) {
          | Ok(path) => path,
          | Err(e) => return msg::response_for(req, e.code()),
        };

        match self.registry.read(&path) {
          | Ok(value) => {
            debug!("observation established on {}", path);
            self.observations.retain(|o| o.token != token);
            self.observations.push(Observation { token,
                                                 path,
                                                 seq: 0 });

            let mut rep = msg::response_for(req, msg::code(2, 5));
            rep.add_option(CoapOption::Observe, observe_value(0));
            rep.payload = value;
            rep
          },
          | Err(e) => msg::response_for(req, e.code()),
        }
      },
      | 1 => {
        debug!("observation cancelled");
        self.observations.retain(|o| o.token != token);
        self.registry.dispatch(req)
      },
      | _ => self.registry.dispatch(req),
    }
  }
}

/// Does an observed path cover a changed path (same object, and each
/// present level matches)
fn covers(observed: &Path, changed: &Path) -> bool {
  observed.object == changed.object
  && observed.instance.map(|i| changed.instance == Some(i)).unwrap_or(true)
  && observed.resource.map(|r| changed.resource == Some(r)).unwrap_or(true)
  && observed.resource_instance
             .map(|ri| changed.resource_instance == Some(ri))
             .unwrap_or(true)
}

/// Minimal big-endian encoding of an Observe sequence number (zero is
/// the empty value)
fn observe_value(seq: u32) -> Vec<u8> {
  let bytes = seq.to_be_bytes();
  let skip = bytes.iter().take_while(|b| **b == 0).count();
  bytes[skip..].to_vec()
}

/// The Observe option of a request, when present
fn observe_request(req: &Packet) -> Option<u32> {
  req.get_option(CoapOption::Observe)
     .and_then(|values| values.front())
     .map(|value| value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Joined Location-Path of a Register response
fn location_from(rep: &Packet) -> Option<String> {
  let segments = rep.get_option(CoapOption::LocationPath)?;
  let joined = segments.iter()
                       .map(|s| String::from_utf8_lossy(s).into_owned())
                       .collect::<Vec<_>>()
                       .join("/");

  if joined.is_empty() {
    None
  } else {
    Some(joined)
  }
}

fn failure_of(outcome: &Outcome) -> Option<FailureCause> {
  match outcome {
    | Outcome::Failed(cause) => Some(*cause),
    | Outcome::Response(rep) if msg::class_detail(rep.header.code).0 != 2 => {
      Some(FailureCause::Protocol)
    },
    | _ => None,
  }
}

#[cfg(test)]
mod test {
  use std::sync::{Arc, Mutex};

  use super::*;
  use crate::config::Bootstrap;
  use crate::dm::{DmResult, ObjectHandler};
  use crate::test::{dummy_addr, dummy_addr_2, ClockMock, SockMock};

  struct Device;
  impl ObjectHandler for Device {
    fn object_id(&self) -> u16 {
      3
    }
    fn read(&mut self, _: &Path) -> DmResult<Vec<u8>> {
      Ok(b"98".to_vec())
    }
  }

  struct Rig {
    clock: &'static ClockMock,
    tx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
    rx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
    rx_on: Arc<Mutex<bool>>,
    broken: Arc<Mutex<bool>>,
    shutdown_steps: Arc<Mutex<u8>>,
  }

  fn rig(config: Config) -> (Rig, Client<&'static ClockMock, SockMock>) {
    // leaked so the client and the test share one clock
    let clock: &'static ClockMock = Box::leak(Box::new(ClockMock::new()));
    let sock = SockMock::new();
    let rig = Rig { clock,
                    tx: sock.tx.clone(),
                    rx: sock.rx.clone(),
                    rx_on: sock.rx_on.clone(),
                    broken: sock.broken.clone(),
                    shutdown_steps: sock.shutdown_steps.clone() };

    let mut client = Client::new(config, clock, sock);
    client.registry_mut().add(Box::new(Device));
    (rig, client)
  }

  fn config() -> Config {
    let mut cfg = Config::new("urn:dev:os-419");
    cfg.server = Some(Server::new(dummy_addr(), 1));
    cfg
  }

  fn sent(rig: &Rig) -> Vec<Addrd<Packet>> {
    SockMock::sent(&rig.tx)
  }

  fn inject(rig: &Rig, packet: Packet) {
    SockMock::inject(&rig.rx, Addrd(packet, dummy_addr()));
  }

  fn created_response(req: &Packet) -> Packet {
    let mut rep = msg::response_for(req, msg::code(2, 1));
    rep.add_option(CoapOption::LocationPath, b"rd".to_vec());
    rep.add_option(CoapOption::LocationPath, b"5a3f".to_vec());
    rep
  }

  /// Step until registered (2 steps to issue the Register, then the
  /// response round-trip)
  fn register(rig: &Rig, client: &mut Client<&'static ClockMock, SockMock>) -> Packet {
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Registering);
    client.step().unwrap();

    let reqs = sent(rig);
    assert_eq!(reqs.len(), 1);
    let req = reqs[0].data().clone();

    inject(rig, created_response(&req));
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Registered);
    req
  }

  #[test]
  fn register_success() {
    let (rig, mut client) = rig(config());
    let req = register(&rig, &mut client);

    assert_eq!(req.header.code, MessageClass::Request(RequestType::Post));
    assert_eq!(msg::uri_path(&req), "rd");
    assert_eq!(req.payload, b"</3/0>".to_vec());

    let queries = req.get_option(CoapOption::UriQuery)
                     .map(|q| {
                       q.iter()
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .collect::<Vec<_>>()
                     })
                     .unwrap_or_default();
    assert!(queries.contains(&"ep=urn:dev:os-419".to_string()));
    assert!(queries.contains(&"lt=86400".to_string()));
    assert!(queries.contains(&"b=U".to_string()));

    // the update is scheduled a margin before the lifetime expires
    match client.time_to_next().unwrap() {
      | Timeout::Millis(ms) => assert_eq!(ms, 86_400_000 - 8_640_000),
      | Timeout::Never => panic!("an update must be scheduled"),
    }
  }

  #[test]
  fn invalid_config_decays_to_failure() {
    let (_rig, mut client) = rig(Config::new("urn:dev:os-419"));

    assert_eq!(client.step().unwrap(), ConnStatus::Invalid);
    assert_eq!(client.step().unwrap(), ConnStatus::Failure);
    assert_eq!(client.time_to_next().unwrap(), Timeout::Never);

    client.restart();
    assert_eq!(client.status(), ConnStatus::Initial);
  }

  #[test]
  fn update_before_lifetime_expiry() {
    let (rig, mut client) = rig(config());
    register(&rig, &mut client);

    // a fresh register at t=0 schedules the update at 77_760_000
    rig.clock.set(77_760_000);
    client.step().unwrap();

    let reqs = sent(&rig);
    assert_eq!(reqs.len(), 1);
    let update = reqs[0].data();
    assert_eq!(update.header.code, MessageClass::Request(RequestType::Post));
    assert_eq!(msg::uri_path(update), "rd/5a3f");
    assert!(update.payload.is_empty());

    inject(&rig, msg::response_for(update, msg::code(2, 4)));
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Registered);
  }

  /*
   * retry_count=5, retry_timer=60s, seq_retry_count=1,
   * seq_delay_timer=86400s: five attempts spaced 60s apart, then one
   * last attempt a day later, then FAILURE.
   */
  #[test]
  fn two_tier_registration_retry() {
    let mut cfg = config();
    let server = cfg.server.as_mut().unwrap();
    server.retry_count = Attempts(5);
    server.retry_timer = Millis(60_000);
    server.seq_retry_count = Attempts(1);
    server.seq_delay_timer = Millis(86_400_000);

    let (rig, mut client) = rig(cfg);
    *rig.broken.lock().unwrap() = true;

    client.step().unwrap(); // Initial -> Registering

    let mut t = 0u64;
    for attempt in 1..=4 {
      rig.clock.set(t);
      client.step().unwrap(); // attempt fails on send
      client.step().unwrap(); // failure processed, retry scheduled
      assert_eq!(client.status(), ConnStatus::Registering, "attempt {}", attempt);
      assert_eq!(client.time_to_next().unwrap(), Timeout::Millis(60_000));
      t += 60_000;
    }

    // the fifth failure exhausts the linear tier
    rig.clock.set(t);
    client.step().unwrap();
    client.step().unwrap();
    assert_eq!(client.time_to_next().unwrap(), Timeout::Millis(86_400_000));

    // one further attempt a day later, then the budget is spent
    t += 86_400_000;
    rig.clock.set(t);
    client.step().unwrap();
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Failure);
  }

  #[test]
  fn registration_failure_can_fall_back_to_bootstrap() {
    let mut cfg = config();
    cfg.bootstrap = Some(Bootstrap::new(dummy_addr_2()));
    {
      let server = cfg.server.as_mut().unwrap();
      server.retry_count = Attempts(1);
      server.seq_retry_count = Attempts(0);
      server.bootstrap_on_registration_failure = true;
    }

    let (rig, mut client) = rig(cfg);

    // bootstrap is configured, so the client starts there; drive it
    // through so we can watch the registration fallback
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Bootstrapping);
    client.step().unwrap();
    let bs_req = sent(&rig)[0].data().clone();
    SockMock::inject(&rig.rx,
                     Addrd(msg::response_for(&bs_req, msg::code(2, 4)),
                           dummy_addr_2()));
    client.step().unwrap();

    // Bootstrap-Finish arrives from the bootstrap server
    let mut ids = IdGen::new(7);
    let mut finish = msg::request(MessageType::Confirmable,
                                  RequestType::Post,
                                  ids.id(),
                                  ids.token());
    msg::set_uri_path(&mut finish, "bs");
    SockMock::inject(&rig.rx, Addrd(finish, dummy_addr_2()));
    client.step().unwrap(); // dispatch finish, respond
    client.step().unwrap(); // response delivered
    client.step().unwrap(); // Bootstrapped -> Registering
    assert_eq!(client.status(), ConnStatus::Registering);
    sent(&rig); // drain the finish ACK

    // now break the network: the single register attempt fails and the
    // client falls back to bootstrapping instead of FAILURE
    *rig.broken.lock().unwrap() = true;
    client.step().unwrap();
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Bootstrapping);
  }

  /*
   * end-to-end: Register succeeds, then the network dies; five failed
   * attempts (the Update plus four Registers) with seq_retry_count=0
   * end in FAILURE.
   */
  #[test]
  fn update_failures_exhaust_retries_to_failure() {
    let mut cfg = config();
    {
      let server = cfg.server.as_mut().unwrap();
      server.retry_count = Attempts(5);
      server.retry_timer = Millis(60_000);
      server.seq_retry_count = Attempts(0);
    }

    let (rig, mut client) = rig(cfg);
    register(&rig, &mut client);

    *rig.broken.lock().unwrap() = true;

    let mut t = 77_760_000u64; // the scheduled update time
    rig.clock.set(t);
    client.step().unwrap(); // update attempt fails on send
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Registering);

    for _ in 2..=4 {
      t += 60_000;
      rig.clock.set(t);
      client.step().unwrap();
      client.step().unwrap();
      assert_eq!(client.status(), ConnStatus::Registering);
    }

    t += 60_000;
    rig.clock.set(t);
    client.step().unwrap();
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Failure);
  }

  #[test]
  fn queue_mode_entry_and_wake() {
    let mut cfg = config();
    cfg.queue_mode.enabled = true;
    cfg.queue_mode.timeout = Millis(93_000);

    let (rig, mut client) = rig(cfg);
    register(&rig, &mut client);

    rig.clock.set(92_999);
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Registered);

    rig.clock.set(93_000);
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::EnteringQueueMode);
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::QueueMode);
    assert!(!*rig.rx_on.lock().unwrap(), "receive path off in queue mode");

    // a scheduled update wakes the client immediately
    client.request_update();
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Registered);
    assert!(*rig.rx_on.lock().unwrap());

    client.step().unwrap();
    let reqs = sent(&rig);
    assert_eq!(reqs.len(), 1);
    assert_eq!(msg::uri_path(reqs[0].data()), "rd/5a3f");
  }

  #[test]
  fn observe_and_notify() {
    let (rig, mut client) = rig(config());
    register(&rig, &mut client);

    let mut ids = IdGen::new(9);
    let mut get = msg::request(MessageType::Confirmable,
                               RequestType::Get,
                               ids.id(),
                               ids.token());
    msg::set_uri_path(&mut get, "3/0/9");
    get.add_option(CoapOption::Observe, vec![]);
    let token: Vec<u8> = get.get_token().to_vec();

    inject(&rig, get);
    client.step().unwrap(); // dispatch, respond
    let reps = sent(&rig);
    assert_eq!(reps.len(), 1);
    let rep = reps[0].data();
    assert_eq!(msg::class_detail(rep.header.code), (2, 5));
    assert_eq!(rep.payload, b"98".to_vec());
    assert!(rep.get_option(CoapOption::Observe).is_some());
    client.step().unwrap(); // response outcome

    client.notify_changed(&Path::resource(3, 0, 9));
    client.step().unwrap();

    let notifies = sent(&rig);
    assert_eq!(notifies.len(), 1);
    let notify = notifies[0].data();
    assert_eq!(notify.header.get_type(), MessageType::NonConfirmable);
    let nt: &[u8] = notify.get_token();
    assert_eq!(nt, token.as_slice());
    assert_eq!(notify.get_option(CoapOption::Observe)
                     .and_then(|v| v.front())
                     .cloned(),
               Some(vec![1]));
    assert_eq!(notify.payload, b"98".to_vec());
  }

  #[test]
  fn unobserved_change_notifies_nobody() {
    let (rig, mut client) = rig(config());
    register(&rig, &mut client);

    client.notify_changed(&Path::resource(3, 0, 9));
    client.step().unwrap();
    assert!(sent(&rig).is_empty());
  }

  #[test]
  fn disable_suspends_then_resumes() {
    let (rig, mut client) = rig(config());
    register(&rig, &mut client);

    client.disable(Timeout::Millis(5_000));
    client.step().unwrap();

    let reqs = sent(&rig);
    assert_eq!(reqs.len(), 1);
    let dereg = reqs[0].data().clone();
    assert_eq!(dereg.header.code, MessageClass::Request(RequestType::Delete));
    assert_eq!(msg::uri_path(&dereg), "rd/5a3f");

    inject(&rig, msg::response_for(&dereg, msg::code(2, 2)));
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Suspended);

    rig.clock.advance(5_000);
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Initial);

    // the client reconnects with a fresh Register
    client.step().unwrap();
    client.step().unwrap();
    let reqs = sent(&rig);
    assert_eq!(reqs.len(), 1);
    assert_eq!(msg::uri_path(reqs[0].data()), "rd");
  }

  #[test]
  fn bootstrap_retry_is_exponential() {
    let mut cfg = Config::new("urn:dev:os-419");
    cfg.bootstrap = Some(Bootstrap::new(dummy_addr_2()));

    let (rig, mut client) = rig(cfg);
    *rig.broken.lock().unwrap() = true;

    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Bootstrapping);

    client.step().unwrap(); // attempt 1 fails on send
    client.step().unwrap();
    assert_eq!(client.time_to_next().unwrap(), Timeout::Millis(3_000));

    rig.clock.set(3_000);
    client.step().unwrap(); // attempt 2
    client.step().unwrap();
    assert_eq!(client.time_to_next().unwrap(), Timeout::Millis(6_000));

    rig.clock.set(9_000);
    client.step().unwrap(); // attempt 3 exhausts the budget
    client.step().unwrap();
    assert_eq!(client.status(), ConnStatus::Failure);
  }

  #[test]
  fn shutdown_deregisters_and_releases_transport() {
    let (rig, mut client) = rig(config());
    register(&rig, &mut client);
    *rig.shutdown_steps.lock().unwrap() = 2;

    client.shutdown();
    client.step().unwrap(); // begins the De-Register

    let reqs = sent(&rig);
    assert_eq!(reqs.len(), 1);
    let dereg = reqs[0].data().clone();
    assert_eq!(dereg.header.code, MessageClass::Request(RequestType::Delete));

    inject(&rig, msg::response_for(&dereg, msg::code(2, 2)));
    client.step().unwrap(); // De-Register completes -> Closing
    assert!(!client.is_shut_down());

    client.step().unwrap(); // teardown in progress
    assert!(!client.is_shut_down());
    client.step().unwrap();
    client.step().unwrap();
    assert!(client.is_shut_down());
  }
}
