use no_std_net::SocketAddr;

use crate::retry::{Attempts, Strategy};
use crate::time::Millis;

/// Transport binding of a server relationship.
///
/// Only UDP (binding `"U"`) is driven by this crate; the variant exists so
/// the Register payload can carry the binding the host configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum Binding {
  /// UDP, the default LwM2M binding
  Udp,
}

impl Binding {
  /// The binding letter used in Register/Update query strings
  pub fn as_str(&self) -> &'static str {
    match self {
      | Self::Udp => "U",
    }
  }
}

impl Default for Binding {
  fn default() -> Self {
    Self::Udp
  }
}

/// Configuration options related to sending & retransmitting
/// CON messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Con {
  /// Retry strategy for CON messages that
  /// have not yet been ACKed.
  ///
  /// The default is the RFC7252 transmission parameters
  /// (`ACK_TIMEOUT` 2s, `ACK_RANDOM_FACTOR` 1.5): an initial deadline
  /// drawn uniformly from 2-3 seconds, doubling on every retransmission.
  /// ```
  /// use newt::config::Con;
  /// use newt::retry::Strategy;
  /// use newt::time::Millis;
  ///
  /// assert_eq!(Con::default().retry_strategy,
  ///            Strategy::Exponential { init_min: Millis(2_000),
  ///                                    init_max: Millis(3_000) });
  /// ```
  pub retry_strategy: Strategy,
  /// Number of times we are allowed to retransmit a CON message
  /// before giving the exchange up (`MAX_RETRANSMIT`).
  ///
  /// Defaults to 4.
  /// ```
  /// use newt::config::Con;
  /// use newt::retry::Attempts;
  ///
  /// assert_eq!(Con::default().max_retransmit, Attempts(4));
  /// ```
  pub max_retransmit: Attempts,
}

impl Default for Con {
  fn default() -> Self {
    Con { retry_strategy: Strategy::Exponential { init_min: Millis(2_000),
                                                  init_max: Millis(3_000) },
          max_retransmit: Attempts(4) }
  }
}

/// Configuration options related to parsing & assembling messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msg {
  /// Seed used to generate message tokens, customizable to allow your
  /// application to generate tokens less guessably.
  ///
  /// The default value is 0, although it is best practice to set this to
  /// something else. (random integer, machine identifier)
  pub token_seed: u16,
  /// Block size to offer when a body does not fit in one datagram.
  ///
  /// Must be one of the seven RFC7959 sizes {16, 32, 64, 128, 256, 512,
  /// 1024}; the peer may negotiate it _down_, never up.
  ///
  /// Defaults to 1024.
  /// ```
  /// assert_eq!(newt::config::Msg::default().preferred_block_size, 1024);
  /// ```
  pub preferred_block_size: u16,
  /// Capacity, in bytes, of the datagram receive buffer.
  ///
  /// Defaults to 1152 (the RFC7252 default message size).
  pub max_message_size: usize,
  /// Capacity, in bytes, of the arena used to reassemble block-wise
  /// bodies. An incoming body larger than this fails the exchange.
  ///
  /// Defaults to 4096.
  pub reassembly_capacity: usize,
}

impl Default for Msg {
  fn default() -> Self {
    Msg { token_seed: 0,
          preferred_block_size: 1024,
          max_message_size: 1152,
          reassembly_capacity: 4096 }
  }
}

/// One managed LwM2M Server relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Server {
  /// Address of the server's CoAP endpoint
  pub addr: SocketAddr,
  /// Short Server ID. Valid values are 1..=65534.
  pub ssid: u16,
  /// Registration lifetime. The client issues Update well before this
  /// expires.
  ///
  /// Defaults to 24 hours.
  pub lifetime: Millis,
  /// Transport binding
  pub binding: Binding,
  /// Tier 1 of the Server-Object communication retry policy:
  /// total Register attempts, spaced [`Server::retry_timer`] apart
  /// (linear, not exponential).
  ///
  /// Defaults to 5.
  pub retry_count: Attempts,
  /// Delay between tier-1 Register attempts. Defaults to 60 seconds.
  pub retry_timer: Millis,
  /// Tier 2 of the retry policy: after tier 1 is exhausted, this many
  /// further attempts are made, each preceded by a
  /// [`Server::seq_delay_timer`] wait. Exhausting both tiers is fatal.
  ///
  /// Defaults to 1.
  pub seq_retry_count: Attempts,
  /// Delay before each tier-2 attempt. Defaults to 24 hours.
  pub seq_delay_timer: Millis,
  /// Fall back to bootstrap instead of [`crate::reg::ConnStatus::Failure`]
  /// when the retry policy is exhausted.
  pub bootstrap_on_registration_failure: bool,
}

impl Server {
  /// A server relationship with the default policy values
  /// ```
  /// use newt::config::Server;
  /// use newt::retry::Attempts;
  /// use newt::time::Millis;
  ///
  /// let addr = no_std_net::SocketAddr::new(no_std_net::IpAddr::V4(no_std_net::Ipv4Addr::new(203, 0, 113, 1)), 5683);
  /// let s = Server::new(addr, 1);
  /// assert_eq!(s.lifetime, Millis(86_400_000));
  /// assert_eq!(s.retry_count, Attempts(5));
  /// assert_eq!(s.retry_timer, Millis(60_000));
  /// assert_eq!(s.seq_retry_count, Attempts(1));
  /// assert_eq!(s.seq_delay_timer, Millis(86_400_000));
  /// ```
  pub fn new(addr: SocketAddr, ssid: u16) -> Self {
    Server { addr,
             ssid,
             lifetime: Millis(86_400_000),
             binding: Binding::default(),
             retry_count: Attempts(5),
             retry_timer: Millis(60_000),
             seq_retry_count: Attempts(1),
             seq_delay_timer: Millis(86_400_000),
             bootstrap_on_registration_failure: false }
  }
}

/// The Bootstrap-Server relationship, when one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bootstrap {
  /// Address of the Bootstrap Server's CoAP endpoint
  pub addr: SocketAddr,
  /// Number of times the whole bootstrap phase may be attempted.
  ///
  /// Defaults to 3.
  pub retry_count: Attempts,
  /// Delay before the second bootstrap attempt; doubled for each
  /// further attempt. Defaults to 3 seconds.
  pub retry_timeout: Millis,
  /// Inactivity window bounding the whole bootstrap phase.
  ///
  /// Defaults to 247 seconds (`EXCHANGE_LIFETIME`).
  /// ```
  /// use newt::config::Bootstrap;
  /// use newt::time::Millis;
  ///
  /// let addr = no_std_net::SocketAddr::new(no_std_net::IpAddr::V4(no_std_net::Ipv4Addr::new(203, 0, 113, 2)), 5683);
  /// let b = Bootstrap::new(addr);
  /// assert_eq!(b.timeout, Millis(247_000));
  /// ```
  pub timeout: Millis,
}

impl Bootstrap {
  /// A bootstrap relationship with the default policy values
  pub fn new(addr: SocketAddr) -> Self {
    Bootstrap { addr,
                retry_count: Attempts(3),
                retry_timeout: Millis(3_000),
                timeout: Millis(247_000) }
  }
}

/// Queue Mode behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueMode {
  /// Whether Queue Mode is enabled at all
  pub enabled: bool,
  /// How long the connection may sit idle in
  /// [`crate::reg::ConnStatus::Registered`] before the receive path is
  /// turned off.
  ///
  /// Defaults to 93 seconds (`MAX_TRANSMIT_WAIT`).
  /// ```
  /// use newt::config::QueueMode;
  /// use newt::time::Millis;
  ///
  /// assert_eq!(QueueMode::default().timeout, Millis(93_000));
  /// assert!(!QueueMode::default().enabled);
  /// ```
  pub timeout: Millis,
}

impl Default for QueueMode {
  fn default() -> Self {
    QueueMode { enabled: false,
                timeout: Millis(93_000) }
  }
}

/// Runtime config for one LwM2M client.
///
/// Constructed by the host, validated by the state machine on its first
/// step: an empty endpoint name, an SSID outside 1..=65534, or neither a
/// server nor a bootstrap relationship configured is an invalid
/// configuration and parks the client in
/// [`crate::reg::ConnStatus::Failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Endpoint Client Name sent in Register and Bootstrap-Request
  pub endpoint_name: String,
  /// See [`Msg`]
  pub msg: Msg,
  /// See [`Con`]
  pub con: Con,
  /// The managed server relationship, if one is provisioned
  pub server: Option<Server>,
  /// The Bootstrap-Server relationship, if one is configured
  pub bootstrap: Option<Bootstrap>,
  /// See [`QueueMode`]
  pub queue_mode: QueueMode,
}

impl Config {
  /// A config with nothing but an endpoint name; add relationships before
  /// stepping or the client will park itself in failure.
  pub fn new(endpoint_name: impl Into<String>) -> Self {
    Config { endpoint_name: endpoint_name.into(),
             msg: Msg::default(),
             con: Con::default(),
             server: None,
             bootstrap: None,
             queue_mode: QueueMode::default() }
  }

  /// `Err(reason)` when the configuration cannot possibly produce a
  /// working registration.
  pub(crate) fn validate(&self) -> Result<(), &'static str> {
    if self.endpoint_name.is_empty() {
      return Err("endpoint name is empty");
    }

    match (self.server.as_ref(), self.bootstrap.as_ref()) {
      | (None, None) => Err("neither a server nor a bootstrap relationship is configured"),
      | (Some(s), _) if s.ssid == 0 || s.ssid == u16::MAX => Err("SSID out of range 1..=65534"),
      | _ => Ok(()),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn addr() -> SocketAddr {
    crate::test::dummy_addr()
  }

  #[test]
  fn validate_rejects_empty_config() {
    assert!(Config::new("urn:dev:01").validate().is_err());
    assert!(Config::new("").validate().is_err());
  }

  #[test]
  fn validate_rejects_reserved_ssid() {
    let mut cfg = Config::new("urn:dev:01");
    cfg.server = Some(Server::new(addr(), 0));
    assert!(cfg.validate().is_err());

    cfg.server = Some(Server::new(addr(), u16::MAX));
    assert!(cfg.validate().is_err());

    cfg.server = Some(Server::new(addr(), 1));
    assert!(cfg.validate().is_ok());
  }

  #[test]
  fn bootstrap_only_config_is_valid() {
    let mut cfg = Config::new("urn:dev:01");
    cfg.bootstrap = Some(Bootstrap::new(addr()));
    assert!(cfg.validate().is_ok());
  }
}
