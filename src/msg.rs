use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};
use rand::{Rng, SeedableRng};

/// Generates message IDs and tokens for outgoing requests.
///
/// Message IDs start at a random point and increment; tokens are 8 random
/// bytes. Both are drawn from a ChaCha8 stream seeded with the configured
/// `token_seed` so that a fleet of devices does not produce identical
/// token sequences.
#[derive(Debug, Clone)]
pub struct IdGen {
  rand: rand_chacha::ChaCha8Rng,
  next_id: u16,
}

impl IdGen {
  /// Create a generator from the config's token seed
  pub fn new(token_seed: u16) -> Self {
    let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(u64::from(token_seed));
    let next_id = rand.gen();
    Self { rand, next_id }
  }

  /// The next message ID
  pub fn id(&mut self) -> u16 {
    let id = self.next_id;
    self.next_id = self.next_id.wrapping_add(1);
    id
  }

  /// A fresh 8-byte token
  pub fn token(&mut self) -> Vec<u8> {
    (0..8).map(|_| self.rand.gen::<u8>()).collect()
  }
}

/// Pack a `(class, detail)` pair into a `coap_lite` code
/// (RFC7252 section 3: 3 bits of class, 5 bits of detail)
pub fn code(class: u8, detail: u8) -> MessageClass {
  MessageClass::from((class << 5) | (detail & 0b1_1111))
}

/// Unpack a `coap_lite` code into its `(class, detail)` pair
pub fn class_detail(code: MessageClass) -> (u8, u8) {
  let raw = u8::from(code);
  (raw >> 5, raw & 0b1_1111)
}

/// Build a request with no options or payload
pub fn request(ty: MessageType, method: RequestType, id: u16, token: Vec<u8>) -> Packet {
  let mut packet = Packet::new();
  packet.header.set_type(ty);
  packet.header.code = MessageClass::Request(method);
  packet.header.message_id = id;
  packet.set_token(token);
  packet
}

/// Build the response to `req`: a piggybacked ACK when the request was
/// confirmable, a NON response otherwise. Echoes the request's token.
pub fn response_for(req: &Packet, code: MessageClass) -> Packet {
  let mut packet = Packet::new();
  packet.header.set_type(match req.header.get_type() {
                           | MessageType::Confirmable => MessageType::Acknowledgement,
                           | _ => MessageType::NonConfirmable,
                         });
  packet.header.code = code;
  packet.header.message_id = req.header.message_id;

  let token: &[u8] = req.get_token();
  packet.set_token(token.to_vec());
  packet
}

/// Build an empty Reset for a message we want no part of
pub fn reset_for(msg: &Packet) -> Packet {
  let mut packet = Packet::new();
  packet.header.set_type(MessageType::Reset);
  packet.header.code = MessageClass::Empty;
  packet.header.message_id = msg.header.message_id;
  packet
}

/// Append each segment of a `/`-separated path as a Uri-Path option
pub fn set_uri_path(packet: &mut Packet, path: &str) {
  for segment in path.split('/').filter(|s| !s.is_empty()) {
    packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
  }
}

/// Append a Uri-Query option
pub fn add_uri_query(packet: &mut Packet, query: String) {
  packet.add_option(CoapOption::UriQuery, query.into_bytes());
}

/// The Uri-Path options of `packet` joined back into a `/`-separated string
pub fn uri_path(packet: &Packet) -> String {
  match packet.get_option(CoapOption::UriPath) {
    | None => String::new(),
    | Some(segments) => segments.iter()
                                .map(|s| String::from_utf8_lossy(s).into_owned())
                                .collect::<Vec<_>>()
                                .join("/"),
  }
}

/// Does `incoming` respond to the request with this token?
///
/// Separate-response flows answer with the token; piggybacked ACKs also
/// match on message ID, which [`crate::exchange::Exchange`] checks
/// separately.
pub fn token_matches(token: &[u8], incoming: &Packet) -> bool {
  let incoming_token: &[u8] = incoming.get_token();
  incoming_token == token
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn code_packing_round_trips() {
    assert_eq!(class_detail(code(2, 5)), (2, 5));
    assert_eq!(class_detail(code(4, 4)), (4, 4));
    assert_eq!(class_detail(code(0, 0)), (0, 0));
    assert_eq!(code(0, 0), MessageClass::Empty);
  }

  #[test]
  fn id_gen_increments() {
    let mut idgen = IdGen::new(42);
    let a = idgen.id();
    let b = idgen.id();
    assert_eq!(b, a.wrapping_add(1));
  }

  #[test]
  fn tokens_are_distinct() {
    let mut idgen = IdGen::new(42);
    let a = idgen.token();
    let b = idgen.token();
    assert_eq!(a.len(), 8);
    assert_ne!(a, b);
  }

  #[test]
  fn response_for_echoes_token_and_id() {
    let mut idgen = IdGen::new(0);
    let req = request(MessageType::Confirmable,
                      RequestType::Get,
                      idgen.id(),
                      idgen.token());
    let rep = response_for(&req, code(2, 5));

    assert_eq!(rep.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(rep.header.message_id, req.header.message_id);
    assert!(token_matches(req.get_token(), &rep));
  }

  #[test]
  fn uri_path_round_trips() {
    let mut packet = Packet::new();
    set_uri_path(&mut packet, "rd/abc123");
    assert_eq!(uri_path(&packet), "rd/abc123");
  }
}
