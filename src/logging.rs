use coap_lite::Packet;

use crate::msg;

/// One-line summary of a message for log output
pub(crate) fn msg_summary(msg: &Packet) -> String {
  let (class, detail) = msg::class_detail(msg.header.code);
  format!("{:?} {}.{:02} id {} with {} byte payload",
          msg.header.get_type(),
          class,
          detail,
          msg.header.message_id,
          msg.payload.len())
}

#[cfg(test)]
mod test {
  use coap_lite::{MessageType, RequestType};

  use super::*;
  use crate::msg::{code, request};

  #[test]
  fn summary_mentions_code_and_payload() {
    let mut req = request(MessageType::Confirmable, RequestType::Post, 7, vec![1]);
    req.payload = vec![0; 42];
    req.header.code = code(2, 5);

    let summary = msg_summary(&req);
    assert!(summary.contains("2.05"));
    assert!(summary.contains("42 byte"));
  }
}
