use gf_core::ResolvedIp;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RData;
use std::net::IpAddr;

/// Lowercase a query name and strip the trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.strip_suffix('.')
        .unwrap_or(name)
        .to_ascii_lowercase()
}

/// TC bit of a raw DNS message, without a full parse.
pub fn is_truncated(wire: &[u8]) -> bool {
    wire.len() > 2 && wire[2] & 0x02 != 0
}

/// Synthesize an answerless reply for `req` with the given rcode. The
/// question section is copied so stub resolvers can match the response.
pub fn negative_reply(req: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply.set_id(req.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(req.op_code());
    reply.set_recursion_desired(req.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_response_code(code);
    reply.add_queries(req.queries().to_vec());
    reply
}

/// Collect every A/AAAA record from an upstream answer with its record TTL.
/// CNAME chains contribute nothing by themselves.
pub fn extract_resolved(reply: &Message) -> Vec<ResolvedIp> {
    reply
        .answers()
        .iter()
        .filter_map(|record| {
            let addr = match record.data() {
                RData::A(a) => IpAddr::V4(a.0),
                RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                _ => return None,
            };
            Some(ResolvedIp::new(addr, record.ttl()))
        })
        .collect()
}
