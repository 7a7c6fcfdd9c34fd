use anyhow::{anyhow, Result};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};

/// Build one DNS query message on the wire.
///
/// The id is stamped into the header; callers that pre-render templates pass
/// 0 and patch the first two bytes per emission.
pub fn build_query(
	qname: &Name,
	qtype: RecordType,
	qclass: DNSClass,
	dnssec: bool,
	id: u16,
) -> Result<Vec<u8>> {
	let mut message = Message::new();
	message.set_id(id);
	message.set_message_type(MessageType::Query);
	message.set_op_code(OpCode::Query);
	message.set_recursion_desired(true);

	let mut query = Query::query(qname.clone(), qtype);
	query.set_query_class(qclass);
	message.add_query(query);

	if dnssec {
		let mut edns = Edns::new();
		edns.set_max_payload(4096);
		edns.set_dnssec_ok(true);
		message.set_edns(edns);
	}

	message
		.to_vec()
		.map_err(|e| anyhow!("failed to serialize DNS query: {}", e))
}

/// Parse a query type name, e.g. "A", "AAAA", "NS", "ANY".
pub fn parse_qtype(s: &str) -> Result<RecordType> {
	s.to_uppercase()
		.parse::<RecordType>()
		.map_err(|e| anyhow!("invalid query type '{}': {}", s, e))
}

/// Parse a query class name. Only IN and CH are supported.
pub fn parse_qclass(s: &str) -> Result<DNSClass> {
	match s.to_uppercase().as_str() {
		"IN" => Ok(DNSClass::IN),
		"CH" => Ok(DNSClass::CH),
		other => Err(anyhow!("query class must be 'IN' or 'CH', got '{}'", other)),
	}
}

/// Read the transaction id and response code out of a response header.
///
/// The engine matches responses by id and counts rcodes; nothing else in the
/// message matters here, so anything with a full 12-byte header passes.
pub fn response_meta(data: &[u8]) -> Option<(u16, u8)> {
	if data.len() < 12 {
		return None;
	}
	let id = u16::from_be_bytes([data[0], data[1]]);
	let rcode = data[3] & 0x0f;
	Some((id, rcode))
}

/// Display name for a response code.
pub fn rcode_name(rcode: u8) -> String {
	match rcode {
		0 => "NOERROR".to_string(),
		1 => "FORMERR".to_string(),
		2 => "SERVFAIL".to_string(),
		3 => "NXDOMAIN".to_string(),
		4 => "NOTIMP".to_string(),
		5 => "REFUSED".to_string(),
		n => format!("RCODE{}", n),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn name(s: &str) -> Name {
		Name::from_ascii(s).unwrap()
	}

	#[test]
	fn test_build_query_stamps_id() {
		let bytes = build_query(&name("example.com"), RecordType::A, DNSClass::IN, false, 1234)
			.unwrap();
		// DNS header is 12 bytes minimum
		assert!(bytes.len() >= 12);
		// id lands in the first two bytes, big-endian
		assert_eq!(bytes[0], (1234 >> 8) as u8);
		assert_eq!(bytes[1], (1234 & 0xff) as u8);
	}

	#[test]
	fn test_build_query_dnssec_adds_opt() {
		let plain =
			build_query(&name("example.com"), RecordType::A, DNSClass::IN, false, 1).unwrap();
		let dnssec =
			build_query(&name("example.com"), RecordType::A, DNSClass::IN, true, 1).unwrap();
		// the OPT record only shows up with the DO flag requested
		assert!(dnssec.len() > plain.len());
	}

	#[test]
	fn test_build_query_chaos_class() {
		let bytes = build_query(
			&name("version.bind"),
			RecordType::TXT,
			DNSClass::CH,
			false,
			7,
		)
		.unwrap();
		assert!(bytes.len() >= 12);
	}

	#[test]
	fn test_response_meta_roundtrip() {
		let bytes =
			build_query(&name("example.com"), RecordType::A, DNSClass::IN, false, 9999).unwrap();
		let (id, rcode) = response_meta(&bytes).unwrap();
		assert_eq!(id, 9999);
		assert_eq!(rcode, 0);
	}

	#[test]
	fn test_response_meta_reads_rcode() {
		let mut bytes =
			build_query(&name("example.com"), RecordType::A, DNSClass::IN, false, 1).unwrap();
		bytes[2] |= 0x80; // QR
		bytes[3] = (bytes[3] & 0xf0) | 3; // NXDOMAIN
		assert_eq!(response_meta(&bytes), Some((1, 3)));
	}

	#[test]
	fn test_response_meta_truncated() {
		assert_eq!(response_meta(&[0u8; 5]), None);
	}

	#[test]
	fn test_parse_qtype() {
		assert_eq!(parse_qtype("A").unwrap(), RecordType::A);
		assert_eq!(parse_qtype("aaaa").unwrap(), RecordType::AAAA);
		assert_eq!(parse_qtype("ANY").unwrap(), RecordType::ANY);
	}

	#[test]
	fn test_parse_qclass() {
		assert_eq!(parse_qclass("IN").unwrap(), DNSClass::IN);
		assert_eq!(parse_qclass("ch").unwrap(), DNSClass::CH);
		assert!(parse_qclass("HS").is_err());
	}

	#[test]
	fn test_rcode_names() {
		assert_eq!(rcode_name(0), "NOERROR");
		assert_eq!(rcode_name(3), "NXDOMAIN");
		assert_eq!(rcode_name(11), "RCODE11");
	}
}
