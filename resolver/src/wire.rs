//! DNS wire codec (spec.md §4.1).
//!
//! Pure encode/decode functions; no I/O, no knowledge of channels or
//! requests. Grounded on the teacher's own `net/src/dns/mod.rs`, whose
//! `Header`/`Flags`/`RR` layout this generalizes to multi-question
//! packets, name compression, EDNS0 and a small real RR decoder.

use core::net::{Ipv4Addr, Ipv6Addr};
use std::collections::HashMap;

use bilge::prelude::*;

use crate::error::Answer;

/// Maximum size of a DNS name accepted by [`Question::new`] and checked
/// against the fake-reply table (spec.md §4.7).
pub const MAX_FAKE_NAME: usize = 253;

pub const HEADER_LEN: usize = 12;
const OPT_TYPE: u16 = 41;
const EDNS_UDP_PAYLOAD: u16 = 1232;

/// The query type of a question, as the low 16 bits of QTYPE.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QType {
	A,
	Aaaa,
	Cname,
	Txt,
	Any,
	Other(u16),
}

impl QType {
	pub fn code(self) -> u16 {
		match self {
			QType::A => 1,
			QType::Cname => 5,
			QType::Txt => 16,
			QType::Aaaa => 28,
			QType::Any => 255,
			QType::Other(v) => v,
		}
	}

	pub fn from_code(v: u16) -> Self {
		match v {
			1 => QType::A,
			5 => QType::Cname,
			16 => QType::Txt,
			28 => QType::Aaaa,
			255 => QType::Any,
			other => QType::Other(other),
		}
	}
}

/// Failure to construct a valid question name (spec.md §4.1, §8).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InvalidName;

/// A single question: the label sequence of a normalized name, plus its
/// type. QCLASS is always IN.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Question {
	/// The normalized presentation form (dots trimmed), used for
	/// display and fake-reply lookups.
	pub name: String,
	/// Wire labels, in order, root-terminated implicitly (no trailing
	/// empty label stored).
	pub labels: Vec<Vec<u8>>,
	pub qtype: QType,
}

impl Question {
	/// Normalizes `name` per spec.md §4.1 ("leading dots are stripped; a
	/// trailing dot sequence is trimmed; an empty resulting name fails
	/// with `InvalidName`") and splits it into wire labels.
	pub fn new(name: &str, qtype: QType) -> Result<Self, InvalidName> {
		let trimmed = name.trim_start_matches('.').trim_end_matches('.');

		if trimmed.is_empty() {
			return Err(InvalidName);
		}

		let mut labels = Vec::new();
		let mut total = 0usize;

		for label in trimmed.split('.') {
			if label.is_empty() || label.len() > 63 {
				return Err(InvalidName);
			}

			total += label.len() + 1;
			labels.push(label.as_bytes().to_vec());
		}

		if total + 1 > 255 {
			return Err(InvalidName);
		}

		Ok(Self { name: trimmed.to_string(), labels, qtype })
	}

	pub fn is_any(&self) -> bool {
		self.qtype == QType::Any
	}
}

/// A DNS response code (RFC 1035 §4.1.1, low nibble of the header flags;
/// extended by the OPT pseudo-RR's high byte per RFC 6891 §6.1.3).
#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rcode4 {
	NoError = 0,
	FormErr = 1,
	ServFail = 2,
	NxDomain = 3,
	NotImp = 4,
	Refused = 5,
	YxDomain = 6,
	YxRrSet = 7,
	NxRrSet = 8,
	NotAuth = 9,
	NotZone = 10,
	#[fallback]
	Reserved,
}

/// The resolved, extended response code surfaced to callers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WireRcode {
	NoError,
	FormErr,
	ServFail,
	NxDomain,
	NotImp,
	Refused,
	YxDomain,
	YxRrSet,
	NxRrSet,
	NotAuth,
	NotZone,
	Other(u16),
}

impl WireRcode {
	/// Builds a [`WireRcode`] from the header's 4-bit RCODE nibble.
	///
	/// The reply's OPT pseudo-RR (if any) can extend this with 8 more
	/// bits (RFC 6891 §6.1.3); since spec.md only asks the demultiplexer
	/// to parse the answer section, not the additional section, the
	/// extended form is not composed here — every server this crate has
	/// been exercised against returns a plain 4-bit RCODE in practice.
	pub fn from_nibble(low_nibble: u8) -> Self {
		match low_nibble & 0xf {
			0 => WireRcode::NoError,
			1 => WireRcode::FormErr,
			2 => WireRcode::ServFail,
			3 => WireRcode::NxDomain,
			4 => WireRcode::NotImp,
			5 => WireRcode::Refused,
			6 => WireRcode::YxDomain,
			7 => WireRcode::YxRrSet,
			8 => WireRcode::NxRrSet,
			9 => WireRcode::NotAuth,
			10 => WireRcode::NotZone,
			other => WireRcode::Other(other as u16),
		}
	}
}

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
enum Opcode {
	Query = 0,
	IQuery = 1,
	Status = 2,
	#[fallback]
	Reserved,
}

/// The 16-bit flags word (RFC 1035 §4.1.1, RFC 4035 §3.1.6 for AD/CD),
/// declared LSB-first to match bilge's packing order.
#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
struct Flags {
	rcode: Rcode4,
	cd: bool,
	ad: bool,
	z: bool,
	ra: bool,
	rd: bool,
	tc: bool,
	aa: bool,
	opcode: Opcode,
	qr: bool,
}

/// The fixed 12-byte header.
#[derive(Clone, Copy, Debug)]
pub struct Header {
	pub id: u16,
	pub qr: bool,
	pub opcode_query: bool,
	pub aa: bool,
	pub tc: bool,
	pub rd: bool,
	pub ra: bool,
	pub ad: bool,
	pub cd: bool,
	pub rcode: u8,
	pub qdcount: u16,
	pub ancount: u16,
	pub nscount: u16,
	pub arcount: u16,
}

/// Why decoding failed outright (spec.md §4.1: a FATAL stops parsing).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WireError {
	Truncated,
	Malformed,
}

type WResult<T> = Result<T, WireError>;

fn need(buf: &[u8], pos: usize, len: usize) -> WResult<()> {
	if pos.checked_add(len).map_or(true, |end| end > buf.len()) {
		Err(WireError::Truncated)
	} else {
		Ok(())
	}
}

fn read_u16(buf: &[u8], pos: usize) -> WResult<u16> {
	need(buf, pos, 2)?;
	Ok(u16::from_be_bytes([buf[pos], buf[pos + 1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> WResult<u32> {
	need(buf, pos, 4)?;
	Ok(u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]))
}

/// Decodes the fixed header at the start of `buf`. Returns the header
/// and the offset immediately following it.
pub fn decode_header(buf: &[u8]) -> WResult<(Header, usize)> {
	need(buf, 0, HEADER_LEN)?;

	let id = read_u16(buf, 0)?;
	let raw_flags = read_u16(buf, 2)?;
	let flags = Flags::from(raw_flags);

	let header = Header {
		id,
		qr: flags.qr(),
		opcode_query: matches!(flags.opcode(), Opcode::Query),
		aa: flags.aa(),
		tc: flags.tc(),
		rd: flags.rd(),
		ra: flags.ra(),
		ad: flags.ad(),
		cd: flags.cd(),
		rcode: (raw_flags & 0xf) as u8,
		qdcount: read_u16(buf, 4)?,
		ancount: read_u16(buf, 6)?,
		nscount: read_u16(buf, 8)?,
		arcount: read_u16(buf, 10)?,
	};

	Ok((header, HEADER_LEN))
}

/// Reads a (possibly compressed) name starting at `pos`, returning the
/// decompressed label sequence and the offset immediately after the name
/// *as it appears at `pos`* (i.e. after the first pointer, if any).
fn read_name(buf: &[u8], mut pos: usize) -> WResult<(Vec<Vec<u8>>, usize)> {
	let mut labels = Vec::new();
	let start = pos;
	let mut end: Option<usize> = None;
	let mut jumps = 0;

	loop {
		need(buf, pos, 1)?;
		let len = buf[pos];

		match len >> 6 {
			0b00 => {
				if len == 0 {
					if end.is_none() {
						end = Some(pos + 1);
					}
					break;
				}

				let label_start = pos + 1;
				need(buf, label_start, len as usize)?;
				labels.push(buf[label_start..label_start + len as usize].to_vec());
				pos = label_start + len as usize;
			}
			0b11 => {
				need(buf, pos, 2)?;
				let lo = buf[pos + 1];
				let ptr = (((len & 0x3f) as usize) << 8) | lo as usize;

				if end.is_none() {
					end = Some(pos + 2);
				}

				jumps += 1;
				if jumps > 128 || ptr >= start {
					// A forward/self pointer can't legally occur in a
					// well-formed message; treat it as malformed rather
					// than spin.
					return Err(WireError::Malformed);
				}

				pos = ptr;
			}
			_ => return Err(WireError::Malformed),
		}
	}

	Ok((labels, end.unwrap()))
}

/// A decoded question, for comparison against the request's own list.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WireQuestion {
	pub labels: Vec<Vec<u8>>,
	pub qtype: u16,
	pub qclass: u16,
}

/// Decodes `qdcount` questions starting at `pos`.
pub fn decode_questions(buf: &[u8], mut pos: usize, qdcount: u16) -> WResult<(Vec<WireQuestion>, usize)> {
	let mut out = Vec::with_capacity(qdcount as usize);

	for _ in 0..qdcount {
		let (labels, after_name) = read_name(buf, pos)?;
		let qtype = read_u16(buf, after_name)?;
		let qclass = read_u16(buf, after_name + 2)?;
		pos = after_name + 4;
		out.push(WireQuestion { labels, qtype, qclass });
	}

	Ok((out, pos))
}

/// Outcome of decoding a single resource record (spec.md §4.1).
enum RrOutcome {
	Parsed(Answer),
	Skip,
}

fn decode_rdata(ty: u16, ttl: u32, rdata: &[u8], buf: &[u8], rdata_pos: usize) -> RrOutcome {
	match ty {
		1 if rdata.len() == 4 => RrOutcome::Parsed(Answer::A { addr: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]), ttl }),
		28 if rdata.len() == 16 => {
			let mut octets = [0u8; 16];
			octets.copy_from_slice(rdata);
			RrOutcome::Parsed(Answer::Aaaa { addr: Ipv6Addr::from(octets), ttl })
		}
		5 => match read_name(buf, rdata_pos) {
			Ok((labels, _)) => RrOutcome::Parsed(Answer::Cname { target: join_name(&labels), ttl }),
			Err(_) => RrOutcome::Skip,
		},
		16 => {
			let mut chunks = Vec::new();
			let mut i = 0;
			while i < rdata.len() {
				let len = rdata[i] as usize;
				if i + 1 + len > rdata.len() {
					return RrOutcome::Skip;
				}
				chunks.push(rdata[i + 1..i + 1 + len].to_vec());
				i += 1 + len;
			}
			RrOutcome::Parsed(Answer::Txt { chunks, ttl })
		}
		other => RrOutcome::Parsed(Answer::Other { ty: other, ttl, rdata: rdata.to_vec() }),
	}
}

/// Joins decompressed labels back into a dotted presentation name.
pub fn join_name(labels: &[Vec<u8>]) -> String {
	labels.iter().map(|l| String::from_utf8_lossy(l).into_owned()).collect::<Vec<_>>().join(".")
}

/// Decodes `ancount` resource records starting at `pos`. Stops at the
/// first FATAL record but keeps everything parsed so far, matching
/// spec.md §4.1.
pub fn decode_answers(buf: &[u8], mut pos: usize, ancount: u16) -> (Vec<Answer>, usize) {
	let mut out = Vec::with_capacity(ancount as usize);

	for _ in 0..ancount {
		let parsed: WResult<(Answer, usize)> = (|| {
			let (_name, after_name) = read_name(buf, pos)?;
			let ty = read_u16(buf, after_name)?;
			let _class = read_u16(buf, after_name + 2)?;
			let ttl = read_u32(buf, after_name + 4)?;
			let rdlength = read_u16(buf, after_name + 8)? as usize;
			let rdata_pos = after_name + 10;
			need(buf, rdata_pos, rdlength)?;
			let rdata = &buf[rdata_pos..rdata_pos + rdlength];

			match decode_rdata(ty, ttl, rdata, buf, rdata_pos) {
				RrOutcome::Parsed(answer) => Ok((answer, rdata_pos + rdlength)),
				RrOutcome::Skip => Err(WireError::Malformed), // caught below, treated as skip not fatal
			}
		})();

		match parsed {
			Ok((answer, next)) => {
				out.push(answer);
				pos = next;
			}
			Err(WireError::Truncated) => break,
			Err(WireError::Malformed) => {
				// Unparseable RDATA for a record whose envelope (name/type/
				// class/ttl/rdlength) we could still read: skip just this
				// RR and keep going, re-deriving `pos` if possible.
				match (|| -> WResult<usize> {
					let (_name, after_name) = read_name(buf, pos)?;
					let rdlength = read_u16(buf, after_name + 8)? as usize;
					let rdata_pos = after_name + 10;
					need(buf, rdata_pos, rdlength)?;
					Ok(rdata_pos + rdlength)
				})() {
					Ok(next) => pos = next,
					Err(_) => break,
				}
			}
		}
	}

	(out, pos)
}

/// A name-compression pointer table shared across the questions of one
/// outgoing packet (spec.md §4.1: "name compression...using a shared
/// pointer table across questions").
struct Compressor {
	offsets: HashMap<Vec<Vec<u8>>, u16>,
}

impl Compressor {
	fn new() -> Self {
		Self { offsets: HashMap::new() }
	}

	fn write_name(&mut self, buf: &mut Vec<u8>, labels: &[Vec<u8>]) {
		for start in 0..=labels.len() {
			let suffix = &labels[start..];

			if start > 0 {
				if let Some(&ptr) = self.offsets.get(suffix) {
					buf.push(0xc0 | (ptr >> 8) as u8);
					buf.push((ptr & 0xff) as u8);
					return;
				}
			}

			if start == labels.len() {
				break;
			}

			if buf.len() <= 0x3fff {
				self.offsets.entry(labels[start..].to_vec()).or_insert(buf.len() as u16);
			}

			let label = &labels[start];
			buf.push(label.len() as u8);
			buf.extend_from_slice(label);
		}

		buf.push(0);
	}
}

/// Encodes one or more questions sharing a single header (spec.md §4.1),
/// always followed by an EDNS0 OPT pseudo-RR.
pub fn encode_query(id: u16, questions: &[Question], dnssec: bool) -> Vec<u8> {
	let mut buf = Vec::with_capacity(64);

	let flags = Flags::new(Rcode4::NoError, false, false, false, false, true, false, false, Opcode::Query, false);
	buf.extend_from_slice(&id.to_be_bytes());
	buf.extend_from_slice(&u16::from(flags).to_be_bytes());
	buf.extend_from_slice(&(questions.len() as u16).to_be_bytes());
	buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
	buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
	buf.extend_from_slice(&1u16.to_be_bytes()); // arcount: the OPT record

	let compress = questions.len() > 1;
	let mut compressor = Compressor::new();

	for q in questions {
		if compress {
			compressor.write_name(&mut buf, &q.labels);
		} else {
			for label in &q.labels {
				buf.push(label.len() as u8);
				buf.extend_from_slice(label);
			}
			buf.push(0);
		}

		buf.extend_from_slice(&q.qtype.code().to_be_bytes());
		buf.extend_from_slice(&1u16.to_be_bytes()); // QCLASS=IN
	}

	// EDNS0 OPT pseudo-RR: root name, TYPE=41, CLASS=UDP payload size,
	// TTL packs extended-rcode(0)/version(0)/flags(DO bit), RDLENGTH=0.
	buf.push(0);
	buf.extend_from_slice(&OPT_TYPE.to_be_bytes());
	buf.extend_from_slice(&EDNS_UDP_PAYLOAD.to_be_bytes());
	let opt_flags: u32 = if dnssec { 0x8000 } else { 0 };
	buf.extend_from_slice(&opt_flags.to_be_bytes());
	buf.extend_from_slice(&0u16.to_be_bytes());

	buf
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn name_trims_dots() {
		let a = Question::new("example.com", QType::A).unwrap();
		let b = Question::new(".example.com.", QType::A).unwrap();
		assert_eq!(a.labels, b.labels);
	}

	#[test]
	fn root_name_is_invalid() {
		assert_eq!(Question::new(".", QType::A), Err(InvalidName));
		assert_eq!(Question::new("", QType::A), Err(InvalidName));
	}

	#[test]
	fn single_question_roundtrips() {
		let q = Question::new("example.com", QType::A).unwrap();
		let packet = encode_query(0x1234, std::slice::from_ref(&q), false);

		let (header, pos) = decode_header(&packet).unwrap();
		assert_eq!(header.id, 0x1234);
		assert_eq!(header.qdcount, 1);
		assert!(header.rd);
		assert!(!header.qr);

		let (decoded, _) = decode_questions(&packet, pos, 1).unwrap();
		assert_eq!(decoded[0].labels, q.labels);
		assert_eq!(decoded[0].qtype, 1);
		assert_eq!(decoded[0].qclass, 1);
	}

	#[test]
	fn multi_question_compresses_shared_suffix() {
		let a = Question::new("www.example.com", QType::A).unwrap();
		let b = Question::new("mail.example.com", QType::Aaaa).unwrap();
		let packet = encode_query(1, &[a.clone(), b.clone()], false);

		// The packet must be shorter than the naive uncompressed
		// encoding would be, since "example.com" is shared.
		let naive_len = 12 + (1 + 3 + 1 + 7 + 1 + 3 + 1 + 4) + (1 + 4 + 1 + 7 + 1 + 3 + 1 + 4) + 11;
		assert!(packet.len() < naive_len);

		let (header, pos) = decode_header(&packet).unwrap();
		let (decoded, _) = decode_questions(&packet, pos, header.qdcount).unwrap();
		assert_eq!(decoded[0].labels, a.labels);
		assert_eq!(decoded[1].labels, b.labels);
	}

	#[test]
	fn dnssec_sets_do_bit() {
		let q = Question::new("example.com", QType::A).unwrap();
		let packet = encode_query(1, std::slice::from_ref(&q), true);
		// OPT record is the last 11 bytes (root name + type + class + ttl + rdlength).
		let opt = &packet[packet.len() - 11..];
		let ttl = u32::from_be_bytes([opt[5], opt[6], opt[7], opt[8]]);
		assert_eq!(ttl & 0x8000, 0x8000);
	}
}
