//! Resolution outcomes delivered through the completion callback.
//!
//! These are not `std::error::Error` — `NOERROR` is as much a member of
//! `Rcode` as `TIMEOUT` is. They are the caller-facing result of a
//! resolution attempt, matched against spec.md §7.

use core::net::{Ipv4Addr, Ipv6Addr};

/// A DNS response code, either passed through from the wire or
/// synthesized locally (see spec.md §7).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rcode {
	/// A code taken verbatim from a server's reply header.
	Wire(crate::wire::WireRcode),
	/// Synthetic: the server answered `NOERROR` but with no record of the
	/// first requested type (and the request was not `ANY`).
	NoRec,
	/// Synthetic: a permanent send error with no retransmits left.
	NetErr,
	/// Synthetic: retransmits exhausted, or a TCP upgrade attempt timed out.
	Timeout,
}

impl Rcode {
	/// The server-reported `NOERROR` shorthand.
	pub const NOERROR: Rcode = Rcode::Wire(crate::wire::WireRcode::NoError);

	/// Synthetic `SERVFAIL`, generated locally when no server could be
	/// selected for a request.
	pub const SERVFAIL: Rcode = Rcode::Wire(crate::wire::WireRcode::ServFail);

	/// Whether this outcome represents a successful, informative answer
	/// (as opposed to a transport-level failure).
	pub fn is_wire(&self) -> bool {
		matches!(self, Rcode::Wire(_))
	}
}

/// A single decoded answer record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Answer {
	A { addr: Ipv4Addr, ttl: u32 },
	Aaaa { addr: Ipv6Addr, ttl: u32 },
	Cname { target: String, ttl: u32 },
	Txt { chunks: Vec<Vec<u8>>, ttl: u32 },
	/// A record type this crate does not model the RDATA of; carried
	/// opaquely (spec.md §4.1: per-RR parse result `SKIP`).
	Other { ty: u16, ttl: u32, rdata: Vec<u8> },
}

impl Answer {
	pub fn ty(&self) -> u16 {
		match self {
			Answer::A { .. } => 1,
			Answer::Aaaa { .. } => 28,
			Answer::Cname { .. } => 5,
			Answer::Txt { .. } => 16,
			Answer::Other { ty, .. } => *ty,
		}
	}
}

/// The object delivered to a request's completion callback.
#[derive(Clone, Debug)]
pub struct Reply {
	pub rcode: Rcode,
	/// The header's AD bit (spec.md §1: "only the AD bit is surfaced").
	pub authenticated: bool,
	/// The header's TC bit, surfaced only when no TCP upgrade was possible.
	pub truncated: bool,
	pub answers: Vec<Answer>,
}

impl Reply {
	pub fn timeout() -> Self {
		Self { rcode: Rcode::Timeout, authenticated: false, truncated: false, answers: Vec::new() }
	}

	pub fn net_err() -> Self {
		Self { rcode: Rcode::NetErr, authenticated: false, truncated: false, answers: Vec::new() }
	}

	pub fn servfail() -> Self {
		Self { rcode: Rcode::SERVFAIL, authenticated: false, truncated: false, answers: Vec::new() }
	}
}
