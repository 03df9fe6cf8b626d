//! A single in-flight resolution attempt (spec.md §3, §4.5).

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;

use log::{debug, warn};

use crate::adapter::TimerHandle;
use crate::channel::Channel;
use crate::error::Reply;
use crate::wire::Question;
use crate::ResolverInner;

/// Where a [`Request`] sits in its own lifecycle.
///
/// Grounded on spec.md §4.5's state machine; the teacher's `dns::Entry`
/// has no equivalent (it only ever has one in-flight attempt with a
/// single retry timer) since it neither fails over between servers nor
/// upgrades to TCP.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestState {
	/// Constructed, not yet handed to a channel.
	New,
	/// A send attempt hit `EWOULDBLOCK`; waiting for the channel's
	/// writable event before the query actually goes out.
	WaitSend,
	/// Sent over UDP; the retransmit timer is armed.
	WaitReply,
	/// Upgraded to TCP after a truncated UDP reply, or because the
	/// caller forced TCP up front.
	Tcp,
	/// Satisfied from the fake-reply table; delivered on the next timer
	/// tick with no network I/O (spec.md §4.7).
	Fake,
	/// Terminal: the completion callback has been invoked.
	Replied,
}

pub struct Request {
	/// One or more questions sent together in a single packet (spec.md
	/// §6.5 `make_request(..., (name, type)...)`, generalized per §9's
	/// "variadic request construction" note into an ordered slice).
	pub questions: Vec<Question>,
	pub dnssec: bool,
	pub state: RequestState,

	/// Indices into the resolver's configured server list, in the order
	/// this request will try them (spec.md §6.2: either the default
	/// priority order or an [`Upstream`](crate::adapter::Upstream)
	/// override).
	pub server_order: Vec<usize>,
	/// Position of the server currently (or most recently) in use.
	pub server_pos: usize,

	pub channel: Option<Rc<RefCell<Channel>>>,
	/// The transaction ID allocated on `channel`, if any.
	pub id: Option<u16>,

	/// Per-attempt timeout, armed on every send and re-armed on every
	/// retransmit/failover/TCP-upgrade (spec.md §3, §5).
	pub timeout: Duration,
	/// Retransmits remaining, spanning every server this request tries
	/// (spec.md §4.5 `on_timer`: "decrement retransmits... if
	/// retransmits == 0: fail with TIMEOUT"). Coerced to at least 1 by
	/// the constructor (spec.md §8: "retransmits=0 is coerced to 1").
	pub retransmits_left: u32,
	/// The single armed timer for this request, if any. Spec.md's C
	/// original keeps a retransmit timer and a reuses it across
	/// send/retransmit/renew transitions without ever risking two timers
	/// racing for the same request; this crate keeps that invariant
	/// explicit by disarming before every rearm rather than relying on
	/// "assert this path" (spec.md §9 Open Question) to keep it true.
	pub timer: Option<TimerHandle>,

	/// A pre-built reply waiting to be delivered once this request's
	/// `Fake` timer fires (spec.md §4.7).
	pub fake_reply: Option<Reply>,

	/// Intentional cycle back to the resolver (spec.md §9 design note):
	/// `Request` is only ever reached through `Resolver`/`Server`/
	/// `Channel`, all of which outlive any single request, so the extra
	/// strong count never keeps the resolver alive past its own
	/// explicit teardown.
	pub resolver: Rc<ResolverInner>,

	callback: Option<Box<dyn FnOnce(Reply)>>,
}

impl Request {
	pub fn new(
		resolver: Rc<ResolverInner>,
		questions: Vec<Question>,
		dnssec: bool,
		server_order: Vec<usize>,
		timeout: Duration,
		retransmits: u32,
		callback: Box<dyn FnOnce(Reply)>,
	) -> Self {
		Self {
			questions,
			dnssec,
			state: RequestState::New,
			server_order,
			server_pos: 0,
			channel: None,
			id: None,
			timeout,
			retransmits_left: retransmits.max(1),
			timer: None,
			fake_reply: None,
			resolver,
			callback: Some(callback),
		}
	}

	/// True when this request was constructed with a single, non-`ANY`
	/// question (spec.md §4.7: the fake-reply table's lookup only applies
	/// in this case).
	pub fn single_question(&self) -> Option<&Question> {
		match self.questions.as_slice() {
			[only] if !only.is_any() => Some(only),
			_ => None,
		}
	}

	/// The first requested question and whether the request as a whole is
	/// `ANY` (spec.md §4.4 step 4: NOREC synthesis checks only "the first
	/// requested type", for *any* request, not just single-question ones —
	/// unlike [`Request::single_question`], this does not require there to
	/// be exactly one question).
	pub fn first_question(&self) -> Option<&Question> {
		match self.questions.first() {
			Some(q) if !q.is_any() => Some(q),
			_ => None,
		}
	}

	pub fn current_server_index(&self) -> Option<usize> {
		self.server_order.get(self.server_pos).copied()
	}

	/// Advances to the next configured server, if any are left (spec.md
	/// §4.5 failover/renew, default priority-order path with no
	/// [`Upstream`](crate::adapter::Upstream) installed).
	pub fn advance_server(&mut self) -> bool {
		self.server_pos += 1;
		self.server_pos < self.server_order.len()
	}

	/// Binds this request's next attempt to `server_index`, appending it
	/// to the tried-server history (spec.md §6.2 `select_retransmit`: the
	/// adapter picks the next server dynamically rather than the request
	/// walking a list computed once at construction).
	pub fn set_next_server(&mut self, server_index: usize) {
		self.server_order.push(server_index);
		self.server_pos = self.server_order.len() - 1;
	}

	/// Delivers `reply` to the caller and marks the request terminal.
	/// Idempotent: a second call is a no-op (guards against a stray
	/// event reaching an already-replied request before its `Rc` is
	/// dropped from every pending table).
	pub fn complete(&mut self, reply: Reply) {
		if self.state == RequestState::Replied {
			debug!("request already replied to, dropping late completion");
			return;
		}

		self.state = RequestState::Replied;

		if let Some(cb) = self.callback.take() {
			cb(reply);
		} else {
			warn!("request reached completion twice without a callback");
		}
	}
}
