//! Request dispatch, retransmission, and reply demultiplexing (spec.md
//! §4.4, §4.5, §4.6). This is the part of the crate with no teacher
//! counterpart at all — the teacher's `dns::Resolver` only ever tracks
//! one attempt per request against one fixed server — so it is built
//! directly from spec.md, in the surrounding modules' idiom (`Rc<dyn
//! EventLoop>`, `log` call sites, `io::Result` for internal plumbing)
//! rather than grounded on a specific teacher file.

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;

use log::{debug, warn};

use crate::adapter::{EventCtx, FailReason};
use crate::channel::{Channel, SendOutcome};
use crate::error::{Rcode, Reply};
use crate::request::{Request, RequestState};
use crate::server::Server;
use crate::wire;
use crate::ResolverInner;

fn encode(request: &Request) -> Vec<u8> {
	wire::encode_query(request.id.expect("id allocated before encoding"), &request.questions, request.dnssec)
}

fn rearm_timer_after(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>, ctx: EventCtx, delay: Duration) {
	let mut me = request.borrow_mut();

	if let Some(old) = me.timer.take() {
		resolver.event_loop.cancel_timer(old);
		resolver.timers.borrow_mut().remove(&old.0);
	}

	let handle = resolver.event_loop.set_timer(delay);
	resolver.timers.borrow_mut().insert(handle.0, ctx);
	me.timer = Some(handle);
}

fn rearm_timer(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>, ctx: EventCtx) {
	let delay = request.borrow().timeout;
	rearm_timer_after(resolver, request, ctx, delay);
}

fn disarm_timer(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>) {
	if let Some(handle) = request.borrow_mut().timer.take() {
		resolver.event_loop.cancel_timer(handle);
		resolver.timers.borrow_mut().remove(&handle.0);
	}
}

/// Removes `request` from whichever channel it is currently pending on.
fn unlink(request: &Rc<RefCell<Request>>) {
	let channel = request.borrow_mut().channel.take();
	if let Some(channel) = channel {
		if let Some(id) = request.borrow().id {
			channel.borrow_mut().take_pending(id);
		}
	}
}

fn notify_ok(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>) {
	if let Some(idx) = request.borrow().current_server_index() {
		if let Some(upstream) = &*resolver.upstream.borrow() {
			upstream.ok(idx);
		}
	}
}

fn notify_fail(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>, reason: FailReason) {
	if let Some(idx) = request.borrow().current_server_index() {
		if let Some(upstream) = &*resolver.upstream.borrow() {
			upstream.fail(idx, reason);
		}
	}
}

fn finish(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>, reply: Reply) {
	unlink(request);
	disarm_timer(resolver, request);
	request.borrow_mut().complete(reply);
}

/// Starts (or restarts, on failover/renew) a request against its
/// current server (spec.md §4.5). `renew` is true for every attempt
/// past the first on a given server/channel binding: it selects a
/// fresh, uniformly random channel rather than the load-balanced pick
/// [`Server::udp_channel`] makes for a brand new request (spec.md
/// §4.5 `on_timer`: "pick a random channel on that server").
pub fn dispatch(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>, renew: bool) {
	let server_idx = request.borrow().current_server_index();

	let Some(server_idx) = server_idx else {
		finish(resolver, request, Reply::servfail());
		return;
	};

	let server = resolver.servers.borrow().get(server_idx).cloned();

	let Some(server) = server else {
		finish(resolver, request, Reply::servfail());
		return;
	};

	let wants_tcp = request.borrow().state == RequestState::Tcp;

	let channel = if wants_tcp {
		Server::random_tcp_channel(&server, resolver)
	} else if renew {
		Server::random_udp_channel(&server, resolver)
	} else {
		Server::udp_channel(&server, resolver)
	};

	let channel = match channel {
		Ok(c) => c,
		Err(err) => {
			warn!("failed to open {} channel to {}: {err}", if wants_tcp { "TCP" } else { "UDP" }, server.borrow().name);
			fail_over_or_finish(resolver, request, FailReason::NetErr);
			return;
		}
	};

	let id = match channel.borrow_mut().alloc_id() {
		Some(id) => id,
		None => {
			warn!("exhausted transaction ID space on channel to {}", server.borrow().name);
			fail_over_or_finish(resolver, request, FailReason::NetErr);
			return;
		}
	};

	{
		let mut me = request.borrow_mut();
		me.id = Some(id);
		me.channel = Some(channel.clone());
		me.state = if wants_tcp { RequestState::Tcp } else { RequestState::WaitReply };
	}

	send_and_arm(resolver, &channel, request);
}

/// Encodes the current packet and attempts to send it on `channel`,
/// setting the request's state and timer from the outcome (spec.md
/// §4.2, §4.5).
fn send_and_arm(resolver: &Rc<ResolverInner>, channel: &Rc<RefCell<Channel>>, request: &Rc<RefCell<Request>>) {
	let buf = encode(&request.borrow());

	match Channel::send(channel, resolver, request, buf) {
		Ok(SendOutcome::Sent) => {
			if request.borrow().state != RequestState::Tcp {
				request.borrow_mut().state = RequestState::WaitReply;
			}
			let ctx = EventCtx::RequestTimer(Rc::downgrade(request));
			rearm_timer(resolver, request, ctx);
		}
		Ok(SendOutcome::Pending) => {
			// TCP's `Tcp` state already covers "queued, not yet sent" (it
			// has no separate wait-to-flush sub-state the way UDP's
			// `WaitSend` does), so only a UDP request is actually moved.
			if request.borrow().state != RequestState::Tcp {
				request.borrow_mut().state = RequestState::WaitSend;
			}
			let ctx = EventCtx::RequestTimer(Rc::downgrade(request));
			rearm_timer(resolver, request, ctx);
		}
		Err(err) => {
			warn!("send failed: {err}");
			fail_over_or_finish(resolver, request, FailReason::NetErr);
		}
	}
}

/// Re-attempts a send on the request's *current* channel and ID,
/// without picking a new server (spec.md §4.5: "retransmit on same
/// channel" when it is still active and more than one server is not
/// configured, or always for an `EWOULDBLOCK` retry driven by a
/// writable event).
pub fn retransmit(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>) {
	let channel = request.borrow().channel.clone();
	let Some(channel) = channel else { return };
	send_and_arm(resolver, &channel, request);
}

/// The per-request timer fired (spec.md §4.5 `on_timer`). Unified
/// across `WAIT_SEND`, `WAIT_REPLY` and `TCP` states: a timer is always
/// kept armed while a request is outstanding (see
/// [`rearm_timer`]/[`disarm_timer`]), so the "EAGAIN defers by arming a
/// writable event but does not cancel the still-armed timer" open
/// question from spec.md §9 cannot arise here — there is exactly one
/// timer slot per request, always disarmed before being rearmed, and it
/// keeps advancing `retransmits_left` regardless of whether the request
/// is mid-`WAIT_SEND` or already `WAIT_REPLY`.
pub fn on_timer(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>) {
	request.borrow_mut().timer = None;

	if request.borrow().state == RequestState::Fake {
		let reply = request.borrow_mut().fake_reply.take().unwrap_or_else(Reply::servfail);
		finish(resolver, request, reply);
		return;
	}

	let remaining = {
		let mut me = request.borrow_mut();
		me.retransmits_left = me.retransmits_left.saturating_sub(1);
		me.retransmits_left
	};

	notify_fail(resolver, request, FailReason::Timeout);

	if request.borrow().state == RequestState::Tcp {
		debug!("TCP upgrade timed out, no retransmit over TCP");
		finish(resolver, request, Reply::timeout());
		return;
	}

	if remaining == 0 {
		debug!("retransmits exhausted, timing out");
		finish(resolver, request, Reply::timeout());
		return;
	}

	let channel_active = request.borrow().channel.as_ref().map_or(true, |c| c.borrow().active);
	let single_server = configured_server_count(resolver) <= 1;

	if !channel_active || single_server {
		retransmit(resolver, request);
	} else {
		fail_over_or_finish(resolver, request, FailReason::Timeout);
	}
}

/// How many servers are in play for the "is failover even worth trying"
/// check in [`on_timer`] (spec.md §4.5: "more than one server exists").
/// Deferred to the installed [`crate::adapter::Upstream`]'s own count
/// when one is configured (spec.md §6.2 `count(data)`), since an
/// adapter's live/weighted view of "how many servers" can differ from
/// the resolver's raw configured list.
fn configured_server_count(resolver: &Rc<ResolverInner>) -> usize {
	match &*resolver.upstream.borrow() {
		Some(upstream) => upstream.count(),
		None => resolver.servers.borrow().len(),
	}
}

/// Moves `request` to its next server, or completes it with a timeout/
/// network-error reply once no server is left to try (spec.md §4.5
/// failover/renew path). With an [`crate::adapter::Upstream`] installed,
/// the next server is chosen dynamically by
/// [`crate::adapter::Upstream::select_retransmit`] (spec.md §6.2) rather
/// than by walking a list computed once at construction.
fn fail_over_or_finish(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>, reason: FailReason) {
	unlink(request);

	let prev_index = request.borrow().current_server_index();

	let has_next = match (&*resolver.upstream.borrow(), prev_index) {
		(Some(upstream), Some(prev)) => {
			let question = request.borrow().questions[0].clone();
			match upstream.select_retransmit(&question, prev) {
				Some(next) => {
					request.borrow_mut().set_next_server(next);
					true
				}
				None => false,
			}
		}
		_ => request.borrow_mut().advance_server(),
	};

	if has_next {
		dispatch(resolver, request, true);
	} else {
		let reply = if reason == FailReason::NetErr { Reply::net_err() } else { Reply::timeout() };
		finish(resolver, request, reply);
	}
}

/// Upgrades `request` to TCP against the same server it just got a
/// truncated UDP reply from (spec.md §4.5 `reschedule_over_tcp`).
fn reschedule_over_tcp(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>) {
	unlink(request);
	request.borrow_mut().state = RequestState::Tcp;
	dispatch(resolver, request, true);
}

fn question_matches(header: &wire::Header, echoed: &[wire::WireQuestion], request: &Request) -> bool {
	if !header.qr || header.qdcount as usize != echoed.len() || echoed.len() != request.questions.len() {
		return false;
	}

	echoed.iter().zip(&request.questions).all(|(e, q)| e.labels == q.labels && e.qtype == q.qtype.code() && e.qclass == 1)
}

/// Demultiplexes one decoded message against `channel`'s pending table
/// and completes or reschedules the matching request (spec.md §4.4).
pub fn on_reply(resolver: &Rc<ResolverInner>, channel: &Rc<RefCell<Channel>>, buf: &[u8]) {
	let (header, pos) = match wire::decode_header(buf) {
		Ok(pair) => pair,
		Err(_) => {
			debug!("malformed DNS reply: header truncated");
			return;
		}
	};

	let request = channel.borrow().peek_pending(header.id).cloned();

	let Some(request) = request else {
		warn!("reply with unknown transaction id 0x{:04x}", header.id);
		return;
	};

	let (questions, pos) = match wire::decode_questions(buf, pos, header.qdcount) {
		Ok(pair) => pair,
		Err(_) => {
			debug!("malformed DNS reply: question section truncated");
			return;
		}
	};

	if !question_matches(&header, &questions, &request.borrow()) {
		warn!("reply question section did not echo the request; dropping");
		return;
	}

	channel.borrow_mut().take_pending(header.id);

	if header.tc && request.borrow().state != RequestState::Tcp {
		let server = request.borrow().current_server_index().and_then(|idx| resolver.servers.borrow().get(idx).cloned());

		match server {
			Some(server) if server.borrow().has_tcp_capacity() => {
				debug!("reply truncated, upgrading to TCP");
				reschedule_over_tcp(resolver, &request);
				return;
			}
			_ => {
				// spec.md §4.4 step 6: "If no TCP channel is available,
				// deliver the truncated reply as-is" — fall through to
				// normal completion below instead of upgrading.
				debug!("reply truncated but server has no TCP channels configured; delivering as-is");
			}
		}
	}

	let (answers, _) = wire::decode_answers(buf, pos, header.ancount);
	let rcode = Rcode::Wire(wire::WireRcode::from_nibble(header.rcode));

	let rcode = match (rcode, request.borrow().first_question()) {
		(Rcode::NOERROR, Some(question)) if !answers.iter().any(|a| a.ty() == question.qtype.code()) => {
			// spec.md §4.4: NOERROR with no entry matching the *first*
			// requested type (e.g. a CNAME-only reply to an A query) is
			// surfaced as a synthetic NOREC rather than an empty success.
			Rcode::NoRec
		}
		_ => rcode,
	};

	let reply = Reply { rcode, authenticated: header.ad, truncated: header.tc, answers };

	notify_ok(resolver, &request);
	finish(resolver, &request, reply);
}

/// A TCP framing error makes the whole connection unusable: every
/// pending request on it fails over or times out, matching spec.md
/// §4.2/§4.5 ("individual in-flight requests on that channel will
/// time out and retry per their state machine").
pub fn fail_channel(resolver: &Rc<ResolverInner>, channel: &Rc<RefCell<Channel>>) {
	Channel::close(channel, resolver);
	let pending = channel.borrow_mut().fail_all_pending();

	for request in pending {
		request.borrow_mut().channel = None;
		fail_over_or_finish(resolver, &request, FailReason::ChannelReset);
	}
}

/// Periodic housekeeping (spec.md §4.6): upstream rescan, idle-TCP
/// close, and UDP channel refresh for every configured server.
pub fn on_periodic(resolver: &Rc<ResolverInner>) {
	if let Some(upstream) = &*resolver.upstream.borrow() {
		upstream.rescan();
	}

	for server in resolver.servers.borrow().iter() {
		Server::close_idle_tcp(server, resolver);
		Server::refresh_uses(server, resolver);
	}
}

/// Arms the zero-delay timer that delivers a fake-table reply (spec.md
/// §4.7: "enqueued to fire on the next writable tick"). This crate has
/// no bare "next tick" primitive of its own — every deferred completion
/// already runs through the request's timer slot, so a zero-duration
/// timer is the faithful equivalent: the host's event loop still calls
/// back in, the callback still never fires synchronously from
/// `make_request`, and [`on_timer`] already knows to special-case
/// `RequestState::Fake`.
pub fn arm_fake_delivery(resolver: &Rc<ResolverInner>, request: &Rc<RefCell<Request>>) {
	let ctx = EventCtx::RequestTimer(Rc::downgrade(request));
	rearm_timer_after(resolver, request, ctx, Duration::ZERO);
}

/// Attempts a fake-reply lookup for a single, non-`ANY` question
/// (spec.md §4.7: "single-question-only lookup" — a multi-question
/// request never consults the table).
pub fn try_fake(resolver: &Rc<ResolverInner>, questions: &[wire::Question]) -> Option<Reply> {
	match questions {
		[only] if !only.is_any() => resolver.fake.borrow().lookup(&only.name, only.qtype),
		_ => None,
	}
}
