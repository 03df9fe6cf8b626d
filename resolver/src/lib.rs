//! An embeddable, single-threaded, recursive-client DNS resolver
//! (spec.md).
//!
//! This crate owns no event loop of its own: the host drives it by
//! implementing [`adapter::EventLoop`] and forwarding readable/
//! writable/timer/periodic notifications to [`Resolver::on_readable`]
//! and friends. Everything else — retransmission, UDP-to-TCP upgrade on
//! truncation, server failover, fake replies — happens inside a single
//! call stack rooted at one of those four entry points, with no locks
//! and no threads (spec.md §5).

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use log::{info, warn};

pub mod adapter;
pub mod channel;
mod engine;
pub mod error;
mod fake;
mod id;
pub mod request;
pub mod server;
pub mod wire;

pub use adapter::{EventLoop, PeriodicHandle, ReadHandle, RealTransport, TimerHandle, Transport, Upstream, WriteHandle};
pub use error::{Answer, Rcode, Reply};
pub use wire::{InvalidName, QType, WireRcode};

use adapter::EventCtx;
use channel::Channel;
use fake::FakeTable;
use request::Request;
use server::Server;

/// Shared state reachable from every [`Request`]/[`Channel`]/[`Server`]
/// in the graph. Requests hold a strong `Rc<ResolverInner>` (spec.md §9
/// design note): this closes a reference cycle
/// (`Resolver -> Server -> Channel -> Request -> Resolver`) that is
/// left uncollected by `Rc`'s refcounting, but deliberately so —
/// `Resolver` is a host-owned singleton torn down explicitly by
/// dropping every server (and, with it, every channel and in-flight
/// request), never expected to go out of scope on its own.
pub struct ResolverInner {
	pub(crate) event_loop: Rc<dyn EventLoop>,
	pub(crate) transport: Rc<dyn Transport>,
	upstream: RefCell<Option<Rc<dyn Upstream>>>,

	pub(crate) servers: RefCell<Vec<Rc<RefCell<Server>>>>,
	pub(crate) fake: RefCell<FakeTable>,

	pub(crate) reads: RefCell<HashMap<u64, Weak<RefCell<Channel>>>>,
	pub(crate) writes: RefCell<HashMap<u64, EventCtx>>,
	pub(crate) timers: RefCell<HashMap<u64, EventCtx>>,

	pub(crate) max_io_uses: Cell<u32>,
	dnssec: Cell<bool>,
}

/// The public handle to a resolver instance. Cheap to clone (it is
/// exactly one `Rc`); clones all refer to the same underlying state.
#[derive(Clone)]
pub struct Resolver(Rc<ResolverInner>);

impl Resolver {
	/// Creates a resolver driven by `event_loop`, using real nonblocking
	/// OS sockets for all I/O.
	pub fn new(event_loop: Rc<dyn EventLoop>) -> Self {
		Self::with_transport(event_loop, Rc::new(RealTransport))
	}

	/// Creates a resolver with a caller-supplied [`Transport`], for
	/// hosts that need to route DNS traffic somewhere other than a
	/// plain OS socket (spec.md §6.3).
	pub fn with_transport(event_loop: Rc<dyn EventLoop>, transport: Rc<dyn Transport>) -> Self {
		Self(Rc::new(ResolverInner {
			event_loop,
			transport,
			upstream: RefCell::new(None),
			servers: RefCell::new(Vec::new()),
			fake: RefCell::new(FakeTable::new()),
			reads: RefCell::new(HashMap::new()),
			writes: RefCell::new(HashMap::new()),
			timers: RefCell::new(HashMap::new()),
			max_io_uses: Cell::new(u32::MAX),
			dnssec: Cell::new(false),
		}))
	}

	/// Adds a configured upstream server, tried in ascending `priority`
	/// order (ties keep declaration order). `udp_count`/`tcp_count` size
	/// that server's channel pools (spec.md §3, §6.5). Returns the
	/// server's index, which an [`Upstream`] implementation can reorder
	/// per request.
	pub fn add_server(&self, name: impl Into<String>, addr: SocketAddr, priority: i32, udp_count: usize, tcp_count: usize) -> usize {
		let mut servers = self.0.servers.borrow_mut();
		servers.push(Rc::new(RefCell::new(Server::new(name.into(), addr, priority, udp_count, tcp_count))));
		servers.len() - 1
	}

	/// Installs a per-request server selection policy (spec.md §6.2).
	/// Replaces any previously registered plugin.
	pub fn register_plugin(&self, upstream: Rc<dyn Upstream>) {
		*self.0.upstream.borrow_mut() = Some(upstream);
	}

	/// Caps how many sends a single channel may serve before it is
	/// retired and replaced by a fresh socket (spec.md §6.5).
	pub fn set_max_io_uses(&self, max: u32) {
		self.0.max_io_uses.set(max);
	}

	/// Sets the default DNSSEC (`DO` bit) setting for requests that
	/// don't override it explicitly.
	pub fn set_dnssec(&self, enabled: bool) {
		self.0.dnssec.set(enabled);
	}

	/// Installs a canned reply for `name`/`qtype`, bypassing the
	/// network entirely (spec.md §4.7). Returns `false` if `name` is
	/// too long to ever be queried.
	pub fn set_fake_reply(&self, name: &str, qtype: QType, reply: Reply) -> bool {
		self.0.fake.borrow_mut().set(name, qtype, reply)
	}

	pub fn clear_fake_reply(&self, name: &str, qtype: QType) -> bool {
		self.0.fake.borrow_mut().clear(name, qtype)
	}

	/// Validates the resolver's configuration. Idempotent; safe to call
	/// more than once (e.g. after adding servers at runtime).
	pub fn init(&self) {
		if self.0.servers.borrow().is_empty() {
			warn!("resolver initialized with no configured servers");
		} else {
			info!("resolver initialized with {} server(s)", self.0.servers.borrow().len());
		}
	}

	fn default_server_order(&self) -> Vec<usize> {
		let servers = self.0.servers.borrow();
		let mut order: Vec<usize> = (0..servers.len()).collect();
		order.sort_by_key(|&i| servers[i].borrow().priority);
		order
	}

	/// Resolves one or more questions sent together in a single packet,
	/// invoking `callback` exactly once with the outcome (spec.md §6.5
	/// `make_request(..., timeout, repeats, nqueries, (name, type)…)`,
	/// §4.4-§4.7).
	///
	/// `dnssec` overrides [`Resolver::set_dnssec`] for this request only
	/// when `Some`. Returns `None` on any construction failure — an
	/// invalid name, an empty question list, or no server available to
	/// try — matching spec.md §6.5's "null on any construction failure"
	/// return-code semantics: the callback is never invoked in that
	/// case, since spec.md §5 only promises it fires "from an
	/// event-loop callback", which a request that was never actually
	/// started never reaches.
	pub fn make_request(
		&self,
		questions: &[(&str, QType)],
		timeout: Duration,
		retransmits: u32,
		dnssec: Option<bool>,
		callback: impl FnOnce(Reply) + 'static,
	) -> Option<Rc<RefCell<Request>>> {
		if questions.is_empty() {
			warn!("make_request called with no questions");
			return None;
		}

		let mut built = Vec::with_capacity(questions.len());
		for &(name, qtype) in questions {
			built.push(wire::Question::new(name, qtype).ok()?);
		}

		let dnssec = dnssec.unwrap_or(self.0.dnssec.get());

		if let [only] = built.as_slice() {
			if !only.is_any() {
				if let Some(reply) = engine::try_fake(&self.0, &built) {
					info!("serving {} {:?} from the fake-reply table", only.name, only.qtype);

					let request = Rc::new(RefCell::new(Request::new(
						self.0.clone(),
						built,
						dnssec,
						Vec::new(),
						timeout,
						retransmits,
						Box::new(callback),
					)));

					{
						let mut me = request.borrow_mut();
						me.state = request::RequestState::Fake;
						me.fake_reply = Some(reply);
					}

					engine::arm_fake_delivery(&self.0, &request);
					return Some(request);
				}
			}
		}

		let order = match &*self.0.upstream.borrow() {
			Some(upstream) => upstream.select(&built[0]).map_or_else(Vec::new, |idx| vec![idx]),
			None => self.default_server_order(),
		};

		if order.is_empty() {
			warn!("no server available to resolve {}", built[0].name);
			return None;
		}

		let request =
			Rc::new(RefCell::new(Request::new(self.0.clone(), built, dnssec, order, timeout, retransmits, Box::new(callback))));

		engine::dispatch(&self.0, &request, false);
		Some(request)
	}

	/// Must be called by the host whenever a handle returned by
	/// [`EventLoop::register_read`] becomes readable.
	pub fn on_readable(&self, handle: ReadHandle) {
		let channel = self.0.reads.borrow().get(&handle.0).cloned();
		if let Some(channel) = channel.and_then(|w| w.upgrade()) {
			Channel::handle_readable(&channel, &self.0);
		}
	}

	/// Must be called by the host whenever a handle returned by
	/// [`EventLoop::register_write`] becomes writable. The registration
	/// is one-shot and is removed here regardless of outcome.
	pub fn on_writable(&self, handle: WriteHandle) {
		let ctx = self.0.writes.borrow_mut().remove(&handle.0);

		if let Some(EventCtx::ChannelFlush(weak)) = ctx {
			if let Some(channel) = weak.upgrade() {
				Channel::handle_writable(&channel, &self.0);
			}
		}
	}

	/// Must be called by the host whenever a handle returned by
	/// [`EventLoop::set_timer`] fires.
	pub fn on_timer(&self, handle: TimerHandle) {
		let ctx = self.0.timers.borrow_mut().remove(&handle.0);

		match ctx {
			Some(EventCtx::RequestTimer(weak)) => {
				if let Some(request) = weak.upgrade() {
					engine::on_timer(&self.0, &request);
				}
			}
			Some(EventCtx::ChannelFlush(_)) | None => {}
		}
	}

	/// Must be called by the host whenever a handle returned by
	/// [`EventLoop::set_periodic`] ticks (spec.md §4.6).
	pub fn on_periodic(&self, _handle: PeriodicHandle) {
		engine::on_periodic(&self.0);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::cell::RefCell as StdRefCell;
	use std::rc::Rc as StdRc;

	/// A host event loop that never actually waits: timers and writes
	/// are recorded and fired only when the test explicitly asks to,
	/// via [`MockEventLoop::fire_timer`] etc. Grounded in shape on the
	/// teacher's own test doubles for `stakker` actors, replaced here
	/// with a plain handle-registry since this crate defines its own
	/// `EventLoop` trait.
	#[derive(Default)]
	struct MockEventLoop {
		next: Cell<u64>,
		reads: StdRefCell<Vec<u64>>,
		writes: StdRefCell<Vec<u64>>,
		timers: StdRefCell<Vec<u64>>,
	}

	impl MockEventLoop {
		fn fresh(&self) -> u64 {
			let id = self.next.get();
			self.next.set(id + 1);
			id
		}
	}

	impl EventLoop for MockEventLoop {
		fn register_read(&self, _fd: std::os::fd::RawFd) -> ReadHandle {
			let id = self.fresh();
			self.reads.borrow_mut().push(id);
			ReadHandle(id)
		}

		fn deregister_read(&self, handle: ReadHandle) {
			self.reads.borrow_mut().retain(|&h| h != handle.0);
		}

		fn register_write(&self, _fd: std::os::fd::RawFd) -> WriteHandle {
			let id = self.fresh();
			self.writes.borrow_mut().push(id);
			WriteHandle(id)
		}

		fn deregister_write(&self, handle: WriteHandle) {
			self.writes.borrow_mut().retain(|&h| h != handle.0);
		}

		fn set_timer(&self, _delay: core::time::Duration) -> TimerHandle {
			let id = self.fresh();
			self.timers.borrow_mut().push(id);
			TimerHandle(id)
		}

		fn cancel_timer(&self, handle: TimerHandle) {
			self.timers.borrow_mut().retain(|&h| h != handle.0);
		}

		fn set_periodic(&self, _interval: core::time::Duration) -> PeriodicHandle {
			PeriodicHandle(self.fresh())
		}

		fn cancel_periodic(&self, _handle: PeriodicHandle) {}
	}

	impl MockEventLoop {
		/// The most recently issued (and still armed) timer handle, so a
		/// test can fire it without the resolver exposing its internal
		/// handle table.
		fn last_timer(&self) -> TimerHandle {
			TimerHandle(*self.timers.borrow().last().expect("no timer armed"))
		}

		/// The most recently issued read registration, so a test can
		/// simulate the host's event loop observing a socket go readable.
		fn last_read(&self) -> ReadHandle {
			ReadHandle(*self.reads.borrow().last().expect("no read interest registered"))
		}
	}

	#[test]
	fn fake_reply_is_delivered_asynchronously_through_the_event_loop() {
		let event_loop = StdRc::new(MockEventLoop::default());
		let resolver = Resolver::new(event_loop.clone());

		resolver.set_fake_reply(
			"example.com",
			QType::A,
			Reply {
				rcode: Rcode::NOERROR,
				authenticated: false,
				truncated: false,
				answers: vec![Answer::A { addr: "93.184.216.34".parse().unwrap(), ttl: 60 }],
			},
		);

		let got = StdRc::new(StdRefCell::new(None));
		let got2 = got.clone();

		let request = resolver
			.make_request(&[("example.com", QType::A)], Duration::from_secs(1), 2, None, move |reply| {
				*got2.borrow_mut() = Some(reply);
			})
			.expect("fake-reply lookups still hand back a live request handle");

		assert_eq!(request.borrow().state, request::RequestState::Fake);
		assert!(got.borrow().is_none(), "callback must not fire synchronously from make_request");

		resolver.on_timer(event_loop.last_timer());

		let reply = got.borrow_mut().take().expect("callback fires once the deferred timer is driven");
		assert_eq!(reply.rcode, Rcode::NOERROR);
		assert_eq!(reply.answers.len(), 1);
	}

	#[test]
	fn no_servers_configured_returns_none_without_invoking_the_callback() {
		let resolver = Resolver::new(StdRc::new(MockEventLoop::default()));

		let result = resolver.make_request(&[("example.org", QType::Aaaa)], Duration::from_secs(1), 2, None, |_| unreachable!());

		assert!(result.is_none());
	}

	#[test]
	fn invalid_name_is_rejected_before_touching_the_network() {
		let resolver = Resolver::new(StdRc::new(MockEventLoop::default()));
		let result = resolver.make_request(&[("", QType::A)], Duration::from_secs(1), 2, None, |_| unreachable!());
		assert!(result.is_none());
	}

	#[test]
	fn retransmits_of_zero_is_coerced_to_one() {
		let resolver = Resolver::new(StdRc::new(MockEventLoop::default()));
		resolver.add_server("a", "127.0.0.1:5300".parse().unwrap(), 0, 1, 1);

		let request = resolver
			.make_request(&[("example.com", QType::A)], Duration::from_millis(50), 0, None, |_| {})
			.expect("a configured server yields a live request");

		assert_eq!(request.borrow().retransmits_left, 1);
	}

	/// End-to-end over real loopback sockets (spec.md §8 scenario 1): a
	/// canned NOERROR/A reply, echoed with the query's own transaction ID
	/// and question, is matched, decoded, and delivered through the
	/// callback with no mocking below the socket layer.
	#[test]
	fn udp_round_trip_delivers_the_matching_answer() {
		use std::net::{Ipv4Addr, UdpSocket};
		use std::time::Duration as StdDuration;

		let _ = env_logger::try_init();

		let event_loop = StdRc::new(MockEventLoop::default());
		let resolver = Resolver::new(event_loop.clone());

		let fake_server = UdpSocket::bind("127.0.0.1:0").expect("bind a loopback UDP socket to stand in for a server");
		let server_addr = fake_server.local_addr().unwrap();
		fake_server.set_read_timeout(Some(StdDuration::from_secs(2))).unwrap();

		resolver.add_server("test", server_addr, 0, 1, 1);

		let got = StdRc::new(StdRefCell::new(None));
		let got2 = got.clone();

		let _request = resolver
			.make_request(&[("example.com", QType::A)], Duration::from_secs(5), 2, None, move |reply| {
				*got2.borrow_mut() = Some(reply);
			})
			.expect("a configured server yields a live request");

		let mut buf = [0u8; 512];
		let (n, query_from) = fake_server.recv_from(&mut buf).expect("the query reaches the fake server");

		let (header, pos) = wire::decode_header(&buf[..n]).unwrap();
		let (questions, _) = wire::decode_questions(&buf[..n], pos, header.qdcount).unwrap();
		assert_eq!(header.qdcount, 1);

		// A canned NOERROR reply: header (QR=1, RD=1, RA=1), the echoed
		// question, and one A record pointing back at the question name.
		let mut reply = Vec::new();
		reply.extend_from_slice(&header.id.to_be_bytes());
		reply.extend_from_slice(&0x8180u16.to_be_bytes());
		reply.extend_from_slice(&1u16.to_be_bytes()); // qdcount
		reply.extend_from_slice(&1u16.to_be_bytes()); // ancount
		reply.extend_from_slice(&0u16.to_be_bytes()); // nscount
		reply.extend_from_slice(&0u16.to_be_bytes()); // arcount
		for label in &questions[0].labels {
			reply.push(label.len() as u8);
			reply.extend_from_slice(label);
		}
		reply.push(0);
		reply.extend_from_slice(&1u16.to_be_bytes()); // qtype A
		reply.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
		reply.extend_from_slice(&[0xc0, 0x0c]); // name: pointer back to offset 12
		reply.extend_from_slice(&1u16.to_be_bytes()); // type A
		reply.extend_from_slice(&1u16.to_be_bytes()); // class IN
		reply.extend_from_slice(&3600u32.to_be_bytes()); // ttl
		reply.extend_from_slice(&4u16.to_be_bytes()); // rdlength
		reply.extend_from_slice(&[93, 184, 216, 34]);

		fake_server.send_to(&reply, query_from).expect("reply makes it back over loopback");
		std::thread::sleep(StdDuration::from_millis(20));

		resolver.on_readable(event_loop.last_read());

		let reply = got.borrow_mut().take().expect("callback fires once the reply is demultiplexed");
		assert_eq!(reply.rcode, Rcode::NOERROR);
		assert_eq!(reply.answers.len(), 1);
		match &reply.answers[0] {
			Answer::A { addr, ttl } => {
				assert_eq!(*addr, Ipv4Addr::new(93, 184, 216, 34));
				assert_eq!(*ttl, 3600);
			}
			other => panic!("expected an A record, got {other:?}"),
		}
	}

	/// Failover and eventual timeout across two silent servers (spec.md
	/// §8 scenario 4, generalized to two retransmits): the first timer
	/// expiry fails over to the second configured server rather than
	/// retrying the first, and the second expiry exhausts retransmits.
	#[test]
	fn timer_expiry_fails_over_then_times_out_across_two_servers() {
		use std::net::UdpSocket;

		let _ = env_logger::try_init();

		let event_loop = StdRc::new(MockEventLoop::default());
		let resolver = Resolver::new(event_loop.clone());

		// Bind momentarily to grab two free loopback ports with nothing
		// listening on them; UDP sends there succeed (fire-and-forget) but
		// no reply ever arrives.
		let a = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
		let b = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

		resolver.add_server("a", a, 0, 1, 1);
		resolver.add_server("b", b, 1, 1, 1);

		let got = StdRc::new(StdRefCell::new(None));
		let got2 = got.clone();

		let request = resolver
			.make_request(&[("example.com", QType::A)], Duration::from_millis(10), 2, None, move |reply| {
				*got2.borrow_mut() = Some(reply);
			})
			.expect("two configured servers yield a live request");

		assert_eq!(request.borrow().retransmits_left, 2);

		resolver.on_timer(event_loop.last_timer());
		assert!(got.borrow().is_none(), "one retransmit remains after the first expiry");
		assert_eq!(request.borrow().retransmits_left, 1);

		resolver.on_timer(event_loop.last_timer());

		let reply = got.borrow_mut().take().expect("callback fires once retransmits are exhausted");
		assert_eq!(reply.rcode, Rcode::Timeout);
	}
}
