//! Interfaces the host embedding this crate must implement (spec.md
//! §6.1-§6.3). None of these are implemented here — the crate only
//! consumes them, the way the teacher's `net` crate consumed `stakker`'s
//! actor traits rather than defining its own scheduler.

use core::time::Duration;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::fd::RawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::wire::Question;

/// An opaque token naming a registered read interest. Handed back to the
/// host's [`EventLoop`] impl on de-registration, and to the resolver's
/// own event entry points (`Resolver::on_readable`, etc.) to say which
/// registration fired.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ReadHandle(pub u64);

/// An opaque token naming a registered write interest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WriteHandle(pub u64);

/// An opaque token naming a one-shot timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerHandle(pub u64);

/// An opaque token naming a recurring timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PeriodicHandle(pub u64);

/// The host's event loop, modeled after a C `libevent`-style external
/// reactor: the resolver registers interest and gets back an opaque
/// handle; the host later calls the matching `Resolver::on_*` entry
/// point with that same handle when the event fires.
///
/// Handles are deliberately non-generic newtypes rather than an
/// associated type, so that `Channel`/`Request`/`Server` don't carry an
/// `EventLoop` type parameter through the whole crate — the resolver
/// only ever needs to hand a handle back to the host, never to inspect
/// it.
pub trait EventLoop {
	/// Registers interest in readability of `fd`. The host must call
	/// `Resolver::on_readable(handle)` whenever `fd` becomes readable,
	/// until [`EventLoop::deregister_read`] is called with the same
	/// handle.
	fn register_read(&self, fd: RawFd) -> ReadHandle;

	fn deregister_read(&self, handle: ReadHandle);

	/// Registers one-shot interest in writability of `fd`. The host
	/// calls `Resolver::on_writable(handle)` at most once, the next
	/// time `fd` is writable, then forgets the registration on its own.
	fn register_write(&self, fd: RawFd) -> WriteHandle;

	/// Cancels a write registration that has not yet fired.
	fn deregister_write(&self, handle: WriteHandle);

	/// Schedules a one-shot callback after `delay`. The host calls
	/// `Resolver::on_timer(handle)` exactly once, unless the timer is
	/// cancelled first.
	fn set_timer(&self, delay: Duration) -> TimerHandle;

	fn cancel_timer(&self, handle: TimerHandle);

	/// Schedules a callback every `interval` until cancelled. The host
	/// calls `Resolver::on_periodic(handle)` on each tick (spec.md §4.6:
	/// upstream re-scan, idle TCP close, channel refresh).
	fn set_periodic(&self, interval: Duration) -> PeriodicHandle;

	fn cancel_periodic(&self, handle: PeriodicHandle);
}

/// Why a request reported failure to the [`Upstream`] adapter (spec.md
/// §6.2 `fail(elt, data, reason)`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FailReason {
	/// A retransmit timer expired with no reply.
	Timeout,
	/// `send`/`connect` returned a permanent OS error.
	NetErr,
	/// The TCP connection the request was waiting on reset.
	ChannelReset,
}

/// Per-request server selection policy (spec.md §6.2): a fresh request
/// consults [`Upstream::select`] once; every failover consults
/// [`Upstream::select_retransmit`] again, given the server just tried, so
/// a weighted/live-health adapter can actually steer retries rather than
/// a request walking a list frozen at construction time.
///
/// `elt` in spec.md's C-shaped signatures is represented here as the
/// `usize` index of a server in the resolver's configured list (spec.md
/// §6.2: "Each `elt` carries a back-pointer to a server record").
///
/// Optional: a [`Resolver`](crate::Resolver) with no upstream installed
/// falls back to trying configured servers in declared priority order
/// and never calls any of these methods.
pub trait Upstream {
	/// Picks a server for a brand new request (spec.md §6.2 `select(name,
	/// len, data) -> elt | null`). Returning `None` is equivalent to
	/// refusing the query outright (construction fails, spec.md §6.5).
	fn select(&self, question: &Question) -> Option<usize>;

	/// Picks a server for a retry, given the one just tried (spec.md §6.2
	/// `select_retransmit(name, len, prev_elt, data) -> elt | null`).
	/// Returning `None` ends the request with a timeout/network-error
	/// reply rather than trying another server (spec.md §4.5 `on_timer`:
	/// "select a new server via upstream policy (retransmit variant)").
	fn select_retransmit(&self, question: &Question, prev_server_index: usize) -> Option<usize>;

	/// Called once a request's reply has been accepted from
	/// `server_index` (spec.md §4.4 step 5, §6.2 `ok(elt, data)`).
	fn ok(&self, server_index: usize) {
		let _ = server_index;
	}

	/// Called whenever an attempt against `server_index` did not pan
	/// out (spec.md §6.2 `fail(elt, data, reason)`).
	fn fail(&self, server_index: usize, reason: FailReason) {
		let (_, _) = (server_index, reason);
	}

	/// How many servers this adapter currently considers live/selectable
	/// (spec.md §6.2 `count(data)`). Consulted by [`crate::engine::on_timer`]
	/// in place of the resolver's raw server count when deciding whether a
	/// timed-out request has anywhere left to fail over to.
	fn count(&self) -> usize;

	/// Invoked on every upstream-rescan periodic tick (spec.md §4.6), so
	/// the adapter can refresh whatever liveness/weighting state it
	/// keeps. No-op by default.
	fn rescan(&self) {}
}

/// The socket backend a [`Channel`](crate::channel::Channel) sends and
/// receives through (spec.md §6.3).
///
/// A default implementation backed by `std::net::{UdpSocket,
/// TcpStream}` in nonblocking mode is used when no [`Transport`] is
/// installed; hosts that need to route resolver traffic through a
/// tunnel (as the teacher's virtual network stack did for WireGuard)
/// can supply their own.
pub trait Transport {
	/// Creates a nonblocking UDP socket bound to an ephemeral local
	/// port, ready to `send_to`/`recv_from` a server at `server`.
	fn udp_socket(&self, server: SocketAddr) -> std::io::Result<UdpSocket>;

	/// Opens a nonblocking TCP connection to `server`. The connection
	/// may still be in progress (`EINPROGRESS`/`WouldBlock`) when this
	/// returns; the channel waits for a writable event before treating
	/// it as established.
	fn tcp_connect(&self, server: SocketAddr) -> std::io::Result<TcpStream>;
}

/// The default [`Transport`]: plain nonblocking OS sockets.
pub struct RealTransport;

impl Transport for RealTransport {
	fn udp_socket(&self, server: SocketAddr) -> std::io::Result<UdpSocket> {
		let bind = match server {
			SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
			SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
		};

		let socket = UdpSocket::bind(bind)?;
		socket.set_nonblocking(true)?;
		Ok(socket)
	}

	fn tcp_connect(&self, server: SocketAddr) -> std::io::Result<TcpStream> {
		// `TcpStream::connect` blocks the whole thread until the
		// handshake completes or fails, which is unusable inside a
		// single-threaded event loop. `socket2::Socket` exposes the
		// nonblocking `connect` BSD sockets actually offer: the socket is
		// marked nonblocking *before* `connect(2)` is issued, so the call
		// returns immediately with `WouldBlock`/`EINPROGRESS` and the
		// handshake completes asynchronously, observed later as a
		// writable event (spec.md §4.2 "If the channel is not yet
		// CONNECTED, initiate connect; writable-readiness then
		// transitions through on_tcp_connect to CONNECTED").
		let domain = match server {
			SocketAddr::V4(_) => Domain::IPV4,
			SocketAddr::V6(_) => Domain::IPV6,
		};

		let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
		socket.set_nonblocking(true)?;

		match socket.connect(&server.into()) {
			Ok(()) => {}
			Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == std::io::ErrorKind::WouldBlock => {}
			Err(err) => return Err(err),
		}

		Ok(socket.into())
	}
}

/// Disambiguates which registration a fired event handle refers to,
/// replacing a compare-first-bytes-to-a-magic-tag discriminator with a
/// tagged variant passed alongside the handle (spec.md §9 design note).
///
/// Stored resolver-side in a handle-keyed table; the host never
/// constructs or inspects this, it only ever round-trips the handle.
#[derive(Clone)]
pub enum EventCtx {
	/// A channel's queued output is ready to flush.
	ChannelFlush(std::rc::Weak<core::cell::RefCell<crate::channel::Channel>>),
	/// A request's single timer fired: either a retransmit/failover/TCP
	/// timeout (spec.md §4.5) or a deferred fake-reply delivery (spec.md
	/// §4.7), distinguished at fire time by the request's own `state`.
	RequestTimer(std::rc::Weak<core::cell::RefCell<crate::request::Request>>),
}
