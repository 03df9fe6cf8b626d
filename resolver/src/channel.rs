//! A single UDP socket or TCP connection to one server, and the
//! requests currently pending on it (spec.md §4.2, §4.3).
//!
//! Grounded on the teacher's `udp::Socket`/`tcp` wrappers in spirit
//! (one socket, a queue of outbound frames, driven by readable/writable
//! events) but rebuilt over real nonblocking OS sockets instead of the
//! teacher's virtual userspace IP stack, per spec.md's explicit "real
//! socket semantics" requirement.

use core::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use utils::error::Ext;

use crate::adapter::{EventCtx, ReadHandle, WriteHandle};
use crate::id::IdGenerator;
use crate::request::Request;
use crate::wire::HEADER_LEN;
use crate::ResolverInner;

/// What happened when a send was attempted on a channel (spec.md §4.2,
/// §4.5). Lets the engine tell a completed send apart from one that is
/// merely queued behind a writable event, instead of folding both into
/// a bare `Ok(())` (the bug a prior pass of this crate had: a request
/// that hit `EWOULDBLOCK` never actually transitioned to `WAIT_SEND`,
/// so the writable-retry path in [`Channel::retry_pending_udp_sends`]
/// never found it).
pub enum SendOutcome {
	/// The bytes are on the wire (UDP) or queued and flushed (TCP).
	Sent,
	/// `EWOULDBLOCK`/`EINTR`: a writable event has been armed and the
	/// caller should move the request to `WAIT_SEND`.
	Pending,
}

/// Smallest length prefix that can possibly hold a well-formed DNS
/// message (spec.md §4.2: "fatal reset on length < DNS header size").
const MIN_TCP_FRAME: usize = HEADER_LEN;

/// Upper bound on a buffered TCP frame, matching the wire length
/// prefix's own range.
const MAX_TCP_FRAME: usize = u16::MAX as usize;

enum Kind {
	Udp { socket: std::net::UdpSocket, connected: bool },
	Tcp {
		stream: std::net::TcpStream,
		established: bool,
		inbuf: VecDeque<u8>,
		outbuf: VecDeque<u8>,
		/// Byte length (length prefix included) of each frame currently
		/// queued in `outbuf`, front-to-back, so `flush_tcp` can tell a
		/// frame boundary apart from a `write()` syscall boundary — the
		/// two don't line up when one `write()` spans several frames, or
		/// one frame's bytes are written across several `write()` calls.
		outbuf_frames: VecDeque<usize>,
	},
}

pub struct Channel {
	kind: Kind,
	pub server_addr: SocketAddr,
	pub server: Weak<RefCell<crate::server::Server>>,

	pending: HashMap<u16, Rc<RefCell<Request>>>,
	ids: IdGenerator,

	read_handle: Option<ReadHandle>,
	write_handle: Option<WriteHandle>,

	/// Sends completed on this channel, checked against
	/// [`ResolverInner::max_io_uses`] to decide when to retire it
	/// (spec.md §6.5 `set_max_io_uses`).
	pub uses: u32,

	/// Cleared once `uses` exceeds the configured ceiling (spec.md §3:
	/// "the channel is marked !ACTIVE and replaced with a fresh one at
	/// the next periodic tick; existing in-flight requests continue on
	/// it until drained"). A channel with `active == false` is never
	/// handed out to a new request but is not torn down while anything
	/// still references it.
	pub active: bool,
}

impl Channel {
	pub fn new_udp(socket: std::net::UdpSocket, server_addr: SocketAddr, server: Weak<RefCell<crate::server::Server>>) -> Self {
		Self {
			kind: Kind::Udp { socket, connected: false },
			server_addr,
			server,
			pending: HashMap::new(),
			ids: IdGenerator::new(),
			read_handle: None,
			write_handle: None,
			uses: 0,
			active: true,
		}
	}

	pub fn new_tcp(stream: std::net::TcpStream, server_addr: SocketAddr, server: Weak<RefCell<crate::server::Server>>) -> Self {
		Self {
			kind: Kind::Tcp {
				stream,
				established: false,
				inbuf: VecDeque::new(),
				outbuf: VecDeque::new(),
				outbuf_frames: VecDeque::new(),
			},
			server_addr,
			server,
			pending: HashMap::new(),
			ids: IdGenerator::new(),
			read_handle: None,
			write_handle: None,
			uses: 0,
			active: true,
		}
	}

	pub fn is_tcp(&self) -> bool {
		matches!(self.kind, Kind::Tcp { .. })
	}

	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}

	/// Allocates a fresh transaction ID unused on this channel.
	pub fn alloc_id(&mut self) -> Option<u16> {
		let pending = &self.pending;
		self.ids.next(|id| pending.contains_key(&id))
	}

	fn raw_fd(&self) -> std::os::fd::RawFd {
		use std::os::fd::AsRawFd;
		match &self.kind {
			Kind::Udp { socket, .. } => socket.as_raw_fd(),
			Kind::Tcp { stream, .. } => stream.as_raw_fd(),
		}
	}

	/// Registers this channel's socket for readability, once, the first
	/// time it has any traffic in flight.
	pub fn ensure_readable(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		let mut me = this.borrow_mut();
		if me.read_handle.is_some() {
			return;
		}

		let fd = me.raw_fd();
		let handle = resolver.event_loop.register_read(fd);
		resolver.reads.borrow_mut().insert(handle.0, Rc::downgrade(this));
		me.read_handle = Some(handle);
	}

	fn request_write_event(&mut self, this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		if self.write_handle.is_some() {
			return;
		}

		let fd = self.raw_fd();
		let handle = resolver.event_loop.register_write(fd);
		resolver.writes.borrow_mut().insert(handle.0, EventCtx::ChannelFlush(Rc::downgrade(this)));
		self.write_handle = Some(handle);
	}

	/// Registers `request` under a freshly allocated ID and attempts to
	/// send its query immediately.
	pub fn send(
		this: &Rc<RefCell<Self>>,
		resolver: &Rc<ResolverInner>,
		request: &Rc<RefCell<Request>>,
		buf: Vec<u8>,
	) -> io::Result<SendOutcome> {
		{
			let id = request.borrow().id.expect("id allocated before send");
			this.borrow_mut().pending.insert(id, request.clone());
		}

		Self::ensure_readable(this, resolver);

		enum Next {
			Done(io::Result<()>),
			NeedWriteEvent,
			Flush,
		}

		let next = {
			let mut me = this.borrow_mut();
			let server_addr = me.server_addr;

			match &mut me.kind {
				Kind::Udp { socket, connected } => match socket.send_to(&buf, server_addr) {
					Ok(_) => {
						if !*connected {
							*connected = socket.connect(server_addr).is_ok();
						}
						Next::Done(Ok(()))
					}
					Err(err) if err.kind() == io::ErrorKind::WouldBlock => Next::NeedWriteEvent,
					Err(err) => Next::Done(Err(err)),
				},
				Kind::Tcp { outbuf, outbuf_frames, established, .. } => {
					let frame_len = buf.len();
					outbuf.extend((frame_len as u16).to_be_bytes());
					outbuf.extend(buf);
					outbuf_frames.push_back(2 + frame_len);
					if *established {
						Next::Flush
					} else {
						Next::NeedWriteEvent
					}
				}
			}
		};

		match next {
			Next::Done(result) => result.map(|()| {
				this.borrow_mut().uses += 1;
				SendOutcome::Sent
			}),
			Next::NeedWriteEvent => {
				this.borrow_mut().request_write_event(this, resolver);
				Ok(SendOutcome::Pending)
			}
			Next::Flush => Self::flush_tcp(this, resolver).map(|()| SendOutcome::Sent),
		}
	}

	/// Drains as much of the TCP output queue as the socket will accept.
	/// `uses` is bumped once per fully-drained frame (spec.md §5: "the
	/// `uses` counter is bumped per bound request"), not once per
	/// `write()` syscall — a single `write()` can span several queued
	/// frames, and a single frame can take several partial `write()`s to
	/// drain, so the two don't correspond 1:1.
	fn flush_tcp(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) -> io::Result<()> {
		let mut me = this.borrow_mut();
		let Kind::Tcp { stream, outbuf, outbuf_frames, .. } = &mut me.kind else {
			return Ok(());
		};

		while !outbuf.is_empty() {
			let (front, _) = outbuf.as_slices();
			match stream.write(front) {
				Ok(0) => break,
				Ok(n) => {
					outbuf.drain(..n);

					let mut remaining = n;
					while remaining > 0 {
						let Some(front_len) = outbuf_frames.front_mut() else { break };
						if remaining < *front_len {
							*front_len -= remaining;
							remaining = 0;
						} else {
							remaining -= *front_len;
							outbuf_frames.pop_front();
							me.uses += 1;
						}
					}
				}
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
					drop(me);
					this.borrow_mut().request_write_event(this, resolver);
					return Ok(());
				}
				Err(err) => return Err(err),
			}
		}

		Ok(())
	}

	/// Handles a writable event: either the TCP connect attempt just
	/// completed, or there is queued output (UDP retry after
	/// `EWOULDBLOCK`, or a TCP flush) waiting for the socket to accept
	/// more bytes.
	pub fn handle_writable(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		this.borrow_mut().write_handle = None;

		let became_established = {
			let mut me = this.borrow_mut();
			if let Kind::Tcp { stream, established, .. } = &mut me.kind {
				if !*established {
					// A failed nonblocking connect surfaces as a
					// readable-and-writable socket error; peer_addr()
					// fails if the handshake never completed.
					*established = stream.peer_addr().is_ok();
					*established
				} else {
					false
				}
			} else {
				false
			}
		};

		if became_established || matches!(this.borrow().kind, Kind::Tcp { .. }) {
			let flushed = Self::flush_tcp(this, resolver).ok_or(|err| warn!("TCP flush to {} failed: {err}", this.borrow().server_addr));

			if flushed.is_none() {
				crate::engine::fail_channel(resolver, this);
				return;
			}
		}

		if matches!(this.borrow().kind, Kind::Udp { .. }) {
			Self::retry_pending_udp_sends(this, resolver);
		}
	}

	/// Re-attempts sends for requests still sitting in `WaitSend` after
	/// a previous `EWOULDBLOCK` (spec.md §4.5).
	fn retry_pending_udp_sends(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		use crate::request::RequestState;

		let waiting: Vec<Rc<RefCell<Request>>> =
			this.borrow().pending.values().filter(|r| r.borrow().state == RequestState::WaitSend).cloned().collect();

		for request in waiting {
			crate::engine::retransmit(resolver, &request);
		}
	}

	/// Handles a readable event: drains the socket and dispatches every
	/// complete message found to [`crate::engine::on_reply`].
	pub fn handle_readable(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		let is_tcp = this.borrow().is_tcp();

		if is_tcp {
			Self::handle_readable_tcp(this, resolver);
		} else {
			Self::handle_readable_udp(this, resolver);
		}
	}

	fn handle_readable_udp(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		let mut buf = [0u8; 1500];

		loop {
			let (n, from) = {
				let mut me = this.borrow_mut();
				let Kind::Udp { socket, .. } = &mut me.kind else { unreachable!() };

				match socket.recv_from(&mut buf) {
					Ok(pair) => pair,
					Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
					Err(err) => {
						debug!("UDP recv from {} failed: {err}", me.server_addr);
						return;
					}
				}
			};

			if from != this.borrow().server_addr {
				// Spoofed or stale source address; ignore silently.
				continue;
			}

			crate::engine::on_reply(resolver, this, &buf[..n]);
		}
	}

	fn handle_readable_tcp(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		let mut buf = [0u8; 4096];

		loop {
			let n = {
				let mut me = this.borrow_mut();
				let Kind::Tcp { stream, .. } = &mut me.kind else { unreachable!() };

				match stream.read(&mut buf) {
					Ok(0) => {
						debug!("TCP connection to {} closed by peer", me.server_addr);
						return;
					}
					Ok(n) => n,
					Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
					Err(err) => {
						debug!("TCP read from {} failed: {err}", me.server_addr);
						return;
					}
				}
			};

			this.borrow_mut().tcp_inbuf_mut().extend(&buf[..n]);
		}

		loop {
			let frame = {
				let mut me = this.borrow_mut();
				let Kind::Tcp { inbuf, .. } = &mut me.kind else { unreachable!() };

				if inbuf.len() < 2 {
					break;
				}

				let len = u16::from_be_bytes([inbuf[0], inbuf[1]]) as usize;

				if len < MIN_TCP_FRAME || len > MAX_TCP_FRAME {
					warn!("TCP frame length {len} out of range, resetting connection to {}", me.server_addr);
					None
				} else if inbuf.len() < 2 + len {
					break;
				} else {
					inbuf.drain(..2);
					Some(inbuf.drain(..len).collect::<Vec<u8>>())
				}
			};

			match frame {
				Some(msg) => crate::engine::on_reply(resolver, this, &msg),
				None => {
					// Malformed length prefix: the stream can no longer
					// be trusted to be frame-aligned.
					crate::engine::fail_channel(resolver, this);
					return;
				}
			}
		}
	}

	fn tcp_inbuf_mut(&mut self) -> &mut VecDeque<u8> {
		let Kind::Tcp { inbuf, .. } = &mut self.kind else { unreachable!() };
		inbuf
	}

	/// Removes and returns the request owning `id`, if still pending.
	pub fn take_pending(&mut self, id: u16) -> Option<Rc<RefCell<Request>>> {
		self.pending.remove(&id)
	}

	pub fn peek_pending(&self, id: u16) -> Option<&Rc<RefCell<Request>>> {
		self.pending.get(&id)
	}

	/// Drops every pending request with a synthetic network-error reply
	/// (spec.md §4.5), used when a connection is deemed unusable.
	pub fn fail_all_pending(&mut self) -> Vec<Rc<RefCell<Request>>> {
		self.pending.drain().map(|(_, r)| r).collect()
	}

	/// Tears down this channel's event registrations (spec.md §4.2
	/// `close()`): drains its output chain and deregisters its
	/// readable/writable interest. The socket itself closes when the
	/// last `Rc<RefCell<Channel>>` (held by the server and, transiently,
	/// by any still-pending request) drops.
	pub fn close(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		let mut me = this.borrow_mut();

		if let Some(handle) = me.read_handle.take() {
			resolver.event_loop.deregister_read(handle);
			resolver.reads.borrow_mut().remove(&handle.0);
		}

		if let Some(handle) = me.write_handle.take() {
			resolver.event_loop.deregister_write(handle);
			resolver.writes.borrow_mut().remove(&handle.0);
		}

		if let Kind::Tcp { outbuf, outbuf_frames, .. } = &mut me.kind {
			outbuf.clear();
			outbuf_frames.clear();
		}
	}

	pub fn is_idle(&self) -> bool {
		self.pending.is_empty()
	}
}
