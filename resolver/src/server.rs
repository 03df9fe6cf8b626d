//! A configured upstream resolver and the pool of channels open to it
//! (spec.md §2, §4.2).

use core::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use rand::seq::SliceRandom;

use crate::channel::Channel;
use crate::ResolverInner;

/// Channels are pooled per server so that many concurrent requests
/// spread their transaction IDs across more than one socket, rather
/// than exhausting one channel's ID space (spec.md §3). Retired
/// channels (`uses` at the configured cap) are dropped and replaced
/// lazily, so the cap only bounds how many are open *at once*, not how
/// many a server sees over its lifetime.
///
/// Pool sizes are fixed at server construction (spec.md §6.5
/// `add_server(..., udp_count, tcp_count)`), matching the "fixed-size
/// arrays...sized at construction" wording of spec.md §3.
pub struct Server {
	pub name: String,
	pub addr: SocketAddr,
	/// Lower values are tried first in the default ordering (spec.md
	/// §6.2); ties keep declaration order.
	pub priority: i32,

	udp_cap: usize,
	tcp_cap: usize,
	udp_channels: Vec<Rc<RefCell<Channel>>>,
	tcp_channels: Vec<Rc<RefCell<Channel>>>,
}

impl Server {
	pub fn new(name: String, addr: SocketAddr, priority: i32, udp_count: usize, tcp_count: usize) -> Self {
		Self {
			name,
			addr,
			priority,
			udp_cap: udp_count.max(1),
			// Unlike UDP, zero is a legal TCP pool size (spec.md §8: a
			// server configured with no TCP channels must still accept a
			// truncated UDP reply rather than upgrade).
			tcp_cap: tcp_count,
			udp_channels: Vec::new(),
			tcp_channels: Vec::new(),
		}
	}

	/// Whether this server has any TCP channels configured at all (spec.md
	/// §4.4 step 6: "If no TCP channel is available, deliver the
	/// truncated reply as-is").
	pub fn has_tcp_capacity(&self) -> bool {
		self.tcp_cap > 0
	}

	fn retire_exhausted(channels: &mut Vec<Rc<RefCell<Channel>>>, resolver: &Rc<ResolverInner>) {
		channels.retain(|c| {
			let mut me = c.borrow_mut();
			if me.uses >= resolver.max_io_uses.get() {
				me.active = false;
			}
			me.active || me.pending_count() > 0
		});
	}

	/// Periodic channel refresh (spec.md §4.6): drops this server's
	/// strong reference to every UDP channel that has crossed
	/// `max_io_uses`, so a fresh one is opened on the next
	/// [`Server::udp_channel`] call. In-flight requests already bound to
	/// the retired channel keep it alive (via their own `Rc` clone)
	/// until their reply or timeout drains it.
	pub fn refresh_uses(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		let mut me = this.borrow_mut();
		Self::retire_exhausted(&mut me.udp_channels, resolver);
		Self::retire_exhausted(&mut me.tcp_channels, resolver);
	}

	/// Idle-TCP-close periodic task (spec.md §4.6): closes and drops
	/// every TCP channel with an empty pending table.
	pub fn close_idle_tcp(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) {
		let idle: Vec<Rc<RefCell<Channel>>> = {
			let me = this.borrow();
			me.tcp_channels.iter().filter(|c| c.borrow().is_idle()).cloned().collect()
		};

		for channel in &idle {
			Channel::close(channel, resolver);
		}

		this.borrow_mut().tcp_channels.retain(|c| !c.borrow().is_idle());
	}

	/// Returns an existing UDP channel with spare ID space, or opens a
	/// new one, up to this server's configured `udp_count`.
	pub fn udp_channel(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) -> std::io::Result<Rc<RefCell<Channel>>> {
		{
			let mut me = this.borrow_mut();
			Self::retire_exhausted(&mut me.udp_channels, resolver);

			if let Some(existing) = me.udp_channels.iter().find(|c| c.borrow().active && c.borrow().pending_count() < u16::MAX as usize / 2) {
				return Ok(existing.clone());
			}
		}

		let (addr, can_open_more) = {
			let me = this.borrow();
			(me.addr, me.udp_channels.iter().filter(|c| c.borrow().active).count() < me.udp_cap)
		};

		if !can_open_more {
			// At capacity: fall back to the least-loaded active channel
			// rather than refuse the query outright.
			let me = this.borrow();
			return Ok(me
				.udp_channels
				.iter()
				.filter(|c| c.borrow().active)
				.min_by_key(|c| c.borrow().pending_count())
				.cloned()
				.expect("udp_channels non-empty when at capacity"));
		}

		let socket = resolver.transport.udp_socket(addr)?;
		let channel = Rc::new(RefCell::new(Channel::new_udp(socket, addr, Rc::downgrade(this))));
		this.borrow_mut().udp_channels.push(channel.clone());
		Ok(channel)
	}

	/// Returns the single pooled TCP channel, opening a fresh connection
	/// if none exists or the existing one is no longer usable.
	pub fn tcp_channel(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) -> std::io::Result<Rc<RefCell<Channel>>> {
		{
			let mut me = this.borrow_mut();
			Self::retire_exhausted(&mut me.tcp_channels, resolver);

			if let Some(existing) = me.tcp_channels.first() {
				return Ok(existing.clone());
			}

			if me.tcp_cap == 0 {
				return Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "server has no TCP channels configured"));
			}
		}

		let addr = this.borrow().addr;
		let stream = resolver.transport.tcp_connect(addr)?;
		let channel = Rc::new(RefCell::new(Channel::new_tcp(stream, addr, Rc::downgrade(this))));

		{
			let mut me = this.borrow_mut();
			let cap = me.tcp_cap;
			me.tcp_channels.truncate(cap.saturating_sub(1));
			me.tcp_channels.push(channel.clone());
		}

		Ok(channel)
	}

	/// Picks a uniformly random *active* UDP channel already open on
	/// this server, opening one if none exists (spec.md §4.5 `on_timer`
	/// renew path: "pick a random channel on that server").
	pub fn random_udp_channel(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) -> std::io::Result<Rc<RefCell<Channel>>> {
		let existing: Vec<Rc<RefCell<Channel>>> = this.borrow().udp_channels.iter().filter(|c| c.borrow().active).cloned().collect();

		match existing.choose(&mut rand::thread_rng()) {
			Some(channel) => Ok(channel.clone()),
			None => Self::udp_channel(this, resolver),
		}
	}

	/// Picks a uniformly random TCP channel, opening one if none exists
	/// (spec.md §4.5 `reschedule_over_tcp`: "pick a uniformly random TCP
	/// channel from the server").
	pub fn random_tcp_channel(this: &Rc<RefCell<Self>>, resolver: &Rc<ResolverInner>) -> std::io::Result<Rc<RefCell<Channel>>> {
		let existing: Vec<Rc<RefCell<Channel>>> = this.borrow().tcp_channels.clone();

		match existing.choose(&mut rand::thread_rng()) {
			Some(channel) => Ok(channel.clone()),
			None => Self::tcp_channel(this, resolver),
		}
	}
}

/// A `Weak` handle to a server, held by the channels it owns (spec.md
/// §9: "weak-by-construction" back-reference, since a `Channel` never
/// needs to keep its `Server` alive — the reverse direction already
/// does via `Server -> Channel -> Request -> Resolver -> Server`).
pub type ServerRef = Weak<RefCell<Server>>;
