//! Canned replies installed by the host, bypassing the network
//! entirely (spec.md §4.7).

use std::collections::HashMap;

use crate::error::Reply;
use crate::wire::{QType, MAX_FAKE_NAME};

/// Keyed by lowercased, dot-trimmed name plus query type, matching the
/// normalization [`crate::wire::Question::new`] already applies.
#[derive(Default)]
pub struct FakeTable {
	entries: HashMap<(String, QType), Reply>,
}

impl FakeTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Installs `reply` for `name`/`qtype`. Names longer than
	/// [`MAX_FAKE_NAME`] are rejected, matching the same bound the wire
	/// encoder enforces, so a fake entry can never be unreachable by any
	/// real query.
	pub fn set(&mut self, name: &str, qtype: QType, reply: Reply) -> bool {
		let key = name.trim_matches('.').to_ascii_lowercase();

		if key.is_empty() || key.len() > MAX_FAKE_NAME {
			return false;
		}

		self.entries.insert((key, qtype), reply);
		true
	}

	pub fn clear(&mut self, name: &str, qtype: QType) -> bool {
		let key = name.trim_matches('.').to_ascii_lowercase();
		self.entries.remove(&(key, qtype)).is_some()
	}

	/// Looks up a fake reply for a single-question request (spec.md
	/// §4.7: "single-question-only lookup" — a multi-question request
	/// never consults the fake table).
	pub fn lookup(&self, name: &str, qtype: QType) -> Option<Reply> {
		let key = name.trim_matches('.').to_ascii_lowercase();
		self.entries.get(&(key, qtype)).cloned()
	}
}
