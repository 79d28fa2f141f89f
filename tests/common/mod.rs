pub mod mock_transport;

use std::sync::{Arc, Mutex};

use mvlc::listfile::WriteHandle;
use mvlc::ListfileError;

/// A [`WriteHandle`] collecting everything into shared memory.
#[derive(Clone, Default)]
pub struct SharedWriteHandle {
	pub data: Arc<Mutex<Vec<u8>>>,
}

impl WriteHandle for SharedWriteHandle {
	fn write(&mut self, data: &[u8]) -> Result<usize, ListfileError> {
		self.data.lock().unwrap().extend_from_slice(data);
		Ok(data.len())
	}
}

/// A [`WriteHandle`] that fails on the n-th write call.
#[derive(Clone)]
pub struct FailingWriteHandle {
	pub fail_at: u64,
	pub writes: Arc<Mutex<u64>>,
}

impl FailingWriteHandle {
	pub fn new(fail_at: u64) -> Self {
		Self {
			fail_at,
			writes: Arc::new(Mutex::new(0)),
		}
	}
}

impl WriteHandle for FailingWriteHandle {
	fn write(&mut self, data: &[u8]) -> Result<usize, ListfileError> {
		let mut writes = self.writes.lock().unwrap();
		*writes += 1;
		if *writes >= self.fail_at {
			return Err(ListfileError::Io(std::io::Error::other("injected write failure")));
		}
		Ok(data.len())
	}
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
	words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
