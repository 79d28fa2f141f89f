//! Readout buffers and the bounded double queue moving them between threads.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::transport::ConnectionType;

/// Default capacity of a single readout buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of buffers in the pool.
pub const DEFAULT_BUFFER_COUNT: usize = 100;

/// A fixed capacity buffer of raw readout data.
///
/// The payload is guaranteed by the producer to contain only whole frames (USB)
/// or whole UDP packets (ETH), so [`Self::view_u32`] always sees complete words.
#[derive(Debug)]
pub struct ReadoutBuffer {
	number: u32,
	connection_type: ConnectionType,
	/// Word-aligned backing storage of fixed capacity.
	words: Vec<u32>,
	/// Used bytes of the backing storage.
	used: usize,
}

impl ReadoutBuffer {
	/// Create an empty buffer with the given capacity in bytes, rounded up to whole words.
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			number: 0,
			connection_type: ConnectionType::Usb,
			words: vec![0u32; capacity.div_ceil(4)],
			used: 0,
		}
	}

	/// The monotonic number assigned by the producer.
	pub fn number(&self) -> u32 {
		self.number
	}

	pub fn set_number(&mut self, number: u32) {
		self.number = number;
	}

	pub fn connection_type(&self) -> ConnectionType {
		self.connection_type
	}

	pub fn set_connection_type(&mut self, connection_type: ConnectionType) {
		self.connection_type = connection_type;
	}

	pub fn capacity(&self) -> usize {
		self.words.len() * 4
	}

	pub fn len(&self) -> usize {
		self.used
	}

	pub fn is_empty(&self) -> bool {
		self.used == 0
	}

	pub fn free(&self) -> usize {
		self.capacity() - self.used
	}

	pub fn clear(&mut self) {
		self.used = 0;
	}

	/// The used payload as bytes.
	pub fn bytes(&self) -> &[u8] {
		&bytemuck::cast_slice(&self.words)[..self.used]
	}

	/// The unused tail of the buffer, for filling by the producer.
	pub fn free_bytes_mut(&mut self) -> &mut [u8] {
		&mut bytemuck::cast_slice_mut(&mut self.words)[self.used..]
	}

	/// Mark `count` bytes of the free tail as used.
	pub fn commit(&mut self, count: usize) {
		debug_assert!(self.used + count <= self.capacity());
		self.used += count;
	}

	/// Shorten the payload to `len` bytes.
	pub fn truncate(&mut self, len: usize) {
		debug_assert!(len <= self.used);
		self.used = len;
	}

	/// Append bytes to the payload. The data must fit the remaining capacity.
	pub fn extend_from_slice(&mut self, data: &[u8]) {
		self.free_bytes_mut()[..data.len()].copy_from_slice(data);
		self.used += data.len();
	}

	/// The payload viewed as words. A trailing partial word is not included.
	pub fn view_u32(&self) -> &[u32] {
		&self.words[..self.used / 4]
	}
}

/// One side of the double queue.
#[derive(Debug, Clone)]
pub struct BufferQueue {
	tx: Sender<ReadoutBuffer>,
	rx: Receiver<ReadoutBuffer>,
}

impl BufferQueue {
	/// Add a buffer to the queue.
	///
	/// The queues are sized for the whole pool, so enqueueing a pool buffer never blocks.
	pub fn enqueue(&self, buffer: ReadoutBuffer) {
		self.tx.send(buffer).expect("buffer queue disconnected");
	}

	/// Take the oldest buffer from the queue, waiting up to `timeout`.
	pub fn dequeue(&self, timeout: Duration) -> Option<ReadoutBuffer> {
		self.rx.recv_timeout(timeout).ok()
	}

	/// Take the oldest buffer if one is immediately available.
	pub fn try_dequeue(&self) -> Option<ReadoutBuffer> {
		self.rx.try_recv().ok()
	}

	pub fn len(&self) -> usize {
		self.rx.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rx.is_empty()
	}
}

/// The pair of bounded queues (empty and filled) through which buffers cycle
/// between the readout worker and the parser.
///
/// All buffers are allocated at construction and start out on the empty side.
#[derive(Debug, Clone)]
pub struct BufferQueues {
	empty: BufferQueue,
	filled: BufferQueue,
	buffer_count: usize,
}

impl BufferQueues {
	pub fn new(buffer_size: usize, buffer_count: usize) -> Self {
		let (empty_tx, empty_rx) = crossbeam_channel::bounded(buffer_count);
		let (filled_tx, filled_rx) = crossbeam_channel::bounded(buffer_count);

		for _ in 0..buffer_count {
			empty_tx
				.send(ReadoutBuffer::with_capacity(buffer_size))
				.expect("filling a fresh buffer queue can not fail");
		}

		Self {
			empty: BufferQueue { tx: empty_tx, rx: empty_rx },
			filled: BufferQueue { tx: filled_tx, rx: filled_rx },
			buffer_count,
		}
	}

	pub fn empty_queue(&self) -> &BufferQueue {
		&self.empty
	}

	pub fn filled_queue(&self) -> &BufferQueue {
		&self.filled
	}

	/// The total number of buffers owned by the pool.
	pub fn buffer_count(&self) -> usize {
		self.buffer_count
	}

	/// Send the shutdown sentinel: an empty buffer enqueued to the filled side.
	///
	/// Returns false if no empty buffer became available within `timeout`.
	pub fn send_sentinel(&self, timeout: Duration) -> bool {
		match self.empty.dequeue(timeout) {
			Some(mut buffer) => {
				buffer.clear();
				self.filled.enqueue(buffer);
				true
			},
			None => false,
		}
	}
}

impl Default for BufferQueues {
	fn default() -> Self {
		Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_COUNT)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use assert2::assert;

	#[test]
	fn test_buffer_fill_and_view() {
		let mut buffer = ReadoutBuffer::with_capacity(16);
		assert!(buffer.capacity() == 16);

		buffer.extend_from_slice(&0xdead_beefu32.to_le_bytes());
		buffer.extend_from_slice(&[0x01, 0x02]);
		assert!(buffer.len() == 6);
		// The partial trailing word is not visible in the word view.
		assert!(buffer.view_u32() == [0xdead_beef]);

		buffer.truncate(4);
		assert!(buffer.view_u32() == [0xdead_beef]);
		assert!(buffer.free() == 12);
	}

	#[test]
	fn test_buffer_commit() {
		let mut buffer = ReadoutBuffer::with_capacity(8);
		buffer.free_bytes_mut()[..4].copy_from_slice(&1u32.to_le_bytes());
		buffer.commit(4);
		assert!(buffer.view_u32() == [1]);
	}

	#[test]
	fn test_queue_conservation() {
		let queues = BufferQueues::new(64, 4);
		assert!(queues.empty_queue().len() == 4);
		assert!(queues.filled_queue().len() == 0);

		let buffer = queues.empty_queue().dequeue(Duration::from_millis(10)).unwrap();
		assert!(queues.empty_queue().len() + queues.filled_queue().len() == 3);

		queues.filled_queue().enqueue(buffer);
		assert!(queues.empty_queue().len() + queues.filled_queue().len() == 4);
	}

	#[test]
	fn test_dequeue_timeout_returns_none() {
		let queues = BufferQueues::new(64, 1);
		let _held = queues.empty_queue().dequeue(Duration::from_millis(10)).unwrap();
		assert!(queues.empty_queue().dequeue(Duration::from_millis(10)).is_none());
	}

	#[test]
	fn test_sentinel() {
		let queues = BufferQueues::new(64, 2);
		assert!(queues.send_sentinel(Duration::from_millis(10)));

		let sentinel = queues.filled_queue().dequeue(Duration::from_millis(10)).unwrap();
		assert!(sentinel.is_empty());
	}
}
