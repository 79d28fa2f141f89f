//! The readout worker: drains the controller's data pipe into pool buffers,
//! persists them to the listfile and hands them to the parser.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::{BufferQueues, ReadoutBuffer};
use crate::config::CrateConfig;
use crate::controller::{Mvlc, DEFAULT_TIMEOUT};
use crate::error::ReadoutError;
use crate::executor::{execute_stack_builder, CommandExecOptions, GroupedStackResults};
use crate::frame::{extract_frame_info, frame_types, is_known_frame_header, STACK_COUNT};
use crate::listfile::{
	listfile_write_eof, listfile_write_pause, listfile_write_preamble, listfile_write_raw, listfile_write_resume,
	listfile_write_timetick, ListfileWriterCounters, WriteHandle,
};
use crate::transport::{eth, ConnectionType, EthPipeCounters};
use crate::util::{Protected, Waitable};

/// Upper bound on the USB partial frame carry: the largest single frame.
///
/// A larger carry means the byte stream lost framing; the carry is dropped and
/// counted as a framing error instead.
pub const USB_CARRY_MAX: usize = 64 * 1024;

/// Interval between timetick system events written to the listfile.
const TIMETICK_INTERVAL: Duration = Duration::from_secs(1);

/// The lifecycle states of the readout worker.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum State {
	Idle,
	Starting,
	Running,
	Paused,
	Stopping,
}

/// Key identifying one source of stack error notifications.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct StackErrorKey {
	pub stack: u8,
	pub line: u16,
	pub flags: u8,
}

/// Statistics of the readout worker. Snapshotted by readers via [`Protected::copy`].
#[derive(Debug, Clone, Default)]
pub struct ReadoutWorkerCounters {
	pub buffers_read: u64,
	pub buffers_flushed: u64,
	pub bytes_read: u64,
	/// Filled buffers dropped because the empty queue was exhausted.
	pub snoop_missed_buffers: u64,
	pub read_timeouts: u64,
	pub usb_framing_errors: u64,
	pub usb_temp_moved_bytes: u64,
	/// Ethernet reads yielding no usable words.
	pub eth_short_reads: u64,
	pub stack_hits: [u64; STACK_COUNT],
	pub stack_errors: HashMap<StackErrorKey, u64>,
	/// Snapshot of the data pipe receive counters, taken at run end.
	pub eth_data_counters: Option<EthPipeCounters>,
	pub listfile: ListfileWriterCounters,
	pub t_start: Option<Instant>,
	pub t_end: Option<Instant>,
	/// When the stop sequence began. The span t_start..t_terminate_start is the
	/// effective run duration.
	pub t_terminate_start: Option<Instant>,
	/// The fatal error that terminated the run, if any.
	pub result: Option<Arc<ReadoutError>>,
	/// Results of the init sequences executed during startup.
	pub init_results: Option<Arc<GroupedStackResults>>,
}

type Ack = Sender<Result<(), Arc<ReadoutError>>>;

enum Command {
	Start { duration: Duration, ack: Ack },
	Stop { ack: Ack },
	Pause { ack: Ack },
	Resume { ack: Ack },
}

impl Command {
	fn name(&self) -> &'static str {
		match self {
			Self::Start { .. } => "start",
			Self::Stop { .. } => "stop",
			Self::Pause { .. } => "pause",
			Self::Resume { .. } => "resume",
		}
	}

	fn reject(self, state: State) {
		let (name, ack) = match self {
			Self::Start { ack, .. } => ("start", ack),
			Self::Stop { ack } => ("stop", ack),
			Self::Pause { ack } => ("pause", ack),
			Self::Resume { ack } => ("resume", ack),
		};
		let _ = ack.send(Err(Arc::new(ReadoutError::InvalidState { request: name, state })));
	}
}

/// Drives the readout: owns the controller and the listfile handle, runs the
/// acquisition on a dedicated thread and is controlled through
/// [`Self::start`], [`Self::stop`], [`Self::pause`] and [`Self::resume`].
pub struct ReadoutWorker {
	state: Arc<Waitable<State>>,
	counters: Arc<Protected<ReadoutWorkerCounters>>,
	quit: Arc<AtomicBool>,
	command_tx: Sender<Command>,
	thread: Option<std::thread::JoinHandle<()>>,
}

impl ReadoutWorker {
	pub fn new(mvlc: Mvlc, config: CrateConfig, queues: BufferQueues, listfile: Option<Box<dyn WriteHandle + Send>>) -> Self {
		let state = Arc::new(Waitable::new(State::Idle));
		let counters = Arc::new(Protected::new(ReadoutWorkerCounters::default()));
		let quit = Arc::new(AtomicBool::new(false));
		let (command_tx, command_rx) = crossbeam_channel::unbounded();

		let mut worker = Worker {
			mvlc,
			config,
			queues,
			listfile,
			state: state.clone(),
			counters: counters.clone(),
			quit: quit.clone(),
			command_rx,
			buffer: None,
			carry: Vec::new(),
			next_buffer_number: 1,
			deadline: None,
			last_timetick: Instant::now(),
			pending_stop_ack: None,
		};

		let thread = std::thread::Builder::new()
			.name("readout_worker".into())
			.spawn(move || worker.run())
			.expect("failed to spawn the readout worker thread");

		Self {
			state,
			counters,
			quit,
			command_tx,
			thread: Some(thread),
		}
	}

	pub fn state(&self) -> State {
		self.state.get()
	}

	pub fn counters(&self) -> ReadoutWorkerCounters {
		self.counters.copy()
	}

	/// Start a run with the given wall clock duration.
	///
	/// Blocks until the start sequence completed; a startup failure is reported
	/// through the returned error and the worker falls back to Idle.
	pub fn start(&self, duration: Duration) -> Result<(), Arc<ReadoutError>> {
		self.request(|ack| Command::Start { duration, ack })
	}

	/// Stop the run. Blocks until the worker is Idle again.
	pub fn stop(&self) -> Result<(), Arc<ReadoutError>> {
		self.request(|ack| Command::Stop { ack })
	}

	/// Pause the run: triggers are disarmed but the run stays alive.
	pub fn pause(&self) -> Result<(), Arc<ReadoutError>> {
		self.request(|ack| Command::Pause { ack })
	}

	/// Resume a paused run.
	pub fn resume(&self) -> Result<(), Arc<ReadoutError>> {
		self.request(|ack| Command::Resume { ack })
	}

	/// Block until the worker reaches Idle.
	pub fn wait_idle(&self) {
		self.state.wait(|&s| s == State::Idle);
	}

	fn request(&self, command: impl FnOnce(Ack) -> Command) -> Result<(), Arc<ReadoutError>> {
		let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
		let command = command(ack_tx);
		let name = command.name();

		if self.command_tx.send(command).is_err() {
			return Err(Arc::new(ReadoutError::InvalidState {
				request: name,
				state: self.state.get(),
			}));
		}

		match ack_rx.recv() {
			Ok(result) => result,
			Err(_) => Err(Arc::new(ReadoutError::InvalidState {
				request: name,
				state: self.state.get(),
			})),
		}
	}

	/// Tear the worker down, stopping any run in progress.
	pub fn shutdown(mut self) {
		self.quit.store(true, Ordering::Relaxed);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for ReadoutWorker {
	fn drop(&mut self) {
		self.quit.store(true, Ordering::Relaxed);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

struct Worker {
	mvlc: Mvlc,
	config: CrateConfig,
	queues: BufferQueues,
	listfile: Option<Box<dyn WriteHandle + Send>>,
	state: Arc<Waitable<State>>,
	counters: Arc<Protected<ReadoutWorkerCounters>>,
	quit: Arc<AtomicBool>,
	command_rx: Receiver<Command>,

	/// The pool buffer currently being filled.
	buffer: Option<ReadoutBuffer>,
	/// Trailing bytes of a partial USB frame, carried into the next buffer.
	carry: Vec<u8>,
	next_buffer_number: u32,
	deadline: Option<Instant>,
	last_timetick: Instant,
	/// Acknowledged once the stop sequence finished and the worker is Idle.
	pending_stop_ack: Option<Ack>,
}

impl Worker {
	fn run(&mut self) {
		log::debug!("readout_worker: entering command loop");

		loop {
			if self.quit.load(Ordering::Relaxed) {
				break;
			}

			match self.command_rx.recv_timeout(Duration::from_millis(100)) {
				Ok(Command::Start { duration, ack }) => self.run_once(duration, ack),
				Ok(command) => {
					log::warn!("readout_worker: rejecting {} request while idle", command.name());
					command.reject(State::Idle);
				},
				Err(crossbeam_channel::RecvTimeoutError::Timeout) => (),
				Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
			}
		}

		log::debug!("readout_worker: left command loop");
	}

	/// One full run: start sequence, readout loop, stop sequence.
	fn run_once(&mut self, duration: Duration, ack: Ack) {
		self.state.set(State::Starting);
		*self.counters.access() = ReadoutWorkerCounters::default();

		let result = match self.startup() {
			Ok(()) => {
				let t_start = Instant::now();
				self.deadline = Some(t_start + duration);
				self.last_timetick = t_start;
				self.counters.access().t_start = Some(t_start);
				self.state.set(State::Running);
				let _ = ack.send(Ok(()));

				let run_result = self.readout_loop();

				self.state.set(State::Stopping);
				self.counters.access().t_terminate_start = Some(Instant::now());
				let stop_result = self.terminate();
				run_result.and(stop_result)
			},
			Err(error) => {
				let error = Arc::new(error);
				let _ = ack.send(Err(error.clone()));
				self.counters.access().result = Some(error);
				Ok(())
			},
		};

		if let Err(error) = result {
			log::error!("readout_worker: run failed: {}", error);
			let mut counters = self.counters.access();
			if counters.result.is_none() {
				counters.result = Some(Arc::new(error));
			}
		}

		// Return the fill buffer to the pool so the count stays invariant, and
		// make sure a failed run still finalizes its listfile.
		if let Some(mut buffer) = self.buffer.take() {
			buffer.clear();
			self.queues.empty_queue().enqueue(buffer);
		}
		self.carry.clear();
		drop(self.listfile.take());

		{
			let mut counters = self.counters.access();
			counters.t_end = Some(Instant::now());
			counters.eth_data_counters = self.mvlc.eth_data_counters();
		}
		self.state.set(State::Idle);

		if let Some(ack) = self.pending_stop_ack.take() {
			let result = match self.counters.access().result.clone() {
				Some(error) => Err(error),
				None => Ok(()),
			};
			let _ = ack.send(result);
		}
	}

	/// The start sequence: module init, listfile preamble, stack upload,
	/// trigger arming, DAQ mode on.
	fn startup(&mut self) -> Result<(), ReadoutError> {
		let options = CommandExecOptions::default();

		if !self.config.init_trigger_io.is_empty() {
			let results = execute_stack_builder(&mut self.mvlc, &self.config.init_trigger_io, &options)?;
			log_init_results("init_trigger_io", &results);
		}

		if !self.config.init_commands.is_empty() {
			let results = execute_stack_builder(&mut self.mvlc, &self.config.init_commands, &options)?;
			log_init_results("init_commands", &results);
			self.counters.access().init_results = Some(Arc::new(results));
		}

		if let Some(handle) = &mut self.listfile {
			self.counters.access().listfile.t_start = Some(Instant::now());
			let written = listfile_write_preamble(handle.as_mut(), self.mvlc.connection_type(), &self.config)?;
			self.count_listfile_write(written as u64);
		}

		self.mvlc.setup_readout_stacks(&self.config.stacks)?;
		self.mvlc.write_stack_triggers(&self.config.triggers)?;
		self.mvlc.set_daq_mode(true)?;

		Ok(())
	}

	/// The Running/Paused loop. Returns when the run should stop.
	fn readout_loop(&mut self) -> Result<(), ReadoutError> {
		loop {
			while let Ok(command) = self.command_rx.try_recv() {
				match command {
					Command::Stop { ack } => {
						self.pending_stop_ack = Some(ack);
						return Ok(());
					},
					Command::Pause { ack } => match self.enter_pause() {
						Ok(()) => {
							let _ = ack.send(Ok(()));
							if !self.paused_loop()? {
								return Ok(());
							}
						},
						Err(error) => {
							let error = Arc::new(error);
							let _ = ack.send(Err(error.clone()));
							self.counters.access().result = Some(error);
							return Ok(());
						},
					},
					command => command.reject(State::Running),
				}
			}

			if self.quit.load(Ordering::Relaxed) {
				return Ok(());
			}
			if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
				log::debug!("readout_worker: run duration reached");
				return Ok(());
			}

			if self.listfile.is_some() && self.last_timetick.elapsed() >= TIMETICK_INTERVAL {
				if let Some(handle) = &mut self.listfile {
					let written = listfile_write_timetick(handle.as_mut())?;
					self.count_listfile_write(written as u64);
				}
				self.last_timetick = Instant::now();
			}

			self.read_cycle()?;
		}
	}

	/// Disarm triggers and drain the pipe, keeping the run alive.
	fn enter_pause(&mut self) -> Result<(), ReadoutError> {
		self.mvlc.disable_all_triggers()?;
		self.mvlc.set_daq_mode(false)?;
		self.read_cycle()?;

		if let Some(handle) = &mut self.listfile {
			let written = listfile_write_pause(handle.as_mut())?;
			self.count_listfile_write(written as u64);
		}

		self.state.set(State::Paused);
		log::info!("readout_worker: paused");
		Ok(())
	}

	/// Wait for Resume or Stop while Paused. Returns false if the run should stop.
	fn paused_loop(&mut self) -> Result<bool, ReadoutError> {
		loop {
			if self.quit.load(Ordering::Relaxed) {
				return Ok(false);
			}
			if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
				return Ok(false);
			}

			match self.command_rx.recv_timeout(Duration::from_millis(100)) {
				Ok(Command::Resume { ack }) => match self.resume_run() {
					Ok(()) => {
						let _ = ack.send(Ok(()));
						return Ok(true);
					},
					Err(error) => {
						let error = Arc::new(error);
						let _ = ack.send(Err(error.clone()));
						self.counters.access().result = Some(error);
						return Ok(false);
					},
				},
				Ok(Command::Stop { ack }) => {
					self.pending_stop_ack = Some(ack);
					return Ok(false);
				},
				Ok(command) => command.reject(State::Paused),
				Err(crossbeam_channel::RecvTimeoutError::Timeout) => (),
				Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(false),
			}
		}
	}

	/// Re-arm the triggers of a paused run.
	fn resume_run(&mut self) -> Result<(), ReadoutError> {
		self.mvlc.write_stack_triggers(&self.config.triggers)?;
		self.mvlc.set_daq_mode(true)?;
		if let Some(handle) = &mut self.listfile {
			let written = listfile_write_resume(handle.as_mut())?;
			self.count_listfile_write(written as u64);
		}
		self.state.set(State::Running);
		log::info!("readout_worker: resumed");
		Ok(())
	}

	/// The stop sequence: disarm, drain one read timeout worth of data, write
	/// the end-of-file event and close the listfile entry.
	fn terminate(&mut self) -> Result<(), ReadoutError> {
		self.mvlc.disable_all_triggers()?;
		self.mvlc.set_daq_mode(false)?;

		self.read_cycle()?;

		if let Some(mut handle) = self.listfile.take() {
			let written = listfile_write_eof(handle.as_mut())?;
			self.count_listfile_write(written as u64);
			self.counters.access().listfile.t_end = Some(Instant::now());
			// Dropping the handle finalizes the archive.
		}

		Ok(())
	}

	/// Take the current fill buffer, pulling a fresh one from the pool if needed.
	fn fill_buffer(&mut self) -> Option<ReadoutBuffer> {
		if self.buffer.is_none() {
			match self.queues.empty_queue().dequeue(Duration::from_millis(100)) {
				Some(buffer) => self.buffer = Some(buffer),
				None => return None,
			}
		}

		let mut buffer = self.buffer.take()?;
		buffer.clear();
		buffer.set_connection_type(self.mvlc.connection_type());
		Some(buffer)
	}

	/// One fill-trim-persist-enqueue cycle.
	fn read_cycle(&mut self) -> Result<(), ReadoutError> {
		let Some(mut buffer) = self.fill_buffer() else {
			// Pool exhausted and nothing to read into: drop this cycle's data.
			self.counters.access().snoop_missed_buffers += 1;
			return Ok(());
		};

		let result = match self.mvlc.connection_type() {
			ConnectionType::Usb => self.usb_fill(&mut buffer),
			ConnectionType::Eth => self.eth_fill(&mut buffer),
		};

		match result {
			Ok(()) => self.flush_buffer(buffer),
			Err(error) => {
				self.buffer = Some(buffer);
				Err(error)
			},
		}
	}

	/// Fill the buffer from the USB bulk stream and trim it to a whole frame boundary.
	fn usb_fill(&mut self, buffer: &mut ReadoutBuffer) -> Result<(), ReadoutError> {
		if !self.carry.is_empty() {
			buffer.extend_from_slice(&self.carry);
			self.carry.clear();
		}

		loop {
			let dst = buffer.free_bytes_mut();
			if dst.is_empty() {
				break;
			}
			let dst_len = dst.len();

			match self.mvlc.data_read(dst, DEFAULT_TIMEOUT) {
				Ok(0) => break,
				Ok(received) => {
					let short = received < dst_len;
					buffer.commit(received);
					self.counters.access().bytes_read += received as u64;
					if short {
						break;
					}
				},
				Err(error) if error.is_timeout() => {
					self.counters.access().read_timeouts += 1;
					break;
				},
				Err(error) => return Err(error.into()),
			}
		}

		self.trim_usb_buffer(buffer);
		Ok(())
	}

	/// Scan the buffer's frames, account stack hits and error notifications and
	/// move a trailing partial frame into the carry region.
	fn trim_usb_buffer(&mut self, buffer: &mut ReadoutBuffer) {
		let mut hits = [0u64; STACK_COUNT];
		let mut errors: Vec<StackErrorKey> = Vec::new();
		let mut framing_errors = 0u64;

		let bytes = buffer.bytes();
		let mut pos = 0;
		let trim_at = loop {
			if pos + 4 > bytes.len() {
				break pos;
			}

			let header = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
			if !is_known_frame_header(header) {
				// Lost framing: skip words until the stream looks sane again.
				framing_errors += 1;
				pos += 4;
				continue;
			}

			let info = extract_frame_info(header);
			let total = 4 * (1 + usize::from(info.len));
			if pos + total > bytes.len() {
				// Partial frame at the end of the buffer.
				break pos;
			}

			match info.frame_type {
				frame_types::STACK_FRAME => {
					hits[usize::from(info.stack) % STACK_COUNT] += 1;
				},
				frame_types::STACK_ERROR if info.len >= 1 => {
					let line = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]]);
					errors.push(StackErrorKey {
						stack: info.stack,
						line: line as u16,
						flags: info.flags,
					});
				},
				_ => (),
			}

			pos += total;
		};

		let tail = buffer.len() - trim_at;
		if tail > 0 {
			if tail > USB_CARRY_MAX {
				// The length field of a partial frame claims more than any real
				// frame can hold; drop the tail and resynchronize.
				framing_errors += 1;
			} else {
				self.carry.extend_from_slice(&buffer.bytes()[trim_at..]);
				self.counters.access().usb_temp_moved_bytes += tail as u64;
			}
			buffer.truncate(trim_at);
		}

		let mut counters = self.counters.access();
		counters.usb_framing_errors += framing_errors;
		for (stack, count) in hits.iter().enumerate() {
			counters.stack_hits[stack] += count;
		}
		for key in errors {
			*counters.stack_errors.entry(key).or_insert(0) += 1;
		}
	}

	/// Fill the buffer with whole UDP packets from the data pipe.
	fn eth_fill(&mut self, buffer: &mut ReadoutBuffer) -> Result<(), ReadoutError> {
		loop {
			if buffer.free() < eth::MAX_PACKET_SIZE {
				break;
			}

			let received = match self.mvlc.data_read(buffer.free_bytes_mut(), DEFAULT_TIMEOUT) {
				Ok(received) => received,
				Err(error) if error.is_timeout() => {
					self.counters.access().read_timeouts += 1;
					break;
				},
				Err(error) => return Err(error.into()),
			};

			if received == 0 {
				self.counters.access().eth_short_reads += 1;
				continue;
			}

			self.account_eth_packet(&buffer.free_bytes_mut()[..received]);
			buffer.commit(received);
			self.counters.access().bytes_read += received as u64;
		}

		Ok(())
	}

	/// Walk the frame headers of one packet via its next-header pointer and
	/// account stack hits and error notifications.
	fn account_eth_packet(&mut self, packet: &[u8]) {
		use crate::transport::eth_packet;

		if packet.len() < eth_packet::HEADER_BYTES {
			return;
		}

		let words: Vec<u32> = packet
			.chunks_exact(4)
			.map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
			.collect();
		let payload = &words[eth_packet::HEADER_WORDS..];

		let pointer = eth_packet::next_header_pointer(words[1]);
		if pointer == eth_packet::NO_HEADER_POINTER {
			return;
		}

		let mut counters = self.counters.access();
		let mut pos = usize::from(pointer);
		while pos < payload.len() {
			let info = extract_frame_info(payload[pos]);
			match info.frame_type {
				frame_types::STACK_FRAME => {
					counters.stack_hits[usize::from(info.stack) % STACK_COUNT] += 1;
				},
				frame_types::STACK_ERROR if usize::from(info.len) >= 1 && pos + 1 < payload.len() => {
					let key = StackErrorKey {
						stack: info.stack,
						line: payload[pos + 1] as u16,
						flags: info.flags,
					};
					*counters.stack_errors.entry(key).or_insert(0) += 1;
				},
				_ => (),
			}
			pos += 1 + usize::from(info.len);
		}
	}

	fn count_listfile_write(&self, bytes: u64) {
		let mut counters = self.counters.access();
		counters.listfile.writes += 1;
		counters.listfile.bytes_written += bytes;
	}

	/// Persist the buffer and hand it to the parser, or drop it if the pool ran dry.
	fn flush_buffer(&mut self, mut buffer: ReadoutBuffer) -> Result<(), ReadoutError> {
		if buffer.is_empty() {
			self.buffer = Some(buffer);
			return Ok(());
		}

		// Buffer numbers are only consumed by produced buffers, so a number gap
		// seen by the parser always means a dropped buffer.
		buffer.set_number(self.next_buffer_number);
		self.next_buffer_number += 1;

		if let Some(handle) = &mut self.listfile {
			if let Err(error) = listfile_write_raw(handle.as_mut(), buffer.bytes()) {
				self.buffer = Some(buffer);
				return Err(error.into());
			}
			self.count_listfile_write(buffer.len() as u64);
			self.counters.access().buffers_flushed += 1;
		}

		self.counters.access().buffers_read += 1;

		match self.queues.empty_queue().try_dequeue() {
			Some(mut replacement) => {
				std::mem::swap(&mut replacement, &mut buffer);
				self.queues.filled_queue().enqueue(replacement);
			},
			None => {
				// No free buffer: the parser misses this one.
				self.counters.access().snoop_missed_buffers += 1;
			},
		}

		buffer.clear();
		self.buffer = Some(buffer);
		Ok(())
	}
}

fn log_init_results(title: &str, results: &GroupedStackResults) {
	for group in &results.groups {
		for result in &group.results {
			match &result.error {
				Some(error) => log::warn!("{}: group {}: {:?}: {}", title, group.name, result.command, error),
				None => log::debug!("{}: group {}: {:?}: {} response words", title, group.name, result.command, result.response.len()),
			}
		}
	}
}
