//! A scripted in-memory [`Transport`] emulating the controller's command pipe
//! dialog and a scheduled data pipe stream.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mvlc::controller::{registers, super_commands};
use mvlc::frame::{frame_types, make_frame_header};
use mvlc::stack::{command_type, StackCommand};
use mvlc::transport::{eth_packet, ConnectionType, Pipe, Transport};
use mvlc::TransportError;

fn super_word(opcode: u16, arg: u16) -> u32 {
	u32::from(opcode) << 16 | u32::from(arg)
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
	words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
	bytes.chunks_exact(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect()
}

#[derive(Default)]
struct Inner {
	connected: bool,
	connect_time: Option<Instant>,

	/// Controller registers, including stack memory.
	registers: HashMap<u16, u32>,

	/// Values returned for single cycle VME reads, by address.
	read_values: HashMap<u32, u32>,

	/// Bytes queued for the host to read from the command pipe (USB byte stream).
	cmd_bytes: VecDeque<u8>,
	/// Datagrams queued for the host to read from the command pipe (ETH).
	cmd_packets: VecDeque<Vec<u8>>,
	cmd_packet_number: u16,

	/// Scheduled data pipe chunks: (offset from connect, payload).
	data_script: VecDeque<(Duration, Vec<u8>)>,
}

/// A mock transport shared between the test and the worker owning it.
#[derive(Clone)]
pub struct MockTransport {
	inner: Arc<Mutex<Inner>>,
	connection_type: ConnectionType,
}

impl MockTransport {
	pub fn new(connection_type: ConnectionType) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			connection_type,
		}
	}

	/// Schedule a data pipe chunk to become readable `offset` after connect.
	///
	/// For ETH transports the chunk must be one whole datagram including the
	/// packet header words.
	pub fn push_data(&self, offset: Duration, data: Vec<u8>) {
		self.inner.lock().unwrap().data_script.push_back((offset, data));
	}

	/// Set the value returned by single cycle VME reads of `address`.
	pub fn set_read_value(&self, address: u32, value: u32) {
		self.inner.lock().unwrap().read_values.insert(address, value);
	}

	pub fn register(&self, address: u16) -> Option<u32> {
		self.inner.lock().unwrap().registers.get(&address).copied()
	}

	/// The words of the stack uploaded at the given stack memory word offset.
	pub fn uploaded_stack(&self, offset_words: u16) -> Vec<u32> {
		let inner = self.inner.lock().unwrap();
		let mut words = Vec::new();
		let mut address = registers::STACK_MEMORY_BEGIN + offset_words;
		while let Some(&word) = inner.registers.get(&address) {
			words.push(word);
			if word >> 24 == u32::from(command_type::STACK_END) {
				break;
			}
			address += 1;
		}
		words
	}
}

impl Inner {
	fn queue_cmd_response(&mut self, connection_type: ConnectionType, words: &[u32]) {
		match connection_type {
			ConnectionType::Usb => self.cmd_bytes.extend(words_to_bytes(words)),
			ConnectionType::Eth => {
				let mut packet = vec![
					eth_packet::make_header0(self.cmd_packet_number, words.len() as u16),
					eth_packet::make_header1(0),
				];
				self.cmd_packet_number = (self.cmd_packet_number + 1) % eth_packet::PACKET_NUMBER_MODULO;
				packet.extend_from_slice(words);
				self.cmd_packets.push_back(words_to_bytes(&packet));
			},
		}
	}

	/// Execute the stack stored at the given stack memory offset and queue its response.
	fn execute_stack(&mut self, connection_type: ConnectionType, offset_words: u16) {
		let mut stack_words = Vec::new();
		let mut address = registers::STACK_MEMORY_BEGIN + offset_words;
		while let Some(&word) = self.registers.get(&address) {
			stack_words.push(word);
			if word >> 24 == u32::from(command_type::STACK_END) {
				break;
			}
			address += 1;
		}

		let mut payload = Vec::new();
		let mut rest = &stack_words[..];
		while !rest.is_empty() {
			let (command, used) = match StackCommand::from_words(rest) {
				Ok(decoded) => decoded,
				Err(_) => break,
			};
			rest = &rest[used..];

			match command {
				StackCommand::VMERead {
					address,
					amod,
					max_transfers,
					..
				} if amod.is_block_mode() => {
					payload.push(make_frame_header(frame_types::BLOCK_READ, 0, 0, max_transfers));
					for i in 0..u32::from(max_transfers) {
						payload.push(address.wrapping_add(i));
					}
				},
				StackCommand::VMERead { address, .. } => {
					payload.push(self.read_values.get(&address).copied().unwrap_or(0));
				},
				StackCommand::WriteMarker { value } => payload.push(value),
				StackCommand::WriteSpecial { kind } => payload.push(0xabcd_0000 | u32::from(kind)),
				_ => (),
			}
		}

		let mut response = vec![make_frame_header(frame_types::STACK_FRAME, 0, 0, payload.len() as u16)];
		response.extend_from_slice(&payload);
		self.queue_cmd_response(connection_type, &response);
	}

	/// Interpret one super command buffer and queue the mirror response.
	fn handle_super_request(&mut self, connection_type: ConnectionType, words: &[u32]) {
		let mut payload = Vec::new();
		let mut exec_offset = None;
		let mut index = 0;

		while index < words.len() {
			let word = words[index];
			let opcode = (word >> 16) as u16;
			let arg = word as u16;
			index += 1;

			match opcode {
				super_commands::CMD_BUFFER_START | super_commands::CMD_BUFFER_END => (),
				super_commands::REFERENCE_WORD => payload.push(word),
				super_commands::READ_LOCAL => {
					payload.push(word);
					payload.push(self.registers.get(&arg).copied().unwrap_or(0));
				},
				super_commands::WRITE_LOCAL => {
					let value = words[index];
					index += 1;
					payload.push(word);
					self.registers.insert(arg, value);
					if arg == registers::IMMEDIATE_STACK_EXEC {
						exec_offset = Some(value as u16);
					}
				},
				_ => (),
			}
		}

		let mut response = vec![make_frame_header(frame_types::SUPER_FRAME, 0, 0, payload.len() as u16)];
		response.extend_from_slice(&payload);
		self.queue_cmd_response(connection_type, &response);

		// The stack response follows the super response of the exec register write.
		if let Some(offset) = exec_offset {
			self.execute_stack(connection_type, offset);
		}
	}
}

impl Transport for MockTransport {
	fn connect(&mut self) -> Result<(), TransportError> {
		let mut inner = self.inner.lock().unwrap();
		inner.connected = true;
		inner.connect_time = Some(Instant::now());
		Ok(())
	}

	fn disconnect(&mut self) -> Result<(), TransportError> {
		self.inner.lock().unwrap().connected = false;
		Ok(())
	}

	fn is_connected(&self) -> bool {
		self.inner.lock().unwrap().connected
	}

	fn connection_type(&self) -> ConnectionType {
		self.connection_type
	}

	fn connection_info(&self) -> String {
		"mock transport".into()
	}

	fn write(&mut self, pipe: Pipe, data: &[u8]) -> Result<(), TransportError> {
		assert!(pipe == Pipe::Command, "the mock only accepts command pipe writes");
		let connection_type = self.connection_type;
		let mut inner = self.inner.lock().unwrap();
		inner.handle_super_request(connection_type, &bytes_to_words(data));
		Ok(())
	}

	fn read(&mut self, pipe: Pipe, dst: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
		match pipe {
			Pipe::Command => {
				let mut inner = self.inner.lock().unwrap();
				match self.connection_type {
					ConnectionType::Usb => {
						if inner.cmd_bytes.is_empty() {
							return Err(TransportError::Timeout);
						}
						let count = dst.len().min(inner.cmd_bytes.len());
						for byte in dst.iter_mut().take(count) {
							*byte = inner.cmd_bytes.pop_front().unwrap();
						}
						Ok(count)
					},
					ConnectionType::Eth => match inner.cmd_packets.pop_front() {
						Some(packet) => {
							let count = dst.len().min(packet.len());
							dst[..count].copy_from_slice(&packet[..count]);
							Ok(count)
						},
						None => Err(TransportError::Timeout),
					},
				}
			},

			Pipe::Data => {
				let deadline = Instant::now() + timeout;
				loop {
					{
						let mut inner = self.inner.lock().unwrap();
						let connect_time = inner.connect_time.ok_or(TransportError::NotConnected)?;

						let due = match inner.data_script.front() {
							Some((offset, _)) => connect_time + *offset <= Instant::now(),
							None => false,
						};

						if due {
							let (_, chunk) = inner.data_script.pop_front().unwrap();
							let count = dst.len().min(chunk.len());
							dst[..count].copy_from_slice(&chunk[..count]);
							if count < chunk.len() {
								// Give the rest back, readable immediately.
								inner.data_script.push_front((Duration::ZERO, chunk[count..].to_vec()));
							}
							return Ok(count);
						}
					}

					if Instant::now() >= deadline {
						return Err(TransportError::Timeout);
					}
					std::thread::sleep(Duration::from_millis(1));
				}
			},
		}
	}
}
