//! The controller handle: command pipe transactions, register access, stack
//! upload and immediate stack execution.

use std::time::Duration;

use crate::config::{ConnectionConfig, CrateConfig};
use crate::error::{CommandTooLarge, FrameError, InvalidFrameType, MvlcError, StackExecError, TransportError};
use crate::executor::parse_response_list;
use crate::frame::{extract_frame_info, frame_flags, frame_types, STACK_COUNT};
use crate::stack::{encode_stack, encoded_stack_size, AddressMode, DataWidth, StackCommand, StackCommandBuilder, IMMEDIATE_STACK_MAX_SIZE};
use crate::transport::eth::EthTransport;
use crate::transport::{eth_packet, ConnectionType, EthPipeCounters, Pipe, Transport};

/// Super command opcodes, occupying the top 16 bits of a command pipe request word.
#[rustfmt::skip]
pub mod super_commands {
	pub const CMD_BUFFER_START : u16 = 0xF100;
	pub const CMD_BUFFER_END   : u16 = 0xF200;
	pub const REFERENCE_WORD   : u16 = 0x0101;
	pub const READ_LOCAL       : u16 = 0x0102;
	pub const WRITE_LOCAL      : u16 = 0x0204;
}

/// The controller's internal register map.
#[rustfmt::skip]
pub mod registers {
	/// Writing a stack memory word offset executes the stack stored there.
	pub const IMMEDIATE_STACK_EXEC : u16 = 0x1108;

	/// DAQ mode enable: readout stacks only trigger while this register is 1.
	pub const DAQ_MODE             : u16 = 0x1300;

	/// Start of the stack memory window, word addressed.
	pub const STACK_MEMORY_BEGIN   : u16 = 0x2000;

	/// Size of the stack memory window in words.
	pub const STACK_MEMORY_WORDS   : u16 = 0x1000;

	/// Words at the start of stack memory reserved for immediate execution.
	pub const IMMEDIATE_STACK_RESERVED_WORDS : u16 = 0x400;

	/// Trigger source value disabling a stack.
	pub const TRIGGER_NONE: u32 = 0;

	/// Trigger source register of a readout stack.
	pub fn stack_trigger(stack: u8) -> u16 {
		0x1100 + 4 * u16::from(stack)
	}

	/// Stack memory word offset register of a readout stack.
	pub fn stack_offset(stack: u8) -> u16 {
		0x1200 + 4 * u16::from(stack)
	}
}

/// Default timeout for command pipe reads.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

fn super_word(opcode: u16, arg: u16) -> u32 {
	u32::from(opcode) << 16 | u32::from(arg)
}

/// A handle to one MVLC controller.
///
/// Owns the transport; command pipe transactions go through this handle, the
/// readout worker uses [`Self::data_read`] to drain the data pipe.
pub struct Mvlc {
	transport: Box<dyn Transport + Send>,
	/// Accumulates command pipe bytes across transport reads.
	read_buffer: Vec<u8>,
	next_reference: u16,
	disable_triggers_on_connect: bool,
}

impl Mvlc {
	pub fn new(transport: Box<dyn Transport + Send>) -> Self {
		Self {
			transport,
			read_buffer: Vec::new(),
			next_reference: 1,
			disable_triggers_on_connect: false,
		}
	}

	/// Create a controller for the connection described in a crate config.
	pub fn from_config(config: &CrateConfig) -> Result<Self, MvlcError> {
		match &config.connection {
			ConnectionConfig::Eth { host } => Ok(Self::new(Box::new(EthTransport::new(host.clone())))),
			#[cfg(feature = "usb")]
			ConnectionConfig::Usb { index, serial } => {
				use crate::transport::usb::{DeviceSelection, UsbTransport};
				let selection = match (index, serial) {
					(_, Some(serial)) => DeviceSelection::Serial(serial.clone()),
					(Some(index), None) => DeviceSelection::Index(*index),
					(None, None) => DeviceSelection::First,
				};
				Ok(Self::new(Box::new(UsbTransport::new(selection))))
			},
			#[cfg(not(feature = "usb"))]
			ConnectionConfig::Usb { .. } => Err(TransportError::NotConnected.into()),
		}
	}

	/// Disable all stack triggers directly after connecting.
	///
	/// Guards against a controller still spilling data from a previous, unclean run.
	pub fn set_disable_triggers_on_connect(&mut self, disable: bool) {
		self.disable_triggers_on_connect = disable;
	}

	pub fn connect(&mut self) -> Result<(), MvlcError> {
		self.transport.connect()?;
		self.read_buffer.clear();
		if self.disable_triggers_on_connect {
			self.disable_all_triggers()?;
		}
		Ok(())
	}

	pub fn disconnect(&mut self) -> Result<(), MvlcError> {
		self.transport.disconnect()?;
		Ok(())
	}

	pub fn is_connected(&self) -> bool {
		self.transport.is_connected()
	}

	pub fn connection_type(&self) -> ConnectionType {
		self.transport.connection_type()
	}

	pub fn connection_info(&self) -> String {
		self.transport.connection_info()
	}

	/// Read from the data pipe into `dst`.
	pub fn data_read(&mut self, dst: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
		self.transport.read(Pipe::Data, dst, timeout)
	}

	/// Receive counters of the Ethernet data pipe, if this is an Ethernet connection.
	pub fn eth_data_counters(&self) -> Option<EthPipeCounters> {
		self.transport.eth_counters(Pipe::Data)
	}

	fn reference_word(&mut self) -> u16 {
		let reference = self.next_reference;
		self.next_reference = self.next_reference.wrapping_add(1).max(1);
		reference
	}

	/// Pull more command pipe bytes into the read buffer.
	///
	/// Ethernet datagrams carry the two word packet header, which is stripped here.
	fn fill_read_buffer(&mut self, timeout: Duration) -> Result<(), TransportError> {
		let mut chunk = [0u8; crate::transport::eth::MAX_PACKET_SIZE];
		let received = self.transport.read(Pipe::Command, &mut chunk, timeout)?;

		let payload = match self.transport.connection_type() {
			ConnectionType::Eth if received >= eth_packet::HEADER_BYTES => &chunk[eth_packet::HEADER_BYTES..received],
			ConnectionType::Eth => &chunk[..0],
			ConnectionType::Usb => &chunk[..received],
		};
		self.read_buffer.extend_from_slice(payload);
		Ok(())
	}

	/// Take `count` whole words from the command pipe, reading more as needed.
	fn read_words(&mut self, count: usize) -> Result<Vec<u32>, MvlcError> {
		while self.read_buffer.len() < count * 4 {
			self.fill_read_buffer(DEFAULT_TIMEOUT)?;
		}

		let words = self.read_buffer[..count * 4]
			.chunks_exact(4)
			.map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
			.collect();
		self.read_buffer.drain(..count * 4);
		Ok(words)
	}

	/// Read one frame of the expected type from the command pipe.
	///
	/// Returns the header word followed by the payload words.
	fn read_frame(&mut self, expected_type: u8) -> Result<Vec<u32>, MvlcError> {
		let header = self.read_words(1)?[0];
		InvalidFrameType::check(header, expected_type)?;

		let info = extract_frame_info(header);
		let mut frame = Vec::with_capacity(usize::from(info.len) + 1);
		frame.push(header);
		frame.extend(self.read_words(usize::from(info.len))?);
		Ok(frame)
	}

	fn write_words(&mut self, words: &[u32]) -> Result<(), TransportError> {
		let mut bytes = Vec::with_capacity(words.len() * 4);
		for word in words {
			bytes.extend_from_slice(&word.to_le_bytes());
		}
		self.transport.write(Pipe::Command, &bytes)
	}

	/// Run one super command transaction and return the response frame payload.
	///
	/// The response mirrors the request words; the mirrored reference word is verified.
	fn super_transaction(&mut self, reference: u16, request: &[u32]) -> Result<Vec<u32>, MvlcError> {
		log::trace!("super transaction, {} request words", request.len());
		self.write_words(request)?;

		let response = self.read_frame(frame_types::SUPER_FRAME)?;
		let payload = &response[1..];

		if payload.first() != Some(&super_word(super_commands::REFERENCE_WORD, reference)) {
			return Err(FrameError::UnexpectedEndOfResponse.into());
		}
		Ok(payload.to_vec())
	}

	pub fn read_register(&mut self, address: u16) -> Result<u32, MvlcError> {
		let reference = self.reference_word();
		let request = [
			super_word(super_commands::CMD_BUFFER_START, 0),
			super_word(super_commands::REFERENCE_WORD, reference),
			super_word(super_commands::READ_LOCAL, address),
			super_word(super_commands::CMD_BUFFER_END, 0),
		];

		let payload = self.super_transaction(reference, &request)?;
		payload.last().copied().ok_or_else(|| FrameError::UnexpectedEndOfResponse.into())
	}

	pub fn write_register(&mut self, address: u16, value: u32) -> Result<(), MvlcError> {
		let reference = self.reference_word();
		let request = [
			super_word(super_commands::CMD_BUFFER_START, 0),
			super_word(super_commands::REFERENCE_WORD, reference),
			super_word(super_commands::WRITE_LOCAL, address),
			value,
			super_word(super_commands::CMD_BUFFER_END, 0),
		];

		self.super_transaction(reference, &request)?;
		Ok(())
	}

	/// Upload an encoded stack to stack memory at the given word offset.
	pub fn upload_stack(&mut self, offset_words: u16, commands: &[StackCommand]) -> Result<(), MvlcError> {
		let words = encode_stack(commands);

		if usize::from(offset_words) + words.len() > usize::from(registers::STACK_MEMORY_WORDS) {
			return Err(CommandTooLarge {
				encoded_size: words.len(),
				limit: usize::from(registers::STACK_MEMORY_WORDS) - usize::from(offset_words),
			}
			.into());
		}

		let reference = self.reference_word();
		let mut request = Vec::with_capacity(words.len() * 2 + 3);
		request.push(super_word(super_commands::CMD_BUFFER_START, 0));
		request.push(super_word(super_commands::REFERENCE_WORD, reference));
		for (index, &word) in words.iter().enumerate() {
			let address = registers::STACK_MEMORY_BEGIN + offset_words + index as u16;
			request.push(super_word(super_commands::WRITE_LOCAL, address));
			request.push(word);
		}
		request.push(super_word(super_commands::CMD_BUFFER_END, 0));

		self.super_transaction(reference, &request)?;
		Ok(())
	}

	/// Execute a command list through the immediate stack.
	///
	/// Returns the complete response including the StackFrame and
	/// StackContinuation headers. Error flags on the response frames are
	/// reported through the returned words, not as an error.
	pub fn execute_stack(&mut self, commands: &[StackCommand]) -> Result<Vec<u32>, MvlcError> {
		let encoded_size = encoded_stack_size(commands);
		if encoded_size > usize::from(IMMEDIATE_STACK_MAX_SIZE) {
			return Err(CommandTooLarge {
				encoded_size,
				limit: usize::from(IMMEDIATE_STACK_MAX_SIZE),
			}
			.into());
		}

		self.upload_stack(0, commands)?;
		self.write_register(registers::IMMEDIATE_STACK_EXEC, 0)?;

		let mut response = self.read_frame(frame_types::STACK_FRAME)?;
		let mut flags = extract_frame_info(response[0]).flags;

		while flags & frame_flags::CONTINUE != 0 {
			let continuation = self.read_frame(frame_types::STACK_CONTINUATION)?;
			flags = extract_frame_info(continuation[0]).flags;
			response.extend_from_slice(&continuation);
		}

		Ok(response)
	}

	/// A single cycle VME read.
	pub fn vme_read(&mut self, address: u32, amod: AddressMode, width: DataWidth) -> Result<u32, MvlcError> {
		let commands = [StackCommand::vme_read(address, amod, width)];
		let response = self.execute_stack(&commands)?;
		StackExecError::check(extract_frame_info(response[0]).flags)?;

		let results = parse_response_list(&commands, &response)?;
		results
			.first()
			.and_then(|r| r.response.first())
			.copied()
			.ok_or_else(|| FrameError::UnexpectedEndOfResponse.into())
	}

	/// A single cycle VME write.
	pub fn vme_write(&mut self, address: u32, amod: AddressMode, width: DataWidth, value: u32) -> Result<(), MvlcError> {
		let commands = [StackCommand::VMEWrite { address, amod, width, value }];
		let response = self.execute_stack(&commands)?;
		StackExecError::check(extract_frame_info(response[0]).flags)?;
		Ok(())
	}

	/// A block read of up to `max_transfers` cycles.
	pub fn vme_block_read(&mut self, address: u32, amod: AddressMode, max_transfers: u16) -> Result<Vec<u32>, MvlcError> {
		let commands = [StackCommand::vme_block_read(address, amod, max_transfers)];
		let response = self.execute_stack(&commands)?;
		StackExecError::check(extract_frame_info(response[0]).flags)?;

		let mut results = parse_response_list(&commands, &response)?;
		match results.pop() {
			Some(result) => Ok(result.response),
			None => Err(FrameError::UnexpectedEndOfResponse.into()),
		}
	}

	/// Upload the readout stacks and store their memory offsets.
	///
	/// Stack 0 is the immediate stack; readout stack `i` becomes controller
	/// stack `i + 1`, matching the stack numbers found in the data stream.
	pub fn setup_readout_stacks(&mut self, stacks: &[StackCommandBuilder]) -> Result<(), MvlcError> {
		let mut offset = registers::IMMEDIATE_STACK_RESERVED_WORDS;

		for (index, builder) in stacks.iter().enumerate() {
			let stack_id = index as u8 + 1;
			debug_assert!(usize::from(stack_id) < STACK_COUNT);

			let commands = builder.get_commands();
			self.upload_stack(offset, &commands)?;
			self.write_register(registers::stack_offset(stack_id), u32::from(offset))?;

			offset += encoded_stack_size(&commands) as u16;
		}

		Ok(())
	}

	/// Write the per stack trigger source registers for the readout stacks.
	pub fn write_stack_triggers(&mut self, triggers: &[u32]) -> Result<(), MvlcError> {
		for (index, &trigger) in triggers.iter().enumerate() {
			self.write_register(registers::stack_trigger(index as u8 + 1), trigger)?;
		}
		Ok(())
	}

	pub fn disable_all_triggers(&mut self) -> Result<(), MvlcError> {
		for stack in 0..STACK_COUNT as u8 {
			self.write_register(registers::stack_trigger(stack), registers::TRIGGER_NONE)?;
		}
		Ok(())
	}

	/// Enable or disable DAQ mode. Readout stacks only trigger while enabled.
	pub fn set_daq_mode(&mut self, enabled: bool) -> Result<(), MvlcError> {
		self.write_register(registers::DAQ_MODE, u32::from(enabled))
	}
}
