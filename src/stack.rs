//! Stack commands: the controller-resident readout programs.
//!
//! A stack is an encoded sequence of commands, delimited by [`StackCommand::StackStart`]
//! and [`StackCommand::StackEnd`], that the controller executes on a trigger.
//! The encoded form is a stream of 32-bit words with the command opcode in the
//! top byte of the first word.

use serde::{Deserialize, Serialize};

use crate::error::InvalidStackCommand;

/// Command opcode values, found in the top byte of the first encoded word.
#[rustfmt::skip]
pub mod command_type {
	pub const STACK_START    : u8 = 0xF3;
	pub const STACK_END      : u8 = 0xF4;
	pub const VME_READ       : u8 = 0x12;
	pub const VME_WRITE      : u8 = 0x23;
	pub const WRITE_SPECIAL  : u8 = 0xC1;
	pub const WRITE_MARKER   : u8 = 0xC2;
	/// Software only, executed by the host between stack parts, never uploaded.
	pub const SOFTWARE_DELAY : u8 = 0xC8;
}

/// Values for the [`StackCommand::WriteSpecial`] command.
#[rustfmt::skip]
pub mod special_words {
	pub const TIMESTAMP : u8 = 0x00;
	pub const ACCU      : u8 = 0x01;
}

/// The maximum size in words of an encoded stack executed through the command pipe,
/// including the StackStart/StackEnd pair.
pub const IMMEDIATE_STACK_MAX_SIZE: u16 = 1000;

/// VME address modifiers, selecting the transfer semantics of a cycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum AddressMode {
	/// A16 single cycle.
	A16,
	/// A24 single cycle.
	A24,
	/// A32 single cycle.
	A32,
	/// A32 block transfer.
	Blt32,
	/// A32 multiplexed 64-bit block transfer.
	Mblt64,
}

impl AddressMode {
	/// The raw VME address modifier value.
	pub fn raw(self) -> u8 {
		match self {
			Self::A16 => 0x29,
			Self::A24 => 0x39,
			Self::A32 => 0x09,
			Self::Blt32 => 0x0B,
			Self::Mblt64 => 0x08,
		}
	}

	pub fn from_raw(raw: u8) -> Option<Self> {
		match raw {
			0x29 => Some(Self::A16),
			0x39 => Some(Self::A24),
			0x09 => Some(Self::A32),
			0x0B => Some(Self::Blt32),
			0x08 => Some(Self::Mblt64),
			_ => None,
		}
	}

	/// Check if this address modifier selects a block transfer.
	///
	/// Block reads produce BlockRead frames in the response stream instead of single data words.
	pub fn is_block_mode(self) -> bool {
		matches!(self, Self::Blt32 | Self::Mblt64)
	}
}

/// The data width of a single cycle VME access.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataWidth {
	D16,
	D32,
}

impl DataWidth {
	pub fn raw(self) -> u8 {
		match self {
			Self::D16 => 0x1,
			Self::D32 => 0x2,
		}
	}

	pub fn from_raw(raw: u8) -> Option<Self> {
		match raw {
			0x1 => Some(Self::D16),
			0x2 => Some(Self::D32),
			_ => None,
		}
	}
}

/// One command of a readout or init stack.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum StackCommand {
	/// Begin-of-stack sentinel.
	StackStart,

	/// End-of-stack sentinel.
	StackEnd,

	/// A host side delay between stack parts. Never uploaded to the controller.
	SoftwareDelay { millis: u32 },

	/// A single cycle or block read from the VME bus.
	///
	/// For block address modifiers `max_transfers` bounds the number of bus cycles
	/// and `width` is ignored (block transfers are always full width).
	VMERead {
		address: u32,
		amod: AddressMode,
		width: DataWidth,
		max_transfers: u16,
	},

	/// A single cycle write to the VME bus.
	VMEWrite {
		address: u32,
		amod: AddressMode,
		width: DataWidth,
		value: u32,
	},

	/// Write a literal marker word into the response stream.
	WriteMarker { value: u32 },

	/// Write a controller generated special word (timestamp, accumulator) into the response stream.
	WriteSpecial { kind: u8 },
}

impl StackCommand {
	/// A single cycle VME read.
	pub fn vme_read(address: u32, amod: AddressMode, width: DataWidth) -> Self {
		Self::VMERead {
			address,
			amod,
			width,
			max_transfers: 1,
		}
	}

	/// A block read of up to `max_transfers` cycles.
	pub fn vme_block_read(address: u32, amod: AddressMode, max_transfers: u16) -> Self {
		Self::VMERead {
			address,
			amod,
			width: DataWidth::D32,
			max_transfers,
		}
	}

	/// Check if this command is a software delay.
	pub fn is_software_delay(&self) -> bool {
		matches!(self, Self::SoftwareDelay { .. })
	}

	/// Check if this command produces a `Result` when its response is parsed.
	pub fn produces_result(&self) -> bool {
		!matches!(self, Self::StackStart | Self::StackEnd)
	}

	/// The encoded size of this command in words. Fixed per variant.
	pub fn encoded_size(&self) -> u16 {
		match self {
			Self::StackStart | Self::StackEnd => 1,
			Self::SoftwareDelay { .. } => 1,
			Self::VMERead { .. } => 2,
			Self::VMEWrite { .. } => 3,
			Self::WriteMarker { .. } => 2,
			Self::WriteSpecial { .. } => 1,
		}
	}

	/// Append the encoded words of this command to `out`.
	pub fn encode_into(&self, out: &mut Vec<u32>) {
		match *self {
			Self::StackStart => out.push(u32::from(command_type::STACK_START) << 24),
			Self::StackEnd => out.push(u32::from(command_type::STACK_END) << 24),
			Self::SoftwareDelay { millis } => {
				debug_assert!(millis <= 0xff_ffff);
				out.push(u32::from(command_type::SOFTWARE_DELAY) << 24 | (millis & 0xff_ffff));
			},
			Self::VMERead {
				address,
				amod,
				width,
				max_transfers,
			} => {
				let arg = if amod.is_block_mode() {
					u32::from(max_transfers)
				} else {
					u32::from(width.raw()) << 8
				};
				out.push(u32::from(command_type::VME_READ) << 24 | u32::from(amod.raw()) << 16 | arg);
				out.push(address);
			},
			Self::VMEWrite {
				address,
				amod,
				width,
				value,
			} => {
				out.push(u32::from(command_type::VME_WRITE) << 24 | u32::from(amod.raw()) << 16 | u32::from(width.raw()) << 8);
				out.push(address);
				out.push(value);
			},
			Self::WriteMarker { value } => {
				out.push(u32::from(command_type::WRITE_MARKER) << 24);
				out.push(value);
			},
			Self::WriteSpecial { kind } => {
				out.push(u32::from(command_type::WRITE_SPECIAL) << 24 | u32::from(kind));
			},
		}
	}

	/// Decode one command from the front of `words`.
	///
	/// Returns the command and the number of words consumed.
	pub fn from_words(words: &[u32]) -> Result<(Self, usize), InvalidStackCommand> {
		let first = *words.first().ok_or(InvalidStackCommand { word: 0 })?;
		let opcode = (first >> 24) as u8;
		let invalid = || InvalidStackCommand { word: first };
		let arg_word = |index: usize| words.get(index).copied().ok_or_else(invalid);

		match opcode {
			command_type::STACK_START => Ok((Self::StackStart, 1)),
			command_type::STACK_END => Ok((Self::StackEnd, 1)),
			command_type::SOFTWARE_DELAY => Ok((Self::SoftwareDelay { millis: first & 0xff_ffff }, 1)),
			command_type::VME_READ => {
				let amod = AddressMode::from_raw((first >> 16) as u8).ok_or_else(invalid)?;
				let (width, max_transfers) = if amod.is_block_mode() {
					(DataWidth::D32, (first & 0xffff) as u16)
				} else {
					(DataWidth::from_raw((first >> 8) as u8).ok_or_else(invalid)?, 1)
				};
				Ok((
					Self::VMERead {
						address: arg_word(1)?,
						amod,
						width,
						max_transfers,
					},
					2,
				))
			},
			command_type::VME_WRITE => {
				let amod = AddressMode::from_raw((first >> 16) as u8).ok_or_else(invalid)?;
				let width = DataWidth::from_raw((first >> 8) as u8).ok_or_else(invalid)?;
				Ok((
					Self::VMEWrite {
						address: arg_word(1)?,
						amod,
						width,
						value: arg_word(2)?,
					},
					3,
				))
			},
			command_type::WRITE_MARKER => Ok((Self::WriteMarker { value: arg_word(1)? }, 2)),
			command_type::WRITE_SPECIAL => Ok((Self::WriteSpecial { kind: first as u8 }, 1)),
			_ => Err(invalid()),
		}
	}
}

/// Encode a command list into an uploadable stack, adding the StackStart/StackEnd
/// sentinels unless the list already carries them.
pub fn encode_stack(commands: &[StackCommand]) -> Vec<u32> {
	let has_sentinels = commands.first() == Some(&StackCommand::StackStart);
	let mut out = Vec::with_capacity(encoded_stack_size(commands));

	if !has_sentinels {
		StackCommand::StackStart.encode_into(&mut out);
	}
	for command in commands {
		command.encode_into(&mut out);
	}
	if !has_sentinels {
		StackCommand::StackEnd.encode_into(&mut out);
	}
	out
}

/// The encoded size in words of a command list including the StackStart/StackEnd sentinels.
pub fn encoded_stack_size(commands: &[StackCommand]) -> usize {
	let has_sentinels = commands.first() == Some(&StackCommand::StackStart);
	let sentinels = if has_sentinels { 0 } else { 2 };
	commands.iter().map(|c| usize::from(c.encoded_size())).sum::<usize>() + sentinels
}

/// One named group of commands within a stack.
///
/// For readout stacks a group holds the commands reading out one VME module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackGroup {
	pub name: String,
	pub commands: Vec<StackCommand>,
}

/// An ordered list of named command groups, building up one stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackCommandBuilder {
	pub name: String,
	groups: Vec<StackGroup>,
}

impl StackCommandBuilder {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			groups: Vec::new(),
		}
	}

	/// Start a new named group. Subsequent [`Self::add_command`] calls append to it.
	pub fn begin_group(&mut self, name: impl Into<String>) -> &mut Self {
		self.groups.push(StackGroup {
			name: name.into(),
			commands: Vec::new(),
		});
		self
	}

	/// Append a command to the current group, starting an unnamed group if none exists.
	pub fn add_command(&mut self, command: StackCommand) -> &mut Self {
		if self.groups.is_empty() {
			self.begin_group(String::new());
		}
		self.groups.last_mut().unwrap().commands.push(command);
		self
	}

	pub fn groups(&self) -> &[StackGroup] {
		&self.groups
	}

	/// All commands of all groups, flattened, without the StackStart/StackEnd sentinels.
	pub fn get_commands(&self) -> Vec<StackCommand> {
		self.groups.iter().flat_map(|g| g.commands.iter().copied()).collect()
	}

	/// The encoded size in words including the StackStart/StackEnd sentinels.
	pub fn encoded_size(&self) -> usize {
		encoded_stack_size(&self.get_commands())
	}

	pub fn is_empty(&self) -> bool {
		self.groups.iter().all(|g| g.commands.is_empty())
	}
}
