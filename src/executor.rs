//! Executing command lists through the command pipe and parsing the responses.
//!
//! Command lists are split into parts that fit the controller's immediate stack,
//! each part is executed in place, and the concatenated response frames are
//! parsed back into per-command [`ExecResult`]s.

use crate::controller::Mvlc;
use crate::error::{CommandTooLarge, FrameError, FrameLengthError, InvalidFrameType, MvlcError, StackExecError};
use crate::frame::{extract_frame_info, frame_types, make_frame_header, FrameParseState};
use crate::stack::{StackCommand, StackCommandBuilder, IMMEDIATE_STACK_MAX_SIZE};

/// Options modifying how a command list is split and executed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecOptions {
	/// Execute software delays as ordinary commands instead of pausing between parts.
	pub ignore_delays: bool,

	/// Put every command into its own part.
	pub no_batching: bool,
}

/// The parsed response of a single result-producing command.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
	/// The command this result belongs to.
	pub command: StackCommand,

	/// The execution error of the part this command was in, if any.
	pub error: Option<StackExecError>,

	/// The data words produced by the command.
	pub response: Vec<u32>,
}

impl ExecResult {
	fn new(command: StackCommand) -> Self {
		Self {
			command,
			error: None,
			response: Vec::new(),
		}
	}
}

/// The results of one stack execution mapped back onto the builder's named groups.
#[derive(Debug, Clone, Default)]
pub struct GroupedStackResults {
	pub groups: Vec<GroupResults>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupResults {
	pub name: String,
	pub results: Vec<ExecResult>,
}

/// Split a command list into parts whose encoded size, including the
/// StackStart/StackEnd pair added to each part, stays within `limit` words.
///
/// Software delays start a new part and stand alone in it, unless
/// [`CommandExecOptions::ignore_delays`] is set.
pub fn split_commands(
	commands: &[StackCommand],
	options: &CommandExecOptions,
	limit: u16,
) -> Result<Vec<Vec<StackCommand>>, CommandTooLarge> {
	if options.no_batching {
		return Ok(commands.iter().map(|&command| vec![command]).collect());
	}

	let mut result = Vec::new();
	let mut first = 0;

	while first < commands.len() {
		// Two words for the StackStart/StackEnd pair wrapped around each part.
		let mut encoded_size = 2usize;
		let mut part_end = first;

		while part_end < commands.len() {
			let command = &commands[part_end];

			if command.is_software_delay() && !options.ignore_delays {
				break;
			}
			if encoded_size + usize::from(command.encoded_size()) > usize::from(limit) {
				break;
			}

			encoded_size += usize::from(command.encoded_size());
			part_end += 1;
		}

		// A delay starts its own part.
		if part_end == first && commands[first].is_software_delay() {
			part_end += 1;
		}

		if part_end == first {
			return Err(CommandTooLarge {
				encoded_size: 2 + usize::from(commands[first].encoded_size()),
				limit: usize::from(limit),
			});
		}

		result.push(commands[first..part_end].to_vec());
		first = part_end;
	}

	Ok(result)
}

#[derive(Default)]
struct ParseState {
	result: Option<ExecResult>,
	cur_block_frame: Option<FrameParseState>,
}

/// Consume commands against the payload of one stack frame.
///
/// Returns the index of the first command that could not be completed with this
/// frame; parsing resumes there with the next (continuation) frame.
fn parse_stack_frame(
	mut stack_frame: &[u32],
	commands: &[StackCommand],
	mut cmd_index: usize,
	state: &mut ParseState,
	dest: &mut Vec<ExecResult>,
) -> Result<usize, FrameError> {
	while cmd_index < commands.len() {
		let command = commands[cmd_index];
		match command {
			StackCommand::StackStart | StackCommand::StackEnd => {
				cmd_index += 1;
			},

			StackCommand::SoftwareDelay { .. } => {
				dest.push(ExecResult::new(command));
				cmd_index += 1;
			},

			StackCommand::VMERead { amod, width, .. } if !amod.is_block_mode() => {
				if stack_frame.is_empty() {
					return Ok(cmd_index);
				}

				let mut value = stack_frame[0];
				if width == crate::stack::DataWidth::D16 {
					value &= 0xffff;
				}

				let mut result = ExecResult::new(command);
				result.response.push(value);
				dest.push(result);
				stack_frame = &stack_frame[1..];
				cmd_index += 1;
			},

			StackCommand::VMERead { .. } => {
				if state.result.is_none() {
					if stack_frame.is_empty() {
						return Ok(cmd_index);
					}

					InvalidFrameType::check(stack_frame[0], frame_types::BLOCK_READ)?;
					state.cur_block_frame = Some(FrameParseState::new(stack_frame[0]));
					state.result = Some(ExecResult::new(command));
					stack_frame = &stack_frame[1..];
				}

				loop {
					let block = state.cur_block_frame.as_mut().unwrap();

					if block.words_left == 0 {
						if block.info().continues() {
							if stack_frame.is_empty() {
								return Ok(cmd_index);
							}

							InvalidFrameType::check(stack_frame[0], frame_types::BLOCK_READ)?;
							*block = FrameParseState::new(stack_frame[0]);
							stack_frame = &stack_frame[1..];
							continue;
						}

						// Block transfer complete.
						dest.push(state.result.take().unwrap());
						state.cur_block_frame = None;
						cmd_index += 1;
						break;
					}

					let to_copy = usize::from(block.words_left).min(stack_frame.len());
					if to_copy == 0 {
						// Frame exhausted in the middle of the block, resume on the next frame.
						return Ok(cmd_index);
					}

					let result = state.result.as_mut().unwrap();
					result.response.extend_from_slice(&stack_frame[..to_copy]);
					block.consume_words(to_copy as u16);
					stack_frame = &stack_frame[to_copy..];
				}
			},

			StackCommand::VMEWrite { .. } => {
				dest.push(ExecResult::new(command));
				cmd_index += 1;
			},

			StackCommand::WriteMarker { .. } | StackCommand::WriteSpecial { .. } => {
				if stack_frame.is_empty() {
					return Ok(cmd_index);
				}

				let mut result = ExecResult::new(command);
				result.response.push(stack_frame[0]);
				dest.push(result);
				stack_frame = &stack_frame[1..];
				cmd_index += 1;
			},
		}
	}

	Ok(cmd_index)
}

/// Parse a raw response buffer against the command list that produced it.
///
/// The response is a sequence of StackFrames, each optionally chained to
/// StackContinuations via the Continue flag. One [`ExecResult`] is produced per
/// result-producing command, in command order.
pub fn parse_response_list(commands: &[StackCommand], response: &[u32]) -> Result<Vec<ExecResult>, FrameError> {
	if commands.is_empty() {
		return Ok(Vec::new());
	}
	if response.is_empty() {
		return Err(FrameError::EmptyResponse);
	}

	let mut state = ParseState::default();
	let mut results = Vec::new();
	let mut cmd_index = 0;
	let mut response = response;

	while !response.is_empty() && cmd_index < commands.len() {
		InvalidFrameType::check(response[0], frame_types::STACK_FRAME)?;
		let mut info = extract_frame_info(response[0]);
		FrameLengthError::check(info.len, response.len() - 1)?;
		response = &response[1..];

		cmd_index = parse_stack_frame(&response[..usize::from(info.len)], commands, cmd_index, &mut state, &mut results)?;
		response = &response[usize::from(info.len)..];

		while info.continues() {
			if response.is_empty() {
				return Err(FrameError::UnexpectedEndOfResponse);
			}

			InvalidFrameType::check(response[0], frame_types::STACK_CONTINUATION)?;
			info = extract_frame_info(response[0]);
			FrameLengthError::check(info.len, response.len() - 1)?;
			response = &response[1..];

			cmd_index = parse_stack_frame(&response[..usize::from(info.len)], commands, cmd_index, &mut state, &mut results)?;
			response = &response[usize::from(info.len)..];
		}
	}

	Ok(results)
}

/// Parse a stack execution response and map the flat result list back onto the
/// builder's named groups.
///
/// `exec_errors` holds one optional error per executed part; the i-th error is
/// attached to the first result of the i-th group.
pub fn parse_stack_exec_response(
	builder: &StackCommandBuilder,
	response: &[u32],
	exec_errors: &[Option<StackExecError>],
) -> Result<GroupedStackResults, FrameError> {
	let results = parse_response_list(&builder.get_commands(), response)?;

	let mut ret = GroupedStackResults::default();
	let mut results = results.into_iter();
	let mut errors = exec_errors.iter();

	for group in builder.groups() {
		let mut group_results = GroupResults {
			name: group.name.clone(),
			..Default::default()
		};

		let wanted = group.commands.iter().filter(|c| c.produces_result()).count();
		group_results.results.extend(results.by_ref().take(wanted));

		if let (Some(&error), Some(first)) = (errors.next(), group_results.results.first_mut()) {
			first.error = error;
		}

		ret.groups.push(group_results);
	}

	Ok(ret)
}

/// Split a command list, execute the parts through the controller's immediate
/// stack and concatenate the response frames.
///
/// Software delay parts pause this thread and contribute an empty response frame
/// so the response still parses against the full command list. Per-part
/// execution errors are collected, not returned early.
pub fn execute_commands(
	mvlc: &mut Mvlc,
	commands: &[StackCommand],
	options: &CommandExecOptions,
) -> Result<(Vec<u32>, Vec<Option<StackExecError>>), MvlcError> {
	let parts = split_commands(commands, options, IMMEDIATE_STACK_MAX_SIZE)?;

	let mut response = Vec::new();
	let mut errors = Vec::new();

	for part in &parts {
		if let [StackCommand::SoftwareDelay { millis }] = part[..] {
			if !options.ignore_delays {
				log::debug!("execute_commands: software delay of {} ms", millis);
				std::thread::sleep(std::time::Duration::from_millis(u64::from(millis)));
			}
			response.push(make_frame_header(frame_types::STACK_FRAME, 0, 0, 0));
			errors.push(None);
			continue;
		}

		let words = mvlc.execute_stack(part)?;
		debug_assert!(!words.is_empty());
		errors.push(StackExecError::check(extract_frame_info(words[0]).flags).err());
		response.extend_from_slice(&words);
	}

	Ok((response, errors))
}

/// Execute all commands of a builder and return the results grouped by the
/// builder's groups.
pub fn execute_stack_builder(
	mvlc: &mut Mvlc,
	builder: &StackCommandBuilder,
	options: &CommandExecOptions,
) -> Result<GroupedStackResults, MvlcError> {
	let commands = builder.get_commands();
	let (response, exec_errors) = execute_commands(mvlc, &commands, options)?;
	Ok(parse_stack_exec_response(builder, &response, &exec_errors)?)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::frame::frame_flags;
	use crate::stack::{AddressMode, DataWidth};
	use assert2::assert;

	fn test_commands() -> Vec<StackCommand> {
		vec![
			StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D16),
			StackCommand::WriteMarker { value: 42 },
			StackCommand::SoftwareDelay { millis: 10 },
			StackCommand::vme_read(0x6002, AddressMode::A32, DataWidth::D32),
		]
	}

	#[test]
	fn test_split_preserves_command_order() {
		let commands = test_commands();
		let parts = split_commands(&commands, &CommandExecOptions::default(), 6).unwrap();

		let rejoined: Vec<_> = parts.iter().flatten().copied().collect();
		assert!(rejoined == commands);

		for part in &parts {
			assert!(crate::stack::encoded_stack_size(part) <= 6);
		}
	}

	#[test]
	fn test_split_no_batching() {
		let commands = test_commands();
		let parts = split_commands(&commands, &CommandExecOptions { no_batching: true, ..Default::default() }, 1000).unwrap();
		assert!(parts.len() == commands.len());
	}

	#[test]
	fn test_split_delay_stands_alone() {
		let commands = test_commands();
		let parts = split_commands(&commands, &CommandExecOptions::default(), 1000).unwrap();
		assert!(parts.len() == 3);
		assert!(parts[1] == [StackCommand::SoftwareDelay { millis: 10 }]);
	}

	#[test]
	fn test_split_ignore_delays_batches_everything() {
		let commands = test_commands();
		let options = CommandExecOptions {
			ignore_delays: true,
			..Default::default()
		};
		let parts = split_commands(&commands, &options, 1000).unwrap();
		assert!(parts.len() == 1);
	}

	#[test]
	fn test_split_oversized_command() {
		let commands = [StackCommand::VMEWrite {
			address: 0x6000,
			amod: AddressMode::A32,
			width: DataWidth::D32,
			value: 1,
		}];
		// The write encodes to 3 words, plus 2 sentinel words that is over the limit of 4.
		let error = split_commands(&commands, &CommandExecOptions::default(), 4).unwrap_err();
		assert!(error.encoded_size == 5);
		assert!(error.limit == 4);
	}

	#[test]
	fn test_parse_single_read_d16_mask() {
		// Scenario: one D16 read inside a single two word stack frame.
		let commands = [
			StackCommand::StackStart,
			StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D16),
			StackCommand::StackEnd,
		];
		let response = [0xF300_0002, 0x1234_abcd, 0x0000_0000];

		let results = parse_response_list(&commands, &response).unwrap();
		assert!(results.len() == 1);
		assert!(results[0].response == [0x1234_abcd & 0xffff]);
	}

	#[test]
	fn test_parse_block_read_across_continuation() {
		// Scenario: one 8 transfer block read split over two stack frames,
		// each holding a 4 word block frame.
		let commands = [
			StackCommand::StackStart,
			StackCommand::vme_block_read(0x6100, AddressMode::Blt32, 8),
			StackCommand::StackEnd,
		];

		let mut response = Vec::new();
		response.push(make_frame_header(frame_types::STACK_FRAME, 0, frame_flags::CONTINUE, 5));
		response.push(make_frame_header(frame_types::BLOCK_READ, 0, frame_flags::CONTINUE, 4));
		response.extend_from_slice(&[1, 2, 3, 4]);
		response.push(make_frame_header(frame_types::STACK_CONTINUATION, 0, 0, 5));
		response.push(make_frame_header(frame_types::BLOCK_READ, 0, 0, 4));
		response.extend_from_slice(&[5, 6, 7, 8]);

		let results = parse_response_list(&commands, &response).unwrap();
		assert!(results.len() == 1);
		assert!(results[0].response == [1, 2, 3, 4, 5, 6, 7, 8]);
	}

	#[test]
	fn test_parse_result_count_and_order() {
		let commands = [
			StackCommand::StackStart,
			StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D32),
			StackCommand::VMEWrite {
				address: 0x6008,
				amod: AddressMode::A32,
				width: DataWidth::D16,
				value: 1,
			},
			StackCommand::WriteMarker { value: 0xaffe },
			StackCommand::StackEnd,
		];
		let response = [0xF300_0002, 0x11u32, 0xaffeu32];

		let results = parse_response_list(&commands, &response).unwrap();
		let producing = commands.iter().filter(|c| c.produces_result()).count();
		assert!(results.len() == producing);
		assert!(results[0].command == commands[1]);
		assert!(results[1].command == commands[2]);
		assert!(results[1].response.is_empty());
		assert!(results[2].response == [0xaffe]);
	}

	#[test]
	fn test_parse_rejects_bad_outer_frame() {
		let commands = [StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D32)];
		let response = [0xF500_0001, 0x1];
		assert!(parse_response_list(&commands, &response).is_err());
	}

	#[test]
	fn test_grouped_results() {
		let mut builder = StackCommandBuilder::new("init");
		builder.begin_group("reset");
		builder.add_command(StackCommand::VMEWrite {
			address: 0x6008,
			amod: AddressMode::A32,
			width: DataWidth::D16,
			value: 1,
		});
		builder.begin_group("readout");
		builder.add_command(StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D16));

		let response = [0xF300_0001, 0x42u32];
		let exec_errors = [None, Some(StackExecError { flags: frame_flags::BUS_ERROR })];

		let grouped = parse_stack_exec_response(&builder, &response, &exec_errors).unwrap();
		assert!(grouped.groups.len() == 2);
		assert!(grouped.groups[0].name == "reset");
		assert!(grouped.groups[0].results.len() == 1);
		assert!(grouped.groups[0].results[0].error.is_none());
		assert!(grouped.groups[1].results[0].error == Some(StackExecError { flags: frame_flags::BUS_ERROR }));
		assert!(grouped.groups[1].results[0].response == [0x42]);
	}
}
