use assert2::assert;

use mvlc::executor::{parse_response_list, split_commands, CommandExecOptions};
use mvlc::frame::{frame_flags, frame_types, make_frame_header};
use mvlc::stack::{encoded_stack_size, AddressMode, DataWidth, StackCommand};

fn example_commands() -> Vec<StackCommand> {
	vec![
		StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D16),
		StackCommand::vme_read(0x6002, AddressMode::A32, DataWidth::D16),
		StackCommand::WriteMarker { value: 0x1111_1111 },
		StackCommand::SoftwareDelay { millis: 5 },
		StackCommand::VMEWrite {
			address: 0x603a,
			amod: AddressMode::A32,
			width: DataWidth::D16,
			value: 1,
		},
		StackCommand::vme_block_read(0x6100, AddressMode::Blt32, 16),
		StackCommand::WriteMarker { value: 0x2222_2222 },
	]
}

/// Build a well formed response buffer for a command list, one stack frame per
/// response, the way the controller would after executing the whole list at once.
fn build_response(commands: &[StackCommand]) -> Vec<u32> {
	let mut payload = Vec::new();
	for command in commands {
		match command {
			StackCommand::VMERead { address, amod, max_transfers, .. } if amod.is_block_mode() => {
				payload.push(make_frame_header(frame_types::BLOCK_READ, 0, 0, *max_transfers));
				for i in 0..u32::from(*max_transfers) {
					payload.push(address.wrapping_add(i));
				}
			},
			StackCommand::VMERead { address, .. } => payload.push(*address),
			StackCommand::WriteMarker { value } => payload.push(*value),
			StackCommand::WriteSpecial { kind } => payload.push(u32::from(*kind)),
			_ => (),
		}
	}

	let mut response = vec![make_frame_header(frame_types::STACK_FRAME, 0, 0, payload.len() as u16)];
	response.extend_from_slice(&payload);
	response
}

#[test]
fn split_commands_round_trip() {
	let commands = example_commands();

	for limit in [5u16, 8, 16, 1000] {
		let parts = split_commands(&commands, &CommandExecOptions::default(), limit).unwrap();

		// Concatenating the parts restores the input sequence.
		let rejoined: Vec<_> = parts.iter().flatten().copied().collect();
		assert!(rejoined == commands, "limit: {}", limit);

		// Each part's encoded size, including the added sentinels, fits the limit.
		for part in &parts {
			assert!(encoded_stack_size(part) <= usize::from(limit), "limit: {}", limit);
		}
	}
}

#[test]
fn split_commands_delays_stand_alone() {
	let commands = example_commands();
	let parts = split_commands(&commands, &CommandExecOptions::default(), 1000).unwrap();

	for part in &parts {
		if part.iter().any(StackCommand::is_software_delay) {
			assert!(part.len() == 1);
		}
	}
}

#[test]
fn response_parse_determinism() {
	let commands = example_commands();
	let response = build_response(&commands);

	let results = parse_response_list(&commands, &response).unwrap();

	let producing = commands.iter().filter(|c| c.produces_result()).count();
	assert!(results.len() == producing);

	// Results come back in command order.
	let mut expected = commands.iter().filter(|c| c.produces_result());
	for result in &results {
		assert!(Some(&result.command) == expected.next());
	}

	// Parsing the same response again yields the same results.
	let again = parse_response_list(&commands, &response).unwrap();
	assert!(again == results);
}

#[test]
fn scenario_single_vme_read() {
	// [StackStart, VMERead(0x6000, A32, D16), StackEnd] answered by a single
	// two word stack frame.
	let commands = [
		StackCommand::StackStart,
		StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D16),
		StackCommand::StackEnd,
	];
	let response = [0xF300_0002u32, 0x1234_abcd, 0];

	let results = parse_response_list(&commands, &response).unwrap();
	assert!(results.len() == 1);
	assert!(results[0].command == commands[1]);
	// The D16 data width masks the read value to 16 bits.
	assert!(results[0].response == [0xabcd]);
}

#[test]
fn scenario_block_read_across_continue() {
	// One block read of 8 transfers, split over two stack frames chained with
	// the Continue flag, each containing a 4 word block read frame.
	let commands = [
		StackCommand::StackStart,
		StackCommand::vme_block_read(0x6100, AddressMode::Blt32, 8),
		StackCommand::StackEnd,
	];

	let mut response = Vec::new();
	response.push(make_frame_header(frame_types::STACK_FRAME, 0, frame_flags::CONTINUE, 5));
	response.push(make_frame_header(frame_types::BLOCK_READ, 0, frame_flags::CONTINUE, 4));
	response.extend_from_slice(&[0xa1, 0xa2, 0xa3, 0xa4]);
	response.push(make_frame_header(frame_types::STACK_CONTINUATION, 0, 0, 5));
	response.push(make_frame_header(frame_types::BLOCK_READ, 0, 0, 4));
	response.extend_from_slice(&[0xa5, 0xa6, 0xa7, 0xa8]);

	let results = parse_response_list(&commands, &response).unwrap();
	assert!(results.len() == 1);
	assert!(results[0].response.len() == 8);
	assert!(results[0].response == [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8]);
}

#[test]
fn oversized_command_does_not_split() {
	let commands = [StackCommand::vme_block_read(0x6100, AddressMode::Mblt64, 0xffff)];
	// A block read encodes to 2 words; with the sentinel pair that is 4 words.
	let error = split_commands(&commands, &CommandExecOptions::default(), 3).unwrap_err();
	assert!(error.encoded_size == 4);
	assert!(error.limit == 3);
}
