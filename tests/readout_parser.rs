mod common;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert2::assert;

use mvlc::buffer::BufferQueues;
use mvlc::frame::{frame_flags, frame_types, make_frame_header, make_system_event_header, system_event};
use mvlc::parser::{
	make_readout_parser, parse_readout_buffer, run_readout_parser, ModuleData, ReadoutParserCallbacks, ReadoutParserCounters,
	ReadoutParserState,
};
use mvlc::stack::{AddressMode, DataWidth, StackCommand, StackCommandBuilder};
use mvlc::transport::{eth_packet, ConnectionType};
use mvlc::util::Protected;

/// One readout stack: event 0 with two modules.
///
/// Module 0 reads a two word prefix followed by a block transfer, module 1
/// reads a single word.
fn example_stacks() -> Vec<StackCommandBuilder> {
	let mut event = StackCommandBuilder::new("event0");
	event.begin_group("mdpp16");
	event.add_command(StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D16));
	event.add_command(StackCommand::vme_read(0x6002, AddressMode::A32, DataWidth::D16));
	event.add_command(StackCommand::vme_block_read(0x6100, AddressMode::Blt32, 4));
	event.begin_group("scaler");
	event.add_command(StackCommand::vme_read(0x7000, AddressMode::A32, DataWidth::D32));
	vec![event]
}

/// The words of one complete event for [`example_stacks`], built as a frame
/// chain: a stack frame holding the prefix and the first half of the block,
/// and a continuation holding the rest.
fn example_event_words(seed: u32) -> Vec<u32> {
	let mut words = Vec::new();
	// Stack 1 serves event 0. 5 payload words, continues.
	words.push(make_frame_header(frame_types::STACK_FRAME, 1, frame_flags::CONTINUE, 5));
	words.push(seed); // module 0 prefix word 0
	words.push(seed + 1); // module 0 prefix word 1
	words.push(make_frame_header(frame_types::BLOCK_READ, 0, frame_flags::CONTINUE, 2));
	words.push(seed + 2);
	words.push(seed + 3);
	// Continuation: rest of the block and module 1.
	words.push(make_frame_header(frame_types::STACK_CONTINUATION, 1, 0, 4));
	words.push(make_frame_header(frame_types::BLOCK_READ, 0, 0, 2));
	words.push(seed + 4);
	words.push(seed + 5);
	words.push(seed + 0x100); // module 1 single word
	words
}

type RecordedEvent = (usize, Vec<(Vec<u32>, Vec<u32>, Vec<u32>)>);

/// Callbacks that copy every invocation out for later comparison.
fn recording_callbacks(
	events: Arc<Mutex<Vec<RecordedEvent>>>,
	system_events: Arc<Mutex<Vec<Vec<u32>>>>,
) -> ReadoutParserCallbacks {
	ReadoutParserCallbacks {
		event_data: Box::new(move |event, modules: &[ModuleData]| {
			let copied = modules
				.iter()
				.map(|m| (m.prefix.to_vec(), m.dynamic.to_vec(), m.suffix.to_vec()))
				.collect();
			events.lock().unwrap().push((event, copied));
		}),
		system_event: Box::new(move |words| {
			system_events.lock().unwrap().push(words.to_vec());
		}),
	}
}

struct Run {
	state: ReadoutParserState,
	callbacks: ReadoutParserCallbacks,
	counters: ReadoutParserCounters,
	events: Arc<Mutex<Vec<RecordedEvent>>>,
	system_events: Arc<Mutex<Vec<Vec<u32>>>>,
}

impl Run {
	fn new() -> Self {
		let events = Arc::new(Mutex::new(Vec::new()));
		let system_events = Arc::new(Mutex::new(Vec::new()));
		Self {
			state: make_readout_parser(&example_stacks()),
			callbacks: recording_callbacks(events.clone(), system_events.clone()),
			counters: ReadoutParserCounters::default(),
			events,
			system_events,
		}
	}

	fn feed(&mut self, buffer_type: ConnectionType, buffer_number: u32, words: &[u32]) {
		parse_readout_buffer(
			&mut self.state,
			&mut self.callbacks,
			&mut self.counters,
			buffer_type,
			buffer_number,
			words,
		)
		.unwrap();
	}

	fn recorded_events(&self) -> Vec<RecordedEvent> {
		self.events.lock().unwrap().clone()
	}
}

#[test]
fn whole_stream_parses_to_events() {
	let mut run = Run::new();
	let mut words = example_event_words(0x100);
	words.extend(example_event_words(0x200));

	run.feed(ConnectionType::Usb, 1, &words);

	let events = run.recorded_events();
	assert!(events.len() == 2);

	let (event, modules) = &events[0];
	assert!(*event == 0);
	assert!(modules.len() == 2);
	assert!(modules[0].0 == [0x100, 0x101]);
	assert!(modules[0].1 == [0x102, 0x103, 0x104, 0x105]);
	assert!(modules[0].2.is_empty());
	assert!(modules[1].0 == [0x200]);
	assert!(run.counters.unused_bytes == 0);
}

/// Splitting the stream into two buffers at any word boundary produces the
/// exact same callback sequence as feeding it in one piece.
#[test]
fn parser_is_resumable_at_every_split_point() {
	let mut words = example_event_words(0x100);
	words.extend(example_event_words(0x200));

	let mut reference = Run::new();
	reference.feed(ConnectionType::Usb, 1, &words);
	let expected = reference.recorded_events();
	assert!(expected.len() == 2);

	for split in 0..=words.len() {
		let mut run = Run::new();
		run.feed(ConnectionType::Usb, 1, &words[..split]);
		run.feed(ConnectionType::Usb, 2, &words[split..]);

		assert!(run.recorded_events() == expected, "split point: {}", split);
		assert!(run.counters.unused_bytes == 0, "split point: {}", split);
	}
}

#[test]
fn system_events_are_surfaced_and_counted() {
	let mut words = Vec::new();
	words.push(make_system_event_header(system_event::subtype::UNIX_TIMETICK, 0, 1));
	words.push(0x6553_2a00);
	words.extend(example_event_words(0x300));
	words.push(make_system_event_header(system_event::subtype::END_OF_FILE, 0, 0));

	let mut run = Run::new();
	run.feed(ConnectionType::Usb, 1, &words);

	let system_events = run.system_events.lock().unwrap().clone();
	assert!(system_events.len() == 2);
	assert!(system_events[0].len() == 2);
	assert!(run.counters.system_event_types[usize::from(system_event::subtype::UNIX_TIMETICK)] == 1);
	assert!(run.counters.system_event_types[usize::from(system_event::subtype::END_OF_FILE)] == 1);
	assert!(run.recorded_events().len() == 1);
}

/// Wrap a word stream into ETH packets of the given payload sizes.
fn packetize(words: &[u32], packet_payload_words: usize, first_packet_number: u16) -> Vec<Vec<u32>> {
	let mut packets = Vec::new();
	let mut packet_number = first_packet_number;
	let mut offset = 0;

	// Track where the next frame header lies to fill in the next-header pointer.
	let mut next_header = 0usize;

	for chunk in words.chunks(packet_payload_words) {
		let pointer = if next_header >= offset && next_header < offset + chunk.len() {
			(next_header - offset) as u16
		} else {
			eth_packet::NO_HEADER_POINTER
		};

		let mut packet = vec![
			eth_packet::make_header0(packet_number, chunk.len() as u16),
			eth_packet::make_header1(pointer),
		];
		packet.extend_from_slice(chunk);
		packets.push(packet);

		// Advance the frame walk past this chunk.
		while next_header < offset + chunk.len() {
			let info = mvlc::frame::extract_frame_info(words[next_header]);
			next_header += 1 + usize::from(info.len);
		}

		offset += chunk.len();
		packet_number = (packet_number + 1) % eth_packet::PACKET_NUMBER_MODULO;
	}

	packets
}

#[test]
fn eth_packets_reassemble_into_events() {
	let words = example_event_words(0x400);
	let packets = packetize(&words, 3, 5);

	let mut run = Run::new();
	let buffer: Vec<u32> = packets.into_iter().flatten().collect();
	run.feed(ConnectionType::Eth, 1, &buffer);

	let events = run.recorded_events();
	assert!(events.len() == 1);
	assert!(run.counters.eth_packet_loss == 0);
	assert!(run.counters.eth_packets_processed == 4);
}

/// Scenario: a packet number gap invalidates the current event; the next
/// stack frame starts a fresh one.
#[test]
fn eth_packet_loss_discards_current_event() {
	let first = example_event_words(0x100);
	let second = example_event_words(0x200);

	// Event one split into two packets; the second packet (seq 6) is lost.
	let mut packets = packetize(&first, 6, 5);
	assert!(packets.len() == 2);
	packets.truncate(1);

	// Event two arrives complete in one packet with seq 7, gap of one.
	let mut lost_packet = vec![
		eth_packet::make_header0(7, second.len() as u16),
		eth_packet::make_header1(0),
	];
	lost_packet.extend_from_slice(&second);
	packets.push(lost_packet);

	let mut run = Run::new();
	let buffer: Vec<u32> = packets.into_iter().flatten().collect();
	run.feed(ConnectionType::Eth, 1, &buffer);

	assert!(run.counters.eth_packet_loss == 1);

	// Only the second event survived.
	let events = run.recorded_events();
	assert!(events.len() == 1);
	assert!(events[0].1[0].0 == [0x200, 0x201]);
}

#[test]
fn buffer_number_gap_counts_internal_loss() {
	let words = example_event_words(0x100);

	let mut run = Run::new();
	run.feed(ConnectionType::Usb, 1, &words);
	run.feed(ConnectionType::Usb, 4, &words);

	assert!(run.counters.internal_buffer_loss == 2);
	assert!(run.recorded_events().len() == 2);
}

#[test]
fn sentinel_buffer_stops_the_parser_thread() {
	let queues = BufferQueues::new(1024, 4);
	let counters = Arc::new(Protected::<ReadoutParserCounters>::default());
	let quit = Arc::new(AtomicBool::new(false));

	let thread = {
		let queues = queues.clone();
		let counters = counters.clone();
		let quit = quit.clone();
		std::thread::spawn(move || {
			let mut state = make_readout_parser(&example_stacks());
			let mut callbacks = ReadoutParserCallbacks::default();
			run_readout_parser(&mut state, &counters, &queues, &mut callbacks, &quit);
			state
		})
	};

	// Feed one buffer of real data, then the sentinel.
	let mut buffer = queues.empty_queue().dequeue(Duration::from_secs(1)).unwrap();
	buffer.set_number(1);
	buffer.set_connection_type(ConnectionType::Usb);
	buffer.extend_from_slice(&common::words_to_bytes(&example_event_words(0x100)));
	queues.filled_queue().enqueue(buffer);

	assert!(queues.send_sentinel(Duration::from_secs(1)));

	let state = thread.join().unwrap();
	assert!(state.terminal.is_none());
	assert!(counters.copy().buffers_processed == 1);
	assert!(counters.copy().parse_results[0] == 1); // one Ok event

	// All buffers are back on the empty side.
	assert!(queues.empty_queue().len() == 4);
}
