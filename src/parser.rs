//! The readout parser: demultiplexes the raw buffer stream back into per event,
//! per module data and drives the user callbacks.
//!
//! The parser is resumable: a buffer may end in the middle of a frame chain or
//! block transfer and the next buffer continues exactly where the previous one
//! stopped. Lost Ethernet packets and framing errors invalidate only the event
//! currently being assembled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::buffer::BufferQueues;
use crate::error::FrameError;
use crate::frame::{
	extract_frame_info, is_blockread_header, is_stack_continuation_header, is_stack_error_header, is_stack_frame_header,
	is_system_event_header, FrameParseState,
};
use crate::stack::{StackCommand, StackCommandBuilder};
use crate::transport::{eth_packet, ConnectionType};
use crate::util::Protected;

/// The outcome of one parse step, tallied in [`ReadoutParserCounters::parse_results`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParseResult {
	Ok,
	/// An Ethernet packet containing no frame header was skipped while searching for one.
	NoHeaderPresent,
	/// A word between frames was not a known frame header.
	NotAStackFrame,
	/// The continuation of an event was not a StackContinuation frame.
	NotAStackContinuation,
	/// A module's dynamic part did not start with a BlockRead frame.
	NotABlockFrame,
	/// A StackFrame whose stack number has no readout stack.
	StackIndexOutOfRange,
	EmptyStackFrame,
	/// A frame chain or buffer ended before the event was complete.
	UnexpectedEndOfBuffer,
}

impl ParseResult {
	pub const COUNT: usize = 8;

	pub fn name(self) -> &'static str {
		match self {
			Self::Ok => "Ok",
			Self::NoHeaderPresent => "NoHeaderPresent",
			Self::NotAStackFrame => "NotAStackFrame",
			Self::NotAStackContinuation => "NotAStackContinuation",
			Self::NotABlockFrame => "NotABlockFrame",
			Self::StackIndexOutOfRange => "StackIndexOutOfRange",
			Self::EmptyStackFrame => "EmptyStackFrame",
			Self::UnexpectedEndOfBuffer => "UnexpectedEndOfBuffer",
		}
	}

	pub fn all() -> [ParseResult; ParseResult::COUNT] {
		[
			Self::Ok,
			Self::NoHeaderPresent,
			Self::NotAStackFrame,
			Self::NotAStackContinuation,
			Self::NotABlockFrame,
			Self::StackIndexOutOfRange,
			Self::EmptyStackFrame,
			Self::UnexpectedEndOfBuffer,
		]
	}

	fn index(self) -> usize {
		match self {
			Self::Ok => 0,
			Self::NoHeaderPresent => 1,
			Self::NotAStackFrame => 2,
			Self::NotAStackContinuation => 3,
			Self::NotABlockFrame => 4,
			Self::StackIndexOutOfRange => 5,
			Self::EmptyStackFrame => 6,
			Self::UnexpectedEndOfBuffer => 7,
		}
	}
}

/// Aggregated sizes of one module's data, keyed by (event, group).
#[derive(Debug, Clone, Copy)]
pub struct GroupPartSizes {
	pub min: u64,
	pub max: u64,
	pub sum: u64,
}

/// Pack an (event, group) pair into one counter key.
pub fn group_key(event: usize, group: usize) -> u32 {
	(event as u32) << 16 | group as u32 & 0xffff
}

/// Statistics of the readout parser. Snapshotted by readers via [`Protected::copy`].
#[derive(Debug, Clone)]
pub struct ReadoutParserCounters {
	pub buffers_processed: u64,
	/// Bytes that could not be attributed to any frame.
	pub unused_bytes: u64,
	/// Buffers lost between producer and parser, detected via buffer number gaps.
	pub internal_buffer_loss: u64,
	pub eth_packets_processed: u64,
	pub eth_packet_loss: u64,
	pub system_event_types: [u64; 0x80],
	pub parse_results: [u64; ParseResult::COUNT],
	pub parser_exceptions: u64,
	pub empty_stack_frames: u64,
	pub event_hits: HashMap<u32, u64>,
	pub group_hits: HashMap<u32, u64>,
	pub group_sizes: HashMap<u32, GroupPartSizes>,
}

impl Default for ReadoutParserCounters {
	fn default() -> Self {
		Self {
			buffers_processed: 0,
			unused_bytes: 0,
			internal_buffer_loss: 0,
			eth_packets_processed: 0,
			eth_packet_loss: 0,
			system_event_types: [0; 0x80],
			parse_results: [0; ParseResult::COUNT],
			parser_exceptions: 0,
			empty_stack_frames: 0,
			event_hits: HashMap::new(),
			group_hits: HashMap::new(),
			group_sizes: HashMap::new(),
		}
	}
}

impl ReadoutParserCounters {
	fn count(&mut self, result: ParseResult) {
		self.parse_results[result.index()] += 1;
	}

	fn count_module(&mut self, event: usize, group: usize, words: u64) {
		let key = group_key(event, group);
		*self.group_hits.entry(key).or_insert(0) += 1;
		self.group_sizes
			.entry(key)
			.and_modify(|sizes| {
				sizes.min = sizes.min.min(words);
				sizes.max = sizes.max.max(words);
				sizes.sum += words;
			})
			.or_insert(GroupPartSizes {
				min: words,
				max: words,
				sum: words,
			});
	}
}

/// The data of one module within an assembled event.
///
/// The slices borrow from the parser state and are only valid for the duration
/// of the callback.
#[derive(Debug, Clone, Copy)]
pub struct ModuleData<'a> {
	pub prefix: &'a [u32],
	pub dynamic: &'a [u32],
	pub suffix: &'a [u32],
}

/// The callbacks invoked by the parser.
pub struct ReadoutParserCallbacks {
	/// Called once per fully assembled event.
	pub event_data: Box<dyn FnMut(usize, &[ModuleData]) + Send>,

	/// Called once per SystemEvent frame, with the header word included.
	pub system_event: Box<dyn FnMut(&[u32]) + Send>,
}

impl Default for ReadoutParserCallbacks {
	fn default() -> Self {
		Self {
			event_data: Box::new(|_, _| ()),
			system_event: Box::new(|_| ()),
		}
	}
}

/// The shape of one module's readout data, derived from its stack commands.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct GroupStructure {
	/// Words produced by single cycle commands before the block read.
	pub prefix_len: u16,
	/// Whether the module performs a block read.
	pub has_dynamic: bool,
	/// Words produced by single cycle commands after the block read.
	pub suffix_len: u16,
}

/// The number of response words a single command contributes outside of block transfers.
fn produced_words(command: &StackCommand) -> u16 {
	match command {
		StackCommand::VMERead { amod, .. } if !amod.is_block_mode() => 1,
		StackCommand::WriteMarker { .. } | StackCommand::WriteSpecial { .. } => 1,
		_ => 0,
	}
}

fn group_structure(commands: &[StackCommand]) -> GroupStructure {
	let mut structure = GroupStructure::default();
	for command in commands {
		match command {
			StackCommand::VMERead { amod, .. } if amod.is_block_mode() => {
				structure.has_dynamic = true;
			},
			command if !structure.has_dynamic => structure.prefix_len += produced_words(command),
			command => structure.suffix_len += produced_words(command),
		}
	}
	structure
}

#[derive(Debug, Clone, Copy, Default)]
struct Span {
	offset: usize,
	len: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct ModuleSpans {
	prefix: Span,
	dynamic: Span,
	suffix: Span,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ModulePart {
	Prefix,
	Dynamic,
	Suffix,
}

/// The resumable state of the readout parser.
pub struct ReadoutParserState {
	/// Per event, per module readout structure derived from the readout stacks.
	structure: Vec<Vec<GroupStructure>>,

	/// The words of the event currently being assembled.
	work_buffer: Vec<u32>,
	module_spans: Vec<ModuleSpans>,

	event_index: Option<usize>,
	module_index: usize,
	module_part: ModulePart,

	/// Cursor into the outer stack frame chain.
	cur_stack_frame: Option<FrameParseState>,
	/// Cursor into the block read frame chain of the current module.
	cur_block_frame: Option<FrameParseState>,

	last_packet_number: Option<u16>,
	last_buffer_number: Option<u32>,

	/// The terminal condition of the parser thread, set before it exits on a fatal error.
	pub terminal: Option<FrameError>,
}

/// Build a parser state from the readout stacks of the crate config.
///
/// Stack `i` serves event `i`; its groups are the event's modules.
pub fn make_readout_parser(stacks: &[StackCommandBuilder]) -> ReadoutParserState {
	let structure = stacks
		.iter()
		.map(|builder| builder.groups().iter().map(|group| group_structure(&group.commands)).collect())
		.collect();

	ReadoutParserState {
		structure,
		work_buffer: Vec::new(),
		module_spans: Vec::new(),
		event_index: None,
		module_index: 0,
		module_part: ModulePart::Prefix,
		cur_stack_frame: None,
		cur_block_frame: None,
		last_packet_number: None,
		last_buffer_number: None,
		terminal: None,
	}
}

impl ReadoutParserState {
	fn event_in_progress(&self) -> bool {
		self.event_index.is_some()
	}

	fn modules_done(&self) -> bool {
		match self.event_index {
			Some(event) => self.module_index >= self.structure[event].len(),
			None => true,
		}
	}

	fn begin_event(&mut self, event: usize) {
		self.event_index = Some(event);
		self.module_index = 0;
		self.module_part = ModulePart::Prefix;
		self.work_buffer.clear();
		self.module_spans.clear();
		self.module_spans.resize(self.structure[event].len(), ModuleSpans::default());
		self.cur_block_frame = None;
	}

	/// Drop the event currently being assembled, keeping buffer and packet continuity.
	fn abandon_event(&mut self) {
		self.event_index = None;
		self.module_index = 0;
		self.module_part = ModulePart::Prefix;
		self.work_buffer.clear();
		self.module_spans.clear();
		self.cur_stack_frame = None;
		self.cur_block_frame = None;
	}

	/// Copy words into the work buffer, growing the given span.
	fn copy_to_span(work_buffer: &mut Vec<u32>, span: &mut Span, words: &[u32]) {
		if span.len == 0 {
			span.offset = work_buffer.len();
		}
		work_buffer.extend_from_slice(words);
		span.len += words.len();
	}

	/// Advance through all module part transitions that consume no input words:
	/// completed prefixes, completed block transfers and completed suffixes,
	/// including zero length parts.
	fn settle_module_state(&mut self) {
		while let Some(event) = self.event_index {
			if self.module_index >= self.structure[event].len() {
				break;
			}
			let structure = self.structure[event][self.module_index];
			let spans = self.module_spans[self.module_index];

			match self.module_part {
				ModulePart::Prefix if spans.prefix.len >= usize::from(structure.prefix_len) => {
					self.module_part = if structure.has_dynamic { ModulePart::Dynamic } else { ModulePart::Suffix };
				},
				ModulePart::Dynamic => match self.cur_block_frame {
					Some(block) if block.words_left == 0 && !block.info().continues() => {
						self.cur_block_frame = None;
						self.module_part = ModulePart::Suffix;
					},
					// A block header or more block words are needed first.
					_ => break,
				},
				ModulePart::Suffix if spans.suffix.len >= usize::from(structure.suffix_len) => {
					self.module_index += 1;
					self.module_part = ModulePart::Prefix;
				},
				_ => break,
			}
		}
	}
}

fn finish_event(state: &mut ReadoutParserState, callbacks: &mut ReadoutParserCallbacks, counters: &mut ReadoutParserCounters) {
	let event = state.event_index.expect("finish_event without an event in progress");

	*counters.event_hits.entry(event as u32).or_insert(0) += 1;
	for (group, spans) in state.module_spans.iter().enumerate() {
		let words = (spans.prefix.len + spans.dynamic.len + spans.suffix.len) as u64;
		counters.count_module(event, group, words);
	}
	counters.count(ParseResult::Ok);

	let view = |span: &Span| &state.work_buffer[span.offset..span.offset + span.len];
	let module_data: Vec<ModuleData> = state
		.module_spans
		.iter()
		.map(|spans| ModuleData {
			prefix: view(&spans.prefix),
			dynamic: view(&spans.dynamic),
			suffix: view(&spans.suffix),
		})
		.collect();

	(callbacks.event_data)(event, &module_data);

	state.event_index = None;
	state.module_index = 0;
	state.module_part = ModulePart::Prefix;
}

/// Parse readout stream words, resuming from and updating the state's cursors.
///
/// Consumes the whole input; anything unattributable is counted as unused.
fn parse_readout_contents(
	state: &mut ReadoutParserState,
	callbacks: &mut ReadoutParserCallbacks,
	counters: &mut ReadoutParserCounters,
	input: &[u32],
) -> Result<(), FrameError> {
	let mut pos = 0;

	loop {
		// Stack frame boundary bookkeeping: runs without consuming input so
		// events completing exactly at the end of a buffer are still emitted.
		if let Some(frame) = state.cur_stack_frame {
			if frame.words_left == 0 {
				let continues = frame.info().continues();
				state.cur_stack_frame = None;

				if continues {
					// The next header starts the continuation, possibly in the next buffer.
					continue;
				}
				if state.modules_done() {
					finish_event(state, callbacks, counters);
				} else {
					counters.count(ParseResult::UnexpectedEndOfBuffer);
					state.abandon_event();
				}
				continue;
			}
		}

		if pos >= input.len() {
			break;
		}

		let Some(mut frame) = state.cur_stack_frame else {
			let header = input[pos];

			if state.event_in_progress() {
				// An event is open and the previous frame announced a continuation.
				if !is_stack_continuation_header(header) {
					counters.count(ParseResult::NotAStackContinuation);
					state.abandon_event();
					continue;
				}
				state.cur_stack_frame = Some(FrameParseState::new(header));
				pos += 1;
				continue;
			}

			if is_stack_frame_header(header) {
				let info = extract_frame_info(header);
				let event = usize::from(info.stack).wrapping_sub(1);

				if info.stack == 0 || event >= state.structure.len() {
					counters.count(ParseResult::StackIndexOutOfRange);
					let skip = 1 + usize::from(info.len).min(input.len() - pos - 1);
					counters.unused_bytes += 4 * skip as u64;
					pos += skip;
					continue;
				}
				if info.len == 0 && !info.continues() {
					counters.empty_stack_frames += 1;
					counters.count(ParseResult::EmptyStackFrame);
					pos += 1;
					continue;
				}

				state.begin_event(event);
				state.settle_module_state();
				state.cur_stack_frame = Some(FrameParseState::new(header));
				pos += 1;
				continue;
			}

			if is_system_event_header(header) {
				let info = extract_frame_info(header);
				let end = pos + 1 + usize::from(info.len);
				if end > input.len() {
					counters.count(ParseResult::UnexpectedEndOfBuffer);
					counters.unused_bytes += 4 * (input.len() - pos) as u64;
					break;
				}
				counters.system_event_types[usize::from(info.stack & 0x7f)] += 1;
				(callbacks.system_event)(&input[pos..end]);
				pos = end;
				continue;
			}

			if is_stack_error_header(header) {
				// Error notifications are accounted by the readout worker; skip them here.
				let info = extract_frame_info(header);
				pos += 1 + usize::from(info.len).min(input.len() - pos - 1);
				continue;
			}

			counters.count(ParseResult::NotAStackFrame);
			counters.unused_bytes += 4;
			pos += 1;
			continue;
		};

		// Inside a stack frame chain with both frame words and input available.
		let input_avail = input.len() - pos;
		let frame_avail = usize::from(frame.words_left).min(input_avail);

		if state.modules_done() {
			// Filler words after the last module, e.g. markers not part of any module.
			frame.consume_words(frame_avail as u16);
			state.cur_stack_frame = Some(frame);
			counters.unused_bytes += 4 * frame_avail as u64;
			pos += frame_avail;
			continue;
		}

		let event = state.event_index.expect("module parsing without an event in progress");
		let module = state.module_index;
		let structure = state.structure[event][module];

		match state.module_part {
			ModulePart::Prefix => {
				let need = usize::from(structure.prefix_len) - state.module_spans[module].prefix.len;
				let take = need.min(frame_avail);

				ReadoutParserState::copy_to_span(&mut state.work_buffer, &mut state.module_spans[module].prefix, &input[pos..pos + take]);
				frame.consume_words(take as u16);
				state.cur_stack_frame = Some(frame);
				pos += take;
				state.settle_module_state();
			},

			ModulePart::Dynamic => {
				let Some(mut block) = state.cur_block_frame else {
					// The dynamic part starts with a BlockRead frame header.
					let header = input[pos];
					if !is_blockread_header(header) {
						counters.count(ParseResult::NotABlockFrame);
						state.abandon_event();
						continue;
					}
					state.cur_block_frame = Some(FrameParseState::new(header));
					frame.consume_words(1);
					state.cur_stack_frame = Some(frame);
					pos += 1;
					state.settle_module_state();
					continue;
				};

				if block.words_left == 0 {
					// Settling leaves an exhausted block cursor only when it chains:
					// the next BlockRead header follows, possibly after a
					// StackContinuation in between.
					let header = input[pos];
					if !is_blockread_header(header) {
						counters.count(ParseResult::NotABlockFrame);
						state.abandon_event();
						continue;
					}
					state.cur_block_frame = Some(FrameParseState::new(header));
					frame.consume_words(1);
					state.cur_stack_frame = Some(frame);
					pos += 1;
					state.settle_module_state();
					continue;
				}

				let take = usize::from(block.words_left).min(frame_avail);
				ReadoutParserState::copy_to_span(&mut state.work_buffer, &mut state.module_spans[module].dynamic, &input[pos..pos + take]);
				block.consume_words(take as u16);
				frame.consume_words(take as u16);
				state.cur_block_frame = Some(block);
				state.cur_stack_frame = Some(frame);
				pos += take;
				state.settle_module_state();
			},

			ModulePart::Suffix => {
				let need = usize::from(structure.suffix_len) - state.module_spans[module].suffix.len;
				let take = need.min(frame_avail);

				ReadoutParserState::copy_to_span(&mut state.work_buffer, &mut state.module_spans[module].suffix, &input[pos..pos + take]);
				frame.consume_words(take as u16);
				state.cur_stack_frame = Some(frame);
				pos += take;
				state.settle_module_state();
			},
		}
	}

	Ok(())
}

fn parse_usb_buffer(
	state: &mut ReadoutParserState,
	callbacks: &mut ReadoutParserCallbacks,
	counters: &mut ReadoutParserCounters,
	words: &[u32],
) -> Result<(), FrameError> {
	parse_readout_contents(state, callbacks, counters, words)
}

fn parse_eth_buffer(
	state: &mut ReadoutParserState,
	callbacks: &mut ReadoutParserCallbacks,
	counters: &mut ReadoutParserCounters,
	words: &[u32],
) -> Result<(), FrameError> {
	let mut input = words;

	while input.len() >= eth_packet::HEADER_WORDS {
		let header0 = input[0];
		let header1 = input[1];

		let available = input.len() - eth_packet::HEADER_WORDS;
		let payload_words = usize::from(eth_packet::word_count(header0)).min(available);
		let mut payload = &input[eth_packet::HEADER_WORDS..eth_packet::HEADER_WORDS + payload_words];

		let packet_number = eth_packet::packet_number(header0);
		if let Some(last) = state.last_packet_number {
			let lost = eth_packet::lost_packet_count(last, packet_number);
			if lost > 0 {
				counters.eth_packet_loss += lost;
				if state.event_in_progress() || state.cur_stack_frame.is_some() {
					// Part of the event is gone, drop it and resynchronize.
					counters.count(ParseResult::UnexpectedEndOfBuffer);
					state.abandon_event();
				}
			}
		}
		state.last_packet_number = Some(packet_number);

		// When not aligned to a frame, use the packet's next-header pointer to resynchronize.
		if state.cur_stack_frame.is_none() && !state.event_in_progress() {
			let pointer = eth_packet::next_header_pointer(header1);
			if pointer == eth_packet::NO_HEADER_POINTER || usize::from(pointer) > payload.len() {
				// No header in this packet, or a malformed pointer: drop the payload.
				counters.count(ParseResult::NoHeaderPresent);
				counters.unused_bytes += 4 * payload.len() as u64;
				payload = &[];
			} else {
				counters.unused_bytes += 4 * u64::from(pointer);
				payload = &payload[usize::from(pointer)..];
			}
		}

		parse_readout_contents(state, callbacks, counters, payload)?;

		counters.eth_packets_processed += 1;
		input = &input[eth_packet::HEADER_WORDS + payload_words..];
	}

	if !input.is_empty() {
		counters.unused_bytes += 4 * input.len() as u64;
	}

	Ok(())
}

/// Parse one readout buffer, updating state, counters and invoking callbacks.
pub fn parse_readout_buffer(
	state: &mut ReadoutParserState,
	callbacks: &mut ReadoutParserCallbacks,
	counters: &mut ReadoutParserCounters,
	buffer_type: ConnectionType,
	buffer_number: u32,
	words: &[u32],
) -> Result<(), FrameError> {
	if let Some(last) = state.last_buffer_number {
		let lost = u64::from(buffer_number.wrapping_sub(last).saturating_sub(1));
		if lost > 0 {
			counters.internal_buffer_loss += lost;
			// The stream has a hole: drop any event in progress and restart
			// packet sequencing.
			state.abandon_event();
			state.last_packet_number = None;
		}
	}
	state.last_buffer_number = Some(buffer_number);

	let result = match buffer_type {
		ConnectionType::Usb => parse_usb_buffer(state, callbacks, counters, words),
		ConnectionType::Eth => parse_eth_buffer(state, callbacks, counters, words),
	};

	counters.buffers_processed += 1;
	result
}

/// The parser thread body: drain filled buffers, parse them, return them to the
/// empty queue.
///
/// Exits when the quit flag is set or the sentinel (an empty buffer) arrives.
/// Buffers are returned to the empty queue even when parsing fails; a fatal
/// error is recorded in [`ReadoutParserState::terminal`] before the thread
/// leaves the loop.
pub fn run_readout_parser(
	state: &mut ReadoutParserState,
	counters: &Protected<ReadoutParserCounters>,
	queues: &BufferQueues,
	callbacks: &mut ReadoutParserCallbacks,
	quit: &AtomicBool,
) {
	log::debug!("run_readout_parser: entering loop");

	loop {
		if quit.load(Ordering::Relaxed) {
			log::debug!("run_readout_parser: quit is set, leaving loop");
			break;
		}

		let Some(buffer) = queues.filled_queue().dequeue(Duration::from_millis(100)) else {
			continue;
		};

		if buffer.is_empty() {
			log::debug!("run_readout_parser: got the sentinel buffer, leaving loop");
			queues.empty_queue().enqueue(buffer);
			break;
		}

		let result = {
			let mut counters = counters.access();
			parse_readout_buffer(
				state,
				callbacks,
				&mut counters,
				buffer.connection_type(),
				buffer.number(),
				buffer.view_u32(),
			)
		};

		queues.empty_queue().enqueue(buffer);

		if let Err(error) = result {
			counters.access().parser_exceptions += 1;
			log::error!("run_readout_parser: fatal parse error: {}", error);
			state.terminal = Some(error);
			break;
		}
	}

	log::debug!("run_readout_parser: left loop");
}
