use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

mod logging;
mod options;

use options::{CompressionType, Options};

use mvlc::config::ConnectionConfig;
use mvlc::frame::system_event;
use mvlc::listfile::{WriteHandle, ZipCreator, ENTRY_NAME};
use mvlc::parser::{make_readout_parser, run_readout_parser, ParseResult, ReadoutParserCallbacks, ReadoutParserCounters};
use mvlc::readout::{ReadoutWorker, ReadoutWorkerCounters};
use mvlc::util::Protected;
use mvlc::{BufferQueues, CrateConfig, Mvlc};

fn main() {
	let options = Options::parse();
	logging::init(options.verbose);
	if do_main(options).is_err() {
		std::process::exit(1);
	}
}

fn do_main(options: Options) -> Result<(), ()> {
	let mut config = CrateConfig::from_file(&options.crate_config)
		.map_err(|e| log::error!("Failed to read crate config {}: {}", options.crate_config.display(), e))?;

	// Connection overrides from the command line.
	if let Some(host) = &options.mvlc_eth {
		config.connection = ConnectionConfig::Eth { host: host.clone() };
	} else if options.mvlc_usb {
		config.connection = ConnectionConfig::Usb { index: None, serial: None };
	} else if let Some(index) = options.mvlc_usb_index {
		config.connection = ConnectionConfig::Usb {
			index: Some(index),
			serial: None,
		};
	} else if let Some(serial) = &options.mvlc_usb_serial {
		config.connection = ConnectionConfig::Usb {
			index: None,
			serial: Some(serial.clone()),
		};
	}

	let mut mvlc = Mvlc::from_config(&config).map_err(|e| log::error!("Failed to create the controller: {}", e))?;
	mvlc.set_disable_triggers_on_connect(true);
	mvlc.connect().map_err(|e| log::error!("Failed to connect to the MVLC: {}", e))?;
	log::info!("Connected to MVLC: {}", mvlc.connection_info());

	let queues = BufferQueues::default();
	let parser_counters = Arc::new(Protected::<ReadoutParserCounters>::default());
	let quit = Arc::new(AtomicBool::new(false));

	let parser_thread = {
		let mut state = make_readout_parser(&config.stacks);
		let queues = queues.clone();
		let counters = parser_counters.clone();
		let quit = quit.clone();

		std::thread::Builder::new()
			.name("readout_parser".into())
			.spawn(move || {
				let mut callbacks = ReadoutParserCallbacks::default();
				run_readout_parser(&mut state, &counters, &queues, &mut callbacks, &quit);
				state
			})
			.map_err(|e| log::error!("Failed to spawn the parser thread: {}", e))?
	};

	let listfile = open_listfile(&options)?;
	let worker = ReadoutWorker::new(mvlc, config, queues.clone(), listfile);

	log::info!("Starting readout, duration {} s", options.seconds_to_run);
	let start_result = worker.start(Duration::from_secs(options.seconds_to_run));
	match &start_result {
		Ok(()) => worker.wait_idle(),
		Err(e) => log::error!("Failed to start the readout: {}", e),
	}

	// Shut down the parser: hand it the empty sentinel buffer.
	log::debug!("Stopping the readout parser");
	if !queues.send_sentinel(Duration::from_secs(1)) {
		log::warn!("No empty buffer available for the parser sentinel, forcing quit");
		quit.store(true, Ordering::Relaxed);
	}
	let parser_state = parser_thread.join().map_err(|_| log::error!("The parser thread panicked"))?;

	let counters = worker.counters();
	print_readout_stats(&counters);
	print_parser_stats(&parser_counters.copy());

	if let Some(error) = &counters.result {
		log::error!("Readout failed: {}", error);
		return Err(());
	}
	if let Some(error) = &parser_state.terminal {
		log::error!("Readout parser failed: {}", error);
		return Err(());
	}
	start_result.map_err(|_| ())
}

fn open_listfile(options: &Options) -> Result<Option<Box<dyn WriteHandle + Send>>, ()> {
	if options.no_listfile {
		return Ok(None);
	}

	let path = options.listfile.clone().unwrap_or_else(|| {
		let mut path = options.crate_config.clone().into_os_string();
		path.push(".zip");
		path.into()
	});

	log::info!("Opening listfile {} for writing", path.display());

	let creator =
		ZipCreator::create_archive(&path).map_err(|e| log::error!("Failed to create listfile {}: {}", path.display(), e))?;

	let handle: Box<dyn WriteHandle + Send> = match options.listfile_compression_type {
		CompressionType::Zip => Box::new(
			creator
				.create_zip_entry(ENTRY_NAME, options.listfile_compression_level)
				.map_err(|e| log::error!("Failed to create the listfile entry: {}", e))?,
		),
		CompressionType::Lz4 => Box::new(
			creator
				.create_lz4_entry(ENTRY_NAME, options.listfile_compression_level.max(0) as u32)
				.map_err(|e| log::error!("Failed to create the listfile entry: {}", e))?,
		),
	};

	Ok(Some(handle))
}

const MEGABYTE: f64 = 1024.0 * 1024.0;

fn print_readout_stats(counters: &ReadoutWorkerCounters) {
	let run_duration = match (counters.t_start, counters.t_terminate_start) {
		(Some(start), Some(end)) => end - start,
		_ => Duration::ZERO,
	};
	let run_seconds = run_duration.as_secs_f64();
	let megabytes = counters.bytes_read as f64 / MEGABYTE;

	println!();
	println!("---- readout stats ----");
	println!("buffersRead={}", counters.buffers_read);
	println!("buffersFlushed={}", counters.buffers_flushed);
	println!("snoopMissedBuffers={}", counters.snoop_missed_buffers);
	println!("usbFramingErrors={}", counters.usb_framing_errors);
	println!("usbTempMovedBytes={}", counters.usb_temp_moved_bytes);
	println!("ethShortReads={}", counters.eth_short_reads);
	println!("readTimeouts={}", counters.read_timeouts);
	println!("totalBytesTransferred={}", counters.bytes_read);
	println!("duration={} ms", run_duration.as_millis());

	print!("stackHits: ");
	for (stack, &hits) in counters.stack_hits.iter().enumerate() {
		if hits > 0 {
			print!("{}: {} ", stack, hits);
		}
	}
	println!();

	for (key, count) in &counters.stack_errors {
		println!(
			"stackError: stack={}, line={}, flags={:#03x}, count={}",
			key.stack, key.line, key.flags, count
		);
	}

	if let Some(eth) = &counters.eth_data_counters {
		println!();
		println!("  -- eth data pipe receive stats --");
		println!("  receiveAttempts={}", eth.receive_attempts);
		println!("  receivedPackets={}", eth.received_packets);
		println!("  receivedBytes={}", eth.received_bytes);
		println!("  shortPackets={}", eth.short_packets);
		println!("  packetsWithResidue={}", eth.packets_with_residue);
		println!("  noHeader={}", eth.no_header);
		println!("  headerOutOfRange={}", eth.header_out_of_range);
		println!("  lostPackets={}", eth.lost_packets);
	}

	let writer = &counters.listfile;
	let writer_seconds = match (writer.t_start, writer.t_end) {
		(Some(start), Some(end)) => (end - start).as_secs_f64(),
		_ => 0.0,
	};
	println!();
	println!("  -- listfile writer counters --");
	println!("  writes={}", writer.writes);
	println!("  bytesWritten={}", writer.bytes_written);
	println!("  duration={:.3} s", writer_seconds);
	if writer_seconds > 0.0 {
		println!("  rate={:.3} MB/s", writer.bytes_written as f64 / MEGABYTE / writer_seconds);
	}

	println!();
	if run_seconds > 0.0 {
		println!(
			"Ran for {:.2} seconds, transferred a total of {:.2} MB, resulting data rate: {:.2} MB/s",
			run_seconds,
			megabytes,
			megabytes / run_seconds
		);
	}
}

fn print_parser_stats(counters: &ReadoutParserCounters) {
	println!();
	println!("---- readout parser stats ----");
	println!("internalBufferLoss={}", counters.internal_buffer_loss);
	println!("buffersProcessed={}", counters.buffers_processed);
	println!("unusedBytes={}", counters.unused_bytes);
	println!("ethPacketLoss={}", counters.eth_packet_loss);
	println!("ethPacketsProcessed={}", counters.eth_packets_processed);

	for (subtype, &count) in counters.system_event_types.iter().enumerate() {
		if count > 0 {
			println!("systemEventType {}, count={}", system_event::subtype_name(subtype as u8), count);
		}
	}

	for (result, &count) in ParseResult::all().iter().zip(counters.parse_results.iter()) {
		if count > 0 {
			println!("parseResult={}, count={}", result.name(), count);
		}
	}

	println!("parserExceptions={}", counters.parser_exceptions);
	println!("emptyStackFrames={}", counters.empty_stack_frames);

	print!("eventHits: ");
	let mut event_hits: Vec<_> = counters.event_hits.iter().collect();
	event_hits.sort();
	for (event, hits) in event_hits {
		print!("ei={}, hits={}, ", event, hits);
	}
	println!();

	let mut group_keys: Vec<_> = counters.group_hits.keys().copied().collect();
	group_keys.sort_unstable();
	for key in group_keys {
		let (event, group) = (key >> 16, key & 0xffff);
		let hits = counters.group_hits[&key];
		print!("eventIndex={}, groupIndex={}, hits={}", event, group, hits);
		if let Some(sizes) = counters.group_sizes.get(&key) {
			print!(
				", min={}, max={}, avg={:.1}",
				sizes.min,
				sizes.max,
				sizes.sum as f64 / hits.max(1) as f64
			);
		}
		println!();
	}
}
