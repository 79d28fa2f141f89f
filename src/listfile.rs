//! The listfile: a zip archive holding the raw readout stream of one run.
//!
//! The archive contains a single entry whose content is the preamble (magic
//! bytes plus the crate config wrapped in SystemEvent frames), the raw readout
//! buffer payloads and a final end-of-file SystemEvent. Frame boundaries stay
//! recoverable from the entry stream alone.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::config::CrateConfig;
use crate::error::ListfileError;
use crate::frame::{frame_flags, make_system_event_header, system_event, MAX_FRAME_LENGTH};
use crate::transport::ConnectionType;

/// Name of the listfile entry inside the archive.
pub const ENTRY_NAME: &str = "listfile.mvlclst";

/// Magic bytes starting a listfile, identifying the producing transport.
pub const MAGIC_USB: &[u8; 8] = b"MVLC_USB";
pub const MAGIC_ETH: &[u8; 8] = b"MVLC_ETH";

/// Statistics of one listfile writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListfileWriterCounters {
	pub writes: u64,
	pub bytes_written: u64,
	pub t_start: Option<Instant>,
	pub t_end: Option<Instant>,
}

/// A destination for raw listfile bytes.
///
/// The single operation either writes the full slice or fails; a failed write
/// is fatal to the run.
pub trait WriteHandle: Send {
	fn write(&mut self, data: &[u8]) -> Result<usize, ListfileError>;
}

type ArchiveWriter = zip::ZipWriter<BufWriter<std::fs::File>>;

/// Creates a zip archive and opens the listfile entry in one of the supported
/// compression variants.
pub struct ZipCreator {
	zip: ArchiveWriter,
}

impl ZipCreator {
	pub fn create_archive(path: impl AsRef<Path>) -> Result<Self, ListfileError> {
		let file = std::fs::File::create(path)?;
		Ok(Self {
			zip: zip::ZipWriter::new(BufWriter::new(file)),
		})
	}

	/// Open a deflate compressed entry. Level 0 stores the data uncompressed.
	pub fn create_zip_entry(mut self, name: &str, level: i64) -> Result<ZipEntryHandle, ListfileError> {
		let method = if level == 0 {
			zip::CompressionMethod::Stored
		} else {
			zip::CompressionMethod::Deflated
		};
		let options = zip::write::SimpleFileOptions::default()
			.compression_method(method)
			.compression_level((level > 0).then_some(level))
			.large_file(true);

		self.zip.start_file(name, options)?;
		Ok(ZipEntryHandle { zip: Some(self.zip) })
	}

	/// Open a stored entry containing an LZ4 frame stream.
	pub fn create_lz4_entry(mut self, name: &str, level: u32) -> Result<Lz4EntryHandle, ListfileError> {
		let options = zip::write::SimpleFileOptions::default()
			.compression_method(zip::CompressionMethod::Stored)
			.large_file(true);

		self.zip.start_file(name, options)?;
		let encoder = lz4::EncoderBuilder::new().level(level).build(self.zip)?;
		Ok(Lz4EntryHandle { encoder: Some(encoder) })
	}
}

/// An open zip entry. Dropping the handle finalizes the archive.
pub struct ZipEntryHandle {
	zip: Option<ArchiveWriter>,
}

impl ZipEntryHandle {
	pub fn close(mut self) -> Result<(), ListfileError> {
		self.finish()
	}

	fn finish(&mut self) -> Result<(), ListfileError> {
		if let Some(zip) = self.zip.take() {
			zip.finish()?.flush()?;
		}
		Ok(())
	}
}

impl WriteHandle for ZipEntryHandle {
	fn write(&mut self, data: &[u8]) -> Result<usize, ListfileError> {
		let zip = self.zip.as_mut().expect("write after close");
		zip.write_all(data)?;
		Ok(data.len())
	}
}

impl Drop for ZipEntryHandle {
	fn drop(&mut self) {
		if let Err(e) = self.finish() {
			log::error!("failed to finalize listfile archive: {}", e);
		}
	}
}

/// An open LZ4 entry. Dropping the handle finalizes the frame and the archive.
pub struct Lz4EntryHandle {
	encoder: Option<lz4::Encoder<ArchiveWriter>>,
}

impl Lz4EntryHandle {
	pub fn close(mut self) -> Result<(), ListfileError> {
		self.finish()
	}

	fn finish(&mut self) -> Result<(), ListfileError> {
		if let Some(encoder) = self.encoder.take() {
			let (zip, result) = encoder.finish();
			result?;
			zip.finish()?.flush()?;
		}
		Ok(())
	}
}

impl WriteHandle for Lz4EntryHandle {
	fn write(&mut self, data: &[u8]) -> Result<usize, ListfileError> {
		let encoder = self.encoder.as_mut().expect("write after close");
		encoder.write_all(data)?;
		Ok(data.len())
	}
}

impl Drop for Lz4EntryHandle {
	fn drop(&mut self) {
		if let Err(e) = self.finish() {
			log::error!("failed to finalize listfile archive: {}", e);
		}
	}
}

/// Write a full byte slice through a [`WriteHandle`], retrying partial writes.
pub fn listfile_write_raw(handle: &mut dyn WriteHandle, data: &[u8]) -> Result<(), ListfileError> {
	let mut written = 0;
	while written < data.len() {
		written += handle.write(&data[written..])?;
	}
	Ok(())
}

/// Write a system event, splitting payloads larger than a single frame into a
/// Continue-flagged frame chain. Returns the number of bytes written.
pub fn listfile_write_system_event(handle: &mut dyn WriteHandle, subtype: u8, payload: &[u32]) -> Result<usize, ListfileError> {
	let mut words = Vec::with_capacity(payload.len() + payload.len() / usize::from(MAX_FRAME_LENGTH) + 1);

	if payload.is_empty() {
		words.push(make_system_event_header(subtype, 0, 0));
	}

	let mut chunks = payload.chunks(usize::from(MAX_FRAME_LENGTH)).peekable();
	while let Some(chunk) = chunks.next() {
		let flags = if chunks.peek().is_some() { frame_flags::CONTINUE } else { 0 };
		words.push(make_system_event_header(subtype, flags, chunk.len() as u16));
		words.extend_from_slice(chunk);
	}

	let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
	listfile_write_raw(handle, &bytes)?;
	Ok(bytes.len())
}

/// Convert the config YAML to zero padded little endian words.
fn config_to_words(config: &CrateConfig) -> Result<Vec<u32>, ListfileError> {
	let mut bytes = config.to_yaml()?.into_bytes();
	while bytes.len() % 4 != 0 {
		bytes.push(0);
	}

	Ok(bytes
		.chunks_exact(4)
		.map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
		.collect())
}

/// Write the listfile preamble: magic bytes, endian marker and the crate
/// config embedded in SystemEvent frames. Returns the number of bytes written.
pub fn listfile_write_preamble(
	handle: &mut dyn WriteHandle,
	connection_type: ConnectionType,
	config: &CrateConfig,
) -> Result<usize, ListfileError> {
	let magic = match connection_type {
		ConnectionType::Usb => MAGIC_USB,
		ConnectionType::Eth => MAGIC_ETH,
	};
	listfile_write_raw(handle, magic)?;
	let mut written = magic.len();

	written += listfile_write_system_event(
		handle,
		system_event::subtype::ENDIAN_MARKER,
		&[system_event::ENDIAN_MARKER_VALUE],
	)?;

	let config_words = config_to_words(config)?;
	written += listfile_write_system_event(handle, system_event::subtype::CRATE_CONFIG, &config_words)?;
	Ok(written)
}

/// Write the end-of-file system event closing the listfile stream.
pub fn listfile_write_eof(handle: &mut dyn WriteHandle) -> Result<usize, ListfileError> {
	listfile_write_system_event(handle, system_event::subtype::END_OF_FILE, &[])
}

fn unix_seconds() -> u32 {
	std::time::SystemTime::now()
		.duration_since(std::time::SystemTime::UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

/// Write a wall clock timetick system event.
pub fn listfile_write_timetick(handle: &mut dyn WriteHandle) -> Result<usize, ListfileError> {
	listfile_write_system_event(handle, system_event::subtype::UNIX_TIMETICK, &[unix_seconds()])
}

/// Write a pause marker system event.
pub fn listfile_write_pause(handle: &mut dyn WriteHandle) -> Result<usize, ListfileError> {
	listfile_write_system_event(handle, system_event::subtype::PAUSE, &[unix_seconds()])
}

/// Write a resume marker system event.
pub fn listfile_write_resume(handle: &mut dyn WriteHandle) -> Result<usize, ListfileError> {
	listfile_write_system_event(handle, system_event::subtype::RESUME, &[unix_seconds()])
}
