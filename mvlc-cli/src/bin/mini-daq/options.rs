use std::path::PathBuf;

/// Run a timed readout from an MVLC crate config file.
///
/// The connection options override the connection stored in the crate config.
/// Readout data is written to a zip archive unless --no-listfile is given.
#[derive(clap::Parser)]
pub struct Options {
	/// Print more verbose messages. Can be used multiple times.
	#[clap(long, short)]
	#[clap(global = true)]
	#[clap(action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Connect to the MVLC with the given ethernet hostname.
	#[clap(long = "mvlc-eth", value_name = "HOST")]
	#[clap(group = "connection")]
	pub mvlc_eth: Option<String>,

	/// Connect to the first MVLC USB device.
	#[clap(long = "mvlc-usb")]
	#[clap(group = "connection")]
	pub mvlc_usb: bool,

	/// Connect to the MVLC with the given USB device index.
	#[clap(long = "mvlc-usb-index", value_name = "INDEX")]
	#[clap(group = "connection")]
	pub mvlc_usb_index: Option<u32>,

	/// Connect to the MVLC with the given USB serial number.
	#[clap(long = "mvlc-usb-serial", value_name = "SERIAL")]
	#[clap(group = "connection")]
	pub mvlc_usb_serial: Option<String>,

	/// Do not write the readout data to a listfile.
	#[clap(long = "no-listfile")]
	pub no_listfile: bool,

	/// Filename of the output listfile. Defaults to "<crateConfig>.zip".
	#[clap(long = "listfile", value_name = "PATH")]
	pub listfile: Option<PathBuf>,

	/// Compression to use for the listfile entry.
	#[clap(long = "listfile-compression-type", value_name = "TYPE")]
	#[clap(value_enum, default_value = "zip")]
	pub listfile_compression_type: CompressionType,

	/// Compression level for the listfile entry. For zip, 0 stores the data uncompressed.
	#[clap(long = "listfile-compression-level", value_name = "LEVEL")]
	#[clap(default_value_t = 0)]
	pub listfile_compression_level: i64,

	/// The crate config yaml file describing the readout.
	#[clap(value_name = "CRATE_CONFIG")]
	pub crate_config: PathBuf,

	/// Duration of the DAQ run in seconds.
	#[clap(value_name = "SECONDS_TO_RUN")]
	pub seconds_to_run: u64,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, Eq, PartialEq)]
pub enum CompressionType {
	Zip,
	Lz4,
}
