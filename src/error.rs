use crate::frame;
use crate::readout::State;

/// An error that can occur while reading from or writing to a transport pipe.
#[derive(Debug)]
pub enum TransportError {
	/// The read did not complete within the given timeout.
	///
	/// Timeouts are expected during normal operation and are retried by the callers.
	Timeout,

	/// The transport is not connected.
	NotConnected,

	/// A hard I/O error on the underlying socket or endpoint.
	Io(std::io::Error),

	/// An error reported by the USB backend.
	#[cfg(feature = "usb")]
	Usb(rusb::Error),
}

impl TransportError {
	/// Check if the error is a read timeout.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout)
	}
}

/// The frame header did not have the expected frame type.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InvalidFrameType {
	pub actual: u8,
	pub expected: u8,
}

/// A frame length field that exceeds the remaining buffer space.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameLengthError {
	pub frame_len: u16,
	pub available: usize,
}

/// A protocol framing error in a response or readout stream.
#[derive(Debug)]
pub enum FrameError {
	InvalidFrameType(InvalidFrameType),
	LengthExceedsBuffer(FrameLengthError),
	EmptyResponse,
	UnexpectedEndOfResponse,
}

impl InvalidFrameType {
	/// Check that a frame header word carries the expected frame type.
	pub fn check(header: u32, expected: u8) -> Result<(), Self> {
		let actual = frame::frame_type(header);
		if actual == expected {
			Ok(())
		} else {
			Err(Self { actual, expected })
		}
	}
}

impl FrameLengthError {
	/// Check that a frame of `frame_len` words fits in `available` remaining words.
	pub fn check(frame_len: u16, available: usize) -> Result<(), Self> {
		if usize::from(frame_len) <= available {
			Ok(())
		} else {
			Err(Self { frame_len, available })
		}
	}
}

/// A word stream that does not decode to a known stack command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InvalidStackCommand {
	/// The first word of the rejected command, 0 if the stream ended early.
	pub word: u32,
}

/// A single command whose encoding does not fit the immediate stack, so splitting can not advance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandTooLarge {
	pub encoded_size: usize,
	pub limit: usize,
}

/// An execution error reported by the controller for one stack part.
///
/// Carries the error flags of the response frame (timeout, bus error, syntax error).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StackExecError {
	pub flags: u8,
}

impl StackExecError {
	/// Check the flags of a response frame, turning error flags into an error.
	pub fn check(flags: u8) -> Result<(), Self> {
		if flags & (frame::frame_flags::TIMEOUT | frame::frame_flags::BUS_ERROR | frame::frame_flags::SYNTAX_ERROR) == 0 {
			Ok(())
		} else {
			Err(Self { flags })
		}
	}
}

/// An error that can occur during a command pipe transaction with the controller.
#[derive(Debug)]
pub enum MvlcError {
	Transport(TransportError),
	Frame(FrameError),
	StackExec(StackExecError),
	CommandTooLarge(CommandTooLarge),
}

/// An error while loading or saving a crate configuration.
#[derive(Debug)]
pub enum ConfigError {
	Io(std::io::Error),
	Yaml(serde_yaml::Error),
}

/// An error while writing to or finalizing a listfile archive.
#[derive(Debug)]
pub enum ListfileError {
	Io(std::io::Error),
	Zip(zip::result::ZipError),
	/// Serializing the crate config for the preamble failed.
	Config(ConfigError),
}

/// A fatal error that terminates a readout run.
#[derive(Debug)]
pub enum ReadoutError {
	Mvlc(MvlcError),
	Listfile(ListfileError),
	/// A control request was issued in a state that does not allow it.
	InvalidState { request: &'static str, state: State },
}

impl From<std::io::Error> for TransportError {
	fn from(other: std::io::Error) -> Self {
		match other.kind() {
			std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
			_ => Self::Io(other),
		}
	}
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for TransportError {
	fn from(other: rusb::Error) -> Self {
		match other {
			rusb::Error::Timeout => Self::Timeout,
			other => Self::Usb(other),
		}
	}
}

impl From<InvalidFrameType> for FrameError {
	fn from(other: InvalidFrameType) -> Self {
		Self::InvalidFrameType(other)
	}
}

impl From<FrameLengthError> for FrameError {
	fn from(other: FrameLengthError) -> Self {
		Self::LengthExceedsBuffer(other)
	}
}

impl From<TransportError> for MvlcError {
	fn from(other: TransportError) -> Self {
		Self::Transport(other)
	}
}

impl From<FrameError> for MvlcError {
	fn from(other: FrameError) -> Self {
		Self::Frame(other)
	}
}

impl From<InvalidFrameType> for MvlcError {
	fn from(other: InvalidFrameType) -> Self {
		Self::Frame(other.into())
	}
}

impl From<FrameLengthError> for MvlcError {
	fn from(other: FrameLengthError) -> Self {
		Self::Frame(other.into())
	}
}

impl From<StackExecError> for MvlcError {
	fn from(other: StackExecError) -> Self {
		Self::StackExec(other)
	}
}

impl From<CommandTooLarge> for MvlcError {
	fn from(other: CommandTooLarge) -> Self {
		Self::CommandTooLarge(other)
	}
}

impl From<std::io::Error> for ConfigError {
	fn from(other: std::io::Error) -> Self {
		Self::Io(other)
	}
}

impl From<serde_yaml::Error> for ConfigError {
	fn from(other: serde_yaml::Error) -> Self {
		Self::Yaml(other)
	}
}

impl From<std::io::Error> for ListfileError {
	fn from(other: std::io::Error) -> Self {
		Self::Io(other)
	}
}

impl From<zip::result::ZipError> for ListfileError {
	fn from(other: zip::result::ZipError) -> Self {
		Self::Zip(other)
	}
}

impl From<ConfigError> for ListfileError {
	fn from(other: ConfigError) -> Self {
		Self::Config(other)
	}
}

impl From<MvlcError> for ReadoutError {
	fn from(other: MvlcError) -> Self {
		Self::Mvlc(other)
	}
}

impl From<TransportError> for ReadoutError {
	fn from(other: TransportError) -> Self {
		Self::Mvlc(other.into())
	}
}

impl From<ListfileError> for ReadoutError {
	fn from(other: ListfileError) -> Self {
		Self::Listfile(other)
	}
}

impl From<CommandTooLarge> for ReadoutError {
	fn from(other: CommandTooLarge) -> Self {
		Self::Mvlc(other.into())
	}
}

impl std::error::Error for TransportError {}
impl std::error::Error for InvalidStackCommand {}
impl std::error::Error for InvalidFrameType {}
impl std::error::Error for FrameLengthError {}
impl std::error::Error for FrameError {}
impl std::error::Error for CommandTooLarge {}
impl std::error::Error for StackExecError {}
impl std::error::Error for MvlcError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for ListfileError {}
impl std::error::Error for ReadoutError {}

impl std::fmt::Display for TransportError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Timeout => write!(f, "read timed out"),
			Self::NotConnected => write!(f, "transport is not connected"),
			Self::Io(e) => write!(f, "{}", e),
			#[cfg(feature = "usb")]
			Self::Usb(e) => write!(f, "{}", e),
		}
	}
}

impl std::fmt::Display for InvalidStackCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "invalid stack command word {:#010X}", self.word)
	}
}

impl std::fmt::Display for InvalidFrameType {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "invalid frame type, expected {:#04X}, got {:#04X}", self.expected, self.actual)
	}
}

impl std::fmt::Display for FrameLengthError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(
			f,
			"frame length of {} words exceeds the {} remaining words in the buffer",
			self.frame_len, self.available
		)
	}
}

impl std::fmt::Display for FrameError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::InvalidFrameType(e) => write!(f, "{}", e),
			Self::LengthExceedsBuffer(e) => write!(f, "{}", e),
			Self::EmptyResponse => write!(f, "empty response buffer"),
			Self::UnexpectedEndOfResponse => write!(f, "response buffer ended in the middle of a frame"),
		}
	}
}

impl std::fmt::Display for CommandTooLarge {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(
			f,
			"command encodes to {} words, which exceeds the immediate stack limit of {} words",
			self.encoded_size, self.limit
		)
	}
}

impl std::fmt::Display for StackExecError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "stack execution failed with flags [")?;
		let mut first = true;
		for (bit, name) in [
			(frame::frame_flags::TIMEOUT, "Timeout"),
			(frame::frame_flags::BUS_ERROR, "BusError"),
			(frame::frame_flags::SYNTAX_ERROR, "SyntaxError"),
			(frame::frame_flags::CONTINUE, "Continue"),
		] {
			if self.flags & bit != 0 {
				if !first {
					write!(f, ", ")?;
				}
				write!(f, "{}", name)?;
				first = false;
			}
		}
		write!(f, "]")
	}
}

impl std::fmt::Display for MvlcError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Transport(e) => write!(f, "{}", e),
			Self::Frame(e) => write!(f, "{}", e),
			Self::StackExec(e) => write!(f, "{}", e),
			Self::CommandTooLarge(e) => write!(f, "{}", e),
		}
	}
}

impl std::fmt::Display for ConfigError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Io(e) => write!(f, "{}", e),
			Self::Yaml(e) => write!(f, "{}", e),
		}
	}
}

impl std::fmt::Display for ListfileError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Io(e) => write!(f, "{}", e),
			Self::Zip(e) => write!(f, "{}", e),
			Self::Config(e) => write!(f, "{}", e),
		}
	}
}

impl std::fmt::Display for ReadoutError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Mvlc(e) => write!(f, "{}", e),
			Self::Listfile(e) => write!(f, "listfile write failed: {}", e),
			Self::InvalidState { request, state } => {
				write!(f, "readout worker can not handle a {} request in state {:?}", request, state)
			},
		}
	}
}
