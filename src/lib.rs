//! Host side driver and data acquisition pipeline for the MVLC VME readout
//! controller.
//!
//! The crate is built around two cooperating subsystems: the readout worker
//! ([`readout::ReadoutWorker`]) streaming transport frames into pool buffers
//! and the listfile, and the resumable readout parser ([`parser`]) turning the
//! raw stream back into per event, per module data.

mod error;

pub mod buffer;
pub mod config;
pub mod controller;
pub mod executor;
pub mod frame;
pub mod listfile;
pub mod parser;
pub mod readout;
pub mod stack;
pub mod transport;
pub mod util;

pub use error::CommandTooLarge;
pub use error::ConfigError;
pub use error::FrameError;
pub use error::FrameLengthError;
pub use error::InvalidFrameType;
pub use error::InvalidStackCommand;
pub use error::ListfileError;
pub use error::MvlcError;
pub use error::ReadoutError;
pub use error::StackExecError;
pub use error::TransportError;

pub use buffer::BufferQueues;
pub use buffer::ReadoutBuffer;
pub use config::CrateConfig;
pub use controller::Mvlc;
pub use readout::ReadoutWorker;
pub use stack::StackCommand;
pub use stack::StackCommandBuilder;
pub use transport::Transport;
