//! The crate configuration: which controller to connect to, how to initialize
//! the modules and what the readout stacks look like.
//!
//! The YAML (de)serialization is delegated to `serde_yaml`; this module only
//! defines the data model.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stack::StackCommandBuilder;

/// Which transport to use to reach the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionConfig {
	Eth {
		host: String,
	},
	Usb {
		/// Connect to the n-th controller on the bus.
		index: Option<u32>,
		/// Connect to the controller with this serial number. Takes precedence over `index`.
		serial: Option<String>,
	},
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self::Usb { index: None, serial: None }
	}
}

/// Everything needed to run a readout: connection, init sequences, readout
/// stacks and their trigger sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrateConfig {
	pub connection: ConnectionConfig,

	/// One readout stack per event. Stack `i` serves event `i` and runs as
	/// controller stack `i + 1`; its groups are the modules of the event.
	pub stacks: Vec<StackCommandBuilder>,

	/// One trigger source word per readout stack.
	pub triggers: Vec<u32>,

	/// Commands run once at connect time to initialize the VME modules.
	pub init_commands: StackCommandBuilder,

	/// Commands initializing the controller's trigger I/O logic.
	pub init_trigger_io: StackCommandBuilder,
}

impl CrateConfig {
	pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
		Ok(serde_yaml::from_str(yaml)?)
	}

	pub fn from_yaml_reader(reader: impl std::io::Read) -> Result<Self, ConfigError> {
		Ok(serde_yaml::from_reader(reader)?)
	}

	pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
		Self::from_yaml_reader(std::fs::File::open(path)?)
	}

	pub fn to_yaml(&self) -> Result<String, ConfigError> {
		Ok(serde_yaml::to_string(self)?)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::stack::{AddressMode, DataWidth, StackCommand};
	use assert2::assert;

	fn example_config() -> CrateConfig {
		let mut event = StackCommandBuilder::new("event0");
		event.begin_group("mdpp16");
		event.add_command(StackCommand::vme_read(0x6000, AddressMode::A32, DataWidth::D16));
		event.add_command(StackCommand::vme_block_read(0x6100, AddressMode::Blt32, 32));

		let mut init = StackCommandBuilder::new("init");
		init.begin_group("mdpp16");
		init.add_command(StackCommand::VMEWrite {
			address: 0x6008,
			amod: AddressMode::A32,
			width: DataWidth::D16,
			value: 1,
		});

		CrateConfig {
			connection: ConnectionConfig::Eth { host: "mvlc-01".into() },
			stacks: vec![event],
			triggers: vec![1],
			init_commands: init,
			init_trigger_io: StackCommandBuilder::new("trigger_io"),
		}
	}

	#[test]
	fn test_yaml_roundtrip() {
		let config = example_config();
		let yaml = config.to_yaml().unwrap();
		let parsed = CrateConfig::from_yaml(&yaml).unwrap();
		assert!(parsed == config);
	}

	#[test]
	fn test_missing_fields_use_defaults() {
		let config = CrateConfig::from_yaml("connection: !Eth { host: localhost }\n").unwrap();
		assert!(config.connection == ConnectionConfig::Eth { host: "localhost".into() });
		assert!(config.stacks.is_empty());
		assert!(config.triggers.is_empty());
	}
}
