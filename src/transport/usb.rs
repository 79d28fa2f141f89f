//! USB transport: bulk endpoint pairs on the controller's FTDI interface.

use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext, UsbContext};

use super::{ConnectionType, Pipe, Transport};
use crate::error::TransportError;

const VENDOR_ID: u16 = 0x0403;
const PRODUCT_ID: u16 = 0x601f;

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Which of the attached controllers to connect to.
#[derive(Debug, Clone, Default)]
pub enum DeviceSelection {
	/// The first controller found on the bus.
	#[default]
	First,
	/// The n-th controller found on the bus.
	Index(u32),
	/// The controller with the given serial number string.
	Serial(String),
}

/// A connection to the controller over USB bulk endpoints.
pub struct UsbTransport {
	selection: DeviceSelection,
	handle: Option<DeviceHandle<GlobalContext>>,
	serial: String,
}

impl UsbTransport {
	pub fn new(selection: DeviceSelection) -> Self {
		Self {
			selection,
			handle: None,
			serial: String::new(),
		}
	}

	fn endpoint_in(pipe: Pipe) -> u8 {
		match pipe {
			Pipe::Command => 0x82,
			Pipe::Data => 0x83,
		}
	}

	fn endpoint_out(pipe: Pipe) -> u8 {
		match pipe {
			Pipe::Command => 0x02,
			Pipe::Data => 0x03,
		}
	}

	fn handle(&self) -> Result<&DeviceHandle<GlobalContext>, TransportError> {
		self.handle.as_ref().ok_or(TransportError::NotConnected)
	}

	fn read_serial(handle: &DeviceHandle<GlobalContext>) -> Result<String, rusb::Error> {
		let descriptor = handle.device().device_descriptor()?;
		let languages = handle.read_languages(WRITE_TIMEOUT)?;
		match languages.first() {
			Some(&language) => handle.read_serial_number_string(language, &descriptor, WRITE_TIMEOUT),
			None => Ok(String::new()),
		}
	}
}

impl Transport for UsbTransport {
	fn connect(&mut self) -> Result<(), TransportError> {
		let mut index = 0;

		for device in GlobalContext::default().devices()?.iter() {
			let descriptor = device.device_descriptor()?;
			if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
				continue;
			}

			let mut handle = device.open()?;
			let serial = Self::read_serial(&handle).unwrap_or_default();

			let matches = match &self.selection {
				DeviceSelection::First => true,
				DeviceSelection::Index(wanted) => index == *wanted,
				DeviceSelection::Serial(wanted) => &serial == wanted,
			};
			index += 1;

			if matches {
				handle.claim_interface(0)?;
				log::debug!("connected to mvlc usb, serial={}", serial);
				self.serial = serial;
				self.handle = Some(handle);
				return Ok(());
			}
		}

		Err(TransportError::NotConnected)
	}

	fn disconnect(&mut self) -> Result<(), TransportError> {
		if let Some(mut handle) = self.handle.take() {
			let _ = handle.release_interface(0);
		}
		Ok(())
	}

	fn is_connected(&self) -> bool {
		self.handle.is_some()
	}

	fn connection_type(&self) -> ConnectionType {
		ConnectionType::Usb
	}

	fn connection_info(&self) -> String {
		format!("mvlc_usb: serial={}", self.serial)
	}

	fn write(&mut self, pipe: Pipe, data: &[u8]) -> Result<(), TransportError> {
		let mut written = 0;
		while written < data.len() {
			written += self.handle()?.write_bulk(Self::endpoint_out(pipe), &data[written..], WRITE_TIMEOUT)?;
		}
		Ok(())
	}

	fn read(&mut self, pipe: Pipe, dst: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
		Ok(self.handle()?.read_bulk(Self::endpoint_in(pipe), dst, timeout)?)
	}
}
