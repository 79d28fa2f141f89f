//! Ethernet transport: one UDP socket per pipe.

use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;

use super::{eth_packet, ConnectionType, EthPipeCounters, Pipe, Transport};
use crate::error::TransportError;

/// UDP destination port of the command pipe.
pub const COMMAND_PORT: u16 = 0x8000;

/// UDP destination port of the data pipe.
pub const DATA_PORT: u16 = 0x8001;

/// Largest datagram the controller sends, including the packet header.
pub const MAX_PACKET_SIZE: usize = 9000;

/// A connection to the controller over two UDP sockets.
pub struct EthTransport {
	host: String,
	sockets: [Option<UdpSocket>; 2],
	counters: [EthPipeCounters; 2],
	last_packet_number: [Option<u16>; 2],
}

impl EthTransport {
	pub fn new(host: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			sockets: [None, None],
			counters: [EthPipeCounters::default(), EthPipeCounters::default()],
			last_packet_number: [None, None],
		}
	}

	fn open_socket(&self, port: u16) -> Result<UdpSocket, TransportError> {
		let address = (self.host.as_str(), port)
			.to_socket_addrs()
			.map_err(TransportError::Io)?
			.next()
			.ok_or(TransportError::NotConnected)?;

		let socket = UdpSocket::bind("0.0.0.0:0").map_err(TransportError::Io)?;
		socket.connect(address).map_err(TransportError::Io)?;
		Ok(socket)
	}

	fn socket(&self, pipe: Pipe) -> Result<&UdpSocket, TransportError> {
		self.sockets[pipe.index()].as_ref().ok_or(TransportError::NotConnected)
	}

	/// Validate the packet header of a received datagram and update the pipe counters.
	///
	/// Returns false if the datagram must be dropped.
	fn account_packet(&mut self, pipe: Pipe, datagram: &[u8]) -> bool {
		let index = pipe.index();
		let counters = &mut self.counters[index];

		if datagram.len() < eth_packet::HEADER_BYTES {
			counters.short_packets += 1;
			return false;
		}

		counters.received_packets += 1;
		counters.received_bytes += datagram.len() as u64;

		if (datagram.len() - eth_packet::HEADER_BYTES) % 4 != 0 {
			counters.packets_with_residue += 1;
		}

		let header0 = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
		let header1 = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
		let payload_words = (datagram.len() - eth_packet::HEADER_BYTES) / 4;

		let pointer = eth_packet::next_header_pointer(header1);
		if pointer == eth_packet::NO_HEADER_POINTER {
			counters.no_header += 1;
		} else if usize::from(pointer) >= payload_words {
			counters.header_out_of_range += 1;
		}

		let packet_number = eth_packet::packet_number(header0);
		if let Some(last) = self.last_packet_number[index] {
			counters.lost_packets += eth_packet::lost_packet_count(last, packet_number);
		}
		self.last_packet_number[index] = Some(packet_number);

		true
	}
}

impl Transport for EthTransport {
	fn connect(&mut self) -> Result<(), TransportError> {
		self.sockets[Pipe::Command.index()] = Some(self.open_socket(COMMAND_PORT)?);
		self.sockets[Pipe::Data.index()] = Some(self.open_socket(DATA_PORT)?);
		self.last_packet_number = [None, None];
		log::debug!("connected to mvlc at {}", self.host);
		Ok(())
	}

	fn disconnect(&mut self) -> Result<(), TransportError> {
		self.sockets = [None, None];
		Ok(())
	}

	fn is_connected(&self) -> bool {
		self.sockets.iter().all(|s| s.is_some())
	}

	fn connection_type(&self) -> ConnectionType {
		ConnectionType::Eth
	}

	fn connection_info(&self) -> String {
		format!("mvlc_eth: host={}", self.host)
	}

	fn write(&mut self, pipe: Pipe, data: &[u8]) -> Result<(), TransportError> {
		self.socket(pipe)?.send(data).map_err(TransportError::Io)?;
		Ok(())
	}

	fn read(&mut self, pipe: Pipe, dst: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
		self.counters[pipe.index()].receive_attempts += 1;

		let socket = self.socket(pipe)?;
		socket.set_read_timeout(Some(timeout)).map_err(TransportError::Io)?;

		let received = socket.recv(dst).map_err(TransportError::from)?;

		if !self.account_packet(pipe, &dst[..received]) {
			// A runt datagram carries no usable words.
			return Ok(0);
		}

		Ok(received)
	}

	fn eth_counters(&self, pipe: Pipe) -> Option<EthPipeCounters> {
		Some(self.counters[pipe.index()])
	}
}
