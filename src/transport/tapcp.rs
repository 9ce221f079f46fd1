//! Transport adapter for TAPCP, the TFTP-based control protocol of CASPER boards.
//! The protocol itself lives in the external `tapcp` crate.

use super::{
    Transport,
    TransportResult,
};
use crate::core::{
    Register,
    RegisterMap,
};
use std::{
    net::{
        SocketAddr,
        UdpSocket,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{
    debug,
    warn,
};

const DEFAULT_TIMEOUT: f32 = 0.5;
const DEFAULT_RETRIES: usize = 5;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Internal system IO error")]
    Io(#[from] std::io::Error),
    #[error("Error from the lower-level TAPCP library")]
    Lower(#[from] tapcp::Error),
}

#[derive(Debug)]
/// A TAPCP Connection (newtype for a [`UdpSocket`])
pub struct Tapcp {
    socket: UdpSocket,
    retries: usize,
}

impl Tapcp {
    /// Create and connect to a TAPCP transport
    /// # Errors
    /// Will return an error if the UDP socket fails to connect
    pub fn connect(host: SocketAddr) -> TransportResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(Error::from)?;
        socket.set_nonblocking(false).map_err(Error::from)?;
        let timeout = Duration::from_secs_f32(DEFAULT_TIMEOUT);
        socket
            .set_write_timeout(Some(timeout))
            .map_err(Error::from)?;
        socket
            .set_read_timeout(Some(timeout))
            .map_err(Error::from)?;
        socket.connect(host).map_err(Error::from)?;
        debug!(%host, "Connected TAPCP transport");
        Ok(Self {
            socket,
            retries: DEFAULT_RETRIES,
        })
    }

    fn read_words(&self, device: &str, first: usize, n: usize) -> Result<Vec<u8>, Error> {
        Ok(tapcp::read_device(
            device,
            first,
            n,
            &self.socket,
            self.retries,
        )?)
    }
}

impl Transport for Tapcp {
    fn is_running(&mut self) -> TransportResult<bool> {
        // A missing sys_clkcounter means no user design is running
        match tapcp::read_device("sys_clkcounter", 0, 1, &self.socket, self.retries) {
            Ok(_) => Ok(true),
            Err(tapcp::Error::Tftp(tftp_client::Error::Protocol {
                code: tftp_client::parser::ErrorCode::NoFile,
                ..
            })) => Ok(false),
            Err(e) => Err(Error::Lower(e).into()),
        }
    }

    fn read_n_bytes(&mut self, device: &str, offset: usize, n: usize) -> TransportResult<Vec<u8>> {
        // TAPCP moves whole 4 byte words, and asking for zero words means "everything"
        if n == 0 {
            return Ok(vec![]);
        }
        let first_word = offset / 4;
        let last_word = (offset + n + 3) / 4;
        let bytes = self.read_words(device, first_word, last_word - first_word)?;
        let start = offset % 4;
        let got = bytes.len();
        Ok(bytes
            .get(start..start + n)
            .ok_or(super::Error::ShortRead { expected: n, got })?
            .to_vec())
    }

    fn write_bytes(&mut self, device: &str, offset: usize, data: &[u8]) -> TransportResult<()> {
        if offset % 4 == 0 && data.len() % 4 == 0 {
            tapcp::write_device(device, offset / 4, data, &self.socket, self.retries)
                .map_err(Error::from)?;
            return Ok(());
        }
        // Unaligned, so read the covering words, splice and write them back
        let first_word = offset / 4;
        let last_word = (offset + data.len() + 3) / 4;
        let mut words = self.read_words(device, first_word, last_word - first_word)?;
        let start = offset % 4;
        let got = words.len();
        words
            .get_mut(start..start + data.len())
            .ok_or(super::Error::ShortRead {
                expected: start + data.len(),
                got,
            })?
            .copy_from_slice(data);
        tapcp::write_device(device, first_word, &words, &self.socket, self.retries)
            .map_err(Error::from)?;
        Ok(())
    }

    fn listdev(&mut self) -> TransportResult<RegisterMap> {
        let devices = tapcp::listdev(&self.socket, self.retries).map_err(Error::from)?;
        Ok(devices
            .into_iter()
            .map(|(k, (addr, len))| {
                (
                    k.into(),
                    Register {
                        addr: addr as usize,
                        length: len as usize,
                    },
                )
            })
            .collect())
    }

    fn program(&mut self, bitstream: &str) -> TransportResult<()> {
        // TAPCP boards boot their design from flash, there is nothing to load by name
        warn!(bitstream, "TAPCP platforms boot from flash, not programming");
        Ok(())
    }

    fn deprogram(&mut self) -> TransportResult<()> {
        // Reboot into the golden image
        Ok(tapcp::progdev(0, &self.socket).map_err(Error::from)?)
    }
}
