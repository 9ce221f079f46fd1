//! Defines the transport trait that every FPGA control connection must implement.
//!
//! The FPGA control library is an external collaborator; the implementations here are thin
//! adapters over it.

pub mod mock;
pub mod tapcp;

use crate::core::RegisterMap;
use packed_struct::PackingError;
use std::sync::{
    Mutex,
    Weak,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Tapcp(#[from] self::tapcp::Error),
    #[error(transparent)]
    Mock(#[from] self::mock::Error),
    #[error("Failed to pack or unpack a register word")]
    Packing(#[from] PackingError),
    #[error("Asked for {expected} bytes but the transport returned {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("The transport this block was attached to no longer exists")]
    Dropped,
    #[error("The transport lock was poisoned by a panicking thread")]
    Poisoned,
}

pub type TransportResult<T> = Result<T, Error>;

/// Types that implement this trait can be serialized such that they can be written to FPGA
/// software registers
pub trait Serialize {
    type Chunk;
    /// # Errors
    /// Returns an error if the value doesn't fit its packed representation
    fn serialize(&self) -> Result<Self::Chunk, PackingError>;
}

/// Types that implement this trait can be deserialized such that they can be read from FPGA
/// software registers
pub trait Deserialize: Sized {
    type Chunk;
    /// # Errors
    /// Returns an error if the bytes don't describe a valid value
    fn deserialize(chunk: Self::Chunk) -> Result<Self, PackingError>;
}

macro_rules! serde_num {
    ($($num:ty),+) => {
        $(
            impl Serialize for $num {
                type Chunk = [u8; core::mem::size_of::<$num>()];
                fn serialize(&self) -> Result<Self::Chunk, PackingError> {
                    Ok(self.to_be_bytes())
                }
            }

            impl Deserialize for $num {
                type Chunk = [u8; core::mem::size_of::<$num>()];
                fn deserialize(chunk: Self::Chunk) -> Result<Self, PackingError> {
                    Ok(<$num>::from_be_bytes(chunk))
                }
            }
        )+
    };
}

// Big endian, as the fabric registers are
serde_num!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

/// The trait that is implemented for FPGA control connections.
/// The methods of this trait *assume* that the device is already connected.
pub trait Transport {
    /// Tests to see if the connected FPGA is programmed and running
    /// # Errors
    /// Returns an error on transport failures
    fn is_running(&mut self) -> TransportResult<bool>;

    /// Read `n` bytes from `device` starting at byte offset `offset`
    /// # Errors
    /// Returns an error on transport failures
    fn read_n_bytes(&mut self, device: &str, offset: usize, n: usize) -> TransportResult<Vec<u8>>;

    /// Read `N` bytes from `device` from byte offset `offset` into a const-sized array
    /// # Errors
    /// Returns an error on transport failures or if fewer than `N` bytes came back
    fn read_bytes<const N: usize>(
        &mut self,
        device: &str,
        offset: usize,
    ) -> TransportResult<[u8; N]> {
        let bytes = self.read_n_bytes(device, offset, N)?;
        let got = bytes.len();
        bytes
            .try_into()
            .map_err(|_| Error::ShortRead { expected: N, got })
    }

    /// Generically read a `Deserialize` type `T` from `device` at byte offset `offset`.
    /// # Example
    /// ```
    /// # use adcleda::core::Register;
    /// # use std::collections::HashMap;
    /// # use adcleda::transport::{mock::Mock, Transport};
    /// # let mut transport = Mock::new(HashMap::from([("sys_scratchpad".into(), Register { addr: 0, length: 4 })]));
    /// let my_num: u32 = transport.read("sys_scratchpad", 0).unwrap();
    /// ```
    /// # Errors
    /// Returns an error on transport failures or malformed data
    fn read<T, const N: usize>(&mut self, device: &str, offset: usize) -> TransportResult<T>
    where
        T: Deserialize<Chunk = [u8; N]>,
    {
        let bytes: [u8; N] = self.read_bytes(device, offset)?;
        Ok(T::deserialize(bytes)?)
    }

    /// Write `data` to `device` from byte offset `offset`
    /// # Errors
    /// Returns an error on transport failures
    fn write_bytes(&mut self, device: &str, offset: usize, data: &[u8]) -> TransportResult<()>;

    /// Generically write a `Serialize` type `T` to `device` at byte offset `offset`.
    /// # Example
    /// ```
    /// # use adcleda::core::Register;
    /// # use std::collections::HashMap;
    /// # use adcleda::transport::{mock::Mock, Transport};
    /// # let mut transport = Mock::new(HashMap::from([("sys_scratchpad".into(), Register { addr: 0, length: 4 })]));
    /// transport.write("sys_scratchpad", 0, &0xdead_beefu32).unwrap();
    /// ```
    /// # Errors
    /// Returns an error on transport failures or if `data` can't be packed
    fn write<T, const N: usize>(
        &mut self,
        device: &str,
        offset: usize,
        data: &T,
    ) -> TransportResult<()>
    where
        T: Serialize<Chunk = [u8; N]>,
    {
        self.write_bytes(device, offset, &data.serialize()?)
    }

    /// Retrieve a list of available devices on the (potentially programmed) connected platform
    /// # Errors
    /// Returns an error on transport failures
    fn listdev(&mut self) -> TransportResult<RegisterMap>;

    /// Load the named bitstream on the connected platform
    /// # Errors
    /// Returns an error on transport failures
    fn program(&mut self, bitstream: &str) -> TransportResult<()>;

    /// Deprograms the connected platform
    /// # Errors
    /// Returns an error on transport failures
    fn deprogram(&mut self) -> TransportResult<()>;
}

/// Run `f` with exclusive access to the transport behind a block's upwards pointer
/// # Errors
/// Returns an error if the transport was dropped or its lock poisoned, or whatever `f` returns
pub(crate) fn with_transport<T, R, E>(
    transport: &Weak<Mutex<T>>,
    f: impl FnOnce(&mut T) -> Result<R, E>,
) -> Result<R, E>
where
    E: From<Error>,
{
    let tarc = transport.upgrade().ok_or(Error::Dropped)?;
    let mut guard = tarc.lock().map_err(|_| Error::Poisoned)?;
    f(&mut *guard)
}
