//! Mock transport used in testing the bus, controller and capture logic

use super::{
    Transport,
    TransportResult,
};
use crate::core::{
    Register,
    RegisterMap,
};
use kstring::KString;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Device not found - `{0}`")]
    MissingDevice(String),
    #[error("Access of {n} bytes at offset {offset} runs past the end of `{device}`")]
    OutOfBounds {
        device: String,
        offset: usize,
        n: usize,
    },
}

/// One write as seen by the mock, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub device: KString,
    pub offset: usize,
    pub data: Vec<u8>,
}

impl WriteRecord {
    /// Interpret the written bytes as a big-endian 32-bit word, if that's what they were
    #[must_use]
    pub fn word(&self) -> Option<u32> {
        self.data.as_slice().try_into().ok().map(u32::from_be_bytes)
    }
}

/// A platform that mocks reads and writes, useful for testing
#[derive(Debug, Default)]
pub struct Mock {
    memory: HashMap<usize, u8>,
    registers: RegisterMap,
    history: Vec<WriteRecord>,
    programmed: Option<String>,
}

impl Mock {
    /// Construct a new mock platform by providing a device map `registers`
    #[must_use]
    pub fn new(registers: RegisterMap) -> Self {
        // Sparse memory, everything starts zeroed
        let mut memory: HashMap<usize, u8> = HashMap::default();
        for Register { addr, length } in registers.values() {
            for i in 0..*length {
                memory.insert(addr + i, 0u8);
            }
        }
        Self {
            memory,
            registers,
            history: vec![],
            programmed: None,
        }
    }

    /// Every write performed so far, oldest first
    #[must_use]
    pub fn history(&self) -> &[WriteRecord] {
        &self.history
    }

    /// The 32-bit words written to `device` at byte offset `offset`, oldest first
    #[must_use]
    pub fn words_written(&self, device: &str, offset: usize) -> Vec<u32> {
        self.history
            .iter()
            .filter(|w| w.device.as_str() == device && w.offset == offset)
            .filter_map(WriteRecord::word)
            .collect()
    }

    /// Forget the write history, keeping memory as is
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// The bitstream most recently passed to [`Transport::program`]
    #[must_use]
    pub fn programmed(&self) -> Option<&str> {
        self.programmed.as_deref()
    }

    /// Fill memory directly without recording a write, as gateware would
    /// # Errors
    /// Returns an error if the device doesn't exist or the data doesn't fit
    pub fn poke(&mut self, device: &str, offset: usize, data: &[u8]) -> Result<(), Error> {
        let base = self.bounds(device, offset, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(base + offset + i, *byte);
        }
        Ok(())
    }

    fn bounds(&self, device: &str, offset: usize, n: usize) -> Result<usize, Error> {
        let dev = self
            .registers
            .get(device)
            .ok_or_else(|| Error::MissingDevice(device.to_string()))?;
        if offset + n > dev.length {
            return Err(Error::OutOfBounds {
                device: device.to_string(),
                offset,
                n,
            });
        }
        Ok(dev.addr)
    }
}

impl Transport for Mock {
    fn is_running(&mut self) -> TransportResult<bool> {
        Ok(true)
    }

    fn read_n_bytes(&mut self, device: &str, offset: usize, n: usize) -> TransportResult<Vec<u8>> {
        let base = self.bounds(device, offset, n)?;
        Ok((0..n)
            .map(|i| self.memory.get(&(base + offset + i)).copied().unwrap_or(0))
            .collect())
    }

    fn write_bytes(&mut self, device: &str, offset: usize, data: &[u8]) -> TransportResult<()> {
        self.poke(device, offset, data)?;
        self.history.push(WriteRecord {
            device: KString::from_ref(device),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn listdev(&mut self) -> TransportResult<RegisterMap> {
        Ok(self.registers.clone())
    }

    fn program(&mut self, bitstream: &str) -> TransportResult<()> {
        self.programmed = Some(bitstream.to_string());
        Ok(())
    }

    fn deprogram(&mut self) -> TransportResult<()> {
        self.programmed = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    fn scratchpad(length: usize) -> Mock {
        Mock::new(HashMap::from([(
            "sys_scratchpad".into(),
            Register { addr: 0, length },
        )]))
    }

    macro_rules! test_rw_num {
        ($num:ty, $v:literal) => {
            paste! {
                #[test]
                #[allow(clippy::float_cmp)]
                fn [<test_rw_$num>]() {
                    let mut transport = scratchpad(core::mem::size_of::<$num>());
                    let num: $num = $v;
                    transport.write("sys_scratchpad", 0, &num).unwrap();
                    let read_num: $num = transport.read("sys_scratchpad", 0).unwrap();
                    assert_eq!(read_num, num);
                }
            }
        };
    }

    #[test]
    fn test_read() {
        let mut transport = scratchpad(4);
        let bytes: [u8; 4] = transport.read_bytes("sys_scratchpad", 0).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0]);
    }

    #[test]
    fn test_write_read_offset() {
        let mut transport = scratchpad(4);
        transport.write_bytes("sys_scratchpad", 2, &[7, 8]).unwrap();
        let read_bytes = transport.read_n_bytes("sys_scratchpad", 0, 4).unwrap();
        assert_eq!(read_bytes, [0, 0, 7, 8]);
        let read_bytes: [u8; 2] = transport.read_bytes("sys_scratchpad", 2).unwrap();
        assert_eq!(read_bytes, [7, 8]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut transport = scratchpad(4);
        assert!(transport.write_bytes("sys_scratchpad", 2, &[1, 2, 3]).is_err());
        assert!(transport.read_n_bytes("sys_scratchpad", 4, 1).is_err());
        assert!(transport.read_n_bytes("nope", 0, 1).is_err());
        // Failed writes aren't recorded
        assert!(transport.history().is_empty());
    }

    #[test]
    fn test_history() {
        let mut transport = Mock::new(HashMap::from([(
            "ctrl".into(),
            Register { addr: 0, length: 8 },
        )]));
        transport.write("ctrl", 0, &1u32).unwrap();
        transport.write("ctrl", 4, &2u32).unwrap();
        transport.write("ctrl", 0, &3u32).unwrap();
        assert_eq!(transport.words_written("ctrl", 0), vec![1, 3]);
        assert_eq!(transport.words_written("ctrl", 4), vec![2]);
        assert_eq!(transport.history().len(), 3);
        // Poking is invisible to the history
        transport.poke("ctrl", 0, &[0xff; 4]).unwrap();
        assert_eq!(transport.history().len(), 3);
        transport.clear_history();
        assert!(transport.history().is_empty());
        let word: u32 = transport.read("ctrl", 0).unwrap();
        assert_eq!(word, 0xffff_ffff);
    }

    #[test]
    fn test_program() {
        let mut transport = scratchpad(4);
        transport.program("tclk_2012_Oct_15_1635.bof").unwrap();
        assert_eq!(transport.programmed(), Some("tclk_2012_Oct_15_1635.bof"));
        transport.deprogram().unwrap();
        assert_eq!(transport.programmed(), None);
    }

    test_rw_num!(u8, 42);
    test_rw_num!(u16, 0xDEAD);
    test_rw_num!(u32, 0xDEAD_BEEF);
    test_rw_num!(u64, 0xDEAD_BEEF_B0BA_CAFE);
    test_rw_num!(i16, -0xDEA);
    test_rw_num!(i32, -0x0DEA_DBEE);
    test_rw_num!(f32, 1.618);
    test_rw_num!(f64, -6.022e23);
}
