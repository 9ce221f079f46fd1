//! Reading sample data back out of the fabric through snapshot blocks, and undoing the bit order
//! the SERDES hands it to us in.

use crate::transport::{
    self,
    with_transport,
    Deserialize,
    Serialize,
    Transport,
};
use adcleda_derive::WordSerde;
use packed_struct::prelude::*;
use std::{
    sync::{
        Mutex,
        Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{
    debug,
    trace,
};

/// Lanes interleaved in a full-rate capture
pub const LANES: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("Snapshot `{name}` never finished capturing after {polls} polls")]
    Timeout { name: String, polls: usize },
}

#[derive(Debug, PackedStruct, Default, Copy, Clone, WordSerde)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
#[allow(clippy::struct_excessive_bools)]
pub struct Control {
    #[packed_field(bits = "0")]
    arm: bool,
    #[packed_field(bits = "1")]
    trig_override: bool,
    #[packed_field(bits = "2")]
    write_enable_override: bool,
    #[packed_field(bits = "3")]
    circular_capture: bool,
}

#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, WordSerde)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Status {
    #[packed_field(bits = "0..=30", endian = "msb")]
    /// Number of bytes captured
    pub bytes: Integer<u32, packed_bits::Bits<31>>,
    #[packed_field(bits = "31")]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Times to read the status register waiting for `done`
    pub polls: usize,
    /// Pause between polls
    pub poll_interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            polls: 100,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// The snapshot yellow block to capture a chunk of samples
#[derive(Debug)]
pub struct Snapshot<T> {
    /// Upwards pointer to the parent's transport
    transport: Weak<Mutex<T>>,
    /// The name of the block, its registers are suffixed `_ctrl`, `_status` and `_bram`
    name: String,
    config: SnapshotConfig,
}

impl<T> Snapshot<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(transport: Weak<Mutex<T>>, name: &str, config: SnapshotConfig) -> Self {
        Self {
            transport,
            name: name.to_string(),
            config,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ctrl(&self) -> String {
        format!("{}_ctrl", self.name)
    }

    /// Arm the snapshot block so that the next trigger starts capture. With `man_trig` the block
    /// triggers itself as soon as it's armed.
    /// # Errors
    /// Returns an error on transport errors
    pub fn arm(&self, man_trig: bool) -> Result<(), Error> {
        let control_reg = self.ctrl();
        with_transport(&self.transport, |t| {
            let mut ctrl = Control {
                trig_override: man_trig,
                ..Default::default()
            };
            t.write(&control_reg, 0, &ctrl)?;
            ctrl.arm = true;
            t.write(&control_reg, 0, &ctrl)?;
            Ok(())
        })
    }

    /// Force a trigger
    /// # Errors
    /// Returns an error on transport errors
    pub fn trigger(&self) -> Result<(), Error> {
        let control_reg = self.ctrl();
        with_transport(&self.transport, |t| {
            let mut ctrl: Control = t.read(&control_reg, 0)?;
            ctrl.trig_override = true;
            t.write(&control_reg, 0, &ctrl)?;
            Ok(())
        })
    }

    /// Read the status register
    /// # Errors
    /// Returns an error on transport errors
    pub fn status(&self) -> Result<Status, Error> {
        let status_reg = format!("{}_status", self.name);
        with_transport(&self.transport, |t| Ok(t.read(&status_reg, 0)?))
    }

    /// Read `n` captured bytes without checking the block is done
    /// # Errors
    /// Returns an error on transport errors
    pub fn read(&self, n: usize) -> Result<Vec<u8>, Error> {
        let bram_reg = format!("{}_bram", self.name);
        with_transport(&self.transport, |t| Ok(t.read_n_bytes(&bram_reg, 0, n)?))
    }

    /// Arm with a manual trigger, wait for the block to fill and read back everything it captured
    /// # Errors
    /// Returns an error on transport errors, or if the block never reports done
    pub fn capture(&self) -> Result<Vec<u8>, Error> {
        self.arm(true)?;
        for poll in 0..self.config.polls {
            let status = self.status()?;
            trace!(poll, ?status, "Polling snapshot");
            if status.done {
                let n = u32::from(status.bytes) as usize;
                debug!(name = %self.name, bytes = n, "Snapshot captured");
                return self.read(n);
            }
            std::thread::sleep(self.config.poll_interval);
        }
        Err(Error::Timeout {
            name: self.name.clone(),
            polls: self.config.polls,
        })
    }
}

/// Reverse the bit order within each nibble of `b`
#[must_use]
pub fn reverse_nibbles(b: u8) -> u8 {
    let hi = (b >> 4).reverse_bits() >> 4;
    let lo = (b & 0x0f).reverse_bits() >> 4;
    (hi << 4) | lo
}

/// Nibble-reverse one lane's worth of samples. The final sample straddles the end of the
/// capture and is dropped.
#[must_use]
pub fn process_lane(bytes: &[u8]) -> Vec<u8> {
    let keep = bytes.len().saturating_sub(1);
    bytes[..keep].iter().copied().map(reverse_nibbles).collect()
}

/// Split a capture of `lanes` interleaved byte streams into its processed lanes
#[must_use]
pub fn deinterleave(bytes: &[u8], lanes: usize) -> Vec<Vec<u8>> {
    (0..lanes)
        .map(|lane| {
            let raw: Vec<u8> = bytes.iter().skip(lane).step_by(lanes).copied().collect();
            process_lane(&raw)
        })
        .collect()
}

/// A single-channel capture stores one sample in the low byte of each big-endian 32-bit word
#[must_use]
pub fn channel_bytes(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks_exact(4)
        // Least significant byte of the word
        .map(|word| word[3])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::Register,
        transport::mock::Mock,
    };
    use std::{
        collections::HashMap,
        sync::Arc,
    };

    fn snapshot_mock(bram: usize) -> Arc<Mutex<Mock>> {
        Arc::new(Mutex::new(Mock::new(HashMap::from([
            ("fifo_data_ctrl".into(), Register { addr: 0, length: 4 }),
            ("fifo_data_status".into(), Register { addr: 4, length: 4 }),
            (
                "fifo_data_bram".into(),
                Register {
                    addr: 8,
                    length: bram,
                },
            ),
        ]))))
    }

    fn fast() -> SnapshotConfig {
        SnapshotConfig {
            polls: 3,
            poll_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_reverse_nibbles() {
        assert_eq!(reverse_nibbles(0x00), 0x00);
        assert_eq!(reverse_nibbles(0x81), 0x18);
        assert_eq!(reverse_nibbles(0x12), 0x84);
        assert_eq!(reverse_nibbles(0xf0), 0xf0);
        assert_eq!(reverse_nibbles(0x55), 0xaa);
        for b in 0..=255u8 {
            assert_eq!(reverse_nibbles(reverse_nibbles(b)), b);
        }
    }

    #[test]
    fn test_process_lane() {
        assert_eq!(process_lane(&[0x12, 0x81, 0xff]), vec![0x84, 0x18]);
        assert!(process_lane(&[0x12]).is_empty());
        assert!(process_lane(&[]).is_empty());
    }

    #[test]
    fn test_deinterleave() {
        let bytes: Vec<u8> = (0..64).collect();
        let lanes = deinterleave(&bytes, LANES);
        assert_eq!(lanes.len(), 16);
        // Four samples per lane, the last dropped
        assert_eq!(lanes[1].len(), 3);
        assert_eq!(
            lanes[1],
            vec![reverse_nibbles(1), reverse_nibbles(17), reverse_nibbles(33)]
        );
        assert_eq!(lanes[15][0], reverse_nibbles(15));
    }

    #[test]
    fn test_channel_bytes() {
        let bytes = [0x00, 0x00, 0x01, 0x7f, 0xff, 0xff, 0xff, 0x80, 0x12];
        assert_eq!(channel_bytes(&bytes), vec![0x7f, 0x80]);
    }

    #[test]
    fn test_status_bytes() {
        let status = Status::unpack(&[0x80, 0x00, 0x00, 0x14]).unwrap();
        assert!(status.done);
        assert_eq!(u32::from(status.bytes), 20);
        let status = Status {
            bytes: 0x0102_0304.into(),
            done: false,
        };
        assert_eq!(status.pack().unwrap(), [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_arm() {
        let transport = snapshot_mock(16);
        let snap = Snapshot::new(Arc::downgrade(&transport), "fifo_data", fast());
        snap.arm(true).unwrap();
        assert_eq!(
            transport.lock().unwrap().words_written("fifo_data_ctrl", 0),
            vec![0b10, 0b11]
        );
        snap.arm(false).unwrap();
        snap.trigger().unwrap();
        assert_eq!(
            transport.lock().unwrap().words_written("fifo_data_ctrl", 0)[2..],
            [0b00, 0b01, 0b11]
        );
    }

    #[test]
    fn test_capture() {
        let transport = snapshot_mock(32);
        {
            let mut mock = transport.lock().unwrap();
            mock.poke("fifo_data_status", 0, &(0x8000_0000u32 | 20).to_be_bytes())
                .unwrap();
            mock.poke("fifo_data_bram", 0, &[0xaa; 32]).unwrap();
        }
        let snap = Snapshot::new(Arc::downgrade(&transport), "fifo_data", fast());
        let status = snap.status().unwrap();
        assert!(status.done);
        assert_eq!(u32::from(status.bytes), 20);
        assert_eq!(snap.capture().unwrap(), vec![0xaa; 20]);
    }

    #[test]
    fn test_capture_timeout() {
        let transport = snapshot_mock(16);
        let snap = Snapshot::new(Arc::downgrade(&transport), "fifo_data", fast());
        assert!(matches!(
            snap.capture(),
            Err(Error::Timeout { polls: 3, .. })
        ));
    }
}
