//! Front-end session: the storage stack's view of the device

use std::sync::Arc;

use tracing::debug;

use super::Endpoint;
use crate::buffer::SECTOR_SIZE;
use crate::device::Device;
use crate::error::DeviceError;
use crate::gate::Side;
use crate::transfer::IoBuf;

/// The single open front end
///
/// Offers positioned I/O (`read_at` / `write_at`) and, through [`Endpoint`],
/// cursor I/O. The cursor advances by the sectors an operation touched, so an
/// unaligned tail still moves it to the next sector.
pub struct FrontEnd {
    device: Arc<Device>,
    position: u64,
}

impl FrontEnd {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Current cursor, in sectors
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor to `block_address`
    pub fn seek(&mut self, block_address: u64) -> Result<(), DeviceError> {
        self.check_range(block_address, 0)?;
        self.position = block_address;
        Ok(())
    }

    /// Read `dst.len()` bytes starting at `block_address`
    pub fn read_at(&self, block_address: u64, dst: &mut [u8]) -> Result<usize, DeviceError> {
        self.execute(block_address, IoBuf::Read(dst))
    }

    /// Write all of `src` starting at `block_address`
    pub fn write_at(&self, block_address: u64, src: &[u8]) -> Result<usize, DeviceError> {
        self.execute(block_address, IoBuf::Write(src))
    }

    /// Run one logical operation through the transfer engine
    pub fn execute(&self, block_address: u64, data: IoBuf<'_>) -> Result<usize, DeviceError> {
        self.check_range(block_address, data.len())?;
        let transferred = self.device.engine().execute(block_address, data)?;
        Ok(transferred)
    }

    fn check_range(&self, block_address: u64, length: usize) -> Result<(), DeviceError> {
        let out_of_range = || DeviceError::OutOfRange {
            block_address,
            length,
            sectors: self.device.sectors(),
        };
        let end = block_address
            .checked_mul(SECTOR_SIZE as u64)
            .and_then(|start| start.checked_add(length as u64))
            .ok_or_else(out_of_range)?;
        if block_address > self.device.sectors() || end > self.device.size_bytes() {
            return Err(out_of_range());
        }
        Ok(())
    }

    fn advance(&mut self, bytes: usize) {
        self.position += bytes.div_ceil(SECTOR_SIZE) as u64;
    }
}

impl Endpoint for FrontEnd {
    const SIDE: Side = Side::FrontEnd;

    fn open(device: &Arc<Device>) -> Result<Self, DeviceError> {
        device.gate().open(Self::SIDE)?;
        debug!(device_id = %device.id(), "Front end opened");
        Ok(Self {
            device: Arc::clone(device),
            position: 0,
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let n = self.read_at(self.position, buf)?;
        self.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        let n = self.write_at(self.position, buf)?;
        self.advance(n);
        Ok(n)
    }
}

impl std::fmt::Debug for FrontEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontEnd")
            .field("device_id", &self.device.id())
            .field("position", &self.position)
            .finish()
    }
}

impl Drop for FrontEnd {
    fn drop(&mut self) {
        self.device.gate().close(Self::SIDE);
        debug!(device_id = %self.device.id(), "Front end closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;

    fn device() -> Arc<Device> {
        Device::new(DeviceConfig {
            sectors: 8,
            buffer_capacity: Some(1024),
            response_timeout_ms: Some(1_000),
        })
        .unwrap()
    }

    #[test]
    fn test_out_of_range_rejected_before_relay() {
        let device = device();
        let front_end = device.open_front_end().unwrap();

        let err = front_end.write_at(7, &[0u8; 1024]).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutOfRange { block_address: 7, length: 1024, sectors: 8 }
        ));
        assert!(front_end.write_at(u64::MAX, &[0u8; 1]).is_err());
        assert_eq!(device.relay().stats().requests, 0);
    }

    #[test]
    fn test_empty_io_at_end_is_allowed() {
        let device = device();
        let front_end = device.open_front_end().unwrap();
        assert_eq!(front_end.read_at(8, &mut []).unwrap(), 0);
    }

    #[test]
    fn test_debug_names_device_and_cursor() {
        let device = device();
        let front_end = device.open_front_end().unwrap();
        let rendered = format!("{:?}", front_end);
        assert!(rendered.contains(&device.id().to_string()));
        assert!(rendered.contains("position: 0"));
    }

    #[test]
    fn test_seek_bounds() {
        let device = device();
        let mut front_end = device.open_front_end().unwrap();
        front_end.seek(8).unwrap();
        assert_eq!(front_end.position(), 8);
        assert!(front_end.seek(9).is_err());
        assert_eq!(front_end.position(), 8);
    }
}
