//! Scoped ownership of guest result buffers

use tracing::error;

use super::{BridgeError, GuestModule};

/// A result buffer returned by a guest export.
#[allow(clippy::len_without_is_empty)]
///
/// Holds the guest mutably until dropped, so the output length query, the
/// read and the free happen back to back. Dropping the buffer hands it back
/// to the guest's free export, on every exit path.
pub struct ResultBuffer<'g> {
    guest: &'g mut dyn GuestModule,
    offset: u32,
    len: u32,
}

impl<'g> ResultBuffer<'g> {
    /// Take ownership of the buffer at `offset`, which the guest has just
    /// returned. Must be called before any other call into `guest`.
    pub fn acquire(guest: &'g mut dyn GuestModule, offset: u32) -> Result<Self, BridgeError> {
        let mut buffer = Self { guest, offset, len: 0 };
        buffer.len = buffer.guest.output_len()?;
        Ok(buffer)
    }

    /// Byte length reported by the guest
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, BridgeError> {
        self.guest.read(self.offset, self.len)
    }

    pub fn read_string(&mut self) -> Result<String, BridgeError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| BridgeError::InvalidUtf8 {
            offset: self.offset,
            source: e.utf8_error(),
        })
    }
}

impl Drop for ResultBuffer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.guest.free(self.offset) {
            error!("Failed to free guest buffer at offset {}: {}", self.offset, e);
        }
    }
}
