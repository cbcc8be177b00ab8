//! Guest bridge
//!
//! This module owns the compiled taskoo core module and the calling
//! convention used to talk to it:
//! - Input strings are copied into buffers obtained from the guest allocator
//! - Results are read back from the offset an export returns, with the length
//!   taken from the guest's shared output-length export
//! - Every result buffer is handed back to the guest's free export exactly once
//!
//! The guest keeps a single shared output length, so all calls go through one
//! mutex. The scoped [`ResultBuffer`] borrows the guest for the length query,
//! the read and the free, so nothing can run in between.

pub mod buffer;
pub mod host_env;
pub mod wasm;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::ResultBuffer;
pub use wasm::WasmGuest;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::config::{GuestConfig, GuestExports};

/// Error types for guest operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to read guest module '{path}': {source}")]
    ModuleRead {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to compile guest module: {0}")]
    Compile(String),

    #[error("Failed to set up guest host environment: {0}")]
    HostEnvironment(String),

    #[error("Failed to instantiate guest module: {0}")]
    Instantiate(String),

    #[error("Guest initialization hook '{export}' failed: {message}")]
    Initialize { export: String, message: String },

    #[error("Guest export '{0}' not found")]
    MissingExport(String),

    #[error("Guest export '{export}' has an unexpected signature: {message}")]
    SignatureMismatch { export: String, message: String },

    #[error("Guest allocator could not provide {0} bytes")]
    AllocationFailed(u32),

    #[error("Input of {0} bytes does not fit in guest memory")]
    InputTooLarge(usize),

    #[error("Guest buffer at offset {offset} with length {len} is outside guest memory")]
    OutOfBounds { offset: u32, len: u32 },

    #[error("Guest output at offset {offset} is not valid UTF-8: {source}")]
    InvalidUtf8 {
        offset: u32,
        source: std::str::Utf8Error,
    },

    #[error("Guest export '{export}' trapped: {message}")]
    Trap { export: String, message: String },

    #[error("Guest ran out of fuel in '{0}'")]
    FuelExhausted(String),

    #[error("Guest memory exceeds limit of {0} bytes")]
    MemoryLimitExceeded(u64),

    #[error("Guest lock poisoned by an earlier panic")]
    Poisoned,

    #[error("Guest worker failed: {0}")]
    Worker(String),
}

/// Low-level access to an instantiated guest module.
///
/// Implementations perform single guest calls and raw memory access only.
/// Sequencing and buffer ownership are the [`Bridge`]'s job.
pub trait GuestModule: Send {
    /// Fail with [`BridgeError::MissingExport`] unless `export` exists
    fn check_export(&mut self, export: &str) -> Result<(), BridgeError>;

    /// Ask the guest allocator for `len` bytes
    fn allocate(&mut self, len: u32) -> Result<u32, BridgeError>;

    /// Copy `bytes` into guest memory at `offset`
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Copy `len` bytes out of guest memory at `offset`
    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, BridgeError>;

    /// Call `export(offset, len)`, returning the offset of its result
    fn call_with_input(&mut self, export: &str, offset: u32, len: u32) -> Result<u32, BridgeError>;

    /// Call `export()`, returning the offset of its result
    fn call_without_input(&mut self, export: &str) -> Result<u32, BridgeError>;

    /// Call `export(offset, len)` for an export that produces no result
    fn call_consuming(&mut self, export: &str, offset: u32, len: u32) -> Result<(), BridgeError>;

    /// Length of the result produced by the most recent call
    fn output_len(&mut self) -> Result<u32, BridgeError>;

    /// Release a result buffer
    fn free(&mut self, offset: u32) -> Result<(), BridgeError>;
}

/// How an export exchanges data with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// String in, string out
    RoundTrip,
    /// No input, string out
    Query,
    /// String in, nothing out
    SendOnly,
}

/// Operations exposed over HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Today,
    List,
    Agenda,
    Add,
    Delete,
    StateChange,
    Run,
}

impl Operation {
    pub fn shape(self) -> CallShape {
        match self {
            Operation::Today => CallShape::Query,
            Operation::Add | Operation::Run => CallShape::SendOnly,
            Operation::List | Operation::Agenda | Operation::Delete | Operation::StateChange => {
                CallShape::RoundTrip
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Today => "today",
            Operation::List => "list",
            Operation::Agenda => "agenda",
            Operation::Add => "add",
            Operation::Delete => "delete",
            Operation::StateChange => "state_change",
            Operation::Run => "run",
        }
    }

    /// Configured export name backing this operation
    pub fn export_name(self, exports: &GuestExports) -> &str {
        match self {
            Operation::Today => &exports.today,
            Operation::List => &exports.list,
            Operation::Agenda => &exports.agenda,
            Operation::Add => &exports.add,
            Operation::Delete => &exports.delete,
            Operation::StateChange => &exports.state_change,
            Operation::Run => &exports.run,
        }
    }
}

/// Outcome of a guest operation, classified by the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum GuestReply {
    /// The guest produced JSON
    Payload(serde_json::Value),
    /// The guest produced a non-JSON string (rejected command)
    Rejected(String),
    /// Send-only operation completed
    Accepted,
}

impl GuestReply {
    pub fn from_output(output: String) -> Self {
        match serde_json::from_str(&output) {
            Ok(value) => GuestReply::Payload(value),
            Err(_) => GuestReply::Rejected(output),
        }
    }
}

/// Serialized access to the guest module
pub struct Bridge {
    guest: Mutex<Box<dyn GuestModule>>,
    exports: GuestExports,
    calls: AtomicU64,
}

impl Bridge {
    pub fn new(guest: Box<dyn GuestModule>, exports: GuestExports) -> Self {
        Self {
            guest: Mutex::new(guest),
            exports,
            calls: AtomicU64::new(0),
        }
    }

    /// Load, link and instantiate the guest module described by `config`
    pub fn initialize(config: &GuestConfig) -> Result<Self, BridgeError> {
        let guest = WasmGuest::load(config)?;
        Ok(Self::new(Box::new(guest), config.exports.clone()))
    }

    /// Number of export calls made so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn GuestModule>>, BridgeError> {
        self.guest.lock().map_err(|_| BridgeError::Poisoned)
    }

    /// Copy `input` into a fresh guest buffer. The buffer is owned by the
    /// export it is passed to.
    fn stage_input(
        guest: &mut dyn GuestModule,
        export: &str,
        input: &str,
    ) -> Result<(u32, u32), BridgeError> {
        guest.check_export(export)?;

        let bytes = input.as_bytes();
        let len = u32::try_from(bytes.len()).map_err(|_| BridgeError::InputTooLarge(bytes.len()))?;
        let offset = guest.allocate(len)?;
        if offset == 0 {
            return Err(BridgeError::AllocationFailed(len));
        }
        guest.write(offset, bytes)?;
        Ok((offset, len))
    }

    /// Send `input` to `export` and return the string it produced
    pub fn encode_and_send(&self, export: &str, input: &str) -> Result<String, BridgeError> {
        let mut guard = self.lock()?;
        let guest: &mut dyn GuestModule = &mut **guard;

        let (offset, len) = Self::stage_input(guest, export, input)?;
        debug!(export, bytes = len, "calling guest export");
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result_offset = guest.call_with_input(export, offset, len)?;

        let mut output = ResultBuffer::acquire(guest, result_offset)?;
        let text = output.read_string()?;
        debug!(export, bytes = text.len(), "guest export returned");
        Ok(text)
    }

    /// Call a no-input `export` and return the string it produced
    pub fn query(&self, export: &str) -> Result<String, BridgeError> {
        let mut guard = self.lock()?;
        let guest: &mut dyn GuestModule = &mut **guard;

        guest.check_export(export)?;
        debug!(export, "calling guest export");
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result_offset = guest.call_without_input(export)?;

        let mut output = ResultBuffer::acquire(guest, result_offset)?;
        let text = output.read_string()?;
        debug!(export, bytes = text.len(), "guest export returned");
        Ok(text)
    }

    /// Send `input` to an `export` that produces no result
    pub fn send(&self, export: &str, input: &str) -> Result<(), BridgeError> {
        let mut guard = self.lock()?;
        let guest: &mut dyn GuestModule = &mut **guard;

        let (offset, len) = Self::stage_input(guest, export, input)?;
        debug!(export, bytes = len, "calling guest export");
        self.calls.fetch_add(1, Ordering::Relaxed);
        guest.call_consuming(export, offset, len)
    }

    /// Run `op` synchronously and classify the result
    pub fn dispatch_blocking(&self, op: Operation, input: &str) -> Result<GuestReply, BridgeError> {
        let export = op.export_name(&self.exports);
        match op.shape() {
            CallShape::RoundTrip => self.encode_and_send(export, input).map(GuestReply::from_output),
            CallShape::Query => self.query(export).map(GuestReply::from_output),
            CallShape::SendOnly => self.send(export, input).map(|()| GuestReply::Accepted),
        }
    }

    /// Run `op` on the blocking pool
    pub async fn dispatch(self: &Arc<Self>, op: Operation, input: String) -> Result<GuestReply, BridgeError> {
        let bridge = Arc::clone(self);
        tokio::task::spawn_blocking(move || bridge.dispatch_blocking(op, &input))
            .await
            .map_err(|e| BridgeError::Worker(e.to_string()))?
    }
}
