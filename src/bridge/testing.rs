//! Instrumented in-process guest for tests
//!
//! Mimics the core module's memory protocol with a single shared output
//! region: every producing call overwrites it, the length is only valid until
//! the next guest call, and each result must be freed before anything else
//! touches the guest. Protocol misuse is recorded in the [`Ledger`] instead of
//! corrupting state silently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BridgeError, GuestModule};
use crate::config::GuestExports;

const MEMORY_SIZE: usize = 1024 * 1024;
const OUTPUT_OFFSET: u32 = 16;
const OUTPUT_CAPACITY: u32 = 256 * 1024;
const INPUT_BASE: u32 = OUTPUT_OFFSET + OUTPUT_CAPACITY;

/// Produces the raw output bytes for `(export, input)`
pub(crate) type Handler = Box<dyn Fn(&str, &str) -> Vec<u8> + Send>;

/// What the guest saw
#[derive(Debug, Default, Clone)]
pub(crate) struct Ledger {
    pub allocations: u64,
    pub results: u64,
    pub frees: u64,
    pub calls: Vec<(String, String)>,
    pub violations: Vec<String>,
}

impl Ledger {
    pub fn is_balanced(&self) -> bool {
        self.results == self.frees && self.violations.is_empty()
    }
}

#[derive(Clone, Default)]
pub(crate) struct LedgerHandle(Arc<Mutex<Ledger>>);

impl LedgerHandle {
    pub fn snapshot(&self) -> Ledger {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct FakeGuest {
    memory: Vec<u8>,
    heap: u32,
    exports: HashSet<String>,
    handler: Handler,
    staged_inputs: HashMap<u32, u32>,
    output_len: u32,
    output_fresh: bool,
    output_outstanding: bool,
    claimed_len: Option<u32>,
    failing_allocator: bool,
    ledger: LedgerHandle,
}

impl FakeGuest {
    pub fn new(handler: impl Fn(&str, &str) -> Vec<u8> + Send + 'static) -> (Self, LedgerHandle) {
        let defaults = GuestExports::default();
        let exports = [
            defaults.today,
            defaults.list,
            defaults.agenda,
            defaults.add,
            defaults.delete,
            defaults.state_change,
            defaults.run,
        ]
        .into_iter()
        .collect();
        let ledger = LedgerHandle::default();
        let guest = Self {
            memory: vec![0; MEMORY_SIZE],
            heap: INPUT_BASE,
            exports,
            handler: Box::new(handler),
            staged_inputs: HashMap::new(),
            output_len: 0,
            output_fresh: false,
            output_outstanding: false,
            claimed_len: None,
            failing_allocator: false,
            ledger: ledger.clone(),
        };
        (guest, ledger)
    }

    /// Returns the input unchanged
    pub fn echo() -> (Self, LedgerHandle) {
        Self::new(|_, input| input.as_bytes().to_vec())
    }

    /// Returns `[[export, input]]` as JSON, so replies can be matched to calls
    pub fn tagged() -> (Self, LedgerHandle) {
        Self::new(|export, input| serde_json::json!([[export, input]]).to_string().into_bytes())
    }

    /// Returns the same output for every call
    pub fn replying(output: &'static str) -> (Self, LedgerHandle) {
        Self::new(move |_, _| output.as_bytes().to_vec())
    }

    pub fn without_export(mut self, export: &str) -> Self {
        self.exports.remove(export);
        self
    }

    /// Report `len` from the output length export regardless of the result
    pub fn claiming_len(mut self, len: u32) -> Self {
        self.claimed_len = Some(len);
        self
    }

    /// Allocator returns null, as an out-of-memory guest would
    pub fn failing_allocator(mut self) -> Self {
        self.failing_allocator = true;
        self
    }

    fn violation(&self, message: String) -> BridgeError {
        self.ledger.lock().violations.push(message.clone());
        BridgeError::Trap {
            export: "fake".to_string(),
            message,
        }
    }

    /// Every call that enters guest code must find no result outstanding
    fn enter(&mut self, what: &str) -> Result<(), BridgeError> {
        self.output_fresh = false;
        if self.output_outstanding {
            return Err(self.violation(format!("{} called while a result buffer is outstanding", what)));
        }
        Ok(())
    }

    fn take_input(&mut self, offset: u32, len: u32) -> Result<String, BridgeError> {
        match self.staged_inputs.remove(&offset) {
            Some(staged) if staged == len => {}
            _ => return Err(self.violation(format!("input {}+{} was never allocated", offset, len))),
        }
        if self.staged_inputs.is_empty() {
            self.heap = INPUT_BASE;
        }
        let start = offset as usize;
        let bytes = &self.memory[start..start + len as usize];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn produce(&mut self, export: &str, input: String) -> Result<u32, BridgeError> {
        let output = (self.handler)(export, &input);
        if output.len() > OUTPUT_CAPACITY as usize {
            return Err(self.violation(format!("output of {} bytes overflows", output.len())));
        }
        let start = OUTPUT_OFFSET as usize;
        self.memory[start..start + output.len()].copy_from_slice(&output);
        self.output_len = output.len() as u32;
        self.output_fresh = true;
        self.output_outstanding = true;

        let mut ledger = self.ledger.lock();
        ledger.results += 1;
        ledger.calls.push((export.to_string(), input));
        Ok(OUTPUT_OFFSET)
    }

    fn check_bounds(&self, offset: u32, len: u32) -> Result<(), BridgeError> {
        let end = offset as u64 + len as u64;
        if end > self.memory.len() as u64 {
            return Err(BridgeError::OutOfBounds { offset, len });
        }
        Ok(())
    }
}

impl GuestModule for FakeGuest {
    fn check_export(&mut self, export: &str) -> Result<(), BridgeError> {
        if self.exports.contains(export) {
            Ok(())
        } else {
            Err(BridgeError::MissingExport(export.to_string()))
        }
    }

    fn allocate(&mut self, len: u32) -> Result<u32, BridgeError> {
        self.enter("allocate")?;
        if self.failing_allocator || self.heap as usize + len as usize > self.memory.len() {
            return Ok(0);
        }
        let offset = self.heap;
        self.heap += len.max(1);
        self.staged_inputs.insert(offset, len);
        self.ledger.lock().allocations += 1;
        Ok(offset)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), BridgeError> {
        let len = bytes.len() as u32;
        match self.staged_inputs.get(&offset) {
            Some(&capacity) if capacity >= len => {}
            _ => return Err(self.violation(format!("write of {} bytes to {} exceeds its allocation", len, offset))),
        }
        self.check_bounds(offset, len)?;
        let start = offset as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, BridgeError> {
        self.check_bounds(offset, len)?;
        let start = offset as usize;
        Ok(self.memory[start..start + len as usize].to_vec())
    }

    fn call_with_input(&mut self, export: &str, offset: u32, len: u32) -> Result<u32, BridgeError> {
        self.enter(export)?;
        self.check_export(export)?;
        let input = self.take_input(offset, len)?;
        self.produce(export, input)
    }

    fn call_without_input(&mut self, export: &str) -> Result<u32, BridgeError> {
        self.enter(export)?;
        self.check_export(export)?;
        self.produce(export, String::new())
    }

    fn call_consuming(&mut self, export: &str, offset: u32, len: u32) -> Result<(), BridgeError> {
        self.enter(export)?;
        self.check_export(export)?;
        let input = self.take_input(offset, len)?;
        let _ = (self.handler)(export, &input);
        self.ledger.lock().calls.push((export.to_string(), input));
        Ok(())
    }

    fn output_len(&mut self) -> Result<u32, BridgeError> {
        if !self.output_fresh {
            return Err(self.violation("output length queried without a fresh result".to_string()));
        }
        self.output_fresh = false;
        Ok(self.claimed_len.unwrap_or(self.output_len))
    }

    fn free(&mut self, offset: u32) -> Result<(), BridgeError> {
        self.output_fresh = false;
        if offset != OUTPUT_OFFSET || !self.output_outstanding {
            return Err(self.violation(format!("free of {} which is not an outstanding result", offset)));
        }
        self.output_outstanding = false;
        self.ledger.lock().frees += 1;
        Ok(())
    }
}
