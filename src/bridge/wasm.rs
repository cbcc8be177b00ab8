//! Wasmtime-backed guest module

use tracing::{debug, info};
use wasmtime::{
    Config as EngineConfig, Engine, Instance, Linker, Memory, Module, Store, Trap, TypedFunc,
    WasmParams, WasmResults,
};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};

use super::host_env::HostEnvironment;
use super::{BridgeError, GuestModule};
use crate::config::{GuestConfig, GuestExports};

/// Per-store host state
pub struct GuestState {
    wasi: WasiP1Ctx,
}

/// The taskoo core module, instantiated once with its WASI imports
pub struct WasmGuest {
    store: Store<GuestState>,
    instance: Instance,
    memory: Memory,
    exports: GuestExports,
    fuel_limit: Option<u64>,
    memory_limit_bytes: u64,
}

impl WasmGuest {
    /// Read and instantiate the module at `config.module_path`
    pub fn load(config: &GuestConfig) -> Result<Self, BridgeError> {
        let wasm_bytes = std::fs::read(&config.module_path).map_err(|e| BridgeError::ModuleRead {
            path: config.module_path.display().to_string(),
            source: e,
        })?;
        info!(
            "Read guest module {} ({} bytes)",
            config.module_path.display(),
            wasm_bytes.len()
        );
        Self::from_bytes(&wasm_bytes, config)
    }

    /// Compile, link and instantiate `wasm_bytes`, then run the module's
    /// initialization hook once if it exports one
    pub fn from_bytes(wasm_bytes: &[u8], config: &GuestConfig) -> Result<Self, BridgeError> {
        let mut engine_config = EngineConfig::new();
        engine_config.consume_fuel(config.fuel_limit.is_some());

        let engine = Engine::new(&engine_config)
            .map_err(|e| BridgeError::Compile(format!("Failed to create WASM engine: {}", e)))?;
        let module = Module::new(&engine, wasm_bytes)
            .map_err(|e| BridgeError::Compile(e.to_string()))?;

        let host = HostEnvironment::from_config(config);
        let wasi = host.build_wasi_ctx()?;
        let mut store = Store::new(&engine, GuestState { wasi });

        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut GuestState| &mut state.wasi)
            .map_err(|e| BridgeError::Instantiate(e.to_string()))?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| BridgeError::Instantiate(e.to_string()))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BridgeError::MissingExport("memory".to_string()))?;

        let mut guest = Self {
            store,
            instance,
            memory,
            exports: config.exports.clone(),
            fuel_limit: config.fuel_limit,
            memory_limit_bytes: config.memory_limit_bytes,
        };
        guest.run_initialize()?;

        info!(
            "Guest module instantiated (config root {}, app config {})",
            host.config_root.display(),
            host.app_config_dir.display()
        );
        Ok(guest)
    }

    fn run_initialize(&mut self) -> Result<(), BridgeError> {
        let export = self.exports.initialize.clone();
        if self.instance.get_func(&mut self.store, &export).is_none() {
            debug!("Guest has no '{}' export, skipping initialization", export);
            return Ok(());
        }

        let init = self.typed::<(), ()>(&export)?;
        self.refuel()?;
        self.check_memory()?;
        init.call(&mut self.store, ()).map_err(|e| BridgeError::Initialize {
            export: export.clone(),
            message: e.to_string(),
        })?;
        debug!("Guest initialization hook '{}' completed", export);
        Ok(())
    }

    fn typed<P, R>(&mut self, export: &str) -> Result<TypedFunc<P, R>, BridgeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| BridgeError::MissingExport(export.to_string()))?;
        func.typed::<P, R>(&self.store)
            .map_err(|e| BridgeError::SignatureMismatch {
                export: export.to_string(),
                message: e.to_string(),
            })
    }

    fn refuel(&mut self) -> Result<(), BridgeError> {
        if let Some(fuel) = self.fuel_limit {
            self.store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Worker(format!("Failed to refuel guest: {}", e)))?;
        }
        Ok(())
    }

    fn check_memory(&self) -> Result<(), BridgeError> {
        let current_memory = self.memory.data_size(&self.store) as u64;
        if current_memory > self.memory_limit_bytes {
            return Err(BridgeError::MemoryLimitExceeded(self.memory_limit_bytes));
        }
        Ok(())
    }

    /// Enter an export that starts new work. The memory ceiling applies here.
    fn call<P, R>(&mut self, export: &str, params: P) -> Result<R, BridgeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self.typed::<P, R>(export)?;
        self.refuel()?;
        self.check_memory()?;
        func.call(&mut self.store, params)
            .map_err(|e| call_error(export, e))
    }

    /// Enter the length or free export for a result that already exists.
    /// Skips the memory ceiling so an oversized guest can still release it.
    fn call_for_result<P, R>(&mut self, export: &str, params: P) -> Result<R, BridgeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self.typed::<P, R>(export)?;
        self.refuel()?;
        func.call(&mut self.store, params)
            .map_err(|e| call_error(export, e))
    }
}

fn call_error(export: &str, err: wasmtime::Error) -> BridgeError {
    if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        return BridgeError::FuelExhausted(export.to_string());
    }
    BridgeError::Trap {
        export: export.to_string(),
        message: err.to_string(),
    }
}

impl GuestModule for WasmGuest {
    fn check_export(&mut self, export: &str) -> Result<(), BridgeError> {
        match self.instance.get_func(&mut self.store, export) {
            Some(_) => Ok(()),
            None => Err(BridgeError::MissingExport(export.to_string())),
        }
    }

    fn allocate(&mut self, len: u32) -> Result<u32, BridgeError> {
        let export = self.exports.allocate.clone();
        let offset: i32 = self.call(&export, len as i32)?;
        Ok(offset as u32)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), BridgeError> {
        self.memory
            .write(&mut self.store, offset as usize, bytes)
            .map_err(|_| BridgeError::OutOfBounds {
                offset,
                len: bytes.len() as u32,
            })
    }

    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, BridgeError> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(BridgeError::OutOfBounds { offset, len })?;
        self.memory
            .data(&self.store)
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(BridgeError::OutOfBounds { offset, len })
    }

    fn call_with_input(&mut self, export: &str, offset: u32, len: u32) -> Result<u32, BridgeError> {
        let result: i32 = self.call(export, (offset as i32, len as i32))?;
        Ok(result as u32)
    }

    fn call_without_input(&mut self, export: &str) -> Result<u32, BridgeError> {
        let result: i32 = self.call(export, ())?;
        Ok(result as u32)
    }

    fn call_consuming(&mut self, export: &str, offset: u32, len: u32) -> Result<(), BridgeError> {
        self.call::<(i32, i32), ()>(export, (offset as i32, len as i32))
    }

    fn output_len(&mut self) -> Result<u32, BridgeError> {
        let export = self.exports.output_len.clone();
        let len: i32 = self.call_for_result(&export, ())?;
        Ok(len as u32)
    }

    fn free(&mut self, offset: u32) -> Result<(), BridgeError> {
        let export = self.exports.free.clone();
        self.call_for_result::<i32, ()>(&export, offset as i32)
    }
}

#[cfg(test)]
impl WasmGuest {
    /// Read an `() -> i32` counter exported by a test module
    fn counter(&mut self, export: &str) -> i32 {
        self.call_for_result::<(), i32>(export, ()).unwrap()
    }
}
