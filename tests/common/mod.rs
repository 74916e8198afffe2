//! Shared fixtures for the dispatch integration tests.
//!
//! Every scenario is written once against [`Fixture`] and run on each architecture, so
//! the frame-list and table dispatchers are held to the same observable behavior.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use cxxframe::{
    arch::DispatchModel,
    metadata::{CatchableTypeSpec, ThrowInfoBuilder},
    Arch, Module, Result, Runtime, RuntimeConfig, Thread,
};

/// Every supported architecture.
pub const ARCHES: [Arch; 4] = [Arch::I386, Arch::X86_64, Arch::Arm, Arch::Arm64];

/// Ordered log of the native code a scenario ran.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

/// A runtime with one module and a trace shared by every binding made through it.
pub struct Fixture {
    pub runtime: Arc<Runtime>,
    pub module: Module,
    pub trace: Trace,
}

impl Fixture {
    pub fn new(arch: Arch) -> Result<Self> {
        let runtime = Runtime::new(RuntimeConfig::for_arch(arch))?;
        let module = runtime.load_module("scenario.exe")?;
        Ok(Self {
            runtime,
            module,
            trace: Trace::default(),
        })
    }

    pub fn arch(&self) -> Arch {
        self.runtime.arch()
    }

    pub fn thread(&self) -> Result<Thread> {
        self.runtime.spawn_thread()
    }

    /// A cleanup funclet logging `name`.
    pub fn cleanup(&self, name: impl Into<String>) -> Result<u64> {
        let trace = self.trace.clone();
        let name = name.into();
        self.module.bind_cleanup(move |_, _| {
            trace.push(name.clone());
            Ok(())
        })
    }

    /// A destructor logging `~name`.
    pub fn destructor(&self, name: &'static str) -> Result<u64> {
        let trace = self.trace.clone();
        self.module.bind_destructor(move |_, _| {
            trace.push(format!("~{name}"));
            Ok(())
        })
    }

    /// A catch handler logging `name` and continuing at `continuation`.
    pub fn handler(&self, name: &'static str, continuation: u64) -> Result<u64> {
        let trace = self.trace.clone();
        self.module.bind_catch(move |_, _| {
            trace.push(name);
            Ok(continuation)
        })
    }

    /// A throw info for a single class `mangled` of `size` bytes destroyed by `~name`.
    pub fn class(&self, mangled: &str, name: &'static str, size: u32) -> Result<(u64, u64)> {
        let td = self.module.type_descriptor(mangled)?;
        let throw_info = ThrowInfoBuilder::new()
            .destructor(self.destructor(name)?)
            .catchable(CatchableTypeSpec::new(td, size))
            .build(&self.module)?;
        Ok((td, throw_info))
    }

    /// Frame offset of a catch parameter slot.
    ///
    /// i386 parameters live below the frame pointer, table-model parameters above the
    /// establisher frame.
    pub fn catch_slot(&self) -> i32 {
        match self.arch().dispatch_model() {
            DispatchModel::FrameList => -32,
            DispatchModel::Table => 48,
        }
    }

    pub fn read_ptr(&self, address: u64) -> u64 {
        self.runtime.space().read_ptr(address, self.arch()).unwrap()
    }
}
