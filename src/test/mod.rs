//! Fixtures shared by the unit tests.

use std::sync::Arc;

use crate::{
    arch::Arch,
    config::RuntimeConfig,
    metadata::{
        CatchableTypeSpec, ImageWriter, Layout, MetadataContext, ThrowInfoBuilder, TypeDescriptor,
        TypeQualifiers,
    },
    runtime::{Module, Runtime},
};

/// A runtime with one loaded module to emit metadata into.
pub(crate) struct TestImage {
    pub runtime: Arc<Runtime>,
    pub module: Module,
}

impl TestImage {
    pub fn new(arch: Arch) -> Self {
        let runtime = Runtime::new(RuntimeConfig::for_arch(arch)).unwrap();
        let module = runtime.load_module("test.dll").unwrap();
        TestImage { runtime, module }
    }

    /// Navigation context for metadata emitted into the module.
    pub fn ctx(&self) -> MetadataContext<'_> {
        MetadataContext::new(
            self.runtime.space(),
            self.runtime.arch(),
            self.module.addressing(),
        )
    }

    /// Navigation context of a record thrown from the module.
    pub fn throw_ctx(&self) -> MetadataContext<'_> {
        self.ctx().with_addressing(self.module.addressing())
    }

    /// Emits a throw info whose catchable types are `names`, most-derived first.
    ///
    /// Returns the throw info and the type descriptors in the same order.
    pub fn hierarchy(&self, names: &[&str], qualifiers: TypeQualifiers) -> (u64, Vec<u64>) {
        let types: Vec<u64> = names
            .iter()
            .map(|name| self.type_descriptor(name))
            .collect();

        let builder = types.iter().fold(
            ThrowInfoBuilder::new().qualifiers(qualifiers),
            |builder, td| builder.catchable(CatchableTypeSpec::new(*td, 8)),
        );
        (builder.build(&self.module).unwrap(), types)
    }

    pub fn type_descriptor(&self, mangled: &str) -> u64 {
        self.module.type_descriptor(mangled).unwrap()
    }

    pub fn read_type(&self, address: u64) -> TypeDescriptor {
        TypeDescriptor::read(&self.ctx(), address).unwrap()
    }
}
