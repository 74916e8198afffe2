//! Target architectures and their exception-dispatch conventions.
//!
//! The C++ exception ABI is implemented on four architectures that fall into two
//! families:
//!
//! - **Frame-list** (`I386`) - every function with exception state pushes a registration
//!   record onto a thread-local linked list, and keeps its current scope index in that
//!   record. All metadata references are absolute pointers.
//! - **Table** (`X86_64`, `Arm`, `Arm64`) - the OS unwinder locates frames from unwind
//!   tables, the current scope is recovered from an instruction-pointer map, and all
//!   metadata references are offsets relative to the owning module's image base.
//!
//! Everything above the dispatcher (metadata navigation, type matching, local unwind and
//! catch invocation) is shared; this module captures the facts that differ.

use strum::{Display, EnumCount, EnumIter, EnumString};

/// A target architecture of the emulated process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumCount, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Arch {
    /// 32-bit x86, frame-list based dispatch
    I386,
    /// 64-bit x86, table based dispatch
    #[strum(serialize = "x86_64")]
    X86_64,
    /// 32-bit ARM (Thumb-2), table based dispatch
    Arm,
    /// 64-bit ARM, table based dispatch
    Arm64,
}

/// How the OS locates the handler of an active frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum DispatchModel {
    /// A thread-local linked list of registration records
    FrameList,
    /// Unwind tables and an instruction-pointer-to-scope map
    Table,
}

impl Arch {
    /// Size of a native pointer in bytes.
    #[must_use]
    pub fn pointer_size(self) -> usize {
        match self {
            Arch::I386 | Arch::Arm => 4,
            Arch::X86_64 | Arch::Arm64 => 8,
        }
    }

    /// The dispatch family this architecture belongs to.
    #[must_use]
    pub fn dispatch_model(self) -> DispatchModel {
        match self {
            Arch::I386 => DispatchModel::FrameList,
            Arch::X86_64 | Arch::Arm | Arch::Arm64 => DispatchModel::Table,
        }
    }

    /// Returns `true` if metadata references are image-relative on this architecture.
    #[must_use]
    pub fn uses_image_relative_references(self) -> bool {
        self.dispatch_model() == DispatchModel::Table
    }

    /// Number of parameters a C++ exception record carries.
    ///
    /// Table-based architectures append the throwing module's image base.
    #[must_use]
    pub fn exception_parameter_count(self) -> usize {
        match self.dispatch_model() {
            DispatchModel::FrameList => 3,
            DispatchModel::Table => 4,
        }
    }

    /// Size of a catch-block descriptor in bytes.
    ///
    /// Table-based descriptors carry an extra frame-offset word.
    #[must_use]
    pub fn catch_block_size(self) -> usize {
        match self.dispatch_model() {
            DispatchModel::FrameList => 16,
            DispatchModel::Table => 20,
        }
    }

    /// Masks a raw value down to the architecture's pointer width.
    #[must_use]
    pub fn truncate(self, value: u64) -> u64 {
        match self.pointer_size() {
            4 => value & 0xFFFF_FFFF,
            _ => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_dispatch_families() {
        assert_eq!(Arch::I386.dispatch_model(), DispatchModel::FrameList);
        for arch in Arch::iter().filter(|a| *a != Arch::I386) {
            assert_eq!(arch.dispatch_model(), DispatchModel::Table);
            assert_eq!(arch.exception_parameter_count(), 4);
            assert!(arch.uses_image_relative_references());
        }
        assert_eq!(Arch::I386.exception_parameter_count(), 3);
    }

    #[test]
    fn test_names_round_trip() {
        assert_eq!(Arch::X86_64.to_string(), "x86_64");
        assert_eq!(Arch::from_str("arm64").unwrap(), Arch::Arm64);
        assert_eq!(Arch::from_str("i386").unwrap(), Arch::I386);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(Arch::I386.truncate(0x1_2345_6789), 0x2345_6789);
        assert_eq!(Arch::Arm64.truncate(0x1_2345_6789), 0x1_2345_6789);
    }
}
