//! Register state, non-local control transfer and jump buffer layouts.
//!
//! Emulated code is Rust closures running on the host stack, so a transfer of control to
//! an older frame (a committed catch resuming its function, a long jump) cannot simply
//! load registers. Instead it travels up the host stack as an [`Escape::Transfer`]
//! carrying the register state to install. The body whose entry stack pointer equals the
//! target's stack pointer intercepts it and re-enters itself with the target address.
//!
//! The [`ControlTransfer`] implementations capture that register state into a `setjmp`
//! buffer with the exact layout of each architecture, and read it back for `longjmp`.

use crate::{arch::Arch, memory::AddressSpace, Error, Result};

/// Number of callee-saved general purpose registers tracked per thread.
pub const CALLEE_SAVED: usize = 10;

/// The register state of an emulated thread that survives a non-local transfer.
///
/// Only the registers the exception ABI cares about are modelled: the instruction,
/// stack and frame pointers and the callee-saved set. The callee-saved registers map
/// to the architecture's set in buffer order: `ebx, edi, esi` on i386,
/// `rbx, rsi, rdi, r12-r15` on x86-64, `r4-r10` on ARM and `x19-x28` on ARM64.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    /// Instruction pointer (link register for the ARM64 buffer)
    pub ip: u64,
    /// Stack pointer
    pub sp: u64,
    /// Frame pointer (`ebp`, `rbp`, `r11`, `x29`)
    pub fp: u64,
    /// Callee-saved registers
    pub callee_saved: [u64; CALLEE_SAVED],
}

/// A non-local transfer of control to an older frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// Register state to install at the target
    pub registers: Registers,
    /// Value delivered to the target (the `setjmp` return value for long jumps)
    pub value: u64,
}

/// Why emulated code left its caller without returning normally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Escape {
    /// Control continues in an older frame.
    Transfer(Transfer),
    /// The emulated process faulted or was terminated.
    Fault(Error),
}

impl Escape {
    /// Returns the error of a fault.
    #[must_use]
    pub fn fault(&self) -> Option<&Error> {
        match self {
            Escape::Fault(error) => Some(error),
            Escape::Transfer(_) => None,
        }
    }

    /// Returns `true` if the escape ends the emulated process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fault().is_some_and(Error::is_fatal)
    }
}

impl From<Error> for Escape {
    fn from(error: Error) -> Self {
        Escape::Fault(error)
    }
}

/// The outcome of emulated code: a value, or an escape to an older frame.
pub type Flow<T> = std::result::Result<T, Escape>;

/// The disposition of a frame handler that did not transfer control.
///
/// A frame handler either commits to a catch, which never returns (it escapes with a
/// transfer), or declines and lets the dispatcher continue with the next frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContinueSearch;

/// Everything a `setjmp` buffer records besides the registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JumpContext {
    /// Register state at the `setjmp` call
    pub registers: Registers,
    /// Registration record (frame list) or establisher frame (table) at the `setjmp` call
    pub frame: u64,
    /// Scope index of the `setjmp` caller (frame list)
    pub try_level: i32,
    /// Local unwind routine for the `setjmp` caller, or zero (frame list)
    pub unwind_func: u64,
    /// First unwind data word: the caller's function descriptor (frame list)
    pub unwind_data: u64,
    /// Whether the buffer carries the extended-layout cookie (frame list)
    pub cookie: bool,
}

/// Cookie marking an extended i386 jump buffer (`"VC20"`).
pub const JUMP_COOKIE: u32 = 0x5643_3230;

/// Architecture-specific register capture and restore for non-local transfers.
pub trait ControlTransfer: Send + Sync {
    /// The architecture this implementation serves.
    fn arch(&self) -> Arch;

    /// Size of the architecture's jump buffer in bytes.
    fn buffer_size(&self) -> usize;

    /// Writes `context` into the jump buffer at `buffer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not writable.
    fn capture_context(&self, space: &AddressSpace, buffer: u64, context: &JumpContext) -> Result<()>;

    /// Reads the jump buffer at `buffer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not readable.
    fn restore_context(&self, space: &AddressSpace, buffer: u64) -> Result<JumpContext>;

    /// Builds the escape that installs `registers` and delivers `value`.
    fn transfer(&self, registers: Registers, value: u64) -> Escape {
        Escape::Transfer(Transfer {
            registers: Registers {
                ip: self.arch().truncate(registers.ip),
                sp: self.arch().truncate(registers.sp),
                fp: self.arch().truncate(registers.fp),
                ..registers
            },
            value,
        })
    }
}

/// i386 `_JUMP_BUFFER`.
///
/// | Offset | Field |
/// |--------|-------|
/// | 0 | Ebp |
/// | 4 | Ebx |
/// | 8 | Edi |
/// | 12 | Esi |
/// | 16 | Esp |
/// | 20 | Eip |
/// | 24 | Registration |
/// | 28 | TryLevel |
/// | 32 | Cookie |
/// | 36 | UnwindFunc |
/// | 40 | UnwindData\[6\] |
pub struct I386Context;

impl ControlTransfer for I386Context {
    fn arch(&self) -> Arch {
        Arch::I386
    }

    fn buffer_size(&self) -> usize {
        64
    }

    fn capture_context(&self, space: &AddressSpace, buffer: u64, context: &JumpContext) -> Result<()> {
        let registers = &context.registers;
        space.fill(buffer, 0, self.buffer_size())?;
        space.write_u32(buffer, registers.fp as u32)?;
        for (index, value) in registers.callee_saved[..3].iter().enumerate() {
            space.write_u32(buffer + 4 + 4 * index as u64, *value as u32)?;
        }
        space.write_u32(buffer + 16, registers.sp as u32)?;
        space.write_u32(buffer + 20, registers.ip as u32)?;
        space.write_u32(buffer + 24, context.frame as u32)?;
        space.write_i32(buffer + 28, context.try_level)?;
        space.write_u32(buffer + 32, JUMP_COOKIE)?;
        space.write_u32(buffer + 36, context.unwind_func as u32)?;
        space.write_u32(buffer + 40, context.unwind_data as u32)?;
        Ok(())
    }

    fn restore_context(&self, space: &AddressSpace, buffer: u64) -> Result<JumpContext> {
        let mut registers = Registers {
            fp: u64::from(space.read_u32(buffer)?),
            sp: u64::from(space.read_u32(buffer + 16)?),
            ip: u64::from(space.read_u32(buffer + 20)?),
            ..Registers::default()
        };
        for index in 0..3 {
            registers.callee_saved[index] = u64::from(space.read_u32(buffer + 4 + 4 * index as u64)?);
        }

        Ok(JumpContext {
            registers,
            frame: u64::from(space.read_u32(buffer + 24)?),
            try_level: space.read_i32(buffer + 28)?,
            unwind_func: u64::from(space.read_u32(buffer + 36)?),
            unwind_data: u64::from(space.read_u32(buffer + 40)?),
            cookie: space.read_u32(buffer + 32)? == JUMP_COOKIE,
        })
    }
}

/// x86-64 `_JUMP_BUFFER`.
///
/// `Frame, Rbx, Rsp, Rbp, Rsi, Rdi, R12-R15, Rip` as quadwords, then `MxCsr` (u32),
/// `FpCsr` (u16), `Spare` (u16) and `Xmm6-Xmm15` (16 bytes each).
pub struct X64Context;

const X64_MXCSR_DEFAULT: u32 = 0x1F80;
const X64_FPCSR_DEFAULT: u16 = 0x027F;

impl X64Context {
    // Buffer slot of each callee-saved register: rbx, rsi, rdi, r12-r15
    const SLOTS: [u64; 7] = [8, 32, 40, 48, 56, 64, 72];
}

impl ControlTransfer for X64Context {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn buffer_size(&self) -> usize {
        256
    }

    fn capture_context(&self, space: &AddressSpace, buffer: u64, context: &JumpContext) -> Result<()> {
        let registers = &context.registers;
        space.fill(buffer, 0, self.buffer_size())?;
        space.write_u64(buffer, context.frame)?;
        space.write_u64(buffer + 16, registers.sp)?;
        space.write_u64(buffer + 24, registers.fp)?;
        for (slot, value) in Self::SLOTS.iter().zip(&registers.callee_saved) {
            space.write_u64(buffer + slot, *value)?;
        }
        space.write_u64(buffer + 80, registers.ip)?;
        space.write_u32(buffer + 88, X64_MXCSR_DEFAULT)?;
        space.write_u16(buffer + 92, X64_FPCSR_DEFAULT)?;
        Ok(())
    }

    fn restore_context(&self, space: &AddressSpace, buffer: u64) -> Result<JumpContext> {
        let mut registers = Registers {
            sp: space.read_u64(buffer + 16)?,
            fp: space.read_u64(buffer + 24)?,
            ip: space.read_u64(buffer + 80)?,
            ..Registers::default()
        };
        for (index, slot) in Self::SLOTS.iter().enumerate() {
            registers.callee_saved[index] = space.read_u64(buffer + slot)?;
        }

        Ok(JumpContext {
            registers,
            frame: space.read_u64(buffer)?,
            ..JumpContext::default()
        })
    }
}

/// ARM `_JUMP_BUFFER`.
///
/// `Frame, R4-R10, R11, Sp, Pc, Fpscr` as words, then `D8-D15` at offset 48.
pub struct ArmContext;

impl ControlTransfer for ArmContext {
    fn arch(&self) -> Arch {
        Arch::Arm
    }

    fn buffer_size(&self) -> usize {
        112
    }

    fn capture_context(&self, space: &AddressSpace, buffer: u64, context: &JumpContext) -> Result<()> {
        let registers = &context.registers;
        space.fill(buffer, 0, self.buffer_size())?;
        space.write_u32(buffer, context.frame as u32)?;
        for (index, value) in registers.callee_saved[..7].iter().enumerate() {
            space.write_u32(buffer + 4 + 4 * index as u64, *value as u32)?;
        }
        space.write_u32(buffer + 32, registers.fp as u32)?;
        space.write_u32(buffer + 36, registers.sp as u32)?;
        space.write_u32(buffer + 40, registers.ip as u32)?;
        Ok(())
    }

    fn restore_context(&self, space: &AddressSpace, buffer: u64) -> Result<JumpContext> {
        let mut registers = Registers {
            fp: u64::from(space.read_u32(buffer + 32)?),
            sp: u64::from(space.read_u32(buffer + 36)?),
            ip: u64::from(space.read_u32(buffer + 40)?),
            ..Registers::default()
        };
        for index in 0..7 {
            registers.callee_saved[index] = u64::from(space.read_u32(buffer + 4 + 4 * index as u64)?);
        }

        Ok(JumpContext {
            registers,
            frame: u64::from(space.read_u32(buffer)?),
            ..JumpContext::default()
        })
    }
}

/// ARM64 `_JUMP_BUFFER`.
///
/// `Frame, Reserved, X19-X28, Fp, Lr, Sp` as quadwords, `Fpcr` and `Fpsr` as words,
/// then `D8-D15` at offset 128.
pub struct Arm64Context;

impl ControlTransfer for Arm64Context {
    fn arch(&self) -> Arch {
        Arch::Arm64
    }

    fn buffer_size(&self) -> usize {
        192
    }

    fn capture_context(&self, space: &AddressSpace, buffer: u64, context: &JumpContext) -> Result<()> {
        let registers = &context.registers;
        space.fill(buffer, 0, self.buffer_size())?;
        space.write_u64(buffer, context.frame)?;
        for (index, value) in registers.callee_saved.iter().enumerate() {
            space.write_u64(buffer + 16 + 8 * index as u64, *value)?;
        }
        space.write_u64(buffer + 96, registers.fp)?;
        space.write_u64(buffer + 104, registers.ip)?;
        space.write_u64(buffer + 112, registers.sp)?;
        Ok(())
    }

    fn restore_context(&self, space: &AddressSpace, buffer: u64) -> Result<JumpContext> {
        let mut registers = Registers {
            fp: space.read_u64(buffer + 96)?,
            ip: space.read_u64(buffer + 104)?,
            sp: space.read_u64(buffer + 112)?,
            ..Registers::default()
        };
        for index in 0..registers.callee_saved.len() {
            registers.callee_saved[index] = space.read_u64(buffer + 16 + 8 * index as u64)?;
        }

        Ok(JumpContext {
            registers,
            frame: space.read_u64(buffer)?,
            ..JumpContext::default()
        })
    }
}

/// Returns the control transfer implementation of `arch`.
#[must_use]
pub fn control_transfer(arch: Arch) -> &'static dyn ControlTransfer {
    match arch {
        Arch::I386 => &I386Context,
        Arch::X86_64 => &X64Context,
        Arch::Arm => &ArmContext,
        Arch::Arm64 => &Arm64Context,
    }
}
