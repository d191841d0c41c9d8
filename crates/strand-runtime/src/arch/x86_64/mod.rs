//! x86_64 context switching implementation
//!
//! Uses inline assembly for context switch.
//! Stable in Rust 1.88+ via `naked_asm!`.
//!
//! Only the System V callee-saved registers plus the stack pointer and the
//! resume address are kept; a fiber only loses the CPU at a call site, so
//! caller-saved registers are already dead.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved execution point: stack pointer, resume address and callee-saved
/// registers. Field offsets are hardcoded in the assembly below.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the current point into `save`, then resume `load`.
///
/// The switch/boot call that captured `load` returns `status`. This call
/// returns whatever status is carried by the switch that eventually
/// resumes `save`.
///
/// # Safety
///
/// `save` must point to writable `Context` memory; `load` must hold a
/// context captured by one of the save operations and not resumed since.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    _save: *mut Context,
    _load: *const Context,
    _status: i32,
) -> i32 {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rcx, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // The carried status becomes the resumed call's return value
        "mov eax, edx",
        "jmp rcx",
        // Return point for the saved context
        "2:",
        "ret",
    );
}

/// Resume `load` without saving the current point.
///
/// # Safety
///
/// As for `switch_context`; the current stack is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn jump_context(_load: *const Context, _status: i32) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rcx, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov rbp, [rdi + 0x18]",
        "mov r12, [rdi + 0x20]",
        "mov r13, [rdi + 0x28]",
        "mov r14, [rdi + 0x30]",
        "mov r15, [rdi + 0x38]",
        "mov eax, esi",
        "jmp rcx",
    );
}

/// Save the current point into `save`, then call `entry(arg)` on a fresh
/// stack whose top is `stack_top`.
///
/// The stack is aligned down to 16 bytes per the System V AMD64 ABI.
/// `entry` must not return; a trap instruction follows the call.
///
/// # Safety
///
/// `stack_top` must be the high end of a mapped region large enough for
/// `entry`'s frames.
#[unsafe(naked)]
pub unsafe extern "C" fn boot_context(
    _save: *mut Context,
    _stack_top: *mut u8,
    _entry: EntryFn,
    _arg: usize,
) -> i32 {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Pivot to the new stack and call entry(arg)
        "and rsi, -16",
        "mov rsp, rsi",
        "xor ebp, ebp",
        "mov rdi, rcx",
        "call rdx",
        "ud2",
        "2:",
        "ret",
    );
}

/// Call `entry(arg)` on a fresh stack without saving the current point.
///
/// # Safety
///
/// As for `boot_context`; the current stack is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn boot_jump_context(
    _stack_top: *mut u8,
    _entry: EntryFn,
    _arg: usize,
) -> ! {
    naked_asm!(
        "and rdi, -16",
        "mov rsp, rdi",
        "xor ebp, ebp",
        "mov rax, rsi",
        "mov rdi, rdx",
        "call rax",
        "ud2",
    );
}
