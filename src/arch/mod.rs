//! IA-32 architecture layer: everything that talks directly to the CPU
//! or boot-time firmware state.
//!
//!   boot.rs   — Multiboot entry stub, transfers control into Rust
//!   cpu.rs    — port I/O, MSRs, interrupt flag, CPUID-derived identity
//!   gdt.rs    — flat GDT + per-CPU TSS
//!   mbi.rs    — Multiboot Information struct, deep-copied off the boot stack
//!   pit.rs    — programmable interval timer, drives the tick counter
//!   serial.rs — 16550 UART, backs the kernel log
//!   smp.rs    — AP bring-up and inter-processor interrupts
//!   syscall.rs — int 0x64 syscall ABI

pub mod boot;
pub mod cpu;
pub mod gdt;
pub mod mbi;
pub mod pit;
pub mod serial;
pub mod smp;
pub mod syscall;
