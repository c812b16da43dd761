//! Interrupt handling: IDT construction and the ISR stubs it installs.
//!
//!   idt.rs      — 256-entry table, gate construction, `lidt`
//!   handlers.rs — asm entry stubs + the Rust-side dispatch they call

pub mod handlers;
pub mod idt;

/// Builds and loads the IDT. Must run once per system, before any CPU
/// enables interrupts.
pub fn init() {
    idt::init();
}
