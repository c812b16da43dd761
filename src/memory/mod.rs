//! Memory subsystem.
//!
//!   address.rs — PhysAddr/VirtAddr newtypes (type safety for addresses)
//!   pmm.rs      — Physical Memory Manager (stack-based frame allocator)
//!   vmm.rs      — Virtual Memory Manager (2-level IA-32 paging)
//!   heap.rs     — Kernel heap allocator (Box, Vec, etc.)

pub mod address;
pub mod heap;
pub mod pmm;
pub mod vmm;
