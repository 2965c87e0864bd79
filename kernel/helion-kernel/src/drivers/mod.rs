//! Device drivers.

#[cfg(target_os = "none")]
pub mod fbcon;
pub mod font8x8;
pub mod uart16550;
pub mod xhci;
