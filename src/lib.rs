//! tinyk - the process, thread and IPC core of a small cooperative kernel
//!
//! Design principles:
//! - Tractable: one coarse "kernel lock" supplied by cooperative scheduling
//! - Threads only suspend on condition variables, never anywhere else
//! - Control blocks are owned by exactly one table; sharing goes through
//!   explicit reference counts or `Rc`
//!
//! Runs natively (tests, tools) and on wasm32 (browser console logging).

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod kernel;

pub use kernel::{BootReport, Kernel, KernelConfig, Sys, Task};

/// Install the panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
