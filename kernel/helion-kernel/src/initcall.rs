//! Staged init-call graph.
//!
//! Subsystems register initializer descriptors either statically, by placing
//! them into the `.helion_initcalls` linker section with [`initcall!`], or
//! dynamically via [`register`]. [`run_all`] executes every descriptor at
//! most once, in stage order `Early -> Core -> Subsys -> Driver -> Late`;
//! within a stage, collection order is preserved. Return codes are logged
//! but never abort the boot.

use crate::sync::SpinLock;

/// The five initialization stages, executed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum InitStage {
    /// Before interrupt controllers and timers.
    Early = 0,
    /// Core kernel services (timers, interrupt routing).
    Core = 1,
    /// Subsystems layered on core services (buses, filesystems).
    Subsys = 2,
    /// Device drivers.
    Driver = 3,
    /// Everything that wants a fully-initialized kernel.
    Late = 4,
}

impl InitStage {
    /// All stages, in execution order.
    pub const ALL: [InitStage; 5] = [
        Self::Early,
        Self::Core,
        Self::Subsys,
        Self::Driver,
        Self::Late,
    ];
}

/// An initializer descriptor.
///
/// `func` returns 0 on success; nonzero codes are logged and otherwise
/// ignored.
#[derive(Debug, Clone, Copy)]
pub struct InitCall {
    /// Stage in which this initializer runs.
    pub stage: InitStage,
    /// The initializer function.
    pub func: fn() -> i32,
    /// Name used in log output.
    pub name: &'static str,
}

/// Places a statically-registered init call into the linker section.
///
/// # Examples
///
/// ```ignore
/// fn probe_controllers() -> i32 { 0 }
/// initcall!(Driver, XHCI_PROBE, "xhci-probe", probe_controllers);
/// ```
#[macro_export]
macro_rules! initcall {
    ($stage:ident, $entry:ident, $name:literal, $func:path) => {
        helion_linkset::linkset_entry!(
            "helion_initcalls",
            $entry: $crate::initcall::InitCall = $crate::initcall::InitCall {
                stage: $crate::initcall::InitStage::$stage,
                func: $func,
                name: $name,
            }
        );
    };
}

/// Maximum number of descriptors the registry can hold (static + dynamic).
const MAX_INITCALLS: usize = 128;

/// Function pointers below this address cannot be kernel code. Descriptors
/// whose `func` fails the check are skipped rather than jumped into.
#[cfg(target_os = "none")]
const KERNEL_HALF_MIN: u64 = 0xFFFF_8000_0000_0000;
#[cfg(not(target_os = "none"))]
const KERNEL_HALF_MIN: u64 = 0;

/// Collected descriptors plus per-descriptor executed flags.
pub struct Registry {
    calls: [Option<InitCall>; MAX_INITCALLS],
    executed: [bool; MAX_INITCALLS],
    count: usize,
    collected_static: bool,
}

impl Registry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            calls: [None; MAX_INITCALLS],
            executed: [false; MAX_INITCALLS],
            count: 0,
            collected_static: false,
        }
    }

    /// Appends a descriptor. Returns `false` when the registry is full.
    pub fn register(&mut self, call: InitCall) -> bool {
        if self.count >= MAX_INITCALLS {
            return false;
        }
        self.calls[self.count] = Some(call);
        self.count += 1;
        true
    }

    /// Pulls in the statically-registered descriptors, once.
    fn collect_static(&mut self, static_calls: &[InitCall]) {
        if self.collected_static {
            return;
        }
        self.collected_static = true;
        for call in static_calls {
            if !self.register(*call) {
                crate::kwarn!("initcall: registry full, dropping '{}'", call.name);
            }
        }
    }

    /// Runs every not-yet-executed descriptor in stage order.
    ///
    /// Returns the number of descriptors executed this invocation.
    pub fn run_all(&mut self, static_calls: &[InitCall]) -> usize {
        self.collect_static(static_calls);

        let mut executed = 0;
        for stage in InitStage::ALL {
            for i in 0..self.count {
                let Some(call) = self.calls[i] else { continue };
                if call.stage != stage || self.executed[i] {
                    continue;
                }
                self.executed[i] = true;

                let fn_addr = call.func as usize as u64;
                if fn_addr < KERNEL_HALF_MIN {
                    crate::kwarn!(
                        "initcall: '{}' skipped, function at {:#x} outside the kernel half",
                        call.name,
                        fn_addr
                    );
                    continue;
                }

                let rc = (call.func)();
                if rc == 0 {
                    crate::kdebug!("initcall[{:?}]: '{}' ok", stage, call.name);
                } else {
                    crate::kwarn!("initcall[{:?}]: '{}' returned {}", stage, call.name, rc);
                }
                executed += 1;
            }
        }
        executed
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global init-call registry.
static REGISTRY: SpinLock<Registry> = SpinLock::new(Registry::new());

#[cfg(target_os = "none")]
helion_linkset::declare_linkset! {
    /// Returns the descriptors placed into the linker section.
    fn static_initcalls() -> [InitCall],
    section = "helion_initcalls"
}

#[cfg(not(target_os = "none"))]
fn static_initcalls() -> &'static [InitCall] {
    &[]
}

/// Appends a descriptor to the dynamic registry.
///
/// Returns `false` when the registry is full.
pub fn register(stage: InitStage, func: fn() -> i32, name: &'static str) -> bool {
    REGISTRY.lock().register(InitCall { stage, func, name })
}

/// Executes all pending init calls. Safe to call repeatedly; descriptors run
/// at most once.
pub fn run_all() -> usize {
    REGISTRY.lock().run_all(static_initcalls())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ORDER: SpinLock<Vec<&'static str>> = SpinLock::new(Vec::new());

    fn record(name: &'static str) -> i32 {
        ORDER.lock().push(name);
        0
    }

    fn early() -> i32 {
        record("early")
    }
    fn core_a() -> i32 {
        record("core_a")
    }
    fn core_b() -> i32 {
        record("core_b")
    }
    fn late() -> i32 {
        record("late")
    }

    #[test]
    fn runs_in_stage_order_then_collection_order() {
        ORDER.lock().clear();
        let mut registry = Registry::new();
        // Registered out of stage order on purpose.
        registry.register(InitCall {
            stage: InitStage::Late,
            func: late,
            name: "late",
        });
        registry.register(InitCall {
            stage: InitStage::Core,
            func: core_a,
            name: "core_a",
        });
        registry.register(InitCall {
            stage: InitStage::Early,
            func: early,
            name: "early",
        });
        registry.register(InitCall {
            stage: InitStage::Core,
            func: core_b,
            name: "core_b",
        });

        assert_eq!(registry.run_all(&[]), 4);
        assert_eq!(*ORDER.lock(), vec!["early", "core_a", "core_b", "late"]);
    }

    #[test]
    fn second_run_executes_nothing() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn counting() -> i32 {
            CALLS.fetch_add(1, Ordering::SeqCst);
            0
        }

        let mut registry = Registry::new();
        registry.register(InitCall {
            stage: InitStage::Subsys,
            func: counting,
            name: "counting",
        });

        assert_eq!(registry.run_all(&[]), 1);
        assert_eq!(registry.run_all(&[]), 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_does_not_abort_later_calls() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn failing() -> i32 {
            CALLS.fetch_add(1, Ordering::SeqCst);
            -5
        }
        fn counting() -> i32 {
            CALLS.fetch_add(1, Ordering::SeqCst);
            0
        }

        let mut registry = Registry::new();
        registry.register(InitCall {
            stage: InitStage::Driver,
            func: failing,
            name: "failing",
        });
        registry.register(InitCall {
            stage: InitStage::Driver,
            func: counting,
            name: "counting",
        });

        assert_eq!(registry.run_all(&[]), 2);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn static_descriptors_collect_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn counting() -> i32 {
            CALLS.fetch_add(1, Ordering::SeqCst);
            0
        }

        let statics = [InitCall {
            stage: InitStage::Early,
            func: counting,
            name: "static",
        }];
        let mut registry = Registry::new();
        assert_eq!(registry.run_all(&statics), 1);
        // Static list offered again; must not re-collect or re-run.
        assert_eq!(registry.run_all(&statics), 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_capacity_bounded() {
        fn nop() -> i32 {
            0
        }
        let mut registry = Registry::new();
        for _ in 0..MAX_INITCALLS {
            assert!(registry.register(InitCall {
                stage: InitStage::Late,
                func: nop,
                name: "filler",
            }));
        }
        assert!(!registry.register(InitCall {
            stage: InitStage::Late,
            func: nop,
            name: "overflow",
        }));
    }
}
