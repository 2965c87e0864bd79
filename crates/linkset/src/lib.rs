//! Safe wrappers for linker-section-based data.
//!
//! Initializer descriptors and driver registrations are collected into
//! dedicated linker sections at build time and walked at boot. This crate
//! encapsulates the unsafe patterns behind two declarative macros:
//!
//! - [`declare_linkset!`] — declares a function that returns a typed
//!   `&'static [T]` from a linker section bounded by `__<section>_start` /
//!   `__<section>_end` symbols.
//! - [`linkset_entry!`] — places a typed static into the matching section.
//!
//! The linker script must define the boundary symbols, e.g.:
//!
//! ```text
//! .helion_initcalls : {
//!     __helion_initcalls_start = .;
//!     KEEP(*(.helion_initcalls))
//!     __helion_initcalls_end = .;
//! }
//! ```

#![no_std]
#![warn(missing_docs)]

/// Declares a function that returns a typed slice from a linker section.
///
/// # Examples
///
/// ```ignore
/// helion_linkset::declare_linkset! {
///     /// Returns all statically registered init-call descriptors.
///     pub fn static_initcalls() -> [InitCall],
///     section = "helion_initcalls"
/// }
/// ```
#[macro_export]
macro_rules! declare_linkset {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident() -> [$ty:ty],
        section = $section:literal
    ) => {
        $(#[$meta])*
        $vis fn $name() -> &'static [$ty] {
            unsafe extern "C" {
                #[link_name = concat!("__", $section, "_start")]
                static LINKSET_START: u8;
                #[link_name = concat!("__", $section, "_end")]
                static LINKSET_END: u8;
            }

            // SAFETY: The linker script defines these symbols at the
            // boundaries of the named section, which contains only `T` values
            // placed by `linkset_entry!`. The symbols remain valid for the
            // lifetime of the kernel image.
            unsafe {
                let start = ::core::ptr::addr_of!(LINKSET_START).cast::<$ty>();
                let end = ::core::ptr::addr_of!(LINKSET_END).cast::<$ty>();
                let count = end.offset_from(start) as usize;
                if count == 0 {
                    return &[];
                }
                ::core::slice::from_raw_parts(start, count)
            }
        }
    };
}

/// Places a typed static into the named linker section.
///
/// # Examples
///
/// ```ignore
/// helion_linkset::linkset_entry!("helion_initcalls",
///     PMM_SELFTEST: InitCall = InitCall { ... }
/// );
/// ```
#[macro_export]
macro_rules! linkset_entry {
    ($section:literal, $name:ident : $ty:ty = $expr:expr) => {
        #[used]
        #[unsafe(link_section = concat!(".", $section))]
        static $name: $ty = $expr;
    };
}
