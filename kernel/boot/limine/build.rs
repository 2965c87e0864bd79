//! Wires the kernel linker script into the boot stub link.

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let workspace_root = std::path::Path::new(&manifest_dir)
        .parent()
        .unwrap() // boot/
        .parent()
        .unwrap() // kernel/
        .parent()
        .unwrap(); // workspace root

    let target = std::env::var("TARGET").unwrap_or_default();
    if !target.starts_with("x86_64") {
        return;
    }

    let script_path = workspace_root
        .join("targets")
        .join("x86_64-unknown-helion.ld");
    println!("cargo:rustc-link-arg-bins=-T{}", script_path.display());
    println!("cargo:rerun-if-changed={}", script_path.display());
}
