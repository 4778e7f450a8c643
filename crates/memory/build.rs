use std::env;
use std::io::Write;
use std::process::{Command, Stdio};

/// Some x86_64 toolchains ship a `stdarch` build without `clflushopt`
/// support (neither the intrinsic nor the target feature are known to
/// the compiler). Probe for it at build time so `fence.rs` can fall
/// back to plain `clflush` instead of failing to compile.
fn main() {
    println!("cargo::rustc-check-cfg=cfg(has_clflushopt)");

    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let probe = r#"
        #[target_feature(enable = "clflushopt")]
        unsafe fn f(p: *const u8) { unsafe { std::arch::x86_64::_mm_clflushopt(p) }; }
        fn main() {
            let _ = std::arch::is_x86_feature_detected!("clflushopt");
        }
    "#;

    let supported = Command::new(&rustc)
        .args(["--edition", "2024", "--crate-type", "bin", "-o", "/dev/null", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .and_then(|mut child| {
            child
                .stdin
                .take()
                .unwrap()
                .write_all(probe.as_bytes())?;
            child.wait()
        })
        .map(|status| status.success())
        .unwrap_or(false);

    if supported {
        println!("cargo::rustc-cfg=has_clflushopt");
    }
}
