//! Compiles the tiny helper binary the `#[ignore]`d live-ptrace tests
//! (`tests/roundtrip.rs`) spawn and attach to, mirroring the teacher's own
//! `build.rs`-generated test fixtures. Best-effort: if no C toolchain is
//! available, the ignored tests simply have nothing to exec and stay skipped.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=tests/fixtures/target.c");

    let compiler = cc::Build::new().opt_level(0).get_compiler();
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_bin = out_dir.join("upatch_test_target");

    let mut cmd = compiler.to_command();
    cmd.arg("tests/fixtures/target.c")
        .arg("-O0")
        .arg("-fno-pie")
        .arg("-no-pie")
        .arg("-o")
        .arg(&out_bin);
    let _ = cmd.status();

    println!(
        "cargo:rustc-env=UPATCH_TEST_TARGET={}",
        out_bin.display()
    );
}
