use std::env;
use std::fs::File;
use std::io::Write;

const ALLOCSITES_BASE_VAR: &str = "ALLOCSCC_DEFAULT_ALLOCSITES_BASE";

fn main() {
    let out = format!("{}/build_info.rs", env::var("OUT_DIR").unwrap());

    let target = env::var("TARGET").unwrap();
    let host = env::var("HOST").unwrap();
    // packagers may relocate the metadata tree; the runtime default is baked in here
    let allocsites_base =
        env::var(ALLOCSITES_BASE_VAR).unwrap_or_else(|_| String::from("/usr/lib/allocsites"));

    let mut file = File::create(out).unwrap();
    writeln!(file, "pub const TARGET: &str = {:?};", target).unwrap();
    writeln!(file, "pub const HOST: &str = {:?};", host).unwrap();
    writeln!(
        file,
        "pub const DEFAULT_ALLOCSITES_BASE: &str = {:?};",
        allocsites_base
    )
    .unwrap();

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed={}", ALLOCSITES_BASE_VAR);
}
