//! Build script for clrshim-core
//!
//! - Minimum Rust version: `let ... else` and `is_some_and` need 1.70
//! - Warns on targets without a runtime startup backend, where
//!   registration can only fail with `E_NOTIMPL`

fn main()
{
    match rustc_version::version() {
        Ok(found) => {
            let minimum = rustc_version::Version::new(1, 70, 0);
            assert!(found >= minimum, "clrshim-core requires Rust {minimum} or newer, found {found}");
        }
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    println!("cargo:rerun-if-changed=build.rs");
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if !matches!(os.as_str(), "windows" | "linux") {
        println!("cargo:warning=no runtime startup backend for target os `{os}`; registration reports E_NOTIMPL");
    }
}
