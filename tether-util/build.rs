//! Compile time configurations for the util crate
fn main() {
    // TETHER_PKG_NAME names the folders under `~/.config` and `~/.local/state`
    // where registration records are kept. Renaming it orphans any identity a
    // device already obtained.
    println!("cargo::rustc-env=TETHER_PKG_NAME=tether");
}
