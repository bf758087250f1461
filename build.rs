use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=Info.plist");

    // CoreBluetooth only reports advertisements to binaries that carry an
    // Info.plist with NSBluetoothAlwaysUsageDescription.  Neither binary is
    // an app bundle, so the plist goes into the __TEXT,__info_plist section.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }

    let plist = PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").unwrap_or_default())
        .join("Info.plist");
    for arg in ["-sectcreate", "__TEXT", "__info_plist"] {
        println!("cargo:rustc-link-arg={arg}");
    }
    println!("cargo:rustc-link-arg={}", plist.display());
}
