fn main() {
    // Npcap ships its import libraries separately; only Windows needs the hints.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("windows") {
        // Tell cargo to look for libraries in the lib directory
        println!("cargo:rustc-link-search=native=lib");

        // Link against Npcap libraries
        println!("cargo:rustc-link-lib=wpcap");
        println!("cargo:rustc-link-lib=Packet");
    }

    // Rerun build script if any files in lib change
    println!("cargo:rerun-if-changed=lib");
}
