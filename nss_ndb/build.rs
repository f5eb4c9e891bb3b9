use std::env;

fn main() {
    println!("cargo:rerun-if-changed=csrc/nsdispatch.c");

    // nsdispatch(3) hands module methods a va_list, so the method table is
    // written in C and forwards to the typed entry points.
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "freebsd" || target_os == "dragonfly" {
        cc::Build::new()
            .file("csrc/nsdispatch.c")
            .warnings(true)
            .compile("ndb_nsdispatch");
    }
}
