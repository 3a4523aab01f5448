fn main() {
    feature_conflicts();

    let version = get_version();
    println!("cargo:rustc-env=VERSION={}", version);

    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_HTTP_SERVER");
    println!("cargo:rerun-if-changed=build.rs");
}

fn feature_conflicts() {
    let tls_rustls = cfg!(feature = "tls-rustls");
    let tls_native = cfg!(feature = "tls-native");

    if tls_rustls && tls_native {
        panic!("Cannot enable both 'tls-rustls' and 'tls-native' features simultaneously. Choose one.");
    }
    if !tls_rustls && !tls_native {
        println!("cargo:warning=No TLS backend selected, webhooks will only reach plain HTTP targets.");
    }
}

fn get_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    if cfg!(feature = "http-server") {
        format!("{}+http", version)
    } else {
        version.to_string()
    }
}
