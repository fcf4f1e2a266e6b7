pub mod shutdown;
pub mod wait;

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// Touch the readiness file probed by the container's readiness check.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const CREATED_BY: &str = "db.coral.io/created-by";
    pub const SPEC_HASH: &str = "db.coral.io/spec-hash";
}
