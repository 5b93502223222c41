pub fn ssod_version() -> &'static str {
    // See build.rs
    env!("SSOD_CI_TAG")
}

pub fn ssod_target_triple() -> &'static str {
    // See build.rs
    env!("SSOD_TARGET_TRIPLE")
}
