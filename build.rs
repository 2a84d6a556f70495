//! Build script for chainward
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! and lets packagers bake in a default firewall tool path.

fn main() {
    // Re-run build if the packager override changes
    println!("cargo:rerun-if-env-changed=CHAINWARD_SYSTEM_IPTABLES_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
