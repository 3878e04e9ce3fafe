use std::env;

fn main() {
    if let Err(err) = emit_git_variables() {
        println!("cargo:warning=vergen: {err}");
    }

    let release = env::var("PODGROUPD_RELEASE")
        .unwrap_or_else(|_| env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "dev".to_string()));
    println!("cargo:rustc-env=PODGROUPD_RELEASE={release}");
    println!("cargo:rerun-if-env-changed=PODGROUPD_RELEASE");
}

/// Exposes the git sha and dirty flag as `VERGEN_GIT_*` variables.
fn emit_git_variables() -> anyhow::Result<()> {
    let git2 = vergen_git2::Git2Builder::default()
        .sha(true)
        .dirty(true)
        .build()?;

    vergen_git2::Emitter::default()
        .fail_on_error()
        .add_instructions(&git2)?
        .emit()
}
