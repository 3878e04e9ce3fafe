use std::sync::LazyLock;

/// Build version reported by `--version` and logged at daemon start:
/// `{release}-{git sha}[-dirty]`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let dirty = option_env!("VERGEN_GIT_DIRTY") == Some("true");
    format!(
        "{}-{}{}",
        env!("PODGROUPD_RELEASE"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        if dirty { "-dirty" } else { "" }
    )
});
