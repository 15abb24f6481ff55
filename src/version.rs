//! Build version information, printed by `--version`.

use serde::Serialize;

/// Version of the running binary.
///
/// The `git` and `buildDate` fields are stamped at build time through the
/// `GIT_COMMIT` and `BUILD_DATE` environment variables; unset values fall
/// back to placeholders so a plain `cargo build` still produces output.
#[derive(Clone, Debug, Serialize)]
pub struct Version {
    /// Git commit the binary was built from
    pub git: String,
    /// Semantic version of the main package
    pub main: String,
    /// Timestamp of the build
    #[serde(rename = "buildDate")]
    pub build_date: String,
}

impl Version {
    /// Returns the version of the running binary
    pub fn get() -> Self {
        Self {
            git: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            main: env!("CARGO_PKG_VERSION").to_string(),
            build_date: option_env!("BUILD_DATE").unwrap_or("unknown").to_string(),
        }
    }
}
