//! Build step: compile the node, client, and accelerator programs once,
//! before anything is spawned, and locate the resulting binaries.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::CommandSpec;
use crate::runner::{BoundRunner, RunError, RunOptions};

/// Log name the build output is written under.
pub const BUILD_LOG: &str = "build";

/// Which cargo profile to build and run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    Debug,
    #[default]
    Release,
}

impl BuildProfile {
    /// Subdirectory of the cargo target directory holding this profile.
    pub fn dir_name(self) -> &'static str {
        match self {
            BuildProfile::Debug => "debug",
            BuildProfile::Release => "release",
        }
    }
}

impl fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// File names of the programs the cluster runs. An absolute path is used
/// as-is instead of being looked up in the target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BinaryNames {
    pub node: String,
    pub client: String,
    pub accelerator: String,
}

impl Default for BinaryNames {
    fn default() -> Self {
        Self {
            node: "node".to_string(),
            client: "client".to_string(),
            accelerator: "accelerator".to_string(),
        }
    }
}

/// Resolved paths to the programs the cluster runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub node: PathBuf,
    pub client: PathBuf,
    pub accelerator: PathBuf,
}

impl Binaries {
    /// Paths of `names` under `<target_dir>/<profile>/`.
    pub fn locate(target_dir: &Path, profile: BuildProfile, names: &BinaryNames) -> Self {
        let dir = target_dir.join(profile.dir_name());
        Self {
            node: dir.join(&names.node),
            client: dir.join(&names.client),
            accelerator: dir.join(&names.accelerator),
        }
    }
}

/// Target directory for `project_dir`, honouring `CARGO_TARGET_DIR`.
pub fn target_dir(project_dir: &Path) -> PathBuf {
    match std::env::var_os("CARGO_TARGET_DIR") {
        Some(dir) if !dir.is_empty() => {
            let dir = PathBuf::from(dir);
            if dir.is_absolute() {
                dir
            } else {
                project_dir.join(dir)
            }
        }
        _ => project_dir.join("target"),
    }
}

/// `cargo build` for `profile` in `project_dir`.
pub fn build_command(project_dir: &Path, profile: BuildProfile) -> CommandSpec {
    let cmd = CommandSpec::new("cargo")
        .arg("build")
        .current_dir(project_dir);
    match profile {
        BuildProfile::Debug => cmd,
        BuildProfile::Release => cmd.arg("--release"),
    }
}

/// Build the project and return the binaries. A failed build is fatal.
pub async fn build(
    runner: &BoundRunner<'_>,
    project_dir: &Path,
    profile: BuildProfile,
    names: &BinaryNames,
) -> Result<Binaries, RunError> {
    info!(project = %project_dir.display(), %profile, "building");
    runner
        .run_checked(BUILD_LOG, &build_command(project_dir, profile), RunOptions::default())
        .await?;
    Ok(Binaries::locate(&target_dir(project_dir), profile, names))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_build_passes_flag() {
        let cmd = build_command(Path::new("/src/kv"), BuildProfile::Release);
        assert_eq!(cmd.get_args(), ["build", "--release"]);
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/src/kv")));
    }

    #[test]
    fn debug_build_has_no_profile_flag() {
        let cmd = build_command(Path::new("/src/kv"), BuildProfile::Debug);
        assert_eq!(cmd.get_args(), ["build"]);
    }

    #[test]
    fn locate_uses_profile_directory() {
        let names = BinaryNames {
            node: "kv-node".to_string(),
            ..BinaryNames::default()
        };
        let bins = Binaries::locate(Path::new("/src/kv/target"), BuildProfile::Debug, &names);
        assert_eq!(bins.node, PathBuf::from("/src/kv/target/debug/kv-node"));
        assert_eq!(bins.client, PathBuf::from("/src/kv/target/debug/client"));
        assert_eq!(bins.accelerator, PathBuf::from("/src/kv/target/debug/accelerator"));
    }

    #[test]
    fn absolute_names_bypass_target_dir() {
        let names = BinaryNames {
            client: "/opt/kv/bin/kv-client".to_string(),
            ..BinaryNames::default()
        };
        let bins = Binaries::locate(Path::new("/src/kv/target"), BuildProfile::Release, &names);
        assert_eq!(bins.client, PathBuf::from("/opt/kv/bin/kv-client"));
        assert_eq!(bins.node, PathBuf::from("/src/kv/target/release/node"));
    }

    #[test]
    fn profile_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            profile: BuildProfile,
        }
        let w: Wrapper = serde_json::from_str(r#"{"profile":"debug"}"#).unwrap();
        assert_eq!(w.profile, BuildProfile::Debug);
    }

    #[test]
    fn release_is_the_default_profile() {
        assert_eq!(BuildProfile::default(), BuildProfile::Release);
        assert_eq!(BuildProfile::Release.to_string(), "release");
    }
}
