//! Every workspace member inherits the workspace version, and the internal
//! dependency pin follows it.

use std::path::{Path, PathBuf};

const MEMBERS: [&str; 2] = ["crates/simflow-core", "crates/simflow-cli"];

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    std::fs::read_to_string(dir.join("Cargo.toml"))
        .unwrap()
        .parse()
        .unwrap()
}

fn workspace_version() -> String {
    manifest(&workspace_root())["workspace"]["package"]["version"]
        .as_str()
        .unwrap()
        .to_string()
}

#[test]
fn members_inherit_workspace_version() {
    let root = workspace_root();
    let listed: Vec<String> = manifest(&root)["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect();
    assert_eq!(listed, MEMBERS);

    for member in MEMBERS {
        let doc = manifest(&root.join(member));
        let inherits = doc["package"]["version"]
            .get("workspace")
            .and_then(toml::Value::as_bool);
        assert_eq!(
            inherits,
            Some(true),
            "{member} should use version.workspace = true"
        );
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    assert_eq!(workspace_version(), env!("CARGO_PKG_VERSION"));
    assert_eq!(simflow_core::VERSION, env!("CARGO_PKG_VERSION"));
}

#[test]
fn internal_dependency_pin_matches() {
    let pinned = manifest(&workspace_root())["workspace"]["dependencies"]["simflow-core"]
        ["version"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(pinned, workspace_version());
}
