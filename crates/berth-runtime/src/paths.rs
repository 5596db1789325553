use std::path::Path;

use serde::{Deserialize, Serialize};

/// How host paths must be written for the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePathStyle {
    #[default]
    Native,
    /// Windows host, engine running inside WSL: `C:\x` is `/mnt/c/x`.
    Wsl,
}

/// Render a host path the way the engine expects it in a bind mount.
pub fn to_engine_path(path: &Path, style: EnginePathStyle) -> String {
    let raw = path.to_string_lossy();
    match style {
        EnginePathStyle::Native => raw.into_owned(),
        EnginePathStyle::Wsl => wsl_path(&raw),
    }
}

fn wsl_path(raw: &str) -> String {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            let rest = raw[2..].replace('\\', "/");
            let rest = rest.trim_start_matches('/');
            let drive = drive.to_ascii_lowercase();
            if rest.is_empty() {
                format!("/mnt/{drive}")
            } else {
                format!("/mnt/{drive}/{rest}")
            }
        }
        _ => raw.replace('\\', "/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_wsl_translation() {
        let path = PathBuf::from(r"C:\data\w1");
        assert_eq!(to_engine_path(&path, EnginePathStyle::Wsl), "/mnt/c/data/w1");
        assert_eq!(
            to_engine_path(&PathBuf::from("D:/"), EnginePathStyle::Wsl),
            "/mnt/d"
        );
    }

    #[test]
    fn test_wsl_leaves_posix_paths() {
        let path = PathBuf::from("/srv/berth/workspaces/w1");
        assert_eq!(
            to_engine_path(&path, EnginePathStyle::Wsl),
            "/srv/berth/workspaces/w1"
        );
    }

    #[test]
    fn test_native_is_identity() {
        let path = PathBuf::from("/srv/berth/workspaces/w1");
        assert_eq!(
            to_engine_path(&path, EnginePathStyle::Native),
            "/srv/berth/workspaces/w1"
        );
    }

    #[test]
    fn test_style_deserializes_lowercase() {
        let style: EnginePathStyle = serde_json::from_str(r#""wsl""#).unwrap();
        assert_eq!(style, EnginePathStyle::Wsl);
    }
}
