//! Baseline editor settings written into every workspace on start.

use serde_json::{Value, json};

const SETTINGS_ENV: &str = "BERTH_SETTINGS";
const SETTINGS_PATH_ENV: &str = "BERTH_SETTINGS_PATH";

pub fn baseline_settings() -> Value {
    json!({
        "telemetry.telemetryLevel": "off",
        "workbench.startupEditor": "none",
        "security.workspace.trust.enabled": false,
        "update.mode": "none",
        "extensions.autoUpdate": false,
        "files.autoSave": "afterDelay",
        "terminal.integrated.defaultProfile.linux": "bash"
    })
}

/// Command and environment that write `settings` to `path` inside a container.
/// Content travels through the environment so nothing needs shell quoting.
pub fn install_command(path: &str, settings: &Value) -> (Vec<String>, Vec<String>) {
    let script = format!(
        "mkdir -p \"$(dirname \"${SETTINGS_PATH_ENV}\")\" && printf '%s' \"${SETTINGS_ENV}\" > \"${SETTINGS_PATH_ENV}\""
    );
    let cmd = vec!["sh".to_string(), "-c".to_string(), script];
    let env = vec![
        format!("{SETTINGS_ENV}={}", serde_json::to_string_pretty(settings).unwrap_or_default()),
        format!("{SETTINGS_PATH_ENV}={path}"),
    ];
    (cmd, env)
}
