use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

pub const DEFAULT_CONFIG_PATH: &str = "booth.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend_url: String,
    pub database_url: String,
    pub access_token: Option<String>,
    pub upload_timeout_secs: u64,
    pub capture_command: Option<String>,
    pub capture_args: Vec<String>,
    pub default_layout: String,
    pub default_delay: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000".into(),
            database_url: "sqlite://./data/booth.db".into(),
            access_token: None,
            upload_timeout_secs: 60,
            capture_command: None,
            capture_args: Vec::new(),
            default_layout: "2 Pose".into(),
            default_delay: 3,
        }
    }
}

/// Env names checked per key, lowest precedence first.
const ENV_KEYS: &[(&str, &[&str])] = &[
    ("backend_url", &["BOOTH_BACKEND_URL", "APP__BACKEND_URL"]),
    (
        "database_url",
        &["DATABASE_URL", "BOOTH_DATABASE_URL", "APP__DATABASE_URL"],
    ),
    ("access_token", &["BOOTH_ACCESS_TOKEN", "APP__ACCESS_TOKEN"]),
    (
        "upload_timeout_secs",
        &["BOOTH_UPLOAD_TIMEOUT_SECS", "APP__UPLOAD_TIMEOUT_SECS"],
    ),
    (
        "capture_command",
        &["BOOTH_CAPTURE_COMMAND", "APP__CAPTURE_COMMAND"],
    ),
    ("capture_args", &["BOOTH_CAPTURE_ARGS", "APP__CAPTURE_ARGS"]),
    (
        "default_layout",
        &["BOOTH_DEFAULT_LAYOUT", "APP__DEFAULT_LAYOUT"],
    ),
    ("default_delay", &["BOOTH_DEFAULT_DELAY", "APP__DEFAULT_DELAY"]),
];

pub fn load_settings(config_path: Option<&Path>) -> Settings {
    let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    load_settings_from(path, |name| std::env::var(name).ok())
}

fn load_settings_from(config_path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    apply_setting(&mut settings, key, value);
                }
            }
            Err(err) => {
                tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file");
            }
        }
    }

    for (key, names) in ENV_KEYS {
        for name in *names {
            if let Some(value) = env(name) {
                apply_setting(&mut settings, key, &value);
            }
        }
    }

    settings
}

fn apply_setting(settings: &mut Settings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "backend_url" => settings.backend_url = value.to_string(),
        "database_url" => settings.database_url = value.to_string(),
        "access_token" => {
            settings.access_token = (!value.is_empty()).then(|| value.to_string());
        }
        "upload_timeout_secs" => {
            if let Ok(parsed) = value.parse::<u64>() {
                settings.upload_timeout_secs = parsed.max(1);
            }
        }
        "capture_command" => {
            settings.capture_command = (!value.is_empty()).then(|| value.to_string());
        }
        "capture_args" => {
            settings.capture_args = value.split_whitespace().map(str::to_string).collect();
        }
        "default_layout" => settings.default_layout = value.to_string(),
        "default_delay" => {
            if let Ok(parsed) = value.parse::<u32>() {
                settings.default_delay = parsed;
            }
        }
        _ => tracing::debug!(key, "unknown config key"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn scratch_dir(label: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = env::temp_dir().join(format!("booth_config_{label}_{suffix}"));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
        assert_eq!(
            normalize_database_url("sqlite:booth.db"),
            "sqlite://booth.db"
        );
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    }

    #[test]
    fn creates_parent_dir_for_absolute_sqlite_url() {
        let root = scratch_dir("db");
        let db_path = root.join("nested").join("booth.db");

        let url = prepare_database_url(&db_path.display().to_string()).expect("prepare db url");
        assert!(url.starts_with("sqlite://"));
        assert!(root.join("nested").exists());

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn missing_file_and_env_yield_defaults() {
        let root = scratch_dir("defaults");
        let settings = load_settings_from(&root.join("absent.toml"), |_| None);
        assert_eq!(settings, Settings::default());
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn env_overrides_file_and_app_prefix_wins() {
        let root = scratch_dir("layers");
        let path = root.join("booth.toml");
        fs::write(
            &path,
            r#"
backend_url = "http://file-backend:9000"
default_delay = "5"
capture_command = "fswebcam"
capture_args = "--no-banner -"
upload_timeout_secs = "not-a-number"
"#,
        )
        .expect("write config");

        let env_values: HashMap<&str, &str> = [
            ("BOOTH_BACKEND_URL", "http://env-backend:9000"),
            ("APP__BACKEND_URL", "http://app-backend:9000"),
            ("BOOTH_ACCESS_TOKEN", "secret"),
        ]
        .into_iter()
        .collect();
        let settings = load_settings_from(&path, |name| {
            env_values.get(name).map(|value| value.to_string())
        });

        assert_eq!(settings.backend_url, "http://app-backend:9000");
        assert_eq!(settings.default_delay, 5);
        assert_eq!(settings.capture_command.as_deref(), Some("fswebcam"));
        assert_eq!(settings.capture_args, vec!["--no-banner", "-"]);
        assert_eq!(settings.access_token.as_deref(), Some("secret"));
        assert_eq!(settings.upload_timeout_secs, 60);

        fs::remove_dir_all(root).expect("cleanup");
    }
}
