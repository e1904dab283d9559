use anyhow::{anyhow, Result};
use chrono::format::{Item, StrftimeItems};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::engine::EngineOptions;
use crate::recording::extension_for_mime;
use crate::settings::Settings;
use crate::shortcuts::ShortcutConfig;

const MAX_FILENAME_TEMPLATE_LEN: usize = 128;
const MAX_ENDPOINT_LEN: usize = 512;
const MAX_FORM_NAME_LEN: usize = 64;
const MAX_RESPONSE_PATH_LEN: usize = 128;
const MAX_UPLOAD_MB: u64 = 2048;
const DEFAULT_FILENAME_TEMPLATE: &str = "review_%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub output: OutputConfig,
    #[serde(default)]
    pub recording: Settings,
    #[serde(default)]
    pub engine: EngineOptions,
    #[serde(default)]
    pub shortcuts: ShortcutConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub filename_template: String,
    /// Write the JPEG thumbnail next to the recording.
    #[serde(default = "default_true")]
    pub save_thumbnail: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// HTTPS endpoint accepting the multipart form. Empty disables upload.
    pub endpoint: String,
    pub video_field: String,
    pub thumbnail_field: String,
    pub review_id_field: String,
    /// Dot-separated path to the URL in the JSON response.
    pub response_path: String,
    pub max_size_mb: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            video_field: "video".to_string(),
            thumbnail_field: "thumbnail".to_string(),
            review_id_field: "reviewId".to_string(),
            response_path: "url".to_string(),
            max_size_mb: 500,
        }
    }
}

impl UploadConfig {
    pub fn is_enabled(&self) -> bool {
        !self.endpoint.is_empty()
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

fn valid_field_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FORM_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn valid_response_path(path: &str) -> bool {
    !path.is_empty()
        && path.len() <= MAX_RESPONSE_PATH_LEN
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        && !path.starts_with('.')
        && !path.ends_with('.')
        && !path.contains("..")
}

fn valid_template(template: &str) -> bool {
    template.len() <= MAX_FILENAME_TEMPLATE_LEN
        && !template.contains('/')
        && !template.contains('\\')
        && !template.contains("..")
        && !StrftimeItems::new(template).any(|item| matches!(item, Item::Error))
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.recording.validate()?;
        self.engine.validate()?;
        self.shortcuts.validate()?;

        if !valid_template(&self.output.filename_template) {
            return Err(anyhow!(
                "filename_template is too long or contains path characters"
            ));
        }
        if self.upload.endpoint.len() > MAX_ENDPOINT_LEN {
            return Err(anyhow!("upload endpoint too long"));
        }
        if self.upload.is_enabled() && !self.upload.endpoint.starts_with("https://") {
            return Err(anyhow!("upload endpoint must use HTTPS"));
        }
        for field in [
            &self.upload.video_field,
            &self.upload.thumbnail_field,
            &self.upload.review_id_field,
        ] {
            if !valid_field_name(field) {
                return Err(anyhow!("invalid upload form field name: {:?}", field));
            }
        }
        if !valid_response_path(&self.upload.response_path) {
            return Err(anyhow!("upload response path has invalid format"));
        }
        if self.upload.max_size_mb == 0 || self.upload.max_size_mb > MAX_UPLOAD_MB {
            return Err(anyhow!("max_size_mb must be between 1 and {}", MAX_UPLOAD_MB));
        }
        Ok(())
    }

    /// Replaces out-of-range values with defaults so a hand-edited file
    /// still loads.
    fn sanitize(&mut self) {
        let defaults = Config::default();

        if self.recording.validate().is_err() {
            self.recording.max_duration = defaults.recording.max_duration;
        }
        if self.engine.validate().is_err() {
            self.engine = defaults.engine.clone();
        }
        if !valid_template(&self.output.filename_template) {
            self.output.filename_template = DEFAULT_FILENAME_TEMPLATE.to_string();
        }
        if self.upload.endpoint.len() > MAX_ENDPOINT_LEN
            || (self.upload.is_enabled() && !self.upload.endpoint.starts_with("https://"))
        {
            self.upload.endpoint = String::new();
        }
        if !valid_field_name(&self.upload.video_field) {
            self.upload.video_field = defaults.upload.video_field.clone();
        }
        if !valid_field_name(&self.upload.thumbnail_field) {
            self.upload.thumbnail_field = defaults.upload.thumbnail_field.clone();
        }
        if !valid_field_name(&self.upload.review_id_field) {
            self.upload.review_id_field = defaults.upload.review_id_field.clone();
        }
        if !valid_response_path(&self.upload.response_path) {
            self.upload.response_path = defaults.upload.response_path.clone();
        }
        self.upload.max_size_mb = self.upload.max_size_mb.clamp(1, MAX_UPLOAD_MB);
        self.shortcuts.sanitize();
    }
}

impl Default for Config {
    fn default() -> Self {
        let videos_dir = directories::UserDirs::new()
            .map(|dirs| match dirs.video_dir() {
                Some(videos) => videos.to_path_buf(),
                None => dirs.home_dir().to_path_buf(),
            })
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            output: OutputConfig {
                directory: videos_dir.join("reviewcap"),
                filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
                save_thumbnail: true,
            },
            recording: Settings::default(),
            engine: EngineOptions::default(),
            shortcuts: ShortcutConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "reviewcap", "reviewcap").map(|p| p.config_dir().to_path_buf())
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.validate()?;
        let dir = Self::config_dir().ok_or_else(|| anyhow!("no config directory available"))?;
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("config.toml"), toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Creates the output directory, refusing relative escapes and
    /// network shares.
    pub fn ensure_output_dir(&self) -> Result<()> {
        let dir = self.output.directory.as_path();
        if dir.as_os_str().is_empty() {
            return Err(anyhow!("output.directory is empty"));
        }
        if dir.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(anyhow!("output.directory must not contain '..'"));
        }
        #[cfg(windows)]
        {
            if dir.to_string_lossy().starts_with(r"\\") {
                return Err(anyhow!("output.directory must not be a network share"));
            }
        }
        fs::create_dir_all(dir)?;
        Ok(())
    }

    /// Expands the filename template for `mime_type`, keeping only
    /// characters safe on every platform.
    pub fn generate_filename(&self, mime_type: &str) -> String {
        let now = chrono::Local::now();
        let mut expanded = String::new();
        if write!(expanded, "{}", now.format(&self.output.filename_template)).is_err() {
            expanded.clear();
        }
        let stem: String = expanded
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
            .take(200)
            .collect();
        let stem = match stem.is_empty() {
            true => format!("review_{}", now.timestamp()),
            false => stem,
        };
        format!("{}.{}", stem, extension_for_mime(mime_type))
    }

    pub fn output_path(&self, mime_type: &str) -> PathBuf {
        self.output.directory.join(self.generate_filename(mime_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SourceKind;

    #[test]
    fn test_default_config_is_valid_and_round_trips() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::parse(
            r#"
            [output]
            directory = "/tmp/reviews"
            filename_template = "take_%H%M"

            [recording]
            selected_source = "screen"
            countdown_duration = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.recording.selected_source, SourceKind::Screen);
        assert_eq!(config.recording.countdown_duration, 0);
        assert_eq!(config.engine, EngineOptions::default());
        assert!(!config.upload.is_enabled());
        assert!(config.output.save_thumbnail);
    }

    #[test]
    fn test_sanitize_repairs_bad_values() {
        let config = Config::parse(
            r#"
            [output]
            directory = "/tmp/reviews"
            filename_template = "../../etc/passwd"

            [engine]
            stream_fps = 0

            [upload]
            endpoint = "http://example.com/upload"
            video_field = "bad field"
            response_path = ".data..url"
            "#,
        )
        .unwrap();
        assert_eq!(config.output.filename_template, DEFAULT_FILENAME_TEMPLATE);
        assert_eq!(config.engine.stream_fps, EngineOptions::default().stream_fps);
        assert!(config.upload.endpoint.is_empty());
        assert_eq!(config.upload.video_field, "video");
        assert_eq!(config.upload.response_path, "url");
    }

    #[test]
    fn test_unknown_strftime_specifier_is_rejected() {
        let mut config = Config::default();
        config.output.filename_template = "rec_%Q".to_string();
        assert!(config.validate().is_err());
        assert!(config.generate_filename("image/gif").starts_with("review_"));

        let loaded = Config::parse(
            r#"
            [output]
            directory = "/tmp/reviews"
            filename_template = "rec_%Q"
            "#,
        )
        .unwrap();
        assert_eq!(loaded.output.filename_template, DEFAULT_FILENAME_TEMPLATE);
    }

    #[test]
    fn test_validate_rejects_plain_http_endpoint() {
        let mut config = Config::default();
        config.upload.endpoint = "http://reviews.example.com/api".to_string();
        assert!(config.validate().is_err());
        config.upload.endpoint = "https://reviews.example.com/api".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let result = Config::parse(
            r#"
            [output]
            directory = "/tmp/reviews"
            filename_template = "x"

            [tray]
            enabled = true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_generate_filename_uses_mime_extension() {
        let mut config = Config::default();
        config.output.filename_template = "review/%Y".to_string();
        let name = config.generate_filename("video/webm;codecs=vp8,opus");
        assert!(name.ends_with(".webm"));
        assert!(!name.contains('/'));
        assert!(config.generate_filename("image/gif").ends_with(".gif"));
    }

    #[test]
    fn test_ensure_output_dir_refuses_traversal() {
        let mut config = Config::default();
        config.output.directory = PathBuf::from("/tmp/../etc/reviewcap");
        assert!(config.ensure_output_dir().is_err());
        config.output.directory = PathBuf::new();
        assert!(config.ensure_output_dir().is_err());
    }
}
