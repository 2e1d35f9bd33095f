use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use image::Rgb;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::render::text::{parse_hex_color, to_hex_color};
use crate::render::{Alignment, TextStyle, MAX_COMPRESS_LEVEL};
use crate::userlist::{DuplicateCheck, NormalizeOptions};

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_NAME: &str = "certgen";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub config_path: PathBuf,
    pub files: FilesConfig,
    pub certificate: CertificateConfig,
    pub text: TextConfig,
    pub emailing: EmailingConfig,
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FilesConfig {
    /// Last template image used.
    pub template: Option<PathBuf>,
    /// Last user list loaded.
    pub userlist: Option<PathBuf>,
    /// Where certificates are written and attached from.
    pub output_dir: PathBuf,
    pub fonts_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontWeight {
    #[default]
    Normal,
    Bold,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontSlant {
    #[default]
    Roman,
    Italic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateConfig {
    /// Font file name inside `fonts_dir`, a family name, or a path.
    pub font: String,
    pub font_size: f32,
    pub color: RgbColor,
    pub weight: FontWeight,
    pub slant: FontSlant,
    /// PNG compression level, 0 to 9.
    pub compress_level: u8,
    /// Render a single sample certificate instead of the list.
    pub test_mode: bool,
    /// Log an activity entry for every certificate written.
    pub logging: bool,
    pub duplicate_check: DuplicateCheck,
    pub transliterate: bool,
}

impl CertificateConfig {
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            check: self.duplicate_check,
            transliterate: self.transliterate,
        }
    }

    /// Resolve the configured font against `fonts_dir`.
    pub fn font_path(&self, fonts_dir: &Path) -> Result<PathBuf> {
        let bold = self.weight == FontWeight::Bold;
        let italic = self.slant == FontSlant::Italic;
        crate::render::resolve_font(fonts_dir, &self.font, bold, italic).with_context(|| {
            format!(
                "font `{}` not found in {} (certificate.font)",
                self.font,
                fonts_dir.display()
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextConfig {
    pub x: f32,
    pub y: f32,
    pub alignment: Alignment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailingConfig {
    /// Sender used in test mode.
    pub test_address: String,
    /// Sender used for real batches.
    pub real_address: String,
    pub test_mode: bool,
    /// Send one message without attachment instead of a certificate batch.
    pub personal_email: bool,
    pub subject: String,
    pub body: String,
    pub client_secret: PathBuf,
    pub token_file: PathBuf,
}

impl EmailingConfig {
    /// The sender address for the current mode.
    pub fn sender(&self) -> &str {
        if self.test_mode {
            &self.test_address
        } else {
            &self.real_address
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_rgb(self) -> Rgb<u8> {
        Rgb([self.r, self.g, self.b])
    }
}

impl Config {
    /// Defaults, tied to `config_path` for saving.
    pub fn with_path(config_path: PathBuf) -> Self {
        Self::from_file(ConfigFile::default(), config_path)
    }

    pub fn text_style(&self) -> TextStyle {
        TextStyle {
            x: self.text.x,
            y: self.text.y,
            alignment: self.text.alignment,
            color: self.certificate.color.to_rgb(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.certificate.compress_level > MAX_COMPRESS_LEVEL {
            bail!(
                "certificate.compress_level must be between 0 and {MAX_COMPRESS_LEVEL}, got {}",
                self.certificate.compress_level
            );
        }
        if !(self.certificate.font_size > 0.0) {
            bail!(
                "certificate.font_size must be positive, got {}",
                self.certificate.font_size
            );
        }
        Ok(())
    }

    /// Write the configuration back to `config_path`.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create config dir: {}", dir.display()))?;
        }
        let raw = toml::to_string_pretty(&ConfigFile::from(self))
            .context("failed to serialize configuration")?;
        fs::write(&self.config_path, raw).with_context(|| {
            format!(
                "failed to write configuration file at {}",
                self.config_path.display()
            )
        })?;
        debug!("saved configuration to {}", self.config_path.display());
        Ok(())
    }

    fn from_file(file: ConfigFile, config_path: PathBuf) -> Self {
        let ConfigFile {
            files,
            certificate,
            text,
            emailing,
        } = file;
        Config {
            config_path,
            files: FilesConfig {
                template: files.template.map(|p| expand_tilde(&p)),
                userlist: files.userlist.map(|p| expand_tilde(&p)),
                output_dir: expand_tilde(&files.output_dir),
                fonts_dir: expand_tilde(&files.fonts_dir),
            },
            certificate: CertificateConfig {
                font: certificate.font,
                font_size: certificate.font_size,
                color: certificate.color,
                weight: certificate.weight,
                slant: certificate.slant,
                compress_level: certificate.compress_level,
                test_mode: certificate.test_mode,
                logging: certificate.logging,
                duplicate_check: certificate.duplicate_check,
                transliterate: certificate.transliterate,
            },
            text: TextConfig {
                x: text.x,
                y: text.y,
                alignment: text.alignment,
            },
            emailing: EmailingConfig {
                test_address: emailing.test_address,
                real_address: emailing.real_address,
                test_mode: emailing.test_mode,
                personal_email: emailing.personal_email,
                subject: emailing.subject,
                body: emailing.body,
                client_secret: expand_tilde(&emailing.client_secret),
                token_file: expand_tilde(&emailing.token_file),
            },
        }
    }
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

// =============================================================================
// File Deserialization
// =============================================================================

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigFile {
    files: FilesFile,
    certificate: CertificateFile,
    text: TextFile,
    emailing: EmailingFile,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct FilesFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    userlist: Option<PathBuf>,
    output_dir: PathBuf,
    fonts_dir: PathBuf,
}

impl Default for FilesFile {
    fn default() -> Self {
        Self {
            template: None,
            userlist: None,
            output_dir: PathBuf::from("certificates"),
            fonts_dir: PathBuf::from("fonts"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct CertificateFile {
    font: String,
    font_size: f32,
    color: RgbColor,
    weight: FontWeight,
    slant: FontSlant,
    compress_level: u8,
    test_mode: bool,
    logging: bool,
    duplicate_check: DuplicateCheck,
    transliterate: bool,
}

impl Default for CertificateFile {
    fn default() -> Self {
        Self {
            font: "roboto-Regular.ttf".to_string(),
            font_size: 48.0,
            color: RgbColor::new(0, 0, 0),
            weight: FontWeight::Normal,
            slant: FontSlant::Roman,
            compress_level: 3,
            test_mode: false,
            logging: true,
            duplicate_check: DuplicateCheck::Name,
            transliterate: false,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct TextFile {
    x: f32,
    y: f32,
    alignment: Alignment,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct EmailingFile {
    test_address: String,
    real_address: String,
    test_mode: bool,
    personal_email: bool,
    subject: String,
    body: String,
    client_secret: PathBuf,
    token_file: PathBuf,
}

impl Default for EmailingFile {
    fn default() -> Self {
        Self {
            test_address: String::new(),
            real_address: String::new(),
            test_mode: false,
            personal_email: false,
            subject: "Your certificate".to_string(),
            body: String::new(),
            client_secret: PathBuf::from("client_secret.json"),
            token_file: PathBuf::from("gmail_token.json"),
        }
    }
}

impl From<&Config> for ConfigFile {
    fn from(config: &Config) -> Self {
        let c = &config.certificate;
        let e = &config.emailing;
        ConfigFile {
            files: FilesFile {
                template: config.files.template.clone(),
                userlist: config.files.userlist.clone(),
                output_dir: config.files.output_dir.clone(),
                fonts_dir: config.files.fonts_dir.clone(),
            },
            certificate: CertificateFile {
                font: c.font.clone(),
                font_size: c.font_size,
                color: c.color,
                weight: c.weight,
                slant: c.slant,
                compress_level: c.compress_level,
                test_mode: c.test_mode,
                logging: c.logging,
                duplicate_check: c.duplicate_check,
                transliterate: c.transliterate,
            },
            text: TextFile {
                x: config.text.x,
                y: config.text.y,
                alignment: config.text.alignment,
            },
            emailing: EmailingFile {
                test_address: e.test_address.clone(),
                real_address: e.real_address.clone(),
                test_mode: e.test_mode,
                personal_email: e.personal_email,
                subject: e.subject.clone(),
                body: e.body.clone(),
                client_secret: e.client_secret.clone(),
                token_file: e.token_file.clone(),
            },
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

fn config_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine base directories")?;
    let dir = base.config_dir().join(APP_NAME);
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_root()?.join(CONFIG_FILE_NAME))
}

/// Load the configuration from `path`, or from the default location.
/// A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => expand_tilde(path),
        None => config_path()?,
    };
    if !path.exists() {
        debug!("no configuration at {}, using defaults", path.display());
        return Ok(Config::with_path(path));
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
    parse(&raw, path)
}

fn parse(raw: &str, path: PathBuf) -> Result<Config> {
    let value: toml::Value = toml::from_str(raw)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;

    warn_unknown_keys(&value);

    let cfg_file: ConfigFile = value
        .try_into()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))?;

    let config = Config::from_file(cfg_file, path);
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Unknown key warnings
// =============================================================================

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };

    let known = HashSet::from(["files", "certificate", "text", "emailing"]);
    for key in table.keys() {
        if !known.contains(key.as_str()) {
            warn!("unknown configuration key `{}`", key);
        }
    }

    if let Some(v) = table.get("files") {
        warn_unknown_in_section(v, "files", &["template", "userlist", "output_dir", "fonts_dir"]);
    }
    if let Some(v) = table.get("certificate") {
        warn_unknown_in_section(
            v,
            "certificate",
            &[
                "font",
                "font_size",
                "color",
                "weight",
                "slant",
                "compress_level",
                "test_mode",
                "logging",
                "duplicate_check",
                "transliterate",
            ],
        );
    }
    if let Some(v) = table.get("text") {
        warn_unknown_in_section(v, "text", &["x", "y", "alignment"]);
    }
    if let Some(v) = table.get("emailing") {
        warn_unknown_in_section(
            v,
            "emailing",
            &[
                "test_address",
                "real_address",
                "test_mode",
                "personal_email",
                "subject",
                "body",
                "client_secret",
                "token_file",
            ],
        );
    }
}

fn warn_unknown_in_section(value: &toml::Value, section: &str, known: &[&str]) {
    let Some(table) = value.as_table() else {
        return;
    };
    let known_set: HashSet<&str> = known.iter().copied().collect();
    for key in table.keys() {
        if !known_set.contains(key.as_str()) {
            warn!("unknown configuration key `{}.{}`", section, key);
        }
    }
}

// =============================================================================
// Colors
// =============================================================================

impl<'de> serde::Deserialize<'de> for RgbColor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Helper {
            Hex(String),
            Array([u8; 3]),
            Map { r: u8, g: u8, b: u8 },
        }

        let helper = Helper::deserialize(deserializer)?;
        let (r, g, b) = match helper {
            Helper::Hex(hex) => {
                let rgb = parse_hex_color(&hex).ok_or_else(|| {
                    serde::de::Error::custom(format!("invalid color `{hex}`, expected #rrggbb"))
                })?;
                (rgb[0], rgb[1], rgb[2])
            }
            Helper::Array(values) => (values[0], values[1], values[2]),
            Helper::Map { r, g, b } => (r, g, b),
        };
        Ok(RgbColor { r, g, b })
    }
}

impl Serialize for RgbColor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_hex_color(self.to_rgb()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = load(Some(&path)).unwrap();

        assert_eq!(config.config_path, path);
        assert_eq!(config.files.output_dir, PathBuf::from("certificates"));
        assert_eq!(config.files.fonts_dir, PathBuf::from("fonts"));
        assert_eq!(config.certificate.compress_level, 3);
        assert_eq!(config.certificate.duplicate_check, DuplicateCheck::Name);
        assert_eq!(config.text.alignment, Alignment::Middle);
        assert_eq!(config.emailing.client_secret, PathBuf::from("client_secret.json"));
        assert_eq!(config.emailing.token_file, PathBuf::from("gmail_token.json"));
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let raw = r##"
            [certificate]
            font_size = 64
            color = "#ff8800"
            duplicate_check = "email"

            [text]
            x = 1024
            y = 700.5
            alignment = "left"
        "##;
        let config = parse(raw, PathBuf::from("config.toml")).unwrap();

        assert_eq!(config.certificate.font_size, 64.0);
        assert_eq!(config.certificate.color, RgbColor::new(0xff, 0x88, 0x00));
        assert_eq!(config.certificate.duplicate_check, DuplicateCheck::Email);
        assert_eq!(config.certificate.compress_level, 3);
        assert_eq!(config.text.x, 1024.0);
        assert_eq!(config.text.y, 700.5);
        assert_eq!(config.text.alignment, Alignment::Left);
        assert_eq!(config.emailing.subject, "Your certificate");
    }

    #[test]
    fn test_color_forms() {
        for raw in [
            "[certificate]\ncolor = [10, 20, 30]",
            "[certificate]\ncolor = { r = 10, g = 20, b = 30 }",
            "[certificate]\ncolor = \"0a141e\"",
        ] {
            let config = parse(raw, PathBuf::from("c.toml")).unwrap();
            assert_eq!(config.certificate.color, RgbColor::new(10, 20, 30), "{raw}");
        }
        assert!(parse("[certificate]\ncolor = \"#12\"", PathBuf::from("c.toml")).is_err());
    }

    #[test]
    fn test_validation_names_the_key() {
        let err = parse("[certificate]\ncompress_level = 12", PathBuf::from("c.toml")).unwrap_err();
        assert!(err.to_string().contains("certificate.compress_level"));

        let err = parse("[certificate]\nfont_size = 0", PathBuf::from("c.toml")).unwrap_err();
        assert!(err.to_string().contains("certificate.font_size"));

        assert!(parse("[text]\nalignment = \"top\"", PathBuf::from("c.toml")).is_err());
    }

    #[test]
    fn test_unknown_keys_are_not_fatal() {
        let config = parse(
            "mystery = 1\n[files]\nunknown = \"x\"\noutput_dir = \"out\"",
            PathBuf::from("c.toml"),
        )
        .unwrap();
        assert_eq!(config.files.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::with_path(path.clone());
        config.files.template = Some(PathBuf::from("/tmp/template.png"));
        config.certificate.color = RgbColor::new(1, 2, 3);
        config.text.alignment = Alignment::Right;
        config.emailing.real_address = "me@example.com".into();
        config.save().unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert!(fs::read_to_string(&path).unwrap().contains("color = \"#010203\""));
    }

    #[test]
    fn test_sender_follows_test_mode() {
        let mut config = Config::with_path(PathBuf::from("c.toml"));
        config.emailing.test_address = "test@example.com".into();
        config.emailing.real_address = "real@example.com".into();
        assert_eq!(config.emailing.sender(), "real@example.com");
        config.emailing.test_mode = true;
        assert_eq!(config.emailing.sender(), "test@example.com");
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/fonts"));
        if let Some(home) = home::home_dir() {
            assert_eq!(expanded, home.join("fonts"));
        }
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    }
}
