use crate::utils::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::Arc};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub ip_header: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// 上传图片的最大字节数
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StorageConfig {
    pub library_dir: String,
    #[serde(default = "default_true")]
    pub watch: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheConfig {
    pub max_size: u64,
    pub ttl_secs: u64,
}

/// 文字样式与合成限制
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ComposeConfig {
    pub font_families: Vec<String>,
    pub font_weight: u16,
    /// 字号相对于图片宽度的比例
    pub font_scale: f32,
    pub min_font_size: f32,
    /// 描边宽度，字号的百分比
    pub stroke_width_percent: f32,
    pub fill_color: String,
    pub stroke_color: String,
    /// 上下边距相对于图片高度的比例
    pub margin_ratio: f32,
    pub uppercase: bool,
    pub max_dimension: u32,
    pub max_text_len: usize,
    pub default_top_text: String,
    pub default_bottom_text: String,
    pub fonts_dir: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub directory: String,
    pub file_prefix: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SwaggerConfig {
    pub endpoint: String,
    pub title: String,
    pub description: String,
    pub version: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub swagger: SwaggerConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            font_families: vec![
                "Impact".to_string(),
                "HelveticaNeue-CondensedBlack".to_string(),
                "Helvetica Neue".to_string(),
                "Anton".to_string(),
                "sans-serif".to_string(),
            ],
            font_weight: 900,
            font_scale: 0.1,
            min_font_size: 12.0,
            stroke_width_percent: 3.0,
            fill_color: "#FFFFFF".to_string(),
            stroke_color: "#000000".to_string(),
            margin_ratio: 0.04,
            uppercase: true,
            max_dimension: 4096,
            max_text_len: 200,
            default_top_text: "TOP".to_string(),
            default_bottom_text: "BOTTOM".to_string(),
            fonts_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            file_prefix: "mematic".to_string(),
        }
    }
}

impl Default for SwaggerConfig {
    fn default() -> Self {
        Self {
            endpoint: "/swagger-ui".to_string(),
            title: "Mematic API".to_string(),
            description: "Compose, save and share memes".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ip_header: "x-forwarded-for".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3001,
                proxy: ProxyConfig::default(),
                max_upload_bytes: default_max_upload_bytes(),
            },
            storage: StorageConfig {
                library_dir: "memes".to_string(),
                watch: true,
            },
            cache: CacheConfig {
                max_size: 100,
                ttl_secs: 300,
            },
            compose: ComposeConfig::default(),
            logging: LoggingConfig::default(),
            swagger: SwaggerConfig::default(),
        }
    }
}

/// 校验 `#RGB` 或 `#RRGGBB` 格式的颜色
pub fn is_hex_color(value: &str) -> bool {
    match value.strip_prefix('#') {
        Some(hex) => {
            (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = path.as_ref();

        // 如果配置文件不存在
        if !path.exists() {
            // 检查示例配置文件是否存在
            let example_path = path.with_extension("yml.example");

            if example_path.exists() {
                tracing::info!("从示例配置创建新的配置文件");
                fs::copy(&example_path, path)
                    .map_err(|e| AppError::Config(format!("复制示例配置文件失败: {}", e)))?;
            } else {
                tracing::info!("配置文件不存在，创建默认配置");
                let config = Config::default();
                let config_str = serde_yaml::to_string(&config)
                    .map_err(|e| AppError::Config(format!("序列化默认配置失败: {}", e)))?;

                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        fs::create_dir_all(parent)
                            .map_err(|e| AppError::Config(format!("创建配置目录失败: {}", e)))?;
                    }
                }

                fs::write(path, config_str)
                    .map_err(|e| AppError::Config(format!("写入默认配置文件失败: {}", e)))?;

                tracing::info!("默认配置文件已创建: {:?}", path);
            }
        }

        let config_str = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = serde_yaml::from_str(&config_str)
            .map_err(|e| AppError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        // 确保表情包库目录存在
        if !Path::new(&config.storage.library_dir).exists() {
            fs::create_dir_all(&config.storage.library_dir).map_err(|e| {
                AppError::Config(format!("Failed to create library directory: {}", e))
            })?;
            tracing::info!("表情包库目录已创建: {}", config.storage.library_dir);
        }

        Ok(Arc::new(config))
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 {
            return Err(AppError::Config("Cache max_size must be greater than 0".to_string()));
        }

        if self.cache.ttl_secs == 0 {
            return Err(AppError::Config("Cache TTL must be greater than 0".to_string()));
        }

        if self.server.port == 0 {
            return Err(AppError::Config("Server port must be greater than 0".to_string()));
        }

        if self.server.host.is_empty() {
            return Err(AppError::Config("Server host cannot be empty".to_string()));
        }

        if self.server.max_upload_bytes == 0 {
            return Err(AppError::Config("max_upload_bytes must be greater than 0".to_string()));
        }

        if self.storage.library_dir.is_empty() {
            return Err(AppError::Config("Library directory path cannot be empty".to_string()));
        }

        self.compose.validate()
    }
}

impl ComposeConfig {
    pub fn validate(&self) -> Result<()> {
        for color in [&self.fill_color, &self.stroke_color] {
            if !is_hex_color(color) {
                return Err(AppError::Config(format!(
                    "Invalid color '{}', expected #RGB or #RRGGBB",
                    color
                )));
            }
        }

        if self.font_families.iter().all(|f| f.trim().is_empty()) {
            return Err(AppError::Config("At least one font family is required".to_string()));
        }

        if !(self.font_scale > 0.0 && self.font_scale <= 1.0) {
            return Err(AppError::Config("font_scale must be in (0, 1]".to_string()));
        }

        if !(self.min_font_size > 0.0) {
            return Err(AppError::Config("min_font_size must be greater than 0".to_string()));
        }

        if !(0.0..=50.0).contains(&self.stroke_width_percent) {
            return Err(AppError::Config("stroke_width_percent must be in [0, 50]".to_string()));
        }

        if !(0.0..0.5).contains(&self.margin_ratio) {
            return Err(AppError::Config("margin_ratio must be in [0, 0.5)".to_string()));
        }

        if self.max_dimension == 0 {
            return Err(AppError::Config("max_dimension must be greater than 0".to_string()));
        }

        if self.max_text_len == 0 {
            return Err(AppError::Config("max_text_len must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn hex_colors() {
        assert!(is_hex_color("#fff"));
        assert!(is_hex_color("#00FF7a"));
        assert!(!is_hex_color("fff"));
        assert!(!is_hex_color("#12345"));
        assert!(!is_hex_color("#ff\"/><script"));
    }

    #[test]
    fn validate_rejects_bad_style() {
        let mut config = Config::default();
        config.compose.stroke_color = "black".to_string();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = Config::default();
        config.compose.font_scale = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.compose.font_families = vec![" ".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_creates_default_file_and_library_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yml");
        let library = dir.path().join("library");

        let mut defaults = Config::default();
        defaults.storage.library_dir = library.to_string_lossy().into_owned();
        fs::write(
            dir.path().join("config.yml.example"),
            serde_yaml::to_string(&defaults).unwrap(),
        )
        .unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert!(config_path.exists());
        assert!(library.is_dir());
        assert_eq!(config.compose.default_top_text, "TOP");
        assert_eq!(config.server.port, 3001);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r##"
server:
  host: 127.0.0.1
  port: 8080
storage:
  library_dir: out
cache:
  max_size: 10
  ttl_secs: 60
compose:
  stroke_color: "#111"
"##;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert!(config.storage.watch);
        assert_eq!(config.server.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.compose.stroke_color, "#111");
        assert_eq!(config.compose.fill_color, "#FFFFFF");
        assert_eq!(config.swagger.endpoint, "/swagger-ui");
    }
}
