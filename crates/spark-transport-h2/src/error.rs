use thiserror::Error;

/// 连接级设置解析或校验失败。
#[derive(Debug, Error)]
pub enum SettingsError {
    /// TOML 文本无法解析为设置结构。
    #[error("failed to parse h2 settings: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },

    /// 字段取值越界。
    #[error("invalid h2 setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SettingsError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SettingsError::Parse { .. } => "spark.h2.settings.parse_failed",
            SettingsError::Invalid { .. } => "spark.h2.settings.invalid",
        }
    }
}
