use thiserror::Error;

pub type HatsmithResult<T> = Result<T, HatsmithError>;

#[derive(Debug, Error)]
pub enum HatsmithError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
