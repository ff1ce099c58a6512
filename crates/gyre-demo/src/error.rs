use gyre::core::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DemoError>;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("store rejected transition: {0}")]
    Store(#[from] StoreError),

    #[error("rendering stopped: {message}")]
    RenderFailed { message: String },
}

impl DemoError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } => 2,
            Self::Store(_) => 1,
            Self::RenderFailed { .. } => 3,
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let cli = DemoError::invalid("bad");
        let store = DemoError::from(StoreError::invalid_count(-1));
        let render = DemoError::RenderFailed {
            message: "boom".into(),
        };
        assert_eq!(cli.exit_code(), 2);
        assert_eq!(store.exit_code(), 1);
        assert_eq!(render.exit_code(), 3);
        assert!(store.to_string().contains("-1"));
    }
}
