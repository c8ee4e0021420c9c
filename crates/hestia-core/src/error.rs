//! Error taxonomy shared by drivers and gateway services.

/// Errors raised by drivers, the metadata index and the gateway services.
#[derive(Debug, thiserror::Error)]
pub enum HestiaError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not allowed: {0}")]
    NotAllowed(String),

    #[error("Malformed: {0}")]
    Malformed(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Aggregate of every failure from a fan-out operation where nothing succeeded.
    #[error("{message} ({} errors)", errors.len())]
    Multi {
        message: String,
        errors: Vec<HestiaError>,
    },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl HestiaError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn not_allowed(why: impl Into<String>) -> Self {
        Self::NotAllowed(why.into())
    }

    pub fn malformed(why: impl Into<String>) -> Self {
        Self::Malformed(why.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// HTTP status code class of this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::NotAllowed(_) | Self::Auth(_) => 403,
            Self::Malformed(_) => 400,
            Self::Multi { .. } | Self::Driver(_) | Self::Io(_) | Self::Serialization(_) => 500,
        }
    }

    /// Coarse, client-facing description used in partial-failure responses.
    ///
    /// Internal failures are collapsed so driver details never leak to callers.
    pub fn class(&self) -> String {
        match self {
            Self::NotFound(_) => "404 Not Found".to_string(),
            Self::NotAllowed(_) | Self::Auth(_) => "403 Not Allowed".to_string(),
            Self::Malformed(why) => format!("400 Malformed: {}", why),
            _ => "500 Failed to perform operation.".to_string(),
        }
    }
}

impl From<std::io::Error> for HestiaError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for HestiaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HestiaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_strings() {
        assert_eq!(HestiaError::not_found("x").class(), "404 Not Found");
        assert_eq!(HestiaError::not_allowed("x").class(), "403 Not Allowed");
        assert_eq!(
            HestiaError::malformed("bad page").class(),
            "400 Malformed: bad page"
        );
        assert!(HestiaError::Driver("boom".into()).class().starts_with("500"));
    }

    #[test]
    fn test_multi_display() {
        let err = HestiaError::Multi {
            message: "All connections failed to write!".into(),
            errors: vec![
                HestiaError::Driver("a".into()),
                HestiaError::Driver("b".into()),
            ],
        };
        assert_eq!(err.status(), 500);
        assert!(err.to_string().contains("2 errors"));
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(HestiaError::from(io).is_not_found());
    }
}
