use thiserror::Error;

/// Every failure the training core can report. None of them are retried, a
/// run that hits one of these aborts.
#[derive(Error, Debug)]
pub enum DtpError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no inverse registered for layer kind `{0}`")]
    UnsupportedLayerKind(String),
    #[error("shape mismatch at {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(
        "backward network does not recover the input shape: expected {expected:?}, got {actual:?}"
    )]
    BackwardNetworkMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
    #[error("invalid tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// The three error families a caller has to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorCategory {
    Configuration,
    ShapeMismatch,
    InternalConsistency,
}

impl DtpError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DtpError::Configuration(_) | DtpError::UnsupportedLayerKind(_) => {
                ErrorCategory::Configuration
            }
            DtpError::ShapeMismatch { .. }
            | DtpError::BackwardNetworkMismatch { .. }
            | DtpError::Shape(_) => ErrorCategory::ShapeMismatch,
            DtpError::InternalConsistency(_) => ErrorCategory::InternalConsistency,
        }
    }

    pub fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        DtpError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Prefixes the location of a shape mismatch with the layer that raised it.
    pub fn at(self, location: impl std::fmt::Display) -> Self {
        match self {
            DtpError::ShapeMismatch { context, expected, actual } => DtpError::ShapeMismatch {
                context: format!("{location}: {context}"),
                expected,
                actual,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DtpError>;

#[test]
fn test_category() {
    let e = DtpError::shape("Linear input", &[3], &[4]).at("forward layer 2");
    assert_eq!(e.category(), ErrorCategory::ShapeMismatch);
    assert_eq!(
        e.to_string(),
        "shape mismatch at forward layer 2: Linear input: expected [3], got [4]"
    );
    assert_eq!(
        DtpError::UnsupportedLayerKind("Foo".into()).category(),
        ErrorCategory::Configuration
    );
}
