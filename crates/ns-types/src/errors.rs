use thiserror::Error;

/// Main error type for the architecture search core
#[derive(Error, Debug)]
pub enum NsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NsError {
    /// True for errors raised while validating configuration, before any
    /// training happened.
    pub fn is_config(&self) -> bool {
        matches!(self, NsError::Config(_))
    }
}

/// Configuration errors. Raised at construction/build time, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid stopping condition: {message}")]
    InvalidStopping { message: String },

    #[error("Missing parameter: {category}.{name}")]
    MissingParameter { category: String, name: String },

    #[error("Invalid parameter {category}.{name}: {message}")]
    InvalidParameter {
        category: String,
        name: String,
        message: String,
    },

    #[error("Invalid layout: {message}")]
    InvalidLayout { message: String },

    #[error("Blueprint does not match layout: {message}")]
    LayoutMismatch { message: String },

    #[error("Invalid blueprint: {message}")]
    InvalidBlueprint { message: String },

    #[error("Invalid training configuration: {message}")]
    InvalidTraining { message: String },

    #[error("Unknown {kind}: {name}")]
    UnknownName { kind: String, name: String },

    #[error("Unsupported device: {device}")]
    UnsupportedDevice { device: String },

    #[error("Invalid experiment: {message}")]
    InvalidExperiment { message: String },
}

/// Failures surfaced while fitting or evaluating a model. The core
/// propagates these without interpreting them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("Training diverged at epoch {epoch}: loss is {loss}")]
    Diverged { epoch: usize, loss: f64 },

    #[error("No data: {message}")]
    EmptyData { message: String },

    #[error("Shape mismatch: expected {expected} values, got {actual} ({context})")]
    ShapeMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },

    #[error("Thread pool error: {message}")]
    ThreadPool { message: String },
}

/// Result type alias for search core operations
pub type NsResult<T> = Result<T, NsError>;

/// Macro for creating invalid-layout configuration errors
#[macro_export]
macro_rules! layout_error {
    ($($arg:tt)*) => {
        $crate::NsError::Config($crate::ConfigError::InvalidLayout {
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating invalid-blueprint configuration errors
#[macro_export]
macro_rules! blueprint_error {
    ($($arg:tt)*) => {
        $crate::NsError::Config($crate::ConfigError::InvalidBlueprint {
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating invalid-training configuration errors
#[macro_export]
macro_rules! training_config_error {
    ($($arg:tt)*) => {
        $crate::NsError::Config($crate::ConfigError::InvalidTraining {
            message: format!($($arg)*),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::MissingParameter {
            category: "layout".to_string(),
            name: "rows".to_string(),
        };
        assert_eq!(error.to_string(), "Missing parameter: layout.rows");

        let error = TrainingError::Diverged {
            epoch: 3,
            loss: f64::NAN,
        };
        assert!(error.to_string().contains("epoch 3"));
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::InvalidStopping {
            message: "test".to_string(),
        };
        let ns_error: NsError = config_error.into();
        assert!(ns_error.is_config());

        let training_error: NsError = TrainingError::EmptyData {
            message: "no samples".to_string(),
        }
        .into();
        match training_error {
            NsError::Training(_) => (),
            _ => panic!("Expected Training error"),
        }
    }

    #[test]
    fn test_macros() {
        let layout_err = layout_error!("input_size must be positive, got {}", 0);
        assert!(layout_err.to_string().contains("input_size"));
        let blueprint_err = blueprint_error!("row {} is empty", 2);
        assert!(blueprint_err.is_config());
        let training_err = training_config_error!("batch_size must be positive");
        assert!(training_err.to_string().contains("batch_size"));
    }
}
