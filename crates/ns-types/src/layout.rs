use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{ConfigError, NsError, NsResult};

/// Activation applied to the output of a dense layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
    Softmax,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Softmax => "softmax",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "softmax" => Ok(Activation::Softmax),
            _ => Err(ConfigError::UnknownName {
                kind: "activation".to_string(),
                name: s.to_string(),
            }
            .into()),
        }
    }
}

/// Input/output shape contract a model must satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub input_size: usize,
    pub output_size: usize,
    pub output_activation: Activation,
}

impl Layout {
    pub fn new(
        input_size: usize,
        output_size: usize,
        output_activation: Activation,
    ) -> NsResult<Self> {
        let layout = Self {
            input_size,
            output_size,
            output_activation,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Convenience constructor taking the activation by name (e.g. "softmax").
    pub fn with_activation_name(
        input_size: usize,
        output_size: usize,
        output_activation: &str,
    ) -> NsResult<Self> {
        Self::new(input_size, output_size, output_activation.parse()?)
    }

    /// Checks both sizes are positive. Deserialized layouts skip `new`, so
    /// config loading calls this explicitly.
    pub fn validate(&self) -> NsResult<()> {
        if self.input_size == 0 {
            return Err(crate::layout_error!("input_size must be positive"));
        }
        if self.output_size == 0 {
            return Err(crate::layout_error!("output_size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_creation() {
        let layout = Layout::with_activation_name(1000, 46, "softmax").unwrap();
        assert_eq!(layout.input_size, 1000);
        assert_eq!(layout.output_size, 46);
        assert_eq!(layout.output_activation, Activation::Softmax);
    }

    #[test]
    fn test_layout_rejects_zero_sizes() {
        assert!(Layout::new(0, 2, Activation::Softmax).unwrap_err().is_config());
        assert!(Layout::new(10, 0, Activation::Sigmoid).unwrap_err().is_config());
    }

    #[test]
    fn test_activation_names() {
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!(Activation::Tanh.to_string(), "tanh");
        assert!("swish".parse::<Activation>().is_err());

        let json = serde_json::to_string(&Activation::Softmax).unwrap();
        assert_eq!(json, "\"softmax\"");
    }
}
