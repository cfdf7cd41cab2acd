use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeEngineError {
    #[error("Invalid configuration: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Division by zero in {context}")]
    DivisionByZero { context: String },

    #[error("Formula syntax error at position {position}: {reason}")]
    FormulaSyntax { position: usize, reason: String },

    #[error("Formula evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Runtime failures raised while evaluating an already-parsed formula.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("variable '{name}' is not bound")]
    MissingVariable { name: String },

    #[error("division by zero in '{expression}'")]
    DivisionByZero { expression: String },

    #[error("arithmetic overflow in {operation}")]
    Overflow { operation: String },
}

impl FeeEngineError {
    /// Shorthand for the most common error in the engine.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FeeEngineError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Taxonomy name surfaced to callers that report rejected calculations.
    pub fn category(&self) -> &'static str {
        match self {
            FeeEngineError::Config { .. } | FeeEngineError::DivisionByZero { .. } => "ConfigError",
            FeeEngineError::FormulaSyntax { .. } => "FormulaSyntaxError",
            FeeEngineError::Evaluation(_) => "EvaluationError",
            FeeEngineError::Serialization(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for FeeEngineError {
    fn from(e: serde_json::Error) -> Self {
        FeeEngineError::Serialization(e.to_string())
    }
}
