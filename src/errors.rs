/// Domain-specific error types for the forecasting engine.
/// Environmental failures (sources, missing history) are distinguished from
/// invariant violations, which always fail the request:
/// - `DataUnavailable` is recovered by the engine with the configured prior
/// - `Source` fails the request, retries belong to the caller
/// - weight/shape/time/price violations indicate a logic defect
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient history for {asset}: {available} usable samples, need {required}")]
    DataUnavailable {
        asset: String,
        available: usize,
        required: usize,
    },

    #[error("source error: {0}")]
    Source(String),

    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    #[error("pool exhausted for {variant}: need {needed} paths, have {available}")]
    PoolExhausted {
        variant: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("non-monotonic time: {0}")]
    NonMonotonicTime(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable reason code handed back to the request-handling layer.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::DataUnavailable { .. } => "DATA_UNAVAILABLE",
            Self::Source(_) => "SOURCE_ERROR",
            Self::InvalidWeights(_) => "INVALID_WEIGHTS",
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Self::ShapeMismatch(_) => "SHAPE_MISMATCH",
            Self::NonMonotonicTime(_) => "NON_MONOTONIC_TIME",
            Self::InvalidPrice(_) => "INVALID_PRICE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<crate::feeds::FeedError> for EngineError {
    fn from(e: crate::feeds::FeedError) -> Self {
        EngineError::Source(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
