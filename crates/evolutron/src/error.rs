use std::error::Error;
use std::fmt;

/// Error kinds raised by the encoders, readers, network builder and handle parser.
///
/// Public functions return `anyhow::Result`; callers that need to branch on the
/// kind can `downcast_ref::<EvolutronError>()` the returned error.
#[derive(Debug, Clone, PartialEq)]
pub enum EvolutronError {
    /// Invalid or unparseable hyperparameters.
    Configuration(String),
    /// Malformed input records.
    Format(String),
    /// A symbol with no entry in the alphabet table.
    Decode { symbol: char, position: usize },
    /// Malformed artifact path.
    Parse(String),
}

impl EvolutronError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        EvolutronError::Configuration(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        EvolutronError::Format(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        EvolutronError::Parse(msg.into())
    }
}

impl fmt::Display for EvolutronError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EvolutronError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            EvolutronError::Format(msg) => write!(f, "Format error: {}", msg),
            EvolutronError::Decode { symbol, position } => write!(
                f,
                "Decode error: symbol {:?} at position {} is not in the alphabet",
                symbol, position
            ),
            EvolutronError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl Error for EvolutronError {}

/// Returns the crate error carried by an `anyhow::Error`, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<&EvolutronError> {
    err.downcast_ref::<EvolutronError>()
}
