use thiserror::Error;

/// Failures that decide how the run ends. Everything else travels as a plain `eyre::Report`.
#[derive(Debug, Error)]
pub enum BoostError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{tool} failed with exit code {}", code.map_or_else(|| "none (terminated by signal)".to_owned(), |c| c.to_string()))]
    ExternalTool { tool: String, code: Option<i32> },

    #[error("Unexpected result from {tool}: {detail}")]
    MalformedOutput { tool: String, detail: String },

    #[error("No tier accepted or split frames [{start}:{end}]. This is a bug in the segmenter")]
    SegmentationExhausted { start: u32, end: u32 },
}

impl BoostError {
    pub fn config(message: impl Into<String>) -> Self {
        BoostError::Config(message.into())
    }

    pub fn malformed(tool: &str, detail: impl Into<String>) -> Self {
        BoostError::MalformedOutput {
            tool: tool.to_owned(),
            detail: detail.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            BoostError::Config(_) => 2,
            BoostError::ExternalTool { .. } | BoostError::MalformedOutput { .. } => 3,
            BoostError::SegmentationExhausted { .. } => 70,
        }
    }
}

/// Exit code for a report bubbling out of `main`.
pub fn exit_code(report: &eyre::Report) -> i32 {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<BoostError>())
        .map_or(1, BoostError::exit_code)
}
