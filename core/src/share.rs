//! The `Share` type and the Stratum reserved error codes for `mining.submit`.

/// Reserved Stratum error codes used in `mining.submit` responses
/// (`[code, message, null]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumErrorCode {
    Other = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficultyShare = 23,
    UnauthorizedWorker = 24,
}

impl StratumErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn message(self) -> &'static str {
        match self {
            StratumErrorCode::Other => "Other",
            StratumErrorCode::JobNotFound => "Job not found",
            StratumErrorCode::DuplicateShare => "Duplicate share",
            StratumErrorCode::LowDifficultyShare => "Low difficulty share",
            StratumErrorCode::UnauthorizedWorker => "Unauthorized worker",
        }
    }
}

/// The three-valued outcome of validating a share, as returned by the
/// Share Validator.
#[derive(Debug, Clone)]
pub enum ShareOutcome {
    Invalid(StratumErrorCode),
    ValidShare,
    /// Also a valid block: carries the assembled block hex ready to submit
    /// upstream, plus the result hash `getblock` can confirm it under.
    ValidBlock { block_hex: String, block_hash_hex: String },
}

impl ShareOutcome {
    pub fn is_valid(&self) -> bool {
        !matches!(self, ShareOutcome::Invalid(_))
    }

    pub fn is_block(&self) -> bool {
        matches!(self, ShareOutcome::ValidBlock { .. })
    }
}

/// One `mining.submit` in flight: the claim plus the validator's findings.
#[derive(Debug, Clone)]
pub struct Share {
    pub worker_name: String,
    pub job_id: String,
    pub nonce_hex: String,
    pub header_hash_hex: String,
    pub mix_hash_hex: String,
    /// Filled in by the validator once KawPoW verification runs.
    pub result_hash_hex: Option<String>,
    /// `diff1 / result_hash`, the share's implied difficulty.
    pub share_diff: Option<f64>,
}
