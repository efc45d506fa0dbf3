use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// Stable machine-readable outcome of an engine operation. The string form
/// never changes; human messages may.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    InvalidAmount,
    InvalidMaxBid,
    LotNotActive,
    AuctionClosed,
    BidTooLow,
    SelfOutbid,
    OutbidByProxy,
    MaxBidTied,
    TransientConflict,
    NoBuyNow,
    NotFound,
    NotActive,
    NotClosed,
    AlreadyGenerated,
    InvalidCsv,
    Unauthorized,
    Forbidden,
    Conflict,
    Internal,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::InvalidAmount => "INVALID_AMOUNT",
            ResultCode::InvalidMaxBid => "INVALID_MAX_BID",
            ResultCode::LotNotActive => "LOT_NOT_ACTIVE",
            ResultCode::AuctionClosed => "AUCTION_CLOSED",
            ResultCode::BidTooLow => "BID_TOO_LOW",
            ResultCode::SelfOutbid => "SELF_OUTBID",
            ResultCode::OutbidByProxy => "OUTBID_BY_PROXY",
            ResultCode::MaxBidTied => "MAX_BID_TIED",
            ResultCode::TransientConflict => "TRANSIENT_CONFLICT",
            ResultCode::NoBuyNow => "NO_BUY_NOW",
            ResultCode::NotFound => "NOT_FOUND",
            ResultCode::NotActive => "NOT_ACTIVE",
            ResultCode::NotClosed => "NOT_CLOSED",
            ResultCode::AlreadyGenerated => "ALREADY_GENERATED",
            ResultCode::InvalidCsv => "INVALID_CSV",
            ResultCode::Unauthorized => "UNAUTHORIZED",
            ResultCode::Forbidden => "FORBIDDEN",
            ResultCode::Conflict => "CONFLICT",
            ResultCode::Internal => "INTERNAL",
        }
    }

    /// HTTP status hint for transport adapters.
    pub fn http_status(self) -> u16 {
        match self {
            ResultCode::Ok => 200,
            ResultCode::InvalidAmount
            | ResultCode::InvalidMaxBid
            | ResultCode::InvalidCsv
            | ResultCode::LotNotActive
            | ResultCode::AuctionClosed
            | ResultCode::BidTooLow
            | ResultCode::SelfOutbid
            | ResultCode::MaxBidTied
            | ResultCode::NoBuyNow
            | ResultCode::NotActive
            | ResultCode::NotClosed
            | ResultCode::AlreadyGenerated => 400,
            ResultCode::Unauthorized => 401,
            ResultCode::Forbidden => 403,
            ResultCode::NotFound => 404,
            ResultCode::OutbidByProxy | ResultCode::Conflict => 409,
            ResultCode::Internal => 500,
            ResultCode::TransientConflict => 503,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The request was well-formed but refused by auction rules. The refusal
    /// has already been written to the audit log where one applies.
    #[error("{message}")]
    Rejected { code: ResultCode, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An internal invariant did not hold. Logged at error level by callers;
    /// no auto-recovery is attempted.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn rejected(code: ResultCode, message: impl Into<String>) -> Self {
        EngineError::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ResultCode {
        match self {
            EngineError::Rejected { code, .. } => *code,
            EngineError::Store(StoreError::NotFound(_)) => ResultCode::NotFound,
            EngineError::Store(StoreError::Conflict(_)) => ResultCode::Conflict,
            EngineError::Store(StoreError::Aborted) => ResultCode::TransientConflict,
            EngineError::Invariant(_) => ResultCode::Internal,
        }
    }
}
