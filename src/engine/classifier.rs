//! Exchange error classification.
//!
//! Maps a raw `ExchangeError` to the signal it represents and the retry
//! class that signal implies. Exchange-specific numeric codes are data:
//! each venue has a code table, extendable from config, consulted before
//! the HTTP status and finally the message text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::exchange::ExchangeError;

/// What to do about a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Abort. Retrying cannot help.
    Permanent,
    /// Wait, then repeat the same call.
    TransientRetry,
    /// Change the request (quantity precision), then repeat.
    AdjustAndRetry,
}

/// The condition an exchange error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSignal {
    /// Invalid API key, bad signature, missing permission.
    InvalidCredentials,
    /// Unknown, suspended or delisted symbol.
    UnknownSymbol,
    InsufficientBalance,
    RateLimited,
    ClockSkew,
    /// Quantity precision or lot-size violation.
    QuantityPrecision,
    /// Timeout, connection reset, 5xx.
    Network,
    Unrecognized,
}

impl ErrorSignal {
    pub const ALL: &'static [ErrorSignal] = &[
        ErrorSignal::InvalidCredentials,
        ErrorSignal::UnknownSymbol,
        ErrorSignal::InsufficientBalance,
        ErrorSignal::RateLimited,
        ErrorSignal::ClockSkew,
        ErrorSignal::QuantityPrecision,
        ErrorSignal::Network,
        ErrorSignal::Unrecognized,
    ];

    pub fn class(self) -> ErrorClass {
        match self {
            ErrorSignal::InvalidCredentials
            | ErrorSignal::UnknownSymbol
            | ErrorSignal::InsufficientBalance => ErrorClass::Permanent,
            ErrorSignal::RateLimited
            | ErrorSignal::ClockSkew
            | ErrorSignal::Network
            | ErrorSignal::Unrecognized => ErrorClass::TransientRetry,
            ErrorSignal::QuantityPrecision => ErrorClass::AdjustAndRetry,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorSignal::InvalidCredentials => "invalid credentials",
            ErrorSignal::UnknownSymbol => "unknown symbol",
            ErrorSignal::InsufficientBalance => "insufficient balance",
            ErrorSignal::RateLimited => "rate limit",
            ErrorSignal::ClockSkew => "clock skew",
            ErrorSignal::QuantityPrecision => "quantity precision",
            ErrorSignal::Network => "network",
            ErrorSignal::Unrecognized => "unrecognized error",
        }
    }
}

impl fmt::Display for ErrorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of classifying one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub signal: ErrorSignal,
    pub class: ErrorClass,
}

impl Classification {
    /// Retries this error may consume out of `max_retries`.
    ///
    /// Permanent errors get none; unrecognized ones one fewer than the max.
    pub fn retry_budget(&self, max_retries: u32) -> u32 {
        match (self.class, self.signal) {
            (ErrorClass::Permanent, _) => 0,
            (_, ErrorSignal::Unrecognized) => max_retries.saturating_sub(1),
            _ => max_retries,
        }
    }
}

impl From<ErrorSignal> for Classification {
    fn from(signal: ErrorSignal) -> Self {
        Self {
            signal,
            class: signal.class(),
        }
    }
}

/// One extra (exchange, code) → signal mapping, as read from `[[error_codes]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCodeMapping {
    pub exchange: String,
    pub code: i64,
    pub signal: ErrorSignal,
}

const BINANCE_CODES: &[(i64, ErrorSignal)] = &[
    (-2015, ErrorSignal::InvalidCredentials),
    (-2014, ErrorSignal::InvalidCredentials),
    (-2008, ErrorSignal::InvalidCredentials),
    (-1022, ErrorSignal::InvalidCredentials),
    (-1121, ErrorSignal::UnknownSymbol),
    (-2010, ErrorSignal::InsufficientBalance),
    (-1003, ErrorSignal::RateLimited),
    (-1015, ErrorSignal::RateLimited),
    (-1021, ErrorSignal::ClockSkew),
    (-1013, ErrorSignal::QuantityPrecision),
    (-1111, ErrorSignal::QuantityPrecision),
    (-1001, ErrorSignal::Network),
    (-1007, ErrorSignal::Network),
];

const BYBIT_CODES: &[(i64, ErrorSignal)] = &[
    (10003, ErrorSignal::InvalidCredentials),
    (10004, ErrorSignal::InvalidCredentials),
    (10005, ErrorSignal::InvalidCredentials),
    (170121, ErrorSignal::UnknownSymbol),
    (170131, ErrorSignal::InsufficientBalance),
    (10006, ErrorSignal::RateLimited),
    (10002, ErrorSignal::ClockSkew),
    (170137, ErrorSignal::QuantityPrecision),
    (10016, ErrorSignal::Network),
];

const OKX_CODES: &[(i64, ErrorSignal)] = &[
    (50111, ErrorSignal::InvalidCredentials),
    (50113, ErrorSignal::InvalidCredentials),
    (51001, ErrorSignal::UnknownSymbol),
    (51008, ErrorSignal::InsufficientBalance),
    (50011, ErrorSignal::RateLimited),
    (50102, ErrorSignal::ClockSkew),
    (51121, ErrorSignal::QuantityPrecision),
    (50001, ErrorSignal::Network),
    (50013, ErrorSignal::Network),
];

/// Message fragments per signal, checked in this order.
const MESSAGE_PATTERNS: &[(ErrorSignal, &[&str])] = &[
    (
        ErrorSignal::InvalidCredentials,
        &["invalid api", "api-key", "api key", "signature", "permission", "unauthorized", "forbidden"],
    ),
    (
        ErrorSignal::UnknownSymbol,
        &["invalid symbol", "unknown symbol", "symbol not", "suspended", "delisted", "not supported"],
    ),
    (
        ErrorSignal::InsufficientBalance,
        &["insufficient", "not enough balance", "balance not enough"],
    ),
    (
        ErrorSignal::RateLimited,
        &["rate limit", "too many requests", "too many orders", "request weight"],
    ),
    (
        ErrorSignal::ClockSkew,
        &["timestamp", "recvwindow", "clock", "time skew"],
    ),
    (
        ErrorSignal::QuantityPrecision,
        &["lot_size", "lot size", "precision", "step size", "stepsize", "too many decimal", "invalid quantity"],
    ),
    (
        ErrorSignal::Network,
        &[
            "timeout",
            "timed out",
            "connection",
            "reset by peer",
            "network",
            "service unavailable",
            "bad gateway",
            "internal server error",
        ],
    ),
];

/// Total function from exchange errors to classifications.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    codes: HashMap<(String, i64), ErrorSignal>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let mut codes = HashMap::new();
        for (exchange, table) in [("binance", BINANCE_CODES), ("bybit", BYBIT_CODES), ("okx", OKX_CODES)] {
            for (code, signal) in table {
                codes.insert((exchange.to_string(), *code), *signal);
            }
        }
        Self { codes }
    }
}

impl ErrorClassifier {
    /// Built-in code tables plus `extra` mappings; extras override defaults.
    pub fn with_mappings(extra: &[ErrorCodeMapping]) -> Self {
        let mut classifier = Self::default();
        for m in extra {
            classifier
                .codes
                .insert((m.exchange.to_lowercase(), m.code), m.signal);
        }
        classifier
    }

    pub fn classify(&self, err: &ExchangeError) -> Classification {
        if let Some(code) = err.code {
            if let Some(signal) = self.codes.get(&(err.exchange.to_lowercase(), code)) {
                return (*signal).into();
            }
        }
        if let Some(signal) = err.http_status.and_then(Self::from_status) {
            return signal.into();
        }
        Self::from_message(&err.message).into()
    }

    fn from_status(status: u16) -> Option<ErrorSignal> {
        match status {
            401 | 403 => Some(ErrorSignal::InvalidCredentials),
            418 | 429 => Some(ErrorSignal::RateLimited),
            408 | 500..=599 => Some(ErrorSignal::Network),
            _ => None,
        }
    }

    /// Classify by message text alone. Never fails: anything unmatched is
    /// `Unrecognized`.
    pub fn from_message(message: &str) -> ErrorSignal {
        let lower = message.to_lowercase();
        MESSAGE_PATTERNS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
            .map(|(signal, _)| *signal)
            .unwrap_or(ErrorSignal::Unrecognized)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
