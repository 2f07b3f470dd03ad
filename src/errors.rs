// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Common `Error` and `Result` types used throughout the library and application. Serves as a reference for all that can go wrong.
use crate::config::ConfigError;
use crate::manager::LifecycleState;
use std::collections::TryReserveError;
use thiserror::Error;

/// Per-packet header inspection failures. Every variant names the layer that was short.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("link header too short: {available} bytes, need more than {needed}")]
    LinkHeaderTooShort { needed: usize, available: usize },

    #[error("IPv4 header too short: {available} bytes, need {needed}")]
    Ipv4HeaderTooShort { needed: usize, available: usize },

    #[error("IPv6 header too short: {available} bytes, need {needed}")]
    Ipv6HeaderTooShort { needed: usize, available: usize },

    #[error("IPv6 fragment extension header too short: {available} bytes, need {needed}")]
    Ipv6FragmentHeaderTooShort { needed: usize, available: usize },

    #[error("network layer mismatch: ethertype announces IPv{expected}, header says IPv{found}")]
    NetworkLayerMismatch { expected: u8, found: u8 },
}

impl DetectError {
    /// Label used for the `kind` dimension of the detect error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectError::LinkHeaderTooShort { .. } => "link_too_short",
            DetectError::Ipv4HeaderTooShort { .. } => "ipv4_too_short",
            DetectError::Ipv6HeaderTooShort { .. } => "ipv6_too_short",
            DetectError::Ipv6FragmentHeaderTooShort { .. } => "ipv6_frag_too_short",
            DetectError::NetworkLayerMismatch { .. } => "network_layer_mismatch",
        }
    }

    pub const KINDS: [&'static str; 5] = [
        "link_too_short",
        "ipv4_too_short",
        "ipv6_too_short",
        "ipv6_frag_too_short",
        "network_layer_mismatch",
    ];
}

/// Failures while rebuilding a complete datagram from a finished group.
#[derive(Error, Debug)]
pub enum ReassembleError {
    #[error("group {0} has no terminal fragment header")]
    MissingTerminal(String),

    #[error("header serialize failed: {0}")]
    HeaderSerialize(String),

    #[error("scratch buffer grow failed: {0}")]
    BufferGrow(#[from] TryReserveError),

    #[error("fragments do not tile the payload: expected offset {expected}, found {found}")]
    InconsistentLayout { expected: usize, found: usize },

    #[error("reassembled packet failed to parse: {0}")]
    Reparse(String),
}

impl ReassembleError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReassembleError::MissingTerminal(_) => "missing_terminal",
            ReassembleError::HeaderSerialize(_) => "header_serialize",
            ReassembleError::BufferGrow(_) => "buffer_grow",
            ReassembleError::InconsistentLayout { .. } => "inconsistent_layout",
            ReassembleError::Reparse(_) => "reparse",
        }
    }

    pub const KINDS: [&'static str; 5] = [
        "missing_terminal",
        "header_serialize",
        "buffer_grow",
        "inconsistent_layout",
        "reparse",
    ];
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] ConfigError),

    #[error("detect error: {0}")]
    Detect(#[from] DetectError),

    #[error("reassembly error: {0}")]
    Reassemble(#[from] ReassembleError),

    #[error("no valid pick fragment type")]
    NoValidFragmentType,

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("manager not started, current state is {0}")]
    NotStarted(LifecycleState),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
