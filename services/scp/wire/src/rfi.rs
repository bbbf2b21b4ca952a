//! Remote Function Identifier: the header of every exchange.
//!
//! Text form: `MODE:operation` followed by `#KEY=VALUE&...` when parameters
//! are present.

use crate::error::WireError;
use crate::params::Parameters;
use std::fmt;
use std::str::FromStr;

/// Exchange modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Client subscription handshake
    Subscribe,
    /// Server-originated push to subscribed peers
    Broadcast,
    /// One-shot call with reply
    Reply,
    /// Call followed by further signal/payload round-trips
    Conductor,
    /// Matches every mode (registration only)
    Omni,
}

impl Mode {
    /// Wire name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Subscribe => "SUBSCRIBE",
            Mode::Broadcast => "BROADCAST",
            Mode::Reply => "REPLY",
            Mode::Conductor => "CONDUCTOR",
            Mode::Omni => "OMNI",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBSCRIBE" => Ok(Mode::Subscribe),
            "BROADCAST" => Ok(Mode::Broadcast),
            "REPLY" => Ok(Mode::Reply),
            "CONDUCTOR" => Ok(Mode::Conductor),
            "OMNI" => Ok(Mode::Omni),
            other => Err(WireError::Rfi(format!("unknown mode {:?}", other))),
        }
    }
}

/// Remote Function Identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfi {
    /// Exchange mode
    pub mode: Mode,
    /// `segment.nexus` or bare `nexus`
    pub operation: String,
    /// Ordered parameters
    pub parameters: Parameters,
}

impl Rfi {
    /// Create an RFI without parameters
    pub fn new(mode: Mode, operation: impl Into<String>) -> Self {
        Self {
            mode,
            operation: operation.into(),
            parameters: Parameters::new(),
        }
    }

    /// Replace the parameters
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Get a parameter
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key)
    }

    /// Check that the text form parses back into this RFI.
    ///
    /// The operation must be non-empty and free of `#`; parameters follow
    /// [`Parameters::validate_entry`].
    pub fn validate(&self) -> Result<(), WireError> {
        if self.operation.is_empty() {
            return Err(WireError::Rfi("empty operation".to_string()));
        }
        if self.operation.contains('#') {
            return Err(WireError::Reserved(format!("operation {:?}", self.operation)));
        }
        self.parameters.validate()
    }

    /// Split the operation into `(segment, nexus)` at the first `.`
    pub fn split_operation(&self) -> (Option<&str>, &str) {
        match self.operation.split_once('.') {
            Some((segment, nexus)) => (Some(segment), nexus),
            None => (None, self.operation.as_str()),
        }
    }
}

impl fmt::Display for Rfi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.operation)?;
        if !self.parameters.is_empty() {
            write!(f, "#{}", self.parameters)?;
        }
        Ok(())
    }
}

impl FromStr for Rfi {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, rest) = s
            .split_once(':')
            .ok_or_else(|| WireError::Rfi(format!("missing mode delimiter in {:?}", s)))?;
        let mode: Mode = mode.parse()?;

        let (operation, parameters) = match rest.split_once('#') {
            Some((operation, params)) => (
                operation,
                Parameters::parse(params)
                    .ok_or_else(|| WireError::Rfi(format!("malformed parameters in {:?}", s)))?,
            ),
            None => (rest, Parameters::new()),
        };

        if operation.is_empty() {
            return Err(WireError::Rfi(format!("empty operation in {:?}", s)));
        }

        Ok(Rfi {
            mode,
            operation: operation.to_string(),
            parameters,
        })
    }
}
