//! Request identity, correlation and status types.
//!
//! A request is created by the issuing side with a [`RequestId`] and is later
//! picked up by an external processor that assigns it a [`CorrelationId`].
//! Until that happens the request is [`GateState::Uncorrelated`] and any status
//! change aimed at it has to wait.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing one of the identifier or status types fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The correlation id was empty.
    #[error("Correlation id cannot be empty")]
    EmptyCorrelationId,

    /// The request id was not an integer.
    #[error("Invalid request id: {0}")]
    InvalidRequestId(String),

    /// The status name is not one of the known statuses.
    #[error("Unknown request status: {0}")]
    UnknownStatus(String),
}

/// Unique identifier of a request, issued monotonically by the creating side.
///
/// # Examples
///
/// ```
/// use failsafe_core::request::RequestId;
///
/// let id = RequestId::new(7);
/// assert_eq!(id.value(), 7);
/// assert_eq!(id.next(), RequestId::new(8));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(i64);

impl RequestId {
    /// The first id handed out when no request exists yet.
    pub const FIRST: Self = Self(1);

    /// Create a new `RequestId`.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw id.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// The id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|_| ParseError::InvalidRequestId(s.to_string()))
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Opaque identifier assigned by the external processor.
///
/// There is no "empty" correlation id: an unassigned correlation is modelled as
/// `Option::<CorrelationId>::None`, so the sentinel can never be mistaken for a
/// real value.
///
/// # Validation
///
/// - `FromStr::from_str()` rejects empty strings (use for external input)
/// - `new()` does not validate (use for trusted, application-generated values)
///
/// # Examples
///
/// ```
/// use failsafe_core::request::CorrelationId;
///
/// let id: CorrelationId = "abc".parse().unwrap();
/// assert_eq!(id.as_str(), "abc");
/// assert!("".parse::<CorrelationId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new `CorrelationId` without validation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random correlation id (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the correlation id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::EmptyCorrelationId);
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Just created.
    #[default]
    New,
    /// Work has started.
    Started,
    /// Waiting on something external.
    Pending,
    /// Blocked until more information arrives.
    MoreInformationNeeded,
    /// Done.
    Completed,
    /// Paused by an operator.
    OnHold,
}

impl RequestStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::New,
        Self::Started,
        Self::Pending,
        Self::MoreInformationNeeded,
        Self::Completed,
        Self::OnHold,
    ];

    /// Stable storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Pending => "pending",
            Self::MoreInformationNeeded => "more_information_needed",
            Self::Completed => "completed",
            Self::OnHold => "on_hold",
        }
    }

    /// Parse from the storage representation.
    ///
    /// Also accepts the `PascalCase` variant names used on the HTTP surface.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnknownStatus`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s {
            "new" | "New" => Ok(Self::New),
            "started" | "Started" => Ok(Self::Started),
            "pending" | "Pending" => Ok(Self::Pending),
            "more_information_needed" | "MoreInformationNeeded" => {
                Ok(Self::MoreInformationNeeded)
            },
            "completed" | "Completed" => Ok(Self::Completed),
            "on_hold" | "OnHold" => Ok(Self::OnHold),
            _ => Err(ParseError::UnknownStatus(s.to_string())),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Whether status changes for a request may be applied yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    /// No correlation id has been assigned; status changes are deferred.
    Uncorrelated,
    /// A correlation id is assigned. There is no way back to `Uncorrelated`.
    Correlated,
}

/// A request as recorded by the [`RequestRegistry`](crate::registry::RequestRegistry).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-assigned unique id.
    pub id: RequestId,
    /// Assigned by the external processor; `None` until then.
    pub correlation_id: Option<CorrelationId>,
    /// Current status. Only changed through the gate's apply path.
    pub status: RequestStatus,
}

impl Request {
    /// A freshly created request: status `New`, no correlation.
    #[must_use]
    pub const fn new(id: RequestId) -> Self {
        Self {
            id,
            correlation_id: None,
            status: RequestStatus::New,
        }
    }

    /// Current gate state derived from the correlation id.
    #[must_use]
    pub const fn gate_state(&self) -> GateState {
        if self.correlation_id.is_some() {
            GateState::Correlated
        } else {
            GateState::Uncorrelated
        }
    }
}
