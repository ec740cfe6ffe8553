//! Declared purpose of an inbound request.

use std::fmt;

/// Discriminated `msg_intention` of a request.
///
/// The four CRUD names are matched exactly against their upper-case wire
/// form. Anything else is preserved verbatim in `Other`, and an absent field
/// becomes `Missing`. Neither of the last two is an error: both are routed to
/// the generic `any` channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Intention {
    Create,
    Read,
    Update,
    Delete,
    Other(String),
    Missing,
}

impl Intention {
    pub const CREATE: &'static str = "CREATE";
    pub const READ: &'static str = "READ";
    pub const UPDATE: &'static str = "UPDATE";
    pub const DELETE: &'static str = "DELETE";

    /// Classifies the raw `msg_intention` value.
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some(Self::CREATE) => Self::Create,
            Some(Self::READ) => Self::Read,
            Some(Self::UPDATE) => Self::Update,
            Some(Self::DELETE) => Self::Delete,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Missing,
        }
    }

    /// Returns the wire string echoed back in replies.
    ///
    /// `Missing` renders as the empty string so replies always carry a
    /// string-typed `msg_intention`.
    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Create => Self::CREATE,
            Self::Read => Self::READ,
            Self::Update => Self::UPDATE,
            Self::Delete => Self::DELETE,
            Self::Other(raw) => raw,
            Self::Missing => "",
        }
    }

    /// Whether this is one of the four CRUD intentions.
    #[must_use]
    pub fn is_crud(&self) -> bool {
        matches!(self, Self::Create | Self::Read | Self::Update | Self::Delete)
    }
}

impl fmt::Display for Intention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("<missing>"),
            other => f.write_str(other.as_wire()),
        }
    }
}
