// =========================================================================
// Identity Types (User/Group)
// =========================================================================

use std::fmt;

/// A system user to run the daemon as, by name or numeric uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum User {
    Name(String),
    Id(u32),
}

/// A system group to run the daemon as, by name or numeric gid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    Name(String),
    Id(u32),
}

impl From<&str> for User {
    fn from(s: &str) -> Self {
        User::Name(s.to_owned())
    }
}
impl From<String> for User {
    fn from(s: String) -> Self {
        User::Name(s)
    }
}
impl From<u32> for User {
    fn from(id: u32) -> Self {
        User::Id(id)
    }
}

impl From<&str> for Group {
    fn from(s: &str) -> Self {
        Group::Name(s.to_owned())
    }
}
impl From<String> for Group {
    fn from(s: String) -> Self {
        Group::Name(s)
    }
}
impl From<u32> for Group {
    fn from(id: u32) -> Self {
        Group::Id(id)
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            User::Name(name) => write!(f, "user '{name}'"),
            User::Id(id) => write!(f, "uid {id}"),
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Name(name) => write!(f, "group '{name}'"),
            Group::Id(id) => write!(f, "gid {id}"),
        }
    }
}
