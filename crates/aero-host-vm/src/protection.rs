use core::fmt;

/// Page protection requested from the host.
///
/// The portable set is deliberately small; each `sys` backend translates it into its native flag
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    ReadWrite,
    ReadOnly,
    NoAccess,
    ReadWriteExecute,
    ReadExecute,
}

impl Protection {
    pub fn is_readable(self) -> bool {
        !matches!(self, Protection::NoAccess)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ReadWriteExecute)
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Protection::ReadWriteExecute | Protection::ReadExecute)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.is_readable() { 'r' } else { '-' };
        let w = if self.is_writable() { 'w' } else { '-' };
        let x = if self.is_executable() { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}
