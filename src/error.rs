use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// The file exists but doesn't look like one of ours
    #[error("Not a coral-db file: bad magic or wrong size")]
    InvalidFileFormat,
    /// `create` refused to clobber an existing database
    #[error("Database directory already contains a database")]
    DirectoryExists,
    /// Strict update/remove on a key that isn't there
    #[error("Key not found")]
    KeyNotFound,
    /// Strict insert on a key that is already there
    #[error("Key already exists")]
    KeyAlreadyExists,
    #[error("Key length {0} exceeds the maximum of {max}", max = crate::MAX_KEY_LEN)]
    KeyTooLong(usize),
    #[error("Value of {0} bytes exceeds the maximum object size")]
    ValueTooLarge(usize),
    /// Asked for a plain value where a subtree is stored
    #[error("Entry holds a subtree, not a value")]
    SubtreeRequired,
    /// Asked for a subtree where a plain value is stored
    #[error("Entry holds a value, not a subtree")]
    SubtreeForbidden,
    /// A blocking buffer wait was woken for shutdown
    #[error("Blocking operation interrupted")]
    Interrupted,
    /// A backing file cannot grow any further
    #[error("Out of space: cannot allocate past 0x{0:x} blocks")]
    OutOfSpace(usize),
    #[error("Address 0x{0:x} was never allocated")]
    IndexOutOfRange(u32),
    /// Couldn't lock the database directory for exclusive use
    #[error("Failed to lock the database directory for exclusive use")]
    Lock(#[source] std::io::Error),
    #[error("I/O error on the backing files")]
    Io(#[from] std::io::Error),
    /// A structural invariant failed a runtime check
    #[error("Corruption detected: {0}")]
    Corrupt(&'static str),
}

impl From<coral_nodes::Error> for DbError {
    fn from(e: coral_nodes::Error) -> Self {
        match e {
            coral_nodes::Error::Corrupt(s) => Self::Corrupt(s),
            // node-level space exhaustion surfacing here means the kernel
            // mis-sized an allocation
            coral_nodes::Error::OutOfSpace(_) => Self::Corrupt("node allocation undersized"),
            _ => Self::Corrupt("unknown node error"),
        }
    }
}
