use crate::PeripheralIdentity;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),

    #[error("no bluetooth adapter at index {index}")]
    AdapterNotFound { index: usize },

    #[error("peripheral {0} has not been seen by the radio")]
    UnknownPeripheral(PeripheralIdentity),

    /// The session actor has stopped and no longer accepts commands.
    #[error("session is closed")]
    SessionClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
