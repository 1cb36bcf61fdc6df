use thiserror::Error;

/// Failures reported to callers of [`crate::broker::Broker`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The shutdown token fired. Terminal: every later send fails the same way.
    #[error("broker shut down")]
    ShutDown,

    /// `run` was invoked on a broker whose dispatch loop was already started.
    #[error("broker dispatch loop already started")]
    AlreadyStarted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ingress capacity must be greater than zero")]
    ZeroCapacity,
}

/// Raised by a mailbox whose receiving half has been dropped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("mailbox receiver is closed")]
    Closed,
}
