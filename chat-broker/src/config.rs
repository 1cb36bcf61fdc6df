use crate::error::ConfigError;

/// Capacity of the shared ingress queue when none is configured.
pub const DEFAULT_INGRESS_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Messages that may wait for dispatch before `send_message` blocks.
    pub ingress_capacity: usize,
}

impl BrokerConfig {
    pub fn with_ingress_capacity(ingress_capacity: usize) -> Self {
        Self { ingress_capacity }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingress_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
        }
    }
}
