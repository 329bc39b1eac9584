//! Runtime configuration for a TSS node.

use std::time::Duration;

/// The TSS protocol identifier this build speaks; keygen and keysign
/// requests must list it among their accepted protocols.
pub const DEFAULT_TSS_PROTOCOL: &str = "tss-ecdsa-secp256k1/0.1";

#[derive(Debug, Clone)]
pub struct TssConfig {
    /// How long we wait for the keygen parties to pass messages along.
    pub key_gen_timeout: Duration,
    /// How long we wait for keysign.
    pub key_sign_timeout: Duration,
    /// How long pre-parameter generation may take.
    pub pre_param_timeout: Duration,
    /// Whether wire reads and writes carry the 40 s deadline. Disabled by
    /// tests running over in-memory or loopback streams.
    pub apply_deadline: bool,
    /// Protocol identifier negotiated for ceremonies on this node.
    pub supported_protocol: String,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            key_gen_timeout: Duration::from_secs(120),
            key_sign_timeout: Duration::from_secs(30),
            pre_param_timeout: Duration::from_secs(300),
            apply_deadline: true,
            supported_protocol: DEFAULT_TSS_PROTOCOL.to_string(),
        }
    }
}
