use serde::{de::DeserializeOwned, Serialize};

/// Encode an arbitrary serializable value into a vec.
///
/// Wire payloads are all owned data, so encoding cannot fail.
pub fn encode<T: Serialize>(val: &T) -> Vec<u8> {
    rmp_serde::encode::to_vec_named(val).expect("failed to encode value")
}

/// Decode an arbitrary value from a slice of bytes.
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}
