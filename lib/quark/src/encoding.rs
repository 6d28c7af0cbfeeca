/// Serde helpers for Base64-encoded binary fields in configuration files.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(data)
    }

    pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&encode(data.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        decode(&raw).map_err(de::Error::custom)
    }

    /// Deserializes a Base64 string into a fixed 32-byte key.
    pub fn deserialize_key32<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let decoded = decode(&raw).map_err(de::Error::custom)?;

        if decoded.len() != 32 {
            return Err(de::Error::custom(format!(
                "expected 32 byte key, got {} bytes",
                decoded.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Ok(key)
    }
}
