use serde::Deserialize;

/// One formatting rule attached to a dataset. `value` is a string for
/// passthrough rules and a character count for prefix/suffix rules.
#[derive(Debug, Clone, Deserialize)]
pub struct PassthroughRule {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
    pub priority: i64,
}

/// A dataset (FFS) definition as served by the KMS. Unknown fields are
/// ignored so the server can grow the schema.
#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    pub name: String,
    /// Only `FF1` is supported.
    pub encryption_algorithm: String,
    pub input_character_set: String,
    pub output_character_set: String,
    /// Legacy passthrough characters; synthesized into a rule when no
    /// explicit passthrough rule is present.
    #[serde(default)]
    pub passthrough: String,
    #[serde(default)]
    pub passthrough_rules: Vec<PassthroughRule>,
    /// Base64 of the dataset tweak.
    pub tweak: String,
    pub tweak_min_len: usize,
    pub tweak_max_len: usize,
    /// Bits of the first output character reserved for the key number.
    pub msb_encoding_bits: u32,
    pub min_input_length: usize,
    pub max_input_length: usize,
}
