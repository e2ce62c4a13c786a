use crate::error::{Error, Result};

/// Descriptor for a supported unstructured algorithm.
///
/// Ids and names are wire-stable: the id is written into every ciphertext
/// header and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Algorithm {
    pub id: u8,
    pub name: &'static str,
    pub key_len: usize,
    pub iv_len: usize,
    pub tag_len: usize,
}

pub const AES_256_GCM: Algorithm = Algorithm {
    id: 0,
    name: "aes-256-gcm",
    key_len: 32,
    iv_len: 12,
    tag_len: 16,
};

static ALGORITHMS: &[Algorithm] = &[AES_256_GCM];

impl Algorithm {
    pub fn by_id(id: u8) -> Result<&'static Algorithm> {
        ALGORITHMS
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::UnsupportedAlgorithm(format!("algorithm id {id}")))
    }

    pub fn by_name(name: &str) -> Result<&'static Algorithm> {
        let lower = name.to_lowercase();
        ALGORITHMS
            .iter()
            .find(|a| a.name == lower)
            .ok_or_else(|| Error::UnsupportedAlgorithm(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_id_and_name() {
        let a = Algorithm::by_id(0).unwrap();
        assert_eq!(a.name, "aes-256-gcm");
        assert_eq!((a.key_len, a.iv_len, a.tag_len), (32, 12, 16));

        let b = Algorithm::by_name("AES-256-GCM").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!(matches!(
            Algorithm::by_id(1),
            Err(Error::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            Algorithm::by_name("aes-128-cbc"),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }
}
