use crate::error::{Error, Result};

/// Current (and only) header version.
pub const VERSION: u8 = 0;

/// Bit 0 of the flags byte: the entire header is authenticated as
/// associated data by the AEAD.
pub const FLAG_AAD: u8 = 0x01;

const FIXED_LEN: usize = 6;

/// Self-describing header prepended to every unstructured ciphertext.
///
/// Layout (big-endian):
///
/// ```text
/// offset 0 : version  (u8)  = 0
/// offset 1 : flags    (u8)  bit0 = header is AAD
/// offset 2 : algo id  (u8)  0 = aes-256-gcm
/// offset 3 : iv len   (u8)
/// offset 4 : key len  (u16)
/// offset 6 : iv       (iv len bytes)
///          : wrapped data key (key len bytes), opaque to the client
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub algorithm: u8,
    pub iv: Vec<u8>,
    pub wrapped_data_key: Vec<u8>,
}

impl Header {
    /// `aad` sets bit 0 of the flags byte, marking the header as AEAD
    /// associated data. The flags byte is clear otherwise.
    pub fn new(algorithm: u8, iv: Vec<u8>, wrapped_data_key: Vec<u8>, aad: bool) -> Self {
        Header {
            version: VERSION,
            flags: if aad { FLAG_AAD } else { 0 },
            algorithm,
            iv,
            wrapped_data_key,
        }
    }

    pub fn aad_enabled(&self) -> bool {
        self.flags & FLAG_AAD != 0
    }

    /// Total serialized length in bytes.
    pub fn serialized_len(&self) -> usize {
        FIXED_LEN + self.iv.len() + self.wrapped_data_key.len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        out.push(self.version);
        out.push(self.flags);
        out.push(self.algorithm);
        out.push(self.iv.len() as u8);
        out.extend_from_slice(&(self.wrapped_data_key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.wrapped_data_key);
        out
    }

    /// Try to parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, and
    /// `Ok(Some((header, consumed)))` once the full header is available.
    /// The version and flags bytes are validated as soon as the fixed
    /// part is present so a corrupt stream fails fast.
    pub fn parse(buf: &[u8]) -> Result<Option<(Header, usize)>> {
        if buf.len() < FIXED_LEN {
            return Ok(None);
        }

        let version = buf[0];
        let flags = buf[1];
        if version != VERSION {
            return Err(Error::InvalidHeader(format!(
                "unknown version {version}"
            )));
        }
        if flags & !FLAG_AAD != 0 {
            return Err(Error::InvalidHeader(format!(
                "reserved flag bits set ({flags:#04x})"
            )));
        }

        let algorithm = buf[2];
        let iv_len = buf[3] as usize;
        let key_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let total = FIXED_LEN + iv_len + key_len;
        if buf.len() < total {
            return Ok(None);
        }

        let iv = buf[FIXED_LEN..FIXED_LEN + iv_len].to_vec();
        let wrapped_data_key = buf[FIXED_LEN + iv_len..total].to_vec();
        Ok(Some((
            Header {
                version,
                flags,
                algorithm,
                iv,
                wrapped_data_key,
            },
            total,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header::new(0, vec![9u8; 12], vec![7u8; 48], false)
    }

    #[test]
    fn round_trip() {
        let hdr = sample();
        let bytes = hdr.serialize();
        assert_eq!(bytes.len(), 6 + 12 + 48);
        // flags byte is zero unless AAD is requested
        assert_eq!(&bytes[..6], &[0, 0, 0, 12, 0, 48]);
        assert!(!hdr.aad_enabled());

        let (parsed, consumed) = Header::parse(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn aad_flag_is_opt_in() {
        let hdr = Header::new(0, vec![9u8; 12], vec![7u8; 48], true);
        assert!(hdr.aad_enabled());
        let bytes = hdr.serialize();
        assert_eq!(bytes[1], FLAG_AAD);

        let (parsed, _) = Header::parse(&bytes).unwrap().unwrap();
        assert!(parsed.aad_enabled());
    }

    #[test]
    fn parse_is_incremental() {
        let bytes = sample().serialize();
        for cut in 0..bytes.len() {
            assert!(Header::parse(&bytes[..cut]).unwrap().is_none());
        }
        assert!(Header::parse(&bytes).unwrap().is_some());

        // trailing ciphertext bytes are left alone
        let mut extended = bytes.clone();
        extended.extend_from_slice(b"ciphertext");
        let (_, consumed) = Header::parse(&extended).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn bad_version_and_flags_are_rejected() {
        let mut bytes = sample().serialize();
        bytes[0] = 1;
        assert!(matches!(
            Header::parse(&bytes),
            Err(Error::InvalidHeader(_))
        ));

        let mut bytes = sample().serialize();
        bytes[1] = 0x82;
        assert!(matches!(
            Header::parse(&bytes),
            Err(Error::InvalidHeader(_))
        ));
    }
}
