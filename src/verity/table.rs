//! dm-verity table string.
//!
//! ```text
//! 1 <data_dev> <hash_dev> 4096 4096 <data_blocks> <hash_start_block> sha256 <root_hex> <salt_hex> [opt...]
//! ```

use std::fmt;

use super::VerityError;
use crate::BLOCK_SIZE;

pub const VERITY_TABLE_VERSION: &str = "1";
/// Mandatory space-separated fields.
pub const VERITY_TABLE_ARGS: usize = 10;
pub const VERITY_HASH_ALGORITHM: &str = "sha256";
pub const VERITY_DIGEST_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTable {
    pub data_device:      String,
    pub hash_device:      String,
    pub data_blocks:      u64,
    pub hash_start_block: u64,
    pub root_digest:      [u8; VERITY_DIGEST_SIZE],
    pub salt:             Vec<u8>,
    /// Optional trailing arguments, kept verbatim.
    pub extra:            Vec<String>,
}

fn parse_u64(field: &'static str, token: &str, max: u64) -> Result<u64, VerityError> {
    let value: u64 = token
        .parse()
        .map_err(|_| VerityError::InvalidTable(format!("invalid {field}: {token:?}")))?;
    if value > max {
        return Err(VerityError::InvalidTable(format!("{field} {value} exceeds {max}")));
    }
    Ok(value)
}

impl VerityTable {
    /// Parses a table string.  `max_blocks` bounds `data_blocks` and
    /// `hash_start_block` (the image size in blocks).
    pub fn parse(table: &str, max_blocks: u64) -> Result<Self, VerityError> {
        let table = table.trim_end_matches(['\0', '\n']);
        let tokens: Vec<&str> = table.split(' ').collect();
        if tokens.len() < VERITY_TABLE_ARGS {
            return Err(VerityError::InvalidTable(format!(
                "not enough arguments: {}; expected at least {VERITY_TABLE_ARGS}",
                tokens.len()
            )));
        }
        if tokens[0] != VERITY_TABLE_VERSION {
            return Err(VerityError::InvalidTable(format!("unsupported table version {:?}", tokens[0])));
        }
        let block_size = BLOCK_SIZE.to_string();
        if tokens[3] != block_size || tokens[4] != block_size {
            return Err(VerityError::InvalidTable(format!(
                "unsupported block sizes {} / {}",
                tokens[3], tokens[4]
            )));
        }
        let data_blocks = parse_u64("data block count", tokens[5], max_blocks)?;
        let hash_start_block = parse_u64("hash start block", tokens[6], max_blocks)?;
        if tokens[7] != VERITY_HASH_ALGORITHM {
            return Err(VerityError::UnsupportedAlgorithm(tokens[7].to_string()));
        }

        let mut root_digest = [0u8; VERITY_DIGEST_SIZE];
        hex::decode_to_slice(tokens[8], &mut root_digest)
            .map_err(|e| VerityError::InvalidTable(format!("invalid root digest: {e}")))?;
        let salt = hex::decode(tokens[9]).map_err(|e| VerityError::InvalidTable(format!("invalid salt: {e}")))?;

        Ok(Self {
            data_device: tokens[1].to_string(),
            hash_device: tokens[2].to_string(),
            data_blocks,
            hash_start_block,
            root_digest,
            salt,
            extra: tokens[VERITY_TABLE_ARGS..].iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Decodes and parses raw table bytes as stored in the metadata block.
    /// Returns the decoded text along with the table.
    pub fn from_bytes(bytes: &[u8], max_blocks: u64) -> Result<(String, Self), VerityError> {
        let text = std::str::from_utf8(bytes).map_err(|_| VerityError::NotUtf8)?;
        Ok((text.to_string(), Self::parse(text, max_blocks)?))
    }

    pub fn hash_start(&self) -> u64 {
        self.hash_start_block * BLOCK_SIZE
    }

    pub fn data_size(&self) -> u64 {
        self.data_blocks * BLOCK_SIZE
    }
}

impl fmt::Display for VerityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{VERITY_TABLE_VERSION} {} {} {BLOCK_SIZE} {BLOCK_SIZE} {} {} {VERITY_HASH_ALGORITHM} {} {}",
            self.data_device,
            self.hash_device,
            self.data_blocks,
            self.hash_start_block,
            hex::encode(self.root_digest),
            hex::encode(&self.salt),
        )?;
        for arg in &self.extra {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
