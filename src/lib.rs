pub mod interleave;
pub mod header;
pub mod codec;
pub mod hashtree;
pub mod verity;
pub mod superblock;
pub mod io_stream;
pub mod recovery;
pub mod image;
pub mod avb;

/// Size of every data, hash-tree and parity block.
pub const BLOCK_SIZE: u64 = 4096;
/// Parity symbols per codeword used when the caller does not pick one.
pub const DEFAULT_ROOTS: u8 = 2;

bitflags::bitflags! {
    /// Open-time hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// Read an ext4 superblock when looking for verity metadata.
        const EXT4           = 1 << 0;
        /// Read a squashfs superblock when looking for verity metadata.
        const SQUASH         = 1 << 1;
        /// Skip verity metadata parsing entirely.
        const VERITY_DISABLE = 1 << 8;
        /// Fail the open instead of downgrading when the FEC trailer is missing or malformed.
        const REQUIRE_ECC    = 1 << 9;
    }
}

pub use interleave::{fec_trailer_size, interleave, Geometry};
pub use header::{FecHeader, HeaderError};
pub use codec::{get_codec, Codec, CodecError, ReedSolomon};
pub use hashtree::{HashTreeBuilder, HashTreeError};
pub use verity::{MetadataFormat, SignatureVerifier, VerityError, VerityMetadata};
pub use io_stream::{EccMetadata, FecError, FecHandle, FecStatus, Mode, OpenOptions};
pub use io_stream::encoder::{EncodeOptions, FecEncoder};
pub use recovery::{RecoveryQuality, RecoveryReport, RoundHealth};
pub use image::{BuiltImage, ImageBuilder, ImageLayout, ImageOptions};
pub use avb::{AvbError, AvbFooter, AvbImage, HashtreeDescriptor};
