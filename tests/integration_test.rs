use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tempfile::NamedTempFile;
use verity_fec::avb::VBMETA_FLAG_HASHTREE_DISABLED;
use verity_fec::image::{ImageBuilder, ImageOptions};
use verity_fec::interleave::fec_trailer_size;
use verity_fec::io_stream::encoder::{EncodeOptions, FecEncoder};
use verity_fec::io_stream::{FecError, FecHandle, Mode, OpenOptions};
use verity_fec::verity::{build_metadata, VerityTable, RSA_SIGNATURE_SIZE};
use verity_fec::{recovery, Flags, HashTreeBuilder, MetadataFormat, BLOCK_SIZE};

const BS: usize = BLOCK_SIZE as usize;
const MIB: usize = 1024 * 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect()
}

fn temp_with(bytes: &[u8]) -> NamedTempFile {
    let f = NamedTempFile::new().unwrap();
    fs::write(f.path(), bytes).unwrap();
    f
}

fn encoded_file(data: &[u8], roots: u8) -> NamedTempFile {
    let f = temp_with(data);
    let mut file = fs::OpenOptions::new().read(true).write(true).open(f.path()).unwrap();
    FecEncoder::new(EncodeOptions { roots }).unwrap().append_trailer(&mut file).unwrap();
    f
}

fn verity_image(data: &[u8], options: ImageOptions) -> NamedTempFile {
    let f = temp_with(data);
    ImageBuilder::new(options).unwrap().build_file(f.path()).unwrap();
    f
}

fn corrupt(path: &Path, offset: usize, len: usize) {
    let mut bytes = fs::read(path).unwrap();
    for b in &mut bytes[offset..offset + len] {
        *b = !*b;
    }
    fs::write(path, bytes).unwrap();
}

// ── FEC only ─────────────────────────────────────────────────────────────────

#[test]
fn single_byte_corruption_in_one_mib_image_is_corrected() {
    let data = pattern(MIB);
    let image = encoded_file(&data, 2);
    corrupt(image.path(), 77 * BS + 123, 1);

    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let mut block = vec![0u8; BS];
    assert_eq!(h.pread(&mut block, 77 * BLOCK_SIZE).unwrap(), BS);
    assert_eq!(block, &data[77 * BS..78 * BS]);
    assert_eq!(h.get_status().unwrap().errors, 1);
}

#[test]
fn clean_round_trip_reports_no_errors() {
    let data = pattern(MIB + 3 * BS);
    let image = encoded_file(&data, 2);

    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let mut out = Vec::new();
    h.read_to_end(&mut out).unwrap();
    assert_eq!(out, data);

    let status = h.get_status().unwrap();
    assert_eq!(status.errors, 0);
    assert_eq!(status.data_size, data.len() as u64);
    assert_eq!(status.size, fs::metadata(image.path()).unwrap().len());
    assert!(h.get_ecc_metadata().unwrap().unwrap().valid);
}

#[test]
fn trailer_size_matches_written_bytes() {
    for (blocks, roots) in [(1usize, 2u8), (253, 2), (254, 2), (300, 24)] {
        let data = pattern(blocks * BS);
        let image = encoded_file(&data, roots);
        let written = fs::metadata(image.path()).unwrap().len() - data.len() as u64;
        assert_eq!(written, fec_trailer_size(data.len() as u64, roots).unwrap(), "{blocks} blocks, {roots} roots");
    }
}

#[test]
fn image_without_trailer_reads_raw() {
    let data = pattern(64 * BS + 100);
    let image = temp_with(&data);

    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    assert!(h.get_ecc_metadata().unwrap().is_none());
    let mut out = vec![0u8; data.len()];
    assert_eq!(h.pread(&mut out, 0).unwrap(), data.len());
    assert_eq!(out, data);

    let strict = OpenOptions::new().flags(Flags::REQUIRE_ECC);
    match FecHandle::open(image.path(), strict) {
        Err(FecError::MalformedTrailer(_)) => {}
        other => panic!("expected a malformed trailer, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn backup_header_is_used_when_primary_is_damaged() {
    let data = pattern(300 * BS);
    let image = encoded_file(&data, 2);
    let size = fs::metadata(image.path()).unwrap().len() as usize;
    corrupt(image.path(), size - BS, 8);

    let h = FecHandle::open(image.path(), OpenOptions::new().flags(Flags::REQUIRE_ECC)).unwrap();
    let ecc = h.get_ecc_metadata().unwrap().unwrap();
    assert_eq!(ecc.blocks, 300);
    assert_eq!(ecc.start, data.len() as u64);

    // Both copies gone.
    corrupt(image.path(), size - 60, 8);
    match FecHandle::open(image.path(), OpenOptions::new().flags(Flags::REQUIRE_ECC)) {
        Err(FecError::MalformedTrailer(_)) => {}
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[test]
fn damaged_parity_is_flagged_but_still_used() {
    let data = pattern(64 * BS);
    let image = encoded_file(&data, 4);
    corrupt(image.path(), data.len() + 17, 1);
    corrupt(image.path(), 3 * BS, 1);

    let mut h = FecHandle::open(image.path(), OpenOptions::new().roots(4)).unwrap();
    assert!(!h.get_ecc_metadata().unwrap().unwrap().valid);
    let mut out = vec![0u8; data.len()];
    h.pread(&mut out, 0).unwrap();
    assert_eq!(out, data);
}

#[test]
fn read_write_mode_writes_corrections_back() {
    let data = pattern(100 * BS);
    let image = encoded_file(&data, 2);
    corrupt(image.path(), 42 * BS + 9, 1);
    {
        let mut h = FecHandle::open(image.path(), OpenOptions::new().mode(Mode::ReadWrite)).unwrap();
        let mut out = vec![0u8; data.len()];
        h.pread(&mut out, 0).unwrap();
        h.close().unwrap();
    }
    assert_eq!(&fs::read(image.path()).unwrap()[..data.len()], data.as_slice());
}

#[test]
fn std_read_and_seek_follow_the_cursor() {
    let data = pattern(10 * BS);
    let image = encoded_file(&data, 2);
    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();

    assert_eq!(Seek::seek(&mut h, SeekFrom::Start(5000)).unwrap(), 5000);
    let mut buf = [0u8; 10_000];
    assert_eq!(Read::read(&mut h, &mut buf).unwrap(), 10_000);
    assert_eq!(&buf[..], &data[5000..15_000]);
    assert_eq!(h.position(), 15_000);

    assert_eq!(Seek::seek(&mut h, SeekFrom::End(100)).unwrap(), data.len() as u64);
    assert!(Seek::seek(&mut h, SeekFrom::Current(-(data.len() as i64) - 1)).is_err());

    h.close().unwrap();
    assert!(matches!(h.read(&mut buf), Err(FecError::Closed)));
}

#[test]
fn inplace_repair_fixes_the_image() {
    let data = pattern(600 * BS);
    let image = encoded_file(&data, 8);
    let pristine = fs::read(image.path()).unwrap();
    corrupt(image.path(), 5 * BS, 3);
    corrupt(image.path(), 333 * BS + 4000, 2);

    let report = recovery::repair_file(image.path(), OpenOptions::new().roots(8)).unwrap();
    assert_eq!(report.uncorrectable_rounds, 0);
    assert_eq!(report.corrected_blocks, 2);
    assert_eq!(fs::read(image.path()).unwrap(), pristine);

    let again = recovery::scan_file(image.path(), OpenOptions::new().roots(8)).unwrap();
    assert_eq!(again.healthy_rounds, again.total_rounds);
}

// ── Verity + FEC ─────────────────────────────────────────────────────────────

#[test]
fn verity_image_corrects_a_destroyed_block() {
    let data = pattern(300 * BS);
    let image = verity_image(&data, ImageOptions::default());
    corrupt(image.path(), 123 * BS, BS);

    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    assert!(h.get_verity_metadata().unwrap().is_present());
    let mut out = vec![0u8; data.len()];
    assert_eq!(h.pread(&mut out, 0).unwrap(), data.len());
    assert_eq!(out, data);
    assert_eq!(h.get_status().unwrap().errors, 1);
}

#[test]
fn erasures_recover_two_blocks_in_one_codeword_group() {
    let data = pattern(300 * BS);
    let image = verity_image(&data, ImageOptions::default());
    let rounds = FecHandle::open(image.path(), OpenOptions::new())
        .unwrap()
        .get_ecc_metadata()
        .unwrap()
        .unwrap()
        .rounds as usize;
    // Rows of the same round: two errors per codeword, beyond plain decoding
    // with two roots.
    corrupt(image.path(), 10 * BS, BS);
    corrupt(image.path(), (10 + rounds) * BS, BS);

    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let mut out = vec![0u8; BS];
    h.pread(&mut out, 10 * BLOCK_SIZE).unwrap();
    assert_eq!(out, &data[10 * BS..11 * BS]);
    h.pread(&mut out, ((10 + rounds) * BS) as u64).unwrap();
    assert_eq!(out, &data[(10 + rounds) * BS..(11 + rounds) * BS]);
    assert_eq!(h.get_status().unwrap().errors, 2);
}

#[test]
fn too_much_damage_is_reported_not_returned() {
    let data = pattern(300 * BS);
    let image = verity_image(&data, ImageOptions::default());
    let rounds = FecHandle::open(image.path(), OpenOptions::new())
        .unwrap()
        .get_ecc_metadata()
        .unwrap()
        .unwrap()
        .rounds as usize;
    for row in 0..3 {
        corrupt(image.path(), (20 + row * rounds) * BS, BS);
    }

    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let mut out = vec![0u8; BS];
    match h.pread(&mut out, 20 * BLOCK_SIZE) {
        Err(FecError::UncorrectableBlock { offset }) => assert_eq!(offset, 20 * BLOCK_SIZE),
        other => panic!("expected an uncorrectable block, got {other:?}"),
    }
    // Undamaged blocks elsewhere still read.
    h.pread(&mut out, 21 * BLOCK_SIZE).unwrap();
    assert_eq!(out, &data[21 * BS..22 * BS]);
}

#[test]
fn damaged_hash_tree_is_repaired_at_open() {
    let data = pattern(300 * BS);
    let image = verity_image(&data, ImageOptions::default());
    let layout = ImageBuilder::new(ImageOptions::default()).unwrap().layout(data.len() as u64).unwrap();
    // Last leaf page of the tree.
    corrupt(image.path(), (layout.hash_offset + layout.hash_size) as usize - BS + 5, 1);

    let mut h = FecHandle::open(image.path(), OpenOptions::new().mode(Mode::ReadWrite)).unwrap();
    assert!(h.get_verity_metadata().unwrap().is_present());
    assert_eq!(h.get_status().unwrap().errors, 1);
    let mut out = vec![0u8; data.len()];
    h.pread(&mut out, 0).unwrap();
    assert_eq!(out, data);
    h.close().unwrap();

    let h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    assert_eq!(h.get_status().unwrap().errors, 0);
}

#[test]
fn verity_disable_flag_skips_metadata() {
    let data = pattern(20 * BS);
    let image = verity_image(&data, ImageOptions::default());
    let h = FecHandle::open(image.path(), OpenOptions::new().flags(Flags::VERITY_DISABLE)).unwrap();
    let verity = h.get_verity_metadata().unwrap();
    assert!(verity.disabled);
    assert!(!verity.is_present());
    // Without verity the readable area is everything the parity covers.
    let layout = ImageBuilder::new(ImageOptions::default()).unwrap().layout(data.len() as u64).unwrap();
    assert_eq!(h.get_status().unwrap().data_size, layout.fec_offset);
}

#[test]
fn explicit_verity_offset_is_the_only_candidate() {
    let data = pattern(20 * BS);
    let image = verity_image(&data, ImageOptions::default());

    let right = FecHandle::open(image.path(), OpenOptions::new().verity_offset(data.len() as u64)).unwrap();
    assert!(right.get_verity_metadata().unwrap().is_present());

    let wrong = FecHandle::open(image.path(), OpenOptions::new().verity_offset(BLOCK_SIZE)).unwrap();
    assert!(!wrong.get_verity_metadata().unwrap().is_present());
}

#[test]
fn signature_is_checked_by_the_caller_verifier() {
    let data = pattern(16 * BS);
    let signature = [0xA5u8; RSA_SIGNATURE_SIZE];
    let image = verity_image(&data, ImageOptions { signature: Some(signature), ..Default::default() });
    let h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let table = h.get_verity_metadata().unwrap().table.clone();

    let accept = move |sig: &[u8; RSA_SIGNATURE_SIZE], msg: &[u8]| sig == &signature && msg == table.as_bytes();
    h.verify_signature(&accept).unwrap();

    let reject = |_: &[u8; RSA_SIGNATURE_SIZE], _: &[u8]| false;
    assert!(matches!(h.verify_signature(&reject), Err(FecError::SignatureInvalid)));
}

#[test]
fn verity_can_be_toggled_in_place() {
    let data = pattern(16 * BS);
    let image = verity_image(&data, ImageOptions::default());
    {
        let mut h = FecHandle::open(image.path(), OpenOptions::new().mode(Mode::ReadWrite)).unwrap();
        assert!(!h.get_verity_metadata().unwrap().disabled);
        h.set_verity_status(false).unwrap();
        h.close().unwrap();
    }
    let h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let verity = h.get_verity_metadata().unwrap();
    assert!(verity.is_present());
    assert!(verity.disabled);

    let mut ro = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    assert!(matches!(ro.set_verity_status(true), Err(FecError::ContractViolation(_))));
}

#[test]
fn metadata_as_json() {
    let data = pattern(8 * BS);
    let image = verity_image(&data, ImageOptions::default());
    let h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let json = serde_json::json!({
        "status": h.get_status().unwrap(),
        "ecc": h.get_ecc_metadata().unwrap(),
        "verity": h.get_verity_metadata().unwrap(),
    });
    assert_eq!(json["status"]["mode"], "read-only");
    assert_eq!(json["ecc"]["roots"], 2);
    assert_eq!(json["verity"]["data_size"], 8 * BLOCK_SIZE);
    assert_eq!(json["verity"]["metadata_start"], 8 * BLOCK_SIZE);
}

#[test]
fn verity_rechecks_blocks_the_decoder_cannot_fix_alone() {
    let data = pattern(300 * BS);
    let image = verity_image(&data, ImageOptions::default());
    let rounds = FecHandle::open(image.path(), OpenOptions::new())
        .unwrap()
        .get_ecc_metadata()
        .unwrap()
        .unwrap()
        .rounds as usize;
    // One flipped byte in two rows of the same round: codeword 100 of that
    // round holds two errors, more than two roots can correct blind.
    corrupt(image.path(), 30 * BS + 100, 1);
    corrupt(image.path(), (30 + rounds) * BS + 100, 1);

    let mut h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    let mut out = vec![0u8; data.len()];
    assert_eq!(h.pread(&mut out, 0).unwrap(), data.len());
    assert_eq!(out, data);
    assert_eq!(h.get_status().unwrap().errors, 2);
}

// ── Filesystem superblock candidates ─────────────────────────────────────────

const FS_BLOCKS: u64 = 64;

fn ext4_superblock(data: &mut [u8], blocks: u32) {
    let sb = &mut data[1024..2048];
    sb[0x04..0x08].copy_from_slice(&blocks.to_le_bytes());
    // 4 KiB blocks.
    sb[0x18..0x1c].copy_from_slice(&2u32.to_le_bytes());
    sb[0x38..0x3a].copy_from_slice(&0xEF53u16.to_le_bytes());
    sb[0x60..0x64].fill(0);
}

fn squashfs_superblock(data: &mut [u8], bytes_used: u64) {
    data[..96].fill(0);
    data[0..4].copy_from_slice(&0x7371_7368u32.to_le_bytes());
    data[28..30].copy_from_slice(&4u16.to_le_bytes());
    data[40..48].copy_from_slice(&bytes_used.to_le_bytes());
}

/// `[fs data][metadata][tree][3 zero blocks]` with no FEC trailer.  The
/// padding keeps the end-of-area and size-law candidates off the metadata,
/// so only the superblock can find it.
fn filesystem_image(data: &[u8]) -> NamedTempFile {
    let salt = [0x3cu8; 32];
    let mut tree: HashTreeBuilder = HashTreeBuilder::new(BS).unwrap();
    tree.initialize(data.len() as u64, &salt).unwrap();
    tree.update(data).unwrap();
    tree.build().unwrap();
    let tree_bytes = tree.tree_bytes().unwrap();
    assert_eq!(tree_bytes.len(), BS);

    let metadata_blocks = 8;
    let table = VerityTable {
        data_device:      "/dev/block/vdb".into(),
        hash_device:      "/dev/block/vdb".into(),
        data_blocks:      FS_BLOCKS,
        hash_start_block: FS_BLOCKS + metadata_blocks,
        root_digest:      tree.root_hash().unwrap().try_into().unwrap(),
        salt:             salt.to_vec(),
        extra:            Vec::new(),
    };
    let mut image = data.to_vec();
    image.extend_from_slice(&build_metadata(&table, None, false).unwrap());
    image.extend_from_slice(&tree_bytes);
    image.resize(image.len() + 3 * BS, 0);
    temp_with(&image)
}

fn assert_verity_at_fs_end(image: &Path, flags: Flags, data: &[u8]) {
    let mut h = FecHandle::open(image, OpenOptions::new().flags(flags)).unwrap();
    assert!(h.get_ecc_metadata().unwrap().is_none());
    let verity = h.get_verity_metadata().unwrap();
    assert!(verity.is_present(), "{flags:?}");
    assert_eq!(verity.metadata_start, FS_BLOCKS * BLOCK_SIZE);
    assert_eq!(h.get_status().unwrap().data_size, FS_BLOCKS * BLOCK_SIZE);
    let mut out = vec![0u8; data.len()];
    h.pread(&mut out, 0).unwrap();
    assert_eq!(out, data);
}

fn assert_no_verity(image: &Path, flags: Flags) {
    let h = FecHandle::open(image, OpenOptions::new().flags(flags)).unwrap();
    assert!(!h.get_verity_metadata().unwrap().is_present(), "{flags:?}");
}

#[test]
fn ext4_superblock_locates_verity_metadata() {
    let mut data = pattern(FS_BLOCKS as usize * BS);
    ext4_superblock(&mut data, FS_BLOCKS as u32);
    let image = filesystem_image(&data);

    assert_verity_at_fs_end(image.path(), Flags::EXT4, &data);
    assert_verity_at_fs_end(image.path(), Flags::empty(), &data);
    assert_verity_at_fs_end(image.path(), Flags::EXT4 | Flags::SQUASH, &data);
    // Only the squashfs superblock is looked at.
    assert_no_verity(image.path(), Flags::SQUASH);
}

#[test]
fn squashfs_superblock_locates_verity_metadata() {
    let mut data = pattern(FS_BLOCKS as usize * BS);
    // bytes_used is padded up to the next block.
    squashfs_superblock(&mut data, FS_BLOCKS * BLOCK_SIZE - 100);
    let image = filesystem_image(&data);

    assert_verity_at_fs_end(image.path(), Flags::SQUASH, &data);
    assert_verity_at_fs_end(image.path(), Flags::empty(), &data);
    assert_no_verity(image.path(), Flags::EXT4);
}

#[test]
fn superblock_size_that_misses_the_metadata_finds_nothing() {
    let mut data = pattern(FS_BLOCKS as usize * BS);
    ext4_superblock(&mut data, FS_BLOCKS as u32 - 4);
    let image = filesystem_image(&data);
    assert_no_verity(image.path(), Flags::EXT4);
    assert_no_verity(image.path(), Flags::empty());

    // No superblock at all.
    let data = pattern(FS_BLOCKS as usize * BS);
    let image = filesystem_image(&data);
    assert_no_verity(image.path(), Flags::EXT4 | Flags::SQUASH);
}

// ── AVB ──────────────────────────────────────────────────────────────────────

struct AvbLayout {
    image_size:    u64,
    fec_offset:    u64,
    vbmeta_offset: u64,
}

fn hashtree_descriptor(layout: &AvbLayout, roots: u32, fec_size: u64, salt: &[u8], root: &[u8]) -> Vec<u8> {
    let name = b"vendor";
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_be_bytes());
    body.extend_from_slice(&layout.image_size.to_be_bytes());
    body.extend_from_slice(&layout.image_size.to_be_bytes()); // tree_offset
    body.extend_from_slice(&(layout.fec_offset - layout.image_size).to_be_bytes()); // tree_size
    body.extend_from_slice(&4096u32.to_be_bytes());
    body.extend_from_slice(&4096u32.to_be_bytes());
    body.extend_from_slice(&roots.to_be_bytes());
    body.extend_from_slice(&layout.fec_offset.to_be_bytes());
    body.extend_from_slice(&fec_size.to_be_bytes());
    let mut algorithm = [0u8; 32];
    algorithm[..6].copy_from_slice(b"sha256");
    body.extend_from_slice(&algorithm);
    body.extend_from_slice(&(name.len() as u32).to_be_bytes());
    body.extend_from_slice(&(salt.len() as u32).to_be_bytes());
    body.extend_from_slice(&(root.len() as u32).to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // flags
    body.resize(164, 0);
    body.extend_from_slice(name);
    body.extend_from_slice(salt);
    body.extend_from_slice(root);
    body.resize((body.len() + 7) / 8 * 8, 0);

    let mut desc = Vec::new();
    desc.extend_from_slice(&1u64.to_be_bytes());
    desc.extend_from_slice(&(body.len() as u64).to_be_bytes());
    desc.extend_from_slice(&body);
    desc
}

/// Unsigned vbmeta (algorithm 0) carrying one descriptor.
fn vbmeta(descriptor: &[u8], flags: u32) -> Vec<u8> {
    let mut header = vec![0u8; 256];
    header[..4].copy_from_slice(b"AVB0");
    header[4..8].copy_from_slice(&1u32.to_be_bytes());
    header[20..28].copy_from_slice(&(descriptor.len() as u64).to_be_bytes()); // aux size
    header[104..112].copy_from_slice(&(descriptor.len() as u64).to_be_bytes()); // descriptors size
    header[120..124].copy_from_slice(&flags.to_be_bytes());
    [header, descriptor.to_vec()].concat()
}

/// `[data][tree][parity + FEC header block][vbmeta][padding, footer]` as
/// avbtool lays out a partition.
fn avb_image(data: &[u8], roots: u8, flags: u32) -> (NamedTempFile, AvbLayout) {
    let salt = [0x5cu8; 32];
    let mut tree: HashTreeBuilder = HashTreeBuilder::new(BS).unwrap();
    tree.initialize(data.len() as u64, &salt).unwrap();
    tree.update(data).unwrap();
    tree.build().unwrap();

    let mut image = data.to_vec();
    image.extend_from_slice(&tree.tree_bytes().unwrap());
    let fec = FecEncoder::new(EncodeOptions { roots }).unwrap().encode_bytes(&image).unwrap();
    let layout = AvbLayout {
        image_size:    data.len() as u64,
        fec_offset:    image.len() as u64,
        vbmeta_offset: (image.len() + fec.len()) as u64,
    };
    image.extend_from_slice(&fec);

    let desc = hashtree_descriptor(&layout, u32::from(roots), fec.len() as u64, &salt, tree.root_hash().unwrap());
    let vbmeta = vbmeta(&desc, flags);
    image.extend_from_slice(&vbmeta);
    image.resize(image.len() + 2 * BS - vbmeta.len(), 0);

    let mut footer = [0u8; 64];
    footer[..4].copy_from_slice(b"AVBf");
    footer[4..8].copy_from_slice(&1u32.to_be_bytes());
    footer[12..20].copy_from_slice(&layout.image_size.to_be_bytes());
    footer[20..28].copy_from_slice(&layout.vbmeta_offset.to_be_bytes());
    footer[28..36].copy_from_slice(&(vbmeta.len() as u64).to_be_bytes());
    let end = image.len();
    image[end - 64..].copy_from_slice(&footer);
    (temp_with(&image), layout)
}

#[test]
fn avb_footer_supplies_tree_and_fec_locations() {
    let data = pattern(40 * BS);
    let (image, layout) = avb_image(&data, 4, 0);
    corrupt(image.path(), 7 * BS, BS);

    // The default of two roots is overridden by the descriptor.
    let mut h = FecHandle::open(image.path(), OpenOptions::new().flags(Flags::REQUIRE_ECC)).unwrap();
    let avb = h.get_avb_metadata().unwrap().unwrap();
    assert_eq!(avb.hashtree.partition_name, "vendor");
    assert_eq!(avb.footer.vbmeta_offset, layout.vbmeta_offset);

    let ecc = h.get_ecc_metadata().unwrap().unwrap();
    assert!(ecc.valid);
    assert_eq!(ecc.roots, 4);
    assert_eq!(ecc.start, layout.fec_offset);

    let verity = h.get_verity_metadata().unwrap();
    assert!(verity.is_present());
    assert!(!verity.disabled);
    assert_eq!(verity.format, MetadataFormat::Avb);
    assert_eq!(verity.metadata_start, layout.vbmeta_offset);
    assert_eq!(h.get_status().unwrap().data_size, layout.image_size);

    let mut out = vec![0u8; data.len()];
    assert_eq!(h.pread(&mut out, 0).unwrap(), data.len());
    assert_eq!(out, data);
    assert_eq!(h.get_status().unwrap().errors, 1);

    let accept = |_: &[u8; RSA_SIGNATURE_SIZE], _: &[u8]| true;
    assert!(matches!(h.verify_signature(&accept), Err(FecError::ContractViolation(_))));
}

#[test]
fn avb_hashtree_disabled_flag_is_reported() {
    let data = pattern(20 * BS);
    let (image, _) = avb_image(&data, 2, VBMETA_FLAG_HASHTREE_DISABLED);
    let mut h = FecHandle::open(image.path(), OpenOptions::new().mode(Mode::ReadWrite)).unwrap();
    let verity = h.get_verity_metadata().unwrap();
    assert!(verity.is_present());
    assert!(verity.disabled);
    assert!(matches!(h.set_verity_status(true), Err(FecError::ContractViolation(_))));
}

#[test]
fn avb_without_verity_parsing_exposes_the_protected_area() {
    let data = pattern(20 * BS);
    let (image, layout) = avb_image(&data, 2, 0);
    let h = FecHandle::open(image.path(), OpenOptions::new().flags(Flags::VERITY_DISABLE)).unwrap();
    assert!(!h.get_verity_metadata().unwrap().is_present());
    assert_eq!(h.get_ecc_metadata().unwrap().unwrap().roots, 2);
    assert_eq!(h.get_status().unwrap().data_size, layout.fec_offset);
}

#[test]
fn broken_vbmeta_leaves_a_plain_image() {
    let data = pattern(20 * BS);
    let (image, layout) = avb_image(&data, 2, 0);
    corrupt(image.path(), layout.vbmeta_offset as usize, 4);

    let h = FecHandle::open(image.path(), OpenOptions::new()).unwrap();
    assert!(h.get_avb_metadata().unwrap().is_none());
    assert!(h.get_ecc_metadata().unwrap().is_none());
    assert!(!h.get_verity_metadata().unwrap().is_present());
    assert_eq!(h.get_status().unwrap().data_size, fs::metadata(image.path()).unwrap().len());
}
