use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use verity_fec::hashtree::HashTreeBuilder;
use verity_fec::image::{ImageBuilder, ImageOptions};
use verity_fec::interleave::checked_fec_trailer_size;
use verity_fec::io_stream::encoder::{EncodeOptions, FecEncoder};
use verity_fec::io_stream::{FecHandle, Mode, OpenOptions};
use verity_fec::recovery;
use verity_fec::verity::VERITY_METADATA_SIZE;
use verity_fec::codec::MAX_ROOTS;
use verity_fec::{Flags, BLOCK_SIZE, DEFAULT_ROOTS};

#[derive(Parser)]
#[command(name = "vfec", about = "Verity hash trees and Reed-Solomon FEC for block images")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ReadArgs {
    /// Parity bytes per codeword the image was encoded with
    #[arg(short, long, default_value_t = DEFAULT_ROOTS, value_parser = roots_parser())]
    roots: u8,
    /// Fail instead of reading raw data when the FEC trailer is unusable
    #[arg(long)]
    require_ecc: bool,
    /// Skip verity metadata
    #[arg(long)]
    no_verity: bool,
    /// Byte offset of the verity metadata
    #[arg(long)]
    verity_offset: Option<u64>,
    /// Look for an ext4 superblock when locating verity metadata
    #[arg(long)]
    ext4: bool,
    /// Look for a squashfs superblock when locating verity metadata
    #[arg(long)]
    squash: bool,
}

impl ReadArgs {
    fn options(&self, mode: Mode) -> OpenOptions {
        let mut flags = Flags::empty();
        flags.set(Flags::REQUIRE_ECC, self.require_ecc);
        flags.set(Flags::VERITY_DISABLE, self.no_verity);
        flags.set(Flags::EXT4, self.ext4);
        flags.set(Flags::SQUASH, self.squash);
        let opts = OpenOptions::new().mode(mode).flags(flags).roots(self.roots);
        match self.verity_offset {
            Some(offset) => opts.verity_offset(offset),
            None => opts,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Append an FEC trailer to a block-aligned image
    Encode {
        input: PathBuf,
        /// Write the trailer to this file instead of appending it
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, default_value_t = DEFAULT_ROOTS, value_parser = roots_parser())]
        roots: u8,
    },
    /// Verify an image, optionally repairing it or writing out corrected data
    Decode {
        input: PathBuf,
        /// Write the corrected readable data here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Correct the image in place
        #[arg(short, long)]
        inplace: bool,
        #[command(flatten)]
        read: ReadArgs,
    },
    /// Print the FEC trailer size for an input size
    PrintSize {
        size: u64,
        #[arg(short, long, default_value_t = DEFAULT_ROOTS, value_parser = roots_parser())]
        roots: u8,
        /// Also count verity metadata and hash tree
        #[arg(long)]
        verity: bool,
    },
    /// Build a hash tree over a file and print its root hash
    Tree {
        input: PathBuf,
        /// Salt as hex, 32 bytes
        #[arg(short, long)]
        salt: Option<String>,
        /// Write the tree here, root level first
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Append verity metadata, hash tree and FEC trailer to a data image
    BuildImage {
        input: PathBuf,
        #[arg(short, long, default_value_t = DEFAULT_ROOTS, value_parser = roots_parser())]
        roots: u8,
        /// Salt as hex, 32 bytes
        #[arg(short, long)]
        salt: Option<String>,
        /// Mark verity as disabled in the metadata
        #[arg(long)]
        disabled: bool,
    },
    /// Dump status, ECC and verity metadata as JSON
    Info {
        input: PathBuf,
        #[command(flatten)]
        read: ReadArgs,
    },
    /// Enable or disable verity in the image metadata
    SetVerity {
        input: PathBuf,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[command(flatten)]
        read: ReadArgs,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();

    match cli.command {
        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode { input, output, roots } => {
            let encoder = FecEncoder::new(EncodeOptions { roots })?;
            match output {
                Some(path) => {
                    let data = std::fs::read(&input)?;
                    let trailer = encoder.encode_bytes(&data)?;
                    std::fs::write(&path, &trailer)?;
                    println!("Wrote {} byte trailer to {}", trailer.len(), path.display());
                }
                None => {
                    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&input)?;
                    let header = encoder.append_trailer(&mut file)?;
                    println!(
                        "Appended {} byte trailer to {}",
                        u64::from(header.fec_size) + BLOCK_SIZE,
                        input.display()
                    );
                }
            }
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { input, output, inplace, read } => {
            let mode = if inplace { Mode::ReadWrite } else { Mode::ReadOnly };
            let mut handle = FecHandle::open(&input, read.options(mode))?;
            let report = if inplace {
                recovery::repair(&mut handle, None)?
            } else {
                recovery::scan(&mut handle, None)?
            };
            println!("{}", report.summary());
            if let Some(path) = output {
                let mut out = File::create(&path)?;
                let copied = io::copy(&mut handle, &mut out)?;
                out.flush()?;
                println!("Wrote {copied} bytes to {}", path.display());
            }
            let errors = handle.get_status()?.errors;
            handle.close()?;
            if errors > 0 {
                println!("Corrected {errors} block(s) while reading");
            }
        }

        // ── PrintSize ────────────────────────────────────────────────────────
        Commands::PrintSize { size, roots, verity } => {
            println!("{}", print_size(size, roots, verity)?);
        }

        // ── Tree ─────────────────────────────────────────────────────────────
        Commands::Tree { input, salt, output } => {
            let data = std::fs::read(&input)?;
            let salt = parse_salt(salt.as_deref())?;
            let mut tree = HashTreeBuilder::<sha2::Sha256>::new(BLOCK_SIZE as usize)?;
            tree.initialize(data.len() as u64, &salt)?;
            tree.update(&data)?;
            tree.build()?;
            println!("Root hash   {}", hex::encode(tree.root_hash().unwrap_or_default()));
            println!("Salt        {}", hex::encode(salt));
            println!("Levels      {}", tree.levels().len());
            println!("Tree size   {} B", tree.calculate_size(data.len() as u64));
            if let Some(path) = output {
                let written = tree.write_to_file(&path)?;
                println!("Wrote {written} bytes to {}", path.display());
            }
        }

        // ── BuildImage ───────────────────────────────────────────────────────
        Commands::BuildImage { input, roots, salt, disabled } => {
            let opts = ImageOptions { roots, salt: parse_salt(salt.as_deref())?, disabled, ..Default::default() };
            let built = ImageBuilder::new(opts)?.build_file(&input)?;
            println!("{}", serde_json::to_string_pretty(&built)?);
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, read } => {
            let mut handle = FecHandle::open(&input, read.options(Mode::ReadOnly))?;
            let info = json!({
                "path":   input.display().to_string(),
                "status": handle.get_status()?,
                "ecc":    handle.get_ecc_metadata()?,
                "verity": handle.get_verity_metadata()?,
                "avb":    handle.get_avb_metadata()?,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
            handle.close()?;
        }

        // ── SetVerity ────────────────────────────────────────────────────────
        Commands::SetVerity { input, enable, disable, read } => {
            if enable == disable {
                return Err("pass exactly one of --enable or --disable".into());
            }
            let mut handle = FecHandle::open(&input, read.options(Mode::ReadWrite))?;
            handle.set_verity_status(enable)?;
            handle.close()?;
            println!("Verity {} on {}", if enable { "enabled" } else { "disabled" }, input.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn roots_parser() -> clap::builder::RangedI64ValueParser<u8> {
    clap::value_parser!(u8).range(1..=i64::from(MAX_ROOTS))
}

/// Bytes appended to a `size`-byte image: the FEC trailer, plus verity
/// metadata and hash tree when `verity` is set.
fn print_size(size: u64, roots: u8, verity: bool) -> Result<u64, Box<dyn std::error::Error>> {
    let mut protected = size;
    if verity {
        let tree = HashTreeBuilder::<sha2::Sha256>::new(BLOCK_SIZE as usize)?;
        protected = protected
            .checked_add(VERITY_METADATA_SIZE + tree.calculate_size(size))
            .ok_or("image size overflows")?;
    }
    let trailer = checked_fec_trailer_size(protected, roots)
        .ok_or_else(|| format!("no FEC trailer size for {protected} bytes with {roots} roots"))?;
    Ok(trailer + (protected - size))
}

fn parse_salt(hex_salt: Option<&str>) -> Result<[u8; 32], Box<dyn std::error::Error>> {
    let mut salt = [0u8; 32];
    if let Some(s) = hex_salt {
        hex::decode_to_slice(s, &mut salt).map_err(|e| format!("invalid salt {s:?}: {e}"))?;
    }
    Ok(salt)
}
