//! Loading program images from disk.

use std::fs;
use std::path::{Path, PathBuf};

use object::{Object, ObjectSection};

use crate::ProgramImage;

/// Section holding the code programmed from an executable
pub const CODE_SECTION: &str = ".text";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not a valid executable: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: object::Error,
    },

    #[error("unable to read the {section} section from {}", .path.display())]
    MissingSection { path: PathBuf, section: &'static str },

    #[error("{section} section of {} is not addressable in 32 bits (0x{address:x})", .path.display())]
    AddressOutOfRange {
        path: PathBuf,
        section: &'static str,
        address: u64,
    },
}

fn read(path: &Path) -> Result<Vec<u8>, ImageError> {
    fs::read(path).map_err(|source| ImageError::Read {
        path: path.to_owned(),
        source,
    })
}

/// Load a flat binary to be programmed at `load_address`
pub fn load_raw<P: AsRef<Path>>(path: P, load_address: u32) -> Result<ProgramImage, ImageError> {
    let data = read(path.as_ref())?;
    Ok(ProgramImage::new(load_address, data))
}

/// Load the code section of an executable, at the address it was linked for
pub fn load_elf<P: AsRef<Path>>(path: P) -> Result<ProgramImage, ImageError> {
    let path = path.as_ref();
    let data = read(path)?;
    parse_elf(path, &data)
}

fn parse_elf(path: &Path, data: &[u8]) -> Result<ProgramImage, ImageError> {
    let parse_err = |source| ImageError::Parse {
        path: path.to_owned(),
        source,
    };

    let file = object::File::parse(data).map_err(parse_err)?;

    let section = file
        .section_by_name(CODE_SECTION)
        .ok_or_else(|| ImageError::MissingSection {
            path: path.to_owned(),
            section: CODE_SECTION,
        })?;

    let address = section.address();
    if address > u32::MAX as u64 {
        return Err(ImageError::AddressOutOfRange {
            path: path.to_owned(),
            section: CODE_SECTION,
            address,
        });
    }

    let code = section.data().map_err(parse_err)?;

    Ok(ProgramImage::new(address as u32, code.to_vec()))
}
