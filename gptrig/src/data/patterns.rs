use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bincode::{Decode, Encode};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

use gpcore::pattern::bank::{PatternBank, PatternFile};
use gpcore::Error;

use crate::error::{Result, RunError};

/// On-disk encodings, chosen by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    /// `.json`
    Json,
    /// `.bin`
    Bincode,
    /// `.zst`, zstd-compressed bincode
    BincodeZstd,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(FileFormat::Json),
            Some("bin") => Ok(FileFormat::Bincode),
            Some("zst") => Ok(FileFormat::BincodeZstd),
            _ => Err(Error::Configuration(format!(
                "cannot tell the format of `{}` (expected .json, .bin or .zst)",
                path.display()
            ))
            .into()),
        }
    }
}

/// Open an input file; a missing or unreadable path is a configuration error.
pub(crate) fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::Configuration(format!("cannot open `{}`: {}", path.display(), e)).into())
}

pub(crate) fn write_file<T: Serialize + Encode>(path: &Path, value: &T) -> Result<()> {
    let format = FileFormat::from_path(path)?;
    let f = File::create(path)?;
    match format {
        FileFormat::Json => {
            let mut w = BufWriter::new(f);
            serde_json::to_writer_pretty(&mut w, value)?;
            w.flush()?;
        }
        FileFormat::Bincode => {
            let mut w = BufWriter::new(f);
            bincode::encode_into_std_write(value, &mut w, bincode::config::standard())?;
            w.flush()?;
        }
        FileFormat::BincodeZstd => {
            let mut zw = zstd::Encoder::new(f, 3)?;
            bincode::encode_into_std_write(value, &mut zw, bincode::config::standard())?;
            zw.finish()?;
        }
    }
    Ok(())
}

pub(crate) fn read_file<T: DeserializeOwned + Decode<()>>(path: &Path) -> Result<T> {
    let format = FileFormat::from_path(path)?;
    let f = open_input(path)?;
    let value = match format {
        FileFormat::Json => serde_json::from_reader(BufReader::new(f))?,
        FileFormat::Bincode => decode(&mut BufReader::new(f))?,
        FileFormat::BincodeZstd => decode(&mut zstd::Decoder::new(f)?)?,
    };
    Ok(value)
}

fn decode<T: Decode<()>, R: Read>(r: &mut R) -> Result<T> {
    Ok(bincode::decode_from_std_read(r, bincode::config::standard())?)
}

/// Write a bank as JSON, bincode or zstd-compressed bincode.
pub fn save_patterns(path: &Path, bank: &PatternBank) -> Result<()> {
    write_file(path, &bank.to_file())?;
    info!("wrote {} patterns to {}", bank.len(), path.display());
    Ok(())
}

/// Read and validate a bank.
///
/// Undecodable content is reported as a malformed pattern file.
pub fn load_patterns(path: &Path) -> Result<PatternBank> {
    let file: PatternFile = read_file(path).map_err(|e| match e {
        RunError::Json(e) => Error::MalformedPatternFile(e.to_string()).into(),
        RunError::Decode(e) => Error::MalformedPatternFile(e.to_string()).into(),
        other => other,
    })?;
    let bank = PatternBank::try_from(file)?;
    info!("loaded {} patterns from {}", bank.len(), path.display());
    Ok(bank)
}
