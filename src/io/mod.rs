pub mod job;
pub mod params;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

fn is_gz(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

pub fn read_to_string(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut reader: Box<dyn Read> = if is_gz(path) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read {:?}", path))?;
    Ok(content)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    if is_gz(path) {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        serde_json::to_writer_pretty(&mut encoder, value)
            .with_context(|| format!("failed to write {:?}", path))?;
        encoder
            .finish()
            .and_then(|mut w| w.flush())
            .with_context(|| format!("failed to finish {:?}", path))?;
    } else {
        serde_json::to_writer_pretty(&mut writer, value)
            .with_context(|| format!("failed to write {:?}", path))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {:?}", path))?;
    }
    Ok(())
}
