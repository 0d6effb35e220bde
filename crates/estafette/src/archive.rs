//! Journal packaging.

use anyhow::{Context, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Compress a single journal into `<dest_dir>/<file-name>.zip` and return
/// the archive path. The input file is never modified or removed; an
/// existing archive of the same name is overwritten (a leftover from an
/// interrupted earlier cycle).
pub fn compress_file(input: &Path, dest_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;
    let file_name = input
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("journal path has no usable file name: {}", input.display()))?;
    let output = dest_dir.join(format!("{file_name}.zip"));

    let mut writer = ZipWriter::new(
        File::create(&output)
            .with_context(|| format!("failed to create archive {}", output.display()))?,
    );
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer
        .start_file(file_name, options)
        .with_context(|| format!("failed to start archive entry for {file_name}"))?;
    let mut reader = File::open(input)
        .with_context(|| format!("failed to read journal {}", input.display()))?;
    io::copy(&mut reader, &mut writer)
        .with_context(|| format!("failed to compress {}", input.display()))?;
    writer
        .finish()
        .with_context(|| format!("failed to finalize archive {}", output.display()))?;

    Ok(output)
}
