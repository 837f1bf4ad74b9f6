use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub const GZIP_EXT: &str = "gz";
pub const FASTQ_EXTS: &[&str] = &["fastq", "fq"];

/// Checks the gzip magic bytes. Files shorter than two bytes are treated as
/// not gzipped rather than an error.
pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    let n = file.read(&mut buffer)?;
    Ok(n == 2 && buffer == [0x1F, 0x8B])
}

/// Strips every trailing FASTQ/gzip extension from a path.
///
/// # Arguments
///
/// * `path` - Path whose extensions should be removed.
///
/// # Returns
/// Tuple of (stem path, stripped extensions in original order).
pub fn extension_remover(path: &Path) -> (PathBuf, Vec<String>) {
    let mut stem = path.to_path_buf();
    let mut extensions = Vec::new();

    loop {
        let ext = stem
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_string());
        match ext {
            Some(e)
                if e.eq_ignore_ascii_case(GZIP_EXT)
                    || FASTQ_EXTS.iter().any(|x| x.eq_ignore_ascii_case(&e)) =>
            {
                extensions.push(e);
                stem = stem.with_extension("");
            }
            _ => break,
        }
    }

    extensions.reverse();
    (stem, extensions)
}

/// Joins a directory, a sample name, and a fixed suffix into an output path,
/// e.g. `filtered/sampleA_F_filt.fastq.gz`.
pub fn suffixed_path(dir: &Path, sample: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}_{}", sample, suffix))
}
