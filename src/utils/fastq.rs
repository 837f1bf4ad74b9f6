use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use fxhash::FxHashMap;
use lazy_static::lazy_static;
use rand::SeedableRng;
use rand::rngs::StdRng;
use seq_io::fastq::{OwnedRecord, Reader};

use crate::utils::file::{GZIP_EXT, extension_remover, is_gzipped};
use crate::utils::sequence::{DNA, normal_phred_qual_string, reverse_complement};

lazy_static! {
    static ref FORWARD_REVERSE_TAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("R1", "R2");
        m.insert("r1", "r2");
        m.insert("1", "2");
        m.insert("F", "R");
        m.insert("f", "r");
        m.insert("FWD", "REV");
        m.insert("fwd", "rev");
        m.insert("forward", "reverse");
        m.insert("READ1", "READ2");
        m.insert("read1", "read2");
        m
    };
}

/// One FASTQ read with its per-base phred+33 qualities.
#[derive(Debug, Clone, PartialEq)]
pub struct FastqRecord {
    pub id: String,
    pub desc: Option<String>,
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

impl From<OwnedRecord> for FastqRecord {
    fn from(record: OwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head);
        FastqRecord {
            id,
            desc,
            seq: record.seq,
            qual: record.qual,
        }
    }
}

/// Splits a FASTQ header into id and optional description.
fn parse_header(head: &[u8]) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let parts: Vec<&str> = head_str.splitn(2, |c: char| c.is_whitespace()).collect();
    let id = parts[0].trim_start_matches('@').to_string();
    let desc = parts.get(1).map(|s| s.to_string()).filter(|s| !s.is_empty());
    (id, desc)
}

/// Enum to hold either an uncompressed or gzipped file reader.
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(GzDecoder<File>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

/// Opens a FASTQ file, transparently handling gzip.
pub fn fastq_reader(path: &Path) -> io::Result<Reader<FileReader>> {
    let gz = is_gzipped(path)?;
    let file = File::open(path)?;
    let reader = if gz {
        Reader::new(FileReader::Gzipped(GzDecoder::new(file)))
    } else {
        Reader::new(FileReader::Uncompressed(BufReader::new(file)))
    };
    Ok(reader)
}

/// Enum to hold either an uncompressed or gzipped file writer.
pub enum FileWriter {
    Uncompressed(BufWriter<File>),
    Gzipped(GzEncoder<BufWriter<File>>),
}

impl FileWriter {
    /// Creates a writer; a trailing `.gz` extension selects gzip output.
    pub fn create(path: &Path) -> io::Result<FileWriter> {
        let gz = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(GZIP_EXT));
        let inner = BufWriter::new(File::create(path)?);
        Ok(if gz {
            FileWriter::Gzipped(GzEncoder::new(inner, Compression::default()))
        } else {
            FileWriter::Uncompressed(inner)
        })
    }

    /// Flushes buffered data and finalizes the gzip stream when present.
    pub fn finish(self) -> io::Result<()> {
        match self {
            FileWriter::Uncompressed(mut w) => w.flush(),
            FileWriter::Gzipped(g) => g.finish()?.flush(),
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Uncompressed(w) => w.write(buf),
            FileWriter::Gzipped(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Uncompressed(w) => w.flush(),
            FileWriter::Gzipped(w) => w.flush(),
        }
    }
}

pub fn write_fastq_record<W: Write>(writer: &mut W, record: &FastqRecord) -> io::Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(record.id.as_bytes())?;
    if let Some(desc) = &record.desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;
    writer.write_all(&record.seq)?;
    writer.write_all(b"\n+\n")?;
    writer.write_all(&record.qual)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Reads a whole FASTQ file into memory.
pub fn read_fastq_records(path: &Path) -> Result<Vec<FastqRecord>> {
    let reader = fastq_reader(path)
        .map_err(|e| anyhow!("failed to open FASTQ {}: {}", path.display(), e))?;
    let mut records = Vec::new();
    for result in reader.into_records() {
        let record =
            result.map_err(|e| anyhow!("malformed FASTQ in {}: {}", path.display(), e))?;
        records.push(record.into());
    }
    Ok(records)
}

/// Reads two mate files in lockstep, checking that read IDs pair up.
pub fn read_fastq_pairs(
    forward: &Path,
    reverse: &Path,
) -> Result<Vec<(FastqRecord, FastqRecord)>> {
    let fwd = read_fastq_records(forward)?;
    let rev = read_fastq_records(reverse)?;
    if fwd.len() != rev.len() {
        bail!(
            "mate files differ in read count: {} has {}, {} has {}",
            forward.display(),
            fwd.len(),
            reverse.display(),
            rev.len()
        );
    }
    for (f, r) in fwd.iter().zip(rev.iter()) {
        if !mates_paired(&f.id, f.desc.as_deref(), &r.id, r.desc.as_deref()) {
            bail!("read ID mismatch between mates: '{}' vs '{}'", f.id, r.id);
        }
    }
    Ok(fwd.into_iter().zip(rev).collect())
}

/// Checks that two reads form an R1/R2 pair, accepting Casava 1.8+ headers
/// (shared id, description starting `1:`/`2:`) and the older `/1`, `/2` style.
fn mates_paired(id1: &str, desc1: Option<&str>, id2: &str, desc2: Option<&str>) -> bool {
    if let (Some(d1), Some(d2)) = (desc1, desc2) {
        if id1 == id2 {
            let num1 = d1.split(':').next().unwrap_or("");
            let num2 = d2.split(':').next().unwrap_or("");
            return (num1 == "1" && num2 == "2") || (num1 == "2" && num2 == "1");
        }
        return false;
    }

    if id1.ends_with("/1") && id2.ends_with("/2") {
        return id1.trim_end_matches("/1") == id2.trim_end_matches("/2");
    }
    if id1.ends_with("/2") && id2.ends_with("/1") {
        return id1.trim_end_matches("/2") == id2.trim_end_matches("/1");
    }

    // Bare identical IDs are common after external processing.
    id1 == id2
}

#[derive(Debug, PartialEq)]
pub struct PairedNames {
    pub sample: String,
    pub reverse_file: String,
}

/// Recognizes a forward-read file name and derives the sample name plus the
/// expected reverse-mate file name, e.g. `s1_R1.fastq.gz` → (`s1`,
/// `s1_R2.fastq.gz`). Returns `None` when no forward tag is found or the tag
/// has no preceding sample prefix.
pub fn paired_base(file_name: &str) -> Option<PairedNames> {
    let (stem, extensions) = extension_remover(Path::new(file_name));
    let stem_name = stem.file_name()?.to_str()?;

    for delimiter in ['_', '.', '-'] {
        let parts: Vec<&str> = stem_name.split(delimiter).collect();
        if parts.len() < 2 {
            continue;
        }
        for (index, part) in parts.iter().enumerate() {
            if index == 0 {
                continue;
            }
            if let Some(&reverse_tag) = FORWARD_REVERSE_TAGS.get(part) {
                let sample = parts[..index].join(&delimiter.to_string());
                let mut reverse_parts = parts.clone();
                reverse_parts[index] = reverse_tag;
                let mut reverse_file = reverse_parts.join(&delimiter.to_string());
                if !extensions.is_empty() {
                    reverse_file = format!("{}.{}", reverse_file, extensions.join("."));
                }
                return Some(PairedNames {
                    sample,
                    reverse_file,
                });
            }
        }
    }
    None
}

/// One unique sequence and the number of reads collapsed into it.
#[derive(Debug, Clone, PartialEq)]
pub struct DerepUnit {
    pub seq: Vec<u8>,
    pub count: u64,
}

/// Dereplicated read set: unique sequences in first-seen order plus, for each
/// original read, the index of the unit it collapsed into. The per-read map
/// is what lets forward and reverse mates stay linked after collapsing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dereplicated {
    pub units: Vec<DerepUnit>,
    pub read_units: Vec<usize>,
}

impl Dereplicated {
    pub fn n_reads(&self) -> u64 {
        self.read_units.len() as u64
    }
}

/// Collapses identical reads into counted unique sequences.
pub fn dereplicate(records: &[FastqRecord]) -> Dereplicated {
    let mut index: FxHashMap<Vec<u8>, usize> = FxHashMap::default();
    let mut units: Vec<DerepUnit> = Vec::new();
    let mut read_units = Vec::with_capacity(records.len());

    for record in records {
        let unit = match index.get(&record.seq) {
            Some(&u) => {
                units[u].count += 1;
                u
            }
            None => {
                let u = units.len();
                index.insert(record.seq.clone(), u);
                units.push(DerepUnit {
                    seq: record.seq.clone(),
                    count: 1,
                });
                u
            }
        };
        read_units.push(unit);
    }

    Dereplicated { units, read_units }
}

/// Writes a deterministic pair of mate FASTQ files for a sample: each
/// amplicon contributes `count` read pairs whose forward mate is the amplicon
/// prefix and whose reverse mate is the reverse-complement suffix. Qualities
/// are drawn from a seeded normal so reruns are identical. Intended for test
/// fixtures and demo data.
pub fn synthetic_pair_files(
    dir: &Path,
    sample: &str,
    amplicons: &[(Vec<u8>, u64)],
    read_len: usize,
    qual_mean: f32,
    qual_sd: f32,
    seed: u64,
) -> Result<(PathBuf, PathBuf)> {
    let forward_path = dir.join(format!("{}_R1.fastq", sample));
    let reverse_path = dir.join(format!("{}_R2.fastq", sample));
    let mut fwd = FileWriter::create(&forward_path)?;
    let mut rev = FileWriter::create(&reverse_path)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut read_no = 0u64;
    for (amplicon, count) in amplicons {
        if amplicon.len() < read_len {
            bail!(
                "amplicon of length {} is shorter than the read length {}",
                amplicon.len(),
                read_len
            );
        }
        for _ in 0..*count {
            read_no += 1;
            let id = format!("{}:{}", sample, read_no);
            let f_rec = FastqRecord {
                id: id.clone(),
                desc: Some("1:N:0:1".to_string()),
                seq: amplicon[..read_len].to_vec(),
                qual: normal_phred_qual_string(&mut rng, read_len, qual_mean, qual_sd),
            };
            let r_rec = FastqRecord {
                id,
                desc: Some("2:N:0:1".to_string()),
                seq: reverse_complement(&amplicon[amplicon.len() - read_len..]),
                qual: normal_phred_qual_string(&mut rng, read_len, qual_mean, qual_sd),
            };
            write_fastq_record(&mut fwd, &f_rec)?;
            write_fastq_record(&mut rev, &r_rec)?;
        }
    }

    fwd.finish()?;
    rev.finish()?;
    Ok((forward_path, reverse_path))
}

/// Deterministic random amplicon for fixtures.
pub fn random_amplicon(seed: u64, length: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    DNA::random_sequence(&mut rng, length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paired_base_r1_tag() {
        let pair = paired_base("sampleA_R1.fastq.gz").expect("tag should match");
        assert_eq!(pair.sample, "sampleA");
        assert_eq!(pair.reverse_file, "sampleA_R2.fastq.gz");
    }

    #[test]
    fn test_paired_base_dotted_tag() {
        let pair = paired_base("run3.s2.fwd.fq").expect("tag should match");
        assert_eq!(pair.sample, "run3.s2");
        assert_eq!(pair.reverse_file, "run3.s2.rev.fq");
    }

    #[test]
    fn test_paired_base_rejects_untagged() {
        assert!(paired_base("reference.fastq").is_none());
        assert!(paired_base("R1.fastq").is_none());
    }

    #[test]
    fn test_mates_paired_casava() {
        assert!(mates_paired("m1", Some("1:N:0:1"), "m1", Some("2:N:0:1")));
        assert!(!mates_paired("m1", Some("1:N:0:1"), "m2", Some("2:N:0:1")));
        assert!(!mates_paired("m1", Some("1:N:0:1"), "m1", Some("1:N:0:1")));
    }

    #[test]
    fn test_mates_paired_slash_style() {
        assert!(mates_paired("m7/1", None, "m7/2", None));
        assert!(!mates_paired("m7/1", None, "m8/2", None));
    }

    #[test]
    fn test_dereplicate_counts_and_map() {
        let records: Vec<FastqRecord> = [b"ACGT", b"TTTT", b"ACGT"]
            .iter()
            .enumerate()
            .map(|(i, seq)| FastqRecord {
                id: format!("r{}", i),
                desc: None,
                seq: seq.to_vec(),
                qual: vec![b'I'; 4],
            })
            .collect();
        let derep = dereplicate(&records);
        assert_eq!(derep.units.len(), 2);
        assert_eq!(derep.units[0].seq, b"ACGT".to_vec());
        assert_eq!(derep.units[0].count, 2);
        assert_eq!(derep.units[1].count, 1);
        assert_eq!(derep.read_units, vec![0, 1, 0]);
        assert_eq!(derep.n_reads(), 3);
    }

    #[test]
    fn test_synthetic_pair_files_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let amplicon = random_amplicon(5, 120);
        let (fwd, rev) = synthetic_pair_files(
            dir.path(),
            "sA",
            &[(amplicon.clone(), 4)],
            80,
            35.0,
            3.0,
            42,
        )?;
        let pairs = read_fastq_pairs(&fwd, &rev)?;
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0].0.seq, amplicon[..80].to_vec());
        assert_eq!(
            pairs[0].1.seq,
            reverse_complement(&amplicon[amplicon.len() - 80..])
        );
        Ok(())
    }

    #[test]
    fn test_gzip_writer_reader_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("reads.fastq.gz");
        let record = FastqRecord {
            id: "x1".to_string(),
            desc: None,
            seq: b"ACGTACGT".to_vec(),
            qual: vec![b'I'; 8],
        };
        let mut writer = FileWriter::create(&path)?;
        write_fastq_record(&mut writer, &record)?;
        writer.finish()?;

        let records = read_fastq_records(&path)?;
        assert_eq!(records, vec![record]);
        Ok(())
    }
}
