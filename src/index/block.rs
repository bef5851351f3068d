use std::path::PathBuf;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind, Result};
use crate::csv::parse::{MAX_LINE_SIZE, extract_double, extract_int, field, is_null, parse_line};
use crate::geom::htm::htm_id;
use crate::geom::sphere::cartesian;
use crate::io::file::InputFile;
use crate::map::population::PopulationMap;

/// Information extracted or derived from an input record. Serialized as a
/// fixed 16-byte little-endian header in scratch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    /// HTM id of the record.
    pub htm_id: u32,
    /// Line length in bytes, terminator included.
    pub length: u32,
    /// Integer primary key.
    pub id: i64,
}

pub const RECORD_INFO_SIZE: usize = 16;

impl RecordInfo {
    pub fn to_bytes(&self) -> [u8; RECORD_INFO_SIZE] {
        let mut buf = [0u8; RECORD_INFO_SIZE];
        buf[0..4].copy_from_slice(&self.htm_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bytes());
    }

    pub fn decode(buf: &[u8]) -> RecordInfo {
        RecordInfo {
            htm_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            length: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            id: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// An input record: derived info plus the offset of its line within the
/// owning block's buffer.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    pub info: RecordInfo,
    pub offset: usize,
}

/// Field layout shared by every block of an indexing run.
#[derive(Debug, Clone)]
pub struct BlockOptions {
    pub delimiter: u8,
    pub num_fields: usize,
    pub pk_field: usize,
    pub ra_field: usize,
    pub dec_field: usize,
    pub htm_level: i32,
}

/// A line-aligned piece of an input file.
pub struct InputBlock {
    file: Arc<InputFile>,
    offset: u64,
    size: usize,
    buf: Vec<u8>,
    records: Vec<Record>,
}

impl InputBlock {
    pub fn new(file: Arc<InputFile>, offset: u64, size: usize) -> Self {
        InputBlock {
            file,
            offset,
            size,
            buf: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Read block contents from disk.
    pub fn read(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            let mut buf = vec![0u8; self.size];
            self.file.read_at(&mut buf, self.offset)?;
            self.buf = buf;
        }
        Ok(())
    }

    /// Parse every line, derive record info, sort records by HTM id and
    /// fold the per-trixel counts into the population map.
    pub fn process(&mut self, opts: &BlockOptions, map: &PopulationMap) -> Result<()> {
        self.read()?;
        let mut offsets = Vec::with_capacity(opts.num_fields + 1);
        let mut records = Vec::with_capacity(self.size / 1024);
        let mut pos = 0;
        while pos < self.buf.len() {
            let line = &self.buf[pos..];
            let next = parse_line(line, opts.delimiter, opts.num_fields, &mut offsets)?;
            if next > MAX_LINE_SIZE {
                return Err(Error::parse("line too long"));
            }
            let pk = field(line, &offsets, opts.pk_field);
            if is_null(pk) {
                return Err(Error::parse("CSV file contains NULL primary-key value"));
            }
            let id = extract_int(pk)?;
            let ra = extract_double(field(line, &offsets, opts.ra_field), false)?;
            let dec = extract_double(field(line, &offsets, opts.dec_field), false)?;
            let htm = htm_id(cartesian(ra, dec), opts.htm_level)?;
            records.push(Record {
                info: RecordInfo {
                    htm_id: htm,
                    length: next as u32,
                    id,
                },
                offset: pos,
            });
            pos += next;
        }
        // Sort the records, not the underlying text. Ordering by
        // (htm id, primary key) keeps each trixel's id slice sorted, as
        // key remapping binary-searches it later.
        records.sort_by_key(|r| (r.info.htm_id, r.info.id));
        // Fold counts into the population map here rather than in the
        // final merge pass; it keeps the merger oblivious of trixels.
        if let Some(first) = records.first() {
            let mut htm = first.info.htm_id;
            let mut nrec = 0u64;
            let mut sz = 0u64;
            for r in &records {
                if r.info.htm_id != htm {
                    map.add(htm, nrec, sz);
                    htm = r.info.htm_id;
                    nrec = 0;
                    sz = 0;
                }
                nrec += 1;
                sz += r.info.length as u64;
            }
            map.add(htm, nrec, sz);
        }
        self.records = records;
        Ok(())
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Raw block bytes; record offsets index into this buffer.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }
}

/// Break input files into line-aligned byte ranges of approximately
/// `block_size` bytes. Boundaries are discovered by scanning backwards
/// from each nominal boundary for a line terminator, so no line ever
/// spans two blocks.
pub fn split_ranges(
    paths: &[PathBuf],
    block_size: usize,
) -> Result<Vec<(Arc<InputFile>, u64, usize)>> {
    let mut ranges = Vec::new();
    let mut buf = vec![0u8; MAX_LINE_SIZE];
    for path in paths {
        let file = Arc::new(InputFile::open(path)?);
        let size = file.size();
        let mut start = 0u64;
        let mut i = 1u64;
        while start < size {
            let nominal = i * block_size as u64;
            i += 1;
            if nominal >= size {
                ranges.push((file.clone(), start, (size - start) as usize));
                break;
            }
            file.read_at(&mut buf, nominal - MAX_LINE_SIZE as u64)?;
            let Some(nl) = buf.iter().rposition(|&c| c == b'\n') else {
                return Err(Error::parse(format!("line too long in {}", path.display())));
            };
            let end = nominal - (MAX_LINE_SIZE as u64 - (1 + nl as u64));
            ranges.push((file.clone(), start, (end - start) as usize));
            start = end;
        }
    }
    Ok(ranges)
}

/// Split inputs into indexer blocks, enforcing the indexer block size
/// limits.
pub fn split_inputs(paths: &[PathBuf], block_size: usize) -> Result<Vec<InputBlock>> {
    if block_size < 2 * 1024 * 1024 || block_size < 2 * MAX_LINE_SIZE {
        return Err(Error::new(
            ErrorKind::Config,
            "input block size must be >= 2 MiB".to_string(),
        ));
    }
    if block_size > 1024 * 1024 * 1024 {
        return Err(Error::new(
            ErrorKind::Config,
            "input block size must be <= 1 GiB".to_string(),
        ));
    }
    Ok(split_ranges(paths, block_size)?
        .into_iter()
        .map(|(file, offset, size)| InputBlock::new(file, offset, size))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options() -> BlockOptions {
        BlockOptions {
            delimiter: b',',
            num_fields: 3,
            pk_field: 0,
            ra_field: 1,
            dec_field: 2,
            htm_level: 1,
        }
    }

    fn block_of(content: &[u8]) -> (tempfile::TempDir, InputBlock) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("in.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        drop(f);
        let file = Arc::new(InputFile::open(&path).unwrap());
        let size = file.size() as usize;
        let block = InputBlock::new(file, 0, size);
        (dir, block)
    }

    #[test]
    fn test_process_sorts_by_htm_id_and_counts() {
        let (_dir, mut block) = block_of(b"1,0.0,0.0\n2,90.0,45.0\n3,180.0,-45.0\n");
        let map = PopulationMap::new(1).unwrap();
        block.process(&options(), &map).unwrap();
        let recs = block.records();
        assert_eq!(recs.len(), 3);
        assert!(recs.windows(2).all(|w| w[0].info.htm_id <= w[1].info.htm_id));
        let mut map = map;
        map.make_queryable().unwrap();
        assert_eq!(map.total_records(), 3);
        assert_eq!(map.total_size(), 36);
    }

    #[test]
    fn test_null_primary_key_is_fatal() {
        let (_dir, mut block) = block_of(b"\\N,0.0,0.0\n");
        let map = PopulationMap::new(1).unwrap();
        assert!(block.process(&options(), &map).is_err());
    }

    #[test]
    fn test_record_info_round_trip() {
        let info = RecordInfo {
            htm_id: 12345,
            length: 77,
            id: -99,
        };
        let mut buf = Vec::new();
        info.encode(&mut buf);
        assert_eq!(buf.len(), RECORD_INFO_SIZE);
        assert_eq!(RecordInfo::decode(&buf), info);
    }

    #[test]
    fn test_split_inputs_rejects_bad_block_sizes() {
        assert!(split_inputs(&[], 1024).is_err());
        assert!(split_inputs(&[], 2 * 1024 * 1024 * 1024).is_err());
        assert!(split_inputs(&[], 2 * 1024 * 1024).unwrap().is_empty());
    }
}
