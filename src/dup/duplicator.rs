use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;

use crate::core::config::DuplicatorConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::hash::mulvey_hash;
use crate::csv::parse::{
    MAX_LINE_SIZE, extract_double, extract_int, field, field_index, parse_line, valid_delimiter,
};
use crate::dup::mappers::{KeyMapper, PosMapper};
use crate::dup::output::OutputBlock;
use crate::geom::chunker::{ChunkLocation, Chunker, LocationKind};
use crate::geom::htm::htm_ids_overlapping;
use crate::geom::sphere::SphericalBox;
use crate::io::mmap::MappedInputFile;
use crate::io::writer::BlockWriter;
use crate::map::chunk_index::ChunkIndex;
use crate::map::population::PopulationMap;

/// A duplication index to draw keys from: the population map, the mapped
/// id stream and the field the keys substitute into.
struct KeyInfo {
    map: PopulationMap,
    ids: MappedInputFile,
    field: usize,
}

/// Field layout of one duplication run.
struct Layout {
    delimiter: u8,
    num_input_fields: usize,
    num_output_fields: usize,
    ra_field: usize,
    dec_field: usize,
    chunk_id_field: usize,
    sub_chunk_id_field: usize,
    secondary_sort_field: Option<usize>,
    positions: Vec<(usize, usize)>,
}

/// Synthesizes catalog rows at arbitrary sky density by mapping records
/// from populated trixels into empty ones, then buckets the results into
/// chunk, self-overlap and full-overlap files.
pub struct Duplicator {
    chunk_dir: PathBuf,
    block_size: usize,
    num_threads: usize,
    num_nodes: u32,
    overlap: f64,
    layout: Layout,
    chunker: Chunker,
    primary: KeyInfo,
    foreign: Vec<KeyInfo>,
    data: MappedInputFile,
    chunk_ids: Vec<i32>,
}

fn resolve(fields: &[String], name: &str) -> Result<usize> {
    field_index(fields, name)
        .ok_or_else(|| Error::new(ErrorKind::Config, format!("unknown field name: {}", name)))
}

impl Duplicator {
    pub fn new(cfg: &DuplicatorConfig) -> Result<Self> {
        if cfg.fields.is_empty() {
            return Err(Error::new(ErrorKind::Config, "no field names given".to_string()));
        }
        if !valid_delimiter(cfg.delimiter) {
            return Err(Error::new(ErrorKind::Config, "illegal delimiter".to_string()));
        }
        if !(1..=100).contains(&cfg.num_threads) {
            return Err(Error::new(
                ErrorKind::Config,
                "number of threads must lie in [1, 100]".to_string(),
            ));
        }
        if cfg.num_nodes == 0 || cfg.num_nodes > 99999 {
            return Err(Error::new(
                ErrorKind::Config,
                "number of nodes must lie in [1, 99999]".to_string(),
            ));
        }
        let num_input_fields = cfg.fields.len();
        let mut num_output_fields = num_input_fields;
        let mut resolve_or_append = |name: Option<&String>| match name.and_then(|n| field_index(&cfg.fields, n)) {
            Some(i) => i,
            None => {
                let f = num_output_fields;
                num_output_fields += 1;
                f
            }
        };
        let chunk_id_field = resolve_or_append(cfg.chunk_id_field.as_ref());
        let sub_chunk_id_field = resolve_or_append(cfg.sub_chunk_id_field.as_ref());
        let layout = Layout {
            delimiter: cfg.delimiter,
            num_input_fields,
            num_output_fields,
            ra_field: resolve(&cfg.fields, &cfg.partition_ra)?,
            dec_field: resolve(&cfg.fields, &cfg.partition_dec)?,
            chunk_id_field,
            sub_chunk_id_field,
            secondary_sort_field: cfg
                .secondary_sort_field
                .as_ref()
                .map(|n| resolve(&cfg.fields, n))
                .transpose()?,
            positions: cfg
                .positions
                .iter()
                .map(|(ra, dec)| Ok((resolve(&cfg.fields, ra)?, resolve(&cfg.fields, dec)?)))
                .collect::<Result<_>>()?,
        };
        let chunker = Chunker::new(cfg.overlap_deg, cfg.num_stripes, cfg.num_sub_stripes_per_stripe)?;
        let primary = KeyInfo {
            map: PopulationMap::read(cfg.index_dir.join("map.bin"))?,
            ids: MappedInputFile::open(cfg.index_dir.join("ids.bin"))?,
            field: resolve(&cfg.fields, &cfg.primary_key)?,
        };
        if primary.map.level() != cfg.htm_level {
            return Err(Error::new(
                ErrorKind::Config,
                format!(
                    "index subdivision level {} does not match the configured level {}",
                    primary.map.level(),
                    cfg.htm_level
                ),
            ));
        }
        let mut foreign = Vec::with_capacity(cfg.foreign_keys.len());
        for (name, dir) in &cfg.foreign_keys {
            let ki = KeyInfo {
                map: PopulationMap::read(dir.join("map.bin"))?,
                ids: MappedInputFile::open(dir.join("ids.bin"))?,
                field: resolve(&cfg.fields, name)?,
            };
            if ki.map.level() != primary.map.level() {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("foreign key index {} has a different subdivision level", name),
                ));
            }
            foreign.push(ki);
        }
        let data = MappedInputFile::open(cfg.index_dir.join("data.csv"))?;
        let chunk_ids = if cfg.chunk_ids.is_empty() {
            let region = match cfg.dup_region {
                Some((ra_min, ra_max, dec_min, dec_max)) => {
                    SphericalBox::new(ra_min, ra_max, dec_min, dec_max)
                }
                None => SphericalBox::default(),
            };
            chunker.chunks_for(&region, cfg.node, cfg.num_nodes, cfg.hash_chunks)?
        } else {
            cfg.chunk_ids.clone()
        };
        log::info!("data for {} chunks will be generated", chunk_ids.len());
        Ok(Duplicator {
            chunk_dir: cfg.chunk_dir.clone(),
            block_size: cfg.block_size,
            num_threads: cfg.num_threads,
            num_nodes: cfg.num_nodes,
            overlap: cfg.overlap_deg,
            layout,
            chunker,
            primary,
            foreign,
            data,
            chunk_ids,
        })
    }

    /// Generate every configured chunk; returns the chunk index over all
    /// emitted records and writes it alongside the chunk files.
    pub fn run(&self) -> Result<ChunkIndex> {
        std::fs::create_dir_all(&self.chunk_dir)?;
        let mut index = ChunkIndex::new();
        let level = self.primary.map.level();
        for &chunk_id in &self.chunk_ids {
            let t = Instant::now();
            let mut bounds = self.chunker.chunk_bounds(chunk_id)?;
            // one arcsecond of slack on top of the overlap radius
            bounds.expand(self.overlap + 1.0 / 3600.0);
            let htm_ids = htm_ids_overlapping(&bounds, level)?;
            let blocks = self.generate_chunk(chunk_id, htm_ids)?;
            self.finish_chunk(chunk_id, blocks, &mut index)?;
            log::info!("chunk {} generated in {:.3}s", chunk_id, t.elapsed().as_secs_f64());
        }
        index.write(self.chunk_dir.join("chunk_index.bin"), true)?;
        Ok(index)
    }

    /// Fill every trixel overlapping the chunk, in parallel. Threads pop
    /// trixel ids from a shared list and keep private output blocks.
    fn generate_chunk(&self, chunk_id: i32, htm_ids: Vec<u32>) -> Result<Vec<OutputBlock>> {
        let work = Mutex::new(htm_ids);
        let blocks: Mutex<Vec<OutputBlock>> = Mutex::new(Vec::new());
        let failed: Mutex<Option<Error>> = Mutex::new(None);
        rayon::scope(|s| {
            for _ in 0..self.num_threads {
                s.spawn(|_| {
                    let mut worker = TrixelWorker::new(self);
                    loop {
                        if failed.lock().is_some() {
                            break;
                        }
                        let Some(htm_id) = work.lock().pop() else {
                            break;
                        };
                        match worker.duplicate(chunk_id, htm_id) {
                            Ok(Some(block)) => blocks.lock().push(block),
                            Ok(None) => {}
                            Err(e) => {
                                let mut slot = failed.lock();
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                                break;
                            }
                        }
                    }
                });
            }
        });
        if let Some(e) = failed.into_inner() {
            return Err(e);
        }
        Ok(blocks.into_inner())
    }

    /// Merge the per-thread blocks by (sub-chunk, sort key) and route
    /// records to the chunk, self-overlap and full-overlap files.
    fn finish_chunk(
        &self,
        chunk_id: i32,
        mut blocks: Vec<OutputBlock>,
        index: &mut ChunkIndex,
    ) -> Result<()> {
        let dir = if self.num_nodes > 1 {
            let node = mulvey_hash(chunk_id as u32) % self.num_nodes;
            let dir = self.chunk_dir.join(format!("node_{:05}", node));
            std::fs::create_dir_all(&dir)?;
            dir
        } else {
            self.chunk_dir.clone()
        };
        let mut chunk = BlockWriter::new(dir.join(format!("chunk_{}.csv", chunk_id)), self.block_size)?;
        let mut self_overlap = if self.overlap > 0.0 {
            Some(BlockWriter::new(
                dir.join(format!("chunk_{}_self.csv", chunk_id)),
                self.block_size,
            )?)
        } else {
            None
        };
        let mut full_overlap = if self.overlap > 0.0 {
            Some(BlockWriter::new(
                dir.join(format!("chunk_{}_full.csv", chunk_id)),
                self.block_size,
            )?)
        } else {
            None
        };
        for b in &mut blocks {
            b.sort();
        }
        let mut cursors = vec![0usize; blocks.len()];
        let mut heap: BinaryHeap<Reverse<(i32, i64, usize)>> = BinaryHeap::new();
        for (i, b) in blocks.iter().enumerate() {
            if let Some(r) = b.records().first() {
                heap.push(Reverse((r.loc.sub_chunk_id, r.sort_key, i)));
            }
        }
        while let Some(Reverse((_, _, i))) = heap.pop() {
            let block = &blocks[i];
            let rec = block.records()[cursors[i]];
            cursors[i] += 1;
            let line = block.line(&rec);
            match rec.loc.kind {
                LocationKind::Chunk => chunk.append(line)?,
                LocationKind::SelfOverlap => {
                    if let Some(w) = self_overlap.as_mut() {
                        w.append(line)?;
                    }
                    if let Some(w) = full_overlap.as_mut() {
                        w.append(line)?;
                    }
                }
                LocationKind::FullOverlap => {
                    if let Some(w) = full_overlap.as_mut() {
                        w.append(line)?;
                    }
                }
            }
            index.add(&rec.loc, 1);
            if cursors[i] < block.records().len() {
                let r = block.records()[cursors[i]];
                heap.push(Reverse((r.loc.sub_chunk_id, r.sort_key, i)));
            }
        }
        chunk.close()?;
        if let Some(mut w) = self_overlap {
            w.close()?;
        }
        if let Some(mut w) = full_overlap {
            w.close()?;
        }
        Ok(())
    }
}

/// Per-thread duplication state for a single trixel at a time.
struct TrixelWorker<'a> {
    dup: &'a Duplicator,
    offsets: Vec<usize>,
    locations: Vec<ChunkLocation>,
    /// Replacement field values; None keeps the original text.
    values: Vec<Option<Vec<u8>>>,
    line_buf: Vec<u8>,
}

impl<'a> TrixelWorker<'a> {
    fn new(dup: &'a Duplicator) -> Self {
        TrixelWorker {
            dup,
            offsets: Vec::with_capacity(dup.layout.num_input_fields + 1),
            locations: Vec::new(),
            values: vec![None; dup.layout.num_output_fields],
            line_buf: Vec::with_capacity(MAX_LINE_SIZE),
        }
    }

    /// Fill one destination trixel with data drawn from its non-empty
    /// source, keeping only records that land in the target chunk.
    fn duplicate(&mut self, chunk_id: i32, htm_id: u32) -> Result<Option<OutputBlock>> {
        let dup = self.dup;
        let layout = &dup.layout;
        let source_htm_id = dup.primary.map.map_to_non_empty(htm_id);
        let map_positions = source_htm_id != htm_id;
        let pos_mapper = if map_positions {
            PosMapper::new(source_htm_id, htm_id)?
        } else {
            PosMapper::identity()
        };
        let mut key_mappers = Vec::with_capacity(1 + dup.foreign.len());
        key_mappers.push(KeyMapper::new(
            &dup.primary.map,
            &dup.primary.ids,
            dup.primary.field,
            source_htm_id,
            htm_id,
        ));
        for ki in &dup.foreign {
            key_mappers.push(KeyMapper::new(&ki.map, &ki.ids, ki.field, source_htm_id, htm_id));
        }
        // the source trixel's records form one contiguous byte range
        let off = dup.primary.map.offset(source_htm_id) as usize;
        let sz = dup.primary.map.size(source_htm_id) as usize;
        dup.data.will_need(off, sz);
        let data = &dup.data.data()[off..off + sz];

        let mut block = OutputBlock::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let line = &data[pos..];
            let next = parse_line(line, layout.delimiter, layout.num_input_fields, &mut self.offsets)?;
            for v in self.values.iter_mut() {
                *v = None;
            }
            self.locations.clear();
            let mut ra = extract_double(field(line, &self.offsets, layout.ra_field), false)?;
            let mut dec = extract_double(field(line, &self.offsets, layout.dec_field), false)?;
            if map_positions {
                (ra, dec) = pos_mapper.map(ra, dec);
            }
            dup.chunker.locate(ra, dec, chunk_id, &mut self.locations);
            if self.locations.is_empty() {
                pos += next;
                continue;
            }
            if map_positions {
                self.values[layout.ra_field] = Some(format!("{}", ra).into_bytes());
                self.values[layout.dec_field] = Some(format!("{}", dec).into_bytes());
                for &(ra_f, dec_f) in &layout.positions {
                    let pra = extract_double(field(line, &self.offsets, ra_f), false)?;
                    let pdec = extract_double(field(line, &self.offsets, dec_f), false)?;
                    let (mra, mdec) = pos_mapper.map(pra, pdec);
                    self.values[ra_f] = Some(format!("{}", mra).into_bytes());
                    self.values[dec_f] = Some(format!("{}", mdec).into_bytes());
                }
            }
            for mapper in &key_mappers {
                let f = mapper.field();
                let key = extract_int(field(line, &self.offsets, f))?;
                self.values[f] = Some(mapper.map(key)?.to_string().into_bytes());
            }
            let sort_key = match layout.secondary_sort_field {
                Some(f) => extract_int(field(line, &self.offsets, f))?,
                None => 0,
            };
            self.values[layout.chunk_id_field] = Some(chunk_id.to_string().into_bytes());
            let locations = std::mem::take(&mut self.locations);
            for loc in &locations {
                self.values[layout.sub_chunk_id_field] =
                    Some(loc.sub_chunk_id.to_string().into_bytes());
                self.build_output_line(line)?;
                block.add(*loc, sort_key, &self.line_buf)?;
            }
            self.locations = locations;
            pos += next;
        }
        dup.data.dont_need(off, sz);
        Ok(if block.is_empty() { None } else { Some(block) })
    }

    /// Serialize the current record: original text for untouched fields,
    /// replacement values otherwise, appended fields last.
    fn build_output_line(&mut self, line: &[u8]) -> Result<()> {
        let layout = &self.dup.layout;
        self.line_buf.clear();
        for f in 0..layout.num_input_fields {
            if f > 0 {
                self.line_buf.push(layout.delimiter);
            }
            match &self.values[f] {
                Some(v) => self.line_buf.extend_from_slice(v),
                None => self.line_buf.extend_from_slice(field(line, &self.offsets, f)),
            }
        }
        for f in layout.num_input_fields..layout.num_output_fields {
            self.line_buf.push(layout.delimiter);
            let v = self.values[f]
                .as_ref()
                .expect("appended output fields always carry a value");
            self.line_buf.extend_from_slice(v);
        }
        self.line_buf.push(b'\n');
        if self.line_buf.len() > MAX_LINE_SIZE {
            return Err(Error::parse("output line too long"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::IndexerConfig;
    use crate::index::indexer;

    fn build_index(dir: &std::path::Path, level: i32) -> IndexerConfig {
        // seed points over the whole sky so nearly every trixel has data
        let mut lines = String::new();
        let mut id = 0i64;
        let mut ra = 0.36;
        let mut dec = -88.0;
        while dec < 88.0 {
            while ra < 360.0 {
                lines.push_str(&format!("{},{:.4},{:.4}\n", id, ra, dec));
                id += 1;
                ra += 11.0;
            }
            ra %= 360.0;
            dec += 7.0;
        }
        let input = dir.join("input.csv");
        std::fs::write(&input, lines).unwrap();
        let cfg = IndexerConfig {
            input_files: vec![input],
            fields: vec!["id".into(), "ra".into(), "decl".into()],
            htm_level: level,
            index_dir: dir.join("index"),
            scratch_dir: dir.join("scratch"),
            ..IndexerConfig::default()
        };
        indexer::index(&cfg).unwrap();
        cfg
    }

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn test_duplicate_one_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let level = 2;
        build_index(dir.path(), level);

        let chunker = Chunker::new(0.02, 6, 3).unwrap();
        let mut locs = Vec::new();
        chunker.locate(10.0, 10.0, -1, &mut locs);
        let chunk_id = locs[0].chunk_id;

        let cfg = DuplicatorConfig {
            index_dir: dir.path().join("index"),
            chunk_dir: dir.path().join("chunks"),
            fields: vec!["id".into(), "ra".into(), "decl".into()],
            htm_level: level,
            overlap_deg: 0.02,
            num_stripes: 6,
            num_sub_stripes_per_stripe: 3,
            chunk_ids: vec![chunk_id],
            num_threads: 3,
            ..DuplicatorConfig::default()
        };
        let dup = Duplicator::new(&cfg).unwrap();
        let index = dup.run().unwrap();

        let chunk_lines = read_lines(&cfg.chunk_dir.join(format!("chunk_{}.csv", chunk_id)));
        assert!(!chunk_lines.is_empty());
        assert_eq!(index.chunk(chunk_id).num_records[0], chunk_lines.len() as u64);

        // every output record carries the chunk id, a sub-chunk id that
        // chunker.locate reproduces, and a remapped unique primary key
        let mut seen_keys = std::collections::HashSet::new();
        for line in &chunk_lines {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 5);
            let key: i64 = fields[0].parse().unwrap();
            let ra: f64 = fields[1].parse().unwrap();
            let dec: f64 = fields[2].parse().unwrap();
            let out_chunk: i32 = fields[3].parse().unwrap();
            let out_sub: i32 = fields[4].parse().unwrap();
            assert_eq!(out_chunk, chunk_id);
            assert!(seen_keys.insert(key), "duplicate key {}", key);
            let mut locs = Vec::new();
            chunker.locate(ra, dec, chunk_id, &mut locs);
            assert!(
                locs.iter()
                    .any(|l| l.kind == LocationKind::Chunk && l.sub_chunk_id == out_sub),
                "no CHUNK location for {}", line
            );
        }

        // the self-overlap output is a record-wise subset of the
        // full-overlap output
        let self_lines = read_lines(&cfg.chunk_dir.join(format!("chunk_{}_self.csv", chunk_id)));
        let full_lines = read_lines(&cfg.chunk_dir.join(format!("chunk_{}_full.csv", chunk_id)));
        let mut full_count = std::collections::HashMap::new();
        for l in &full_lines {
            *full_count.entry(l.clone()).or_insert(0u32) += 1;
        }
        for l in &self_lines {
            let c = full_count.get_mut(l).expect("self-overlap record missing from full overlap");
            assert!(*c > 0);
            *c -= 1;
        }
        assert_eq!(
            index.chunk(chunk_id).num_records[1] as usize,
            self_lines.len()
        );
        assert_eq!(
            index.chunk(chunk_id).num_records[1] as usize
                + index.chunk(chunk_id).num_records[2] as usize,
            full_lines.len()
        );

        // destination keys are reversible: high half identifies a trixel
        // of the configured level
        for key in &seen_keys {
            let h = (key >> 32) as u32;
            assert_eq!(crate::geom::htm::htm_level(h), level);
        }
    }

    #[test]
    fn test_mismatched_level_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        build_index(dir.path(), 2);
        let cfg = DuplicatorConfig {
            index_dir: dir.path().join("index"),
            chunk_dir: dir.path().join("chunks"),
            fields: vec!["id".into(), "ra".into(), "decl".into()],
            htm_level: 3,
            ..DuplicatorConfig::default()
        };
        assert!(Duplicator::new(&cfg).is_err());
    }
}
