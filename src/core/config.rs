use std::collections::BTreeMap;
use std::path::PathBuf;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{escaped_transform, is_not},
    character::complete::{char, multispace1, none_of, satisfy},
    combinator::{map, opt, recognize, value},
    multi::{many0, many1},
    sequence::delimited,
};

use crate::core::error::{Error, Result};

/// Options for the HTM indexer job.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub input_files: Vec<PathBuf>,
    /// Input field names, in column order.
    pub fields: Vec<String>,
    /// Names of the partitioning (ra, dec) fields.
    pub partition_ra: String,
    pub partition_dec: String,
    /// Name of the primary key field.
    pub primary_key: String,
    pub delimiter: u8,
    pub htm_level: i32,
    /// Input block size in bytes.
    pub block_size: usize,
    /// Merge fan-in k.
    pub merge_arity: usize,
    pub num_threads: usize,
    pub index_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            input_files: Vec::new(),
            fields: Vec::new(),
            partition_ra: "ra".to_string(),
            partition_dec: "decl".to_string(),
            primary_key: "id".to_string(),
            delimiter: b',',
            htm_level: 8,
            block_size: 16 * 1024 * 1024,
            merge_arity: 16,
            num_threads: num_cpus::get().clamp(1, 100),
            index_dir: PathBuf::from("./index"),
            scratch_dir: PathBuf::from("./scratch"),
        }
    }
}

/// Options for the duplicator job.
#[derive(Debug, Clone)]
pub struct DuplicatorConfig {
    /// Index directory holding data.csv, ids.bin and map.bin.
    pub index_dir: PathBuf,
    pub chunk_dir: PathBuf,
    pub fields: Vec<String>,
    pub partition_ra: String,
    pub partition_dec: String,
    pub primary_key: String,
    pub delimiter: u8,
    pub htm_level: i32,
    pub overlap_deg: f64,
    pub num_stripes: i32,
    pub num_sub_stripes_per_stripe: i32,
    /// Output field carrying the chunk id; appended when absent.
    pub chunk_id_field: Option<String>,
    /// Output field carrying the sub-chunk id; appended when absent.
    pub sub_chunk_id_field: Option<String>,
    pub secondary_sort_field: Option<String>,
    /// Ancillary (ra, dec) field pairs remapped together with the
    /// partitioning position.
    pub positions: Vec<(String, String)>,
    /// Foreign key field names and the index directories they resolve in.
    pub foreign_keys: Vec<(String, PathBuf)>,
    /// Duplication region as (ra_min, ra_max, dec_min, dec_max) degrees.
    pub dup_region: Option<(f64, f64, f64, f64)>,
    /// Explicit chunk list; derived from dup_region when empty.
    pub chunk_ids: Vec<i32>,
    pub node: u32,
    pub num_nodes: u32,
    pub hash_chunks: bool,
    pub block_size: usize,
    pub num_threads: usize,
}

impl Default for DuplicatorConfig {
    fn default() -> Self {
        DuplicatorConfig {
            index_dir: PathBuf::from("./index"),
            chunk_dir: PathBuf::from("./chunks"),
            fields: Vec::new(),
            partition_ra: "ra".to_string(),
            partition_dec: "decl".to_string(),
            primary_key: "id".to_string(),
            delimiter: b',',
            htm_level: 8,
            overlap_deg: 0.01667,
            num_stripes: 18,
            num_sub_stripes_per_stripe: 100,
            chunk_id_field: Some("chunkId".to_string()),
            sub_chunk_id_field: Some("subChunkId".to_string()),
            secondary_sort_field: None,
            positions: Vec::new(),
            foreign_keys: Vec::new(),
            dup_region: None,
            chunk_ids: Vec::new(),
            node: 0,
            num_nodes: 1,
            hash_chunks: true,
            block_size: 16 * 1024 * 1024,
            num_threads: num_cpus::get().clamp(1, 100),
        }
    }
}

/// Options for the map-reduce chunk partitioner.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub fields: Vec<String>,
    pub partition_ra: String,
    pub partition_dec: String,
    pub delimiter: u8,
    pub chunk_id_field: Option<String>,
    pub sub_chunk_id_field: String,
    pub overlap_deg: f64,
    pub num_stripes: i32,
    pub num_sub_stripes_per_stripe: i32,
    pub out_dir: PathBuf,
    pub num_nodes: u32,
    /// Per-worker silo memory threshold in bytes.
    pub pool_size: usize,
    pub block_size: usize,
    pub num_workers: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        PartitionConfig {
            fields: Vec::new(),
            partition_ra: "ra".to_string(),
            partition_dec: "decl".to_string(),
            delimiter: b',',
            chunk_id_field: Some("chunkId".to_string()),
            sub_chunk_id_field: "subChunkId".to_string(),
            overlap_deg: 0.01667,
            num_stripes: 18,
            num_sub_stripes_per_stripe: 100,
            out_dir: PathBuf::from("./chunks"),
            num_nodes: 1,
            pool_size: 1024 * 1024 * 1024,
            block_size: 4 * 1024 * 1024,
            num_workers: num_cpus::get().clamp(1, 256),
        }
    }
}

/// Options for the map-reduce HTM index builder.
#[derive(Debug, Clone)]
pub struct HtmIndexConfig {
    pub fields: Vec<String>,
    pub delimiter: u8,
    /// Name of the record id field.
    pub id_field: String,
    pub partition_ra: String,
    pub partition_dec: String,
    pub htm_level: i32,
    pub out_dir: PathBuf,
    pub num_nodes: u32,
    pub pool_size: usize,
    pub block_size: usize,
    pub num_workers: usize,
}

impl Default for HtmIndexConfig {
    fn default() -> Self {
        HtmIndexConfig {
            fields: Vec::new(),
            delimiter: b',',
            id_field: "id".to_string(),
            partition_ra: "ra".to_string(),
            partition_dec: "decl".to_string(),
            htm_level: 8,
            out_dir: PathBuf::from("./index"),
            num_nodes: 1,
            pool_size: 1024 * 1024 * 1024,
            block_size: 4 * 1024 * 1024,
            num_workers: num_cpus::get().clamp(1, 256),
        }
    }
}

/// Options shared by the replication controller and worker services.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Worker name to "host:port" service addresses.
    pub workers: BTreeMap<String, String>,
    /// Fixed backoff applied after transport errors, and the interval of
    /// the periodic status probe.
    pub retry_timeout_secs: u64,
    /// Total lifetime limit per controller request; 0 disables expiration.
    pub controller_request_timeout_secs: u64,
    pub worker_num_processing_threads: usize,
    pub worker_num_connections_limit: u32,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            workers: BTreeMap::new(),
            retry_timeout_secs: 1,
            controller_request_timeout_secs: 0,
            worker_num_processing_threads: 2,
            worker_num_connections_limit: 16,
        }
    }
}

impl ReplicaConfig {
    pub fn worker_address(&self, worker: &str) -> Result<&str> {
        self.workers
            .get(worker)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::config(format!("unknown worker: {}", worker)))
    }
}

// ---------------------------------------------------------------------------
// Config file parsing.
//
// Line-structured `key: value` pairs with `{...}` groups flattened to dotted
// keys, JSON-like quoting and escapes, and `#` comments to end of line.
// ---------------------------------------------------------------------------

fn spacing(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), (char('#'), opt(is_not("\n")))),
        ))),
    )
    .parse(input)
}

fn key(input: &str) -> IResult<&str, &str> {
    recognize(many1(satisfy(|c: char| {
        c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
    })))
    .parse(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                none_of("\\\""),
                '\\',
                alt((
                    value('\\', char('\\')),
                    value('"', char('"')),
                    value('\n', char('n')),
                    value('\t', char('t')),
                )),
            )),
            |v: Option<String>| v.unwrap_or_default(),
        ),
        char('"'),
    )
    .parse(input)
}

fn bare(input: &str) -> IResult<&str, String> {
    map(is_not("\n#}"), |s: &str| s.trim().to_string()).parse(input)
}

fn entries<'a>(
    mut input: &'a str,
    prefix: &str,
    out: &mut BTreeMap<String, String>,
) -> std::result::Result<&'a str, Error> {
    let bad = |i: &str| Error::config(format!("config syntax error near: {:.40}", i));
    loop {
        let (rest, ()) = spacing(input).map_err(|_| bad(input))?;
        input = rest;
        if input.is_empty() || input.starts_with('}') {
            return Ok(input);
        }
        let (rest, k) = key(input).map_err(|_| bad(input))?;
        let (rest, ()) = spacing(rest).map_err(|_| bad(rest))?;
        let rest = rest
            .strip_prefix(':')
            .ok_or_else(|| Error::config(format!("expected ':' after key {}", k)))?;
        let (rest, ()) = spacing(rest).map_err(|_| bad(rest))?;
        let full = if prefix.is_empty() {
            k.to_string()
        } else {
            format!("{}.{}", prefix, k)
        };
        if let Some(rest) = rest.strip_prefix('{') {
            let rest = entries(rest, &full, out)?;
            input = rest
                .strip_prefix('}')
                .ok_or_else(|| Error::config(format!("unterminated group {}", full)))?;
        } else if let Ok((rest, v)) = quoted(rest) {
            out.insert(full, v);
            input = rest;
        } else {
            let (rest, v) = bare(rest).map_err(|_| bad(rest))?;
            out.insert(full, v);
            input = rest;
        }
    }
}

/// Parse the optional config file format into flattened dotted keys.
pub fn parse_config_file(text: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let rest = entries(text, "", &mut out)?;
    if !rest.is_empty() {
        return Err(Error::config(format!("unbalanced '}}' near: {:.40}", rest)));
    }
    Ok(out)
}
