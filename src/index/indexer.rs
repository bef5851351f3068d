use std::time::Instant;

use parking_lot::Mutex;

use crate::core::config::IndexerConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::csv::parse::{field_index, valid_delimiter};
use crate::index::block::{BlockOptions, InputBlock, split_inputs};
use crate::index::merger::Merger;
use crate::map::population::PopulationMap;

fn resolve(config: &IndexerConfig, name: &str) -> Result<usize> {
    field_index(&config.fields, name).ok_or_else(|| {
        Error::new(
            ErrorKind::Config,
            format!("unknown field name: {}", name),
        )
    })
}

fn block_options(config: &IndexerConfig) -> Result<BlockOptions> {
    if config.fields.is_empty() {
        return Err(Error::new(ErrorKind::Config, "no field names given".to_string()));
    }
    if !valid_delimiter(config.delimiter) {
        return Err(Error::new(ErrorKind::Config, "illegal delimiter".to_string()));
    }
    Ok(BlockOptions {
        delimiter: config.delimiter,
        num_fields: config.fields.len(),
        pk_field: resolve(config, &config.primary_key)?,
        ra_field: resolve(config, &config.partition_ra)?,
        dec_field: resolve(config, &config.partition_dec)?,
        htm_level: config.htm_level,
    })
}

/// Build the HTM-sorted duplication index for the configured inputs:
/// `data.csv` (input lines in HTM order), `ids.bin` (their primary keys,
/// packed little-endian, in the same order) and `map.bin` (the population
/// map). Returns the queryable population map.
pub fn index(config: &IndexerConfig) -> Result<PopulationMap> {
    if !(1..=100).contains(&config.num_threads) {
        return Err(Error::new(
            ErrorKind::Config,
            "number of threads must lie in [1, 100]".to_string(),
        ));
    }
    let opts = block_options(config)?;
    std::fs::create_dir_all(&config.index_dir)?;
    std::fs::create_dir_all(&config.scratch_dir)?;

    let t = Instant::now();
    let blocks = split_inputs(&config.input_files, config.block_size)?;
    if blocks.is_empty() {
        return Err(Error::new(ErrorKind::Config, "no input data".to_string()));
    }
    log::info!("split inputs into {} blocks in {:.3}s", blocks.len(), t.elapsed().as_secs_f64());

    let merger = Merger::new(
        config.index_dir.join("data.csv"),
        config.index_dir.join("ids.bin"),
        config.scratch_dir.join("scratch.bin"),
        config.block_size,
        config.merge_arity,
        blocks.len(),
    )?;
    let map = PopulationMap::new(config.htm_level)?;

    let t = Instant::now();
    let queue = Mutex::new(blocks);
    let failed: Mutex<Option<Error>> = Mutex::new(None);
    let worker = || {
        loop {
            if failed.lock().is_some() {
                break;
            }
            let Some(mut block) = queue.lock().pop() else {
                break;
            };
            let run = || -> Result<()> {
                block.read()?;
                block.process(&opts, &map)?;
                merger.add(block)
            };
            if let Err(e) = run() {
                let mut slot = failed.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
                break;
            }
        }
    };
    std::thread::scope(|s| {
        for _ in 1..config.num_threads {
            s.spawn(&worker);
        }
        // the calling thread participates in processing
        worker();
    });
    if let Some(e) = failed.into_inner() {
        return Err(e);
    }
    log::info!("first pass finished in {:.3}s", t.elapsed().as_secs_f64());

    let t = Instant::now();
    merger.finish()?;
    log::info!("merging finished in {:.3}s", t.elapsed().as_secs_f64());

    let mut map = map;
    map.make_queryable()?;
    map.write(config.index_dir.join("map.bin"))?;
    Ok(map)
}
