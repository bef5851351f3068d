use crate::core::error::{Error, ErrorKind, Result};
use crate::core::hash::mulvey_hash;
use crate::geom::sphere::{SphericalBox, clamp_dec, clamp_ra, max_alpha, reduce_ra, segments};

/// How a record relates to the chunk it is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocationKind {
    /// Not an overlap location.
    Chunk = 0,
    /// Overlap location whose source position lies in the same chunk.
    /// Every self-overlap location is also a full-overlap location.
    SelfOverlap = 1,
    /// Overlap location fed from a neighboring chunk.
    FullOverlap = 2,
}

pub const NUM_LOCATION_KINDS: usize = 3;

impl LocationKind {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A chunk location for a position. The ordering groups records by
/// chunk, then sub-chunk, then location kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkLocation {
    pub chunk_id: i32,
    pub sub_chunk_id: i32,
    pub kind: LocationKind,
}

/// Assigns points to partitions by breaking the sphere into fixed height
/// declination stripes, each split into a stripe-dependent number of RA
/// chunks, then into sub-stripes split into sub-chunks. The number of
/// (sub-)chunks per (sub-)stripe varies to limit polar distortion.
pub struct Chunker {
    overlap: f64,
    num_stripes: i32,
    num_sub_stripes_per_stripe: i32,
    sub_stripe_height: f64,
    max_sub_chunks_per_chunk: i32,
    /// Chunks per stripe, indexed by stripe.
    num_chunks_per_stripe: Vec<i32>,
    /// Sub-chunks per chunk, indexed by sub-stripe.
    num_sub_chunks_per_chunk: Vec<i32>,
    /// Sub-chunk width (in RA), indexed by sub-stripe.
    sub_chunk_width: Vec<f64>,
    /// Maximum half-width (in RA) of a circle of radius `overlap` centered
    /// inside the sub-stripe, indexed by sub-stripe.
    alpha: Vec<f64>,
}

impl Chunker {
    pub fn new(overlap: f64, num_stripes: i32, num_sub_stripes_per_stripe: i32) -> Result<Self> {
        if !(0.0..=10.0).contains(&overlap) {
            return Err(Error::new(
                ErrorKind::Config,
                "overlap must lie in range [0, 10] deg".to_string(),
            ));
        }
        if num_stripes < 1 || num_sub_stripes_per_stripe < 1 {
            return Err(Error::new(
                ErrorKind::Config,
                "stripe counts must be positive".to_string(),
            ));
        }
        let stripe_height = 180.0 / num_stripes as f64;
        let sub_stripe_height = stripe_height / num_sub_stripes_per_stripe as f64;
        if overlap > sub_stripe_height {
            return Err(Error::new(
                ErrorKind::Config,
                "overlap exceeds the sub-stripe height".to_string(),
            ));
        }
        let total_sub_stripes = num_stripes * num_sub_stripes_per_stripe;
        let mut num_chunks_per_stripe = Vec::with_capacity(num_stripes as usize);
        for stripe in 0..num_stripes {
            let dec_min = stripe as f64 * stripe_height - 90.0;
            let dec_max = clamp_dec(dec_min + stripe_height);
            num_chunks_per_stripe.push(segments(dec_min, dec_max, stripe_height));
        }
        let mut num_sub_chunks_per_chunk = Vec::with_capacity(total_sub_stripes as usize);
        let mut sub_chunk_width = Vec::with_capacity(total_sub_stripes as usize);
        let mut alpha = Vec::with_capacity(total_sub_stripes as usize);
        let mut max_scpc = 1;
        for ss in 0..total_sub_stripes {
            let dec_min = ss as f64 * sub_stripe_height - 90.0;
            let dec_max = clamp_dec(dec_min + sub_stripe_height);
            let nc = num_chunks_per_stripe[(ss / num_sub_stripes_per_stripe) as usize];
            let nsc = segments(dec_min, dec_max, sub_stripe_height).max(nc);
            let scpc = (nsc + nc - 1) / nc;
            max_scpc = max_scpc.max(scpc);
            num_sub_chunks_per_chunk.push(scpc);
            sub_chunk_width.push(360.0 / (scpc as i64 * nc as i64) as f64);
            let worst_dec = dec_min.abs().max(dec_max.abs());
            alpha.push(max_alpha(overlap, worst_dec)?);
        }
        Ok(Chunker {
            overlap,
            num_stripes,
            num_sub_stripes_per_stripe,
            sub_stripe_height,
            max_sub_chunks_per_chunk: max_scpc,
            num_chunks_per_stripe,
            num_sub_chunks_per_chunk,
            sub_chunk_width,
            alpha,
        })
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }

    fn stripe_of(&self, chunk_id: i32) -> i32 {
        chunk_id / (2 * self.num_stripes)
    }

    fn chunk_id(&self, stripe: i32, chunk: i32) -> i32 {
        stripe * 2 * self.num_stripes + chunk
    }

    fn sub_chunk_id(&self, stripe: i32, sub_stripe: i32, chunk: i32, sub_chunk: i32) -> i32 {
        (sub_stripe - stripe * self.num_sub_stripes_per_stripe) * self.max_sub_chunks_per_chunk
            + (sub_chunk - chunk * self.num_sub_chunks_per_chunk[sub_stripe as usize])
    }

    /// Bounding box of the given chunk.
    pub fn chunk_bounds(&self, chunk_id: i32) -> Result<SphericalBox> {
        let stripe = self.stripe_of(chunk_id);
        if stripe < 0 || stripe >= self.num_stripes {
            return Err(Error::new(
                ErrorKind::Config,
                format!("invalid chunk id: {}", chunk_id),
            ));
        }
        let chunk = chunk_id - stripe * 2 * self.num_stripes;
        let nc = self.num_chunks_per_stripe[stripe as usize];
        if chunk < 0 || chunk >= nc {
            return Err(Error::new(
                ErrorKind::Config,
                format!("invalid chunk id: {}", chunk_id),
            ));
        }
        let width = 360.0 / nc as f64;
        let height = 180.0 / self.num_stripes as f64;
        let dec_min = stripe as f64 * height - 90.0;
        Ok(SphericalBox::new(
            chunk as f64 * width,
            clamp_ra((chunk + 1) as f64 * width),
            dec_min,
            clamp_dec(dec_min + height),
        ))
    }

    /// Bounding box of the given sub-chunk.
    pub fn sub_chunk_bounds(&self, chunk_id: i32, sub_chunk_id: i32) -> Result<SphericalBox> {
        let stripe = self.stripe_of(chunk_id);
        if stripe < 0 || stripe >= self.num_stripes || sub_chunk_id < 0 {
            return Err(Error::new(
                ErrorKind::Config,
                format!("invalid location: ({}, {})", chunk_id, sub_chunk_id),
            ));
        }
        let chunk = chunk_id - stripe * 2 * self.num_stripes;
        let ss = stripe * self.num_sub_stripes_per_stripe
            + sub_chunk_id / self.max_sub_chunks_per_chunk;
        if ss >= self.num_stripes * self.num_sub_stripes_per_stripe {
            return Err(Error::new(
                ErrorKind::Config,
                format!("invalid location: ({}, {})", chunk_id, sub_chunk_id),
            ));
        }
        let scpc = self.num_sub_chunks_per_chunk[ss as usize];
        let local = sub_chunk_id % self.max_sub_chunks_per_chunk;
        if local >= scpc {
            return Err(Error::new(
                ErrorKind::Config,
                format!("invalid location: ({}, {})", chunk_id, sub_chunk_id),
            ));
        }
        let sc = chunk * scpc + local;
        let width = self.sub_chunk_width[ss as usize];
        let dec_min = ss as f64 * self.sub_stripe_height - 90.0;
        Ok(SphericalBox::new(
            sc as f64 * width,
            clamp_ra((sc + 1) as f64 * width),
            dec_min,
            clamp_dec(dec_min + self.sub_stripe_height),
        ))
    }

    /// All locations of the given position. A negative `chunk_filter`
    /// returns every location; otherwise only locations in the given chunk
    /// are returned.
    pub fn locate(&self, ra: f64, dec: f64, chunk_filter: i32, out: &mut Vec<ChunkLocation>) {
        let ra = reduce_ra(ra);
        let dec = clamp_dec(dec);
        let total_ss = self.num_stripes * self.num_sub_stripes_per_stripe;
        let ss = (((dec + 90.0) / self.sub_stripe_height) as i32).clamp(0, total_ss - 1);
        let stripe = ss / self.num_sub_stripes_per_stripe;
        let nc = self.num_chunks_per_stripe[stripe as usize];
        let scpc = self.num_sub_chunks_per_chunk[ss as usize];
        let total_sc = nc * scpc;
        let width = self.sub_chunk_width[ss as usize];
        let sc = ((ra / width) as i32).clamp(0, total_sc - 1);
        let chunk = sc / scpc;
        let home_chunk_id = self.chunk_id(stripe, chunk);
        if chunk_filter < 0 || chunk_filter == home_chunk_id {
            out.push(ChunkLocation {
                chunk_id: home_chunk_id,
                sub_chunk_id: self.sub_chunk_id(stripe, ss, chunk, sc),
                kind: LocationKind::Chunk,
            });
        }
        if self.overlap <= 0.0 {
            return;
        }
        // left and right neighbors within the same sub-stripe
        let alpha = self.alpha[ss as usize];
        if total_sc > 1 {
            let mut left = None;
            if ra - sc as f64 * width < alpha {
                let n = (sc + total_sc - 1) % total_sc;
                if n != sc {
                    left = Some(n);
                    self.push_overlap(ss, n, home_chunk_id, chunk_filter, out);
                }
            }
            if clamp_ra((sc + 1) as f64 * width) - ra < alpha {
                let n = (sc + 1) % total_sc;
                if n != sc && left != Some(n) {
                    self.push_overlap(ss, n, home_chunk_id, chunk_filter, out);
                }
            }
        }
        // sub-chunks in the adjacent sub-stripes
        let ss_dec_min = ss as f64 * self.sub_stripe_height - 90.0;
        let ss_dec_max = ss_dec_min + self.sub_stripe_height;
        if ss > 0 && dec - ss_dec_min < self.overlap {
            self.up_down_overlap(ra, home_chunk_id, chunk_filter, ss - 1, out);
        }
        if ss < total_ss - 1 && ss_dec_max - dec < self.overlap {
            self.up_down_overlap(ra, home_chunk_id, chunk_filter, ss + 1, out);
        }
    }

    /// Append overlap locations for every sub-chunk of the target
    /// sub-stripe whose RA extent lies within alpha of `ra`.
    fn up_down_overlap(
        &self,
        ra: f64,
        home_chunk_id: i32,
        chunk_filter: i32,
        target_ss: i32,
        out: &mut Vec<ChunkLocation>,
    ) {
        let stripe = target_ss / self.num_sub_stripes_per_stripe;
        let nc = self.num_chunks_per_stripe[stripe as usize];
        let scpc = self.num_sub_chunks_per_chunk[target_ss as usize];
        let total_sc = nc * scpc;
        let width = self.sub_chunk_width[target_ss as usize];
        let alpha = self.alpha[target_ss as usize];
        if 2.0 * alpha + width >= 360.0 {
            // clamped at the poles: every sub-chunk is within range
            for sc in 0..total_sc {
                self.push_overlap(target_ss, sc, home_chunk_id, chunk_filter, out);
            }
            return;
        }
        let lo = ((ra - alpha) / width).floor() as i64;
        let hi = ((ra + alpha) / width).floor() as i64;
        if hi - lo + 1 >= total_sc as i64 {
            for sc in 0..total_sc {
                self.push_overlap(target_ss, sc, home_chunk_id, chunk_filter, out);
            }
            return;
        }
        for i in lo..=hi {
            let sc = (i.rem_euclid(total_sc as i64)) as i32;
            self.push_overlap(target_ss, sc, home_chunk_id, chunk_filter, out);
        }
    }

    fn push_overlap(
        &self,
        ss: i32,
        sc: i32,
        home_chunk_id: i32,
        chunk_filter: i32,
        out: &mut Vec<ChunkLocation>,
    ) {
        let stripe = ss / self.num_sub_stripes_per_stripe;
        let scpc = self.num_sub_chunks_per_chunk[ss as usize];
        let chunk = sc / scpc;
        let chunk_id = self.chunk_id(stripe, chunk);
        if chunk_filter >= 0 && chunk_filter != chunk_id {
            return;
        }
        let kind = if chunk_id == home_chunk_id {
            LocationKind::SelfOverlap
        } else {
            LocationKind::FullOverlap
        };
        out.push(ChunkLocation {
            chunk_id,
            sub_chunk_id: self.sub_chunk_id(stripe, ss, chunk, sc),
            kind,
        });
    }

    /// Ids of all chunks overlapping the given region and assigned to the
    /// given node. When `hash_chunks` is set, chunk C belongs to node
    /// `mulvey_hash(C) % num_nodes`; otherwise chunks are dealt out
    /// round-robin. The region does not affect node assignment.
    pub fn chunks_for(
        &self,
        region: &SphericalBox,
        node: u32,
        num_nodes: u32,
        hash_chunks: bool,
    ) -> Result<Vec<i32>> {
        if num_nodes == 0 || node >= num_nodes {
            return Err(Error::new(
                ErrorKind::Config,
                format!("node {} is not in range [0, {})", node, num_nodes),
            ));
        }
        let mut ids = Vec::new();
        let mut rr = 0u32;
        for stripe in 0..self.num_stripes {
            for chunk in 0..self.num_chunks_per_stripe[stripe as usize] {
                let id = self.chunk_id(stripe, chunk);
                let target = if hash_chunks {
                    mulvey_hash(id as u32) % num_nodes
                } else {
                    rr % num_nodes
                };
                rr += 1;
                if target != node {
                    continue;
                }
                if region.intersects(&self.chunk_bounds(id)?) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}
