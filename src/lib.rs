pub mod core;
pub mod geom;
pub mod csv;
pub mod io;
pub mod index;
pub mod map;
pub mod dup;
pub mod mapreduce;
pub mod partition;
pub mod replica;

/*
┌──────────────────────────────────────────────────────────────────────────┐
│                         SKYPART ARCHITECTURE                             │
└──────────────────────────────────────────────────────────────────────────┘

┌──────────────────────── INDEXER / DUPLICATOR ────────────────────────────┐
│                                                                          │
│  split_inputs ──▶ InputBlock (read / parse / htm / sort)                 │
│                        │  sorted records + PopulationMap counts          │
│                        ▼                                                 │
│                   Merger (k-way, scratch spill, mmap final pass)         │
│                        │  data.csv + ids.bin + map.bin                   │
│                        ▼                                                 │
│  Duplicator ── map_to_non_empty ──▶ PosMapper / KeyMapper                │
│       │              (Mulvey surjection over non-empty trixels)          │
│       └─▶ Chunker.locate ──▶ OutputBlock heap merge                      │
│               │                   │                                      │
│               ▼                   ▼                                      │
│        ChunkLocation     chunk_C.csv / _self.csv / _full.csv             │
│        (CHUNK / SELF_OVERLAP / FULL_OVERLAP)  +  ChunkIndex              │
│                                                                          │
│  mapreduce::run_job ──▶ partition (chunker fan-out)                      │
│       silos + phase barriers └──▶ htm_index (per-trixel files)           │
└──────────────────────────────────────────────────────────────────────────┘

┌──────────────────────── REPLICATION CONTROL PLANE ───────────────────────┐
│                                                                          │
│  Controller ── registry: id → RequestHandle                              │
│       │   one event-loop thread; typed factories validate + start       │
│       ▼                                                                  │
│  request::drive ── connect → send → recv → analyze → [poll] → finish     │
│       │   retry on transport errors, expire / cancel via select          │
│       ▼  [u32 LE length][bincode body] frames                            │
│  WorkerServer ── accept loop, per-connection RPC loop                    │
│       ▼                                                                  │
│  WorkerProcessor ── new (priority heap) / in-progress / finished         │
│       │   thread pool; cooperative IS_CANCELLING between increments      │
│       ▼                                                                  │
│  WorkerRequest.execute ──▶ ReplicaStore (database, chunk) → ReplicaInfo  │
│                                                                          │
│  Service machine: RUNNING ↔ SUSPEND_IN_PROGRESS → SUSPENDED              │
└──────────────────────────────────────────────────────────────────────────┘
*/
