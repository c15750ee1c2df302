//! Compute-node glue for the single-process DriftKV shell: [`LtcNode`]
//! wires the memtable, the lookup index, log replication, remote flush and
//! remote compaction over an in-process fabric.

mod node;

pub use node::LtcNode;
