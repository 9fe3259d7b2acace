/// Fixed rank of every layout: user shapes are padded on the left with 1s
/// until they have exactly this many dims.
pub const MAX_RANK: usize = 8;

/// Upper bound on the operand count of a single graph operation.
pub const MAX_INPUTS: usize = 4;

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Unique identifier for a registered storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageId(pub u64);

/// Identifies a bucket of storages sharing one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId(pub u64);

/// Identifies an active recording scope in the storage registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecorderId(pub u64);
