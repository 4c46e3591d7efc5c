//! Content-addressed buckets and the leveled bucket list.
//!
//! Ledger state deltas are stored in immutable, content-addressed buckets.
//! The [`BucketList`] arranges them into levels of geometrically increasing
//! age; merging two buckets keeps the newest version of each entry. Merges
//! into deeper levels run as background futures and are forced to
//! completion before their output hash is observed.

mod bucket;
mod bucket_list;
mod error;
mod store;

pub use bucket::{Bucket, BucketMeta};
pub use bucket_list::{BucketLevelSnapshot, BucketList, FutureBucket, FutureBucketSnapshot, BUCKET_LIST_LEVELS};
pub use error::BucketError;
pub use store::BucketStore;

pub type Result<T> = std::result::Result<T, BucketError>;
