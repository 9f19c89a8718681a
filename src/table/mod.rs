pub mod set;
pub mod sorted;
pub mod write_ahead;

pub use set::{MergedRows, TableSet};
pub use sorted::{SortedTable, SortedTableIter, TableWriter};
pub use write_ahead::WriteAheadBuffer;
