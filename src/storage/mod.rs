mod page;

// Reexport so we can refer it from other mod
// as crate::storage::PageId instead of
// crate::storage::page::PageId.
pub use self::page::PageId;
