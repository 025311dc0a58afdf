// Record processing stages between fetching and merging:
// normalize -> window filter -> classify -> deduplicate.

pub mod classify;
pub mod dedup;
pub mod normalize;
