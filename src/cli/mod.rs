pub mod activate;
pub mod consolidate;
pub mod reset;
pub mod stats;

pub use activate::activate;
pub use consolidate::consolidate;
pub use reset::reset;
pub use stats::stats;
