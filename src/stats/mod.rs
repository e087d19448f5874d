pub mod light_stats;
pub mod moving_sum;
pub mod sum;

pub use light_stats::LightStats;
pub use moving_sum::MovingSum;
pub use sum::{Sum, Sumer};
