pub mod dedupe;
pub mod detectors;
pub mod features;
pub mod normalize;
pub mod pipeline;
pub mod pricing;
pub mod score;

pub use dedupe::dedupe_offers;
pub use features::{trend_30d, PriceStats};
pub use normalize::normalize;
pub use pipeline::{persist_and_score, Pipeline, ScoreContext};
pub use pricing::compute_final_price;
pub use score::{compute_score, discount_pct};
