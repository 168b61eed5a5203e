pub mod adapters;
pub mod render;
pub mod robots;
pub mod selectors;

pub use adapters::{AdapterRegistry, Cookie, SiteAdapter};
pub use render::{FetchOptions, FetchResult, RenderPool};
pub use selectors::{SelectorRegistry, SelectorSpec};
