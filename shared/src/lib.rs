pub mod events;
pub mod rules;
pub mod types;

// Re-export commonly used types
pub use events::{FeedFrame, FeedKind};
pub use rules::{
    default_increment_tiers, increment, min_next_bid, parse_image_filename, premium, premium_rate,
    round_cents,
};
pub use types::*;
