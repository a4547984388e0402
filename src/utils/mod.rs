mod format;
mod plurals;

pub use format::{format_bytes, format_commas, format_duration, format_epoch};
pub use plurals::pluralize;
