mod preroll;
mod segment;

pub use preroll::PrerollBuffer;
pub use segment::{now_ms, Segment};
