//! Image preparation before removal

mod preparer;

pub use preparer::{ImagePreparer, PreparedImage};
