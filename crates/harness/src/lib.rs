mod library;

pub use library::{TestLibrary, text_values};
