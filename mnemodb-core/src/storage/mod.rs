pub mod persistence;

pub use persistence::{CategorySection, MetadataDocument, METADATA_FILE};
