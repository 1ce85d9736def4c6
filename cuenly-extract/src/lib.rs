//! Extraction-pipeline components: the native SIFEN XML parser (C7), the
//! LLM-vision fallback extractor (C8), and its result cache (C13).

pub mod cache;
pub mod mapper;
pub mod vision;
pub mod xml_parser;

pub use cache::ResultCache;
pub use mapper::map_to_header;
pub use vision::VisionExtractor;
