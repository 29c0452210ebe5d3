pub mod importer;
pub mod technicals;
pub mod universe;

pub use importer::{
    import_corporate_actions_file, import_fundamentals_file, import_ohlcv_file,
    import_ratings_file, query_fundamentals_as_of, ImportResult,
};
pub use technicals::compute_sma_features;
pub use universe::resolve_universe;
