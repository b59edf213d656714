pub mod trakt;
pub mod traits;
